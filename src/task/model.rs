//! 统一任务模型
//!
//! 所有任务共用一个 Task 结构，kind 决定执行策略（ToolCall 走计划驱动，
//! Generic 走目标驱动）。Plan 一旦创建只增不换：修订只能追加步骤或
//! 标记失败，已完成的步骤永不改写。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// 任务类型：决定由哪个执行器处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// 工具调用任务，计划驱动执行
    ToolCall,
    /// 通用任务，目标驱动执行（兼容模式）
    Generic,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 计划步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Done,
    Failed,
}

/// 执行计划中的单个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    pub description: String,
    pub expected_tool: Option<String>,
    pub status: StepStatus,
    /// 工具调用的原始结果（执行后填充）
    pub result: Option<Value>,
}

impl PlanStep {
    pub fn new(index: usize, description: impl Into<String>, expected_tool: Option<String>) -> Self {
        Self {
            index,
            description: description.into(),
            expected_tool,
            status: StepStatus::Pending,
            result: None,
        }
    }
}

/// 任务执行计划
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    pub revision_count: u32,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            steps,
            revision_count: 0,
        }
    }

    /// 第一个未完成的步骤（Pending 或 Failed，失败步骤会被重试）
    pub fn first_open_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Done)
    }

    /// 所有步骤都已完成
    pub fn is_completed(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Done)
    }

    /// 修订：只追加新步骤，不动已有步骤
    pub fn append_steps(&mut self, descriptions: Vec<(String, Option<String>)>) {
        let base = self.steps.len();
        for (offset, (description, expected_tool)) in descriptions.into_iter().enumerate() {
            self.steps
                .push(PlanStep::new(base + offset, description, expected_tool));
        }
        self.revision_count += 1;
    }

    /// 最后一个完成步骤的结果（作为任务的最终输出）
    pub fn final_result(&self) -> Option<&Value> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status == StepStatus::Done)
            .find_map(|s| s.result.as_ref())
    }
}

/// 一次工具调用的历史记录（Router 只消费最近 3 条）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub step: usize,
    pub tool: String,
    pub server_id: String,
    pub success: bool,
    pub error: Option<String>,
}

/// 统一任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// 当前执行目标（目标驱动模式下会随步骤改写）
    pub goal: String,
    /// 用户原始意图，创建后不变
    pub user_intent: String,
    /// 环境快照（设备清单、上游结果等），供 Router 取参
    pub context: Value,
    pub plan: Option<Plan>,
    pub history: Vec<ExecutionRecord>,
    pub result: Option<Value>,
    pub last_error: Option<String>,
    /// 终态 Failed 时记录失败发生在哪一步
    pub failed_step: Option<usize>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 目标驱动模式已执行的轮数
    pub goal_step: usize,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(kind: TaskKind, goal: impl Into<String>) -> Self {
        let goal = goal.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            status: TaskStatus::Pending,
            user_intent: goal.clone(),
            goal,
            context: json!({}),
            plan: None,
            history: Vec::new(),
            result: None,
            last_error: None,
            failed_step: None,
            retry_count: 0,
            max_retries: 2,
            goal_step: 0,
            timeout_secs: 60,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
        self.touch();
    }

    pub fn record_call(&mut self, record: ExecutionRecord) {
        if !record.success {
            self.last_error = record.error.clone();
        }
        self.history.push(record);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_open_step_includes_failed() {
        let mut plan = Plan::new(vec![
            PlanStep::new(0, "查询设备", None),
            PlanStep::new(1, "开灯", Some("turn_on".to_string())),
            PlanStep::new(2, "确认状态", None),
        ]);
        plan.steps[0].status = StepStatus::Done;
        plan.steps[1].status = StepStatus::Failed;

        // 失败的步骤排在待执行之前，会被再次选中
        assert_eq!(plan.first_open_step(), Some(1));
        assert!(!plan.is_completed());

        plan.steps[1].status = StepStatus::Done;
        plan.steps[2].status = StepStatus::Done;
        assert!(plan.is_completed());
        assert_eq!(plan.first_open_step(), None);
    }

    #[test]
    fn test_empty_plan_is_not_completed() {
        assert!(!Plan::default().is_completed());
    }

    #[test]
    fn test_revision_appends_only() {
        let mut plan = Plan::new(vec![PlanStep::new(0, "a", None)]);
        plan.steps[0].status = StepStatus::Done;

        plan.append_steps(vec![("b".to_string(), None), ("c".to_string(), None)]);
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.revision_count, 1);
        assert_eq!(plan.steps[0].status, StepStatus::Done);
        assert_eq!(plan.steps[1].index, 1);
        assert_eq!(plan.steps[2].index, 2);
    }

    #[test]
    fn test_retry_bound() {
        let mut task = Task::new(TaskKind::ToolCall, "开灯").with_max_retries(2);
        assert!(task.can_retry());
        task.increment_retry();
        task.increment_retry();
        assert!(!task.can_retry());
    }

    #[test]
    fn test_final_result_takes_last_done_step() {
        let mut plan = Plan::new(vec![PlanStep::new(0, "a", None), PlanStep::new(1, "b", None)]);
        plan.steps[0].status = StepStatus::Done;
        plan.steps[0].result = Some(json!({"value": 1}));
        plan.steps[1].status = StepStatus::Done;
        plan.steps[1].result = Some(json!({"value": 2}));

        assert_eq!(plan.final_result().unwrap()["value"], 2);
    }
}
