//! 任务执行器：计划驱动与目标驱动两种策略
//!
//! 共同约定：单次工具调用失败不直接判任务失败，先记录再重新入队重试，
//! 重试次数耗尽才进入 Failed（携带最后错误与失败步骤号）。
//! 执行器每次只推进一步，随后把任务放回队列，队列始终是在途工作的
//! 唯一事实来源。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::TaskSection;
use crate::core::AgentError;
use crate::llm::{LlmClient, Message};
use crate::mcp::connection::ToolOutcome;
use crate::mcp::index::ToolIndex;
use crate::mcp::pool::ConnectionPool;
use crate::mcp::router::{HistoryEntry, McpRouter, RouterContext};
use crate::task::model::{ExecutionRecord, Plan, PlanStep, StepStatus, Task, TaskStatus};
use crate::task::queue::TaskQueue;

/// 工具调用的抽象边界，便于在测试中替换连接池
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, server_id: &str, tool: &str, arguments: Value) -> ToolOutcome;
}

#[async_trait]
impl ToolInvoker for ConnectionPool {
    async fn invoke(&self, server_id: &str, tool: &str, arguments: Value) -> ToolOutcome {
        self.call_tool(server_id, tool, arguments).await
    }
}

/// 任务执行器：消费一个任务，推进一步，结果写回任务与队列
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: Arc<RwLock<Task>>) -> Result<(), AgentError>;
}

/// 错误模式分类，决定重试时的下一步目标与计划修订触发
fn classify_error(error: &str) -> &'static str {
    let e = error.to_lowercase();
    if ["not found", "does not exist", "unknown", "no such"]
        .iter()
        .any(|k| e.contains(k))
    {
        "resource_not_found"
    } else if ["invalid", "incorrect", "malformed", "bad request"]
        .iter()
        .any(|k| e.contains(k))
    {
        "invalid_parameter"
    } else if ["permission", "forbidden", "unauthorized", "access denied"]
        .iter()
        .any(|k| e.contains(k))
    {
        "permission_denied"
    } else if ["not support", "unsupported", "unavailable"]
        .iter()
        .any(|k| e.contains(k))
    {
        "tool_unsupported"
    } else if ["timeout", "network", "connection"].iter().any(|k| e.contains(k)) {
        "network_issue"
    } else {
        "unknown_error"
    }
}

/// 工具名粗分类：查询类 / 操作类
fn classify_tool(tool_name: &str) -> &'static str {
    const QUERY: &[&str] = &[
        "Get", "List", "Query", "Find", "Search", "Fetch", "Describe", "Show",
    ];
    const ACTION: &[&str] = &[
        "Set", "Create", "Update", "Delete", "Turn", "Start", "Stop", "Execute", "Send", "Run",
        "Call", "Invoke",
    ];
    if QUERY.iter().any(|k| tool_name.contains(k)) {
        "query"
    } else if ACTION.iter().any(|k| tool_name.contains(k)) {
        "action"
    } else {
        "hybrid"
    }
}

/// 从 LLM 输出中剥掉 markdown 围栏并解析 {"steps": [...]}
fn parse_plan_steps(text: &str) -> Vec<(String, Option<String>)> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|s| s.trim_end_matches("```"))
        .unwrap_or(trimmed);

    let Ok(value) = serde_json::from_str::<Value>(body.trim()) else {
        return Vec::new();
    };
    let Some(steps) = value.get("steps").and_then(Value::as_array) else {
        return Vec::new();
    };

    steps
        .iter()
        .filter_map(|s| {
            let description = s.get("description").and_then(Value::as_str)?.to_string();
            let expected_tool = s
                .get("expected_tool")
                .and_then(Value::as_str)
                .map(String::from);
            Some((description, expected_tool))
        })
        .collect()
}

fn history_for_router(task: &Task) -> Vec<HistoryEntry> {
    task.history
        .iter()
        .map(|r| HistoryEntry {
            tool: r.tool.clone(),
            success: r.success,
        })
        .collect()
}

fn outcome_error(outcome: &ToolOutcome) -> String {
    outcome
        .error
        .clone()
        .unwrap_or_else(|| "unknown error".to_string())
}

// ---------------------------------------------------------------------------
// 计划驱动执行器
// ---------------------------------------------------------------------------

/// 计划驱动执行器：生成计划，逐步执行，失败时修订或重试
pub struct PlanExecutor {
    router: Arc<McpRouter>,
    invoker: Arc<dyn ToolInvoker>,
    llm: Arc<dyn LlmClient>,
    index: Arc<ToolIndex>,
    queue: Arc<TaskQueue>,
    limits: TaskSection,
}

impl PlanExecutor {
    pub fn new(
        router: Arc<McpRouter>,
        invoker: Arc<dyn ToolInvoker>,
        llm: Arc<dyn LlmClient>,
        index: Arc<ToolIndex>,
        queue: Arc<TaskQueue>,
        limits: TaskSection,
    ) -> Self {
        Self {
            router,
            invoker,
            llm,
            index,
            queue,
            limits,
        }
    }

    /// 调 LLM 生成计划；后端不可用时退化为单步计划（步骤即目标本身）
    async fn generate_plan(&self, goal: &str) -> Plan {
        let tools = self.index.all_tools().await;
        let tools_summary: String = tools
            .iter()
            .take(20)
            .map(|t| format!("- {}: {}\n", t.tool_name, t.description))
            .collect();

        let prompt = format!(
            "你是一个任务规划助手。根据用户目标和可用工具，生成一个详细的执行计划。\n\n\
             **用户目标**：\n{goal}\n\n\
             **可用工具**：\n{tools_summary}\n\
             **计划要求**：\n\
             1. 生成 3-8 个执行步骤\n\
             2. 步骤应按逻辑顺序排列（如：先查询后操作）\n\
             3. 每个步骤包含 description（自然语言描述）与 expected_tool（预期工具名，可为 null）\n\n\
             **输出格式**（必须为 JSON）：\n\
             {{\"steps\": [{{\"description\": \"步骤描述\", \"expected_tool\": \"工具名称或null\"}}]}}\n\n\
             请生成计划："
        );

        let steps = match self
            .llm
            .complete(&[Message::user(prompt)], 0.3, 1024)
            .await
        {
            Ok(text) => parse_plan_steps(&text),
            Err(e) => {
                warn!(error = %e, "plan generation failed, falling back to single step");
                Vec::new()
            }
        };

        let mut steps: Vec<PlanStep> = steps
            .into_iter()
            .enumerate()
            .map(|(i, (description, expected_tool))| PlanStep::new(i, description, expected_tool))
            .collect();

        if steps.is_empty() {
            steps.push(PlanStep::new(0, goal, None));
        }
        if steps.len() > self.limits.max_plan_steps {
            warn!(
                steps = steps.len(),
                max = self.limits.max_plan_steps,
                "generated plan too long, truncating"
            );
            steps.truncate(self.limits.max_plan_steps);
        }

        info!(steps = steps.len(), "plan generated");
        Plan::new(steps)
    }

    /// 修订计划：只追加步骤，已有步骤不动
    async fn revise_plan(&self, handle: &Arc<RwLock<Task>>, reason: &str) {
        let (user_intent, done_summary) = {
            let task = handle.read().await;
            let Some(plan) = task.plan.as_ref() else {
                return;
            };
            let summary: String = plan
                .steps
                .iter()
                .filter(|s| s.status == StepStatus::Done)
                .map(|s| format!("- {}\n", s.description))
                .collect();
            (task.user_intent.clone(), summary)
        };

        let prompt = format!(
            "你是一个任务规划助手。原有计划需要修订，请生成新的执行步骤。\n\n\
             **用户原始意图**：\n{user_intent}\n\n\
             **已完成的步骤**：\n{}\n\
             **修订原因**：\n{reason}\n\n\
             **要求**：生成 1-5 个剩余步骤，解决修订原因中提到的问题。\n\n\
             **输出格式**（必须为 JSON）：\n\
             {{\"steps\": [{{\"description\": \"步骤描述\", \"expected_tool\": \"工具名称或null\"}}]}}",
            if done_summary.is_empty() {
                "无\n"
            } else {
                &done_summary
            }
        );

        let new_steps = match self
            .llm
            .complete(&[Message::user(prompt)], 0.3, 1024)
            .await
        {
            Ok(text) => parse_plan_steps(&text),
            Err(e) => {
                warn!(error = %e, "plan revision failed, keeping current plan");
                return;
            }
        };

        if new_steps.is_empty() {
            return;
        }

        let mut task = handle.write().await;
        if let Some(plan) = task.plan.as_mut() {
            plan.append_steps(new_steps);
            info!(
                revision = plan.revision_count,
                reason, "plan revised with appended steps"
            );
        }
    }

    async fn complete_task(&self, handle: &Arc<RwLock<Task>>) {
        let task_id = {
            let mut task = handle.write().await;
            let (total, revisions, final_result) = match task.plan.as_ref() {
                Some(plan) => (
                    plan.steps.len(),
                    plan.revision_count,
                    plan.final_result().cloned(),
                ),
                None => (0, 0, None),
            };
            task.result = Some(json!({
                "success": true,
                "plan_completed": true,
                "total_steps": total,
                "revision_count": revisions,
                "result": final_result,
            }));
            task.id.clone()
        };
        self.queue
            .update_status(&task_id, TaskStatus::Completed, "plan completed")
            .await;
    }

    /// 步骤失败后的统一出路：按需修订计划，然后重试或判死
    async fn handle_step_failure(&self, handle: &Arc<RwLock<Task>>, step_idx: usize, error: &str) {
        let revision_wanted = classify_error(error) == "resource_not_found";
        let can_revise = {
            let task = handle.read().await;
            task.plan
                .as_ref()
                .map(|p| p.revision_count < self.limits.max_plan_revisions)
                .unwrap_or(false)
        };
        if revision_wanted && can_revise {
            self.revise_plan(handle, &format!("Step failed: {}", error)).await;
        }

        let (task_id, retry) = {
            let mut task = handle.write().await;
            task.increment_retry();
            task.last_error = Some(error.to_string());
            if task.can_retry() {
                (task.id.clone(), true)
            } else {
                task.failed_step = Some(step_idx);
                task.result = Some(json!({ "success": false, "error": error }));
                (task.id.clone(), false)
            }
        };

        if retry {
            debug!(task_id = %task_id, step = step_idx, "step failed, requeueing for retry");
            self.queue.requeue(&task_id).await;
        } else {
            self.queue
                .update_status(&task_id, TaskStatus::Failed, "retry exhausted")
                .await;
        }
    }
}

#[async_trait]
impl TaskExecutor for PlanExecutor {
    async fn execute(&self, handle: Arc<RwLock<Task>>) -> Result<(), AgentError> {
        // 取消检查：步骤之间响应取消，已在途的调用不回滚
        if handle.read().await.status == TaskStatus::Cancelled {
            return Ok(());
        }

        let need_plan = handle.read().await.plan.is_none();
        if need_plan {
            let goal = handle.read().await.goal.clone();
            let plan = self.generate_plan(&goal).await;
            handle.write().await.plan = Some(plan);
        }

        // 取当前步骤；计划已全部完成则收尾
        let (task_id, step_idx, step_goal, context, history) = {
            let task = handle.read().await;
            let Some(plan) = task.plan.as_ref() else {
                return Ok(());
            };
            match plan.first_open_step() {
                None => {
                    drop(task);
                    self.complete_task(&handle).await;
                    return Ok(());
                }
                Some(idx) => (
                    task.id.clone(),
                    idx,
                    plan.steps[idx].description.clone(),
                    task.context.clone(),
                    history_for_router(&task),
                ),
            }
        };

        debug!(task_id = %task_id, step = step_idx, goal = %step_goal, "executing plan step");

        let ctx = RouterContext {
            goal: step_goal,
            current_step: Some(step_idx as u32),
            history,
            environment: context,
        };
        let decision = self.router.route(&ctx).await;

        let (Some(server_id), Some(tool)) = (decision.server_id.clone(), decision.tool.clone())
        else {
            // 无工具可选：0.3 表示该步骤无需动作，视为完成；0.0 是决策失败
            if decision.confidence > 0.0 {
                let done = {
                    let mut task = handle.write().await;
                    if let Some(plan) = task.plan.as_mut() {
                        plan.steps[step_idx].status = StepStatus::Done;
                        plan.steps[step_idx].result =
                            Some(json!({ "success": true, "reasoning": decision.reasoning }));
                        plan.is_completed()
                    } else {
                        true
                    }
                };
                if done {
                    self.complete_task(&handle).await;
                } else {
                    self.queue.requeue(&task_id).await;
                }
            } else {
                self.handle_step_failure(&handle, step_idx, &decision.reasoning)
                    .await;
            }
            return Ok(());
        };

        let outcome = self
            .invoker
            .invoke(&server_id, &tool, decision.arguments.clone())
            .await;

        let plan_done = {
            let mut task = handle.write().await;
            task.record_call(ExecutionRecord {
                step: step_idx,
                tool: tool.clone(),
                server_id: server_id.clone(),
                success: outcome.success,
                error: outcome.error.clone(),
            });
            if let Some(plan) = task.plan.as_mut() {
                let step = &mut plan.steps[step_idx];
                step.result = serde_json::to_value(&outcome).ok();
                step.status = if outcome.success {
                    StepStatus::Done
                } else {
                    StepStatus::Failed
                };
            }
            task.plan.as_ref().map(|p| p.is_completed()).unwrap_or(false)
        };

        if outcome.success {
            info!(task_id = %task_id, step = step_idx, tool = %tool, "plan step completed");
            if plan_done {
                self.complete_task(&handle).await;
            } else {
                // 后续步骤作为独立任务重新排队，每一步都可单独重试
                self.queue.requeue(&task_id).await;
            }
        } else {
            let error = outcome_error(&outcome);
            warn!(task_id = %task_id, step = step_idx, tool = %tool, error = %error, "plan step failed");
            self.handle_step_failure(&handle, step_idx, &error).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 目标驱动执行器（兼容模式）
// ---------------------------------------------------------------------------

/// 目标驱动执行器：单步决策 + 启发式完成判断 + 动态改写目标
pub struct GoalExecutor {
    router: Arc<McpRouter>,
    invoker: Arc<dyn ToolInvoker>,
    queue: Arc<TaskQueue>,
    limits: TaskSection,
}

impl GoalExecutor {
    pub fn new(
        router: Arc<McpRouter>,
        invoker: Arc<dyn ToolInvoker>,
        queue: Arc<TaskQueue>,
        limits: TaskSection,
    ) -> Self {
        Self {
            router,
            invoker,
            queue,
            limits,
        }
    }

    /// 根据上一轮结果合成下一轮目标
    fn revise_goal(user_intent: &str, tool: &str, outcome: &ToolOutcome) -> String {
        let (summary, next) = if outcome.success {
            if classify_tool(tool) == "query" {
                (
                    format!("查询成功，已获取数据（{}）", tool),
                    "根据查询结果执行实际操作".to_string(),
                )
            } else {
                (
                    format!("操作成功（{}）", tool),
                    "继续执行后续操作（如有）".to_string(),
                )
            }
        } else {
            let error = outcome_error(outcome);
            let next = match classify_error(&error) {
                "resource_not_found" => "重新查询可用资源信息，然后使用正确的标识符重试",
                "invalid_parameter" => "分析参数要求，调整参数后重试",
                "tool_unsupported" => "选择功能相近的替代工具重试",
                "permission_denied" => "权限不足，尝试其他途径或提示用户",
                "network_issue" => "等待后重试",
                _ => "分析失败原因并调整执行策略",
            };
            (format!("失败 - {}", error), next.to_string())
        };

        format!(
            "当前用户需求：{}\n上一轮任务执行结果：{}\n本次执行目标：{}",
            user_intent, summary, next
        )
    }

    async fn fail_or_retry(&self, handle: &Arc<RwLock<Task>>, error: &str, new_goal: Option<String>) {
        let (task_id, retry) = {
            let mut task = handle.write().await;
            task.increment_retry();
            task.last_error = Some(error.to_string());
            if task.can_retry() {
                if let Some(goal) = new_goal {
                    task.goal = goal;
                }
                (task.id.clone(), true)
            } else {
                task.failed_step = Some(task.goal_step);
                task.result = Some(json!({ "success": false, "error": error }));
                (task.id.clone(), false)
            }
        };
        if retry {
            self.queue.requeue(&task_id).await;
        } else {
            self.queue
                .update_status(&task_id, TaskStatus::Failed, "retry exhausted")
                .await;
        }
    }
}

#[async_trait]
impl TaskExecutor for GoalExecutor {
    async fn execute(&self, handle: Arc<RwLock<Task>>) -> Result<(), AgentError> {
        if handle.read().await.status == TaskStatus::Cancelled {
            return Ok(());
        }

        let (task_id, goal, user_intent, goal_step, context, history) = {
            let task = handle.read().await;
            (
                task.id.clone(),
                task.goal.clone(),
                task.user_intent.clone(),
                task.goal_step,
                task.context.clone(),
                history_for_router(&task),
            )
        };

        // 步数护栏：到达上限视为无果而终，但不算执行失败
        if goal_step >= self.limits.max_goal_steps {
            warn!(task_id = %task_id, steps = goal_step, "max goal steps reached");
            handle.write().await.result =
                Some(json!({ "success": false, "error": "max steps reached" }));
            self.queue
                .update_status(&task_id, TaskStatus::Completed, "max steps reached")
                .await;
            return Ok(());
        }

        let ctx = RouterContext {
            goal,
            current_step: Some(goal_step as u32),
            history,
            environment: context,
        };
        let decision = self.router.route(&ctx).await;

        let (Some(server_id), Some(tool)) = (decision.server_id.clone(), decision.tool.clone())
        else {
            if decision.confidence > 0.0 {
                // 明确的"无需动作"即启发式完成
                info!(task_id = %task_id, "goal satisfied, no further action");
                handle.write().await.result =
                    Some(json!({ "success": true, "reasoning": decision.reasoning }));
                self.queue
                    .update_status(&task_id, TaskStatus::Completed, "no more tools needed")
                    .await;
            } else {
                self.fail_or_retry(&handle, &decision.reasoning, None).await;
            }
            return Ok(());
        };

        let outcome = self
            .invoker
            .invoke(&server_id, &tool, decision.arguments.clone())
            .await;

        {
            let mut task = handle.write().await;
            task.record_call(ExecutionRecord {
                step: goal_step,
                tool: tool.clone(),
                server_id: server_id.clone(),
                success: outcome.success,
                error: outcome.error.clone(),
            });
        }

        if outcome.success {
            if classify_tool(&tool) == "query" {
                // 查询结果沉淀到上下文，改写目标后继续
                let new_goal = Self::revise_goal(&user_intent, &tool, &outcome);
                {
                    let mut task = handle.write().await;
                    if let (Value::Object(map), Some(result)) =
                        (&mut task.context, outcome.result.clone())
                    {
                        map.insert(format!("{}_result", tool), result);
                    }
                    task.goal = new_goal;
                    task.goal_step += 1;
                }
                debug!(task_id = %task_id, tool = %tool, "query step done, continuing");
                self.queue.requeue(&task_id).await;
            } else {
                info!(task_id = %task_id, tool = %tool, "goal task completed");
                handle.write().await.result = Some(json!({
                    "success": true,
                    "executed_steps": goal_step + 1,
                    "tool_result": outcome.result,
                }));
                self.queue
                    .update_status(&task_id, TaskStatus::Completed, "action completed")
                    .await;
            }
        } else {
            let error = outcome_error(&outcome);
            let new_goal = Self::revise_goal(&user_intent, &tool, &outcome);
            warn!(task_id = %task_id, tool = %tool, error = %error, "goal step failed");
            self.fail_or_retry(&handle, &error, Some(new_goal)).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) struct MockInvoker {
    outcomes: std::sync::Mutex<std::collections::VecDeque<ToolOutcome>>,
    pub calls: std::sync::Mutex<Vec<(String, String, Value)>>,
}

#[cfg(test)]
impl MockInvoker {
    pub fn new(outcomes: Vec<ToolOutcome>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes.into()),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ToolInvoker for MockInvoker {
    async fn invoke(&self, server_id: &str, tool: &str, arguments: Value) -> ToolOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((server_id.to_string(), tool.to_string(), arguments));
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ToolOutcome::fail("mock outcomes exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ToolSelection};
    use crate::mcp::connection::ToolDescriptor;
    use crate::task::model::TaskKind;

    fn limits() -> TaskSection {
        TaskSection::default()
    }

    async fn test_router(mock: Arc<MockLlmClient>, tools: &[&str]) -> (Arc<McpRouter>, Arc<ToolIndex>) {
        let dir = tempfile::tempdir().unwrap();
        let index = Arc::new(ToolIndex::new(
            dir.path().join("cache.json"),
            0,
            Vec::new(),
        ));
        let catalogues = vec![(
            "hass".to_string(),
            tools
                .iter()
                .map(|t| ToolDescriptor {
                    name: t.to_string(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                })
                .collect(),
        )];
        index.apply_catalogues(&catalogues).await;
        (Arc::new(McpRouter::new(mock, index.clone())), index)
    }

    fn push_call(mock: &MockLlmClient, tool: &str) {
        mock.push_selection(ToolSelection::Call {
            name: tool.to_string(),
            arguments: json!({}),
        });
    }

    fn plan_of(descriptions: &[&str]) -> Plan {
        Plan::new(
            descriptions
                .iter()
                .enumerate()
                .map(|(i, d)| PlanStep::new(i, *d, None))
                .collect(),
        )
    }

    /// 3 步计划：第 1 步成功，第 2 步两次失败后任务 Failed，failed_step=1
    #[tokio::test]
    async fn test_plan_advancement_with_retry_exhaustion() {
        let mock = Arc::new(MockLlmClient::new());
        for _ in 0..3 {
            push_call(&mock, "HassTurnOn");
        }
        let (router, index) = test_router(mock, &["HassTurnOn"]).await;

        let invoker = Arc::new(MockInvoker::new(vec![
            ToolOutcome::ok(json!({"content": "ok"})),
            ToolOutcome::fail("device offline"),
            ToolOutcome::fail("device offline"),
        ]));
        let queue = Arc::new(TaskQueue::new());
        let executor = PlanExecutor::new(
            router,
            invoker.clone(),
            Arc::new(MockLlmClient::new()),
            index,
            queue.clone(),
            limits(),
        );

        let mut task = Task::new(TaskKind::ToolCall, "开灯").with_max_retries(2);
        task.plan = Some(plan_of(&["查询设备", "打开客厅灯", "确认状态"]));
        let id = queue.enqueue(task).await;

        // 第一轮：步骤 0 成功，任务重新入队
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();
        {
            let t = queue.get_by_id(&id).await.unwrap();
            let t = t.read().await;
            assert_eq!(t.status, TaskStatus::Pending);
            assert_eq!(t.plan.as_ref().unwrap().steps[0].status, StepStatus::Done);
        }

        // 第二轮：步骤 1 失败，还能重试
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();
        {
            let t = queue.get_by_id(&id).await.unwrap();
            let t = t.read().await;
            assert_eq!(t.status, TaskStatus::Pending);
            assert_eq!(t.retry_count, 1);
            assert_eq!(t.plan.as_ref().unwrap().steps[1].status, StepStatus::Failed);
        }

        // 第三轮：步骤 1 再次失败，重试耗尽
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();
        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.failed_step, Some(1));
        assert_eq!(t.last_error.as_deref(), Some("device offline"));
    }

    #[tokio::test]
    async fn test_plan_completes_after_all_steps() {
        let mock = Arc::new(MockLlmClient::new());
        push_call(&mock, "HassTurnOn");
        push_call(&mock, "HassTurnOn");
        let (router, index) = test_router(mock, &["HassTurnOn"]).await;

        let invoker = Arc::new(MockInvoker::new(vec![
            ToolOutcome::ok(json!({"content": "a"})),
            ToolOutcome::ok(json!({"content": "b"})),
        ]));
        let queue = Arc::new(TaskQueue::new());
        let executor = PlanExecutor::new(
            router,
            invoker,
            Arc::new(MockLlmClient::new()),
            index,
            queue.clone(),
            limits(),
        );

        let mut task = Task::new(TaskKind::ToolCall, "两步任务");
        task.plan = Some(plan_of(&["第一步", "第二步"]));
        let id = queue.enqueue(task).await;

        for _ in 0..2 {
            let handle = queue.dequeue_eligible().await.unwrap();
            executor.execute(handle).await.unwrap();
        }

        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        assert_eq!(t.status, TaskStatus::Completed);
        let result = t.result.as_ref().unwrap();
        assert_eq!(result["plan_completed"], true);
        assert_eq!(result["total_steps"], 2);
    }

    #[tokio::test]
    async fn test_plan_generated_when_missing() {
        let router_mock = Arc::new(MockLlmClient::new());
        let (router, index) = test_router(router_mock, &["HassTurnOn"]).await;

        // 规划后端返回两步计划
        let planner = Arc::new(MockLlmClient::new());
        planner.push_completion(
            r#"{"steps": [{"description": "查询设备", "expected_tool": null}, {"description": "开灯", "expected_tool": "HassTurnOn"}]}"#,
        );

        let queue = Arc::new(TaskQueue::new());
        let executor = PlanExecutor::new(
            router,
            Arc::new(MockInvoker::new(vec![])),
            planner,
            index,
            queue.clone(),
            limits(),
        );

        let id = queue.enqueue(Task::new(TaskKind::ToolCall, "开灯")).await;
        let handle = queue.dequeue_eligible().await.unwrap();
        // 路由 mock 队列为空会让本步失败，但计划应已生成并挂到任务上
        executor.execute(handle).await.unwrap();

        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        let plan = t.plan.as_ref().unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[1].expected_tool.as_deref(), Some("HassTurnOn"));
    }

    #[tokio::test]
    async fn test_goal_executor_completes_on_action_success() {
        let mock = Arc::new(MockLlmClient::new());
        push_call(&mock, "HassTurnOn");
        let (router, _index) = test_router(mock, &["HassTurnOn"]).await;

        let invoker = Arc::new(MockInvoker::new(vec![ToolOutcome::ok(json!({"state": "on"}))]));
        let queue = Arc::new(TaskQueue::new());
        let executor = GoalExecutor::new(router, invoker, queue.clone(), limits());

        let id = queue.enqueue(Task::new(TaskKind::Generic, "打开客厅灯")).await;
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();

        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_ref().unwrap()["success"], true);
    }

    #[tokio::test]
    async fn test_goal_executor_continues_after_query() {
        let mock = Arc::new(MockLlmClient::new());
        push_call(&mock, "HassGetState");
        let (router, _index) = test_router(mock, &["HassGetState"]).await;

        let invoker = Arc::new(MockInvoker::new(vec![ToolOutcome::ok(
            json!({"content": "temperature 21"}),
        )]));
        let queue = Arc::new(TaskQueue::new());
        let executor = GoalExecutor::new(router, invoker, queue.clone(), limits());

        let id = queue
            .enqueue(Task::new(TaskKind::Generic, "查询温度并调节空调"))
            .await;
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();

        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        // 查询步骤完成后任务继续排队，结果沉淀进上下文，目标被改写
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.goal_step, 1);
        assert!(t.context.get("HassGetState_result").is_some());
        assert!(t.goal.contains("查询温度并调节空调"));
        assert_ne!(t.goal, t.user_intent);
    }

    #[tokio::test]
    async fn test_goal_executor_no_action_is_completion() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_selection(ToolSelection::Text("目标已完成".to_string()));
        let (router, _index) = test_router(mock, &["HassTurnOn"]).await;

        let queue = Arc::new(TaskQueue::new());
        let executor = GoalExecutor::new(
            router,
            Arc::new(MockInvoker::new(vec![])),
            queue.clone(),
            limits(),
        );

        let id = queue.enqueue(Task::new(TaskKind::Generic, "确认灯已打开")).await;
        let handle = queue.dequeue_eligible().await.unwrap();
        executor.execute(handle).await.unwrap();

        let t = queue.get_by_id(&id).await.unwrap();
        let t = t.read().await;
        assert_eq!(t.status, TaskStatus::Completed);
        assert_eq!(t.result.as_ref().unwrap()["reasoning"], "目标已完成");
    }

    #[test]
    fn test_classifiers() {
        assert_eq!(classify_tool("HassGetLiveContext"), "query");
        assert_eq!(classify_tool("HassTurnOn"), "action");
        assert_eq!(classify_tool("weather"), "hybrid");

        assert_eq!(classify_error("Entity not found"), "resource_not_found");
        assert_eq!(classify_error("Invalid entity id"), "invalid_parameter");
        assert_eq!(classify_error("connection reset"), "network_issue");
        assert_eq!(classify_error("boom"), "unknown_error");
    }

    #[test]
    fn test_parse_plan_steps_with_fences() {
        let text = "```json\n{\"steps\": [{\"description\": \"a\", \"expected_tool\": null}]}\n```";
        let steps = parse_plan_steps(text);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].0, "a");
        assert!(steps[0].1.is_none());

        assert!(parse_plan_steps("not json").is_empty());
    }
}
