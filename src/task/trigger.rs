//! 周期性任务触发器
//!
//! 按固定间隔用模板生成任务入队，典型用途是巡检类后台任务。
//! 触发器只负责生产，消费与并发控制仍由 TaskLoop / Scheduler 承担。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::task::model::{Task, TaskKind};
use crate::task::queue::TaskQueue;

/// 周期任务模板
#[derive(Debug, Clone)]
pub struct TaskTemplate {
    pub kind: TaskKind,
    pub goal: String,
    pub context: Value,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl TaskTemplate {
    pub fn new(kind: TaskKind, goal: impl Into<String>) -> Self {
        Self {
            kind,
            goal: goal.into(),
            context: Value::Object(Default::default()),
            max_retries: 2,
            timeout_secs: 60,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    fn instantiate(&self) -> Task {
        Task::new(self.kind, self.goal.clone())
            .with_context(self.context.clone())
            .with_max_retries(self.max_retries)
            .with_timeout(self.timeout_secs)
    }
}

/// 周期触发器
pub struct PeriodicTrigger {
    queue: Arc<TaskQueue>,
    interval: Duration,
    template: TaskTemplate,
}

impl PeriodicTrigger {
    pub fn new(queue: Arc<TaskQueue>, interval: Duration, template: TaskTemplate) -> Self {
        Self {
            queue,
            interval,
            template,
        }
    }

    /// 启动后台触发循环，返回其 JoinHandle
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "periodic trigger started");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval 的第一个 tick 立即返回，和原始语义一致（启动即触发一次）
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("periodic trigger stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let id = self.queue.enqueue(self.template.instantiate()).await;
                        debug!(task_id = %id, "periodic task created");
                    }
                }
            }
        })
    }
}
