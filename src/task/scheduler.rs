//! 任务调度器：并发准入与执行派发
//!
//! Semaphore 控制同时运行的任务数；schedule 在拿不到许可时直接拒绝
//! （返回 false），由 TaskLoop 把任务放回队列等下一轮。每次派发都包
//! 一层整体超时，超时任务直接判 Failed，许可随协程结束归还。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, warn};

use crate::task::executor::TaskExecutor;
use crate::task::model::{Task, TaskKind, TaskStatus};
use crate::task::queue::TaskQueue;

/// 并发调度器
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    executors: HashMap<TaskKind, Arc<dyn TaskExecutor>>,
    queue: Arc<TaskQueue>,
}

impl Scheduler {
    pub fn new(max_concurrent: usize, queue: Arc<TaskQueue>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            executors: HashMap::new(),
            queue,
        }
    }

    /// 注册某种任务类型的执行器
    pub fn register(&mut self, kind: TaskKind, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(kind, executor);
    }

    /// 当前是否还有空闲执行位
    pub fn can_schedule(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// 派发一个已出队（Running）的任务
    ///
    /// 返回 false 表示没有执行位或没有对应执行器，任务需要放回队列。
    pub async fn schedule(&self, handle: Arc<RwLock<Task>>) -> bool {
        let (task_id, kind, timeout_secs) = {
            let task = handle.read().await;
            (task.id.clone(), task.kind, task.timeout_secs)
        };

        let Some(executor) = self.executors.get(&kind).cloned() else {
            warn!(task_id = %task_id, kind = ?kind, "no executor registered for task kind");
            self.queue
                .update_status(&task_id, TaskStatus::Failed, "no executor for task kind")
                .await;
            return false;
        };

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            debug!(task_id = %task_id, "no execution slot available");
            return false;
        };

        let queue = self.queue.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let timeout = Duration::from_secs(timeout_secs);
            match tokio::time::timeout(timeout, executor.execute(handle)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(task_id = %task_id, error = %e, "executor returned error");
                    queue
                        .update_status(&task_id, TaskStatus::Failed, "executor error")
                        .await;
                }
                Err(_) => {
                    warn!(task_id = %task_id, timeout_secs, "task execution timed out");
                    queue
                        .update_status(&task_id, TaskStatus::Failed, "execution timeout")
                        .await;
                }
            }
        });
        true
    }
}
