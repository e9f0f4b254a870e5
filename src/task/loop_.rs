//! 任务循环：事件驱动的消费泵
//!
//! 主要靠入队信号唤醒，固定间隔只作为安全网（信号丢失或重试场景兜底）。
//! 每次唤醒尽量排空队列：有空闲执行位且能出队就持续派发，
//! 许可耗尽时把刚出队的任务放回原位等下一轮。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TaskSection;
use crate::task::model::TaskStatus;
use crate::task::queue::TaskQueue;
use crate::task::scheduler::Scheduler;

/// 队列消费循环
pub struct TaskLoop {
    queue: Arc<TaskQueue>,
    scheduler: Arc<Scheduler>,
    loop_interval: Duration,
    cleanup_interval: Duration,
}

impl TaskLoop {
    pub fn new(queue: Arc<TaskQueue>, scheduler: Arc<Scheduler>, cfg: &TaskSection) -> Self {
        Self {
            queue,
            scheduler,
            loop_interval: Duration::from_secs(cfg.loop_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(cfg.cleanup_interval_secs.max(1)),
        }
    }

    /// 运行直到取消令牌触发
    pub async fn run(&self, cancel: CancellationToken) {
        info!("task loop started");
        let mut safety_net = tokio::time::interval(self.loop_interval);
        safety_net.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cleanup = tokio::time::interval(self.cleanup_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("task loop stopped");
                    return;
                }
                _ = self.queue.wait_for_signal() => {
                    self.drain().await;
                }
                _ = safety_net.tick() => {
                    self.drain().await;
                }
                _ = cleanup.tick() => {
                    let removed = self.queue.remove_completed().await;
                    if removed > 0 {
                        debug!(removed, "cleanup sweep");
                    }
                }
            }
        }
    }

    /// 把当前能派发的任务全部派发出去
    async fn drain(&self) {
        while self.scheduler.can_schedule() {
            let Some(handle) = self.queue.dequeue_eligible().await else {
                return;
            };
            if !self.scheduler.schedule(handle.clone()).await {
                let (id, status) = {
                    let task = handle.read().await;
                    (task.id.clone(), task.status)
                };
                // 许可竞争失败：放回队列并结束本轮；
                // 其他拒绝（如缺执行器）任务已是终态，继续派发后面的
                if status == TaskStatus::Running {
                    self.queue.requeue(&id).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::sync::RwLock;

    use crate::core::AgentError;
    use crate::task::executor::TaskExecutor;
    use crate::task::model::{Task, TaskKind};

    struct CompletingExecutor {
        queue: Arc<TaskQueue>,
    }

    #[async_trait]
    impl TaskExecutor for CompletingExecutor {
        async fn execute(&self, handle: Arc<RwLock<Task>>) -> Result<(), AgentError> {
            let id = handle.read().await.id.clone();
            self.queue
                .update_status(&id, TaskStatus::Completed, "test executor")
                .await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_loop_consumes_enqueued_tasks() {
        let queue = Arc::new(TaskQueue::new());
        let mut scheduler = Scheduler::new(2, queue.clone());
        scheduler.register(
            TaskKind::ToolCall,
            Arc::new(CompletingExecutor {
                queue: queue.clone(),
            }),
        );

        let task_loop = TaskLoop::new(queue.clone(), Arc::new(scheduler), &TaskSection::default());
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { task_loop.run(loop_cancel).await });

        let id1 = queue.enqueue(Task::new(TaskKind::ToolCall, "a")).await;
        let id2 = queue.enqueue(Task::new(TaskKind::ToolCall, "b")).await;

        // 完成信号代替轮询等待
        let rx1 = queue.subscribe_completion(&id1).await.unwrap();
        let rx2 = queue.subscribe_completion(&id2).await.unwrap();
        assert_eq!(rx1.await.unwrap(), TaskStatus::Completed);
        assert_eq!(rx2.await.unwrap(), TaskStatus::Completed);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_terminal_refusal_does_not_stall_drain() {
        let queue = Arc::new(TaskQueue::new());
        let mut scheduler = Scheduler::new(2, queue.clone());
        // 只注册 ToolCall；Generic 任务会因缺执行器直接进入 Failed
        scheduler.register(
            TaskKind::ToolCall,
            Arc::new(CompletingExecutor {
                queue: queue.clone(),
            }),
        );

        // 安全网间隔拉长，确保派发只能靠入队信号驱动
        let cfg = TaskSection {
            loop_interval_secs: 3600,
            cleanup_interval_secs: 3600,
            ..Default::default()
        };
        let task_loop = TaskLoop::new(queue.clone(), Arc::new(scheduler), &cfg);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move { task_loop.run(loop_cancel).await });

        let orphan = queue.enqueue(Task::new(TaskKind::Generic, "无执行器")).await;
        let id = queue.enqueue(Task::new(TaskKind::ToolCall, "正常任务")).await;

        // 排在终态拒绝后面的任务仍然在同一轮被派发
        let rx = queue.subscribe_completion(&id).await.unwrap();
        let status = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("task behind a failed one was never scheduled")
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let t = queue.get_by_id(&orphan).await.unwrap();
        assert_eq!(t.read().await.status, TaskStatus::Failed);

        cancel.cancel();
        handle.await.unwrap();
    }
}
