//! 任务队列
//!
//! 任务的唯一属主：从创建到终态都存在队列里，执行器只持有借来的引用。
//! dequeue_eligible 按 FIFO 取下一个 Pending 任务并原子地转为 Running
//! （任务不出存储），避免两个执行器认领同一个任务。
//!
//! 两个信号通道：
//! - Notify：入队/重排时唤醒 TaskLoop，免去固定间隔轮询；
//! - oneshot：订阅某个任务的完成信号，写入终态时兑现，免去轮询等待。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tracing::{debug, info};

use crate::task::model::{Task, TaskStatus};

/// 队列统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct QueueInner {
    tasks: HashMap<String, Arc<RwLock<Task>>>,
    /// 入队顺序，决定 FIFO 出队次序
    order: Vec<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<TaskStatus>>>,
}

/// 统一任务队列
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 入队，返回任务 id 并唤醒 TaskLoop
    pub async fn enqueue(&self, task: Task) -> String {
        let id = task.id.clone();
        {
            let mut inner = self.inner.lock().await;
            debug!(task_id = %id, kind = ?task.kind, "task enqueued");
            inner.order.push(id.clone());
            inner.tasks.insert(id.clone(), Arc::new(RwLock::new(task)));
        }
        self.notify.notify_one();
        id
    }

    /// FIFO 取下一个 Pending 任务，原子转为 Running；任务留在存储中
    pub async fn dequeue_eligible(&self) -> Option<Arc<RwLock<Task>>> {
        let inner = self.inner.lock().await;
        for id in &inner.order {
            let Some(handle) = inner.tasks.get(id) else {
                continue;
            };
            let mut task = handle.write().await;
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Running;
                task.touch();
                debug!(task_id = %task.id, "task dequeued");
                return Some(handle.clone());
            }
        }
        None
    }

    pub async fn get_by_id(&self, task_id: &str) -> Option<Arc<RwLock<Task>>> {
        self.inner.lock().await.tasks.get(task_id).cloned()
    }

    /// 写入新状态；终态会兑现所有完成信号订阅
    ///
    /// 终态是不可逆的：已终结的任务拒绝任何再转移（如取消后执行器
    /// 仍尝试 requeue），返回 false。
    pub async fn update_status(&self, task_id: &str, status: TaskStatus, reason: &str) -> bool {
        let Some(handle) = self.get_by_id(task_id).await else {
            return false;
        };

        {
            let mut task = handle.write().await;
            if task.status.is_terminal() {
                debug!(
                    task_id = %task_id,
                    current = ?task.status,
                    attempted = ?status,
                    "transition from terminal state ignored"
                );
                return false;
            }
            let old = task.status;
            task.status = status;
            task.touch();
            info!(task_id = %task_id, from = ?old, to = ?status, reason, "task status transition");
        }

        if status.is_terminal() {
            let waiters = {
                let mut inner = self.inner.lock().await;
                inner.waiters.remove(task_id).unwrap_or_default()
            };
            for waiter in waiters {
                let _ = waiter.send(status);
            }
        }
        true
    }

    /// 调度被拒后把任务原样放回队列：状态回 Pending，计划与历史不动
    pub async fn requeue(&self, task_id: &str) -> bool {
        let ok = self
            .update_status(task_id, TaskStatus::Pending, "requeued")
            .await;
        if ok {
            self.notify.notify_one();
        }
        ok
    }

    /// 订阅任务完成信号；任务已是终态时立即兑现
    pub async fn subscribe_completion(
        &self,
        task_id: &str,
    ) -> Option<oneshot::Receiver<TaskStatus>> {
        let mut inner = self.inner.lock().await;
        let handle = inner.tasks.get(task_id)?.clone();
        let (tx, rx) = oneshot::channel();

        let status = handle.read().await.status;
        if status.is_terminal() {
            let _ = tx.send(status);
        } else {
            inner.waiters.entry(task_id.to_string()).or_default().push(tx);
        }
        Some(rx)
    }

    /// 取消任务；只有 Pending/Running 可取消
    pub async fn cancel(&self, task_id: &str) -> bool {
        let status = match self.get_by_id(task_id).await {
            Some(handle) => handle.read().await.status,
            None => return false,
        };
        if matches!(status, TaskStatus::Pending | TaskStatus::Running) {
            self.update_status(task_id, TaskStatus::Cancelled, "cancelled by caller")
                .await
        } else {
            false
        }
    }

    /// 清理所有终态任务，返回清理数量
    pub async fn remove_completed(&self) -> usize {
        let mut inner = self.inner.lock().await;

        let mut terminal = Vec::new();
        for (id, handle) in &inner.tasks {
            if handle.read().await.status.is_terminal() {
                terminal.push(id.clone());
            }
        }

        for id in &terminal {
            inner.tasks.remove(id);
            inner.waiters.remove(id);
        }
        inner.order.retain(|id| !terminal.contains(id));

        if !terminal.is_empty() {
            debug!(removed = terminal.len(), "terminal tasks removed");
        }
        terminal.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.statistics().await.pending
    }

    pub async fn statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock().await;
        let mut stats = QueueStatistics::default();
        for handle in inner.tasks.values() {
            stats.total += 1;
            match handle.read().await.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// 等待入队信号（TaskLoop 的主要唤醒来源）
    pub async fn wait_for_signal(&self) {
        self.notify.notified().await;
    }
}
