//! 任务编排层：统一任务模型、队列、执行器、调度与触发器

pub mod executor;
pub mod loop_;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod trigger;

pub use executor::{GoalExecutor, PlanExecutor, TaskExecutor, ToolInvoker};
pub use loop_::TaskLoop;
pub use model::{ExecutionRecord, Plan, PlanStep, StepStatus, Task, TaskKind, TaskStatus};
pub use queue::{QueueStatistics, TaskQueue};
pub use scheduler::Scheduler;
pub use trigger::{PeriodicTrigger, TaskTemplate};
