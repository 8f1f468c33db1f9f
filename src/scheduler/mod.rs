//! DAG 调度：计划/子任务生命周期与依赖就绪计算

pub mod scheduler;
pub mod store;
pub mod types;

pub use scheduler::{DagScheduler, SchedulerError};
pub use store::{InMemoryPlanStore, PlanStore};
pub use types::{
    Plan, PlanId, PlanProgress, PlanSpec, PlanStatus, Priority, Subtask, SubtaskId, SubtaskSpec,
    SubtaskStatus,
};
