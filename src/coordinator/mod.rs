//! 协同：任务分解与组并行执行

pub mod coordinator;
pub mod decompose;

pub use coordinator::{CoordinationResult, Coordinator, CoordinatorConfig, CoordinatorError};
pub use decompose::Decomposer;
