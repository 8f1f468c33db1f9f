//! Hive - Rust 多智能体协同内核
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **coordinator**: 任务分解与组并行执行、结果汇总
//! - **llm**: LLM 客户端抽象（补全 trait / 重试 / 路由 / Mock）
//! - **memory**: 分层会话记忆（洞见 / 摘要 / 原始引用）与预算检索
//! - **observability**: 日志初始化
//! - **parse**: 宽容解析的降级标注
//! - **pipeline**: 子任务流水线（预处理、Prompt 迭代、执行与写回）
//! - **roles**: 工作者角色注册表
//! - **scheduler**: DAG 调度（计划生命周期与依赖就绪计算）
//! - **services**: 组合根（按配置装配全部组件）

pub mod config;
pub mod coordinator;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod parse;
pub mod pipeline;
pub mod roles;
pub mod scheduler;
pub mod services;

pub use config::{load_config, AppConfig};
pub use coordinator::{CoordinationResult, Coordinator, CoordinatorConfig};
pub use llm::{BackendRouter, LlmClient, LlmError, RetryingLlmClient};
pub use memory::{MemoryRetriever, RetrieverConfig};
pub use scheduler::{DagScheduler, PlanSpec, SubtaskSpec};
pub use services::Services;
