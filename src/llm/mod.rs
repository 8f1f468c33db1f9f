//! LLM 层：补全服务抽象、弹性重试与后端路由

pub mod mock;
pub mod retry;
pub mod router;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use retry::{RetryConfig, RetryingLlmClient};
pub use router::{
    BackendProfile, BackendRouter, RoutingDecision, RoutingRequest, TaskType, SAFE_BACKEND,
};
pub use traits::{CompletionRequest, CompletionResponse, LlmClient, LlmError, Message, Role};
