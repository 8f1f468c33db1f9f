//! 补全服务抽象
//!
//! 所有后端实现 LlmClient：complete（非流式单次补全）。请求携带后端 id、
//! 角色标注消息、温度与输出 token 上限；响应携带文本与 token 统计。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与补全 API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 补全请求：目标后端 + 有序消息列表 + 采样参数
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub backend_id: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    pub fn new(backend_id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            backend_id: backend_id.into(),
            messages,
            temperature: 0.7,
            max_output_tokens: 4096,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }
}

/// 补全响应：文本 + token 统计
#[derive(Clone, Debug, Default)]
pub struct CompletionResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl CompletionResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// 补全服务错误
///
/// RateLimited / QuotaExhausted 为瞬态错误，可由 RetryingLlmClient 重试；
/// 其余错误原样向上传播。
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// HTTP 429 限流
    #[error("Rate limited (retry_after_ms={retry_after_ms:?})")]
    RateLimited { retry_after_ms: Option<u64> },

    /// 配额耗尽；metric/dimension/retry_after_ms 来自服务端结构化错误详情，仅用于诊断
    #[error("Quota exhausted (metric={metric:?}, dimension={dimension:?})")]
    QuotaExhausted {
        metric: Option<String>,
        dimension: Option<String>,
        retry_after_ms: Option<u64>,
    },

    #[error("API error: {0}")]
    Api(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LlmError {
    /// 是否可重试（限流与配额耗尽视为瞬态）
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::QuotaExhausted { .. }
        )
    }
}

/// 补全服务客户端 trait：单次非流式补全
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError>;
}
