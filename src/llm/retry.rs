//! 弹性调用：指数退避重试
//!
//! RetryingLlmClient 包装任意 LlmClient，对瞬态错误（限流 / 配额耗尽）按
//! base × 2^attempt 退避重试，最多 max_attempts 次；非瞬态错误与耗尽后的
//! 最后一个错误原样向上传播。重试期间不持有任何锁，并发调用方互不影响。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError};

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// 首次退避基准（毫秒）
    pub base_delay_ms: u64,
    /// 最大尝试次数（含首次）
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

/// 弹性补全客户端
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    /// 第 attempt 次失败后的等待时长（attempt 从 0 计）；溢出时饱和
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.base_delay_ms.saturating_mul(factor))
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let max = self.config.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match self.inner.complete(request).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt + 1 < max => {
                    // 服务端建议的等待时间仅记录日志，实际等待用计算出的退避
                    if let LlmError::QuotaExhausted {
                        metric,
                        dimension,
                        retry_after_ms,
                    } = &e
                    {
                        tracing::warn!(
                            ?metric,
                            ?dimension,
                            ?retry_after_ms,
                            "Quota exhausted, backing off"
                        );
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::info!(
                        attempt = attempt + 1,
                        max_attempts = max,
                        delay_ms = delay.as_millis() as u64,
                        backend = %request.backend_id,
                        "Retrying completion call: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Message, ScriptedLlmClient};

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            retry_after_ms: None,
        }
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("standard", vec![Message::user("hi")])
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_n_retries_with_exponential_sleeps() {
        // 失败 3 次后成功：等待应为 100ms、200ms、400ms，共 700ms
        let inner = Arc::new(ScriptedLlmClient::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
            Ok(CompletionResponse::text("done")),
        ]));
        let client = RetryingLlmClient::new(
            inner.clone(),
            RetryConfig {
                base_delay_ms: 100,
                max_attempts: 5,
            },
        );

        let start = tokio::time::Instant::now();
        let resp = client.complete(&request()).await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(resp.text, "done");
        assert_eq!(inner.call_count(), 4);
        assert_eq!(elapsed.as_millis(), 700);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_propagates_last_error() {
        let inner = Arc::new(ScriptedLlmClient::new(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
        ]));
        let client = RetryingLlmClient::new(
            inner.clone(),
            RetryConfig {
                base_delay_ms: 10,
                max_attempts: 3,
            },
        );

        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::RateLimited { .. }));
        assert_eq!(inner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_not_retried() {
        let inner = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Api(
            "bad".into(),
        ))]));
        let client = RetryingLlmClient::new(inner.clone(), RetryConfig::default());

        let err = client.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Api(_)));
        assert_eq!(inner.call_count(), 1);
    }

    #[test]
    fn test_backoff_delay_saturates_instead_of_overflowing() {
        let client = RetryingLlmClient::new(
            Arc::new(ScriptedLlmClient::from_texts(vec![])),
            RetryConfig {
                base_delay_ms: 100,
                max_attempts: 200,
            },
        );
        assert_eq!(client.backoff_delay(3), Duration::from_millis(800));
        // 移位 / 乘法溢出都饱和到最大值而不是回绕
        assert_eq!(client.backoff_delay(63), Duration::from_millis(u64::MAX));
        assert_eq!(client.backoff_delay(100), Duration::from_millis(u64::MAX));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_error_uses_computed_backoff_not_server_hint() {
        // 服务端建议 30s，但实际等待应为计算出的 50ms
        let inner = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::QuotaExhausted {
                metric: Some("generate_requests".into()),
                dimension: Some("per-day".into()),
                retry_after_ms: Some(30_000),
            }),
            Ok(CompletionResponse::text("ok")),
        ]));
        let client = RetryingLlmClient::new(
            inner,
            RetryConfig {
                base_delay_ms: 50,
                max_attempts: 2,
            },
        );

        let start = tokio::time::Instant::now();
        client.complete(&request()).await.unwrap();
        assert_eq!(start.elapsed().as_millis(), 50);
    }
}
