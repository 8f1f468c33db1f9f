//! Mock 补全客户端（用于测试，无需 API）
//!
//! - MockLlmClient：回显最后一条 User 消息
//! - ScriptedLlmClient：按脚本顺序返回预设的 Ok/Err，供重试与流水线测试使用

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{CompletionRequest, CompletionResponse, LlmClient, LlmError, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(CompletionResponse {
            text: format!("Echo from Mock: {}", last_user),
            prompt_tokens: 10,
            completion_tokens: 10,
        })
    }
}

/// 脚本化客户端：依次弹出预设响应，耗尽后回落到固定文本
///
/// call_count 记录实际调用次数，便于断言「恰好重试 N 次」等性质。
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<CompletionResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    /// 便捷构造：全部为 Ok 文本响应
    pub fn from_texts(texts: Vec<&str>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|t| Ok(CompletionResponse::text(t)))
                .collect(),
        )
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(result) => result,
            None => Ok(CompletionResponse::text("(script exhausted)")),
        }
    }
}
