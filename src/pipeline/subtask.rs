//! 子任务流水线
//!
//! 一次子任务执行 = 检索 → 预处理 → Prompt 迭代 → 最终补全调用，
//! 只在外部补全调用边界挂起。完成后从输出中抽取 Findings /
//! Uncertainties 小节，写回一条贡献者摘要与一条 Tier-0 引用。

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, LlmError, Message, RoutingRequest, TaskType,
};
use crate::memory::store::{MemoryError, MemoryRecord, MemoryStore, RawRef, RecordHeader};
use crate::memory::{parse_sections, MemoryRetriever};
use crate::pipeline::preprocess::ContextPreprocessor;
use crate::pipeline::prompt::PromptPipeline;
use crate::roles::RoleRegistry;

/// 子任务执行错误
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// 一次子任务执行请求
#[derive(Debug, Clone)]
pub struct SubtaskRequest {
    pub subtask_id: String,
    pub description: String,
    pub role_id: String,
    /// 已完成依赖的截断输出（按生产者 id 标注），由 Coordinator 拼好
    pub dependency_context: String,
    pub special_instructions: String,
}

/// 子任务执行产出
#[derive(Debug, Clone)]
pub struct SubtaskOutput {
    pub subtask_id: String,
    pub text: String,
    pub findings: Vec<String>,
    pub uncertainties: Vec<String>,
    /// 可供下游子任务引用的输出指针
    pub refs: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
}

/// 子任务流水线：组合检索器、预处理器与 Prompt 流水线
pub struct SubtaskPipeline {
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    retriever: Arc<MemoryRetriever>,
    preprocessor: Arc<ContextPreprocessor>,
    prompts: Arc<PromptPipeline>,
    store: Arc<dyn MemoryStore>,
    roles: Arc<RoleRegistry>,
}

impl SubtaskPipeline {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        retriever: Arc<MemoryRetriever>,
        preprocessor: Arc<ContextPreprocessor>,
        prompts: Arc<PromptPipeline>,
        store: Arc<dyn MemoryStore>,
        roles: Arc<RoleRegistry>,
    ) -> Self {
        Self {
            llm,
            router,
            retriever,
            preprocessor,
            prompts,
            store,
            roles,
        }
    }

    /// 执行一个子任务
    pub async fn execute(
        &self,
        session: &str,
        request: &SubtaskRequest,
    ) -> Result<SubtaskOutput, PipelineError> {
        let start = Instant::now();
        let role = self.roles.get(&request.role_id);
        tracing::info!(
            subtask = %request.subtask_id,
            role = %role.id,
            "Subtask execution started"
        );

        // 分层检索
        let retrieved = self
            .retriever
            .retrieve(session, &role.id, &request.description)
            .await?;
        let mut combined = retrieved.combined_text();
        if !request.dependency_context.is_empty() {
            if !combined.is_empty() {
                combined.push_str("\n\n");
            }
            combined.push_str(&request.dependency_context);
        }

        // 建议性压缩
        let pre = self
            .preprocessor
            .preprocess(&combined, &request.description)
            .await;
        if !pre.conflicts.is_empty() || !pre.gaps.is_empty() {
            tracing::info!(
                subtask = %request.subtask_id,
                conflicts = pre.conflicts.len(),
                gaps = pre.gaps.len(),
                "Preprocessing flagged context issues"
            );
        }

        // Prompt 迭代
        let candidate = self
            .prompts
            .run(
                role,
                &request.description,
                &pre.text,
                &request.special_instructions,
            )
            .await?;

        // 最终补全调用
        let decision = self.router.route(&RoutingRequest::new(
            TaskType::Execution,
            &request.description,
        ));
        let completion = CompletionRequest::new(
            decision.backend_id.clone(),
            vec![
                Message::system(candidate.system.clone()),
                Message::user(candidate.user.clone()),
            ],
        );
        let response = self.llm.complete(&completion).await?;

        let sections = parse_sections(&response.text);
        let duration_ms = start.elapsed().as_millis() as u64;

        // 写回摘要与 Tier-0 引用
        let mut header = RecordHeader::new(role.id.clone(), decision.backend_id);
        header.prompt_tokens = response.prompt_tokens;
        header.completion_tokens = response.completion_tokens;
        header.duration_ms = duration_ms;
        self.store
            .append_digest(
                session,
                MemoryRecord {
                    header,
                    body: response.text.clone(),
                },
            )
            .await?;
        self.store
            .append_raw_ref(
                session,
                RawRef {
                    contributor: role.id.clone(),
                    doc_id: format!("raw/{}", request.subtask_id),
                    created_at: chrono::Utc::now().timestamp_millis(),
                },
            )
            .await?;

        tracing::info!(
            subtask = %request.subtask_id,
            duration_ms,
            iterations = candidate.iterations,
            "Subtask execution finished"
        );
        Ok(SubtaskOutput {
            subtask_id: request.subtask_id.clone(),
            text: response.text,
            findings: sections.findings,
            uncertainties: sections.uncertainties,
            refs: vec![format!("digest/{}/{}", role.id, request.subtask_id)],
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            duration_ms,
        })
    }
}
