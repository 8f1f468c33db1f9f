//! 协同回合端到端测试
//!
//! StageMock 按请求内容区分流水线阶段作答，组内并行时顺序无关，
//! 测试结果因此是确定性的。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use hive::config::AppConfig;
use hive::coordinator::{Coordinator, CoordinatorConfig, CoordinatorError};
use hive::llm::{
    BackendProfile, BackendRouter, CompletionRequest, CompletionResponse, LlmClient, LlmError,
};
use hive::memory::store::InMemoryMemoryStore;
use hive::memory::{MemoryRetriever, RetrieverConfig};
use hive::pipeline::preprocess::{ContextPreprocessor, PreprocessConfig};
use hive::pipeline::prompt::{PromptPipeline, PromptPipelineConfig};
use hive::pipeline::subtask::SubtaskPipeline;
use hive::roles::RoleRegistry;
use hive::scheduler::{DagScheduler, InMemoryPlanStore, SubtaskStatus};
use hive::services::Services;

/// 按阶段作答的补全服务替身
struct StageMock {
    decomposition: String,
    synthesis_fails: bool,
    /// 前 N 次执行调用返回限流错误
    transient_failures: AtomicUsize,
    calls: AtomicUsize,
}

impl StageMock {
    fn new(decomposition: &str) -> Self {
        Self {
            decomposition: decomposition.to_string(),
            synthesis_fails: false,
            transient_failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    fn with_failing_synthesis(mut self) -> Self {
        self.synthesis_fails = true;
        self
    }

    fn with_transient_execution_failures(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn extract_task(prompt: &str) -> &str {
    prompt
        .split_once("Task:\n")
        .map(|(_, rest)| rest.split("\n\n").next().unwrap_or(rest))
        .unwrap_or("unknown")
}

#[async_trait]
impl LlmClient for StageMock {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let last = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("");

        if last.starts_with("Decompose the task") {
            return Ok(CompletionResponse::text(self.decomposition.clone()));
        }
        if last.starts_with("Score this prompt pair") {
            return Ok(CompletionResponse::text(
                "role: 9\ntask: 9\nformat: 9\ncontext: 9\nsafety: 9",
            ));
        }
        if last.starts_with("Write an optimized prompt pair")
            || last.starts_with("Rewrite this prompt pair")
        {
            let task = extract_task(last);
            return Ok(CompletionResponse::text(format!(
                "[SYSTEM PROMPT]\nstay in role\n[USER PROMPT]\n{task}"
            )));
        }
        if last.starts_with("Synthesize the subtask results") {
            if self.synthesis_fails {
                return Err(LlmError::Api("synthesis backend down".into()));
            }
            return Ok(CompletionResponse::text("combined answer"));
        }

        // 最终执行调用：user 消息就是子任务描述
        if last.contains("FAIL") {
            return Err(LlmError::Api("worker backend down".into()));
        }
        if self.transient_failures.load(Ordering::SeqCst) > 0 {
            self.transient_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(LlmError::RateLimited {
                retry_after_ms: None,
            });
        }
        Ok(CompletionResponse {
            text: format!("## Findings\n- done: {last}"),
            prompt_tokens: 10,
            completion_tokens: 5,
        })
    }
}

fn coordinator(llm: Arc<StageMock>) -> Coordinator {
    let mut r = BackendRouter::new("standard", false);
    r.add_backend(BackendProfile::new("standard"));
    let router = Arc::new(r);
    let roles = Arc::new(RoleRegistry::builtin());
    let store = Arc::new(InMemoryMemoryStore::new());
    let retriever = Arc::new(MemoryRetriever::new(
        store.clone(),
        llm.clone(),
        router.clone(),
        RetrieverConfig {
            semantic_search: false,
            ..Default::default()
        },
    ));
    let preprocessor = Arc::new(ContextPreprocessor::new(
        llm.clone(),
        router.clone(),
        PreprocessConfig::default(),
    ));
    let prompts = Arc::new(PromptPipeline::new(
        llm.clone(),
        router.clone(),
        PromptPipelineConfig::default(),
    ));
    let scheduler = Arc::new(DagScheduler::new(Arc::new(InMemoryPlanStore::new())));
    let pipeline = Arc::new(SubtaskPipeline::new(
        llm.clone(),
        router.clone(),
        retriever,
        preprocessor,
        prompts,
        store,
        roles.clone(),
    ));
    Coordinator::new(
        llm,
        router,
        scheduler,
        pipeline,
        roles,
        CoordinatorConfig::default(),
    )
}

#[tokio::test]
async fn test_unparsable_decomposition_runs_single_generalist_round() {
    let llm = Arc::new(StageMock::new("nothing like json in this reply"));
    let c = coordinator(llm.clone());

    let result = c
        .coordinate("s1", "investigate the outage", "")
        .await
        .unwrap();

    assert_eq!(result.subtasks.len(), 1);
    assert_eq!(result.subtasks[0].role, "generalist");
    assert_eq!(result.subtasks[0].status, SubtaskStatus::Completed);
    assert_eq!(result.outputs.len(), 1);
    assert_eq!(result.synthesis, "combined answer");
    // 分解 + generate + review + 执行 + 汇总
    assert_eq!(llm.call_count(), 5);
}

#[tokio::test]
async fn test_parallel_group_then_dependent_subtask() {
    let decomposition = r#"{"subtasks":[
      {"id":"t1","description":"collect usage metrics","role":"researcher","priority":"high","dependencies":[]},
      {"id":"t2","description":"collect error logs","role":"researcher","priority":"high","dependencies":[]},
      {"id":"t3","description":"correlate metrics with errors","role":"analyst","priority":"medium","dependencies":["t1","t2"]}
    ],"executionOrder":[["t1","t2"],["t3"]],"estimatedMinutes":30}"#;
    let llm = Arc::new(StageMock::new(decomposition));
    let c = coordinator(llm.clone());

    let result = c.coordinate("s1", "diagnose the regression", "").await.unwrap();

    assert_eq!(result.subtasks.len(), 3);
    assert!(result
        .subtasks
        .iter()
        .all(|s| s.status == SubtaskStatus::Completed));
    assert_eq!(result.outputs.len(), 3);
    // 仅统计成功子任务：3 次执行调用各 10/5
    assert_eq!(result.prompt_tokens, 30);
    assert_eq!(result.completion_tokens, 15);

    // 下游拿到了两个上游的输出引用
    let t3 = result
        .subtasks
        .iter()
        .find(|s| s.description.starts_with("correlate"))
        .unwrap();
    assert_eq!(t3.input_refs.len(), 2);
    assert_eq!(result.synthesis, "combined answer");
}

#[tokio::test]
async fn test_group_member_failure_is_isolated() {
    let decomposition = r#"{"subtasks":[
      {"id":"t1","description":"FAIL fetch remote dataset","role":"researcher","priority":"high","dependencies":[]},
      {"id":"t2","description":"summarize local notes","role":"writer","priority":"medium","dependencies":[]}
    ],"executionOrder":[["t1","t2"]],"estimatedMinutes":10}"#;
    let llm = Arc::new(StageMock::new(decomposition));
    let c = coordinator(llm);

    let result = c.coordinate("s1", "prepare the report", "").await.unwrap();

    let t1 = result
        .subtasks
        .iter()
        .find(|s| s.description.starts_with("FAIL"))
        .unwrap();
    let t2 = result
        .subtasks
        .iter()
        .find(|s| s.description.starts_with("summarize"))
        .unwrap();
    // t1 用尽重试终态失败，t2 不受影响
    assert_eq!(t1.status, SubtaskStatus::Failed);
    assert_eq!(t1.retry_count, 2);
    assert_eq!(t2.status, SubtaskStatus::Completed);
    assert_eq!(result.outputs.len(), 1);
    // 失败子任务的 token 不计入
    assert_eq!(result.prompt_tokens, 10);
    assert_eq!(result.synthesis, "combined answer");
}

#[tokio::test]
async fn test_dependent_of_failed_subtask_fails_without_retry() {
    let decomposition = r#"{"subtasks":[
      {"id":"t1","description":"FAIL gather inputs","role":"researcher","priority":"high","dependencies":[]},
      {"id":"t2","description":"analyse gathered inputs","role":"analyst","priority":"medium","dependencies":["t1"]}
    ],"executionOrder":[["t1"],["t2"]],"estimatedMinutes":10}"#;
    let llm = Arc::new(StageMock::new(decomposition));
    let c = coordinator(llm);

    let result = c.coordinate("s1", "analysis round", "").await.unwrap();

    let t2 = result
        .subtasks
        .iter()
        .find(|s| s.description.starts_with("analyse"))
        .unwrap();
    assert_eq!(t2.status, SubtaskStatus::Failed);
    // 依赖不满足直接终态，不消耗重试额度
    assert_eq!(t2.retry_count, 1);
    assert!(t2
        .errors
        .iter()
        .any(|e| e.contains("dependencies not completed")));
    assert!(result.outputs.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_rate_limit_absorbed_by_backoff_not_subtask_retries() {
    // 执行调用先限流一次再成功：弹性层退避重试吸收，
    // 子任务一次完成，重试额度不被消耗
    let llm = Arc::new(StageMock::new("no json").with_transient_execution_failures(1));
    let services = Services::from_config(
        &AppConfig::default(),
        llm.clone(),
        Arc::new(InMemoryMemoryStore::new()),
        Arc::new(InMemoryPlanStore::new()),
    );

    let result = services
        .coordinator
        .coordinate("s1", "investigate the outage", "")
        .await
        .unwrap();

    assert_eq!(result.subtasks.len(), 1);
    assert_eq!(result.subtasks[0].status, SubtaskStatus::Completed);
    assert_eq!(result.subtasks[0].retry_count, 0);
    assert!(result.subtasks[0].errors.is_empty());
    // 分解 + generate + review + 执行 ×2（限流 + 成功）+ 汇总
    assert_eq!(llm.call_count(), 6);
}

#[tokio::test]
async fn test_synthesis_failure_propagates() {
    let llm = Arc::new(StageMock::new("garbage").with_failing_synthesis());
    let c = coordinator(llm);

    let err = c.coordinate("s1", "task", "").await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Synthesis(LlmError::Api(_))));
}
