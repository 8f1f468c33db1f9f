//! 服务装配
//!
//! 组合根：按 AppConfig 构建一次全部组件并注入依赖。后端客户端在这里
//! 包进 RetryingLlmClient，之后所有流水线（检索、预处理、Prompt、执行、
//! 分解、汇总）都经弹性层发起补全调用——瞬态限流由退避吸收，不消耗
//! 调度器的子任务重试额度。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::coordinator::Coordinator;
use crate::llm::{BackendProfile, BackendRouter, LlmClient, RetryingLlmClient};
use crate::memory::store::MemoryStore;
use crate::memory::MemoryRetriever;
use crate::pipeline::preprocess::ContextPreprocessor;
use crate::pipeline::prompt::PromptPipeline;
use crate::pipeline::subtask::SubtaskPipeline;
use crate::roles::RoleRegistry;
use crate::scheduler::{DagScheduler, PlanStore};

/// 装配完成的服务集
pub struct Services {
    /// 弹性补全客户端（已含退避重试）
    pub llm: Arc<dyn LlmClient>,
    pub router: Arc<BackendRouter>,
    pub roles: Arc<RoleRegistry>,
    pub scheduler: Arc<DagScheduler>,
    pub pipeline: Arc<SubtaskPipeline>,
    pub coordinator: Coordinator,
}

impl Services {
    /// 按配置装配；backend 为原始后端客户端，存储由调用方提供
    pub fn from_config(
        config: &AppConfig,
        backend: Arc<dyn LlmClient>,
        memory: Arc<dyn MemoryStore>,
        plans: Arc<dyn PlanStore>,
    ) -> Self {
        let llm: Arc<dyn LlmClient> = Arc::new(RetryingLlmClient::new(
            backend,
            config.retry.clone().into_config(),
        ));

        let mut router = BackendRouter::new(
            config.router.default_backend.clone(),
            config.router.premium_enabled,
        );
        router.add_backend(BackendProfile::new(config.router.default_backend.clone()));
        let router = Arc::new(router);

        let roles = Arc::new(RoleRegistry::builtin());
        let retriever = Arc::new(MemoryRetriever::new(
            memory.clone(),
            llm.clone(),
            router.clone(),
            config.memory.clone().into_config(),
        ));
        let preprocessor = Arc::new(ContextPreprocessor::new(
            llm.clone(),
            router.clone(),
            config.preprocess.clone().into_config(),
        ));
        let prompts = Arc::new(PromptPipeline::new(
            llm.clone(),
            router.clone(),
            config.prompt.clone().into_config(),
        ));
        let scheduler = Arc::new(DagScheduler::new(plans));
        let pipeline = Arc::new(SubtaskPipeline::new(
            llm.clone(),
            router.clone(),
            retriever,
            preprocessor,
            prompts,
            memory,
            roles.clone(),
        ));
        let coordinator = Coordinator::new(
            llm.clone(),
            router.clone(),
            scheduler.clone(),
            pipeline.clone(),
            roles.clone(),
            config.coordinator.clone().into_config(),
        );

        Self {
            llm,
            router,
            roles,
            scheduler,
            pipeline,
            coordinator,
        }
    }
}
