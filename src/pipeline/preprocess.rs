//! 上下文预处理（纯建议性）
//!
//! 合并上下文低于 token 下限时直接透传；否则发起一次补全调用，按配置的
//! 变换子集重写文本，并解析固定标记的冲突 / 缺口行。任何失败（调用或
//! 解析）都原样返回输入——该阶段永远不阻塞流水线。

use std::sync::Arc;

use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, Message, RoutingRequest, TaskType,
};
use crate::memory::TokenEstimator;

/// 冲突 / 缺口标记（固定字形，解析与产出两侧共用）
pub const CONFLICT_MARKER: &str = "⚠️ CONFLICT:";
pub const GAP_MARKER: &str = "❓ GAP:";

/// 可配置的变换
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// 去重
    Dedupe,
    /// 降噪
    NoiseReduction,
    /// 重要性排序
    ImportanceRanking,
    /// 冲突检测
    ConflictDetection,
    /// 格式规整
    FormatNormalization,
    /// 缺口补齐
    GapFilling,
    /// 领域检查
    DomainCheck,
}

impl Transform {
    /// 供配置解析；未知名字返回 None
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dedupe" => Some(Transform::Dedupe),
            "noise_reduction" => Some(Transform::NoiseReduction),
            "importance_ranking" => Some(Transform::ImportanceRanking),
            "conflict_detection" => Some(Transform::ConflictDetection),
            "format_normalization" => Some(Transform::FormatNormalization),
            "gap_filling" => Some(Transform::GapFilling),
            "domain_check" => Some(Transform::DomainCheck),
            _ => None,
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Transform::Dedupe => "remove duplicated statements",
            Transform::NoiseReduction => "drop filler and irrelevant detail",
            Transform::ImportanceRanking => "order content from most to least important",
            Transform::ConflictDetection => "flag contradictions between sources",
            Transform::FormatNormalization => "normalize headings and list formatting",
            Transform::GapFilling => "flag missing information needed for the task",
            Transform::DomainCheck => "flag statements inconsistent with the task domain",
        }
    }
}

/// 预处理参数
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// 低于此 token 估算时跳过（直接透传）
    pub token_floor: usize,
    pub transforms: Vec<Transform>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            token_floor: 300,
            transforms: vec![
                Transform::Dedupe,
                Transform::NoiseReduction,
                Transform::ConflictDetection,
                Transform::GapFilling,
            ],
        }
    }
}

/// 预处理结果
#[derive(Debug, Clone)]
pub struct PreprocessResult {
    pub text: String,
    pub original_tokens: usize,
    pub processed_tokens: usize,
    pub conflicts: Vec<String>,
    pub gaps: Vec<String>,
    /// 是否真正执行了压缩（false = 透传）
    pub applied: bool,
}

impl PreprocessResult {
    fn passthrough(context: &str) -> Self {
        let tokens = TokenEstimator::estimate(context);
        Self {
            text: context.to_string(),
            original_tokens: tokens,
            processed_tokens: tokens,
            conflicts: Vec::new(),
            gaps: Vec::new(),
            applied: false,
        }
    }
}

/// 上下文预处理器
pub struct ContextPreprocessor {
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    config: PreprocessConfig,
}

impl ContextPreprocessor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        config: PreprocessConfig,
    ) -> Self {
        Self {
            llm,
            router,
            config,
        }
    }

    /// 单次压缩；永不失败
    pub async fn preprocess(&self, context: &str, task: &str) -> PreprocessResult {
        let original_tokens = TokenEstimator::estimate(context);
        if original_tokens < self.config.token_floor {
            return PreprocessResult::passthrough(context);
        }
        if self.config.transforms.is_empty() {
            return PreprocessResult::passthrough(context);
        }

        let instructions = self
            .config
            .transforms
            .iter()
            .map(|t| format!("- {}", t.instruction()))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Rewrite the context below for the task, applying these transforms:\n{instructions}\n\
             Mark each detected contradiction on its own line starting with `{CONFLICT_MARKER}` \
             and each information gap with `{GAP_MARKER}`.\n\n\
             Task:\n{task}\n\nContext:\n{context}"
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::Preprocessing, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)])
            .with_temperature(0.2);

        let response = match self.llm.complete(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("Preprocessing call failed, passing context through: {}", e);
                return PreprocessResult::passthrough(context);
            }
        };

        let mut conflicts = Vec::new();
        let mut gaps = Vec::new();
        let mut kept = Vec::new();
        for line in response.text.lines() {
            let trimmed = line.trim();
            if let Some(rest) = trimmed.strip_prefix(CONFLICT_MARKER) {
                conflicts.push(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix(GAP_MARKER) {
                gaps.push(rest.trim().to_string());
            } else {
                kept.push(line);
            }
        }
        let text = kept.join("\n").trim().to_string();
        if text.is_empty() {
            tracing::warn!("Preprocessing returned empty text, passing context through");
            return PreprocessResult::passthrough(context);
        }

        let processed_tokens = TokenEstimator::estimate(&text);
        PreprocessResult {
            text,
            original_tokens,
            processed_tokens,
            conflicts,
            gaps,
            applied: true,
        }
    }
}
