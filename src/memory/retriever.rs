//! 分层上下文检索
//!
//! 在固定 token 预算内按优先级装载三层上下文：
//! - Tier-2 insights：最先装载，relevance 1.0，按遇到顺序贪心收纳
//! - Tier-1 digests：剩余预算高于下限时才装载；先装直接的贡献者摘要
//!   （排除自己），预算仍有余且启用语义检索时，再对主题摘要做一次
//!   LLM 排序取 top-K
//! - Tier-0 raw：从不装载内容，只附带引用指针供后续按需取用
//!
//! 收纳是层内按遇到顺序的贪心，不做全局最优：预算耗尽后即使更相关的
//! 候选也被跳过。不变量：已装载条目的 token 估算和 ≤ 预算。

use std::sync::Arc;

use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, Message, RoutingRequest, TaskType,
};
use crate::memory::store::{MemoryError, MemoryStore, RawRef};
use crate::parse::Parsed;

/// 估算用的固定字符/token 比（不用真实分词器）
pub const CHARS_PER_TOKEN: usize = 4;

/// Token 估算器：字符数 / 固定比值，至少 1
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        (text.chars().count() / CHARS_PER_TOKEN).max(1)
    }
}

/// 上下文层级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextTier {
    /// Tier-2 洞见
    Insights,
    /// Tier-1 摘要
    Digests,
    /// Tier-0 原始引用
    Raw,
}

/// 一条已装载的上下文
#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub tier: ContextTier,
    /// 来源标识（文件名 / 贡献者 / 主题）
    pub source: String,
    pub content: String,
    pub token_estimate: usize,
    pub relevance: f32,
}

/// 检索结果：有序条目 + 各层 token 小计 + Tier-0 引用指针
#[derive(Debug, Clone, Default)]
pub struct RetrievedContext {
    pub entries: Vec<ContextEntry>,
    pub l2_tokens: usize,
    pub l1_tokens: usize,
    pub raw_refs: Vec<RawRef>,
    pub budget: usize,
}

impl RetrievedContext {
    pub fn total_tokens(&self) -> usize {
        self.l2_tokens + self.l1_tokens
    }

    /// 拼接为单段文本，各条目带来源标签
    pub fn combined_text(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("[{}]\n{}", e.source, e.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// 检索参数
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// 总 token 预算
    pub token_budget: usize,
    /// Tier-1 装载所需的最小剩余预算
    pub digest_floor: usize,
    /// 是否对主题摘要做语义排序
    pub semantic_search: bool,
    /// 语义排序取前 K 条
    pub top_k: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            token_budget: 4000,
            digest_floor: 200,
            semantic_search: true,
            top_k: 3,
        }
    }
}

/// 直接贡献者摘要的固定 relevance
const DIGEST_RELEVANCE: f32 = 0.8;
/// 语义排序降级时的中性 relevance
const NEUTRAL_RELEVANCE: f32 = 0.5;

/// 分层记忆检索器
pub struct MemoryRetriever {
    store: Arc<dyn MemoryStore>,
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    config: RetrieverConfig,
}

impl MemoryRetriever {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            store,
            llm,
            router,
            config,
        }
    }

    /// 为一次子任务调用组装上下文
    pub async fn retrieve(
        &self,
        session: &str,
        contributor: &str,
        task: &str,
    ) -> Result<RetrievedContext, MemoryError> {
        let budget = self.config.token_budget;
        let mut ctx = RetrievedContext {
            budget,
            ..Default::default()
        };

        // Tier-2：洞见，按固定文件顺序贪心收纳
        for (name, content) in self.store.load_insights(session).await? {
            let estimate = TokenEstimator::estimate(&content);
            if ctx.total_tokens() + estimate > budget {
                tracing::debug!(source = %name, estimate, "Insight skipped, budget exhausted");
                continue;
            }
            ctx.l2_tokens += estimate;
            ctx.entries.push(ContextEntry {
                tier: ContextTier::Insights,
                source: name,
                content,
                token_estimate: estimate,
                relevance: 1.0,
            });
        }

        // Tier-1：剩余预算高于下限时才装载
        let remaining = budget.saturating_sub(ctx.total_tokens());
        if remaining > self.config.digest_floor {
            for (source, content) in self
                .store
                .load_contributor_digests(session, contributor)
                .await?
            {
                let estimate = TokenEstimator::estimate(&content);
                if ctx.total_tokens() + estimate > budget {
                    continue;
                }
                ctx.l1_tokens += estimate;
                ctx.entries.push(ContextEntry {
                    tier: ContextTier::Digests,
                    source: format!("digest/{source}"),
                    content,
                    token_estimate: estimate,
                    relevance: DIGEST_RELEVANCE,
                });
            }

            let remaining = budget.saturating_sub(ctx.total_tokens());
            if self.config.semantic_search && remaining > self.config.digest_floor {
                let topics = self.store.load_topic_digests(session).await?;
                if !topics.is_empty() {
                    let ranked = self.rank_topics(task, &topics).await;
                    if let Some(reason) = &ranked.degraded {
                        tracing::warn!(%reason, "Semantic ranking degraded, using first candidates");
                    }
                    for (index, relevance) in ranked.value {
                        let (topic, content) = &topics[index];
                        let estimate = TokenEstimator::estimate(content);
                        if ctx.total_tokens() + estimate > budget {
                            continue;
                        }
                        ctx.l1_tokens += estimate;
                        ctx.entries.push(ContextEntry {
                            tier: ContextTier::Digests,
                            source: format!("topic/{topic}"),
                            content: content.clone(),
                            token_estimate: estimate,
                            relevance,
                        });
                    }
                }
            }
        }

        // Tier-0：只带引用指针
        ctx.raw_refs = self.store.raw_refs(session).await?;

        tracing::debug!(
            l2 = ctx.l2_tokens,
            l1 = ctx.l1_tokens,
            raw_refs = ctx.raw_refs.len(),
            budget,
            "Context retrieval complete"
        );
        Ok(ctx)
    }

    /// 一次补全调用对候选主题摘要排序；失败降级为前 K 条中性分
    async fn rank_topics(
        &self,
        task: &str,
        topics: &[(String, String)],
    ) -> Parsed<Vec<(usize, f32)>> {
        let k = self.config.top_k.min(topics.len());
        let fallback: Vec<(usize, f32)> = (0..k).map(|i| (i, NEUTRAL_RELEVANCE)).collect();

        let mut listing = String::new();
        for (i, (topic, content)) in topics.iter().enumerate() {
            let excerpt: String = content.chars().take(200).collect();
            listing.push_str(&format!("[{i}] topic={topic}\n{excerpt}\n\n"));
        }
        let prompt = format!(
            "Task:\n{task}\n\nCandidate context excerpts:\n{listing}\
             Rank the candidates from most to least relevant to the task. \
             Reply with a comma-separated list of indices only, e.g. `2,0,1`."
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::ContextRanking, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)])
            .with_temperature(0.0)
            .with_max_output_tokens(64);

        let response = match self.llm.complete(&request).await {
            Ok(resp) => resp,
            Err(e) => return Parsed::degraded(fallback, format!("ranking call failed: {e}")),
        };

        let ranked = parse_ranking(&response.text, topics.len());
        match ranked {
            Some(indices) if !indices.is_empty() => {
                // 按名次递减赋分
                let scored = indices
                    .into_iter()
                    .take(k)
                    .enumerate()
                    .map(|(rank, index)| (index, 1.0 - 0.1 * rank as f32))
                    .collect();
                Parsed::ok(scored)
            }
            _ => Parsed::degraded(fallback, "unparsable ranking response"),
        }
    }
}

/// 解析逗号分隔的索引排序；越界索引与重复项丢弃
fn parse_ranking(text: &str, candidate_count: usize) -> Option<Vec<usize>> {
    let line = text.lines().find(|l| !l.trim().is_empty())?;
    let mut seen = std::collections::HashSet::new();
    let indices: Vec<usize> = line
        .split(',')
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter(|i| *i < candidate_count && seen.insert(*i))
        .collect();
    if indices.is_empty() {
        None
    } else {
        Some(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, ScriptedLlmClient};
    use crate::memory::store::{InMemoryMemoryStore, MemoryRecord, RecordHeader};

    fn router() -> Arc<BackendRouter> {
        let mut r = BackendRouter::new("standard", false);
        r.add_backend(crate::llm::BackendProfile::new("standard"));
        Arc::new(r)
    }

    fn retriever_with(
        store: Arc<InMemoryMemoryStore>,
        llm: Arc<dyn LlmClient>,
        config: RetrieverConfig,
    ) -> MemoryRetriever {
        MemoryRetriever::new(store, llm, router(), config)
    }

    async fn put_insights(store: &InMemoryMemoryStore, session: &str, sizes: &[usize]) {
        let names = ["insights.md", "decisions.md", "open-questions.md"];
        for (i, chars) in sizes.iter().enumerate() {
            store
                .put_insight(session, names[i], "x".repeat(*chars))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_token_estimator() {
        assert_eq!(TokenEstimator::estimate(&"x".repeat(2400)), 600);
        assert_eq!(TokenEstimator::estimate(""), 1);
        assert_eq!(TokenEstimator::estimate("ab"), 1);
    }

    #[tokio::test]
    async fn test_budget_1000_two_600_docs_admits_first_only() {
        let store = Arc::new(InMemoryMemoryStore::new());
        // 两个 600 token（2400 字符）的 Tier-2 文档
        put_insights(&store, "s1", &[2400, 2400]).await;

        let retriever = retriever_with(
            store,
            Arc::new(ScriptedLlmClient::from_texts(vec![])),
            RetrieverConfig {
                token_budget: 1000,
                ..Default::default()
            },
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();

        assert_eq!(ctx.entries.len(), 1);
        assert_eq!(ctx.l2_tokens, 600);
        assert_eq!(ctx.entries[0].source, "insights.md");
    }

    #[tokio::test]
    async fn test_budget_invariant_holds_for_zero_budget() {
        let store = Arc::new(InMemoryMemoryStore::new());
        put_insights(&store, "s1", &[400]).await;

        let retriever = retriever_with(
            store,
            Arc::new(ScriptedLlmClient::from_texts(vec![])),
            RetrieverConfig {
                token_budget: 0,
                ..Default::default()
            },
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();
        assert!(ctx.entries.is_empty());
        assert_eq!(ctx.total_tokens(), 0);
    }

    #[tokio::test]
    async fn test_digests_skipped_below_floor() {
        let store = Arc::new(InMemoryMemoryStore::new());
        // 洞见吃掉大部分预算，剩余低于 digest_floor
        put_insights(&store, "s1", &[3600]).await;
        store
            .append_digest(
                "s1",
                MemoryRecord {
                    header: RecordHeader::new("researcher", "standard"),
                    body: "## Findings\n- x".into(),
                },
            )
            .await
            .unwrap();

        let retriever = retriever_with(
            store,
            Arc::new(ScriptedLlmClient::from_texts(vec![])),
            RetrieverConfig {
                token_budget: 1000,
                digest_floor: 200,
                semantic_search: false,
                top_k: 3,
            },
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();
        assert_eq!(ctx.l1_tokens, 0);
        assert!(ctx
            .entries
            .iter()
            .all(|e| e.tier == ContextTier::Insights));
    }

    #[tokio::test]
    async fn test_semantic_ranking_orders_topics() {
        let store = Arc::new(InMemoryMemoryStore::new());
        for topic in ["alpha", "beta", "gamma"] {
            store
                .append_topic_digest(
                    "s1",
                    topic,
                    MemoryRecord {
                        header: RecordHeader::new("researcher", "standard"),
                        body: format!("notes about {topic}"),
                    },
                )
                .await
                .unwrap();
        }

        let llm = Arc::new(ScriptedLlmClient::from_texts(vec!["2,0,1"]));
        let retriever = retriever_with(
            store,
            llm,
            RetrieverConfig {
                token_budget: 4000,
                digest_floor: 100,
                semantic_search: true,
                top_k: 2,
            },
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();

        let topics: Vec<_> = ctx
            .entries
            .iter()
            .filter(|e| e.source.starts_with("topic/"))
            .collect();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].source, "topic/gamma");
        assert_eq!(topics[0].relevance, 1.0);
        assert_eq!(topics[1].source, "topic/alpha");
        assert!(topics[1].relevance < 1.0);
    }

    #[tokio::test]
    async fn test_ranking_failure_falls_back_to_first_k() {
        let store = Arc::new(InMemoryMemoryStore::new());
        for topic in ["alpha", "beta", "gamma"] {
            store
                .append_topic_digest(
                    "s1",
                    topic,
                    MemoryRecord {
                        header: RecordHeader::new("researcher", "standard"),
                        body: format!("notes about {topic}"),
                    },
                )
                .await
                .unwrap();
        }

        let llm = Arc::new(ScriptedLlmClient::new(vec![Err(LlmError::Api(
            "down".into(),
        ))]));
        let retriever = retriever_with(
            store,
            llm,
            RetrieverConfig {
                token_budget: 4000,
                digest_floor: 100,
                semantic_search: true,
                top_k: 2,
            },
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();

        let topics: Vec<_> = ctx
            .entries
            .iter()
            .filter(|e| e.source.starts_with("topic/"))
            .collect();
        assert_eq!(topics.len(), 2);
        assert_eq!(topics[0].source, "topic/alpha");
        assert_eq!(topics[0].relevance, NEUTRAL_RELEVANCE);
    }

    #[tokio::test]
    async fn test_raw_refs_surfaced_without_content() {
        let store = Arc::new(InMemoryMemoryStore::new());
        store
            .append_raw_ref(
                "s1",
                crate::memory::store::RawRef {
                    contributor: "researcher".into(),
                    doc_id: "raw-1".into(),
                    created_at: 1,
                },
            )
            .await
            .unwrap();

        let retriever = retriever_with(
            store,
            Arc::new(ScriptedLlmClient::from_texts(vec![])),
            RetrieverConfig::default(),
        );
        let ctx = retriever.retrieve("s1", "analyst", "task").await.unwrap();
        assert_eq!(ctx.raw_refs.len(), 1);
        assert!(ctx.entries.iter().all(|e| e.tier != ContextTier::Raw));
    }

    #[test]
    fn test_parse_ranking_rejects_garbage() {
        assert!(parse_ranking("no numbers here", 3).is_none());
        assert_eq!(parse_ranking("1, 0, 7, 1", 3), Some(vec![1, 0]));
    }
}
