//! 分层记忆存储
//!
//! 按会话组织三层文档：
//! - Tier-2 insights：固定文件名的洞见文档（始终优先加载）
//! - Tier-1 digests：按贡献者与按主题两种分区的摘要记录
//! - Tier-0 raw：按贡献者分区的原始记录，只暴露引用指针，从不整体加载
//!
//! 每条记录由结构化头部（贡献者、后端、时间戳、token/耗时计数）与正文
//! 组成；正文以固定标题行划分 Findings / Uncertainties / Suggestions /
//! Cross-references 小节，检索器与子任务流水线都依赖这一节约定。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// Tier-2 洞见文档的固定文件名（按此顺序加载）
pub const INSIGHT_FILES: &[&str] = &["insights.md", "decisions.md", "open-questions.md"];

/// 每贡献者最多暴露的 Tier-0 引用数
pub const MAX_RAW_REFS_PER_CONTRIBUTOR: usize = 10;

/// 正文小节的固定标题行
pub const SECTION_FINDINGS: &str = "## Findings";
pub const SECTION_UNCERTAINTIES: &str = "## Uncertainties";
pub const SECTION_SUGGESTIONS: &str = "## Suggestions";
pub const SECTION_CROSS_REFERENCES: &str = "## Cross-references";

/// 记忆层错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}

/// 记录头部：贡献者、生成后端与计数器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    pub contributor: String,
    pub backend_id: String,
    pub created_at: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
}

impl RecordHeader {
    pub fn new(contributor: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            contributor: contributor.into(),
            backend_id: backend_id.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            prompt_tokens: 0,
            completion_tokens: 0,
            duration_ms: 0,
        }
    }
}

/// 一条记忆记录：头部 + 分节正文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub header: RecordHeader,
    pub body: String,
}

impl MemoryRecord {
    /// 渲染为带头部行的文档文本
    pub fn render(&self) -> String {
        format!(
            "contributor: {}\nbackend: {}\ncreated_at: {}\ntokens: {}/{}\nduration_ms: {}\n\n{}",
            self.header.contributor,
            self.header.backend_id,
            self.header.created_at,
            self.header.prompt_tokens,
            self.header.completion_tokens,
            self.header.duration_ms,
            self.body
        )
    }
}

/// 按固定标题行切出的正文小节
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSections {
    pub findings: Vec<String>,
    pub uncertainties: Vec<String>,
    pub suggestions: Vec<String>,
    pub cross_references: Vec<String>,
}

/// 解析正文小节：标题行之间的非空行归入对应小节，行首的列表符号剥掉
pub fn parse_sections(body: &str) -> RecordSections {
    let mut sections = RecordSections::default();
    let mut current: Option<&mut Vec<String>> = None;

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed == SECTION_FINDINGS {
            current = Some(&mut sections.findings);
            continue;
        } else if trimmed == SECTION_UNCERTAINTIES {
            current = Some(&mut sections.uncertainties);
            continue;
        } else if trimmed == SECTION_SUGGESTIONS {
            current = Some(&mut sections.suggestions);
            continue;
        } else if trimmed == SECTION_CROSS_REFERENCES {
            current = Some(&mut sections.cross_references);
            continue;
        } else if trimmed.starts_with("## ") {
            // 未知小节，忽略其内容
            current = None;
            continue;
        }

        if trimmed.is_empty() {
            continue;
        }
        if let Some(bucket) = current.as_mut() {
            let item = trimmed.trim_start_matches(['-', '*']).trim();
            if !item.is_empty() {
                bucket.push(item.to_string());
            }
        }
    }

    sections
}

/// Tier-0 原始记录的引用指针（不含内容）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRef {
    pub contributor: String,
    pub doc_id: String,
    pub created_at: i64,
}

/// 分层记忆存储 trait
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Tier-2：固定文件名的洞见文档，(文件名, 内容)，按 INSIGHT_FILES 顺序
    async fn load_insights(&self, session: &str) -> Result<Vec<(String, String)>, MemoryError>;

    /// Tier-1：按贡献者分区的摘要，排除 exclude 自己，(贡献者, 渲染后内容)
    async fn load_contributor_digests(
        &self,
        session: &str,
        exclude: &str,
    ) -> Result<Vec<(String, String)>, MemoryError>;

    /// Tier-1：按主题分区的摘要，(主题, 渲染后内容)
    async fn load_topic_digests(&self, session: &str) -> Result<Vec<(String, String)>, MemoryError>;

    /// Tier-0：每贡献者最近至多 10 条引用指针
    async fn raw_refs(&self, session: &str) -> Result<Vec<RawRef>, MemoryError>;

    /// 追加一条贡献者摘要记录
    async fn append_digest(
        &self,
        session: &str,
        record: MemoryRecord,
    ) -> Result<(), MemoryError>;

    /// 写入 / 覆盖一个洞见文档（固定文件名之一）
    async fn put_insight(
        &self,
        session: &str,
        name: &str,
        content: String,
    ) -> Result<(), MemoryError>;

    /// 追加一条主题摘要记录
    async fn append_topic_digest(
        &self,
        session: &str,
        topic: &str,
        record: MemoryRecord,
    ) -> Result<(), MemoryError>;

    /// 登记一条 Tier-0 原始记录引用
    async fn append_raw_ref(&self, session: &str, raw: RawRef) -> Result<(), MemoryError>;
}

#[derive(Default)]
struct SessionMemory {
    insights: HashMap<String, String>,
    contributor_digests: HashMap<String, Vec<MemoryRecord>>,
    topic_digests: HashMap<String, Vec<MemoryRecord>>,
    raw_refs: HashMap<String, Vec<RawRef>>,
}

/// 内存实现（测试与单进程运行）
#[derive(Default)]
pub struct InMemoryMemoryStore {
    sessions: RwLock<HashMap<String, SessionMemory>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn load_insights(&self, session: &str) -> Result<Vec<(String, String)>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(mem) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        // 固定文件名、固定顺序
        Ok(INSIGHT_FILES
            .iter()
            .filter_map(|name| {
                mem.insights
                    .get(*name)
                    .map(|content| (name.to_string(), content.clone()))
            })
            .collect())
    }

    async fn load_contributor_digests(
        &self,
        session: &str,
        exclude: &str,
    ) -> Result<Vec<(String, String)>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(mem) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        let mut contributors: Vec<_> = mem
            .contributor_digests
            .iter()
            .filter(|(contributor, _)| contributor.as_str() != exclude)
            .collect();
        contributors.sort_by(|a, b| a.0.cmp(b.0));
        Ok(contributors
            .into_iter()
            .map(|(contributor, records)| {
                let rendered = records
                    .iter()
                    .map(|r| r.render())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                (contributor.clone(), rendered)
            })
            .collect())
    }

    async fn load_topic_digests(&self, session: &str) -> Result<Vec<(String, String)>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(mem) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        let mut topics: Vec<_> = mem.topic_digests.iter().collect();
        topics.sort_by(|a, b| a.0.cmp(b.0));
        Ok(topics
            .into_iter()
            .map(|(topic, records)| {
                let rendered = records
                    .iter()
                    .map(|r| r.render())
                    .collect::<Vec<_>>()
                    .join("\n---\n");
                (topic.clone(), rendered)
            })
            .collect())
    }

    async fn raw_refs(&self, session: &str) -> Result<Vec<RawRef>, MemoryError> {
        let sessions = self.sessions.read().await;
        let Some(mem) = sessions.get(session) else {
            return Ok(Vec::new());
        };
        let mut refs = Vec::new();
        let mut contributors: Vec<_> = mem.raw_refs.iter().collect();
        contributors.sort_by(|a, b| a.0.cmp(b.0));
        for (_, items) in contributors {
            // 每贡献者取最近的 10 条
            let mut recent: Vec<_> = items.clone();
            recent.sort_by_key(|r| std::cmp::Reverse(r.created_at));
            refs.extend(recent.into_iter().take(MAX_RAW_REFS_PER_CONTRIBUTOR));
        }
        Ok(refs)
    }

    async fn append_digest(
        &self,
        session: &str,
        record: MemoryRecord,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let mem = sessions.entry(session.to_string()).or_default();
        mem.contributor_digests
            .entry(record.header.contributor.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn put_insight(
        &self,
        session: &str,
        name: &str,
        content: String,
    ) -> Result<(), MemoryError> {
        if !INSIGHT_FILES.contains(&name) {
            return Err(MemoryError::Store(format!(
                "Unknown insight file: {name}"
            )));
        }
        let mut sessions = self.sessions.write().await;
        let mem = sessions.entry(session.to_string()).or_default();
        mem.insights.insert(name.to_string(), content);
        Ok(())
    }

    async fn append_topic_digest(
        &self,
        session: &str,
        topic: &str,
        record: MemoryRecord,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let mem = sessions.entry(session.to_string()).or_default();
        mem.topic_digests
            .entry(topic.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn append_raw_ref(&self, session: &str, raw: RawRef) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let mem = sessions.entry(session.to_string()).or_default();
        mem.raw_refs
            .entry(raw.contributor.clone())
            .or_default()
            .push(raw);
        Ok(())
    }
}
