//! 记忆层：分层存储（insights / digests / raw）与预算内检索

pub mod retriever;
pub mod store;

pub use retriever::{
    ContextEntry, ContextTier, MemoryRetriever, RetrievedContext, RetrieverConfig, TokenEstimator,
    CHARS_PER_TOKEN,
};
pub use store::{
    parse_sections, InMemoryMemoryStore, MemoryError, MemoryRecord, MemoryStore, RawRef,
    RecordHeader, RecordSections, INSIGHT_FILES,
};
