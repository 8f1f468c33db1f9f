//! 子任务执行流水线：预处理、Prompt 迭代与单子任务执行

pub mod preprocess;
pub mod prompt;
pub mod subtask;

pub use preprocess::{
    ContextPreprocessor, PreprocessConfig, PreprocessResult, Transform, CONFLICT_MARKER,
    GAP_MARKER,
};
pub use prompt::{
    parse_prompt_sections, parse_review, PromptCandidate, PromptPipeline, PromptPipelineConfig,
    ReviewScore, SYSTEM_SECTION, USER_SECTION,
};
pub use subtask::{PipelineError, SubtaskOutput, SubtaskPipeline, SubtaskRequest};
