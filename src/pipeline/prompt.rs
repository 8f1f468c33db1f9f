//! Prompt 流水线：generate → review → refine 迭代
//!
//! generate 产出 system/user 文本对（响应缺少分节标记时回退为角色静态
//! 人格 + 原始响应）；review 按 5 个独立维度各 0–10 打分，总分达到阈值
//! 即通过；未通过且还有迭代额度时 refine 重写文本对再回到 review。
//! 到达 max_iterations 后无论通过与否都返回最后一个候选——低分从不
//! 作为错误抛出。完整打分历史保留在候选上供观测。

use std::sync::Arc;

use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, LlmError, Message, RoutingRequest, TaskType,
};
use crate::parse::Parsed;
use crate::roles::WorkerRole;

/// generate/refine 响应中的分节标记
pub const SYSTEM_SECTION: &str = "[SYSTEM PROMPT]";
pub const USER_SECTION: &str = "[USER PROMPT]";

/// 单维度满分
const DIMENSION_MAX: u8 = 10;

/// 一轮评审的打分
#[derive(Debug, Clone)]
pub struct ReviewScore {
    pub role_consistency: u8,
    pub task_clarity: u8,
    pub output_format: u8,
    pub context_utilization: u8,
    pub safety: u8,
    pub total: u8,
    pub passed: bool,
}

impl ReviewScore {
    fn from_dimensions(dims: [u8; 5], threshold: u8) -> Self {
        let total = dims.iter().map(|d| *d as u16).sum::<u16>() as u8;
        Self {
            role_consistency: dims[0],
            task_clarity: dims[1],
            output_format: dims[2],
            context_utilization: dims[3],
            safety: dims[4],
            total,
            passed: total >= threshold,
        }
    }
}

/// Prompt 候选：文本对 + 迭代数 + 打分历史
#[derive(Debug, Clone)]
pub struct PromptCandidate {
    pub system: String,
    pub user: String,
    pub iterations: u32,
    pub history: Vec<ReviewScore>,
}

impl PromptCandidate {
    pub fn final_score(&self) -> Option<&ReviewScore> {
        self.history.last()
    }
}

/// 流水线参数
#[derive(Debug, Clone)]
pub struct PromptPipelineConfig {
    /// 通过阈值（0–50 总分）
    pub pass_threshold: u8,
    pub max_iterations: u32,
}

impl Default for PromptPipelineConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 40,
            max_iterations: 3,
        }
    }
}

/// Prompt 流水线
pub struct PromptPipeline {
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    config: PromptPipelineConfig,
}

impl PromptPipeline {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        config: PromptPipelineConfig,
    ) -> Self {
        Self {
            llm,
            router,
            config,
        }
    }

    /// 为一个子任务产出经过评审的 prompt 对
    pub async fn run(
        &self,
        role: &WorkerRole,
        task: &str,
        context: &str,
        special_instructions: &str,
    ) -> Result<PromptCandidate, LlmError> {
        let (mut system, mut user) = self
            .generate(role, task, context, special_instructions)
            .await?;

        let max = self.config.max_iterations.max(1);
        let mut history: Vec<ReviewScore> = Vec::new();
        let mut iterations = 0u32;

        loop {
            iterations += 1;
            let score = self.review(role, task, &system, &user).await?;
            let passed = score.passed;
            tracing::debug!(
                iteration = iterations,
                total = score.total,
                passed,
                "Prompt review complete"
            );
            let feedback = Self::feedback_text(&score);
            history.push(score);

            if passed || iterations >= max {
                break;
            }

            let (next_system, next_user) = self.refine(role, task, &system, &user, &feedback).await?;
            system = next_system;
            user = next_user;
        }

        Ok(PromptCandidate {
            system,
            user,
            iterations,
            history,
        })
    }

    async fn generate(
        &self,
        role: &WorkerRole,
        task: &str,
        context: &str,
        special_instructions: &str,
    ) -> Result<(String, String), LlmError> {
        let prompt = format!(
            "Write an optimized prompt pair for the worker below.\n\n\
             Worker role: {} ({})\nPersona:\n{}\n\nTask:\n{}\n\nContext:\n{}\n\n\
             Special instructions:\n{}\n\n\
             Reply with exactly two labeled sections:\n{SYSTEM_SECTION}\n<system text>\n{USER_SECTION}\n<user text>",
            role.name, role.id, role.persona, task, context, special_instructions
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::PromptGeneration, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)]);
        let response = self.llm.complete(&request).await?;

        let parsed = parse_prompt_sections(&response.text);
        match parsed {
            Some((system, user)) => Ok((system, user)),
            None => {
                // 分节标记缺失：人格兜底 system，原始响应作 user
                tracing::warn!(role = %role.id, "Prompt sections missing, falling back to persona");
                Ok((role.persona.clone(), response.text))
            }
        }
    }

    async fn review(
        &self,
        role: &WorkerRole,
        task: &str,
        system: &str,
        user: &str,
    ) -> Result<ReviewScore, LlmError> {
        let prompt = format!(
            "Score this prompt pair for the `{}` worker on five dimensions, 0-10 each, \
             one per line as `<dimension>: <score>/10`:\n\
             role consistency, task clarity, output format, context utilization, safety.\n\n\
             Task:\n{}\n\nSystem prompt:\n{}\n\nUser prompt:\n{}",
            role.id, task, system, user
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::PromptReview, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)])
            .with_temperature(0.0);
        let response = self.llm.complete(&request).await?;

        let parsed = parse_review(&response.text, self.config.pass_threshold);
        if let Some(reason) = &parsed.degraded {
            tracing::warn!(%reason, "Review parse degraded");
        }
        Ok(parsed.value)
    }

    async fn refine(
        &self,
        role: &WorkerRole,
        task: &str,
        system: &str,
        user: &str,
        feedback: &str,
    ) -> Result<(String, String), LlmError> {
        let prompt = format!(
            "Rewrite this prompt pair for the `{}` worker using the review feedback.\n\n\
             Task:\n{}\n\nCurrent system prompt:\n{}\n\nCurrent user prompt:\n{}\n\n\
             Review feedback:\n{}\n\n\
             Reply with exactly two labeled sections:\n{SYSTEM_SECTION}\n<system text>\n{USER_SECTION}\n<user text>",
            role.id, task, system, user, feedback
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::PromptRefinement, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)]);
        let response = self.llm.complete(&request).await?;

        match parse_prompt_sections(&response.text) {
            Some(pair) => Ok(pair),
            None => {
                tracing::warn!(role = %role.id, "Refined sections missing, keeping prior system");
                Ok((system.to_string(), response.text))
            }
        }
    }

    fn feedback_text(score: &ReviewScore) -> String {
        format!(
            "role consistency: {}/10\ntask clarity: {}/10\noutput format: {}/10\n\
             context utilization: {}/10\nsafety: {}/10\ntotal: {}/50",
            score.role_consistency,
            score.task_clarity,
            score.output_format,
            score.context_utilization,
            score.safety,
            score.total
        )
    }
}

/// 从响应中切出 [SYSTEM PROMPT] / [USER PROMPT] 两节；任一缺失返回 None
pub fn parse_prompt_sections(text: &str) -> Option<(String, String)> {
    let sys_start = text.find(SYSTEM_SECTION)?;
    let user_start = text.find(USER_SECTION)?;
    if user_start < sys_start {
        return None;
    }
    let system = text[sys_start + SYSTEM_SECTION.len()..user_start]
        .trim()
        .to_string();
    let user = text[user_start + USER_SECTION.len()..].trim().to_string();
    if system.is_empty() || user.is_empty() {
        return None;
    }
    Some((system, user))
}

/// 评审解析：逐行找维度关键词与首个 1–2 位数字，夹取到 [0,10]。
/// 五个维度全部缺失视为整体解析失败，降级为通过分。
pub fn parse_review(text: &str, threshold: u8) -> Parsed<ReviewScore> {
    let mut dims: [Option<u8>; 5] = [None; 5];

    for line in text.lines() {
        let lower = line.to_lowercase();
        let slot = if lower.contains("role") {
            0
        } else if lower.contains("clarity") || lower.contains("task") {
            1
        } else if lower.contains("format") {
            2
        } else if lower.contains("context") {
            3
        } else if lower.contains("safety") {
            4
        } else {
            continue;
        };
        if dims[slot].is_some() {
            continue;
        }
        if let Some(value) = first_number(&lower) {
            dims[slot] = Some(value.min(DIMENSION_MAX));
        }
    }

    if dims.iter().all(Option::is_none) {
        // 完全解析失败：默认通过
        let mut score = ReviewScore::from_dimensions([8; 5], threshold);
        score.passed = true;
        return Parsed::degraded(score, "no review dimensions parsed");
    }

    let resolved = dims.map(|d| d.unwrap_or(0));
    Parsed::ok(ReviewScore::from_dimensions(resolved, threshold))
}

/// 行内首个 1–2 位数字
fn first_number(line: &str) -> Option<u8> {
    let mut digits = String::new();
    for c in line.chars() {
        if c.is_ascii_digit() {
            if digits.len() < 2 {
                digits.push(c);
            } else {
                break;
            }
        } else if !digits.is_empty() {
            break;
        }
    }
    digits.parse().ok()
}
