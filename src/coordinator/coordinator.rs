//! 协同器
//!
//! 整个协同回合的驱动方：分解 → 激活计划 → 按执行组推进 → 汇总。
//! 组是严格屏障：join_all 等本组全部成员到达终态才进入下一组。
//! 成员失败互相隔离，某个子任务终态失败不会中断同组其他成员，也不会
//! 阻止汇总；只有汇总调用本身失败才向调用方报错。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use thiserror::Error;

use crate::coordinator::decompose::Decomposer;
use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, LlmError, Message, RoutingRequest, TaskType,
};
use crate::pipeline::subtask::{SubtaskOutput, SubtaskPipeline, SubtaskRequest};
use crate::roles::RoleRegistry;
use crate::scheduler::{DagScheduler, Plan, SchedulerError, SubtaskId, SubtaskStatus};

/// 协同错误
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Synthesis failed: {0}")]
    Synthesis(LlmError),
}

/// 协同配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// 分解产出的子任务上限
    pub max_subtasks: usize,
    /// 依赖输出注入下游时的截断长度（字符）
    pub dep_excerpt_chars: usize,
    /// 汇总时每个子任务输出的截断长度（字符）
    pub summary_excerpt_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_subtasks: 5,
            dep_excerpt_chars: 800,
            summary_excerpt_chars: 600,
        }
    }
}

/// 一个协同回合的结果
#[derive(Debug, Clone)]
pub struct CoordinationResult {
    pub task: String,
    pub plan_id: String,
    /// 回合结束时的子任务终态快照
    pub subtasks: Vec<crate::scheduler::Subtask>,
    pub synthesis: String,
    /// 仅统计成功子任务
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub duration_ms: u64,
    pub outputs: HashMap<SubtaskId, SubtaskOutput>,
}

/// 协同器
pub struct Coordinator {
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    scheduler: Arc<DagScheduler>,
    pipeline: Arc<SubtaskPipeline>,
    decomposer: Decomposer,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        scheduler: Arc<DagScheduler>,
        pipeline: Arc<SubtaskPipeline>,
        roles: Arc<RoleRegistry>,
        config: CoordinatorConfig,
    ) -> Self {
        let decomposer = Decomposer::new(llm.clone(), router.clone(), roles);
        Self {
            llm,
            router,
            scheduler,
            pipeline,
            decomposer,
            config,
        }
    }

    /// 执行一个完整协同回合
    pub async fn coordinate(
        &self,
        session: &str,
        task: &str,
        context: &str,
    ) -> Result<CoordinationResult, CoordinatorError> {
        let start = Instant::now();
        let parsed = self
            .decomposer
            .decompose(task, context, self.config.max_subtasks)
            .await;
        if let Some(reason) = &parsed.degraded {
            tracing::warn!(%reason, "Coordinating with degraded plan");
        }
        let plan = self.scheduler.activate_plan(parsed.value).await?;

        let mut outputs: HashMap<SubtaskId, SubtaskOutput> = HashMap::new();
        for (group_index, group) in plan.groups.iter().enumerate() {
            tracing::info!(
                plan = %plan.id,
                group = group_index,
                members = group.len(),
                "Execution group started"
            );
            // 组内成员只依赖先前组的输出，开组时的快照对全组有效
            let snapshot = outputs.clone();
            let futures = group
                .iter()
                .map(|id| self.run_subtask(session, &plan.id, id, &snapshot));
            for result in join_all(futures).await {
                let (id, output) = result?;
                if let Some(output) = output {
                    outputs.insert(id, output);
                }
            }
        }

        let plan = self.scheduler.get_plan(&plan.id).await?;
        let synthesis = self
            .synthesize(task, &plan, &outputs)
            .await
            .map_err(CoordinatorError::Synthesis)?;

        let prompt_tokens = outputs.values().map(|o| o.prompt_tokens).sum();
        let completion_tokens = outputs.values().map(|o| o.completion_tokens).sum();
        let result = CoordinationResult {
            task: task.to_string(),
            plan_id: plan.id.clone(),
            subtasks: plan.subtasks,
            synthesis,
            prompt_tokens,
            completion_tokens,
            duration_ms: start.elapsed().as_millis() as u64,
            outputs,
        };
        tracing::info!(
            plan = %result.plan_id,
            completed = result.outputs.len(),
            total = result.subtasks.len(),
            duration_ms = result.duration_ms,
            "Coordination round finished"
        );
        Ok(result)
    }

    /// 推进单个子任务直到终态；组内重试在本组屏障内完成
    async fn run_subtask(
        &self,
        session: &str,
        plan_id: &str,
        subtask_id: &str,
        prior_outputs: &HashMap<SubtaskId, SubtaskOutput>,
    ) -> Result<(SubtaskId, Option<SubtaskOutput>), SchedulerError> {
        loop {
            let plan = self.scheduler.get_plan(plan_id).await?;
            let subtask = plan
                .subtask(subtask_id)
                .ok_or_else(|| SchedulerError::SubtaskNotFound(subtask_id.to_string()))?
                .clone();
            self.scheduler
                .claim(plan_id, subtask_id, &subtask.role)
                .await?;

            // 计划可能带错排的执行组，执行前复核依赖
            if !self.scheduler.deps_completed(plan_id, subtask_id).await? {
                tracing::warn!(subtask = %subtask_id, "Dependencies not completed, failing subtask");
                self.scheduler
                    .fail(
                        plan_id,
                        subtask_id,
                        "dependencies not completed".into(),
                        false,
                    )
                    .await?;
                return Ok((subtask_id.to_string(), None));
            }

            let request = SubtaskRequest {
                subtask_id: subtask.id.clone(),
                description: subtask.description.clone(),
                role_id: subtask.role.clone(),
                dependency_context: self.dependency_context(&subtask.depends_on, prior_outputs),
                special_instructions: String::new(),
            };
            match self.pipeline.execute(session, &request).await {
                Ok(output) => {
                    self.scheduler
                        .complete(
                            plan_id,
                            subtask_id,
                            output.text.clone(),
                            output.refs.clone(),
                            output.findings.clone(),
                        )
                        .await?;
                    return Ok((subtask_id.to_string(), Some(output)));
                }
                Err(e) => {
                    let status = self
                        .scheduler
                        .fail(plan_id, subtask_id, e.to_string(), true)
                        .await?;
                    if status == SubtaskStatus::Pending {
                        continue;
                    }
                    return Ok((subtask_id.to_string(), None));
                }
            }
        }
    }

    /// 拼接已完成依赖的截断输出，按生产者 id 标注
    fn dependency_context(
        &self,
        depends_on: &[SubtaskId],
        outputs: &HashMap<SubtaskId, SubtaskOutput>,
    ) -> String {
        let mut blocks = Vec::new();
        for dep in depends_on {
            if let Some(output) = outputs.get(dep) {
                blocks.push(format!(
                    "[from {dep}]\n{}",
                    truncate(&output.text, self.config.dep_excerpt_chars)
                ));
            }
        }
        blocks.join("\n\n")
    }

    /// 汇总：对成功子任务的摘要做一次补全调用；失败子任务直接略过。
    /// 调用失败向上传播，没有降级产物可用。
    async fn synthesize(
        &self,
        task: &str,
        plan: &Plan,
        outputs: &HashMap<SubtaskId, SubtaskOutput>,
    ) -> Result<String, LlmError> {
        let mut blocks = Vec::new();
        for subtask in &plan.subtasks {
            let Some(output) = outputs.get(&subtask.id) else {
                continue;
            };
            let mut block = format!("### {}\n", subtask.description);
            if !output.findings.is_empty() {
                block.push_str(&format!("Findings: {}\n", output.findings.join("; ")));
            }
            if !output.uncertainties.is_empty() {
                block.push_str(&format!(
                    "Uncertainties: {}\n",
                    output.uncertainties.join("; ")
                ));
            }
            block.push_str(&truncate(&output.text, self.config.summary_excerpt_chars));
            blocks.push(block);
        }

        let prompt = format!(
            "Synthesize the subtask results below into a single coherent answer \
             to the original task. Note open uncertainties.\n\n\
             Task:\n{task}\n\nSubtask results:\n{}",
            blocks.join("\n\n")
        );
        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::Synthesis, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)]);
        let response = self.llm.complete(&request).await?;
        Ok(response.text)
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        text.to_string()
    } else {
        let cut: String = text.chars().take(limit).collect();
        format!("{cut}…")
    }
}
