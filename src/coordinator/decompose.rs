//! 任务分解
//!
//! 一次补全调用要求模型输出 JSON：
//! `{"subtasks":[{id,description,role,priority,dependencies:[]}],
//!   "executionOrder":[[ids...]], "estimatedMinutes":n}`。
//! 解析取首个 `{` 到末个 `}` 之间的切片；JSON 损坏、字段缺失或枚举非法
//! 一律不抛错，降级为单子任务计划：整个任务交给 generalist，一个执行组。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::{
    BackendRouter, CompletionRequest, LlmClient, Message, RoutingRequest, TaskType,
};
use crate::parse::Parsed;
use crate::roles::{RoleRegistry, GENERALIST_ROLE};
use crate::scheduler::{PlanSpec, Priority, SubtaskSpec};

#[derive(Debug, Deserialize)]
struct DecompositionJson {
    #[serde(default)]
    subtasks: Vec<RawSubtask>,
    #[serde(default, rename = "executionOrder")]
    execution_order: Vec<Vec<String>>,
    #[serde(default, rename = "estimatedMinutes")]
    estimated_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawSubtask {
    id: String,
    description: String,
    #[serde(default)]
    role: String,
    priority: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// 任务分解器
pub struct Decomposer {
    llm: Arc<dyn LlmClient>,
    router: Arc<BackendRouter>,
    roles: Arc<RoleRegistry>,
}

impl Decomposer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        router: Arc<BackendRouter>,
        roles: Arc<RoleRegistry>,
    ) -> Self {
        Self { llm, router, roles }
    }

    /// 分解任务；任何失败降级为单子任务计划
    pub async fn decompose(
        &self,
        task: &str,
        context: &str,
        max_subtasks: usize,
    ) -> Parsed<PlanSpec> {
        let prompt = format!(
            "Decompose the task below into at most {max_subtasks} subtasks for a team of workers \
             (roles: researcher, analyst, writer, reviewer, generalist).\n\n\
             Task:\n{task}\n\nContext:\n{context}\n\n\
             Reply with a single JSON object:\n\
             {{\"subtasks\":[{{\"id\":\"t1\",\"description\":\"...\",\"role\":\"researcher\",\
             \"priority\":\"high\",\"dependencies\":[]}}],\
             \"executionOrder\":[[\"t1\"]],\"estimatedMinutes\":15}}"
        );

        let decision = self
            .router
            .route(&RoutingRequest::new(TaskType::Decomposition, task));
        let request = CompletionRequest::new(decision.backend_id, vec![Message::user(prompt)])
            .with_temperature(0.3);

        let response = match self.llm.complete(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("Decomposition call failed, using single-subtask plan: {}", e);
                return Parsed::degraded(fallback_spec(task), format!("decomposition call failed: {e}"));
            }
        };

        match parse_decomposition(&response.text, task, &self.roles, max_subtasks) {
            Ok(spec) => {
                tracing::info!(
                    subtasks = spec.subtasks.len(),
                    groups = spec.execution_groups.len(),
                    "Task decomposed"
                );
                Parsed::ok(spec)
            }
            Err(reason) => {
                tracing::warn!(%reason, "Decomposition unparsable, using single-subtask plan");
                Parsed::degraded(fallback_spec(task), reason)
            }
        }
    }
}

/// 降级计划：整个任务交给 generalist，一个执行组
pub fn fallback_spec(task: &str) -> PlanSpec {
    PlanSpec {
        task: task.to_string(),
        subtasks: vec![SubtaskSpec::new(task, GENERALIST_ROLE)],
        execution_groups: vec![vec![0]],
        estimated_minutes: None,
    }
}

/// 解析与校验分解响应；返回 Err(原因) 表示应降级
fn parse_decomposition(
    text: &str,
    task: &str,
    roles: &RoleRegistry,
    max_subtasks: usize,
) -> Result<PlanSpec, String> {
    let start = text.find('{').ok_or("no opening brace")?;
    let end = text.rfind('}').ok_or("no closing brace")?;
    if end < start {
        return Err("braces out of order".into());
    }
    let json: DecompositionJson = serde_json::from_str(&text[start..=end])
        .map_err(|e| format!("malformed JSON: {e}"))?;

    if json.subtasks.is_empty() {
        return Err("no subtasks declared".into());
    }
    if json.subtasks.len() > max_subtasks {
        return Err(format!(
            "{} subtasks exceeds limit {max_subtasks}",
            json.subtasks.len()
        ));
    }

    // 声明 id → 声明序号
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (i, sub) in json.subtasks.iter().enumerate() {
        if sub.id.is_empty() {
            return Err(format!("subtask {i} has empty id"));
        }
        if index_of.insert(sub.id.as_str(), i).is_some() {
            return Err(format!("duplicate subtask id `{}`", sub.id));
        }
    }

    let mut subtasks = Vec::with_capacity(json.subtasks.len());
    for (i, sub) in json.subtasks.iter().enumerate() {
        if sub.description.trim().is_empty() {
            return Err(format!("subtask `{}` has empty description", sub.id));
        }
        let priority = Priority::from_name(&sub.priority)
            .ok_or_else(|| format!("unknown priority `{}`", sub.priority))?;
        // 未知角色回落 generalist，而不是整体降级
        let role = if roles.contains(&sub.role) {
            sub.role.clone()
        } else {
            tracing::warn!(role = %sub.role, "Unknown role in decomposition, using generalist");
            GENERALIST_ROLE.to_string()
        };
        let mut depends_on = Vec::with_capacity(sub.dependencies.len());
        for dep in &sub.dependencies {
            let dep_index = *index_of
                .get(dep.as_str())
                .ok_or_else(|| format!("unknown dependency `{dep}`"))?;
            if dep_index == i {
                return Err(format!("subtask `{}` depends on itself", sub.id));
            }
            depends_on.push(dep_index);
        }
        subtasks.push(SubtaskSpec {
            description: sub.description.clone(),
            role,
            priority,
            depends_on,
            max_retries: 2,
            timeout_minutes: None,
        });
    }

    if json.execution_order.is_empty() {
        return Err("empty executionOrder".into());
    }
    let mut seen = vec![false; subtasks.len()];
    let mut execution_groups = Vec::with_capacity(json.execution_order.len());
    for group in &json.execution_order {
        let mut resolved = Vec::with_capacity(group.len());
        for id in group {
            let index = *index_of
                .get(id.as_str())
                .ok_or_else(|| format!("executionOrder references unknown id `{id}`"))?;
            if seen[index] {
                return Err(format!("subtask `{id}` appears in multiple groups"));
            }
            seen[index] = true;
            resolved.push(index);
        }
        execution_groups.push(resolved);
    }
    if seen.iter().any(|covered| !covered) {
        return Err("executionOrder does not cover all subtasks".into());
    }

    Ok(PlanSpec {
        task: task.to_string(),
        subtasks,
        execution_groups,
        estimated_minutes: json.estimated_minutes,
    })
}
