//! DAG 调度器
//!
//! 子任务生命周期的唯一写入方。activate_plan 把声明序号依赖解析为真实
//! id；claim / complete / fail 按状态机迁移；ready_tasks 返回依赖集全部
//! 完成的 pending 子任务（AND 语义）。状态误用（认领非 pending、引用
//! 未知 id）向调用方显式报错，因为那是调用方缺陷而非环境问题。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::scheduler::store::PlanStore;
use crate::scheduler::types::{
    Plan, PlanId, PlanProgress, PlanSpec, PlanStatus, Subtask, SubtaskId, SubtaskStatus,
};

/// 调度器错误
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Subtask not found: {0}")]
    SubtaskNotFound(SubtaskId),

    #[error("Invalid state for {subtask}: expected {expected}, was {actual:?}")]
    InvalidState {
        subtask: SubtaskId,
        expected: &'static str,
        actual: SubtaskStatus,
    },

    #[error("Invalid dependency index {index} (plan declares {count} subtasks)")]
    InvalidDependency { index: usize, count: usize },

    #[error("Store error: {0}")]
    Store(String),
}

/// DAG 调度器
pub struct DagScheduler {
    plans: RwLock<HashMap<PlanId, Plan>>,
    store: Arc<dyn PlanStore>,
}

impl DagScheduler {
    pub fn new(store: Arc<dyn PlanStore>) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// 激活计划：创建持久子任务，按声明顺序解析序号依赖，置为 active
    pub async fn activate_plan(&self, spec: PlanSpec) -> Result<Plan, SchedulerError> {
        let count = spec.subtasks.len();
        let now = chrono::Utc::now().timestamp_millis();

        // 先生成全部 id，再解析依赖
        let ids: Vec<SubtaskId> = (0..count)
            .map(|_| format!("st_{}", uuid::Uuid::new_v4()))
            .collect();

        let mut subtasks = Vec::with_capacity(count);
        for (index, decl) in spec.subtasks.into_iter().enumerate() {
            let mut depends_on = Vec::with_capacity(decl.depends_on.len());
            for dep in &decl.depends_on {
                if *dep >= count || *dep == index {
                    return Err(SchedulerError::InvalidDependency { index: *dep, count });
                }
                depends_on.push(ids[*dep].clone());
            }
            subtasks.push(Subtask {
                id: ids[index].clone(),
                description: decl.description,
                role: decl.role,
                priority: decl.priority,
                depends_on,
                status: SubtaskStatus::Pending,
                claimant: None,
                retry_count: 0,
                max_retries: decl.max_retries,
                timeout_minutes: decl.timeout_minutes,
                input_refs: Vec::new(),
                output: None,
                output_refs: Vec::new(),
                findings: Vec::new(),
                errors: Vec::new(),
                created_at: now,
                updated_at: now,
            });
        }

        let mut groups = Vec::with_capacity(spec.execution_groups.len());
        for group in &spec.execution_groups {
            let mut resolved = Vec::with_capacity(group.len());
            for index in group {
                if *index >= count {
                    return Err(SchedulerError::InvalidDependency {
                        index: *index,
                        count,
                    });
                }
                resolved.push(ids[*index].clone());
            }
            groups.push(resolved);
        }

        let plan = Plan {
            id: format!("plan_{}", uuid::Uuid::new_v4()),
            version: 1,
            task: spec.task,
            subtasks,
            groups,
            status: PlanStatus::Active,
            estimated_minutes: spec.estimated_minutes,
            created_at: now,
        };

        tracing::info!(
            plan = %plan.id,
            subtasks = plan.subtasks.len(),
            groups = plan.groups.len(),
            "Plan activated"
        );
        self.plans
            .write()
            .await
            .insert(plan.id.clone(), plan.clone());
        self.store.save(&plan).await?;
        Ok(plan)
    }

    /// 锁内变更 + 落盘
    async fn with_plan_mut<T>(
        &self,
        plan_id: &str,
        mutate: impl FnOnce(&mut Plan) -> Result<T, SchedulerError>,
    ) -> Result<T, SchedulerError> {
        let snapshot;
        let out;
        {
            let mut plans = self.plans.write().await;
            let plan = plans
                .get_mut(plan_id)
                .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))?;
            out = mutate(plan)?;
            snapshot = plan.clone();
        }
        self.store.save(&snapshot).await?;
        Ok(out)
    }

    /// 认领：pending → in_progress；认领者与指派角色不一致仅告警
    pub async fn claim(
        &self,
        plan_id: &str,
        subtask_id: &str,
        claimant: &str,
    ) -> Result<Subtask, SchedulerError> {
        let claimant = claimant.to_string();
        self.with_plan_mut(plan_id, move |plan| {
            let subtask = plan
                .subtask_mut(subtask_id)
                .ok_or_else(|| SchedulerError::SubtaskNotFound(subtask_id.to_string()))?;
            if subtask.status != SubtaskStatus::Pending {
                return Err(SchedulerError::InvalidState {
                    subtask: subtask.id.clone(),
                    expected: "pending",
                    actual: subtask.status,
                });
            }
            if claimant != subtask.role {
                tracing::warn!(
                    subtask = %subtask.id,
                    assigned = %subtask.role,
                    %claimant,
                    "Claimant differs from assigned role"
                );
            }
            subtask.status = SubtaskStatus::InProgress;
            subtask.claimant = Some(claimant);
            subtask.updated_at = chrono::Utc::now().timestamp_millis();
            Ok(subtask.clone())
        })
        .await
    }

    /// 完成：in_progress → completed；输出与发现随计划持久化，输出引用
    /// 累积到下游 input_refs，随后重评非终态子任务，返回依赖集刚刚齐备的
    /// 子任务 id
    pub async fn complete(
        &self,
        plan_id: &str,
        subtask_id: &str,
        output: String,
        output_refs: Vec<String>,
        findings: Vec<String>,
    ) -> Result<Vec<SubtaskId>, SchedulerError> {
        let newly = self
            .with_plan_mut(plan_id, move |plan| {
                let subtask = plan
                    .subtask_mut(subtask_id)
                    .ok_or_else(|| SchedulerError::SubtaskNotFound(subtask_id.to_string()))?;
                if subtask.status != SubtaskStatus::InProgress {
                    return Err(SchedulerError::InvalidState {
                        subtask: subtask.id.clone(),
                        expected: "in_progress",
                        actual: subtask.status,
                    });
                }
                subtask.status = SubtaskStatus::Completed;
                subtask.output = Some(output);
                subtask.output_refs = output_refs.clone();
                subtask.findings = findings;
                subtask.updated_at = chrono::Utc::now().timestamp_millis();

                // 输出引用只追加，不替换
                for dependent in plan.subtasks.iter_mut() {
                    if dependent.depends_on.iter().any(|d| d == subtask_id) {
                        dependent.input_refs.extend(output_refs.iter().cloned());
                    }
                }

                let completed: HashSet<&str> = plan
                    .subtasks
                    .iter()
                    .filter(|s| s.status == SubtaskStatus::Completed)
                    .map(|s| s.id.as_str())
                    .collect();
                let newly: Vec<SubtaskId> = plan
                    .subtasks
                    .iter()
                    .filter(|s| !s.status.is_terminal())
                    .filter(|s| s.depends_on.iter().any(|d| d == subtask_id))
                    .filter(|s| s.depends_on.iter().all(|d| completed.contains(d.as_str())))
                    .map(|s| s.id.clone())
                    .collect();
                Ok(newly)
            })
            .await?;

        if !newly.is_empty() {
            tracing::info!(plan = %plan_id, eligible = ?newly, "Dependents became eligible");
        }
        Ok(newly)
    }

    /// 失败：有剩余重试则回到 pending（清空认领者，错误入注记），否则终态 failed
    pub async fn fail(
        &self,
        plan_id: &str,
        subtask_id: &str,
        error: String,
        retry: bool,
    ) -> Result<SubtaskStatus, SchedulerError> {
        self.with_plan_mut(plan_id, move |plan| {
            let subtask = plan
                .subtask_mut(subtask_id)
                .ok_or_else(|| SchedulerError::SubtaskNotFound(subtask_id.to_string()))?;
            if subtask.status != SubtaskStatus::InProgress {
                return Err(SchedulerError::InvalidState {
                    subtask: subtask.id.clone(),
                    expected: "in_progress",
                    actual: subtask.status,
                });
            }
            subtask.retry_count += 1;
            subtask.errors.push(error);
            subtask.updated_at = chrono::Utc::now().timestamp_millis();
            if retry && subtask.retry_count < subtask.max_retries {
                subtask.status = SubtaskStatus::Pending;
                subtask.claimant = None;
                tracing::info!(
                    subtask = %subtask.id,
                    retry_count = subtask.retry_count,
                    "Subtask reverted to pending for retry"
                );
            } else {
                subtask.status = SubtaskStatus::Failed;
                tracing::warn!(subtask = %subtask.id, "Subtask failed terminally");
            }
            Ok(subtask.status)
        })
        .await
    }

    /// 就绪子任务：pending 且依赖集 ⊆ 已完成（AND 语义），按声明顺序
    pub async fn ready_tasks(&self, plan_id: &str) -> Result<Vec<Subtask>, SchedulerError> {
        let plans = self.plans.read().await;
        let plan = plans
            .get(plan_id)
            .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))?;
        let completed: HashSet<&str> = plan
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Completed)
            .map(|s| s.id.as_str())
            .collect();
        Ok(plan
            .subtasks
            .iter()
            .filter(|s| s.status == SubtaskStatus::Pending)
            .filter(|s| s.depends_on.iter().all(|d| completed.contains(d.as_str())))
            .cloned()
            .collect())
    }

    /// 某子任务的依赖是否全部完成（Coordinator 启动前复核用）
    pub async fn deps_completed(
        &self,
        plan_id: &str,
        subtask_id: &str,
    ) -> Result<bool, SchedulerError> {
        let plans = self.plans.read().await;
        let plan = plans
            .get(plan_id)
            .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))?;
        let subtask = plan
            .subtask(subtask_id)
            .ok_or_else(|| SchedulerError::SubtaskNotFound(subtask_id.to_string()))?;
        Ok(subtask.depends_on.iter().all(|d| {
            plan.subtask(d)
                .map(|s| s.status == SubtaskStatus::Completed)
                .unwrap_or(false)
        }))
    }

    /// 进度快照：各状态计数、按角色的当前活动与完成比
    pub async fn plan_status(&self, plan_id: &str) -> Result<PlanProgress, SchedulerError> {
        let plans = self.plans.read().await;
        let plan = plans
            .get(plan_id)
            .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))?;
        let mut progress = PlanProgress {
            total: plan.subtasks.len(),
            ..Default::default()
        };
        for subtask in &plan.subtasks {
            match subtask.status {
                SubtaskStatus::Pending => progress.pending += 1,
                SubtaskStatus::InProgress => {
                    progress.in_progress += 1;
                    progress
                        .active_by_role
                        .entry(subtask.role.clone())
                        .or_default()
                        .push(subtask.id.clone());
                }
                SubtaskStatus::Completed => progress.completed += 1,
                SubtaskStatus::Failed => progress.failed += 1,
            }
        }
        progress.progress = if progress.total == 0 {
            0.0
        } else {
            progress.completed as f64 / progress.total as f64
        };
        Ok(progress)
    }

    /// 计划快照
    pub async fn get_plan(&self, plan_id: &str) -> Result<Plan, SchedulerError> {
        let plans = self.plans.read().await;
        plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| SchedulerError::PlanNotFound(plan_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::store::InMemoryPlanStore;
    use crate::scheduler::types::SubtaskSpec;

    fn scheduler() -> DagScheduler {
        DagScheduler::new(Arc::new(InMemoryPlanStore::new()))
    }

    fn two_step_spec() -> PlanSpec {
        PlanSpec {
            task: "research then summarize".into(),
            subtasks: vec![
                SubtaskSpec::new("collect sources", "researcher"),
                SubtaskSpec::new("write summary", "writer").depends_on(vec![0]),
            ],
            execution_groups: vec![vec![0], vec![1]],
            estimated_minutes: Some(10),
        }
    }

    #[tokio::test]
    async fn test_activate_resolves_index_dependencies() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();

        assert_eq!(plan.status, PlanStatus::Active);
        assert_eq!(plan.subtasks.len(), 2);
        assert_eq!(plan.subtasks[1].depends_on, vec![plan.subtasks[0].id.clone()]);
        assert_eq!(plan.groups[0], vec![plan.subtasks[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_activate_rejects_out_of_range_dependency() {
        let s = scheduler();
        let spec = PlanSpec {
            task: "t".into(),
            subtasks: vec![SubtaskSpec::new("a", "researcher").depends_on(vec![5])],
            execution_groups: vec![vec![0]],
            estimated_minutes: None,
        };
        assert!(matches!(
            s.activate_plan(spec).await,
            Err(SchedulerError::InvalidDependency { index: 5, .. })
        ));
    }

    #[tokio::test]
    async fn test_ready_tasks_respects_dependencies() {
        // 场景 B：T1 无依赖，T2 依赖 T1
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();
        let t2 = plan.subtasks[1].id.clone();

        let ready = s.ready_tasks(&plan.id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, t1);

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        assert!(s.ready_tasks(&plan.id).await.unwrap().is_empty());

        s.complete(&plan.id, &t1, "done".into(), vec!["ref-1".into()], vec![])
            .await
            .unwrap();
        let ready = s.ready_tasks(&plan.id).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, t2);
    }

    #[tokio::test]
    async fn test_complete_persists_findings() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        s.complete(
            &plan.id,
            &t1,
            "done".into(),
            vec![],
            vec!["three sources found".into()],
        )
        .await
        .unwrap();

        let snapshot = s.get_plan(&plan.id).await.unwrap();
        let sub = snapshot.subtask(&t1).unwrap();
        assert_eq!(sub.findings, vec!["three sources found"]);
    }

    #[tokio::test]
    async fn test_complete_accumulates_input_refs() {
        let s = scheduler();
        let spec = PlanSpec {
            task: "t".into(),
            subtasks: vec![
                SubtaskSpec::new("a", "researcher"),
                SubtaskSpec::new("b", "researcher"),
                SubtaskSpec::new("c", "writer").depends_on(vec![0, 1]),
            ],
            execution_groups: vec![vec![0, 1], vec![2]],
            estimated_minutes: None,
        };
        let plan = s.activate_plan(spec).await.unwrap();
        let (a, b, c) = (
            plan.subtasks[0].id.clone(),
            plan.subtasks[1].id.clone(),
            plan.subtasks[2].id.clone(),
        );

        s.claim(&plan.id, &a, "researcher").await.unwrap();
        s.complete(&plan.id, &a, "out-a".into(), vec!["ref-a".into()], vec![])
            .await
            .unwrap();
        // b 未完成，c 还不就绪
        assert!(s.ready_tasks(&plan.id).await.unwrap().iter().all(|t| t.id != c));

        s.claim(&plan.id, &b, "researcher").await.unwrap();
        let newly = s
            .complete(&plan.id, &b, "out-b".into(), vec!["ref-b".into()], vec![])
            .await
            .unwrap();
        assert_eq!(newly, vec![c.clone()]);

        let snapshot = s.get_plan(&plan.id).await.unwrap();
        let csub = snapshot.subtask(&c).unwrap();
        // 两个上游的引用都累积了
        assert_eq!(csub.input_refs, vec!["ref-a", "ref-b"]);
    }

    #[tokio::test]
    async fn test_claim_requires_pending() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        let err = s.claim(&plan.id, &t1, "researcher").await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_complete_requires_in_progress() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        let err = s
            .complete(&plan.id, &t1, "x".into(), vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_fail_retries_then_terminal() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        // max_retries = 2：第一次失败回 pending，第二次终态
        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        let status = s
            .fail(&plan.id, &t1, "transient".into(), true)
            .await
            .unwrap();
        assert_eq!(status, SubtaskStatus::Pending);

        let snapshot = s.get_plan(&plan.id).await.unwrap();
        let sub = snapshot.subtask(&t1).unwrap();
        assert_eq!(sub.retry_count, 1);
        assert!(sub.claimant.is_none());
        assert_eq!(sub.errors, vec!["transient"]);

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        let status = s.fail(&plan.id, &t1, "again".into(), true).await.unwrap();
        assert_eq!(status, SubtaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_fail_without_retry_is_terminal() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        let status = s
            .fail(&plan.id, &t1, "unmet deps".into(), false)
            .await
            .unwrap();
        assert_eq!(status, SubtaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_plan_status_counts_and_progress() {
        let s = scheduler();
        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        let t1 = plan.subtasks[0].id.clone();

        let progress = s.plan_status(&plan.id).await.unwrap();
        assert_eq!(progress.total, 2);
        assert_eq!(progress.pending, 2);
        assert_eq!(progress.progress, 0.0);

        s.claim(&plan.id, &t1, "researcher").await.unwrap();
        let progress = s.plan_status(&plan.id).await.unwrap();
        assert_eq!(progress.in_progress, 1);
        assert_eq!(progress.active_by_role["researcher"], vec![t1.clone()]);

        s.complete(&plan.id, &t1, "done".into(), vec![], vec![])
            .await
            .unwrap();
        let progress = s.plan_status(&plan.id).await.unwrap();
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.progress, 0.5);
    }

    #[tokio::test]
    async fn test_unknown_ids_error() {
        let s = scheduler();
        assert!(matches!(
            s.ready_tasks("nope").await,
            Err(SchedulerError::PlanNotFound(_))
        ));

        let plan = s.activate_plan(two_step_spec()).await.unwrap();
        assert!(matches!(
            s.claim(&plan.id, "st_missing", "researcher").await,
            Err(SchedulerError::SubtaskNotFound(_))
        ));
    }
}
