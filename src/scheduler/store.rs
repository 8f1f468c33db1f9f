//! 计划持久化
//!
//! DagScheduler 是唯一写入方：内存中的计划为权威状态，每次变更后整体
//! 落盘到 PlanStore。内存实现用于测试与单进程运行。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::scheduler::types::{Plan, PlanId};
use crate::scheduler::SchedulerError;

/// 计划持久化 trait
#[async_trait]
pub trait PlanStore: Send + Sync {
    /// 写入 / 覆盖整个计划
    async fn save(&self, plan: &Plan) -> Result<(), SchedulerError>;

    /// 读取计划
    async fn load(&self, id: &PlanId) -> Result<Option<Plan>, SchedulerError>;
}

/// 内存实现
#[derive(Default)]
pub struct InMemoryPlanStore {
    plans: RwLock<HashMap<PlanId, Plan>>,
}

impl InMemoryPlanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanStore for InMemoryPlanStore {
    async fn save(&self, plan: &Plan) -> Result<(), SchedulerError> {
        self.plans
            .write()
            .await
            .insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn load(&self, id: &PlanId) -> Result<Option<Plan>, SchedulerError> {
        Ok(self.plans.read().await.get(id).cloned())
    }
}
