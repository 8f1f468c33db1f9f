//! 计划与子任务类型
//!
//! Subtask 状态机：pending →(claim)→ in_progress →(complete)→ completed；
//! in_progress →(fail，有剩余重试)→ pending；in_progress →(fail，重试耗尽)→ failed。
//! 不存在其他迁移路径。状态只由 DagScheduler 改写。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type PlanId = String;
pub type SubtaskId = String;

/// 子任务优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    /// 供分解 JSON 校验；未知名字返回 None
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// 子任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// 等待执行（依赖是否满足在读取时过滤，不单设 blocked 状态）
    Pending,
    /// 已被认领，正在执行
    InProgress,
    /// 已完成
    Completed,
    /// 失败（终态）
    Failed,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Failed)
    }
}

/// 计划状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Draft,
    Active,
}

/// 子任务声明（激活前，依赖用声明序号表示，因为 id 尚不存在）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub description: String,
    pub role: String,
    pub priority: Priority,
    /// 依赖的声明序号
    pub depends_on: Vec<usize>,
    pub max_retries: u32,
    /// 建议性超时（分钟）；Coordinator 不强制
    pub timeout_minutes: Option<u32>,
}

impl SubtaskSpec {
    pub fn new(description: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            role: role.into(),
            priority: Priority::Medium,
            depends_on: Vec::new(),
            max_retries: 2,
            timeout_minutes: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, indices: Vec<usize>) -> Self {
        self.depends_on = indices;
        self
    }
}

/// 计划声明：任务文本 + 子任务声明 + 并行组划分（同样用声明序号）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    pub task: String,
    pub subtasks: Vec<SubtaskSpec>,
    pub execution_groups: Vec<Vec<usize>>,
    pub estimated_minutes: Option<u32>,
}

/// 持久化的子任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub description: String,
    pub role: String,
    pub priority: Priority,
    pub depends_on: Vec<SubtaskId>,
    pub status: SubtaskStatus,
    pub claimant: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_minutes: Option<u32>,
    /// 上游完成时累积进来的输出引用（只追加，不替换）
    pub input_refs: Vec<String>,
    pub output: Option<String>,
    pub output_refs: Vec<String>,
    /// 完成时从输出中抽取的发现，随计划持久化
    pub findings: Vec<String>,
    /// 错误注记（重试历史）
    pub errors: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// 计划：子任务的有序集合 + 并行组划分
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub version: u32,
    pub task: String,
    pub subtasks: Vec<Subtask>,
    pub groups: Vec<Vec<SubtaskId>>,
    pub status: PlanStatus,
    pub estimated_minutes: Option<u32>,
    pub created_at: i64,
}

impl Plan {
    pub fn subtask(&self, id: &str) -> Option<&Subtask> {
        self.subtasks.iter().find(|s| s.id == id)
    }

    pub(crate) fn subtask_mut(&mut self, id: &str) -> Option<&mut Subtask> {
        self.subtasks.iter_mut().find(|s| s.id == id)
    }
}

/// 计划进度快照
#[derive(Debug, Clone, Default)]
pub struct PlanProgress {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    /// completed / total，total 为 0 时取 0
    pub progress: f64,
    /// 角色 → 其正在执行的子任务
    pub active_by_role: HashMap<String, Vec<SubtaskId>>,
}
