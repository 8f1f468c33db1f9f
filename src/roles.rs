//! 工作者角色表
//!
//! 角色 id → 角色定义的静态表，启动时构建一次，不做运行时动态加载。
//! 未知角色一律回落到 generalist（分解降级时也用它）。

use std::collections::HashMap;

/// 降级与未知角色的兜底角色 id
pub const GENERALIST_ROLE: &str = "generalist";

/// 工作者角色：id、展示名与静态人格（Prompt 生成失败时的回退 system 文本）
#[derive(Debug, Clone)]
pub struct WorkerRole {
    pub id: String,
    pub name: String,
    pub persona: String,
}

impl WorkerRole {
    pub fn new(id: impl Into<String>, name: impl Into<String>, persona: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            persona: persona.into(),
        }
    }
}

/// 角色注册表
pub struct RoleRegistry {
    roles: HashMap<String, WorkerRole>,
}

impl RoleRegistry {
    /// 内置角色表
    pub fn builtin() -> Self {
        let mut roles = HashMap::new();
        for role in [
            WorkerRole::new(
                GENERALIST_ROLE,
                "通用执行者",
                "You are a capable generalist. Handle the assigned task end to end, \
                 state your findings clearly, and flag anything you are unsure about.",
            ),
            WorkerRole::new(
                "researcher",
                "调研员",
                "You are a meticulous researcher. Gather and verify relevant information, \
                 cite sources where possible, and separate facts from speculation.",
            ),
            WorkerRole::new(
                "analyst",
                "分析师",
                "You are a rigorous analyst. Break the problem down, weigh the evidence, \
                 and present conclusions with their supporting reasoning.",
            ),
            WorkerRole::new(
                "writer",
                "撰稿人",
                "You are a clear technical writer. Turn raw material into well-structured, \
                 readable prose for the intended audience.",
            ),
            WorkerRole::new(
                "reviewer",
                "评审员",
                "You are a critical reviewer. Check the work against the stated goal, \
                 point out gaps and inconsistencies, and suggest concrete fixes.",
            ),
        ] {
            roles.insert(role.id.clone(), role);
        }
        Self { roles }
    }

    /// 查角色；未知 id 回落到 generalist
    pub fn get(&self, id: &str) -> &WorkerRole {
        self.roles.get(id).unwrap_or_else(|| {
            self.roles
                .get(GENERALIST_ROLE)
                .expect("builtin table always contains the generalist role")
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roles.contains_key(id)
    }

    pub fn generalist(&self) -> &WorkerRole {
        self.get(GENERALIST_ROLE)
    }
}

impl Default for RoleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
