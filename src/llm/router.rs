//! 后端路由器
//!
//! 按层回答「这次请求该用哪个后端」：显式指定 → 模态要求（图片输入需
//! 视觉后端）→ 语言偏好（非默认文字占比 > 0.3 且任务类型非语言无关）→
//! 任务类型规则（主选，否则其声明的备选）→ 进程级默认后端。
//!
//! 候选仅在「id 已知（经别名解析）、成本档位不超过调用方上限、premium
//! 门控满足、凭证存在」时可用；全部不可用时回落到内置保底后端，因此
//! route() 永远返回一个可用后端。

use std::collections::HashMap;

/// 保底后端：构造时始终注册，保证 route() 必有结果
pub const SAFE_BACKEND: &str = "standard-lite";

/// 非默认文字占比阈值，超过则视为多语言文本
const LANGUAGE_RATIO_THRESHOLD: f64 = 0.3;

/// 请求的任务类型（用于路由规则与语言无关性判断）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 任务分解
    Decomposition,
    /// Prompt 生成
    PromptGeneration,
    /// Prompt 评审
    PromptReview,
    /// Prompt 改写
    PromptRefinement,
    /// 上下文语义排序
    ContextRanking,
    /// 上下文预处理
    Preprocessing,
    /// 子任务最终执行
    Execution,
    /// 结果综合
    Synthesis,
    /// 默认/未知
    Default,
}

impl TaskType {
    /// 语言无关任务不参与语言偏好路由（打分/排序类输出为数字与索引）
    pub fn is_language_agnostic(&self) -> bool {
        matches!(
            self,
            TaskType::PromptReview | TaskType::ContextRanking | TaskType::Preprocessing
        )
    }
}

/// 后端画像：成本档位、模态能力与门控
#[derive(Debug, Clone)]
pub struct BackendProfile {
    pub id: String,
    /// 成本档位（0 最便宜）
    pub cost_tier: u8,
    pub supports_vision: bool,
    /// 是否 premium 后端（需要全局开关放行）
    pub premium: bool,
    pub has_credential: bool,
}

impl BackendProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cost_tier: 1,
            supports_vision: false,
            premium: false,
            has_credential: true,
        }
    }

    pub fn with_cost_tier(mut self, tier: u8) -> Self {
        self.cost_tier = tier;
        self
    }

    pub fn with_vision(mut self) -> Self {
        self.supports_vision = true;
        self
    }

    pub fn with_premium(mut self) -> Self {
        self.premium = true;
        self
    }

    pub fn with_credential(mut self, present: bool) -> Self {
        self.has_credential = present;
        self
    }
}

/// 任务类型路由规则：主选后端与声明的备选
#[derive(Debug, Clone)]
pub struct TaskRoute {
    pub primary: String,
    pub fallback: Option<String>,
}

/// 一次路由请求
#[derive(Debug, Clone)]
pub struct RoutingRequest {
    pub task_type: TaskType,
    /// 显式指定的后端（最高优先级）
    pub override_backend: Option<String>,
    pub has_image_input: bool,
    /// 用于语言检测的文本样本
    pub text: String,
    /// 调用方可接受的成本档位上限
    pub cost_ceiling: u8,
}

impl RoutingRequest {
    pub fn new(task_type: TaskType, text: impl Into<String>) -> Self {
        Self {
            task_type,
            override_backend: None,
            has_image_input: false,
            text: text.into(),
            cost_ceiling: u8::MAX,
        }
    }

    pub fn with_override(mut self, backend: impl Into<String>) -> Self {
        self.override_backend = Some(backend.into());
        self
    }

    pub fn with_image_input(mut self) -> Self {
        self.has_image_input = true;
        self
    }

    pub fn with_cost_ceiling(mut self, ceiling: u8) -> Self {
        self.cost_ceiling = ceiling;
        self
    }
}

/// 路由结果：选中的后端、原因与备选
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub backend_id: String,
    pub reason: &'static str,
    pub fallback_id: Option<String>,
}

/// 后端路由器
pub struct BackendRouter {
    backends: HashMap<String, BackendProfile>,
    aliases: HashMap<String, String>,
    task_routes: HashMap<TaskType, TaskRoute>,
    /// 图片输入时优先的视觉后端
    vision_backend: Option<String>,
    /// 多语言文本偏好的后端
    language_backend: Option<String>,
    default_backend: String,
    premium_enabled: bool,
}

impl BackendRouter {
    pub fn new(default_backend: impl Into<String>, premium_enabled: bool) -> Self {
        let mut backends = HashMap::new();
        // 保底后端始终在册且无门控
        backends.insert(
            SAFE_BACKEND.to_string(),
            BackendProfile::new(SAFE_BACKEND).with_cost_tier(0),
        );
        Self {
            backends,
            aliases: HashMap::new(),
            task_routes: HashMap::new(),
            vision_backend: None,
            language_backend: None,
            default_backend: default_backend.into(),
            premium_enabled,
        }
    }

    pub fn add_backend(&mut self, profile: BackendProfile) {
        self.backends.insert(profile.id.clone(), profile);
    }

    pub fn add_alias(&mut self, alias: impl Into<String>, target: impl Into<String>) {
        self.aliases.insert(alias.into(), target.into());
    }

    pub fn set_task_route(&mut self, task: TaskType, primary: impl Into<String>, fallback: Option<String>) {
        self.task_routes.insert(
            task,
            TaskRoute {
                primary: primary.into(),
                fallback,
            },
        );
    }

    pub fn set_vision_backend(&mut self, backend: impl Into<String>) {
        self.vision_backend = Some(backend.into());
    }

    pub fn set_language_backend(&mut self, backend: impl Into<String>) {
        self.language_backend = Some(backend.into());
    }

    pub fn known(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    /// 别名解析 + 可用性检查，返回解析后的真实 id
    fn usable(&self, id: &str, cost_ceiling: u8) -> Option<String> {
        let resolved = self.aliases.get(id).map(String::as_str).unwrap_or(id);
        let profile = self.backends.get(resolved)?;
        if profile.cost_tier > cost_ceiling {
            return None;
        }
        if profile.premium && !self.premium_enabled {
            return None;
        }
        if !profile.has_credential {
            return None;
        }
        Some(resolved.to_string())
    }

    /// 非 ASCII 字符占比（空文本为 0）
    fn non_default_script_ratio(text: &str) -> f64 {
        let total = text.chars().count();
        if total == 0 {
            return 0.0;
        }
        let non_ascii = text.chars().filter(|c| !c.is_ascii()).count();
        non_ascii as f64 / total as f64
    }

    /// 逐层解析路由；永不失败
    pub fn route(&self, request: &RoutingRequest) -> RoutingDecision {
        // 1. 显式指定
        if let Some(id) = &request.override_backend {
            if let Some(resolved) = self.usable(id, request.cost_ceiling) {
                return self.decision(resolved, "override", request);
            }
            tracing::warn!(backend = %id, "Override backend not usable, falling through");
        }

        // 2. 模态要求：图片输入必须走视觉后端
        if request.has_image_input {
            let candidate = self
                .vision_backend
                .as_deref()
                .and_then(|id| self.usable(id, request.cost_ceiling))
                .filter(|id| self.backends[id].supports_vision)
                .or_else(|| {
                    // 未配置视觉后端时找任意可用的视觉后端
                    self.backends
                        .values()
                        .filter(|p| p.supports_vision)
                        .filter_map(|p| self.usable(&p.id, request.cost_ceiling))
                        .next()
                });
            if let Some(resolved) = candidate {
                return self.decision(resolved, "modality", request);
            }
        }

        // 3. 语言偏好
        if !request.task_type.is_language_agnostic()
            && Self::non_default_script_ratio(&request.text) > LANGUAGE_RATIO_THRESHOLD
        {
            if let Some(resolved) = self
                .language_backend
                .as_deref()
                .and_then(|id| self.usable(id, request.cost_ceiling))
            {
                return self.decision(resolved, "language", request);
            }
        }

        // 4. 任务类型规则：主选，否则其声明的备选
        if let Some(route) = self.task_routes.get(&request.task_type) {
            if let Some(resolved) = self.usable(&route.primary, request.cost_ceiling) {
                return RoutingDecision {
                    backend_id: resolved,
                    reason: "task-route",
                    fallback_id: route.fallback.clone(),
                };
            }
            if let Some(fb) = &route.fallback {
                if let Some(resolved) = self.usable(fb, request.cost_ceiling) {
                    return self.decision(resolved, "task-route-fallback", request);
                }
            }
        }

        // 5. 进程级默认
        if let Some(resolved) = self.usable(&self.default_backend, request.cost_ceiling) {
            return self.decision(resolved, "default", request);
        }

        // 6. 保底
        tracing::warn!(
            task = ?request.task_type,
            "No configured backend usable, using safe fallback"
        );
        RoutingDecision {
            backend_id: SAFE_BACKEND.to_string(),
            reason: "safe-fallback",
            fallback_id: None,
        }
    }

    fn decision(&self, backend_id: String, reason: &'static str, _request: &RoutingRequest) -> RoutingDecision {
        tracing::debug!(backend = %backend_id, reason, "Routed completion request");
        RoutingDecision {
            backend_id,
            reason,
            fallback_id: Some(self.default_backend.clone()),
        }
    }
}
