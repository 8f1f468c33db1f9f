//! 宽容解析结果
//!
//! 模型输出的解析（分解 JSON、评审分数、Prompt 分节标记）从不抛错：
//! 失败时降级到文档化的安全默认值，并携带降级原因供日志与测试使用。

/// 解析结果：value 始终可用，degraded 记录降级原因（None 表示正常解析）
#[derive(Debug, Clone)]
pub struct Parsed<T> {
    pub value: T,
    pub degraded: Option<String>,
}

impl<T> Parsed<T> {
    /// 正常解析
    pub fn ok(value: T) -> Self {
        Self {
            value,
            degraded: None,
        }
    }

    /// 解析失败，使用默认值并记录原因
    pub fn degraded(value: T, reason: impl Into<String>) -> Self {
        Self {
            value,
            degraded: Some(reason.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}
