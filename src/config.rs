//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示
//! 嵌套，如 `HIVE__RETRY__MAX_ATTEMPTS=3`）。各段通过 into_* 方法转成
//! 运行时参数结构，未知的 transform 名在转换时丢弃并告警。

use std::path::PathBuf;

use serde::Deserialize;

use crate::coordinator::CoordinatorConfig;
use crate::llm::RetryConfig;
use crate::memory::RetrieverConfig;
use crate::pipeline::preprocess::{PreprocessConfig, Transform};
use crate::pipeline::prompt::PromptPipelineConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub retry: RetrySection,
    pub router: RouterSection,
    pub memory: MemorySection,
    pub preprocess: PreprocessSection,
    pub prompt: PromptSection,
    pub coordinator: CoordinatorSection,
}

/// [retry] 段：退避基数与尝试上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_attempts: 5,
        }
    }
}

impl RetrySection {
    pub fn into_config(self) -> RetryConfig {
        RetryConfig {
            base_delay_ms: self.base_delay_ms,
            max_attempts: self.max_attempts,
        }
    }
}

/// [router] 段：默认后端与付费档开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    pub default_backend: String,
    pub premium_enabled: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            default_backend: "standard".to_string(),
            premium_enabled: false,
        }
    }
}

/// [memory] 段：检索预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub token_budget: usize,
    pub digest_floor: usize,
    pub semantic_search: bool,
    pub top_k: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            token_budget: 4000,
            digest_floor: 200,
            semantic_search: true,
            top_k: 3,
        }
    }
}

impl MemorySection {
    pub fn into_config(self) -> RetrieverConfig {
        RetrieverConfig {
            token_budget: self.token_budget,
            digest_floor: self.digest_floor,
            semantic_search: self.semantic_search,
            top_k: self.top_k,
        }
    }
}

/// [preprocess] 段：压缩下限与变换序列（按名字）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreprocessSection {
    pub token_floor: usize,
    pub transforms: Vec<String>,
}

impl Default for PreprocessSection {
    fn default() -> Self {
        Self {
            token_floor: 300,
            transforms: vec![
                "dedupe".into(),
                "noise_reduction".into(),
                "conflict_detection".into(),
                "gap_filling".into(),
            ],
        }
    }
}

impl PreprocessSection {
    pub fn into_config(self) -> PreprocessConfig {
        let transforms = self
            .transforms
            .iter()
            .filter_map(|name| {
                let t = Transform::from_name(name);
                if t.is_none() {
                    tracing::warn!(transform = %name, "Unknown preprocess transform ignored");
                }
                t
            })
            .collect();
        PreprocessConfig {
            token_floor: self.token_floor,
            transforms,
        }
    }
}

/// [prompt] 段：评审阈值与迭代上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptSection {
    pub pass_threshold: u8,
    pub max_iterations: u32,
}

impl Default for PromptSection {
    fn default() -> Self {
        Self {
            pass_threshold: 40,
            max_iterations: 3,
        }
    }
}

impl PromptSection {
    pub fn into_config(self) -> PromptPipelineConfig {
        PromptPipelineConfig {
            pass_threshold: self.pass_threshold,
            max_iterations: self.max_iterations,
        }
    }
}

/// [coordinator] 段：分解上限与截断长度
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorSection {
    pub max_subtasks: usize,
    pub dep_excerpt_chars: usize,
    pub summary_excerpt_chars: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        Self {
            max_subtasks: 5,
            dep_excerpt_chars: 800,
            summary_excerpt_chars: 600,
        }
    }
}

impl CoordinatorSection {
    pub fn into_config(self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_subtasks: self.max_subtasks,
            dep_excerpt_chars: self.dep_excerpt_chars,
            summary_excerpt_chars: self.summary_excerpt_chars,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.memory.token_budget, 4000);
        assert_eq!(cfg.prompt.pass_threshold, 40);
        assert_eq!(cfg.coordinator.max_subtasks, 5);
        assert_eq!(cfg.preprocess.transforms.len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[retry]\nmax_attempts = 3\n\n[router]\ndefault_backend = \"premium-pro\"\npremium_enabled = true\n\n[preprocess]\ntransforms = [\"dedupe\", \"bogus\"]"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert_eq!(cfg.router.default_backend, "premium-pro");
        assert!(cfg.router.premium_enabled);

        // 未知变换在转换时丢弃
        let pre = cfg.preprocess.into_config();
        assert_eq!(pre.transforms, vec![Transform::Dedupe]);
    }

    #[test]
    fn test_section_conversions() {
        let retry = RetrySection::default().into_config();
        assert_eq!(retry.base_delay_ms, 1000);
        let mem = MemorySection::default().into_config();
        assert_eq!(mem.digest_floor, 200);
        let prompt = PromptSection::default().into_config();
        assert_eq!(prompt.max_iterations, 3);
    }
}
