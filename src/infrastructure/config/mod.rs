//! 扫描配置
//!
//! 分层加载：
//! - 策略预设（`preset`）提供默认值
//! - 配置文件（TOML / JSON）覆盖预设
//! - `BLOBGUARD__*` 环境变量覆盖文件
//!
//! 显式值总是优先于预设值。

pub mod presets;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use validator::Validate;

use crate::detection::DetectorConfig;
use crate::error::{Result, ScanError};
use crate::models::Severity;
use crate::monitoring::LoggingConfig;
use crate::scan::ScanOptions;
use crate::scanners::{ComposeOptions, HeuristicsConfig};
use presets::PolicyPreset;

/// 环境变量前缀，层级分隔符为 `__`
pub const ENV_PREFIX: &str = "BLOBGUARD";

/// 配置根结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ScanConfig {
    #[serde(default)]
    pub preset: PolicyPreset,

    /// 覆盖预设的显式限制
    #[serde(default)]
    #[validate(nested)]
    pub limits: LimitOverrides,

    #[serde(default)]
    #[validate(nested)]
    pub compose: ComposeSettings,

    #[serde(default)]
    pub detector: DetectorConfig,

    /// `score_threshold` 仅在偏离默认值且未设置 `limits.heuristic_threshold` 时生效
    #[serde(default)]
    pub heuristics: HeuristicsConfig,

    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// 显式限制，`None` 表示沿用预设
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct LimitOverrides {
    pub fail_fast: Option<bool>,

    #[validate(range(max = 32))]
    pub max_depth: Option<usize>,

    #[validate(range(min = 1, max = 1000))]
    pub heuristic_threshold: Option<u32>,

    #[validate(range(min = 1))]
    pub max_buffer_size: Option<usize>,

    pub use_stream_scanner: Option<bool>,

    #[validate(range(min = 1))]
    pub max_entries: Option<u64>,

    #[validate(range(min = 1))]
    pub max_total_uncompressed: Option<u64>,

    #[validate(range(min = 1))]
    pub max_per_entry_uncompressed: Option<u64>,

    #[validate(range(exclusive_min = 1.0))]
    pub max_compression_ratio: Option<f64>,

    #[validate(range(min = 1))]
    pub max_entry_name_length: Option<usize>,
}

/// 组合扫描器设置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ComposeSettings {
    #[serde(default)]
    pub parallel: bool,

    #[serde(default)]
    pub stop_on: Option<Severity>,

    /// 单个扫描器超时（毫秒）
    #[validate(range(min = 1, max = 600000))]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub tag_source_name: bool,

    #[serde(default)]
    pub record_failures: bool,
}

impl ComposeSettings {
    pub fn to_options(&self) -> ComposeOptions {
        ComposeOptions {
            parallel: self.parallel,
            stop_on: self.stop_on,
            timeout_per_scanner: self.timeout_ms.map(Duration::from_millis),
            tag_source_name: self.tag_source_name,
            record_failures: self.record_failures,
            on_failure: None,
        }
    }
}

impl ScanConfig {
    /// 预设 + 显式覆盖 => 扫描选项
    pub fn scan_options(&self) -> Result<ScanOptions> {
        let mut options = self.preset.scan_options();
        let limits = &self.limits;

        if let Some(fail_fast) = limits.fail_fast {
            options.fail_fast = fail_fast;
        }
        if let Some(max_depth) = limits.max_depth {
            options.max_depth = max_depth;
            options.budget.max_depth = max_depth;
        }
        // 优先级：limits > heuristics 段（非默认值）> 预设
        if let Some(threshold) = limits.heuristic_threshold {
            options.heuristic_threshold = threshold;
        } else if self.heuristics.score_threshold != HeuristicsConfig::default().score_threshold {
            options.heuristic_threshold = self.heuristics.score_threshold;
        }
        if let Some(size) = limits.max_buffer_size {
            options.max_buffer_size = size;
        }
        if let Some(streaming) = limits.use_stream_scanner {
            options.use_stream_scanner = streaming;
        }
        if let Some(entries) = limits.max_entries {
            options.budget.max_entries = entries;
        }
        if let Some(total) = limits.max_total_uncompressed {
            options.budget.max_total_uncompressed = total;
        }
        if let Some(per_entry) = limits.max_per_entry_uncompressed {
            options.budget.max_per_entry_uncompressed = per_entry;
        }
        if let Some(ratio) = limits.max_compression_ratio {
            options.budget.max_compression_ratio = ratio;
        }
        if let Some(length) = limits.max_entry_name_length {
            options.budget.max_entry_name_length = length;
        }

        options.validate()?;
        Ok(options)
    }

    /// 导出为 TOML，可直接作为配置文件模板
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ScanError::config_error(e.to_string()))
    }
}

/// 配置加载器
#[derive(Debug, Clone, Default)]
pub struct ScanConfigLoader {
    path: Option<PathBuf>,
    env: Option<HashMap<String, String>>,
}

impl ScanConfigLoader {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path, env: None }
    }

    /// 从文件（可选）和进程环境加载并验证
    pub fn load(path: Option<PathBuf>) -> Result<ScanConfig> {
        Self::new(path).build()
    }

    /// 用给定的键值代替进程环境
    pub fn with_env_source(mut self, vars: HashMap<String, String>) -> Self {
        self.env = Some(vars);
        self
    }

    pub fn build(&self) -> Result<ScanConfig> {
        let mut builder = Config::builder();

        if let Some(path) = &self.path {
            if path.exists() {
                info!(path = %path.display(), "Loading scan config");
                builder = builder.add_source(File::from(path.as_path()));
            } else {
                warn!(path = %path.display(), "Config file not found, using preset defaults");
            }
        }

        let mut env = Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        if let Some(vars) = &self.env {
            env = env.source(Some(vars.clone().into_iter().collect()));
        }
        builder = builder.add_source(env);

        let config: ScanConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        config.scan_options()?;
        Ok(config)
    }
}
