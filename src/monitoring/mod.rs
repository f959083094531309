/*!
 * 日志初始化
 *
 * 所有组件都通过 `tracing` 宏输出结构化字段；这里只负责安装订阅者。
 */
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use validator::{Validate, ValidationError};

use crate::error::{Result, ScanError};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LoggingConfig {
    /// EnvFilter 指令，例如 `info` 或 `blobguard=debug`
    #[serde(default = "default_level")]
    #[validate(length(min = 1, max = 500))]
    #[validate(custom(function = "validate_filter_directive"))]
    pub level: String,

    /// 输出 JSON 行而不是人类可读格式
    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_with_target")]
    pub with_target: bool,

    /// 设置了 RUST_LOG 时优先使用它
    #[serde(default = "default_prefer_env")]
    pub prefer_env: bool,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_prefer_env() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            with_target: default_with_target(),
            prefer_env: default_prefer_env(),
        }
    }
}

fn validate_filter_directive(level: &str) -> std::result::Result<(), ValidationError> {
    EnvFilter::try_new(level)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_filter_directive"))
}

impl LoggingConfig {
    fn filter(&self) -> Result<EnvFilter> {
        if self.prefer_env {
            if let Ok(filter) = EnvFilter::try_from_default_env() {
                return Ok(filter);
            }
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| ScanError::config_error(format!("invalid log filter '{}': {}", self.level, e)))
    }
}

/**
 * 安装全局 tracing 订阅者
 *
 * 重复调用无害：已有订阅者时返回 `Ok(false)`。
 */
pub fn init_tracing(config: &LoggingConfig) -> Result<bool> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    match installed {
        Ok(()) => {
            tracing::info!(level = %config.level, json = config.json, "Tracing initialized");
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}
