//! 策略预设
//!
//! 纯数据记录：只提供默认的预算与阈值，显式配置始终优先。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::archive::Budget;
use crate::scan::ScanOptions;

const MB: usize = 1024 * 1024;

/// 预设名称
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyPreset {
    /// 高风险上传：浅嵌套、低阈值、5MB 上限、fail-fast
    Strict,
    /// 通用生产默认值
    #[default]
    Balanced,
    /// 可信来源：不递归嵌套、高阈值、20MB 上限
    Fast,
}

/// 预设提供的数值
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresetValues {
    pub max_depth: usize,
    pub heuristic_threshold: u32,
    pub max_buffer_size: usize,
    pub fail_fast: bool,
    pub max_compression_ratio: f64,
}

impl PolicyPreset {
    pub const ALL: [PolicyPreset; 3] = [
        PolicyPreset::Strict,
        PolicyPreset::Balanced,
        PolicyPreset::Fast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyPreset::Strict => "strict",
            PolicyPreset::Balanced => "balanced",
            PolicyPreset::Fast => "fast",
        }
    }

    pub fn values(&self) -> PresetValues {
        match self {
            PolicyPreset::Strict => PresetValues {
                max_depth: 2,
                heuristic_threshold: 60,
                max_buffer_size: 5 * MB,
                fail_fast: true,
                max_compression_ratio: 100.0,
            },
            PolicyPreset::Balanced => PresetValues {
                max_depth: 4,
                heuristic_threshold: 75,
                max_buffer_size: 10 * MB,
                fail_fast: false,
                max_compression_ratio: 200.0,
            },
            PolicyPreset::Fast => PresetValues {
                max_depth: 1,
                heuristic_threshold: 85,
                max_buffer_size: 20 * MB,
                fail_fast: true,
                max_compression_ratio: 1000.0,
            },
        }
    }

    /// 展开为完整的扫描选项
    pub fn scan_options(&self) -> ScanOptions {
        let values = self.values();
        ScanOptions {
            fail_fast: values.fail_fast,
            max_depth: values.max_depth,
            heuristic_threshold: values.heuristic_threshold,
            max_buffer_size: values.max_buffer_size,
            use_stream_scanner: false,
            budget: Budget {
                max_depth: values.max_depth,
                max_compression_ratio: values.max_compression_ratio,
                ..Budget::default()
            },
        }
    }
}

impl fmt::Display for PolicyPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(PolicyPreset::Strict),
            "balanced" => Ok(PolicyPreset::Balanced),
            "fast" => Ok(PolicyPreset::Fast),
            other => Err(format!(
                "Invalid preset: {}. Valid presets: strict, balanced, fast",
                other
            )),
        }
    }
}
