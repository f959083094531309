//! 归档炸弹预算
//!
//! 定义遍历嵌套压缩包时的资源上限：
//! - 条目数量
//! - 嵌套深度
//! - 累计解压字节数与单条目解压字节数
//! - 单条目压缩比
//! - 条目名称长度

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ArchiveFinding, ArchiveTag, Severity};

/// 压缩比只在解压出至少这么多字节后才参与判断，避免极小条目误报
pub const RATIO_CHECK_FLOOR: u64 = 1024;

/// 遍历预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// 整个遍历（含嵌套）允许的最大条目数
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,

    /// 最大嵌套深度（顶层归档深度为 0）
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// 累计解压字节上限
    #[serde(default = "default_max_total_uncompressed")]
    pub max_total_uncompressed: u64,

    /// 单条目解压字节上限
    #[serde(default = "default_max_per_entry_uncompressed")]
    pub max_per_entry_uncompressed: u64,

    /// 单条目压缩比上限（解压 / 压缩）
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: f64,

    /// 条目名称最大字符数
    #[serde(default = "default_max_entry_name_length")]
    pub max_entry_name_length: usize,
}

fn default_max_entries() -> u64 {
    1000
}

fn default_max_depth() -> usize {
    4
}

fn default_max_total_uncompressed() -> u64 {
    500 * 1024 * 1024 // 500MB
}

fn default_max_per_entry_uncompressed() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_max_compression_ratio() -> f64 {
    1000.0
}

fn default_max_entry_name_length() -> usize {
    255
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_depth: default_max_depth(),
            max_total_uncompressed: default_max_total_uncompressed(),
            max_per_entry_uncompressed: default_max_per_entry_uncompressed(),
            max_compression_ratio: default_max_compression_ratio(),
            max_entry_name_length: default_max_entry_name_length(),
        }
    }
}

impl Budget {
    /// 压缩比是否超限（低于 `RATIO_CHECK_FLOOR` 的解压量不判断）
    pub fn ratio_exceeded(&self, compressed: u64, uncompressed: u64) -> Option<f64> {
        if uncompressed < RATIO_CHECK_FLOOR {
            return None;
        }
        let ratio = calculate_compression_ratio(compressed, uncompressed);
        (ratio > self.max_compression_ratio).then_some(ratio)
    }

    /// 检查条目名称长度（按字符计）
    pub fn check_name(&self, name: &str) -> Result<(), BudgetExceeded> {
        let length = name.chars().count();
        if length > self.max_entry_name_length {
            return Err(BudgetExceeded::NameLength {
                entry: name.chars().take(64).collect(),
                length,
                limit: self.max_entry_name_length,
            });
        }
        Ok(())
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be positive".to_string());
        }

        if self.max_depth > 32 {
            return Err("max_depth must not exceed 32".to_string());
        }

        if self.max_total_uncompressed == 0 {
            return Err("max_total_uncompressed must be positive".to_string());
        }

        if self.max_per_entry_uncompressed == 0 {
            return Err("max_per_entry_uncompressed must be positive".to_string());
        }

        if self.max_per_entry_uncompressed > self.max_total_uncompressed {
            return Err("max_per_entry_uncompressed must not exceed max_total_uncompressed".to_string());
        }

        if self.max_compression_ratio.is_nan() || self.max_compression_ratio <= 1.0 {
            return Err("max_compression_ratio must be greater than 1".to_string());
        }

        if self.max_entry_name_length == 0 {
            return Err("max_entry_name_length must be positive".to_string());
        }

        Ok(())
    }
}

/// 计算压缩比
///
/// - 压缩大小为 0 且解压大小非 0：返回 `f64::INFINITY`
/// - 解压大小为 0：返回 0.0
pub fn calculate_compression_ratio(compressed_size: u64, uncompressed_size: u64) -> f64 {
    if uncompressed_size == 0 {
        return 0.0;
    }
    if compressed_size == 0 {
        return f64::INFINITY;
    }
    uncompressed_size as f64 / compressed_size as f64
}

/// 单次顶层遍历的计数器，只增不减
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkCounters {
    entries: u64,
    total_uncompressed: u64,
}

impl WalkCounters {
    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn total_uncompressed(&self) -> u64 {
        self.total_uncompressed
    }

    /// 记录一个条目，超过上限时返回错误
    pub fn record_entry(&mut self, budget: &Budget) -> Result<(), BudgetExceeded> {
        self.entries += 1;
        if self.entries > budget.max_entries {
            return Err(BudgetExceeded::Entries {
                seen: self.entries,
                limit: budget.max_entries,
            });
        }
        Ok(())
    }

    /// 累加解压字节
    pub fn record_bytes(&mut self, bytes: u64, budget: &Budget) -> Result<(), BudgetExceeded> {
        self.total_uncompressed = self.total_uncompressed.saturating_add(bytes);
        if self.total_uncompressed > budget.max_total_uncompressed {
            return Err(BudgetExceeded::TotalSize {
                produced: self.total_uncompressed,
                limit: budget.max_total_uncompressed,
            });
        }
        Ok(())
    }
}

/// 预算超限
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BudgetExceeded {
    #[error("archive holds more than {limit} entries (seen {seen})")]
    Entries { seen: u64, limit: u64 },

    #[error("nested archive '{entry}' at depth {depth} exceeds max depth {limit}")]
    Depth {
        entry: String,
        depth: usize,
        limit: usize,
    },

    #[error("entry '{entry}' decompresses past {limit} bytes (reached {produced})")]
    EntrySize {
        entry: String,
        produced: u64,
        limit: u64,
    },

    #[error("total decompressed bytes {produced} exceed limit {limit}")]
    TotalSize { produced: u64, limit: u64 },

    #[error("entry '{entry}' compression ratio {ratio:.1} exceeds limit {limit:.1}")]
    Ratio { entry: String, ratio: f64, limit: f64 },

    #[error("entry name '{entry}...' is {length} characters long, limit {limit}")]
    NameLength {
        entry: String,
        length: usize,
        limit: usize,
    },
}

impl BudgetExceeded {
    pub fn tag(&self) -> ArchiveTag {
        match self {
            BudgetExceeded::Entries { .. } => ArchiveTag::BombEntries,
            BudgetExceeded::Depth { .. } => ArchiveTag::BombDepth,
            BudgetExceeded::EntrySize { .. } | BudgetExceeded::TotalSize { .. } => {
                ArchiveTag::BombSize
            }
            BudgetExceeded::Ratio { .. } => ArchiveTag::BombRatio,
            BudgetExceeded::NameLength { .. } => ArchiveTag::NameTooLong,
        }
    }

    /// 条目数、深度和名称长度超限为可疑；大小和压缩比超限为恶意
    pub fn severity(&self) -> Severity {
        match self {
            BudgetExceeded::Entries { .. }
            | BudgetExceeded::Depth { .. }
            | BudgetExceeded::NameLength { .. } => Severity::Suspicious,
            BudgetExceeded::EntrySize { .. }
            | BudgetExceeded::TotalSize { .. }
            | BudgetExceeded::Ratio { .. } => Severity::Malicious,
        }
    }

    pub fn entry(&self) -> Option<&str> {
        match self {
            BudgetExceeded::Depth { entry, .. }
            | BudgetExceeded::EntrySize { entry, .. }
            | BudgetExceeded::Ratio { entry, .. }
            | BudgetExceeded::NameLength { entry, .. } => Some(entry),
            BudgetExceeded::Entries { .. } | BudgetExceeded::TotalSize { .. } => None,
        }
    }

    pub fn to_finding(&self) -> ArchiveFinding {
        let finding = ArchiveFinding::new(self.tag(), self.severity(), self.to_string());
        match self.entry() {
            Some(entry) => finding.with_entry(entry),
            None => finding,
        }
    }
}
