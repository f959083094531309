//! 数据模型模块
//!
//! finding、严重级别与扫描报告。

pub mod finding;
pub mod report;

pub use finding::{ArchiveFinding, ArchiveTag, Finding, Severity, Verdict};
pub use report::ScanReport;
