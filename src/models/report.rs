//! 扫描报告
//!
//! 顶层扫描调用的唯一产物；生成后不可变。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::finding::{Finding, Severity, Verdict};

/// 单次扫描的最终报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// 扫描 ID（同时出现在 tracing span 中）
    pub scan_id: Uuid,
    /// 聚合后的最终判定
    pub verdict: Verdict,
    /// 所有来源的 finding（预过滤器 + 组合扫描器）
    pub findings: Vec<Finding>,
    /// 实际分析的字节数（受 max_buffer_size 限制）
    pub bytes_processed: u64,
    /// 扫描耗时（毫秒）
    pub duration_ms: u64,
    /// 已分析字节的 SHA-256（十六进制）
    pub sha256: String,
    /// 输入是否因超过字节上限而被截断
    pub truncated: bool,
    /// 检测到的格式名称（去重，按首次出现排序）
    pub formats: Vec<String>,
    /// 扫描完成时间
    pub scanned_at: DateTime<Utc>,
}

impl ScanReport {
    /// 判定是否为 clean
    pub fn is_clean(&self) -> bool {
        self.verdict == Severity::Clean
    }

    /// 按规则名查找 finding
    pub fn finding(&self, rule: &str) -> Option<&Finding> {
        self.findings.iter().find(|f| f.rule == rule)
    }

    /// 是否存在带指定标签的 finding
    pub fn has_tag(&self, tag: &str) -> bool {
        self.findings.iter().any(|f| f.tags.iter().any(|t| t == tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report(findings: Vec<Finding>, verdict: Verdict) -> ScanReport {
        ScanReport {
            scan_id: Uuid::new_v4(),
            verdict,
            findings,
            bytes_processed: 4,
            duration_ms: 1,
            sha256: String::new(),
            truncated: false,
            formats: vec!["zip".to_string()],
            scanned_at: Utc::now(),
        }
    }

    #[test]
    fn test_report_lookup_helpers() {
        let report = sample_report(
            vec![Finding::malicious("zip_path_traversal").with_tag("traversal")],
            Severity::Malicious,
        );
        assert!(!report.is_clean());
        assert!(report.finding("zip_path_traversal").is_some());
        assert!(report.has_tag("traversal"));
        assert!(!report.has_tag("symlink"));
    }

    #[test]
    fn test_report_serializes_verdict_lowercase() {
        let report = sample_report(Vec::new(), Severity::Clean);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["verdict"], "clean");
        assert_eq!(json["bytes_processed"], 4);
    }
}
