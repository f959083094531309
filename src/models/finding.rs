//! Finding and severity types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered severity classification: `Clean < Suspicious < Malicious`.
///
/// The derived `Ord` follows declaration order, which is what the aggregator
/// and the `stop_on` policy rely on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Clean,
    Suspicious,
    Malicious,
}

/// The final verdict uses the same totally ordered set as finding severities.
pub type Verdict = Severity;

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Clean => "clean",
            Severity::Suspicious => "suspicious",
            Severity::Malicious => "malicious",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clean" => Ok(Severity::Clean),
            "suspicious" => Ok(Severity::Suspicious),
            "malicious" => Ok(Severity::Malicious),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// One structured signal produced by a scanner or a pre-filter component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Rule identifier, e.g. `zip_path_traversal` or `php_dangerous_func`
    pub rule: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Name of the scanner that produced the finding, when tagged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Finding {
    pub fn new(rule: impl Into<String>, severity: Severity) -> Self {
        Self {
            rule: rule.into(),
            severity,
            tags: Vec::new(),
            source: None,
            metadata: None,
        }
    }

    pub fn suspicious(rule: impl Into<String>) -> Self {
        Self::new(rule, Severity::Suspicious)
    }

    pub fn malicious(rule: impl Into<String>) -> Self {
        Self::new(rule, Severity::Malicious)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Tag of an archive-level structural or budget finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveTag {
    Traversal,
    Symlink,
    #[serde(rename = "lfhMismatch")]
    LfhMismatch,
    BombEntries,
    BombDepth,
    BombSize,
    BombRatio,
    NameTooLong,
    EocdNotFound,
    CdOutOfBounds,
    CdTruncated,
}

impl ArchiveTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveTag::Traversal => "traversal",
            ArchiveTag::Symlink => "symlink",
            ArchiveTag::LfhMismatch => "lfhMismatch",
            ArchiveTag::BombEntries => "bomb-entries",
            ArchiveTag::BombDepth => "bomb-depth",
            ArchiveTag::BombSize => "bomb-size",
            ArchiveTag::BombRatio => "bomb-ratio",
            ArchiveTag::NameTooLong => "name-too-long",
            ArchiveTag::EocdNotFound => "eocd-not-found",
            ArchiveTag::CdOutOfBounds => "cd-out-of-bounds",
            ArchiveTag::CdTruncated => "cd-truncated",
        }
    }

    /// Rule name used when the archive finding is merged into the report.
    pub fn rule(&self) -> &'static str {
        match self {
            ArchiveTag::Traversal => "zip_path_traversal",
            ArchiveTag::Symlink => "zip_symlink_entry",
            ArchiveTag::LfhMismatch => "zip_lfh_cen_mismatch",
            ArchiveTag::BombEntries => "zip_too_many_entries",
            ArchiveTag::BombDepth => "zip_nesting_too_deep",
            ArchiveTag::BombSize => "zip_uncompressed_too_large",
            ArchiveTag::BombRatio => "zip_suspicious_ratio",
            ArchiveTag::NameTooLong => "zip_entry_name_too_long",
            ArchiveTag::EocdNotFound => "zip_eocd_not_found",
            ArchiveTag::CdOutOfBounds => "zip_cd_out_of_bounds",
            ArchiveTag::CdTruncated => "zip_cd_truncated",
        }
    }
}

impl fmt::Display for ArchiveTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structural anomaly or budget violation found in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFinding {
    pub tag: ArchiveTag,
    pub severity: Severity,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl ArchiveFinding {
    pub fn new(tag: ArchiveTag, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            tag,
            severity,
            detail: detail.into(),
            entry: None,
        }
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }
}

impl From<ArchiveFinding> for Finding {
    fn from(finding: ArchiveFinding) -> Self {
        let mut metadata = serde_json::json!({ "detail": finding.detail });
        if let Some(entry) = &finding.entry {
            metadata["entry"] = serde_json::Value::String(entry.clone());
        }
        Finding::new(finding.tag.rule(), finding.severity)
            .with_tags(["zip", finding.tag.as_str()])
            .with_metadata(metadata)
    }
}
