//! Format and polyglot detection
//!
//! Matches every registered signature inside a bounded prefix window and
//! derives a small set of suspicion reasons from the hits.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::signatures::{FormatMatch, SignatureRegistry, SignatureSet};
use crate::models::Finding;

/// Default prefix window
pub const DEFAULT_WINDOW: usize = 64 * 1024;

/// Default limit on bytes following the final JPEG end-of-image marker
pub const DEFAULT_JPEG_TRAILER_LIMIT: usize = 1_000_000;

/// Active-content markers that should never follow a binary container header
const ACTIVE_MARKERS: &[&str] = &[
    "<script",
    "<?php",
    "<?=",
    "<iframe",
    "javascript:",
    "onload=",
    "onerror=",
];

static ACTIVE_MARKER_MATCHER: Lazy<Option<AhoCorasick>> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(ACTIVE_MARKERS)
        .ok()
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Prefix window scanned for signatures
    #[serde(default = "default_window")]
    pub window: usize,

    #[serde(default = "default_jpeg_trailer_limit")]
    pub jpeg_trailer_limit: usize,

    /// Look for script/PHP/HTML markers after a container header
    #[serde(default = "default_embedded_scripts")]
    pub embedded_scripts: bool,
}

fn default_window() -> usize {
    DEFAULT_WINDOW
}

fn default_jpeg_trailer_limit() -> usize {
    DEFAULT_JPEG_TRAILER_LIMIT
}

fn default_embedded_scripts() -> bool {
    true
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            jpeg_trailer_limit: default_jpeg_trailer_limit(),
            embedded_scripts: default_embedded_scripts(),
        }
    }
}

/// Why a blob was marked suspicious
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectionReason {
    Polyglot { formats: Vec<String> },
    ExecutableMagic { format: String, offset: usize },
    EmbeddedScript { marker: String, container: String, offset: usize },
    JpegTrailer { trailing_bytes: usize },
}

impl DetectionReason {
    pub fn rule(&self) -> &'static str {
        match self {
            DetectionReason::Polyglot { .. } => "polyglot_magic",
            DetectionReason::ExecutableMagic { .. } => "executable_magic",
            DetectionReason::EmbeddedScript { .. } => "embedded_script",
            DetectionReason::JpegTrailer { .. } => "jpeg_trailer_payload",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DetectionReason::Polyglot { formats } => {
                format!("polyglot: {}", formats.join(", "))
            }
            DetectionReason::ExecutableMagic { format, offset } => {
                format!("executable magic '{}' at offset {}", format, offset)
            }
            DetectionReason::EmbeddedScript {
                marker,
                container,
                offset,
            } => format!(
                "active marker '{}' at offset {} after {} header",
                marker, offset, container
            ),
            DetectionReason::JpegTrailer { trailing_bytes } => {
                format!("{} bytes after final JPEG end-of-image marker", trailing_bytes)
            }
        }
    }
}

/// Result of one detection pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub matches: Vec<FormatMatch>,
    pub is_polyglot: bool,
    pub suspicious: bool,
    pub reasons: Vec<DetectionReason>,
}

impl Detection {
    /// Distinct format names in first-seen order
    pub fn formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = Vec::new();
        for m in &self.matches {
            if !formats.iter().any(|f| f == &m.format) {
                formats.push(m.format.clone());
            }
        }
        formats
    }

    pub fn has_format(&self, name: &str) -> bool {
        self.matches.iter().any(|m| m.format == name)
    }

    /// ZIP-like: a zip signature sits at the very start of the blob
    pub fn is_zip_like(&self) -> bool {
        self.matches
            .iter()
            .any(|m| m.format == "zip" && m.offset == 0)
    }

    /// One finding per suspicion reason
    pub fn to_findings(&self) -> Vec<Finding> {
        self.reasons
            .iter()
            .map(|reason| {
                let mut finding = Finding::suspicious(reason.rule())
                    .with_metadata(serde_json::json!({ "detail": reason.describe() }));
                match reason {
                    DetectionReason::Polyglot { formats } => {
                        finding = finding.with_tag("polyglot").with_tags(formats.clone());
                    }
                    DetectionReason::ExecutableMagic { format, .. } => {
                        finding = finding.with_tag("executable").with_tag(format.clone());
                    }
                    DetectionReason::EmbeddedScript { container, .. } => {
                        finding = finding.with_tag("embedded-script").with_tag(container.clone());
                    }
                    DetectionReason::JpegTrailer { .. } => {
                        finding = finding.with_tag("jpg").with_tag("trailer");
                    }
                }
                finding
            })
            .collect()
    }
}

/// Detector bound to a signature registry
#[derive(Clone)]
pub struct FormatDetector {
    registry: Arc<SignatureRegistry>,
    config: DetectorConfig,
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::new(DetectorConfig::default())
    }
}

impl FormatDetector {
    /// Detector over the process-wide registry
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            registry: SignatureRegistry::global(),
            config,
        }
    }

    pub fn with_registry(registry: Arc<SignatureRegistry>, config: DetectorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<SignatureRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Never fails. Inputs shorter than every pattern simply match nothing.
    pub fn detect(&self, bytes: &[u8]) -> Detection {
        let snapshot = self.registry.snapshot();
        let window = &bytes[..bytes.len().min(self.config.window)];
        let matches = snapshot.find_all(window);

        let mut detection = Detection {
            matches,
            ..Detection::default()
        };

        let formats = detection.formats();
        if formats.len() >= 2 {
            detection.is_polyglot = true;
            detection.reasons.push(DetectionReason::Polyglot { formats });
        }

        let mut flagged: Vec<&str> = Vec::new();
        for m in detection.matches.iter().filter(|m| m.suspicious) {
            if flagged.contains(&m.format.as_str()) {
                continue;
            }
            flagged.push(&m.format);
            detection.reasons.push(DetectionReason::ExecutableMagic {
                format: m.format.clone(),
                offset: m.offset,
            });
        }

        if self.config.embedded_scripts {
            let header = container_header(&snapshot, &detection.matches);
            if let Some(reason) = header.and_then(|(name, len)| embedded_script(window, name, len)) {
                detection.reasons.push(reason);
            }
        }

        if detection.has_format("jpg") {
            if let Some(reason) = jpeg_trailer(bytes, self.config.jpeg_trailer_limit) {
                detection.reasons.push(reason);
            }
        }

        detection.suspicious = !detection.reasons.is_empty();
        if detection.suspicious {
            debug!(
                formats = ?detection.formats(),
                reasons = detection.reasons.len(),
                "Detector flagged blob"
            );
        }
        detection
    }
}

/// Detect against the process-wide registry with default settings
pub fn detect(bytes: &[u8]) -> Detection {
    FormatDetector::default().detect(bytes)
}

/// Format name and header length of a non-executable match at offset 0
fn container_header<'a>(snapshot: &SignatureSet, matches: &'a [FormatMatch]) -> Option<(&'a str, usize)> {
    let header = matches.iter().find(|m| m.offset == 0 && !m.suspicious)?;
    let len = snapshot
        .iter()
        .filter(|s| s.name == header.format)
        .map(|s| s.pattern.len())
        .max()?;
    Some((header.format.as_str(), len))
}

fn embedded_script(window: &[u8], container: &str, header_len: usize) -> Option<DetectionReason> {
    let matcher = ACTIVE_MARKER_MATCHER.as_ref()?;
    let body = window.get(header_len..)?;
    let hit = matcher.find(body)?;
    Some(DetectionReason::EmbeddedScript {
        marker: ACTIVE_MARKERS[hit.pattern().as_usize()].to_string(),
        container: container.to_string(),
        offset: header_len + hit.start(),
    })
}

fn jpeg_trailer(bytes: &[u8], limit: usize) -> Option<DetectionReason> {
    if !bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return None;
    }
    // Whole buffer, not the prefix window: EOI sits at the end of the image
    let eoi = bytes.windows(2).rposition(|w| w == [0xFF, 0xD9])?;
    let trailing_bytes = bytes.len() - (eoi + 2);
    (trailing_bytes > limit).then_some(DetectionReason::JpegTrailer { trailing_bytes })
}
