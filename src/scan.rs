//! Top-level scan entry point.
//!
//! Pipeline for one blob:
//! 1. cap the input at `max_buffer_size` (oversize input gets `file_too_large`)
//! 2. magic-byte and polyglot detection, always
//! 3. ZIP-like input: integrity analysis plus the budgeted nested walk
//! 4. composed pluggable scanners, unless fail-fast already saw a malicious finding
//! 5. aggregation into a [`ScanReport`]

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::archive::{analyze_bytes, walk, Budget};
use crate::detection::{DetectorConfig, FormatDetector, SignatureRegistry};
use crate::error::{Result, ScanError};
use crate::infrastructure::config::presets::PolicyPreset;
use crate::infrastructure::config::ScanConfig;
use crate::models::{Finding, ScanReport, Severity};
use crate::scanners::compose::RULE_SCAN_ERROR;
use crate::scanners::{
    compose, ComposeOptions, ComposedScanner, HeuristicsConfig, HeuristicsScanner, NamedScanner,
};
use crate::verdict::aggregate;

/// Rule emitted when the input is larger than `max_buffer_size`
pub const RULE_FILE_TOO_LARGE: &str = "file_too_large";

/// Chunk size used when streaming a reader
const STREAM_CHUNK: usize = 64 * 1024;

/// Options of one scan engine
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Stop at the first malicious pre-filter finding
    pub fail_fast: bool,
    /// Archive nesting limit; overrides `budget.max_depth`
    pub max_depth: usize,
    /// Heuristic score at which a blob is called malicious
    pub heuristic_threshold: u32,
    /// Byte cap for analysis; larger input is truncated
    pub max_buffer_size: usize,
    /// Read streams chunk by chunk, hashing as bytes arrive
    pub use_stream_scanner: bool,
    pub budget: Budget,
}

impl Default for ScanOptions {
    fn default() -> Self {
        PolicyPreset::Balanced.scan_options()
    }
}

impl ScanOptions {
    pub fn from_preset(preset: PolicyPreset) -> Self {
        preset.scan_options()
    }

    /// Walk budget with `max_depth` applied
    pub fn effective_budget(&self) -> Budget {
        Budget {
            max_depth: self.max_depth,
            ..self.budget.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(ScanError::validation_error("max_buffer_size must be positive"));
        }
        self.effective_budget()
            .validate()
            .map_err(ScanError::validation_error)
    }
}

/// Builder for [`ScanEngine`]
#[derive(Clone)]
pub struct ScanEngineBuilder {
    options: ScanOptions,
    detector: FormatDetector,
    compose_options: ComposeOptions,
    heuristics: Option<HeuristicsConfig>,
    scanners: Vec<NamedScanner>,
}

impl Default for ScanEngineBuilder {
    fn default() -> Self {
        Self {
            options: ScanOptions::default(),
            detector: FormatDetector::default(),
            compose_options: ComposeOptions::default(),
            heuristics: Some(HeuristicsConfig::default()),
            scanners: Vec::new(),
        }
    }
}

impl ScanEngineBuilder {
    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn preset(mut self, preset: PolicyPreset) -> Self {
        self.options = preset.scan_options();
        self
    }

    pub fn detector(mut self, detector: FormatDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Use a private signature registry instead of the process-wide one
    pub fn registry(mut self, registry: Arc<SignatureRegistry>) -> Self {
        let config = self.detector.config().clone();
        self.detector = FormatDetector::with_registry(registry, config);
        self
    }

    pub fn detector_config(mut self, config: DetectorConfig) -> Self {
        let registry = Arc::clone(self.detector.registry());
        self.detector = FormatDetector::with_registry(registry, config);
        self
    }

    pub fn compose_options(mut self, options: ComposeOptions) -> Self {
        self.compose_options = options;
        self
    }

    pub fn heuristics(mut self, config: HeuristicsConfig) -> Self {
        self.heuristics = Some(config);
        self
    }

    pub fn without_heuristics(mut self) -> Self {
        self.heuristics = None;
        self
    }

    /// Register a pluggable scanner; runs after the built-in heuristics
    pub fn scanner(mut self, scanner: impl Into<NamedScanner>) -> Self {
        self.scanners.push(scanner.into());
        self
    }

    pub fn build(self) -> Result<ScanEngine> {
        self.options.validate()?;

        let mut scanners = Vec::with_capacity(self.scanners.len() + 1);
        if let Some(config) = self.heuristics {
            let heuristics = HeuristicsScanner::new(config)
                .with_threshold(self.options.heuristic_threshold);
            scanners.push(NamedScanner::new("heuristics", Arc::new(heuristics)));
        }
        scanners.extend(self.scanners);

        Ok(ScanEngine {
            detector: self.detector,
            scanners: compose(scanners, self.compose_options),
            options: self.options,
        })
    }
}

/// Scans blobs and streams into reports
#[derive(Clone)]
pub struct ScanEngine {
    detector: FormatDetector,
    scanners: ComposedScanner,
    options: ScanOptions,
}

impl ScanEngine {
    pub fn builder() -> ScanEngineBuilder {
        ScanEngineBuilder::default()
    }

    /// Engine with balanced defaults and the heuristics scanner
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Engine configured from a loaded [`ScanConfig`]
    pub fn from_config(config: &ScanConfig) -> Result<Self> {
        Self::builder()
            .options(config.scan_options()?)
            .detector_config(config.detector.clone())
            .heuristics(config.heuristics.clone())
            .compose_options(config.compose.to_options())
            .build()
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn scanner_names(&self) -> Vec<&str> {
        self.scanners.scanner_names()
    }

    /// Scan an in-memory blob. Bad files always produce a report.
    pub async fn scan_bytes(&self, data: &[u8]) -> Result<ScanReport> {
        let cap = self.options.max_buffer_size;
        let truncated = data.len() > cap;
        let processed = Bytes::copy_from_slice(&data[..data.len().min(cap)]);
        Ok(self.run(processed, truncated, None).await)
    }

    /// Scan a byte stream, reading at most `max_buffer_size` bytes (plus one
    /// to tell whether the stream was truncated).
    ///
    /// Only I/O failures of the stream itself surface as errors.
    pub async fn scan_reader<R>(&self, reader: R) -> Result<ScanReport>
    where
        R: AsyncRead + Unpin,
    {
        let cap = self.options.max_buffer_size;

        if self.options.use_stream_scanner {
            let mut stream = ReaderStream::with_capacity(reader, STREAM_CHUNK.min(cap));
            let mut buffer = BytesMut::new();
            let mut hasher = Sha256::new();
            let mut truncated = false;

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let room = cap - buffer.len();
                if chunk.len() > room {
                    hasher.update(&chunk[..room]);
                    buffer.extend_from_slice(&chunk[..room]);
                    truncated = true;
                    break;
                }
                hasher.update(&chunk);
                buffer.extend_from_slice(&chunk);
            }
            // a stream ending exactly at the cap is not truncated
            let digest = format!("{:x}", hasher.finalize());
            return Ok(self.run(buffer.freeze(), truncated, Some(digest)).await);
        }

        let mut buffer = Vec::with_capacity(cap.min(STREAM_CHUNK));
        reader
            .take(cap as u64 + 1)
            .read_to_end(&mut buffer)
            .await?;
        let truncated = buffer.len() > cap;
        buffer.truncate(cap);
        Ok(self.run(Bytes::from(buffer), truncated, None).await)
    }

    async fn run(&self, data: Bytes, truncated: bool, digest: Option<String>) -> ScanReport {
        let scan_id = Uuid::new_v4();
        let span = info_span!("scan", scan_id = %scan_id);
        self.pipeline(scan_id, data, truncated, digest)
            .instrument(span)
            .await
    }

    async fn pipeline(
        &self,
        scan_id: Uuid,
        data: Bytes,
        truncated: bool,
        digest: Option<String>,
    ) -> ScanReport {
        let started = Instant::now();
        let mut findings = Vec::new();

        if truncated {
            findings.push(
                Finding::suspicious(RULE_FILE_TOO_LARGE)
                    .with_tag("limits")
                    .with_metadata(serde_json::json!({
                        "max_buffer_size": self.options.max_buffer_size,
                    })),
            );
        }

        let detection = self.detector.detect(&data);
        findings.extend(detection.to_findings());

        if detection.is_zip_like() {
            let archive = data.clone();
            let budget = self.options.effective_budget();
            let fail_fast = self.options.fail_fast;
            let span = tracing::Span::current();
            match tokio::task::spawn_blocking(move || {
                span.in_scope(|| archive_prefilter(&archive, budget, fail_fast))
            })
            .await
            {
                Ok(archive_findings) => findings.extend(archive_findings),
                Err(e) => {
                    warn!(error = %e, "Archive pre-filter task failed");
                    findings.push(
                        Finding::new(RULE_SCAN_ERROR, Severity::Clean)
                            .with_tag("scanner-failure")
                            .with_source("archive_prefilter"),
                    );
                }
            }
        }

        let worst = aggregate(&findings);
        if self.options.fail_fast && worst == Severity::Malicious {
            debug!("Pre-filter verdict is malicious, skipping pluggable scanners");
        } else if !self.scanners.is_empty() {
            findings.extend(self.scanners.run(data.clone()).await.findings);
        }

        let verdict = aggregate(&findings);
        let duration_ms = started.elapsed().as_millis() as u64;
        let sha256 = digest.unwrap_or_else(|| format!("{:x}", Sha256::digest(&data)));

        info!(
            verdict = %verdict,
            findings = findings.len(),
            bytes = data.len(),
            truncated,
            duration_ms,
            "Scan completed"
        );

        ScanReport {
            scan_id,
            verdict,
            findings,
            bytes_processed: data.len() as u64,
            duration_ms,
            sha256,
            truncated,
            formats: detection.formats(),
            scanned_at: chrono::Utc::now(),
        }
    }
}

/// Integrity analysis and budgeted walk over a ZIP-like blob. Runs on the
/// blocking pool.
fn archive_prefilter(data: &[u8], budget: Budget, fail_fast: bool) -> Vec<Finding> {
    let mut findings: Vec<Finding> = analyze_bytes(data).into_iter().map(Finding::from).collect();

    if fail_fast && findings.iter().any(|f| f.severity == Severity::Malicious) {
        debug!("Integrity analysis found a malicious entry, skipping archive walk");
        return findings;
    }

    let mut walker = walk(data, budget, 0);
    for item in walker.by_ref() {
        if let Err(error) = item {
            findings.push(Finding::from(error.to_finding()));
            break;
        }
    }
    debug!(
        entries = walker.counters().entries(),
        total_uncompressed = walker.counters().total_uncompressed(),
        "Archive walk finished"
    );
    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanners::scanner_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_plain_text_is_clean() {
        let engine = ScanEngine::new().unwrap();
        let report = engine.scan_bytes(b"just some notes").await.unwrap();
        assert_eq!(report.verdict, Severity::Clean);
        assert!(report.findings.is_empty());
        assert_eq!(report.bytes_processed, 15);
        assert!(!report.truncated);
    }

    #[tokio::test]
    async fn test_oversize_input_is_truncated() {
        let options = ScanOptions {
            max_buffer_size: 8,
            ..ScanOptions::default()
        };
        let engine = ScanEngine::builder().options(options).build().unwrap();
        let report = engine.scan_bytes(b"0123456789abcdef").await.unwrap();
        assert!(report.truncated);
        assert_eq!(report.bytes_processed, 8);
        assert_eq!(report.verdict, Severity::Suspicious);
        assert!(report.finding(RULE_FILE_TOO_LARGE).is_some());
    }

    #[tokio::test]
    async fn test_reader_modes_agree() {
        let data = b"stream me please, twice over".repeat(10);
        for streaming in [false, true] {
            let options = ScanOptions {
                max_buffer_size: 100,
                use_stream_scanner: streaming,
                ..ScanOptions::default()
            };
            let engine = ScanEngine::builder().options(options).build().unwrap();
            let report = engine.scan_reader(&data[..]).await.unwrap();
            assert!(report.truncated, "streaming = {}", streaming);
            assert_eq!(report.bytes_processed, 100);
            assert_eq!(report.sha256, format!("{:x}", Sha256::digest(&data[..100])));
        }
    }

    #[tokio::test]
    async fn test_reader_exactly_at_cap_is_not_truncated() {
        for streaming in [false, true] {
            let options = ScanOptions {
                max_buffer_size: 10,
                use_stream_scanner: streaming,
                ..ScanOptions::default()
            };
            let engine = ScanEngine::builder().options(options).build().unwrap();
            let report = engine.scan_reader(&b"0123456789"[..]).await.unwrap();
            assert!(!report.truncated);
            assert_eq!(report.bytes_processed, 10);
        }
    }

    #[tokio::test]
    async fn test_fail_fast_still_runs_scanners_below_malicious() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let counting = scanner_fn("counting", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            }
        });
        let options = ScanOptions {
            fail_fast: true,
            max_buffer_size: 4,
            ..ScanOptions::default()
        };
        let engine = ScanEngine::builder()
            .options(options)
            .without_heuristics()
            .scanner(counting)
            .build()
            .unwrap();

        // oversize input is only suspicious, so the counting scanner still runs
        engine.scan_bytes(b"oversized").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_heuristic_threshold_follows_options() {
        let options = ScanOptions {
            heuristic_threshold: 30,
            ..ScanOptions::default()
        };
        let engine = ScanEngine::builder().options(options).build().unwrap();
        let report = engine.scan_bytes(b"eval(payload)").await.unwrap();
        assert_eq!(report.verdict, Severity::Malicious);
    }

    #[test]
    fn test_invalid_options_rejected() {
        let options = ScanOptions {
            max_buffer_size: 0,
            ..ScanOptions::default()
        };
        assert!(ScanEngine::builder().options(options).build().is_err());

        let options = ScanOptions {
            max_depth: 64,
            ..ScanOptions::default()
        };
        assert!(matches!(
            ScanEngine::builder().options(options).build(),
            Err(ScanError::Validation(_))
        ));
    }

    #[test]
    fn test_effective_budget_uses_max_depth() {
        let options = ScanOptions {
            max_depth: 1,
            ..ScanOptions::default()
        };
        assert_eq!(options.effective_budget().max_depth, 1);
        assert_eq!(
            options.effective_budget().max_entries,
            options.budget.max_entries
        );
    }
}
