//! Scanner composition engine.
//!
//! Runs a list of named scanners either one after another (with an optional
//! severity short-circuit) or all at once on the tokio runtime. Each scanner
//! runs on its own task under a hard timeout; a result that arrives after the
//! deadline is discarded. A failing scanner (error, panic or timeout)
//! contributes zero findings; the composed scanner itself never fails.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{ArcScanner, Scanner};
use crate::error::Result;
use crate::models::{Finding, Severity};

/// Rule of the clean finding recorded for a timed out scanner
pub const RULE_SCAN_TIMEOUT: &str = "scan_timeout";
/// Rule of the clean finding recorded for an erroring or panicking scanner
pub const RULE_SCAN_ERROR: &str = "scan_error";

/// Failure observer
pub type FailureCallback = Arc<dyn Fn(&ScannerFailure) + Send + Sync>;

/// Composition options
#[derive(Clone, Default)]
pub struct ComposeOptions {
    /// Run every scanner concurrently instead of in registration order
    pub parallel: bool,
    /// Sequential mode only: skip remaining scanners once the running worst
    /// severity reaches this level
    pub stop_on: Option<Severity>,
    /// Hard per-scanner deadline
    pub timeout_per_scanner: Option<Duration>,
    /// Stamp findings with the producing scanner's name
    pub tag_source_name: bool,
    /// Record failures as clean `scan_timeout` / `scan_error` findings
    pub record_failures: bool,
    pub on_failure: Option<FailureCallback>,
}

impl fmt::Debug for ComposeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposeOptions")
            .field("parallel", &self.parallel)
            .field("stop_on", &self.stop_on)
            .field("timeout_per_scanner", &self.timeout_per_scanner)
            .field("tag_source_name", &self.tag_source_name)
            .field("record_failures", &self.record_failures)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

impl ComposeOptions {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel() -> Self {
        Self {
            parallel: true,
            ..Self::default()
        }
    }

    pub fn with_stop_on(mut self, severity: Severity) -> Self {
        self.stop_on = Some(severity);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_per_scanner = Some(timeout);
        self
    }

    pub fn with_source_tags(mut self) -> Self {
        self.tag_source_name = true;
        self
    }

    pub fn with_recorded_failures(mut self) -> Self {
        self.record_failures = true;
        self
    }

    pub fn with_failure_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ScannerFailure) + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }
}

/// A scanner with the name it is registered under
#[derive(Clone)]
pub struct NamedScanner {
    pub name: String,
    pub scanner: ArcScanner,
}

impl NamedScanner {
    pub fn new(name: impl Into<String>, scanner: ArcScanner) -> Self {
        Self {
            name: name.into(),
            scanner,
        }
    }
}

impl From<ArcScanner> for NamedScanner {
    fn from(scanner: ArcScanner) -> Self {
        Self {
            name: scanner.name().to_string(),
            scanner,
        }
    }
}

impl<S: Into<String>> From<(S, ArcScanner)> for NamedScanner {
    fn from((name, scanner): (S, ArcScanner)) -> Self {
        Self::new(name, scanner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    Timeout(Duration),
    Error(String),
    Panic(String),
}

/// One isolated scanner failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannerFailure {
    pub scanner: String,
    pub kind: FailureKind,
}

impl ScannerFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout(_))
    }

    fn to_finding(&self) -> Finding {
        let rule = if self.is_timeout() {
            RULE_SCAN_TIMEOUT
        } else {
            RULE_SCAN_ERROR
        };
        Finding::new(rule, Severity::Clean)
            .with_tag("scanner-failure")
            .with_source(self.scanner.clone())
            .with_metadata(serde_json::json!({ "reason": self.to_string() }))
    }
}

impl fmt::Display for ScannerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FailureKind::Timeout(limit) => {
                write!(f, "scanner '{}' timed out after {:?}", self.scanner, limit)
            }
            FailureKind::Error(message) => write!(f, "scanner '{}' failed: {}", self.scanner, message),
            FailureKind::Panic(message) => write!(f, "scanner '{}' panicked: {}", self.scanner, message),
        }
    }
}

/// Detailed result of a composed run
#[derive(Debug, Clone, Default)]
pub struct ComposeOutcome {
    pub findings: Vec<Finding>,
    pub failures: Vec<ScannerFailure>,
    /// Scanners not run because of `stop_on`
    pub skipped: Vec<String>,
}

/// The composed scanner, itself a [`Scanner`]
#[derive(Clone)]
pub struct ComposedScanner {
    name: String,
    scanners: Vec<NamedScanner>,
    options: ComposeOptions,
}

/// Compose scanners under one set of options
pub fn compose<I, S>(scanners: I, options: ComposeOptions) -> ComposedScanner
where
    I: IntoIterator<Item = S>,
    S: Into<NamedScanner>,
{
    ComposedScanner {
        name: "composed".to_string(),
        scanners: scanners.into_iter().map(Into::into).collect(),
        options,
    }
}

impl ComposedScanner {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn options(&self) -> &ComposeOptions {
        &self.options
    }

    pub fn scanner_names(&self) -> Vec<&str> {
        self.scanners.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.scanners.is_empty()
    }

    /// Run every scanner and report findings, failures and skips
    pub async fn run(&self, data: Bytes) -> ComposeOutcome {
        let started = Instant::now();
        let outcome = if self.options.parallel {
            self.run_parallel(data).await
        } else {
            self.run_sequential(data).await
        };
        debug!(
            scanners = self.scanners.len(),
            findings = outcome.findings.len(),
            failures = outcome.failures.len(),
            skipped = outcome.skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Composed scan finished"
        );
        outcome
    }

    async fn run_sequential(&self, data: Bytes) -> ComposeOutcome {
        let mut outcome = ComposeOutcome::default();
        let mut worst = Severity::Clean;
        let timeout = self.options.timeout_per_scanner;

        for (idx, named) in self.scanners.iter().enumerate() {
            match run_isolated(Arc::clone(&named.scanner), data.clone(), timeout).await {
                Ok(findings) => {
                    worst = worst.max(findings.iter().map(|f| f.severity).max().unwrap_or_default());
                    self.accept(&mut outcome, &named.name, findings);
                }
                Err(kind) => self.record_failure(&mut outcome, &named.name, kind),
            }

            if let Some(stop_on) = self.options.stop_on {
                if worst >= stop_on {
                    outcome.skipped = self.scanners[idx + 1..]
                        .iter()
                        .map(|s| s.name.clone())
                        .collect();
                    if !outcome.skipped.is_empty() {
                        debug!(
                            after = %named.name,
                            severity = %worst,
                            skipped = ?outcome.skipped,
                            "Stopping composed scan early"
                        );
                    }
                    break;
                }
            }
        }
        outcome
    }

    async fn run_parallel(&self, data: Bytes) -> ComposeOutcome {
        let timeout = self.options.timeout_per_scanner;

        let tasks = self.scanners.iter().map(|named| {
            let run = run_isolated(Arc::clone(&named.scanner), data.clone(), timeout);
            let name = named.name.clone();
            async move { (name, run.await) }
        });

        // join_all keeps registration order, so finding order is stable
        let results = join_all(tasks).await;

        let mut outcome = ComposeOutcome::default();
        for (name, result) in results {
            match result {
                Ok(findings) => self.accept(&mut outcome, &name, findings),
                Err(kind) => self.record_failure(&mut outcome, &name, kind),
            }
        }
        outcome
    }

    fn accept(&self, outcome: &mut ComposeOutcome, name: &str, findings: Vec<Finding>) {
        if self.options.tag_source_name {
            outcome.findings.extend(findings.into_iter().map(|f| {
                f.with_source(name)
                    .with_tag(format!("source:{}", name))
            }));
        } else {
            outcome.findings.extend(findings);
        }
    }

    fn record_failure(&self, outcome: &mut ComposeOutcome, name: &str, kind: FailureKind) {
        let failure = ScannerFailure {
            scanner: name.to_string(),
            kind,
        };
        warn!(scanner = %failure.scanner, reason = %failure, "Scanner isolated");
        if let Some(callback) = &self.options.on_failure {
            callback(&failure);
        }
        if self.options.record_failures {
            outcome.findings.push(failure.to_finding());
        }
        outcome.failures.push(failure);
    }
}

#[async_trait]
impl Scanner for ComposedScanner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        Ok(self.run(Bytes::copy_from_slice(data)).await.findings)
    }
}

/// Run one scanner on its own task under the deadline.
///
/// A scanner that blocks its worker can finish before the timer gets polled,
/// so the time measured inside the task decides too: a result produced after
/// `limit` is dropped and reported as a timeout.
async fn run_isolated(
    scanner: ArcScanner,
    data: Bytes,
    timeout: Option<Duration>,
) -> std::result::Result<Vec<Finding>, FailureKind> {
    let mut handle = tokio::spawn(async move {
        let started = Instant::now();
        let result = scanner.scan_shared(data).await;
        (result, started.elapsed())
    });

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(FailureKind::Timeout(limit));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok((_, elapsed)) if timeout.map_or(false, |limit| elapsed > limit) => {
            debug!(elapsed_ms = elapsed.as_millis() as u64, "Dropping late scanner result");
            Err(FailureKind::Timeout(timeout.unwrap_or(elapsed)))
        }
        Ok((Ok(findings), _)) => Ok(findings),
        Ok((Err(error), _)) => Err(FailureKind::Error(error.to_string())),
        Err(join_error) if join_error.is_panic() => {
            Err(FailureKind::Panic(panic_message(&join_error.into_panic())))
        }
        Err(join_error) => Err(FailureKind::Error(join_error.to_string())),
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
