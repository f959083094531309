//! blobguard - upload gate for untrusted byte blobs
//!
//! Produces a `clean | suspicious | malicious` verdict for a blob from:
//! - magic-byte and polyglot detection (`detection`)
//! - raw ZIP header parsing, integrity checks and a budgeted nested walk (`archive`)
//! - pluggable scanners composed under time and severity budgets (`scanners`)
//!
//! ```ignore
//! let engine = ScanEngine::builder().preset(PolicyPreset::Strict).build()?;
//! let report = engine.scan_bytes(&upload).await?;
//! if !report.is_clean() {
//!     reject(report.verdict);
//! }
//! ```

pub mod archive;
pub mod detection;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod monitoring;
pub mod scan;
pub mod scanners;
pub mod utils;
pub mod verdict;

pub use archive::{analyze, parse_cen, parse_lfh, walk, Budget, BudgetExceeded, WalkError};
pub use detection::{detect, Detection, FormatDetector, Signature, SignatureRegistry};
pub use error::{Result, ScanError};
pub use infrastructure::config::presets::PolicyPreset;
pub use infrastructure::config::{ScanConfig, ScanConfigLoader};
pub use models::{ArchiveFinding, ArchiveTag, Finding, ScanReport, Severity, Verdict};
pub use monitoring::{init_tracing, LoggingConfig};
pub use scan::{ScanEngine, ScanEngineBuilder, ScanOptions};
pub use scanners::{blocking_scanner_fn, compose, scanner_fn, ArcScanner, ComposeOptions, Scanner};
pub use verdict::aggregate;
