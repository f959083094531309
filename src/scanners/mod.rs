//! Pluggable scanners.
//!
//! Every engine (heuristics, magic bytes, archive checks, or an external
//! engine wrapped by the caller) implements [`Scanner`] and takes part in a
//! [`compose`]d scan through that trait alone. CPU-bound engines run their
//! work on tokio's blocking pool so a long scan never stalls a runtime worker.

pub mod builtin;
pub mod compose;
pub mod heuristics;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::error::{Result, ScanError};
use crate::models::Finding;

pub use builtin::{PolyglotScanner, ZipBombGuardScanner, ZipIntegrityScanner};
pub use compose::{
    compose, ComposeOptions, ComposeOutcome, ComposedScanner, FailureKind, NamedScanner,
    ScannerFailure,
};
pub use heuristics::{HeuristicsConfig, HeuristicsScanner};

/// The uniform scanner contract.
///
/// Implementations must be `Send + Sync`; the composition engine may run them
/// on any runtime worker. Returning `Err` or panicking isolates the scanner to
/// zero findings, it never fails the overall scan.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Stable identifier, used to tag findings and failures.
    fn name(&self) -> &str;

    /// Scan one blob.
    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>>;

    /// Scan a shared buffer. The composition engine calls this; engines that
    /// hand the data to a blocking task override it to skip the copy.
    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        self.scan(&data).await
    }
}

/// Run synchronous scanner work on the blocking pool
pub(crate) async fn run_blocking<T, F>(scanner: &str, work: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        ScanError::scanner_error(scanner, format!("blocking task failed: {}", e))
    })
}

/// Shared scanner handle
pub type ArcScanner = Arc<dyn Scanner>;

/// Scanner backed by an async closure
pub struct FnScanner<F> {
    name: String,
    f: F,
}

impl<F> fmt::Debug for FnScanner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnScanner").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Scanner for FnScanner<F>
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Finding>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        (self.f)(Bytes::copy_from_slice(data)).await
    }
}

/// Adapt an async closure into a shared scanner.
///
/// ```ignore
/// let slow = scanner_fn("slow", |_data| async {
///     tokio::time::sleep(Duration::from_millis(200)).await;
///     Ok(vec![])
/// });
/// ```
pub fn scanner_fn<F, Fut>(name: impl Into<String>, f: F) -> ArcScanner
where
    F: Fn(Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Finding>>> + Send + 'static,
{
    Arc::new(FnScanner {
        name: name.into(),
        f,
    })
}

/// Scanner backed by a synchronous closure, run on the blocking pool
pub struct BlockingFnScanner<F> {
    name: String,
    f: Arc<F>,
}

impl<F> fmt::Debug for BlockingFnScanner<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingFnScanner").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Scanner for BlockingFnScanner<F>
where
    F: Fn(&[u8]) -> Result<Vec<Finding>> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        self.scan_shared(Bytes::copy_from_slice(data)).await
    }

    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        let f = Arc::clone(&self.f);
        run_blocking(&self.name, move || f(&data)).await?
    }
}

/// Adapt a synchronous engine (native library binding, CPU-heavy matcher)
/// into a shared scanner that never blocks a runtime worker.
pub fn blocking_scanner_fn<F>(name: impl Into<String>, f: F) -> ArcScanner
where
    F: Fn(&[u8]) -> Result<Vec<Finding>> + Send + Sync + 'static,
{
    Arc::new(BlockingFnScanner {
        name: name.into(),
        f: Arc::new(f),
    })
}
