//! Scanner adapters over the built-in detection and archive components, so
//! they can also take part in a composed scan. The parsing work runs on the
//! blocking pool.

use async_trait::async_trait;
use bytes::Bytes;

use super::{run_blocking, Scanner};
use crate::archive::{analyze_bytes, walk_findings, Budget};
use crate::detection::{DetectorConfig, FormatDetector};
use crate::error::Result;
use crate::models::Finding;

/// Magic bytes and polyglot detection
#[derive(Clone, Default)]
pub struct PolyglotScanner {
    detector: FormatDetector,
}

impl PolyglotScanner {
    pub fn new(detector: FormatDetector) -> Self {
        Self { detector }
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        Self::new(FormatDetector::new(config))
    }
}

#[async_trait]
impl Scanner for PolyglotScanner {
    fn name(&self) -> &str {
        "polyglot"
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        self.scan_shared(Bytes::copy_from_slice(data)).await
    }

    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        let detector = self.detector.clone();
        run_blocking(self.name(), move || detector.detect(&data).to_findings()).await
    }
}

/// LFH/CEN integrity checks; non-ZIP input yields nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipIntegrityScanner;

#[async_trait]
impl Scanner for ZipIntegrityScanner {
    fn name(&self) -> &str {
        "zip_integrity"
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        self.scan_shared(Bytes::copy_from_slice(data)).await
    }

    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        run_blocking(self.name(), move || {
            analyze_bytes(&data).into_iter().map(Finding::from).collect()
        })
        .await
    }
}

/// Budgeted nested walk; a budget violation becomes a finding, not an error
#[derive(Debug, Clone, Default)]
pub struct ZipBombGuardScanner {
    budget: Budget,
}

impl ZipBombGuardScanner {
    pub fn new(budget: Budget) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }
}

#[async_trait]
impl Scanner for ZipBombGuardScanner {
    fn name(&self) -> &str {
        "zip_bomb_guard"
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        if !data.starts_with(b"PK\x03\x04") {
            return Ok(Vec::new());
        }
        self.scan_shared(Bytes::copy_from_slice(data)).await
    }

    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        if !data.starts_with(b"PK\x03\x04") {
            return Ok(Vec::new());
        }
        let budget = self.budget.clone();
        run_blocking(self.name(), move || {
            walk_findings(&data, budget)
                .into_iter()
                .map(Finding::from)
                .collect()
        })
        .await
    }
}
