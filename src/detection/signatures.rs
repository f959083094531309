//! Signature registry
//!
//! Append-only table of magic-byte patterns. Readers take an `Arc` snapshot
//! of the current set and never block each other; writers serialize on a
//! dedicated lock, build the next snapshot off to the side and publish it with
//! one pointer swap. A scan that started before an append keeps matching
//! against the snapshot it took.

use aho_corasick::AhoCorasick;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Signature registration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature '{name}' has an empty pattern")]
    EmptyPattern { name: String },

    #[error("signature name must not be empty")]
    EmptyName,
}

/// One magic-byte pattern with its format metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub mime_type: String,
    pub extensions: Vec<String>,
    pub pattern: Vec<u8>,
    /// Executable magic and similar: a match alone makes the blob suspicious
    pub suspicious: bool,
}

impl Signature {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        extensions: &[&str],
        pattern: impl Into<Vec<u8>>,
    ) -> Result<Self, SignatureError> {
        let name = name.into();
        let pattern = pattern.into();
        if name.is_empty() {
            return Err(SignatureError::EmptyName);
        }
        if pattern.is_empty() {
            return Err(SignatureError::EmptyPattern { name });
        }
        Ok(Self {
            name,
            mime_type: mime_type.into(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            pattern,
            suspicious: false,
        })
    }

    /// Mark the signature as suspicious on its own
    pub fn flagged(mut self) -> Self {
        self.suspicious = true;
        self
    }
}

/// A signature hit inside the scan window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatMatch {
    pub format: String,
    pub mime_type: String,
    pub suspicious: bool,
    pub offset: usize,
}

/// Immutable snapshot of the registry
pub struct SignatureSet {
    signatures: Vec<Signature>,
    matcher: Option<AhoCorasick>,
}

impl SignatureSet {
    fn build(signatures: Vec<Signature>) -> Self {
        let matcher = if signatures.is_empty() {
            None
        } else {
            match AhoCorasick::new(signatures.iter().map(|s| s.pattern.as_slice())) {
                Ok(ac) => Some(ac),
                Err(e) => {
                    warn!(error = %e, "Failed to build signature automaton, using linear search");
                    None
                }
            }
        };
        Self {
            signatures,
            matcher,
        }
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter()
    }

    /// Find the first occurrence of every signature anywhere in `window`.
    ///
    /// Results are ordered by offset, ties broken by registration order, so
    /// the output is deterministic for a given snapshot.
    pub fn find_all(&self, window: &[u8]) -> Vec<FormatMatch> {
        let mut first_hit: Vec<Option<usize>> = vec![None; self.signatures.len()];

        match &self.matcher {
            Some(ac) => {
                let mut remaining = self.signatures.len();
                for mat in ac.find_overlapping_iter(window) {
                    let slot = &mut first_hit[mat.pattern().as_usize()];
                    if slot.is_none() {
                        *slot = Some(mat.start());
                        remaining -= 1;
                        if remaining == 0 {
                            break;
                        }
                    }
                }
            }
            None => {
                for (idx, signature) in self.signatures.iter().enumerate() {
                    first_hit[idx] = window
                        .windows(signature.pattern.len())
                        .position(|w| w == signature.pattern.as_slice());
                }
            }
        }

        let mut hits: Vec<(usize, usize)> = first_hit
            .iter()
            .enumerate()
            .filter_map(|(idx, offset)| offset.map(|o| (o, idx)))
            .collect();
        hits.sort_unstable();

        hits.into_iter()
            .map(|(offset, idx)| {
                let signature = &self.signatures[idx];
                FormatMatch {
                    format: signature.name.clone(),
                    mime_type: signature.mime_type.clone(),
                    suspicious: signature.suspicious,
                    offset,
                }
            })
            .collect()
    }
}

/// Process-wide, append-only signature registry
pub struct SignatureRegistry {
    current: RwLock<Arc<SignatureSet>>,
    writer: Mutex<()>,
}

static GLOBAL_REGISTRY: Lazy<Arc<SignatureRegistry>> =
    Lazy::new(|| Arc::new(SignatureRegistry::with_defaults()));

impl SignatureRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::from_signatures(Vec::new())
    }

    /// Registry seeded with the built-in signatures
    pub fn with_defaults() -> Self {
        Self::from_signatures(default_signatures())
    }

    fn from_signatures(signatures: Vec<Signature>) -> Self {
        Self {
            current: RwLock::new(Arc::new(SignatureSet::build(signatures))),
            writer: Mutex::new(()),
        }
    }

    /// The shared registry used by scans that do not bring their own
    pub fn global() -> Arc<SignatureRegistry> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Copy-on-read snapshot for one scan
    pub fn snapshot(&self) -> Arc<SignatureSet> {
        Arc::clone(&self.current.read())
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Append one signature. Prior entries are never removed or reordered.
    pub fn register(&self, signature: Signature) -> Result<(), SignatureError> {
        self.register_all(std::iter::once(signature))
    }

    /// Append several signatures as one published snapshot
    pub fn register_all<I>(&self, signatures: I) -> Result<(), SignatureError>
    where
        I: IntoIterator<Item = Signature>,
    {
        let incoming: Vec<Signature> = signatures.into_iter().collect();
        for signature in &incoming {
            if signature.name.is_empty() {
                return Err(SignatureError::EmptyName);
            }
            if signature.pattern.is_empty() {
                return Err(SignatureError::EmptyPattern {
                    name: signature.name.clone(),
                });
            }
        }
        if incoming.is_empty() {
            return Ok(());
        }

        let _guard = self.writer.lock();
        let mut next = self.snapshot().signatures.clone();
        let added = incoming.len();
        next.extend(incoming);
        let set = Arc::new(SignatureSet::build(next));
        *self.current.write() = set;

        debug!(added, total = self.len(), "Signature registry extended");
        Ok(())
    }
}

impl Default for SignatureRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Built-in signature table
pub fn default_signatures() -> Vec<Signature> {
    let table: &[(&str, &str, &[&str], &[u8], bool)] = &[
        // Archives
        ("zip", "application/zip", &["zip", "jar", "docx", "xlsx", "pptx", "apk"], &[0x50, 0x4B, 0x03, 0x04], false),
        ("zip", "application/zip", &["zip"], &[0x50, 0x4B, 0x05, 0x06], false),
        ("rar", "application/x-rar-compressed", &["rar"], &[0x52, 0x61, 0x72, 0x21, 0x1A, 0x07], false),
        ("7z", "application/x-7z-compressed", &["7z"], &[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C], false),
        ("gzip", "application/gzip", &["gz", "tgz"], &[0x1F, 0x8B, 0x08], false),
        // Documents
        ("pdf", "application/pdf", &["pdf"], b"%PDF-", false),
        // Images
        ("png", "image/png", &["png"], &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], false),
        ("jpg", "image/jpeg", &["jpg", "jpeg"], &[0xFF, 0xD8, 0xFF], false),
        ("gif", "image/gif", &["gif"], b"GIF87a", false),
        ("gif", "image/gif", &["gif"], b"GIF89a", false),
        ("svg", "image/svg+xml", &["svg"], b"<svg", false),
        // Executables
        ("exe", "application/vnd.microsoft.portable-executable", &["exe", "dll"], &[0x4D, 0x5A], true),
        ("elf", "application/x-elf", &["elf", "so"], &[0x7F, 0x45, 0x4C, 0x46], true),
        ("macho", "application/x-mach-binary", &["dylib"], &[0xFE, 0xED, 0xFA, 0xCE], true),
        ("macho", "application/x-mach-binary", &["dylib"], &[0xFE, 0xED, 0xFA, 0xCF], true),
        ("macho", "application/x-mach-binary", &["dylib"], &[0xCF, 0xFA, 0xED, 0xFE], true),
    ];

    table
        .iter()
        .map(|(name, mime, extensions, pattern, suspicious)| Signature {
            name: name.to_string(),
            mime_type: mime.to_string(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            pattern: pattern.to_vec(),
            suspicious: *suspicious,
        })
        .collect()
}
