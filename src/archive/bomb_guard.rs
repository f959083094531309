//! Archive bomb guard
//!
//! A pull-based walker over a ZIP blob and every ZIP nested inside it. Each
//! call to `next()` does a bounded amount of work: one directory record, one
//! entry inflated in fixed-size chunks with the budget checked after every
//! chunk. Dropping the walker cancels the walk.
//!
//! Entries come from the central directory when there is one, otherwise from
//! the local headers, which is what a streaming extractor would read.

use bytes::Bytes;
use flate2::bufread::DeflateDecoder;
use std::io::Read;
use std::iter::FusedIterator;
use thiserror::Error;
use tracing::{debug, warn};

use super::budget::{Budget, BudgetExceeded, WalkCounters};
use super::path_validator::{validate_entry_name, ValidationResult};
use super::zip_headers::{
    read_local_header, CentralHeader, DirectoryCursor, LFH_SIGNATURE, METHOD_DEFLATED,
    METHOD_STORED,
};
use crate::models::{ArchiveFinding, ArchiveTag, Severity};

/// Inflation chunk size
pub const INFLATE_CHUNK: usize = 16 * 1024;

/// Separator between an archive path and the path of an entry nested in it
pub const NESTED_SEPARATOR: &str = "!/";

/// One decompressed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Full path, nested archives joined with `!/`
    pub path: String,
    /// Depth of the archive holding the entry (top level is the starting depth)
    pub depth: usize,
    pub data: Bytes,
    pub method: u16,
    pub compressed_size: u64,
}

impl WalkEntry {
    /// The entry is itself a ZIP archive that the walker descends into
    pub fn is_archive(&self) -> bool {
        self.data.starts_with(&LFH_SIGNATURE)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WalkError {
    #[error(transparent)]
    Budget(#[from] BudgetExceeded),

    #[error("unsafe entry name '{name}': {reason}")]
    UnsafeName { name: String, reason: &'static str },
}

impl WalkError {
    pub fn to_finding(&self) -> ArchiveFinding {
        match self {
            WalkError::Budget(exceeded) => exceeded.to_finding(),
            WalkError::UnsafeName { name, .. } => {
                ArchiveFinding::new(ArchiveTag::Traversal, Severity::Malicious, self.to_string())
                    .with_entry(name.clone())
            }
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            WalkError::Budget(exceeded) => exceeded.severity(),
            WalkError::UnsafeName { .. } => Severity::Malicious,
        }
    }
}

enum FrameData<'a> {
    Borrowed(&'a [u8]),
    Shared(Bytes),
}

impl FrameData<'_> {
    fn as_slice(&self) -> &[u8] {
        match self {
            FrameData::Borrowed(bytes) => bytes,
            FrameData::Shared(bytes) => bytes,
        }
    }
}

struct Frame<'a> {
    data: FrameData<'a>,
    cursor: DirectoryCursor,
    depth: usize,
    /// Path of the archive this frame walks, empty at the top level
    prefix: String,
}

impl<'a> Frame<'a> {
    fn new(data: FrameData<'a>, depth: usize, prefix: String) -> Self {
        let cursor = DirectoryCursor::new(data.as_slice());
        Self {
            data,
            cursor,
            depth,
            prefix,
        }
    }
}

/// Lazy walker returned by [`walk`]
pub struct ArchiveWalker<'a> {
    budget: Budget,
    counters: WalkCounters,
    stack: Vec<Frame<'a>>,
    done: bool,
}

/// Walk `bytes` as a ZIP archive at `depth`, descending into nested archives.
pub fn walk(bytes: &[u8], budget: Budget, depth: usize) -> ArchiveWalker<'_> {
    ArchiveWalker {
        budget,
        counters: WalkCounters::default(),
        stack: vec![Frame::new(FrameData::Borrowed(bytes), depth, String::new())],
        done: false,
    }
}

/// Drain a walk, turning the first error into a finding
pub fn walk_findings(bytes: &[u8], budget: Budget) -> Vec<ArchiveFinding> {
    walk(bytes, budget, 0)
        .filter_map(|item| item.err())
        .map(|error| error.to_finding())
        .collect()
}

impl<'a> ArchiveWalker<'a> {
    pub fn counters(&self) -> &WalkCounters {
        &self.counters
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    fn fail(&mut self, error: WalkError) -> Option<Result<WalkEntry, WalkError>> {
        warn!(
            error = %error,
            entries = self.counters.entries(),
            total_uncompressed = self.counters.total_uncompressed(),
            "Archive walk aborted"
        );
        self.done = true;
        self.stack.clear();
        Some(Err(error))
    }
}

impl<'a> Iterator for ArchiveWalker<'a> {
    type Item = Result<WalkEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let Some(frame) = self.stack.last_mut() else {
                self.done = true;
                return None;
            };

            let Frame {
                data,
                cursor,
                depth,
                prefix,
            } = frame;
            let bytes = data.as_slice();
            let Some(header) = cursor.advance(bytes) else {
                self.stack.pop();
                continue;
            };

            let step = visit_entry(
                bytes,
                &header,
                *depth,
                prefix,
                &self.budget,
                &mut self.counters,
            );
            match step {
                Ok(Visit::Skip) => continue,
                Ok(Visit::Yield(entry)) => return Some(Ok(entry)),
                Ok(Visit::Descend(entry)) => {
                    let nested = Frame::new(
                        FrameData::Shared(entry.data.clone()),
                        entry.depth + 1,
                        format!("{}{}", entry.path, NESTED_SEPARATOR),
                    );
                    self.stack.push(nested);
                    return Some(Ok(entry));
                }
                Err(error) => return self.fail(error),
            }
        }
    }
}

impl FusedIterator for ArchiveWalker<'_> {}

enum Visit {
    Skip,
    Yield(WalkEntry),
    Descend(WalkEntry),
}

fn visit_entry(
    bytes: &[u8],
    header: &CentralHeader<'_>,
    depth: usize,
    prefix: &str,
    budget: &Budget,
    counters: &mut WalkCounters,
) -> Result<Visit, WalkError> {
    counters.record_entry(budget)?;

    let name = header.decoded_name();
    if let ValidationResult::Unsafe(reason) = validate_entry_name(&name) {
        return Err(WalkError::UnsafeName {
            name: name.into_owned(),
            reason: reason.describe(),
        });
    }
    budget.check_name(&name)?;
    let path = format!("{}{}", prefix, name);

    if header.is_directory() {
        return Ok(Visit::Skip);
    }
    if header.is_encrypted() {
        debug!(entry = %path, "Skipping encrypted entry");
        return Ok(Visit::Skip);
    }

    // Declared sizes are untrusted but a declared bomb is still a bomb
    if header.uncompressed_size > budget.max_per_entry_uncompressed {
        return Err(BudgetExceeded::EntrySize {
            entry: path,
            produced: header.uncompressed_size,
            limit: budget.max_per_entry_uncompressed,
        }
        .into());
    }
    if let Some(ratio) = budget.ratio_exceeded(header.compressed_size, header.uncompressed_size) {
        return Err(BudgetExceeded::Ratio {
            entry: path,
            ratio,
            limit: budget.max_compression_ratio,
        }
        .into());
    }

    let Some(compressed) = entry_data(bytes, header) else {
        debug!(entry = %path, offset = header.local_header_offset, "Entry data out of bounds, skipping");
        return Ok(Visit::Skip);
    };

    let data = match header.method {
        METHOD_STORED => {
            check_nested_depth(compressed, &path, depth, budget)?;
            let len = compressed.len() as u64;
            if len > budget.max_per_entry_uncompressed {
                return Err(BudgetExceeded::EntrySize {
                    entry: path,
                    produced: len,
                    limit: budget.max_per_entry_uncompressed,
                }
                .into());
            }
            counters.record_bytes(len, budget)?;
            Bytes::copy_from_slice(compressed)
        }
        METHOD_DEFLATED => match inflate_entry(compressed, &path, depth, budget, counters)? {
            Some(data) => data,
            None => return Ok(Visit::Skip),
        },
        other => {
            debug!(entry = %path, method = other, "Unsupported compression method, skipping");
            return Ok(Visit::Skip);
        }
    };

    let entry = WalkEntry {
        path,
        depth,
        data,
        method: header.method,
        compressed_size: compressed.len() as u64,
    };
    if entry.is_archive() {
        Ok(Visit::Descend(entry))
    } else {
        Ok(Visit::Yield(entry))
    }
}

/// Compressed bytes of an entry, located through its local header
fn entry_data<'b>(bytes: &'b [u8], header: &CentralHeader<'_>) -> Option<&'b [u8]> {
    let offset = usize::try_from(header.local_header_offset).ok()?;
    let local = read_local_header(bytes, offset)?;
    let len = usize::try_from(header.compressed_size).ok()?;
    let end = local.data_offset.checked_add(len)?;
    if end <= bytes.len() {
        return bytes.get(local.data_offset..end);
    }
    // Truncated blob: take what is there
    bytes.get(local.data_offset..)
}

/// Fail before the nested archive's content is read when it would go too deep
fn check_nested_depth(
    head: &[u8],
    path: &str,
    depth: usize,
    budget: &Budget,
) -> Result<(), BudgetExceeded> {
    if head.starts_with(&LFH_SIGNATURE) && depth + 1 > budget.max_depth {
        return Err(BudgetExceeded::Depth {
            entry: path.to_string(),
            depth: depth + 1,
            limit: budget.max_depth,
        });
    }
    Ok(())
}

/// Inflate one entry with every limit enforced chunk by chunk.
///
/// Returns `Ok(None)` for a corrupt stream; bytes produced before the
/// corruption stay counted.
fn inflate_entry(
    compressed: &[u8],
    path: &str,
    depth: usize,
    budget: &Budget,
    counters: &mut WalkCounters,
) -> Result<Option<Bytes>, WalkError> {
    let mut decoder = DeflateDecoder::new(compressed);

    // Only the 4-byte magic is inflated before the depth decision
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        match decoder.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                debug!(entry = %path, error = %e, "Corrupt deflate stream, skipping");
                return Ok(None);
            }
        }
    }
    check_nested_depth(&magic[..filled], path, depth, budget)?;

    let mut out: Vec<u8> = Vec::with_capacity(INFLATE_CHUNK);
    out.extend_from_slice(&magic[..filled]);
    counters.record_bytes(filled as u64, budget)?;

    let mut chunk = vec![0u8; INFLATE_CHUNK];
    loop {
        let n = match decoder.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(entry = %path, error = %e, "Corrupt deflate stream, skipping");
                return Ok(None);
            }
        };
        out.extend_from_slice(&chunk[..n]);
        counters.record_bytes(n as u64, budget)?;

        let produced = out.len() as u64;
        if produced > budget.max_per_entry_uncompressed {
            return Err(BudgetExceeded::EntrySize {
                entry: path.to_string(),
                produced,
                limit: budget.max_per_entry_uncompressed,
            }
            .into());
        }
        if let Some(ratio) = budget.ratio_exceeded(decoder.total_in(), produced) {
            return Err(BudgetExceeded::Ratio {
                entry: path.to_string(),
                ratio,
                limit: budget.max_compression_ratio,
            }
            .into());
        }
    }

    Ok(Some(Bytes::from(out)))
}
