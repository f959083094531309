//! Archive integrity analysis
//!
//! Cross-checks the local headers against the central directory and flags
//! entries that would escape an extraction root or materialize as symlinks.
//! On raw bytes it also checks that the end-of-directory record exists and
//! describes a directory that fits the blob. Every anomaly is a finding;
//! nothing here fails.

use std::collections::HashMap;
use tracing::{debug, warn};

use super::path_validator::{validate_entry_name, ValidationResult};
use super::zip_headers::{
    find_central_directory, parse_cen, parse_lfh, CentralHeader, DirectoryError,
    DirectoryListing, LocalHeader,
};
use crate::models::{ArchiveFinding, ArchiveTag, Severity, Verdict};
use crate::utils::encoding::decode_zip_name_with_info;

/// Analyze already-parsed header views.
///
/// - traversal names (either header kind): malicious, one finding per name
/// - Unix-host symlink entries: suspicious
/// - LFH and CEN name multisets differ: one suspicious finding. Local
///   records with no central records at all is a difference too, since a
///   streaming extractor would still unpack them.
pub fn analyze<'a, L, C>(lfh: L, cen: C) -> Vec<ArchiveFinding>
where
    L: IntoIterator<Item = LocalHeader<'a>>,
    C: IntoIterator<Item = CentralHeader<'a>>,
{
    let mut findings = Vec::new();
    let mut flagged_names: Vec<String> = Vec::new();
    let mut lfh_names: HashMap<&'a [u8], i64> = HashMap::new();
    let mut cen_names: HashMap<&'a [u8], i64> = HashMap::new();
    let mut lfh_count = 0usize;
    let mut cen_count = 0usize;

    for header in lfh {
        lfh_count += 1;
        *lfh_names.entry(header.name_bytes).or_default() += 1;
        check_traversal(&header.decoded_name(), &mut flagged_names, &mut findings);
    }

    for header in cen {
        cen_count += 1;
        *cen_names.entry(header.name_bytes).or_default() += 1;
        let (name, encoding) = decode_zip_name_with_info(header.name_bytes, header.flags);
        if encoding.had_errors {
            debug!(entry = %name, encoding = encoding.encoding, "Entry name is not valid in its declared encoding");
        }
        check_traversal(&name, &mut flagged_names, &mut findings);

        if header.is_symlink() {
            warn!(entry = %name, mode = %format!("{:o}", header.unix_mode()), "Symlink entry in archive");
            findings.push(
                ArchiveFinding::new(
                    ArchiveTag::Symlink,
                    Severity::Suspicious,
                    "central directory marks entry as a symbolic link",
                )
                .with_entry(name.into_owned()),
            );
        }
    }

    if lfh_names != cen_names {
        let detail = mismatch_detail(&lfh_names, &cen_names);
        warn!(lfh = lfh_count, cen = cen_count, %detail, "Local and central names disagree");
        findings.push(ArchiveFinding::new(
            ArchiveTag::LfhMismatch,
            Severity::Suspicious,
            detail,
        ));
    }

    findings
}

/// Parse and analyze a raw blob: header checks plus directory structure
pub fn analyze_bytes(bytes: &[u8]) -> Vec<ArchiveFinding> {
    let mut findings = analyze(parse_lfh(bytes), parse_cen(bytes));
    if parse_lfh(bytes).next().is_some() || parse_cen(bytes).next().is_some() {
        findings.extend(directory_findings(bytes));
    }
    findings
}

/// End-of-directory checks, all suspicious:
/// - no EOCD record
/// - EOCD describes a directory outside the blob
/// - fewer or more directory records than the EOCD declares
pub fn directory_findings(bytes: &[u8]) -> Vec<ArchiveFinding> {
    let directory = match find_central_directory(bytes) {
        Ok(directory) => directory,
        Err(error) => {
            let tag = match error {
                DirectoryError::EocdNotFound => ArchiveTag::EocdNotFound,
                DirectoryError::OutOfBounds { .. } => ArchiveTag::CdOutOfBounds,
            };
            warn!(%error, "Central directory unusable");
            return vec![ArchiveFinding::new(tag, Severity::Suspicious, error.to_string())];
        }
    };

    let parsed = DirectoryListing::from_directory(bytes, &directory).count() as u64;
    if parsed != directory.entries {
        warn!(parsed, declared = directory.entries, "Central directory truncated");
        return vec![ArchiveFinding::new(
            ArchiveTag::CdTruncated,
            Severity::Suspicious,
            format!(
                "central directory holds {} records, end record declares {}",
                parsed, directory.entries
            ),
        )];
    }
    Vec::new()
}

/// Component-local verdict: traversal is malicious, any other finding suspicious
pub fn integrity_verdict(findings: &[ArchiveFinding]) -> Verdict {
    if findings.iter().any(|f| f.tag == ArchiveTag::Traversal) {
        Severity::Malicious
    } else if findings.is_empty() {
        Severity::Clean
    } else {
        Severity::Suspicious
    }
}

fn check_traversal(name: &str, flagged: &mut Vec<String>, findings: &mut Vec<ArchiveFinding>) {
    let ValidationResult::Unsafe(reason) = validate_entry_name(name) else {
        return;
    };
    if flagged.iter().any(|n| n == name) {
        return;
    }
    warn!(entry = %name, reason = reason.describe(), "Path traversal entry in archive");
    flagged.push(name.to_string());
    findings.push(
        ArchiveFinding::new(
            ArchiveTag::Traversal,
            Severity::Malicious,
            format!("entry name is unsafe: {}", reason.describe()),
        )
        .with_entry(name),
    );
}

fn mismatch_detail(lfh: &HashMap<&[u8], i64>, cen: &HashMap<&[u8], i64>) -> String {
    let mut only_local: Vec<String> = Vec::new();
    let mut only_central: Vec<String> = Vec::new();

    for (name, count) in lfh {
        let diff = count - cen.get(name).copied().unwrap_or(0);
        if diff > 0 {
            only_local.push(String::from_utf8_lossy(name).into_owned());
        }
    }
    for (name, count) in cen {
        let diff = count - lfh.get(name).copied().unwrap_or(0);
        if diff > 0 {
            only_central.push(String::from_utf8_lossy(name).into_owned());
        }
    }
    only_local.sort();
    only_central.sort();

    format!(
        "local-only: [{}]; central-only: [{}]",
        only_local.join(", "),
        only_central.join(", ")
    )
}
