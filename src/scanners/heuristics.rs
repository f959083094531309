//! Content heuristics.
//!
//! Cheap, pattern-level signals: PHP webshell markers, JavaScript obfuscation
//! markers, Shannon entropy, packer hints in PE images, macro-bearing office
//! containers, risky PDF actions and the EICAR test string. Each rule carries a
//! weight; once the summed weight reaches the configured threshold an extra
//! malicious `heuristic_threshold_exceeded` finding is emitted.

use aho_corasick::AhoCorasick;
use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{run_blocking, Scanner};
use crate::error::Result;
use crate::models::{Finding, Severity};

pub const RULE_THRESHOLD_EXCEEDED: &str = "heuristic_threshold_exceeded";

/// Entropy is meaningless on tiny inputs
const ENTROPY_MIN_LEN: usize = 1024;

const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const EICAR_MARKER: &[u8] = b"EICAR-STANDARD-ANTIVIRUS-TEST-FILE";

struct PatternRule {
    rule: &'static str,
    weight: u32,
    severity: Severity,
    regex: Regex,
}

fn pattern(rule: &'static str, weight: u32, severity: Severity, source: &str) -> PatternRule {
    PatternRule {
        rule,
        weight,
        severity,
        regex: Regex::new(source).expect("static heuristic pattern"),
    }
}

static PHP_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<\?php").expect("static pattern"));

static PHP_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        pattern(
            "php_dangerous_func",
            40,
            Severity::Suspicious,
            r"(?i)(?:eval|assert|system|shell_exec|passthru|popen|proc_open)\s*\(",
        ),
        pattern(
            "php_variable_func_from_user_input",
            50,
            Severity::Suspicious,
            r"(?i)\$\w+\s*\(\s*\$_(?:GET|POST|REQUEST)\b",
        ),
        pattern(
            "php_base64_decode_long",
            30,
            Severity::Suspicious,
            r#"(?i)base64_decode\s*\(\s*['"][A-Za-z0-9+/=]{100,}"#,
        ),
        pattern(
            "php_rfi_http_include",
            50,
            Severity::Suspicious,
            r#"(?i)(?:include|require|include_once|require_once)\s*\(\s*['"]https?://"#,
        ),
    ]
});

// Only text that looks like script at all gets the JS rules
static JS_GATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"function|=>|eval|atob|new Function|\bimport\(").expect("static pattern")
});

static JS_RULES: Lazy<Vec<PatternRule>> = Lazy::new(|| {
    vec![
        pattern("js_eval", 30, Severity::Suspicious, r"(?i)eval\s*\("),
        pattern("js_new_function", 30, Severity::Suspicious, r"(?i)new\s+Function\s*\("),
        pattern(
            "js_atob_long",
            20,
            Severity::Clean,
            r#"(?i)atob\s*\(\s*['"][A-Za-z0-9+/=]{80,}"#,
        ),
        pattern(
            "js_timed_code",
            20,
            Severity::Clean,
            r#"(?i)(?:unescape|setTimeout|setInterval)\s*\(\s*['"][^'"]{60,}['"]\s*,\s*\d+\s*\)"#,
        ),
    ]
});

static PDF_ACTIONS: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasick::new(["/JavaScript", "/OpenAction", "/AA", "/Launch"])
        .expect("static marker set")
});

/// Heuristics switches and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicsConfig {
    #[serde(default = "enabled")]
    pub enable_php: bool,
    #[serde(default = "enabled")]
    pub enable_js: bool,
    #[serde(default = "enabled")]
    pub enable_entropy: bool,
    #[serde(default = "enabled")]
    pub enable_pe_hints: bool,
    #[serde(default = "enabled")]
    pub enable_documents: bool,
    /// Bits per byte, 0..=8
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
    /// Summed weight at which the blob is called malicious
    #[serde(default = "default_score_threshold")]
    pub score_threshold: u32,
}

fn enabled() -> bool {
    true
}

fn default_entropy_threshold() -> f64 {
    7.2
}

fn default_score_threshold() -> u32 {
    75
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            enable_php: true,
            enable_js: true,
            enable_entropy: true,
            enable_pe_hints: true,
            enable_documents: true,
            entropy_threshold: default_entropy_threshold(),
            score_threshold: default_score_threshold(),
        }
    }
}

/// Findings plus the summed rule weight
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeuristicReport {
    pub findings: Vec<Finding>,
    pub score: u32,
}

impl HeuristicReport {
    fn hit(&mut self, rule: &str, weight: u32, severity: Severity) -> &mut Finding {
        self.score = self.score.saturating_add(weight);
        self.findings.push(
            Finding::new(rule, severity)
                .with_tag("heuristic")
                .with_metadata(serde_json::json!({ "weight": weight })),
        );
        let last = self.findings.len() - 1;
        &mut self.findings[last]
    }
}

#[derive(Debug, Clone, Default)]
pub struct HeuristicsScanner {
    config: HeuristicsConfig,
}

impl HeuristicsScanner {
    pub fn new(config: HeuristicsConfig) -> Self {
        Self { config }
    }

    pub fn with_threshold(mut self, score_threshold: u32) -> Self {
        self.config.score_threshold = score_threshold;
        self
    }

    pub fn config(&self) -> &HeuristicsConfig {
        &self.config
    }

    /// Run every enabled rule over `data`.
    pub fn analyze(&self, data: &[u8]) -> HeuristicReport {
        let mut report = HeuristicReport::default();

        if data
            .windows(EICAR_MARKER.len())
            .any(|window| window == EICAR_MARKER)
        {
            report.hit("eicar_test_file", 100, Severity::Malicious);
        }

        if self.config.enable_php && PHP_OPEN.is_match(data) {
            apply_rules(&PHP_RULES, data, &mut report);
        }

        if self.config.enable_js && JS_GATE.is_match(data) {
            apply_rules(&JS_RULES, data, &mut report);
        }

        if self.config.enable_entropy && data.len() >= ENTROPY_MIN_LEN {
            let entropy = shannon_entropy(data);
            if entropy >= self.config.entropy_threshold {
                report.hit("high_entropy_blob", 15, Severity::Clean).metadata =
                    Some(serde_json::json!({ "weight": 15, "entropy": entropy }));
            }
        }

        if self.config.enable_pe_hints && data.starts_with(b"MZ") && has_upx_marker(data) {
            report.hit("pe_upx_signature", 25, Severity::Suspicious);
        }

        if self.config.enable_documents {
            check_documents(data, &mut report);
        }

        let threshold = self.config.score_threshold;
        if threshold > 0 && report.score >= threshold {
            report.findings.push(
                Finding::malicious(RULE_THRESHOLD_EXCEEDED)
                    .with_tag("heuristic")
                    .with_metadata(serde_json::json!({
                        "score": report.score,
                        "threshold": threshold,
                    })),
            );
        }

        debug!(
            score = report.score,
            hits = report.findings.len(),
            bytes = data.len(),
            "Heuristics finished"
        );
        report
    }
}

#[async_trait]
impl Scanner for HeuristicsScanner {
    fn name(&self) -> &str {
        "heuristics"
    }

    async fn scan(&self, data: &[u8]) -> Result<Vec<Finding>> {
        self.scan_shared(Bytes::copy_from_slice(data)).await
    }

    // Regex and entropy passes run on the blocking pool
    async fn scan_shared(&self, data: Bytes) -> Result<Vec<Finding>> {
        let scanner = self.clone();
        run_blocking(self.name(), move || scanner.analyze(&data).findings).await
    }
}

fn apply_rules(rules: &[PatternRule], data: &[u8], report: &mut HeuristicReport) {
    for rule in rules {
        if rule.regex.is_match(data) {
            report.hit(rule.rule, rule.weight, rule.severity);
        }
    }
}

fn has_upx_marker(data: &[u8]) -> bool {
    data.windows(4).any(|w| w == b"UPX!" || w == b".UPX")
}

fn check_documents(data: &[u8], report: &mut HeuristicReport) {
    if data.starts_with(OLE_MAGIC) {
        report.hit("office_ole_container", 10, Severity::Clean);
    }

    // vbaProject.bin is stored under its own name in the directory, so the
    // raw bytes carry it even when deflated
    if data.starts_with(b"PK\x03\x04")
        && data
            .windows(b"vbaProject.bin".len())
            .any(|w| w == b"vbaProject.bin")
    {
        report.hit("office_ooxml_macros", 30, Severity::Suspicious);
    }

    if data.starts_with(b"%PDF-") {
        let mut actions: Vec<&'static str> = PDF_ACTIONS
            .find_iter(data)
            .map(|m| match m.pattern().as_usize() {
                0 => "/JavaScript",
                1 => "/OpenAction",
                2 => "/AA",
                _ => "/Launch",
            })
            .collect();
        actions.sort_unstable();
        actions.dedup();
        if !actions.is_empty() {
            report.hit("pdf_risky_actions", 30, Severity::Suspicious).metadata =
                Some(serde_json::json!({ "weight": 30, "actions": actions }));
        }
    }
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &byte in data {
        counts[byte as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(report: &HeuristicReport) -> Vec<&str> {
        report.findings.iter().map(|f| f.rule.as_str()).collect()
    }

    #[test]
    fn test_plain_text_is_quiet() {
        let scanner = HeuristicsScanner::default();
        let report = scanner.analyze(b"hello world, nothing to see here");
        assert!(report.findings.is_empty());
        assert_eq!(report.score, 0);
    }

    #[test]
    fn test_php_webshell_crosses_threshold() {
        let scanner = HeuristicsScanner::default();
        let shell = b"<?php $f = $_GET['f']; $f($_GET['x']); system($_POST['cmd']); ?>";
        let report = scanner.analyze(shell);
        let hits = rules(&report);
        assert!(hits.contains(&"php_dangerous_func"));
        assert!(hits.contains(&"php_variable_func_from_user_input"));
        assert_eq!(report.score, 90);
        assert!(hits.contains(&RULE_THRESHOLD_EXCEEDED));
    }

    #[test]
    fn test_php_rules_need_open_tag() {
        let scanner = HeuristicsScanner::default();
        let report = scanner.analyze(b"system($cmd);");
        assert!(!rules(&report).contains(&"php_dangerous_func"));
    }

    #[test]
    fn test_js_eval_is_suspicious_below_threshold() {
        let scanner = HeuristicsScanner::default();
        let report = scanner.analyze(b"function f(x) { return eval(x); }");
        assert_eq!(rules(&report), vec!["js_eval"]);
        assert_eq!(report.findings[0].severity, Severity::Suspicious);
    }

    #[test]
    fn test_lower_threshold_flags_js() {
        let scanner = HeuristicsScanner::default().with_threshold(30);
        let report = scanner.analyze(b"eval(atob(x))");
        assert!(rules(&report).contains(&RULE_THRESHOLD_EXCEEDED));
    }

    #[test]
    fn test_eicar_is_malicious() {
        let eicar = br"X5O!P%@AP[4\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
        let report = HeuristicsScanner::default().analyze(eicar);
        assert_eq!(report.findings[0].rule, "eicar_test_file");
        assert_eq!(report.findings[0].severity, Severity::Malicious);
    }

    #[test]
    fn test_entropy_of_uniform_bytes() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let entropy = shannon_entropy(&data);
        assert!((entropy - 8.0).abs() < 1e-9);

        let report = HeuristicsScanner::default().analyze(&data);
        let finding = report
            .findings
            .iter()
            .find(|f| f.rule == "high_entropy_blob")
            .unwrap();
        assert_eq!(finding.severity, Severity::Clean);
    }

    #[test]
    fn test_entropy_skips_small_inputs() {
        let data: Vec<u8> = (0..=255u8).collect();
        assert!(HeuristicsScanner::default().analyze(&data).findings.is_empty());
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7; 100]), 0.0);
    }

    #[test]
    fn test_upx_hint_requires_mz() {
        let scanner = HeuristicsScanner::default();
        assert!(rules(&scanner.analyze(b"MZ\x90\x00....UPX!....")).contains(&"pe_upx_signature"));
        assert!(scanner.analyze(b"ELF....UPX!....").findings.is_empty());
    }

    #[test]
    fn test_pdf_actions_listed_once() {
        let pdf = b"%PDF-1.7\n1 0 obj << /OpenAction 2 0 R /JavaScript (x) /OpenAction >>";
        let report = HeuristicsScanner::default().analyze(pdf);
        let finding = report
            .findings
            .iter()
            .find(|f| f.rule == "pdf_risky_actions")
            .unwrap();
        let actions = finding.metadata.as_ref().unwrap()["actions"].as_array().unwrap();
        assert_eq!(actions.len(), 2);
    }

    #[test]
    fn test_disabled_rules_stay_silent() {
        let config = HeuristicsConfig {
            enable_js: false,
            ..HeuristicsConfig::default()
        };
        let report = HeuristicsScanner::new(config).analyze(b"eval(x)");
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: HeuristicsConfig = serde_json::from_str(r#"{ "score_threshold": 60 }"#).unwrap();
        assert_eq!(config.score_threshold, 60);
        assert!(config.enable_php);
        assert_eq!(config.entropy_threshold, 7.2);
    }

    #[tokio::test]
    async fn test_scanner_name_and_scan() {
        let scanner = HeuristicsScanner::default();
        assert_eq!(scanner.name(), "heuristics");
        let findings = scanner.scan(b"<?php eval($x); ?>").await.unwrap();
        assert!(findings.iter().any(|f| f.rule == "php_dangerous_func"));
    }

    #[tokio::test]
    async fn test_shared_scan_matches_analyze() {
        let scanner = HeuristicsScanner::default().with_threshold(1);
        let shell = b"<?php system($_GET['c']); ?>";
        let expected = scanner.analyze(shell).findings;
        let findings = scanner.scan_shared(Bytes::from_static(shell)).await.unwrap();
        assert_eq!(findings, expected);
    }
}
