//! Verdict aggregation.
//!
//! Reduces any number of findings to a single verdict over the totally ordered
//! set `Clean < Suspicious < Malicious`. The reduction is a pure maximum, so it
//! is independent of finding order and monotone under adding findings.

use crate::models::{Finding, Severity, Verdict};

/// Aggregate findings into one verdict.
///
/// Malicious is absorbing and short-circuits the scan of the remaining
/// findings; no findings yields `Clean`.
pub fn aggregate<'a, I>(findings: I) -> Verdict
where
    I: IntoIterator<Item = &'a Finding>,
{
    aggregate_severities(findings.into_iter().map(|f| f.severity))
}

/// Same reduction over bare severities.
pub fn aggregate_severities<I>(severities: I) -> Verdict
where
    I: IntoIterator<Item = Severity>,
{
    let mut verdict = Severity::Clean;
    for severity in severities {
        if severity == Severity::Malicious {
            return Severity::Malicious;
        }
        verdict = verdict.max(severity);
    }
    verdict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_clean() {
        let findings: Vec<Finding> = Vec::new();
        assert_eq!(aggregate(&findings), Severity::Clean);
    }

    #[test]
    fn test_suspicious_without_malicious() {
        let findings = vec![
            Finding::new("info", Severity::Clean),
            Finding::suspicious("polyglot_magic"),
        ];
        assert_eq!(aggregate(&findings), Severity::Suspicious);
    }

    #[test]
    fn test_malicious_is_absorbing() {
        let findings = vec![
            Finding::suspicious("zip_symlink_entry"),
            Finding::malicious("zip_path_traversal"),
            Finding::new("info", Severity::Clean),
        ];
        assert_eq!(aggregate(&findings), Severity::Malicious);
    }

    #[test]
    fn test_clean_findings_stay_clean() {
        let findings = vec![Finding::new("scan_timeout", Severity::Clean)];
        assert_eq!(aggregate(&findings), Severity::Clean);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn severity_strategy() -> impl Strategy<Value = Severity> {
        prop_oneof![
            Just(Severity::Clean),
            Just(Severity::Suspicious),
            Just(Severity::Malicious),
        ]
    }

    fn findings_strategy() -> impl Strategy<Value = Vec<Finding>> {
        prop::collection::vec(
            (severity_strategy(), "[a-z_]{1,12}")
                .prop_map(|(severity, rule)| Finding::new(rule, severity)),
            0..24,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Adding a finding never lowers the verdict.
        #[test]
        fn prop_aggregate_is_monotone(
            findings in findings_strategy(),
            extra in severity_strategy(),
        ) {
            let before = aggregate(&findings);
            let mut extended = findings.clone();
            extended.push(Finding::new("extra", extra));
            let after = aggregate(&extended);
            prop_assert!(before <= after, "{:?} > {:?}", before, after);
        }

        /// Finding order never changes the verdict.
        #[test]
        fn prop_aggregate_is_order_independent(findings in findings_strategy()) {
            let forward = aggregate(&findings);
            let mut reversed = findings.clone();
            reversed.reverse();
            prop_assert_eq!(forward, aggregate(&reversed));
        }

        /// The verdict equals the maximum severity present.
        #[test]
        fn prop_aggregate_is_max(findings in findings_strategy()) {
            let expected = findings
                .iter()
                .map(|f| f.severity)
                .max()
                .unwrap_or(Severity::Clean);
            prop_assert_eq!(aggregate(&findings), expected);
        }
    }
}
