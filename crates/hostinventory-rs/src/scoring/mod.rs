use crate::{config::ScoreWeights, models::SecurityFinding};

/// Health of a host on a 0-100 scale.
///
/// Starts at 100 and subtracts a weighted penalty per finding. When a
/// hardening index is known the result is averaged with it.
pub fn health_score(
    findings: &[SecurityFinding],
    hardening_index: Option<u8>,
    weights: &ScoreWeights,
) -> u8 {
    let penalty: f64 = findings.iter().map(|f| weights.penalty(f.severity)).sum();
    let score = (100.0 - penalty).clamp(0.0, 100.0);
    let combined = match hardening_index {
        Some(index) => (score + f64::from(index.min(100))) / 2.0,
        None => score,
    };
    combined.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;

    fn finding(severity: Severity) -> SecurityFinding {
        SecurityFinding {
            name: format!("{severity:?}"),
            finding_type: "configuration".into(),
            severity,
            cvss_score: 0.0,
            description: String::new(),
            recommendation: String::new(),
            cve_references: vec![],
        }
    }

    #[test]
    fn weighted_penalties() {
        let w = ScoreWeights::default();
        assert_eq!(health_score(&[], None, &w), 100);
        let findings = vec![
            finding(Severity::Critical),
            finding(Severity::High),
            finding(Severity::Medium),
            finding(Severity::Low),
        ];
        // 100 - 10 - 5 - 2 - 0.5 = 82.5
        assert_eq!(health_score(&findings, None, &w), 83);
    }

    #[test]
    fn hardening_index_is_averaged_in() {
        let w = ScoreWeights::default();
        let findings = vec![finding(Severity::High), finding(Severity::High)];
        assert_eq!(health_score(&findings, Some(64), &w), 77);
        assert_eq!(health_score(&[], Some(0), &w), 50);
    }

    #[test]
    fn floor_is_zero() {
        let w = ScoreWeights::default();
        let findings: Vec<_> = (0..20).map(|_| finding(Severity::Critical)).collect();
        assert_eq!(health_score(&findings, None, &w), 0);
    }

    #[test]
    fn more_severe_findings_never_raise_the_score() {
        let w = ScoreWeights::default();
        let mut findings = Vec::new();
        let mut last = health_score(&findings, Some(80), &w);
        for i in 0..15 {
            let sev = if i % 2 == 0 { Severity::Critical } else { Severity::High };
            findings.push(finding(sev));
            let next = health_score(&findings, Some(80), &w);
            assert!(next <= last);
            last = next;
        }
    }

    #[test]
    fn misconfigured_weights_keep_score_in_range_and_monotonic() {
        let w = ScoreWeights {
            critical: f64::NAN,
            high: -40.0,
            medium: f64::NEG_INFINITY,
            low: -1.0,
        };
        let mut findings = Vec::new();
        let mut last = health_score(&findings, None, &w);
        assert_eq!(last, 100);
        for sev in [Severity::High, Severity::Medium, Severity::Low, Severity::Critical] {
            findings.push(finding(sev));
            let next = health_score(&findings, None, &w);
            assert!(next <= last);
            last = next;
        }
        assert_eq!(last, 88);
    }
}
