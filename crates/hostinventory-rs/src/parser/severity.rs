use crate::{
    config::SeverityCvss,
    models::{SecurityFinding, Severity},
};

/// Keyword classification of free-text hardening findings.
pub fn classify_text(text: &str) -> Severity {
    let lower = text.to_lowercase();
    if ["critical", "severe vulnerability", "remote code execution"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Severity::Critical;
    }
    if ["high risk", "vulnerab", "unsafe"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Severity::High;
    }
    if ["medium", "consider", "recommended"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Severity::Medium;
    }
    Severity::Low
}

/// Whether a hardening suggestion is worth tracking as a finding.
pub fn is_security_related(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["security", "vulnerab", "protect", "risk", "attack"]
        .iter()
        .any(|k| lower.contains(k))
}

struct ExposureRule {
    service: &'static str,
    cvss: f32,
    severity: Severity,
    summary: &'static str,
}

const EXPOSURE_RULES: &[ExposureRule] = &[
    ExposureRule {
        service: "telnet",
        cvss: 7.5,
        severity: Severity::High,
        summary: "Telnet uses unencrypted communications",
    },
    ExposureRule {
        service: "ftp",
        cvss: 5.0,
        severity: Severity::Medium,
        summary: "FTP may allow anonymous access or uses unencrypted communications",
    },
    ExposureRule {
        service: "rsh",
        cvss: 8.0,
        severity: Severity::High,
        summary: "Remote shell protocol has weak authentication",
    },
    ExposureRule {
        service: "rlogin",
        cvss: 8.0,
        severity: Severity::High,
        summary: "Remote login protocol has weak authentication",
    },
    ExposureRule {
        service: "rexec",
        cvss: 8.0,
        severity: Severity::High,
        summary: "Remote execution protocol has weak authentication",
    },
    ExposureRule {
        service: "tftp",
        cvss: 5.0,
        severity: Severity::Medium,
        summary: "Trivial FTP has no authentication",
    },
    ExposureRule {
        service: "finger",
        cvss: 5.0,
        severity: Severity::Medium,
        summary: "Finger protocol can leak user information",
    },
    ExposureRule {
        service: "http",
        cvss: 4.0,
        severity: Severity::Medium,
        summary: "HTTP service without TLS encryption",
    },
    ExposureRule {
        service: "postgresql",
        cvss: 4.0,
        severity: Severity::Medium,
        summary: "PostgreSQL database potentially exposed to network",
    },
    ExposureRule {
        service: "mysql",
        cvss: 4.0,
        severity: Severity::Medium,
        summary: "MySQL database potentially exposed to network",
    },
    ExposureRule {
        service: "microsoft-ds",
        cvss: 5.0,
        severity: Severity::Medium,
        summary: "SMB file sharing service potentially exposed",
    },
];

/// Finding for an open port running a service known to be risky when exposed.
pub fn exposure_finding(service: &str, port: u16, protocol: &str) -> Option<SecurityFinding> {
    let rule = EXPOSURE_RULES.iter().find(|r| r.service == service)?;
    Some(SecurityFinding {
        name: format!("Exposed {service} service on port {port}"),
        finding_type: "network".to_string(),
        severity: rule.severity,
        cvss_score: rule.cvss,
        description: format!("{} on port {port}/{protocol}", rule.summary),
        recommendation: format!(
            "Consider disabling or restricting access to the {service} service"
        ),
        cve_references: vec![],
    })
}

pub fn configuration_finding(
    name: String,
    severity: Severity,
    cvss: &SeverityCvss,
    description: String,
    recommendation: String,
) -> SecurityFinding {
    SecurityFinding {
        name,
        finding_type: "configuration".to_string(),
        severity,
        cvss_score: cvss.score(severity),
        description,
        recommendation,
        cve_references: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_pick_severity() {
        assert_eq!(
            classify_text("Remote code execution possible in service"),
            Severity::Critical
        );
        assert_eq!(classify_text("Found unsafe file permissions"), Severity::High);
        assert_eq!(classify_text("Consider hardening SSH"), Severity::Medium);
        assert_eq!(classify_text("Reboot of system is needed"), Severity::Low);
    }

    #[test]
    fn known_risky_services_produce_findings() {
        let f = exposure_finding("telnet", 23, "tcp").expect("telnet is risky");
        assert_eq!(f.severity, Severity::High);
        assert_eq!(f.cvss_score, 7.5);
        assert_eq!(f.finding_type, "network");
        assert_eq!(f.description, "Telnet uses unencrypted communications on port 23/tcp");
        assert!(exposure_finding("ssh", 22, "tcp").is_none());
    }
}
