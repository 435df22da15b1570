use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::ExecutionError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ToolId {
    Nmap,
    Lynis,
    Inventory,
}

impl ToolId {
    pub const ALL: [ToolId; 3] = [ToolId::Nmap, ToolId::Lynis, ToolId::Inventory];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::Nmap => "nmap",
            ToolId::Lynis => "lynis",
            ToolId::Inventory => "inventory",
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    NotInstalled,
    NotApplicable,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Unavailable,
    NonzeroExit,
    Timeout,
    PlatformUnsupported,
    Internal,
}

/// Settled result of one adapter within a session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolOutcome {
    pub tool: ToolId,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolOutcome {
    pub fn completed(tool: ToolId, raw_output: String, duration_ms: u64) -> Self {
        Self {
            tool,
            status: ToolStatus::Completed,
            raw_output: Some(raw_output),
            reason: None,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(tool: ToolId, err: &ExecutionError, duration_ms: u64) -> Self {
        Self {
            tool,
            status: ToolStatus::Failed,
            raw_output: None,
            reason: Some(err.reason()),
            error: Some(err.to_string()),
            duration_ms,
        }
    }

    /// Outcome for a tool that was never executed.
    pub fn skipped(tool: ToolId, status: ToolStatus) -> Self {
        Self {
            tool,
            status,
            raw_output: None,
            reason: None,
            error: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    Running,
    Completed,
    Partial,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Partial | SessionState::Failed
        )
    }
}

/// Which source supplied the winning OS fields of a [`HostFacts`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactSource {
    Inventory,
    Fingerprint,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OsGuess {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<u8>,
}

/// Host identity and operating-system facts.
///
/// Parsers emit partially filled instances; the normalizer folds them into one
/// per report. Unknown fields stay `None`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFacts {
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub os_architecture: Option<String>,
    pub os_build_number: Option<String>,
    pub kernel_version: Option<String>,
    pub platform: Option<String>,
    pub last_boot: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os_guesses: Vec<OsGuess>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_source: Option<FactSource>,
}

impl HostFacts {
    pub fn primary_ip(&self) -> Option<&str> {
        self.ip_addresses.first().map(String::as_str)
    }

    /// Every key under which another scan could match this host: each IP and
    /// the lowercased hostname. Sorted and free of duplicates.
    pub fn identity_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .ip_addresses
            .iter()
            .map(|ip| format!("ip:{ip}"))
            .chain(
                self.hostname
                    .iter()
                    .map(|h| format!("host:{}", h.to_lowercase())),
            )
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    pub fn has_os(&self) -> bool {
        self.os_name.is_some()
    }
}

pub type ServiceKey = (String, Option<u16>, Option<String>);

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub name: String,
    pub display_name: String,
    pub status: String,
    pub port: Option<u16>,
    pub protocol: Option<String>,
    pub version: Option<String>,
}

impl ServiceRecord {
    pub fn key(&self) -> ServiceKey {
        (self.name.clone(), self.port, self.protocol.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRecord {
    pub name: String,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub install_date: Option<NaiveDate>,
}

impl ApplicationRecord {
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

pub type FindingKey = (String, String);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityFinding {
    pub name: String,
    #[serde(rename = "type")]
    pub finding_type: String,
    pub severity: Severity,
    pub cvss_score: f32,
    pub description: String,
    pub recommendation: String,
    #[serde(default)]
    pub cve_references: Vec<String>,
}

impl SecurityFinding {
    pub fn key(&self) -> FindingKey {
        (self.name.clone(), self.finding_type.clone())
    }
}

/// Normalized result of one scan session.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scan_id: String,
    pub target: String,
    pub status: SessionState,
    pub host: HostFacts,
    pub services: Vec<ServiceRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub findings: Vec<SecurityFinding>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub hardening_index: Option<u8>,
    pub health_score: u8,
    pub tools: BTreeMap<ToolId, ToolOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl ScanReport {
    pub fn count_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    #[default]
    Open,
    InProgress,
    Fixed,
    AcceptedRisk,
    FalsePositive,
}

/// A finding as tracked on an asset, with operator-owned remediation state.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedFinding {
    #[serde(flatten)]
    pub finding: SecurityFinding,
    pub status: FindingStatus,
    pub assignee: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl TrackedFinding {
    pub fn new(finding: SecurityFinding, seen: DateTime<Utc>) -> Self {
        Self {
            finding,
            status: FindingStatus::Open,
            assignee: None,
            first_seen: seen,
            last_seen: seen,
        }
    }
}

/// Everything needed to create an asset; the store assigns the id.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSeed {
    pub name: String,
    pub host: HostFacts,
    pub labels: BTreeSet<String>,
    pub services: Vec<ServiceRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub findings: Vec<SecurityFinding>,
    pub health_score: u8,
    pub last_scan: DateTime<Utc>,
}

impl AssetSeed {
    pub fn from_report(report: &ScanReport) -> Self {
        let name = report
            .host
            .hostname
            .clone()
            .or_else(|| report.host.primary_ip().map(ToString::to_string))
            .unwrap_or_else(|| report.target.clone());
        Self {
            name,
            host: report.host.clone(),
            labels: report.labels.clone(),
            services: report.services.clone(),
            applications: report.applications.clone(),
            findings: report.findings.clone(),
            health_score: report.health_score,
            last_scan: report.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    pub name: String,
    pub hostname: Option<String>,
    pub ip_addresses: Vec<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub os_architecture: Option<String>,
    pub os_build_number: Option<String>,
    pub kernel_version: Option<String>,
    pub platform: Option<String>,
    pub os_last_boot: Option<DateTime<Utc>>,
    pub labels: BTreeSet<String>,
    pub services: Vec<ServiceRecord>,
    pub applications: Vec<ApplicationRecord>,
    pub findings: Vec<TrackedFinding>,
    pub health_score: u8,
    pub last_scan: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Asset {
    pub fn from_seed(id: String, seed: AssetSeed, now: DateTime<Utc>) -> Self {
        let host = seed.host;
        Self {
            id,
            name: seed.name,
            hostname: host.hostname,
            ip_addresses: host.ip_addresses,
            os_name: host.os_name,
            os_version: host.os_version,
            os_architecture: host.os_architecture,
            os_build_number: host.os_build_number,
            kernel_version: host.kernel_version,
            platform: host.platform,
            os_last_boot: host.last_boot,
            labels: seed.labels,
            services: seed.services,
            applications: seed.applications,
            findings: seed
                .findings
                .into_iter()
                .map(|f| TrackedFinding::new(f, seed.last_scan))
                .collect(),
            health_score: seed.health_score,
            last_scan: seed.last_scan,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn primary_ip(&self) -> Option<&str> {
        self.ip_addresses.first().map(String::as_str)
    }

    pub fn has_ip(&self, ip: &str) -> bool {
        self.ip_addresses.iter().any(|a| a == ip)
    }
}
