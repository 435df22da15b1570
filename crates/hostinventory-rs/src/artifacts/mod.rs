//! JSON artifacts written next to every scan, and the scan history read back
//! from them.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, SubsecRound, Utc};
use tokio::fs;
use tracing::{debug, warn};

use crate::{
    models::{ScanReport, SessionState, Severity, ToolId, ToolOutcome},
    parser::ParsedFragment,
};

const UNIFIED_PREFIX: &str = "unified_scan_";

/// ISO-8601 instant made safe for file names: `2024-05-01T10-20-30-123Z`.
pub fn artifact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

static LAST_SCAN_INSTANT: Mutex<Option<DateTime<Utc>>> = Mutex::new(None);

/// Millisecond instant for a new scan, strictly later than any previously
/// issued one, so scan ids and artifact names never collide in-process.
pub fn unique_scan_instant(now: DateTime<Utc>) -> DateTime<Utc> {
    let mut last = LAST_SCAN_INSTANT
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut at = now.trunc_subsecs(3);
    if let Some(prev) = *last {
        if at <= prev {
            at = prev + chrono::Duration::milliseconds(1);
        }
    }
    *last = Some(at);
    at
}

pub fn tool_file_name(tool: ToolId, scan_id: &str) -> String {
    format!("{tool}_scan_{scan_id}.json")
}

pub fn unified_file_name(scan_id: &str) -> String {
    format!("{UNIFIED_PREFIX}{scan_id}.json")
}

/// Scan ids are timestamps; anything else could escape the output directory.
fn is_valid_scan_id(scan_id: &str) -> bool {
    !scan_id.is_empty()
        && scan_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolArtifact {
    pub scan_id: String,
    pub outcome: ToolOutcome,
    pub parsed: Option<ParsedFragment>,
}

#[async_trait::async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn write_tool(
        &self,
        scan_id: &str,
        outcome: &ToolOutcome,
        parsed: Option<&ParsedFragment>,
    ) -> io::Result<PathBuf>;

    async fn write_unified(&self, report: &ScanReport) -> io::Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub scan_id: String,
    pub target: String,
    pub status: SessionState,
    pub hostname: Option<String>,
    pub health_score: u8,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub timestamp: DateTime<Utc>,
}

impl From<&ScanReport> for ScanSummary {
    fn from(report: &ScanReport) -> Self {
        Self {
            scan_id: report.scan_id.clone(),
            target: report.target.clone(),
            status: report.status,
            hostname: report.host.hostname.clone(),
            health_score: report.health_score,
            critical: report.count_severity(Severity::Critical),
            high: report.count_severity(Severity::High),
            medium: report.count_severity(Severity::Medium),
            low: report.count_severity(Severity::Low),
            timestamp: report.timestamp,
        }
    }
}

/// Writes artifacts under one directory, creating it on first use.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    dir: PathBuf,
}

impl FsArtifactSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write_json<T: serde::Serialize + Sync>(
        &self,
        file_name: &str,
        value: &T,
    ) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
        let path = self.dir.join(file_name);
        fs::write(&path, body).await?;
        debug!(path = %path.display(), "artifact written");
        Ok(path)
    }

    /// Past scans, newest first. Unreadable files are skipped.
    pub async fn list_history(&self) -> io::Result<Vec<ScanSummary>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !name.starts_with(UNIFIED_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            match read_report(&entry.path()).await {
                Ok(report) => summaries.push(ScanSummary::from(&report)),
                Err(e) => warn!(file = name, error = %e, "skipping unreadable scan artifact"),
            }
        }
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(summaries)
    }

    pub async fn load_unified(&self, scan_id: &str) -> io::Result<Option<ScanReport>> {
        if !is_valid_scan_id(scan_id) {
            return Ok(None);
        }
        let path = self.dir.join(unified_file_name(scan_id));
        match read_report(&path).await {
            Ok(report) => Ok(Some(report)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

async fn read_report(path: &Path) -> io::Result<ScanReport> {
    let raw = fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[async_trait::async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn write_tool(
        &self,
        scan_id: &str,
        outcome: &ToolOutcome,
        parsed: Option<&ParsedFragment>,
    ) -> io::Result<PathBuf> {
        let artifact = ToolArtifact {
            scan_id: scan_id.to_string(),
            outcome: outcome.clone(),
            parsed: parsed.cloned(),
        };
        self.write_json(&tool_file_name(outcome.tool, scan_id), &artifact)
            .await
    }

    async fn write_unified(&self, report: &ScanReport) -> io::Result<PathBuf> {
        self.write_json(&unified_file_name(&report.scan_id), report)
            .await
    }
}
