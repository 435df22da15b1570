use std::{env, fs, path::PathBuf, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::models::Severity;

/// Penalty per finding, by severity, used by the health score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            critical: 10.0,
            high: 5.0,
            medium: 2.0,
            low: 0.5,
        }
    }
}

impl ScoreWeights {
    /// Configured penalty clamped to `0..=100`. A non-finite weight falls back
    /// to the default for its severity, so the score stays monotonic.
    pub fn penalty(&self, severity: Severity) -> f64 {
        let pick = |w: &ScoreWeights| match severity {
            Severity::Critical => w.critical,
            Severity::High => w.high,
            Severity::Medium => w.medium,
            Severity::Low => w.low,
        };
        let raw = pick(self);
        if raw.is_finite() {
            raw.clamp(0.0, 100.0)
        } else {
            pick(&ScoreWeights::default())
        }
    }
}

/// CVSS base score assigned to findings whose tool reports only a severity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityCvss {
    pub critical: f32,
    pub high: f32,
    pub medium: f32,
    pub low: f32,
}

impl Default for SeverityCvss {
    fn default() -> Self {
        Self {
            critical: 9.0,
            high: 7.0,
            medium: 5.0,
            low: 3.0,
        }
    }
}

impl SeverityCvss {
    pub fn score(&self, severity: Severity) -> f32 {
        let raw = match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        };
        if raw.is_finite() {
            raw.clamp(0.0, 10.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub output_dir: Option<PathBuf>,
    pub scope_allowlist: Vec<String>,
    pub session_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub enable_nmap: bool,
    pub enable_lynis: bool,
    pub enable_inventory: bool,
    pub nmap_args: Vec<String>,
    pub scan_packages: bool,
    pub score_weights: ScoreWeights,
    pub severity_cvss: SeverityCvss,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("HOSTINV_CONFIG").unwrap_or_else(|_| "config.json".to_string());
        let file_cfg: Option<AppConfig> = fs::read_to_string(&path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .with_context(|| format!("failed to parse {path}"))?;

        let mut cfg = file_cfg.unwrap_or_default();

        if let Ok(v) = env::var("HOSTINV_HOST") {
            cfg.host = v;
        }
        if let Ok(v) = env::var("HOSTINV_PORT") {
            cfg.port = v.parse().unwrap_or(cfg.port);
        }
        if let Ok(v) = env::var("HOSTINV_DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("HOSTINV_OUTPUT_DIR") {
            cfg.output_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("HOSTINV_SCOPE_ALLOWLIST") {
            cfg.scope_allowlist = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("HOSTINV_SESSION_TIMEOUT_SECS") {
            cfg.session_timeout_secs = v.parse().unwrap_or(cfg.session_timeout_secs);
        }

        Ok(cfg)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs.max(1))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: "sqlite://hostinventory.db?mode=rwc".to_string(),
            output_dir: Some(PathBuf::from("scan_results")),
            scope_allowlist: vec!["127.0.0.1/32".to_string(), "localhost".to_string()],
            session_timeout_secs: 600,
            tool_timeout_secs: 480,
            probe_timeout_secs: 10,
            enable_nmap: true,
            enable_lynis: true,
            enable_inventory: true,
            nmap_args: vec!["-sV".into(), "-O".into(), "-T4".into()],
            scan_packages: false,
            score_weights: ScoreWeights::default(),
            severity_cvss: SeverityCvss::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: AppConfig =
            serde_json::from_str(r#"{"port": 9090, "score_weights": {"critical": 20}}"#)
                .expect("parse");
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.score_weights.critical, 20.0);
        assert_eq!(cfg.score_weights.high, 5.0);
        assert_eq!(cfg.severity_cvss.score(Severity::High), 7.0);
    }

    #[test]
    fn cvss_mapping_is_clamped() {
        let cvss = SeverityCvss {
            critical: 12.0,
            ..SeverityCvss::default()
        };
        assert_eq!(cvss.score(Severity::Critical), 10.0);
    }

    #[test]
    fn out_of_range_weights_are_tamed() {
        let weights = ScoreWeights {
            critical: f64::NAN,
            high: -5.0,
            medium: f64::INFINITY,
            low: 250.0,
        };
        assert_eq!(weights.penalty(Severity::Critical), 10.0);
        assert_eq!(weights.penalty(Severity::High), 0.0);
        assert_eq!(weights.penalty(Severity::Medium), 2.0);
        assert_eq!(weights.penalty(Severity::Low), 100.0);
        assert_eq!(
            SeverityCvss {
                high: f32::NAN,
                ..SeverityCvss::default()
            }
            .score(Severity::High),
            0.0
        );
    }

    #[test]
    fn timeouts_never_zero() {
        let cfg = AppConfig {
            session_timeout_secs: 0,
            ..AppConfig::default()
        };
        assert_eq!(cfg.session_timeout(), Duration::from_secs(1));
    }
}
