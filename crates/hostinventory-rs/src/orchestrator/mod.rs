//! Runs the enabled adapters of one scan session concurrently and turns
//! their settled outcomes into a [`ScanReport`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    task::JoinSet,
    time::{timeout_at, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    adapters::{all_adapters, OsFamily, SharedAdapter, ToolOptions},
    artifacts::{artifact_timestamp, unique_scan_instant, ArtifactSink},
    config::{AppConfig, ScoreWeights, SeverityCvss},
    error::ExecutionError,
    hostfacts::{collect_fallback, is_local_target},
    models::{HostFacts, ScanReport, SessionState, ToolId, ToolOutcome, ToolStatus},
    normalize::{build_report, ReportParts},
    parser::ParsedFragment,
    security::wsl_available,
};

/// Which tools a session should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ToolSelection {
    pub nmap: bool,
    pub lynis: bool,
    pub inventory: bool,
}

impl ToolSelection {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            nmap: config.enable_nmap,
            lynis: config.enable_lynis,
            inventory: config.enable_inventory,
        }
    }

    pub fn enabled(&self, tool: ToolId) -> bool {
        match tool {
            ToolId::Nmap => self.nmap,
            ToolId::Lynis => self.lynis,
            ToolId::Inventory => self.inventory,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub target: String,
    pub tools: ToolSelection,
    pub timeout: Option<Duration>,
    pub labels: BTreeSet<String>,
}

/// One invocation of the orchestrator.
///
/// `Init` → `Running` when adapters launch, then exactly one of the
/// terminal states once every launched task settled or the deadline passed.
pub struct ScanSession {
    pub scan_id: String,
    pub target: String,
    pub labels: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    adapters: Vec<SharedAdapter>,
    timeout: Duration,
    state: SessionState,
}

impl ScanSession {
    pub fn new(
        target: String,
        adapters: Vec<SharedAdapter>,
        timeout: Duration,
        labels: BTreeSet<String>,
    ) -> Self {
        let created_at = unique_scan_instant(Utc::now());
        Self {
            scan_id: artifact_timestamp(created_at),
            target,
            labels,
            created_at,
            adapters,
            timeout,
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(!self.state.is_terminal(), "session already finalized");
        debug!(scan_id = %self.scan_id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

/// Terminal state for a set of settled outcomes.
pub fn final_state<'a>(outcomes: impl IntoIterator<Item = &'a ToolOutcome>) -> SessionState {
    let (mut completed, mut failed) = (0usize, 0usize);
    for outcome in outcomes {
        match outcome.status {
            ToolStatus::Completed => completed += 1,
            ToolStatus::Failed => failed += 1,
            _ => {}
        }
    }
    match (completed, failed) {
        (_, 0) => SessionState::Completed,
        (0, _) => SessionState::Failed,
        _ => SessionState::Partial,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAvailability {
    Installed,
    NotInstalled,
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolsStatus {
    pub platform: OsFamily,
    pub wsl: bool,
    pub tools: BTreeMap<ToolId, ToolAvailability>,
}

struct Settled {
    outcome: ToolOutcome,
    fragment: Option<ParsedFragment>,
}

/// Everything a launched adapter task needs; cloned into each task.
#[derive(Clone)]
struct TaskContext {
    target: String,
    local: bool,
    family: OsFamily,
    options: ToolOptions,
    tool_timeout: Duration,
    deadline: Instant,
    cvss: SeverityCvss,
}

pub struct Orchestrator {
    adapters: Vec<SharedAdapter>,
    options: ToolOptions,
    tool_timeout: Duration,
    session_timeout: Duration,
    cvss: SeverityCvss,
    weights: ScoreWeights,
    sink: Option<Arc<dyn ArtifactSink>>,
}

impl Orchestrator {
    pub fn from_config(config: &AppConfig, sink: Option<Arc<dyn ArtifactSink>>) -> Self {
        Self {
            adapters: all_adapters(),
            options: ToolOptions::from_config(config),
            tool_timeout: config.tool_timeout(),
            session_timeout: config.session_timeout(),
            cvss: config.severity_cvss,
            weights: config.score_weights,
            sink,
        }
    }

    pub fn with_adapters(mut self, adapters: Vec<SharedAdapter>) -> Self {
        self.adapters = adapters;
        self
    }

    pub async fn run_scan(&self, request: &ScanRequest) -> ScanReport {
        let adapters = self
            .adapters
            .iter()
            .filter(|a| request.tools.enabled(a.id()))
            .cloned()
            .collect();
        let session = ScanSession::new(
            request.target.clone(),
            adapters,
            request.timeout.unwrap_or(self.session_timeout),
            request.labels.clone(),
        );
        self.execute(session).await
    }

    async fn execute(&self, mut session: ScanSession) -> ScanReport {
        let started = Instant::now();
        let deadline = started + session.timeout;
        session.advance(SessionState::Running);
        info!(
            scan_id = %session.scan_id,
            target = %session.target,
            tools = session.adapters.len(),
            timeout_secs = session.timeout.as_secs_f64(),
            "scan session started"
        );

        let ctx = TaskContext {
            target: session.target.clone(),
            local: is_local_target(&session.target),
            family: OsFamily::current(),
            options: self.options.clone(),
            tool_timeout: self.tool_timeout,
            deadline,
            cvss: self.cvss,
        };

        let fallback_target = session.target.clone();
        let dns_timeout = self.options.probe_timeout;
        let fallback = tokio::spawn(async move {
            collect_fallback(&fallback_target, dns_timeout).await
        });

        let mut pending: BTreeSet<ToolId> = BTreeSet::new();
        let mut set = JoinSet::new();
        for adapter in &session.adapters {
            pending.insert(adapter.id());
            set.spawn(drive(adapter.clone(), ctx.clone()));
        }

        let mut settled: BTreeMap<ToolId, Settled> = BTreeMap::new();
        let mut timed_out = false;
        loop {
            match timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok(done))) => {
                    pending.remove(&done.outcome.tool);
                    settled.insert(done.outcome.tool, done);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "adapter task crashed"),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    set.abort_all();
                    break;
                }
            }
        }
        drop(set);

        // Whatever never reported back either crashed or was cut off.
        let elapsed_ms = started.elapsed().as_millis() as u64;
        for tool in pending {
            let err = if timed_out {
                ExecutionError::Timeout(session.timeout)
            } else {
                ExecutionError::Internal("adapter task panicked".to_string())
            };
            warn!(tool = %tool, error = %err, "tool did not settle");
            settled.insert(
                tool,
                Settled {
                    outcome: ToolOutcome::failed(tool, &err, elapsed_ms),
                    fragment: None,
                },
            );
        }

        let fallback = match timeout_at(deadline.max(Instant::now()), fallback).await {
            Ok(Ok(facts)) => facts,
            _ => HostFacts::default(),
        };

        let status = final_state(settled.values().map(|s| &s.outcome));
        session.advance(status);

        if let Some(sink) = &self.sink {
            for s in settled.values() {
                if let Err(e) = sink
                    .write_tool(&session.scan_id, &s.outcome, s.fragment.as_ref())
                    .await
                {
                    warn!(tool = %s.outcome.tool, error = %e, "failed to write tool artifact");
                }
            }
        }

        let mut tools = BTreeMap::new();
        let mut fragments = BTreeMap::new();
        for (tool, s) in settled {
            if let Some(fragment) = s.fragment {
                fragments.insert(tool, fragment);
            }
            tools.insert(tool, s.outcome);
        }

        let report = build_report(
            ReportParts {
                scan_id: session.scan_id.clone(),
                target: session.target.clone(),
                status,
                labels: session.labels.clone(),
                tools,
                timestamp: session.created_at,
            },
            &fragments,
            &fallback,
            &self.weights,
        );

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.write_unified(&report).await {
                warn!(scan_id = %report.scan_id, error = %e, "failed to write unified artifact");
            }
        }

        info!(
            scan_id = %report.scan_id,
            status = ?report.status,
            services = report.services.len(),
            findings = report.findings.len(),
            health_score = report.health_score,
            duration_ms = started.elapsed().as_millis() as u64,
            "scan session finished"
        );
        report
    }

    pub async fn tools_status(&self) -> ToolsStatus {
        let family = OsFamily::current();
        let probe_timeout = self.options.probe_timeout;
        let mut tools = BTreeMap::new();
        for adapter in &self.adapters {
            let availability = if !adapter.platform().is_supported(family, probe_timeout).await {
                ToolAvailability::NotApplicable
            } else if adapter.probe(probe_timeout).await {
                ToolAvailability::Installed
            } else {
                ToolAvailability::NotInstalled
            };
            tools.insert(adapter.id(), availability);
        }
        ToolsStatus {
            platform: family,
            wsl: wsl_available(probe_timeout).await,
            tools,
        }
    }
}

/// Applicability checks, probe, execution and parsing of one adapter.
async fn drive(adapter: SharedAdapter, ctx: TaskContext) -> Settled {
    let tool = adapter.id();
    let started = Instant::now();

    if adapter.local_only() && !ctx.local {
        debug!(tool = %tool, target = %ctx.target, "remote target, local-only tool skipped");
        return skipped(tool, ToolStatus::NotApplicable);
    }
    if !adapter
        .platform()
        .is_supported(ctx.family, ctx.options.probe_timeout)
        .await
    {
        debug!(tool = %tool, "platform unsupported");
        return skipped(tool, ToolStatus::NotApplicable);
    }
    if !adapter.probe(ctx.options.probe_timeout).await {
        info!(tool = %tool, "tool not installed");
        return skipped(tool, ToolStatus::NotInstalled);
    }

    let budget = ctx
        .tool_timeout
        .min(ctx.deadline.saturating_duration_since(Instant::now()));
    let result = adapter.run(&ctx.target, &ctx.options, budget).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(raw) => {
            let fragment = adapter.parse(&raw, &ctx.cvss);
            info!(
                tool = %tool,
                duration_ms,
                services = fragment.services.len(),
                findings = fragment.findings.len(),
                "tool completed"
            );
            Settled {
                outcome: ToolOutcome::completed(tool, raw, duration_ms),
                fragment: Some(fragment),
            }
        }
        Err(err) => {
            warn!(tool = %tool, duration_ms, error = %err, "tool failed");
            Settled {
                outcome: ToolOutcome::failed(tool, &err, duration_ms),
                fragment: None,
            }
        }
    }
}

fn skipped(tool: ToolId, status: ToolStatus) -> Settled {
    Settled {
        outcome: ToolOutcome::skipped(tool, status),
        fragment: None,
    }
}
