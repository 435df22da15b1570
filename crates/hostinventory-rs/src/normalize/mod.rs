//! Folds per-tool fragments into one [`ScanReport`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::{
    config::ScoreWeights,
    models::{
        FactSource, HostFacts, ScanReport, ServiceRecord, SessionState, ToolId, ToolOutcome,
    },
    parser::ParsedFragment,
    scoring::health_score,
};

/// Session metadata the orchestrator hands over once every tool settled.
#[derive(Debug, Clone)]
pub struct ReportParts {
    pub scan_id: String,
    pub target: String,
    pub status: SessionState,
    pub labels: BTreeSet<String>,
    pub tools: BTreeMap<ToolId, ToolOutcome>,
    pub timestamp: DateTime<Utc>,
}

/// Merges host facts field by field; the first source holding a value wins.
///
/// Name, version and build number travel together from whichever source
/// supplied the OS name, so a distro name is never paired with a kernel
/// version guessed by the fingerprinter. IP candidates are unioned in
/// precedence order.
pub fn merge_host_facts(
    inventory: Option<&HostFacts>,
    fingerprint: Option<&HostFacts>,
    fallback: &HostFacts,
) -> HostFacts {
    let sources: Vec<(FactSource, &HostFacts)> = [
        inventory.map(|h| (FactSource::Inventory, h)),
        fingerprint.map(|h| (FactSource::Fingerprint, h)),
        Some((FactSource::Fallback, fallback)),
    ]
    .into_iter()
    .flatten()
    .collect();

    fn first<T: Clone>(
        sources: &[(FactSource, &HostFacts)],
        field: impl Fn(&HostFacts) -> &Option<T>,
    ) -> Option<T> {
        sources.iter().find_map(|(_, h)| field(h).clone())
    }

    let mut merged = HostFacts {
        hostname: first(&sources, |h| &h.hostname),
        os_architecture: first(&sources, |h| &h.os_architecture),
        kernel_version: first(&sources, |h| &h.kernel_version),
        platform: first(&sources, |h| &h.platform),
        last_boot: first(&sources, |h| &h.last_boot),
        os_guesses: fingerprint.map(|h| h.os_guesses.clone()).unwrap_or_default(),
        ..HostFacts::default()
    };

    if let Some((source, winner)) = sources.iter().find(|(_, h)| h.has_os()) {
        merged.os_name = winner.os_name.clone();
        merged.os_version = winner.os_version.clone();
        merged.os_build_number = winner.os_build_number.clone();
        merged.os_source = Some(*source);
    }

    for (_, host) in &sources {
        for ip in &host.ip_addresses {
            if !merged.ip_addresses.contains(ip) {
                merged.ip_addresses.push(ip.clone());
            }
        }
    }
    merged
}

/// Labels inferred from the operating system and exposed services.
pub fn derive_labels(host: &HostFacts, services: &[ServiceRecord]) -> BTreeSet<String> {
    let mut labels = BTreeSet::new();
    let os = host
        .os_name
        .iter()
        .chain(host.platform.iter())
        .map(|s| s.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    for (needle, label) in [
        ("windows", "windows"),
        ("linux", "linux"),
        ("ubuntu", "ubuntu"),
        ("centos", "centos"),
        ("debian", "debian"),
        ("mac", "macos"),
        ("darwin", "macos"),
    ] {
        if os.contains(needle) {
            labels.insert(label.to_string());
        }
    }

    let names: Vec<String> = services.iter().map(|s| s.name.to_lowercase()).collect();
    let any = |pred: &dyn Fn(&str) -> bool| names.iter().any(|n| pred(n.as_str()));
    if any(&|n| n.contains("http") || n.contains("web")) {
        labels.insert("web-server".to_string());
    }
    if any(&|n| n.contains("smtp") || n.contains("mail")) {
        labels.insert("mail-server".to_string());
    }
    for exact in ["ssh", "ftp", "mysql", "postgresql"] {
        if any(&|n| n == exact) {
            labels.insert(exact.to_string());
        }
    }
    if any(&|n| n == "rdp" || n == "ms-wbt-server") {
        labels.insert("rdp".to_string());
    }
    labels
}

pub fn build_report(
    parts: ReportParts,
    fragments: &BTreeMap<ToolId, ParsedFragment>,
    fallback: &HostFacts,
    weights: &ScoreWeights,
) -> ScanReport {
    let host = merge_host_facts(
        fragments.get(&ToolId::Inventory).map(|f| &f.host),
        fragments.get(&ToolId::Nmap).map(|f| &f.host),
        fallback,
    );

    let mut services = Vec::new();
    let mut service_keys = HashSet::new();
    let mut applications = Vec::new();
    let mut application_keys = HashSet::new();
    let mut findings = Vec::new();
    let mut finding_keys = HashSet::new();
    let mut hardening_index = None;

    for fragment in fragments.values() {
        for service in &fragment.services {
            if service_keys.insert(service.key()) {
                services.push(service.clone());
            }
        }
        for app in &fragment.applications {
            if application_keys.insert(app.key()) {
                applications.push(app.clone());
            }
        }
        for finding in &fragment.findings {
            if finding_keys.insert(finding.key()) {
                findings.push(finding.clone());
            }
        }
        hardening_index = hardening_index.or(fragment.hardening_index);
    }

    let mut labels = parts.labels;
    labels.extend(derive_labels(&host, &services));
    let health_score = health_score(&findings, hardening_index, weights);

    ScanReport {
        scan_id: parts.scan_id,
        target: parts.target,
        status: parts.status,
        host,
        services,
        applications,
        findings,
        labels,
        hardening_index,
        health_score,
        tools: parts.tools,
        timestamp: parts.timestamp,
    }
}
