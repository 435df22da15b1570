use std::{net::IpAddr, str::FromStr, sync::LazyLock};

use regex::Regex;

use super::{non_empty, severity::exposure_finding, ParsedFragment};
use crate::models::{OsGuess, ServiceRecord};

static REPORT_FOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Nmap scan report for (\S+)(?: \(([^)]+)\))?").expect("static regex")
});
static PORT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^PORT\s+STATE\s+SERVICE").expect("static regex"));
static PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,5})/(tcp|udp|sctp)\s+(\S+)\s+(\S+)(?:\s+(.*\S))?\s*$")
        .expect("static regex")
});
static OS_DETAILS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^OS details:\s*(.+)$").expect("static regex"));
static AGGRESSIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Aggressive OS guesses:\s*(.+)$").expect("static regex"));
static RUNNING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Running(?: \(JUST GUESSING\))?:\s*(.+)$").expect("static regex")
});
static SERVICE_INFO_OS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Service Info:.*?\bOS:\s*([^;]+)").expect("static regex"));
static OS_CPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"cpe:/o:([a-z0-9_\-]+):").expect("static regex"));
static GUESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|,\s*)(.+?)\s*\((\d{1,3})%\)").expect("static regex")
});
static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("static regex"));

/// Where the scanner is within nmap's normal (`-oN`) output.
///
/// `Preamble` → `PortTable` on the `PORT STATE SERVICE` header or on a bare
/// port row (output fragments often arrive without the header).
/// `PortTable` → `Trailer` on the first line that is neither a port row nor
/// NSE script output. OS lines are read in `Preamble` too, since nmap prints
/// no port table when every port is filtered. Any state → `Done` on a second `Nmap scan report for`,
/// since a session describes a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NmapState {
    Preamble,
    PortTable,
    Trailer,
    Done,
}

#[derive(Default)]
struct OsEvidence {
    details: Option<String>,
    aggressive: Vec<OsGuess>,
    running: Vec<OsGuess>,
    service_info: Option<String>,
    cpe_vendor: Option<String>,
}

pub fn parse_nmap(raw: &str) -> ParsedFragment {
    let mut fragment = ParsedFragment::default();
    let mut os = OsEvidence::default();
    let mut state = NmapState::Preamble;
    let mut seen_report = false;

    for line in raw.lines() {
        let line = line.trim_end();

        if let Some(caps) = REPORT_FOR.captures(line) {
            if seen_report {
                state = NmapState::Done;
                continue;
            }
            seen_report = true;
            state = NmapState::Preamble;
            let first = caps[1].to_string();
            match caps.get(2) {
                Some(ip) => {
                    fragment.host.hostname = Some(first);
                    fragment.host.ip_addresses.push(ip.as_str().to_string());
                }
                None if IpAddr::from_str(&first).is_ok() => {
                    fragment.host.ip_addresses.push(first);
                }
                None => fragment.host.hostname = Some(first),
            }
            continue;
        }

        match state {
            NmapState::Done => break,
            NmapState::Preamble => {
                if PORT_HEADER.is_match(line) {
                    state = NmapState::PortTable;
                } else if let Some(caps) = PORT_LINE.captures(line) {
                    state = NmapState::PortTable;
                    push_port(&mut fragment, &caps);
                } else {
                    read_os_line(line, &mut os);
                }
            }
            NmapState::PortTable => {
                if let Some(caps) = PORT_LINE.captures(line) {
                    push_port(&mut fragment, &caps);
                } else if !line.trim_start().starts_with('|') {
                    state = NmapState::Trailer;
                    read_os_line(line, &mut os);
                }
            }
            NmapState::Trailer => read_os_line(line, &mut os),
        }
    }

    apply_os(&mut fragment, os);
    fragment
}

fn push_port(fragment: &mut ParsedFragment, caps: &regex::Captures<'_>) {
    let Ok(port) = caps[1].parse::<u16>() else {
        return;
    };
    let protocol = caps[2].to_string();
    let status = caps[3].to_string();
    if status != "open" {
        return;
    }
    let name = caps[4].trim_end_matches('?').to_string();
    let version = caps.get(5).and_then(|v| non_empty(v.as_str()));

    if let Some(finding) = exposure_finding(&name, port, &protocol) {
        fragment.findings.push(finding);
    }
    fragment.services.push(ServiceRecord {
        display_name: format!("{name} ({port}/{protocol})"),
        name,
        status,
        port: Some(port),
        protocol: Some(protocol),
        version,
    });
}

fn read_os_line(line: &str, os: &mut OsEvidence) {
    if let Some(caps) = OS_DETAILS.captures(line) {
        os.details = non_empty(&caps[1]);
    } else if let Some(caps) = AGGRESSIVE.captures(line) {
        os.aggressive = parse_guesses(&caps[1]);
    } else if let Some(caps) = RUNNING.captures(line) {
        os.running = parse_guesses(&caps[1]);
    } else if let Some(caps) = SERVICE_INFO_OS.captures(line) {
        os.service_info = non_empty(&caps[1]);
    } else if line.starts_with("OS CPE:") {
        os.cpe_vendor = OS_CPE.captures(line).map(|c| c[1].to_string());
    }
}

fn parse_guesses(text: &str) -> Vec<OsGuess> {
    let guesses: Vec<OsGuess> = GUESS
        .captures_iter(text)
        .filter_map(|caps| {
            Some(OsGuess {
                name: non_empty(&caps[1])?,
                accuracy: caps[2].parse::<u8>().ok().filter(|a| *a <= 100),
            })
        })
        .collect();
    if !guesses.is_empty() {
        return guesses;
    }
    non_empty(text)
        .map(|name| vec![OsGuess { name, accuracy: None }])
        .unwrap_or_default()
}

fn apply_os(fragment: &mut ParsedFragment, os: OsEvidence) {
    let name = os
        .details
        .clone()
        .or_else(|| os.aggressive.first().map(|g| g.name.clone()))
        .or_else(|| os.running.first().map(|g| g.name.clone()))
        .or_else(|| os.service_info.clone());

    fragment.host.os_version = name
        .as_deref()
        .and_then(|n| VERSION.find(n))
        .map(|m| m.as_str().to_string());
    fragment.host.platform = os
        .cpe_vendor
        .as_deref()
        .map(platform_from_vendor)
        .or_else(|| {
            name.as_deref()
                .and_then(|n| n.split_whitespace().next())
                .map(platform_from_vendor)
        });
    fragment.host.os_name = name;
    fragment.host.os_guesses = os.running.into_iter().chain(os.aggressive).collect();
}

fn platform_from_vendor(vendor: &str) -> String {
    match vendor.to_lowercase().as_str() {
        "microsoft" | "windows" => "windows".to_string(),
        "apple" | "mac" | "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}
