//! Platform-native inventory: the sectioned text emitted by the POSIX
//! collector script and the JSON document emitted by the PowerShell one.

use std::{net::IpAddr, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tracing::debug;

use super::{non_empty, severity::configuration_finding, ParsedFragment};
use crate::{
    config::SeverityCvss,
    models::{ApplicationRecord, Severity, ServiceRecord},
};

const SECTION_MARKER: &str = "### ";

pub fn parse_inventory(raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
    if raw.lines().any(|l| l.starts_with(SECTION_MARKER)) {
        return parse_posix(raw);
    }
    parse_powershell(raw, cvss)
}

/// Section of the POSIX collector output; switched by `### <name>` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    OsRelease,
    Uname,
    Hostname,
    Boot,
    Addresses,
    Services,
    Packages,
    Unknown,
}

impl Section {
    fn from_marker(name: &str) -> Self {
        match name.trim() {
            "os-release" => Section::OsRelease,
            "uname" => Section::Uname,
            "hostname" => Section::Hostname,
            "boot" => Section::Boot,
            "addresses" => Section::Addresses,
            "services" => Section::Services,
            "packages" => Section::Packages,
            _ => Section::Unknown,
        }
    }
}

fn parse_posix(raw: &str) -> ParsedFragment {
    let mut fragment = ParsedFragment::default();
    let mut section = Section::Preamble;
    let mut pretty_name = None;
    let mut distro_name = None;

    for line in raw.lines() {
        if let Some(name) = line.strip_prefix(SECTION_MARKER) {
            section = Section::from_marker(name);
            continue;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match section {
            Section::Preamble | Section::Unknown => {}
            Section::OsRelease => {
                let Some((key, value)) = trimmed.split_once('=') else {
                    continue;
                };
                let value = value.trim().trim_matches('"').trim_matches('\'');
                match key.trim() {
                    "PRETTY_NAME" => pretty_name = non_empty(value),
                    "NAME" => distro_name = non_empty(value),
                    "VERSION_ID" => fragment.host.os_version = non_empty(value),
                    _ => {}
                }
            }
            Section::Uname => {
                let mut parts = trimmed.split_whitespace();
                if let (Some(sys), Some(release), Some(machine)) =
                    (parts.next(), parts.next(), parts.next())
                {
                    fragment.host.platform = Some(sys.to_lowercase());
                    fragment.host.kernel_version = Some(release.to_string());
                    fragment.host.os_architecture = Some(machine.to_string());
                }
            }
            Section::Hostname => {
                if fragment.host.hostname.is_none() {
                    fragment.host.hostname = Some(trimmed.to_string());
                }
            }
            Section::Boot => {
                fragment.host.last_boot = trimmed
                    .parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
            }
            Section::Addresses => {
                for candidate in trimmed.split_whitespace() {
                    if let Ok(ip) = IpAddr::from_str(candidate) {
                        push_ip(&mut fragment.host.ip_addresses, ip);
                    }
                }
            }
            Section::Services => {
                if let Some(service) = parse_systemd_unit(trimmed) {
                    fragment.services.push(service);
                }
            }
            Section::Packages => {
                if let Some(app) = parse_package_row(trimmed) {
                    fragment.applications.push(app);
                }
            }
        }
    }

    fragment.host.os_name = pretty_name.or(distro_name);
    fragment
}

/// `ssh.service loaded active running OpenBSD Secure Shell server`
fn parse_systemd_unit(line: &str) -> Option<ServiceRecord> {
    let line = line.trim_start_matches('●').trim_start();
    let mut parts = line.split_whitespace();
    let unit = parts.next()?;
    let name = unit.strip_suffix(".service")?;
    let _load = parts.next()?;
    let _active = parts.next()?;
    let sub = parts.next()?;
    let description = parts.collect::<Vec<_>>().join(" ");
    Some(ServiceRecord {
        name: name.to_string(),
        display_name: non_empty(&description).unwrap_or_else(|| name.to_string()),
        status: sub.to_string(),
        port: None,
        protocol: None,
        version: None,
    })
}

/// `name \t version \t publisher [\t install-epoch]`
fn parse_package_row(line: &str) -> Option<ApplicationRecord> {
    let mut fields = line.split('\t');
    let name = non_empty(fields.next()?)?;
    let version = non_empty(fields.next()?)?;
    let publisher = fields.next().and_then(non_empty);
    let install_date = fields
        .next()
        .and_then(|f| f.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.date_naive());
    Some(ApplicationRecord {
        name,
        version: Some(version),
        publisher,
        install_date,
    })
}

fn push_ip(list: &mut Vec<String>, ip: IpAddr) {
    let usable = match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    };
    let text = ip.to_string();
    if usable && !list.contains(&text) {
        list.push(text);
    }
}

type PsDocument = serde_json::Map<String, Value>;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsOsInfo {
    caption: Option<String>,
    version: Option<String>,
    build_number: Option<String>,
    #[serde(rename = "OSArchitecture")]
    os_architecture: Option<String>,
    last_boot_up_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsComputerSystem {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsService {
    name: Option<String>,
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsSoftware {
    display_name: Option<String>,
    display_version: Option<String>,
    publisher: Option<String>,
    install_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PsIpAddress {
    #[serde(rename = "IPAddress")]
    ip_address: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsFirewallProfile {
    name: Option<String>,
    enabled: Option<Value>,
}

fn decode<T: DeserializeOwned>(section: &str, value: &Value) -> Option<T> {
    match T::deserialize(value) {
        Ok(decoded) => Some(decoded),
        Err(e) => {
            debug!(section, error = %e, "skipping unreadable inventory entry");
            None
        }
    }
}

fn section<T: DeserializeOwned>(doc: &PsDocument, key: &str) -> Option<T> {
    doc.get(key)
        .filter(|v| !v.is_null())
        .and_then(|v| decode(key, v))
}

/// Entries of a list section. `ConvertTo-Json` emits a bare object instead of
/// a one-element array; entries that do not decode are dropped on their own.
fn entries<T: DeserializeOwned>(doc: &PsDocument, key: &str) -> Vec<T> {
    match doc.get(key) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(list)) => list.iter().filter_map(|v| decode(key, v)).collect(),
        Some(one) => decode(key, one).into_iter().collect(),
    }
}

fn parse_powershell(raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
    let mut fragment = ParsedFragment::default();
    let (Some(start), Some(end)) = (raw.find('{'), raw.rfind('}')) else {
        return fragment;
    };
    if end < start {
        return fragment;
    }
    let Ok(doc) = serde_json::from_str::<PsDocument>(&raw[start..=end]) else {
        return fragment;
    };
    let os_info: Option<PsOsInfo> = section(&doc, "OSInfo");
    let computer_system: Option<PsComputerSystem> = section(&doc, "ComputerSystem");
    let ip_configuration: Vec<PsIpAddress> = entries(&doc, "IPConfiguration");
    let services: Vec<PsService> = entries(&doc, "Services");
    let software: Vec<PsSoftware> = entries(&doc, "Software");
    let firewall_profiles: Vec<PsFirewallProfile> = entries(&doc, "FirewallProfiles");
    let recent_updates: Vec<Value> = entries(&doc, "RecentUpdates");

    if let Some(os) = &os_info {
        fragment.host.os_name = os.caption.as_deref().and_then(non_empty);
        fragment.host.os_version = os.version.as_deref().and_then(non_empty);
        fragment.host.os_build_number = os.build_number.as_deref().and_then(non_empty);
        fragment.host.os_architecture = os.os_architecture.as_deref().and_then(non_empty);
        fragment.host.last_boot = os
            .last_boot_up_time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc));
        fragment.host.platform = Some("windows".to_string());
    }
    fragment.host.hostname = computer_system
        .as_ref()
        .and_then(|cs| cs.name.as_deref())
        .and_then(non_empty);

    for addr in &ip_configuration {
        let Some(text) = addr.ip_address.as_deref() else {
            continue;
        };
        let bare = text.split('%').next().unwrap_or(text);
        if let Ok(ip) = IpAddr::from_str(bare) {
            push_ip(&mut fragment.host.ip_addresses, ip);
        }
    }

    fragment.services = services
        .iter()
        .filter_map(|svc| {
            let name = svc.name.as_deref().and_then(non_empty)?;
            Some(ServiceRecord {
                display_name: svc
                    .display_name
                    .as_deref()
                    .and_then(non_empty)
                    .unwrap_or_else(|| name.clone()),
                name,
                status: "running".to_string(),
                port: None,
                protocol: None,
                version: None,
            })
        })
        .collect();

    fragment.applications = software
        .iter()
        .filter_map(|sw| {
            Some(ApplicationRecord {
                name: sw.display_name.as_deref().and_then(non_empty)?,
                version: sw.display_version.as_deref().and_then(non_empty),
                publisher: sw.publisher.as_deref().and_then(non_empty),
                install_date: sw
                    .install_date
                    .as_deref()
                    .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y%m%d").ok()),
            })
        })
        .collect();

    for profile in &firewall_profiles {
        if profile.enabled.as_ref().is_some_and(is_disabled) {
            let name = profile.name.as_deref().unwrap_or("Unknown");
            fragment.findings.push(configuration_finding(
                format!("Firewall profile {name} disabled"),
                Severity::High,
                cvss,
                format!("Windows Firewall is disabled for the {name} network profile"),
                format!("Enable the {name} firewall profile"),
            ));
        }
    }
    if os_info.is_some() && recent_updates.is_empty() {
        fragment.findings.push(configuration_finding(
            "No Windows updates recorded".to_string(),
            Severity::Medium,
            cvss,
            "Get-HotFix returned no installed updates".to_string(),
            "Install the latest cumulative and security updates".to_string(),
        ));
    }

    fragment
}

fn is_disabled(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s.eq_ignore_ascii_case("false") || s == "0",
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cvss() -> SeverityCvss {
        SeverityCvss::default()
    }

    #[test]
    fn posix_os_and_identity() {
        let fragment = parse_inventory(include_str!("../../fixtures/inventory_linux.txt"), &cvss());
        let host = &fragment.host;
        assert_eq!(host.os_name.as_deref(), Some("Ubuntu 22.04"));
        assert_eq!(host.os_version.as_deref(), Some("22.04"));
        assert_eq!(host.platform.as_deref(), Some("linux"));
        assert_eq!(host.kernel_version.as_deref(), Some("5.15.0-91-generic"));
        assert_eq!(host.os_architecture.as_deref(), Some("x86_64"));
        assert_eq!(host.hostname.as_deref(), Some("web01"));
        assert_eq!(
            host.ip_addresses,
            vec!["10.0.0.5".to_string(), "172.17.0.1".to_string()]
        );
        assert_eq!(
            host.last_boot.map(|t| t.to_rfc3339()),
            Some("2024-05-01T08:00:00+00:00".to_string())
        );
    }

    #[test]
    fn posix_services_and_packages() {
        let fragment = parse_inventory(include_str!("../../fixtures/inventory_linux.txt"), &cvss());
        let names: Vec<&str> = fragment.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["cron", "ssh", "nginx"]);
        assert_eq!(fragment.services[1].display_name, "OpenBSD Secure Shell server");
        assert_eq!(fragment.services[1].status, "running");
        assert_eq!(fragment.services[1].port, None);

        assert_eq!(fragment.applications.len(), 3);
        let curl = &fragment.applications[2];
        assert_eq!(curl.name, "curl");
        assert_eq!(curl.publisher, None);
        assert_eq!(
            curl.install_date,
            NaiveDate::from_ymd_opt(2023, 11, 14)
        );
        assert!(fragment.findings.is_empty());
    }

    #[test]
    fn powershell_document_is_read_through_noise() {
        let fragment =
            parse_inventory(include_str!("../../fixtures/inventory_windows.json"), &cvss());
        let host = &fragment.host;
        assert_eq!(host.os_name.as_deref(), Some("Microsoft Windows 11 Pro"));
        assert_eq!(host.os_version.as_deref(), Some("10.0.22631"));
        assert_eq!(host.os_build_number.as_deref(), Some("22631"));
        assert_eq!(host.os_architecture.as_deref(), Some("64-bit"));
        assert_eq!(host.platform.as_deref(), Some("windows"));
        assert_eq!(host.hostname.as_deref(), Some("DESKTOP-7Q2K"));
        assert_eq!(host.ip_addresses, vec!["192.168.1.23".to_string()]);
        assert_eq!(
            host.last_boot.map(|t| t.to_rfc3339()),
            Some("2024-05-01T06:00:00+00:00".to_string())
        );
    }

    #[test]
    fn powershell_services_software_and_findings() {
        let fragment =
            parse_inventory(include_str!("../../fixtures/inventory_windows.json"), &cvss());
        assert_eq!(fragment.services.len(), 3);
        assert_eq!(fragment.services[2].display_name, "sshd");
        assert_eq!(fragment.applications.len(), 2);
        assert_eq!(
            fragment.applications[0].install_date,
            NaiveDate::from_ymd_opt(2023, 6, 12)
        );
        assert_eq!(fragment.findings.len(), 1);
        assert_eq!(fragment.findings[0].name, "Firewall profile Public disabled");
        assert_eq!(fragment.findings[0].severity, Severity::High);
    }

    #[test]
    fn missing_updates_raise_a_finding() {
        let raw = r#"{"OSInfo":{"Caption":"Windows Server 2019"},"RecentUpdates":null}"#;
        let fragment = parse_inventory(raw, &cvss());
        assert_eq!(fragment.findings.len(), 1);
        assert_eq!(fragment.findings[0].severity, Severity::Medium);
    }

    #[test]
    fn mistyped_entry_only_drops_itself() {
        let raw = r#"{
            "OSInfo": {"Caption": "Windows Server 2022", "Version": "10.0.20348"},
            "ComputerSystem": {"Name": "FILESRV"},
            "Software": [
                {"DisplayName": "App", "DisplayVersion": 1},
                {"DisplayName": "7-Zip", "DisplayVersion": "23.01"}
            ],
            "Services": {"Name": ["not", "a", "string"]},
            "RecentUpdates": [{"HotFixID": "KB5034439"}]
        }"#;
        let fragment = parse_inventory(raw, &cvss());
        assert_eq!(fragment.host.os_name.as_deref(), Some("Windows Server 2022"));
        assert_eq!(fragment.host.hostname.as_deref(), Some("FILESRV"));
        assert_eq!(fragment.applications.len(), 1);
        assert_eq!(fragment.applications[0].name, "7-Zip");
        assert!(fragment.services.is_empty());
        assert!(fragment.findings.is_empty());
    }

    #[test]
    fn mistyped_section_keeps_the_rest() {
        let raw = r#"{"OSInfo": "unavailable", "ComputerSystem": {"Name": "KIOSK"}}"#;
        let fragment = parse_inventory(raw, &cvss());
        assert_eq!(fragment.host.os_name, None);
        assert_eq!(fragment.host.hostname.as_deref(), Some("KIOSK"));
        assert!(fragment.findings.is_empty());
    }

    #[test]
    fn parsing_is_deterministic() {
        let posix = include_str!("../../fixtures/inventory_linux.txt");
        let windows = include_str!("../../fixtures/inventory_windows.json");
        assert_eq!(parse_inventory(posix, &cvss()), parse_inventory(posix, &cvss()));
        assert_eq!(parse_inventory(windows, &cvss()), parse_inventory(windows, &cvss()));
    }

    #[test]
    fn malformed_json_is_not_fatal() {
        assert!(parse_inventory("{\"OSInfo\": {\"Caption\": ", &cvss()).is_empty());
        assert!(parse_inventory("} nothing {", &cvss()).is_empty());
        assert!(parse_inventory("", &cvss()).is_empty());
    }
}
