//! Lowest-fidelity host facts that can always be gathered without any
//! external tool: the target itself, DNS, and what the process knows about
//! the machine it runs on.

use std::{env, fs, net::IpAddr, str::FromStr, time::Duration};

use tokio::{net::lookup_host, time::timeout};
use tracing::debug;

use crate::models::HostFacts;

/// True if `target` names the machine the scanner runs on.
pub fn is_local_target(target: &str) -> bool {
    let target = target.trim_matches(|c| c == '[' || c == ']');
    if target.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = IpAddr::from_str(target) {
        return ip.is_loopback() || ip.is_unspecified();
    }
    local_hostname().is_some_and(|name| name.eq_ignore_ascii_case(target))
}

pub fn local_hostname() -> Option<String> {
    let from_env = env::var("COMPUTERNAME")
        .or_else(|_| env::var("HOSTNAME"))
        .ok();
    from_env
        .or_else(|| fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .or_else(|| fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

pub async fn collect_fallback(target: &str, dns_timeout: Duration) -> HostFacts {
    let bare = target.trim_matches(|c| c == '[' || c == ']');
    let local = is_local_target(bare);
    let mut facts = HostFacts::default();

    match IpAddr::from_str(bare) {
        Ok(ip) => {
            facts.ip_addresses.push(ip.to_string());
            if local {
                facts.hostname = local_hostname();
            }
        }
        Err(_) => {
            facts.hostname = if local && bare.eq_ignore_ascii_case("localhost") {
                local_hostname().or_else(|| Some(bare.to_string()))
            } else {
                Some(bare.to_string())
            };
            facts.ip_addresses = resolve(bare, dns_timeout).await;
        }
    }

    if local {
        facts.platform = Some(env::consts::OS.to_string());
        facts.os_name = Some(env::consts::OS.to_string());
        facts.os_architecture = Some(env::consts::ARCH.to_string());
        facts.kernel_version = fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|release| release.trim().to_string())
            .filter(|release| !release.is_empty());
    }
    facts
}

async fn resolve(name: &str, dns_timeout: Duration) -> Vec<String> {
    match timeout(dns_timeout, lookup_host((name, 0))).await {
        Ok(Ok(addrs)) => {
            let mut ips: Vec<String> = Vec::new();
            for addr in addrs {
                let ip = addr.ip().to_string();
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
            ips
        }
        Ok(Err(e)) => {
            debug!(host = name, error = %e, "dns lookup failed");
            Vec::new()
        }
        Err(_) => {
            debug!(host = name, "dns lookup timed out");
            Vec::new()
        }
    }
}
