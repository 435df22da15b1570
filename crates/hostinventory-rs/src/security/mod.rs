use std::{collections::HashSet, net::IpAddr, process::Stdio, str::FromStr, time::Duration};

use ipnet::IpNet;
use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

use crate::error::ExecutionError;

/// Binaries the scanner is ever allowed to spawn.
const ALLOWED_COMMANDS: &[&str] = &[
    "nmap",
    "lynis",
    "wsl",
    "powershell",
    "sh",
    "which",
    "where",
];

const STDERR_EXCERPT: usize = 512;

/// Whether a scan of `target` is authorized.
///
/// Allowlist entries are host names (compared case-insensitively) or CIDR
/// blocks. An IP target, bracketed or not, matches a block that contains it;
/// a bare address in the allowlist counts as a single-host block.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    let target = target.trim().trim_matches(|c| c == '[' || c == ']');
    if target.is_empty() {
        return false;
    }
    let ip = IpAddr::from_str(target).ok();
    allowlist.iter().map(|entry| entry.trim()).any(|entry| match ip {
        Some(ip) => scope_block(entry).is_some_and(|net| net.contains(&ip)),
        None => entry.eq_ignore_ascii_case(target),
    })
}

fn scope_block(entry: &str) -> Option<IpNet> {
    IpNet::from_str(entry)
        .ok()
        .or_else(|| IpAddr::from_str(entry).ok().map(IpNet::from))
}

/// Rejects targets that could be mistaken for command-line options.
pub fn is_valid_target(target: &str) -> bool {
    !target.is_empty()
        && target.len() <= 253
        && !target.starts_with('-')
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
}

pub async fn run_command_allowlisted(
    cmd: &str,
    args: &[String],
    deadline: Duration,
) -> Result<String, ExecutionError> {
    let allowed_set: HashSet<&str> = ALLOWED_COMMANDS.iter().copied().collect();
    if !allowed_set.contains(cmd) {
        return Err(ExecutionError::PlatformUnsupported(format!(
            "command not allowed: {cmd}"
        )));
    }

    info!(command = cmd, ?args, "audit: launching external tool");
    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecutionError::Unavailable(format!("failed to spawn {cmd}: {e}")))?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let out = match timeout(deadline, child.wait_with_output()).await {
        Ok(res) => {
            res.map_err(|e| ExecutionError::Internal(format!("failed to wait on {cmd}: {e}")))?
        }
        Err(_) => {
            warn!(command = cmd, timeout_secs = deadline.as_secs_f64(), "tool timed out, killed");
            return Err(ExecutionError::Timeout(deadline));
        }
    };

    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let stderr: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
        return Err(ExecutionError::NonzeroExit {
            code: out.status.code(),
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}

/// True if `bin` resolves on this host's PATH.
pub async fn command_exists(bin: &str, deadline: Duration) -> bool {
    let locator = if cfg!(target_os = "windows") {
        "where"
    } else {
        "which"
    };
    match run_command_allowlisted(locator, &[bin.to_string()], deadline).await {
        Ok(stdout) => !stdout.trim().is_empty(),
        Err(_) => false,
    }
}

/// True if the Windows Subsystem for Linux answers on this host.
pub async fn wsl_available(deadline: Duration) -> bool {
    if !cfg!(target_os = "windows") {
        return false;
    }
    run_command_allowlisted("wsl", &["--status".to_string()], deadline)
        .await
        .is_ok()
}

/// True if `bin` resolves inside the default WSL distribution.
pub async fn wsl_command_exists(bin: &str, deadline: Duration) -> bool {
    if !wsl_available(deadline).await {
        return false;
    }
    match run_command_allowlisted("wsl", &["which".to_string(), bin.to_string()], deadline).await {
        Ok(stdout) => !stdout.trim().is_empty(),
        Err(_) => false,
    }
}
