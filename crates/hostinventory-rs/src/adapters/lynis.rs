use std::time::Duration;

use super::{resolve_launch, CompatLayer, OsFamily, PlatformSupport, ToolAdapter, ToolOptions};
use crate::{
    config::SeverityCvss,
    error::ExecutionError,
    models::ToolId,
    parser::{parse_lynis, ParsedFragment},
    security::run_command_allowlisted,
};

const BIN: &str = "lynis";

const SUPPORT: PlatformSupport = PlatformSupport::NativeOrCompat {
    native: &[OsFamily::Linux, OsFamily::Macos],
    compat: CompatLayer::Wsl,
};

/// Host hardening audit of the machine running the scanner.
pub struct LynisAdapter;

#[async_trait::async_trait]
impl ToolAdapter for LynisAdapter {
    fn id(&self) -> ToolId {
        ToolId::Lynis
    }

    fn platform(&self) -> PlatformSupport {
        SUPPORT
    }

    fn local_only(&self) -> bool {
        true
    }

    async fn probe(&self, deadline: Duration) -> bool {
        resolve_launch(BIN, SUPPORT, OsFamily::current(), deadline)
            .await
            .is_some()
    }

    async fn run(
        &self,
        _target: &str,
        options: &ToolOptions,
        deadline: Duration,
    ) -> Result<String, ExecutionError> {
        let launch = resolve_launch(BIN, SUPPORT, OsFamily::current(), options.probe_timeout)
            .await
            .ok_or_else(|| ExecutionError::Unavailable("lynis not found".to_string()))?;
        let (cmd, args) = launch.command(BIN, audit_args(options.scan_packages));
        run_command_allowlisted(&cmd, &args, deadline).await
    }

    fn parse(&self, raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
        parse_lynis(raw, cvss)
    }
}

/// `--quick` skips the package checks, so it is dropped when they are wanted.
fn audit_args(scan_packages: bool) -> Vec<String> {
    let mut args = vec!["audit", "system"];
    if !scan_packages {
        args.push("--quick");
    }
    args.extend(["--quiet", "--no-colors"]);
    args.into_iter().map(String::from).collect()
}
