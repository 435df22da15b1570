use std::time::Duration;

use super::{resolve_launch, CompatLayer, OsFamily, PlatformSupport, ToolAdapter, ToolOptions};
use crate::{
    config::SeverityCvss,
    error::ExecutionError,
    models::ToolId,
    parser::{parse_nmap, ParsedFragment},
    security::{is_valid_target, run_command_allowlisted},
};

const BIN: &str = "nmap";

const SUPPORT: PlatformSupport = PlatformSupport::NativeOrCompat {
    native: &[
        OsFamily::Linux,
        OsFamily::Macos,
        OsFamily::Windows,
        OsFamily::Other,
    ],
    compat: CompatLayer::Wsl,
};

/// Port and OS fingerprinting.
pub struct NmapAdapter;

#[async_trait::async_trait]
impl ToolAdapter for NmapAdapter {
    fn id(&self) -> ToolId {
        ToolId::Nmap
    }

    fn platform(&self) -> PlatformSupport {
        SUPPORT
    }

    async fn probe(&self, deadline: Duration) -> bool {
        resolve_launch(BIN, SUPPORT, OsFamily::current(), deadline)
            .await
            .is_some()
    }

    async fn run(
        &self,
        target: &str,
        options: &ToolOptions,
        deadline: Duration,
    ) -> Result<String, ExecutionError> {
        if !is_valid_target(target) {
            return Err(ExecutionError::Internal(format!(
                "refusing to scan invalid target {target:?}"
            )));
        }
        let launch = resolve_launch(BIN, SUPPORT, OsFamily::current(), options.probe_timeout)
            .await
            .ok_or_else(|| ExecutionError::Unavailable("nmap not found".to_string()))?;
        let (cmd, args) = launch.command(BIN, scan_args(options, target));
        run_command_allowlisted(&cmd, &args, deadline).await
    }

    fn parse(&self, raw: &str, _cvss: &SeverityCvss) -> ParsedFragment {
        parse_nmap(raw)
    }
}

fn scan_args(options: &ToolOptions, target: &str) -> Vec<String> {
    let mut args = options.nmap_args.clone();
    args.push(target.to_string());
    args
}
