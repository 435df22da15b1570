#[cfg(test)]
pub(crate) mod fake;
pub mod inventory;
pub mod lynis;
pub mod nmap;

use std::{sync::Arc, time::Duration};

use crate::{
    config::{AppConfig, SeverityCvss},
    error::ExecutionError,
    models::ToolId,
    parser::ParsedFragment,
    security::{command_exists, wsl_available, wsl_command_exists},
};

pub use inventory::InventoryAdapter;
pub use lynis::LynisAdapter;
pub use nmap::NmapAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Windows,
    Linux,
    Macos,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            OsFamily::Windows
        } else if cfg!(target_os = "linux") {
            OsFamily::Linux
        } else if cfg!(target_os = "macos") {
            OsFamily::Macos
        } else {
            OsFamily::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatLayer {
    Wsl,
}

/// Where an adapter can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSupport {
    Native(&'static [OsFamily]),
    NativeOrCompat {
        native: &'static [OsFamily],
        compat: CompatLayer,
    },
}

impl PlatformSupport {
    fn runs_natively_on(&self, family: OsFamily) -> bool {
        match self {
            PlatformSupport::Native(native) | PlatformSupport::NativeOrCompat { native, .. } => {
                native.contains(&family)
            }
        }
    }

    fn compat_for(&self, family: OsFamily) -> Option<CompatLayer> {
        match self {
            PlatformSupport::NativeOrCompat {
                compat: CompatLayer::Wsl,
                ..
            } if family == OsFamily::Windows => Some(CompatLayer::Wsl),
            _ => None,
        }
    }

    /// Whether the adapter can run on `family` at all, natively or through a
    /// compatibility layer that is present.
    pub async fn is_supported(&self, family: OsFamily, deadline: Duration) -> bool {
        if self.runs_natively_on(family) {
            return true;
        }
        match self.compat_for(family) {
            Some(CompatLayer::Wsl) => wsl_available(deadline).await,
            None => false,
        }
    }
}

/// How a resolved tool binary gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    Native,
    Wsl,
}

impl Launch {
    pub fn command(self, bin: &str, args: Vec<String>) -> (String, Vec<String>) {
        match self {
            Launch::Native => (bin.to_string(), args),
            Launch::Wsl => {
                let mut wsl_args = Vec::with_capacity(args.len() + 1);
                wsl_args.push(bin.to_string());
                wsl_args.extend(args);
                ("wsl".to_string(), wsl_args)
            }
        }
    }
}

/// Finds `bin` natively first, then inside WSL when the adapter allows it.
pub async fn resolve_launch(
    bin: &str,
    support: PlatformSupport,
    family: OsFamily,
    deadline: Duration,
) -> Option<Launch> {
    if support.runs_natively_on(family) && command_exists(bin, deadline).await {
        return Some(Launch::Native);
    }
    match support.compat_for(family) {
        Some(CompatLayer::Wsl) if wsl_command_exists(bin, deadline).await => Some(Launch::Wsl),
        _ => None,
    }
}

/// Per-session knobs handed to every adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOptions {
    pub nmap_args: Vec<String>,
    pub scan_packages: bool,
    pub probe_timeout: Duration,
}

impl ToolOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            nmap_args: config.nmap_args.clone(),
            scan_packages: config.scan_packages,
            probe_timeout: config.probe_timeout(),
        }
    }
}

impl Default for ToolOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[async_trait::async_trait]
pub trait ToolAdapter: Send + Sync {
    fn id(&self) -> ToolId;

    fn platform(&self) -> PlatformSupport;

    /// Tools that inspect the machine they run on cannot scan a remote target.
    fn local_only(&self) -> bool {
        false
    }

    async fn probe(&self, deadline: Duration) -> bool;

    async fn run(
        &self,
        target: &str,
        options: &ToolOptions,
        deadline: Duration,
    ) -> Result<String, ExecutionError>;

    fn parse(&self, raw: &str, cvss: &SeverityCvss) -> ParsedFragment;
}

pub type SharedAdapter = Arc<dyn ToolAdapter>;

pub fn adapter_for(tool: ToolId) -> SharedAdapter {
    match tool {
        ToolId::Nmap => Arc::new(NmapAdapter),
        ToolId::Lynis => Arc::new(LynisAdapter),
        ToolId::Inventory => Arc::new(InventoryAdapter),
    }
}

pub fn all_adapters() -> Vec<SharedAdapter> {
    ToolId::ALL.into_iter().map(adapter_for).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNIX_ONLY: PlatformSupport = PlatformSupport::Native(&[OsFamily::Linux, OsFamily::Macos]);

    #[tokio::test]
    async fn native_support_is_a_membership_check() {
        let deadline = Duration::from_millis(100);
        assert!(UNIX_ONLY.is_supported(OsFamily::Linux, deadline).await);
        assert!(!UNIX_ONLY.is_supported(OsFamily::Windows, deadline).await);
    }

    #[test]
    fn wsl_is_only_offered_on_windows() {
        let support = PlatformSupport::NativeOrCompat {
            native: &[OsFamily::Linux],
            compat: CompatLayer::Wsl,
        };
        assert_eq!(support.compat_for(OsFamily::Windows), Some(CompatLayer::Wsl));
        assert_eq!(support.compat_for(OsFamily::Macos), None);
        assert_eq!(UNIX_ONLY.compat_for(OsFamily::Windows), None);
    }

    #[test]
    fn wsl_launch_prefixes_the_binary() {
        let (cmd, args) = Launch::Wsl.command("lynis", vec!["audit".into(), "system".into()]);
        assert_eq!(cmd, "wsl");
        assert_eq!(args, vec!["lynis", "audit", "system"]);

        let (cmd, args) = Launch::Native.command("nmap", vec!["-sV".into()]);
        assert_eq!(cmd, "nmap");
        assert_eq!(args, vec!["-sV"]);
    }

    #[test]
    fn registry_covers_every_tool() {
        let ids: Vec<ToolId> = all_adapters().iter().map(|a| a.id()).collect();
        assert_eq!(ids, ToolId::ALL.to_vec());
        assert!(adapter_for(ToolId::Lynis).local_only());
        assert!(!adapter_for(ToolId::Nmap).local_only());
    }
}
