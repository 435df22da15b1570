use std::time::Duration;

use super::{OsFamily, PlatformSupport, ToolAdapter, ToolOptions};
use crate::{
    config::SeverityCvss,
    error::ExecutionError,
    models::ToolId,
    parser::{parse_inventory, ParsedFragment},
    security::{command_exists, run_command_allowlisted},
};

const SUPPORT: PlatformSupport = PlatformSupport::Native(&[OsFamily::Windows, OsFamily::Linux]);

const POWERSHELL_SCRIPT: &str = r#"$ErrorActionPreference='SilentlyContinue'
$os=Get-CimInstance Win32_OperatingSystem
$cs=Get-CimInstance Win32_ComputerSystem
[pscustomobject]@{
 OSInfo=[pscustomobject]@{Caption=$os.Caption;Version=$os.Version;BuildNumber=$os.BuildNumber;OSArchitecture=$os.OSArchitecture;LastBootUpTime=$os.LastBootUpTime.ToString('o')}
 ComputerSystem=$cs|Select-Object Name,Manufacturer,Model
 Services=@(Get-Service|Where-Object {$_.Status -eq 'Running'}|Select-Object Name,DisplayName)
 Software=@(Get-ItemProperty HKLM:\Software\Microsoft\Windows\CurrentVersion\Uninstall\*,HKLM:\Software\Wow6432Node\Microsoft\Windows\CurrentVersion\Uninstall\*|Where-Object {$_.DisplayName}|Select-Object DisplayName,DisplayVersion,Publisher,InstallDate)
 IPConfiguration=@(Get-NetIPAddress|Select-Object InterfaceAlias,AddressFamily,IPAddress,PrefixLength)
 FirewallProfiles=@(Get-NetFirewallProfile|Select-Object Name,Enabled)
 RecentUpdates=@(Get-HotFix|Sort-Object InstalledOn -Descending|Select-Object -First 10 HotFixID,Description)
}|ConvertTo-Json -Compress -Depth 4"#;

const POSIX_SCRIPT: &str = r#"echo '### os-release'; cat /etc/os-release 2>/dev/null
echo '### uname'; uname -srm
echo '### hostname'; hostname 2>/dev/null || cat /proc/sys/kernel/hostname
echo '### boot'; date -d "$(uptime -s 2>/dev/null)" +%s 2>/dev/null
echo '### addresses'; hostname -I 2>/dev/null
echo '### services'; systemctl list-units --type=service --state=running --no-legend --no-pager 2>/dev/null
echo '### packages'
if command -v dpkg-query >/dev/null 2>&1; then
  dpkg-query -W -f='${Package}\t${Version}\t${Maintainer}\n' 2>/dev/null
elif command -v rpm >/dev/null 2>&1; then
  rpm -qa --qf '%{NAME}\t%{VERSION}-%{RELEASE}\t%{VENDOR}\t%{INSTALLTIME}\n' 2>/dev/null
fi
exit 0"#;

/// Native system and software inventory of the machine running the scanner.
pub struct InventoryAdapter;

impl InventoryAdapter {
    fn invocation(family: OsFamily) -> Option<(&'static str, Vec<String>)> {
        match family {
            OsFamily::Windows => Some((
                "powershell",
                vec![
                    "-NoProfile".to_string(),
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-Command".to_string(),
                    POWERSHELL_SCRIPT.to_string(),
                ],
            )),
            OsFamily::Linux => Some(("sh", vec!["-c".to_string(), POSIX_SCRIPT.to_string()])),
            OsFamily::Macos | OsFamily::Other => None,
        }
    }
}

#[async_trait::async_trait]
impl ToolAdapter for InventoryAdapter {
    fn id(&self) -> ToolId {
        ToolId::Inventory
    }

    fn platform(&self) -> PlatformSupport {
        SUPPORT
    }

    fn local_only(&self) -> bool {
        true
    }

    async fn probe(&self, deadline: Duration) -> bool {
        match Self::invocation(OsFamily::current()) {
            Some((shell, _)) => command_exists(shell, deadline).await,
            None => false,
        }
    }

    async fn run(
        &self,
        _target: &str,
        _options: &ToolOptions,
        deadline: Duration,
    ) -> Result<String, ExecutionError> {
        let (shell, args) = Self::invocation(OsFamily::current()).ok_or_else(|| {
            ExecutionError::PlatformUnsupported(format!(
                "no inventory collector for {}",
                std::env::consts::OS
            ))
        })?;
        run_command_allowlisted(shell, &args, deadline).await
    }

    fn parse(&self, raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
        parse_inventory(raw, cvss)
    }
}
