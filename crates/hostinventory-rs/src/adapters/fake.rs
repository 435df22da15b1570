//! Scripted adapters for exercising the orchestrator without real tools.

use std::{sync::Arc, time::Duration};

use super::{OsFamily, PlatformSupport, SharedAdapter, ToolAdapter, ToolOptions};
use crate::{
    config::SeverityCvss,
    error::ExecutionError,
    models::ToolId,
    parser::{parse_inventory, parse_lynis, parse_nmap, ParsedFragment},
};

const EVERYWHERE: PlatformSupport = PlatformSupport::Native(&[
    OsFamily::Linux,
    OsFamily::Macos,
    OsFamily::Windows,
    OsFamily::Other,
]);

pub const THREE_PORTS: &str = "Nmap scan report for 10.0.0.5\n\
    PORT    STATE SERVICE VERSION\n\
    22/tcp  open  ssh     OpenSSH 8.9p1\n\
    80/tcp  open  http    nginx 1.18.0\n\
    443/tcp open  https   nginx 1.18.0\n";

pub enum Behaviour {
    Output(&'static str),
    Fail,
    Hang,
    Panic,
    Missing,
}

pub struct FakeAdapter {
    pub id: ToolId,
    pub behaviour: Behaviour,
    pub local_only: bool,
}

impl FakeAdapter {
    pub fn shared(id: ToolId, behaviour: Behaviour) -> SharedAdapter {
        Arc::new(Self {
            id,
            behaviour,
            local_only: false,
        })
    }
}

#[async_trait::async_trait]
impl ToolAdapter for FakeAdapter {
    fn id(&self) -> ToolId {
        self.id
    }

    fn platform(&self) -> PlatformSupport {
        EVERYWHERE
    }

    fn local_only(&self) -> bool {
        self.local_only
    }

    async fn probe(&self, _deadline: Duration) -> bool {
        !matches!(self.behaviour, Behaviour::Missing)
    }

    async fn run(
        &self,
        _target: &str,
        _options: &ToolOptions,
        _deadline: Duration,
    ) -> Result<String, ExecutionError> {
        match self.behaviour {
            Behaviour::Output(raw) => Ok(raw.to_string()),
            Behaviour::Fail => Err(ExecutionError::NonzeroExit {
                code: Some(1),
                stderr: "boom".into(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(String::new())
            }
            Behaviour::Panic => panic!("adapter bug"),
            Behaviour::Missing => Err(ExecutionError::Unavailable("missing".into())),
        }
    }

    fn parse(&self, raw: &str, cvss: &SeverityCvss) -> ParsedFragment {
        match self.id {
            ToolId::Nmap => parse_nmap(raw),
            ToolId::Lynis => parse_lynis(raw, cvss),
            ToolId::Inventory => parse_inventory(raw, cvss),
        }
    }
}
