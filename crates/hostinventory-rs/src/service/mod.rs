//! The operations the rest of the application calls: scan, report tool
//! availability, and scan-then-reconcile.

use std::{collections::BTreeSet, io, sync::Arc, time::Duration};

use tracing::error;

use crate::{
    adapters::SharedAdapter,
    artifacts::{ArtifactSink, FsArtifactSink, ScanSummary},
    config::AppConfig,
    error::PersistenceError,
    models::{Asset, ScanReport},
    orchestrator::{Orchestrator, ScanRequest, ToolSelection, ToolsStatus},
    reconcile::{AssetStore, FindingUpdate, Reconciler, Reconciliation},
};

/// Outcome of [`InventoryService::scan_and_reconcile`]. The report is always
/// present; exactly one of the other two fields is set.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanAndReconcile {
    pub report: ScanReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<Reconciliation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_error: Option<String>,
}

pub struct InventoryService {
    config: Arc<AppConfig>,
    orchestrator: Orchestrator,
    reconciler: Reconciler,
    history: Option<Arc<FsArtifactSink>>,
}

impl InventoryService {
    pub fn new(config: Arc<AppConfig>, store: Arc<dyn AssetStore>) -> Self {
        let history = config
            .output_dir
            .as_ref()
            .map(|dir| Arc::new(FsArtifactSink::new(dir)));
        let sink = history
            .clone()
            .map(|sink| sink as Arc<dyn ArtifactSink>);
        Self {
            orchestrator: Orchestrator::from_config(&config, sink),
            reconciler: Reconciler::new(store),
            history,
            config,
        }
    }

    pub fn with_adapters(self, adapters: Vec<SharedAdapter>) -> Self {
        Self {
            orchestrator: self.orchestrator.with_adapters(adapters),
            ..self
        }
    }

    /// Builds a request from optional caller overrides and configured defaults.
    pub fn request(
        &self,
        target: &str,
        tools: Option<ToolSelection>,
        timeout: Option<Duration>,
        labels: BTreeSet<String>,
    ) -> ScanRequest {
        ScanRequest {
            target: target.trim().to_string(),
            tools: tools.unwrap_or_else(|| ToolSelection::from_config(&self.config)),
            timeout,
            labels,
        }
    }

    pub async fn run_scan(
        &self,
        target: &str,
        tools: Option<ToolSelection>,
        timeout: Option<Duration>,
    ) -> ScanReport {
        let request = self.request(target, tools, timeout, BTreeSet::new());
        self.orchestrator.run_scan(&request).await
    }

    pub async fn get_scan_tools_status(&self) -> ToolsStatus {
        self.orchestrator.tools_status().await
    }

    /// Scans, then merges the report into the asset store. A store failure is
    /// reported next to the report instead of discarding the scan.
    pub async fn scan_and_reconcile(&self, request: &ScanRequest) -> ScanAndReconcile {
        let report = self.orchestrator.run_scan(request).await;
        match self.reconciler.reconcile(&report).await {
            Ok(reconciliation) => ScanAndReconcile {
                report,
                reconciliation: Some(reconciliation),
                persistence_error: None,
            },
            Err(e) => {
                error!(scan_id = %report.scan_id, error = %e, "failed to persist scan");
                ScanAndReconcile {
                    report,
                    reconciliation: None,
                    persistence_error: Some(e.to_string()),
                }
            }
        }
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>, PersistenceError> {
        self.reconciler.store().list_assets().await
    }

    pub async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PersistenceError> {
        self.reconciler.store().get_asset(id).await
    }

    pub async fn update_finding_status(
        &self,
        asset_id: &str,
        update: &FindingUpdate,
    ) -> Result<Asset, PersistenceError> {
        self.reconciler
            .update_finding_status(asset_id, update)
            .await
    }

    pub async fn scan_history(&self) -> io::Result<Vec<ScanSummary>> {
        match &self.history {
            Some(sink) => sink.list_history().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn scan_by_id(&self, scan_id: &str) -> io::Result<Option<ScanReport>> {
        match &self.history {
            Some(sink) => sink.load_unified(scan_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapters::fake::{Behaviour, FakeAdapter, THREE_PORTS},
        models::{
            AssetSeed, SessionState, ToolId, ToolStatus,
        },
        reconcile::MemoryAssetStore,
    };

    /// Store whose backend is unreachable.
    struct DownStore;

    #[async_trait::async_trait]
    impl AssetStore for DownStore {
        async fn find_asset_by_ip(&self, _ip: &str) -> Result<Option<Asset>, PersistenceError> {
            Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn find_asset_by_hostname(
            &self,
            _hostname: &str,
        ) -> Result<Option<Asset>, PersistenceError> {
            Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn create_asset(&self, _seed: AssetSeed) -> Result<Asset, PersistenceError> {
            Err(PersistenceError::Database(sqlx::Error::PoolTimedOut))
        }

        async fn merge_into_asset(
            &self,
            id: &str,
            _report: &ScanReport,
        ) -> Result<Asset, PersistenceError> {
            Err(PersistenceError::NotFound(id.to_string()))
        }

        async fn get_asset(&self, _id: &str) -> Result<Option<Asset>, PersistenceError> {
            Ok(None)
        }

        async fn list_assets(&self) -> Result<Vec<Asset>, PersistenceError> {
            Ok(Vec::new())
        }

        async fn update_finding_status(
            &self,
            id: &str,
            _update: &FindingUpdate,
        ) -> Result<Asset, PersistenceError> {
            Err(PersistenceError::NotFound(id.to_string()))
        }
    }

    fn config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            output_dir: None,
            ..AppConfig::default()
        })
    }

    fn nmap_only() -> Vec<SharedAdapter> {
        vec![FakeAdapter::shared(ToolId::Nmap, Behaviour::Output(THREE_PORTS))]
    }

    #[tokio::test]
    async fn scan_and_reconcile_creates_then_merges() {
        let service = InventoryService::new(config(), Arc::new(MemoryAssetStore::default()))
            .with_adapters(nmap_only());
        let request = service.request("10.0.0.5", None, None, BTreeSet::new());

        let first = service.scan_and_reconcile(&request).await;
        assert!(matches!(
            first.reconciliation,
            Some(Reconciliation::Created { .. })
        ));
        let second = service.scan_and_reconcile(&request).await;
        assert!(matches!(second.reconciliation, Some(Reconciliation::Merged { .. })));
        assert_eq!(service.list_assets().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn report_survives_store_outage() {
        let service = InventoryService::new(config(), Arc::new(DownStore)).with_adapters(nmap_only());
        let request = service.request("10.0.0.5", None, None, BTreeSet::new());
        let outcome = service.scan_and_reconcile(&request).await;

        assert!(outcome.reconciliation.is_none());
        assert!(outcome
            .persistence_error
            .as_deref()
            .is_some_and(|e| e.contains("database")));
        assert_eq!(outcome.report.status, SessionState::Completed);
        assert_eq!(outcome.report.services.len(), 3);
    }

    #[tokio::test]
    async fn run_scan_honours_tool_selection() {
        let service = InventoryService::new(config(), Arc::new(MemoryAssetStore::default()))
            .with_adapters(vec![
                FakeAdapter::shared(ToolId::Nmap, Behaviour::Output(THREE_PORTS)),
                FakeAdapter::shared(ToolId::Lynis, Behaviour::Fail),
            ]);
        let only_nmap = ToolSelection {
            nmap: true,
            lynis: false,
            inventory: false,
        };
        let report = service.run_scan("10.0.0.5", Some(only_nmap), None).await;
        assert_eq!(report.status, SessionState::Completed);
        assert_eq!(report.tools.len(), 1);
        assert_eq!(report.tools[&ToolId::Nmap].status, ToolStatus::Completed);
    }

    #[tokio::test]
    async fn history_is_empty_without_output_dir() {
        let service = InventoryService::new(config(), Arc::new(MemoryAssetStore::default()));
        assert!(service.scan_history().await.expect("history").is_empty());
        assert!(service.scan_by_id("x").await.expect("lookup").is_none());
    }
}
