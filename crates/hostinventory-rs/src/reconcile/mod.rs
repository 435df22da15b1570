//! Resolves which asset a scan describes and folds the scan into it.

pub mod locks;
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    error::PersistenceError,
    models::{Asset, AssetSeed, FindingStatus, HostFacts, ScanReport, TrackedFinding},
};

pub use locks::KeyedLocks;
pub use memory::MemoryAssetStore;

/// Operator change to the tracked state of one finding on an asset.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindingUpdate {
    pub name: String,
    #[serde(rename = "type")]
    pub finding_type: String,
    pub status: FindingStatus,
    #[serde(default)]
    pub assignee: Option<String>,
}

#[async_trait::async_trait]
pub trait AssetStore: Send + Sync {
    async fn find_asset_by_ip(&self, ip: &str) -> Result<Option<Asset>, PersistenceError>;

    async fn find_asset_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<Asset>, PersistenceError>;

    async fn create_asset(&self, seed: AssetSeed) -> Result<Asset, PersistenceError>;

    /// Applies [`merge_report`] to the stored asset as one atomic update.
    async fn merge_into_asset(
        &self,
        id: &str,
        report: &ScanReport,
    ) -> Result<Asset, PersistenceError>;

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PersistenceError>;

    async fn list_assets(&self) -> Result<Vec<Asset>, PersistenceError>;

    async fn update_finding_status(
        &self,
        id: &str,
        update: &FindingUpdate,
    ) -> Result<Asset, PersistenceError>;
}

/// Folds `report` into `asset`.
///
/// Services are unioned by key with the newer record winning; applications
/// are replaced only by a non-empty set; findings are upserted and keep their
/// operator-owned status and assignee; labels and IPs are unioned. Scalar host
/// facts are overwritten only by values the scan actually found.
pub fn merge_report(asset: &mut Asset, report: &ScanReport, now: DateTime<Utc>) {
    for service in &report.services {
        let key = service.key();
        match asset.services.iter_mut().find(|s| s.key() == key) {
            Some(existing) => {
                existing.status = service.status.clone();
                existing.version = service.version.clone();
                existing.display_name = service.display_name.clone();
            }
            None => asset.services.push(service.clone()),
        }
    }

    if !report.applications.is_empty() {
        asset.applications = report.applications.clone();
    }

    for finding in &report.findings {
        let key = finding.key();
        match asset.findings.iter_mut().find(|f| f.finding.key() == key) {
            Some(tracked) => tracked.last_seen = report.timestamp,
            None => asset
                .findings
                .push(TrackedFinding::new(finding.clone(), report.timestamp)),
        }
    }

    asset.labels.extend(report.labels.iter().cloned());
    for ip in &report.host.ip_addresses {
        if !asset.has_ip(ip) {
            asset.ip_addresses.push(ip.clone());
        }
    }

    apply_host_facts(asset, &report.host);
    asset.health_score = report.health_score;
    asset.last_scan = report.timestamp;
    asset.updated_at = now;
}

fn apply_host_facts(asset: &mut Asset, host: &HostFacts) {
    fn overwrite<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if value.is_some() {
            slot.clone_from(value);
        }
    }

    overwrite(&mut asset.hostname, &host.hostname);
    if host.has_os() {
        asset.os_name.clone_from(&host.os_name);
        asset.os_version.clone_from(&host.os_version);
        asset.os_build_number.clone_from(&host.os_build_number);
    }
    overwrite(&mut asset.os_architecture, &host.os_architecture);
    overwrite(&mut asset.kernel_version, &host.kernel_version);
    overwrite(&mut asset.platform, &host.platform);
    overwrite(&mut asset.os_last_boot, &host.last_boot);
}

/// Sets the status (and assignee, when given) of an existing finding.
pub fn apply_finding_update(
    asset: &mut Asset,
    update: &FindingUpdate,
    now: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    let tracked = asset
        .findings
        .iter_mut()
        .find(|f| f.finding.name == update.name && f.finding.finding_type == update.finding_type)
        .ok_or_else(|| PersistenceError::FindingNotFound {
            asset_id: asset.id.clone(),
            name: update.name.clone(),
            finding_type: update.finding_type.clone(),
        })?;
    tracked.status = update.status;
    if update.assignee.is_some() {
        tracked.assignee.clone_from(&update.assignee);
    }
    asset.updated_at = now;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Reconciliation {
    Created {
        asset: Asset,
        /// The report carried neither an IP nor a hostname to match on.
        ambiguous_identity: bool,
    },
    Merged {
        asset: Asset,
    },
}

impl Reconciliation {
    pub fn asset(&self) -> &Asset {
        match self {
            Reconciliation::Created { asset, .. } | Reconciliation::Merged { asset } => asset,
        }
    }
}

/// Serializes resolve-or-create per host identity and merges per asset id.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn AssetStore>,
    locks: KeyedLocks,
}

impl Reconciler {
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.store
    }

    /// Resolve-or-create runs while holding the lock of every identity key the
    /// report carries, so two scans sharing any IP or the hostname serialize
    /// even when their primary IPs differ.
    pub async fn reconcile(&self, report: &ScanReport) -> Result<Reconciliation, PersistenceError> {
        let keys = report.host.identity_keys();
        if keys.is_empty() {
            let asset = self.store.create_asset(AssetSeed::from_report(report)).await?;
            info!(asset_id = %asset.id, scan_id = %report.scan_id, "asset created without identity");
            return Ok(Reconciliation::Created {
                asset,
                ambiguous_identity: true,
            });
        }

        let _identity = self.locks.lock_all(&keys).await;
        let identity = keys.join(",");
        match self.resolve(&report.host).await? {
            Some(existing) => {
                let _asset = self.locks.lock(&asset_lock_key(&existing.id)).await;
                let asset = self.store.merge_into_asset(&existing.id, report).await?;
                info!(asset_id = %asset.id, scan_id = %report.scan_id, %identity, "scan merged into asset");
                Ok(Reconciliation::Merged { asset })
            }
            None => {
                let asset = self.store.create_asset(AssetSeed::from_report(report)).await?;
                info!(asset_id = %asset.id, scan_id = %report.scan_id, %identity, "asset created");
                Ok(Reconciliation::Created {
                    asset,
                    ambiguous_identity: false,
                })
            }
        }
    }

    /// First asset matching any candidate IP in order, then the hostname.
    async fn resolve(&self, host: &HostFacts) -> Result<Option<Asset>, PersistenceError> {
        for ip in &host.ip_addresses {
            if let Some(asset) = self.store.find_asset_by_ip(ip).await? {
                return Ok(Some(asset));
            }
        }
        match &host.hostname {
            Some(hostname) => self.store.find_asset_by_hostname(hostname).await,
            None => Ok(None),
        }
    }

    pub async fn update_finding_status(
        &self,
        asset_id: &str,
        update: &FindingUpdate,
    ) -> Result<Asset, PersistenceError> {
        let _asset = self.locks.lock(&asset_lock_key(asset_id)).await;
        self.store.update_finding_status(asset_id, update).await
    }
}

fn asset_lock_key(id: &str) -> String {
    format!("asset:{id}")
}
