use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{apply_finding_update, merge_report, AssetStore, FindingUpdate};
use crate::{
    error::PersistenceError,
    models::{Asset, AssetSeed, ScanReport},
};

/// Process-local asset store. Updates hold the map entry exclusively for the
/// whole read-modify-write.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    assets: DashMap<String, Asset>,
}

impl MemoryAssetStore {
    fn oldest_matching(&self, pred: impl Fn(&Asset) -> bool) -> Option<Asset> {
        self.assets
            .iter()
            .filter(|entry| pred(entry.value()))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|entry| entry.value().clone())
    }
}

#[async_trait::async_trait]
impl AssetStore for MemoryAssetStore {
    async fn find_asset_by_ip(&self, ip: &str) -> Result<Option<Asset>, PersistenceError> {
        Ok(self.oldest_matching(|asset| asset.has_ip(ip)))
    }

    async fn find_asset_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<Asset>, PersistenceError> {
        Ok(self.oldest_matching(|asset| asset.hostname.as_deref() == Some(hostname)))
    }

    async fn create_asset(&self, seed: AssetSeed) -> Result<Asset, PersistenceError> {
        let asset = Asset::from_seed(Uuid::new_v4().to_string(), seed, Utc::now());
        self.assets.insert(asset.id.clone(), asset.clone());
        Ok(asset)
    }

    async fn merge_into_asset(
        &self,
        id: &str,
        report: &ScanReport,
    ) -> Result<Asset, PersistenceError> {
        let mut entry = self
            .assets
            .get_mut(id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        merge_report(entry.value_mut(), report, Utc::now());
        Ok(entry.value().clone())
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PersistenceError> {
        Ok(self.assets.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, PersistenceError> {
        let mut assets: Vec<Asset> = self
            .assets
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        assets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(assets)
    }

    async fn update_finding_status(
        &self,
        id: &str,
        update: &FindingUpdate,
    ) -> Result<Asset, PersistenceError> {
        let mut entry = self
            .assets
            .get_mut(id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        apply_finding_update(entry.value_mut(), update, Utc::now())?;
        Ok(entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::models::{HostFacts, SessionState};

    fn seed(ip: &str, hostname: Option<&str>) -> AssetSeed {
        AssetSeed::from_report(&ScanReport {
            scan_id: "s".into(),
            target: ip.into(),
            status: SessionState::Completed,
            host: HostFacts {
                hostname: hostname.map(Into::into),
                ip_addresses: vec![ip.into()],
                ..HostFacts::default()
            },
            services: vec![],
            applications: vec![],
            findings: vec![],
            labels: BTreeSet::new(),
            hardening_index: None,
            health_score: 100,
            tools: BTreeMap::new(),
            timestamp: Utc::now(),
        })
    }

    #[tokio::test]
    async fn lookups_by_ip_and_hostname() {
        let store = MemoryAssetStore::default();
        let created = store
            .create_asset(seed("10.0.0.5", Some("web01")))
            .await
            .expect("create");
        assert_eq!(created.name, "web01");
        assert_eq!(
            store.find_asset_by_ip("10.0.0.5").await.expect("find").map(|a| a.id),
            Some(created.id.clone())
        );
        assert!(store.find_asset_by_ip("10.0.0.6").await.expect("find").is_none());
        assert!(store
            .find_asset_by_hostname("web01")
            .await
            .expect("find")
            .is_some());
        assert!(store.get_asset(&created.id).await.expect("get").is_some());
    }

    #[tokio::test]
    async fn merge_into_missing_asset_fails() {
        let store = MemoryAssetStore::default();
        let report = ScanReport {
            scan_id: "s".into(),
            target: "x".into(),
            status: SessionState::Completed,
            host: HostFacts::default(),
            services: vec![],
            applications: vec![],
            findings: vec![],
            labels: BTreeSet::new(),
            hardening_index: None,
            health_score: 100,
            tools: BTreeMap::new(),
            timestamp: Utc::now(),
        };
        let err = store
            .merge_into_asset("missing", &report)
            .await
            .expect_err("missing");
        assert!(matches!(err, PersistenceError::NotFound(_)));
    }
}
