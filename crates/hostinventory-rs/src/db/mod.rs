use std::str::FromStr;

use chrono::Utc;
use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions},
    Row, SqlitePool,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::PersistenceError,
    models::{Asset, AssetSeed, ScanReport},
    reconcile::{apply_finding_update, merge_report, AssetStore, FindingUpdate},
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Opens the asset database, creating the file on first start. Foreign keys
/// are enforced so dropping an asset also drops its IP index rows.
pub async fn create_pool(url: &str) -> Result<SqlitePool, PersistenceError> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    debug!(url, "asset database opened");
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), PersistenceError> {
    MIGRATOR.run(pool).await?;
    info!(migrations = MIGRATOR.iter().count(), "asset schema up to date");
    Ok(())
}

/// Assets stored as JSON documents, with a side table for IP lookups.
#[derive(Debug, Clone)]
pub struct SqliteAssetStore {
    pool: SqlitePool,
}

impl SqliteAssetStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn decode(document: &str) -> Result<Asset, PersistenceError> {
    Ok(serde_json::from_str(document)?)
}

async fn fetch_document(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<Option<Asset>, PersistenceError> {
    let row = sqlx::query("SELECT document FROM assets WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?;
    row.map(|r| decode(&r.try_get::<String, _>("document")?))
        .transpose()
}

/// Rewrites the document and indexes of an existing asset.
async fn store_document(conn: &mut SqliteConnection, asset: &Asset) -> Result<(), PersistenceError> {
    sqlx::query("UPDATE assets SET name = ?, hostname = ?, document = ?, updated_at = ? WHERE id = ?")
        .bind(&asset.name)
        .bind(&asset.hostname)
        .bind(serde_json::to_string(asset)?)
        .bind(asset.updated_at.to_rfc3339())
        .bind(&asset.id)
        .execute(&mut *conn)
        .await?;
    insert_ips(conn, asset).await
}

async fn insert_ips(conn: &mut SqliteConnection, asset: &Asset) -> Result<(), PersistenceError> {
    for ip in &asset.ip_addresses {
        sqlx::query("INSERT OR IGNORE INTO asset_ips(asset_id, ip) VALUES(?, ?)")
            .bind(&asset.id)
            .bind(ip)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn audit(conn: &mut SqliteConnection, action: &str, details: String) -> Result<(), PersistenceError> {
    sqlx::query(
        "INSERT INTO audit_log(action, actor, details, created_at) VALUES(?, 'reconciler', ?, CURRENT_TIMESTAMP)",
    )
    .bind(action)
    .bind(details)
    .execute(conn)
    .await?;
    Ok(())
}

/// Takes the write lock up front so two writers never both hold a read lock
/// and then deadlock on upgrade. Fails with `NotFound` if the row is missing.
async fn claim_row(conn: &mut SqliteConnection, id: &str) -> Result<(), PersistenceError> {
    let touched = sqlx::query("UPDATE assets SET updated_at = updated_at WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(PersistenceError::NotFound(id.to_string()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl AssetStore for SqliteAssetStore {
    async fn find_asset_by_ip(&self, ip: &str) -> Result<Option<Asset>, PersistenceError> {
        let row = sqlx::query(
            "SELECT a.document FROM assets a JOIN asset_ips i ON i.asset_id = a.id \
             WHERE i.ip = ? ORDER BY a.created_at, a.id LIMIT 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(&r.try_get::<String, _>("document")?))
            .transpose()
    }

    async fn find_asset_by_hostname(
        &self,
        hostname: &str,
    ) -> Result<Option<Asset>, PersistenceError> {
        let row = sqlx::query(
            "SELECT document FROM assets WHERE hostname = ? ORDER BY created_at, id LIMIT 1",
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| decode(&r.try_get::<String, _>("document")?))
            .transpose()
    }

    async fn create_asset(&self, seed: AssetSeed) -> Result<Asset, PersistenceError> {
        let asset = Asset::from_seed(Uuid::new_v4().to_string(), seed, Utc::now());
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO assets(id, name, hostname, document, created_at, updated_at) VALUES(?, ?, ?, ?, ?, ?)",
        )
        .bind(&asset.id)
        .bind(&asset.name)
        .bind(&asset.hostname)
        .bind(serde_json::to_string(&asset)?)
        .bind(asset.created_at.to_rfc3339())
        .bind(asset.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
        insert_ips(&mut tx, &asset).await?;
        audit(
            &mut tx,
            "create_asset",
            format!("asset_id={} name={}", asset.id, asset.name),
        )
        .await?;
        tx.commit().await?;
        Ok(asset)
    }

    async fn merge_into_asset(
        &self,
        id: &str,
        report: &ScanReport,
    ) -> Result<Asset, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        claim_row(&mut tx, id).await?;
        let mut asset = fetch_document(&mut tx, id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        merge_report(&mut asset, report, Utc::now());
        store_document(&mut tx, &asset).await?;
        audit(
            &mut tx,
            "merge_scan",
            format!("asset_id={id} scan_id={} status={:?}", report.scan_id, report.status),
        )
        .await?;
        tx.commit().await?;
        Ok(asset)
    }

    async fn get_asset(&self, id: &str) -> Result<Option<Asset>, PersistenceError> {
        let mut conn = self.pool.acquire().await?;
        fetch_document(&mut conn, id).await
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, PersistenceError> {
        let rows = sqlx::query("SELECT document FROM assets ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|r| decode(&r.try_get::<String, _>("document")?))
            .collect()
    }

    async fn update_finding_status(
        &self,
        id: &str,
        update: &FindingUpdate,
    ) -> Result<Asset, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        claim_row(&mut tx, id).await?;
        let mut asset = fetch_document(&mut tx, id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        apply_finding_update(&mut asset, update, Utc::now())?;
        store_document(&mut tx, &asset).await?;
        audit(
            &mut tx,
            "update_finding",
            format!(
                "asset_id={id} finding={} type={} status={:?}",
                update.name, update.finding_type, update.status
            ),
        )
        .await?;
        tx.commit().await?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::*;
    use crate::models::{
        FindingStatus, HostFacts, SecurityFinding, ServiceRecord, SessionState, Severity,
    };

    async fn store() -> SqliteAssetStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("pool");
        run_migrations(&pool).await.expect("migrate");
        SqliteAssetStore::new(pool)
    }

    fn report(ips: &[&str], services: Vec<ServiceRecord>) -> ScanReport {
        ScanReport {
            scan_id: "2024-05-01T10-20-30-123Z".into(),
            target: ips.first().copied().unwrap_or("web01").into(),
            status: SessionState::Completed,
            host: HostFacts {
                hostname: Some("web01".into()),
                ip_addresses: ips.iter().map(|s| s.to_string()).collect(),
                os_name: Some("Ubuntu 22.04".into()),
                ..HostFacts::default()
            },
            services,
            applications: vec![],
            findings: vec![SecurityFinding {
                name: "Exposed telnet service on port 23".into(),
                finding_type: "network".into(),
                severity: Severity::High,
                cvss_score: 7.5,
                description: String::new(),
                recommendation: String::new(),
                cve_references: vec![],
            }],
            labels: BTreeSet::from(["linux".to_string()]),
            hardening_index: Some(64),
            health_score: 80,
            tools: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn ssh(version: Option<&str>) -> ServiceRecord {
        ServiceRecord {
            name: "ssh".into(),
            display_name: "ssh (22/tcp)".into(),
            status: "open".into(),
            port: Some(22),
            protocol: Some("tcp".into()),
            version: version.map(Into::into),
        }
    }

    async fn audit_count(store: &SqliteAssetStore, action: &str) -> i64 {
        sqlx::query("SELECT COUNT(*) AS n FROM audit_log WHERE action = ?")
            .bind(action)
            .fetch_one(store.pool())
            .await
            .expect("count")
            .try_get("n")
            .expect("n")
    }

    #[tokio::test]
    async fn file_database_is_created_and_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inventory.db");
        let pool = create_pool(&format!("sqlite://{}", path.display()))
            .await
            .expect("pool");
        run_migrations(&pool).await.expect("migrate");
        run_migrations(&pool).await.expect("idempotent");
        assert!(path.exists());
        let store = SqliteAssetStore::new(pool);
        assert!(store.list_assets().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn bad_url_is_a_database_error() {
        let err = create_pool("postgres://nope").await.expect_err("not sqlite");
        assert!(matches!(err, PersistenceError::Database(_)));
    }

    #[tokio::test]
    async fn create_then_find_by_ip_and_hostname() {
        let store = store().await;
        let created = store
            .create_asset(AssetSeed::from_report(&report(&["10.0.0.5"], vec![])))
            .await
            .expect("create");
        let by_ip = store
            .find_asset_by_ip("10.0.0.5")
            .await
            .expect("query")
            .expect("found");
        assert_eq!(by_ip, created);
        let by_name = store
            .find_asset_by_hostname("web01")
            .await
            .expect("query")
            .expect("found");
        assert_eq!(by_name.id, created.id);
        assert!(store.find_asset_by_ip("10.9.9.9").await.expect("query").is_none());
        assert_eq!(audit_count(&store, "create_asset").await, 1);
    }

    #[tokio::test]
    async fn merge_persists_and_indexes_new_ips() {
        let store = store().await;
        let created = store
            .create_asset(AssetSeed::from_report(&report(&["10.0.0.5"], vec![ssh(None)])))
            .await
            .expect("create");
        let merged = store
            .merge_into_asset(
                &created.id,
                &report(&["10.0.0.5", "192.168.1.5"], vec![ssh(Some("OpenSSH 9.0"))]),
            )
            .await
            .expect("merge");
        assert_eq!(merged.services.len(), 1);
        assert_eq!(merged.services[0].version.as_deref(), Some("OpenSSH 9.0"));
        assert_eq!(merged.findings.len(), 1);

        let reloaded = store.get_asset(&created.id).await.expect("get").expect("found");
        assert_eq!(reloaded, merged);
        let by_new_ip = store
            .find_asset_by_ip("192.168.1.5")
            .await
            .expect("query")
            .expect("indexed");
        assert_eq!(by_new_ip.id, created.id);
        assert_eq!(audit_count(&store, "merge_scan").await, 1);
    }

    #[tokio::test]
    async fn finding_status_is_persisted() {
        let store = store().await;
        let created = store
            .create_asset(AssetSeed::from_report(&report(&["10.0.0.5"], vec![])))
            .await
            .expect("create");
        let update = FindingUpdate {
            name: "Exposed telnet service on port 23".into(),
            finding_type: "network".into(),
            status: FindingStatus::InProgress,
            assignee: Some("alice".into()),
        };
        store
            .update_finding_status(&created.id, &update)
            .await
            .expect("update");

        let merged = store
            .merge_into_asset(&created.id, &report(&["10.0.0.5"], vec![]))
            .await
            .expect("merge");
        assert_eq!(merged.findings[0].status, FindingStatus::InProgress);
        assert_eq!(merged.findings[0].assignee.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn missing_asset_is_not_found() {
        let store = store().await;
        let err = store
            .merge_into_asset("nope", &report(&["10.0.0.5"], vec![]))
            .await
            .expect_err("missing");
        assert!(matches!(err, PersistenceError::NotFound(_)));
        assert!(store.list_assets().await.expect("list").is_empty());
    }
}
