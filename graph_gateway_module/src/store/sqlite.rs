use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::{Map, Value};

use super::{ConnectionStore, DedupStore, OrganizationSettings, StoreError, TenantConnection};
use crate::metadata::{format_timestamp, ConnectionMetadata, MetadataPatch};

/// Tenant connections and organization settings in one SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteConnectionStore {
    path: PathBuf,
}

impl SqliteConnectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    /// Create or update the connection row. Metadata is left untouched.
    pub fn upsert_connection(
        &self,
        tenant_id: &str,
        remote_tenant_id: Option<&str>,
        connected: bool,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO graph_connections (tenant_id, remote_tenant_id, connected, metadata, version, updated_at)
             VALUES (?1, ?2, ?3, '{}', 0, ?4)
             ON CONFLICT(tenant_id) DO UPDATE SET
                remote_tenant_id = excluded.remote_tenant_id,
                connected = excluded.connected,
                updated_at = excluded.updated_at",
            params![
                tenant_id,
                remote_tenant_id,
                connected as i64,
                format_timestamp(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn set_notification_sender_email(
        &self,
        tenant_id: &str,
        email: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO organization_settings (tenant_id, notification_sender_email)
             VALUES (?1, ?2)
             ON CONFLICT(tenant_id) DO UPDATE SET
                notification_sender_email = excluded.notification_sender_email",
            params![tenant_id, email],
        )?;
        Ok(())
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graph_connections (
                tenant_id TEXT PRIMARY KEY,
                remote_tenant_id TEXT,
                connected INTEGER NOT NULL DEFAULT 1,
                metadata TEXT NOT NULL DEFAULT '{}',
                version INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS organization_settings (
                tenant_id TEXT PRIMARY KEY,
                notification_sender_email TEXT
            );",
        )?;
        Ok(conn)
    }
}

type ConnectionRow = (String, Option<String>, i64, String, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConnectionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

fn to_connection(row: ConnectionRow) -> Result<TenantConnection, StoreError> {
    let (tenant_id, remote_tenant_id, connected, metadata, version) = row;
    let object = parse_object(&metadata)?;
    Ok(TenantConnection {
        tenant_id,
        remote_tenant_id: remote_tenant_id.filter(|value| !value.trim().is_empty()),
        connected: connected != 0,
        metadata: ConnectionMetadata::from_object(&object)?,
        version: version.max(0) as u64,
    })
}

impl ConnectionStore for SqliteConnectionStore {
    fn get_connection(&self, tenant_id: &str) -> Result<Option<TenantConnection>, StoreError> {
        let conn = self.open()?;
        let row = conn
            .query_row(
                "SELECT tenant_id, remote_tenant_id, connected, metadata, version
                 FROM graph_connections
                 WHERE tenant_id = ?1",
                params![tenant_id],
                read_row,
            )
            .optional()?;
        row.map(to_connection).transpose()
    }

    fn list_connections(&self) -> Result<Vec<TenantConnection>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT tenant_id, remote_tenant_id, connected, metadata, version
             FROM graph_connections
             ORDER BY tenant_id",
        )?;
        let rows = stmt.query_map([], read_row)?;
        let mut connections = Vec::new();
        for row in rows {
            connections.push(to_connection(row?)?);
        }
        Ok(connections)
    }

    fn patch_metadata(
        &self,
        tenant_id: &str,
        patch: &MetadataPatch,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                "SELECT metadata, version FROM graph_connections WHERE tenant_id = ?1",
                params![tenant_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        let Some((raw, version)) = current else {
            return Err(StoreError::NotFound(tenant_id.to_string()));
        };
        let version = version.max(0) as u64;
        if let Some(expected) = expected_version {
            if expected != version {
                return Err(StoreError::VersionConflict {
                    tenant_id: tenant_id.to_string(),
                });
            }
        }

        let mut object = parse_object(&raw)?;
        patch.apply_to(&mut object);
        let next_version = version + 1;
        tx.execute(
            "UPDATE graph_connections
             SET metadata = ?1, version = ?2, updated_at = ?3
             WHERE tenant_id = ?4",
            params![
                Value::Object(object).to_string(),
                next_version as i64,
                format_timestamp(Utc::now()),
                tenant_id
            ],
        )?;
        tx.commit()?;
        Ok(next_version)
    }
}

impl OrganizationSettings for SqliteConnectionStore {
    fn notification_sender_email(&self, tenant_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.open()?;
        let value = conn
            .query_row(
                "SELECT notification_sender_email FROM organization_settings WHERE tenant_id = ?1",
                params![tenant_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(value
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty()))
    }
}

/// Seen-set of inbound message ids.
#[derive(Debug, Clone)]
pub struct SqliteDedupStore {
    path: PathBuf,
}

impl SqliteDedupStore {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let _ = store.open()?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS inbound_message_dedup (
                tenant_id TEXT NOT NULL,
                message_key TEXT NOT NULL,
                seen_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, message_key)
            )",
            [],
        )?;
        Ok(conn)
    }
}

impl DedupStore for SqliteDedupStore {
    fn has_seen(&self, tenant_id: &str, message_key: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM inbound_message_dedup WHERE tenant_id = ?1 AND message_key = ?2",
                params![tenant_id, message_key],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn mark_seen(&self, tenant_id: &str, message_key: &str) -> Result<(), StoreError> {
        self.check_and_mark(tenant_id, message_key).map(|_| ())
    }

    fn check_and_mark(&self, tenant_id: &str, message_key: &str) -> Result<bool, StoreError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO inbound_message_dedup (tenant_id, message_key, seen_at)
             VALUES (?1, ?2, ?3)",
            params![tenant_id, message_key, format_timestamp(Utc::now())],
        )?;
        Ok(inserted == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::keys;
    use crate::store::update_metadata;
    use tempfile::TempDir;

    fn store(temp: &TempDir) -> SqliteConnectionStore {
        let store = SqliteConnectionStore::new(temp.path().join("graph.db")).expect("store");
        store
            .upsert_connection("org-1", Some("remote-1"), true)
            .expect("upsert");
        store
    }

    #[test]
    fn patch_merges_and_bumps_version() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);

        let v1 = store
            .patch_metadata(
                "org-1",
                &MetadataPatch::new()
                    .set(keys::MAIL_SUBSCRIPTION_ID, "sub-1")
                    .set(keys::GRAPH_CONSECUTIVE_FAILURES, 2),
                None,
            )
            .expect("patch");
        let v2 = store
            .patch_metadata(
                "org-1",
                &MetadataPatch::new().clear(keys::GRAPH_CONSECUTIVE_FAILURES),
                Some(v1),
            )
            .expect("patch");
        assert_eq!(v2, v1 + 1);

        let connection = store.get_connection("org-1").expect("get").expect("row");
        assert_eq!(connection.remote_tenant_id.as_deref(), Some("remote-1"));
        assert_eq!(
            connection.metadata.mail_subscription_id.as_deref(),
            Some("sub-1")
        );
        assert_eq!(connection.metadata.graph_consecutive_failures, 0);
        assert_eq!(connection.version, v2);
    }

    #[test]
    fn stale_version_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        let v1 = store
            .patch_metadata("org-1", &MetadataPatch::new().set("a", 1), None)
            .expect("patch");
        let err = store
            .patch_metadata("org-1", &MetadataPatch::new().set("a", 2), Some(v1 - 1))
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[test]
    fn update_metadata_reads_current_value() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        for _ in 0..3 {
            update_metadata(&store, "org-1", |meta| {
                MetadataPatch::new().set(
                    keys::GRAPH_CONSECUTIVE_FAILURES,
                    meta.graph_consecutive_failures + 1,
                )
            })
            .expect("update");
        }
        let connection = store.get_connection("org-1").expect("get").expect("row");
        assert_eq!(connection.metadata.graph_consecutive_failures, 3);
    }

    #[test]
    fn missing_connection_is_not_found() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        assert!(store.get_connection("org-2").expect("get").is_none());
        let err = store
            .patch_metadata("org-2", &MetadataPatch::new().set("a", 1), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn sender_email_round_trips() {
        let temp = TempDir::new().expect("tempdir");
        let store = store(&temp);
        assert_eq!(store.notification_sender_email("org-1").expect("get"), None);
        store
            .set_notification_sender_email("org-1", Some(" support@contoso.com "))
            .expect("set");
        assert_eq!(
            store.notification_sender_email("org-1").expect("get").as_deref(),
            Some("support@contoso.com")
        );
    }

    #[test]
    fn dedup_check_and_mark_is_first_writer_wins() {
        let temp = TempDir::new().expect("tempdir");
        let dedup = SqliteDedupStore::new(temp.path().join("dedup.db")).expect("dedup");
        assert!(dedup.check_and_mark("org-1", "msg-1").expect("mark"));
        assert!(!dedup.check_and_mark("org-1", "msg-1").expect("mark"));
        assert!(dedup.check_and_mark("org-2", "msg-1").expect("mark"));
        assert!(dedup.has_seen("org-1", "msg-1").expect("seen"));
        assert!(!dedup.has_seen("org-1", "msg-2").expect("seen"));
    }
}
