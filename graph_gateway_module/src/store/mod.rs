//! Collaborator interfaces consumed by the gateway, plus the SQLite-backed
//! implementations the binary runs with.

mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CredentialError, GatewayResult};
use crate::metadata::{ConnectionMetadata, MetadataPatch};

pub use sqlite::{SqliteConnectionStore, SqliteDedupStore};

const MAX_METADATA_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection metadata for tenant {tenant_id} changed concurrently")]
    VersionConflict { tenant_id: String },
    #[error("connection not found for tenant: {0}")]
    NotFound(String),
    #[error("blocking store task failed: {0}")]
    Task(String),
}

/// The link between one organization and its Microsoft 365 tenant.
#[derive(Debug, Clone)]
pub struct TenantConnection {
    pub tenant_id: String,
    pub remote_tenant_id: Option<String>,
    pub connected: bool,
    pub metadata: ConnectionMetadata,
    /// Bumped on every metadata write.
    pub version: u64,
}

pub trait ConnectionStore: Send + Sync {
    fn get_connection(&self, tenant_id: &str) -> Result<Option<TenantConnection>, StoreError>;

    fn list_connections(&self) -> Result<Vec<TenantConnection>, StoreError>;

    /// Merge `patch` into the stored metadata and return the new version.
    ///
    /// With `expected_version` set the write only lands if the stored
    /// version still matches; otherwise `StoreError::VersionConflict`.
    fn patch_metadata(
        &self,
        tenant_id: &str,
        patch: &MetadataPatch,
        expected_version: Option<u64>,
    ) -> Result<u64, StoreError>;
}

/// Append-only record of inbound message ids already processed per tenant.
pub trait DedupStore: Send + Sync {
    fn has_seen(&self, tenant_id: &str, message_key: &str) -> Result<bool, StoreError>;

    fn mark_seen(&self, tenant_id: &str, message_key: &str) -> Result<(), StoreError>;

    /// Record the key and report whether it was new. Implementations backed
    /// by a shared database should override this with a single atomic write.
    fn check_and_mark(&self, tenant_id: &str, message_key: &str) -> Result<bool, StoreError> {
        if self.has_seen(tenant_id, message_key)? {
            return Ok(false);
        }
        self.mark_seen(tenant_id, message_key)?;
        Ok(true)
    }
}

pub trait OrganizationSettings: Send + Sync {
    fn notification_sender_email(&self, tenant_id: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub code: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketComment {
    pub author_email: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    async fn find_ticket_by_code(&self, tenant_id: &str, code: &str)
        -> GatewayResult<Option<Ticket>>;

    async fn find_ticket_by_id(&self, tenant_id: &str, id: &str) -> GatewayResult<Option<Ticket>>;

    async fn append_comment(
        &self,
        tenant_id: &str,
        ticket_id: &str,
        comment: TicketComment,
    ) -> GatewayResult<()>;
}

#[derive(Clone)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// A current delegated (signed-in administrator) access token for the tenant.
    async fn delegated_access_token(&self, tenant_id: &str) -> Result<String, CredentialError>;

    /// Application credentials for the client-credentials grant, if configured.
    fn app_credentials(&self) -> Option<AppCredentials>;
}

/// Run a synchronous store call on tokio's blocking pool.
pub async fn run_blocking<T, F>(call: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|err| StoreError::Task(err.to_string()))?
}

/// Read-compute-compare-and-swap on a tenant's metadata.
///
/// `compute` sees the current metadata and returns the patch to apply; on a
/// version conflict it is called again against the fresh record. Returns the
/// resulting version (unchanged when the patch is empty).
pub fn update_metadata<S, F>(store: &S, tenant_id: &str, mut compute: F) -> Result<u64, StoreError>
where
    S: ConnectionStore + ?Sized,
    F: FnMut(&ConnectionMetadata) -> MetadataPatch,
{
    for attempt in 1..=MAX_METADATA_CAS_ATTEMPTS {
        let connection = store
            .get_connection(tenant_id)?
            .ok_or_else(|| StoreError::NotFound(tenant_id.to_string()))?;
        let patch = compute(&connection.metadata);
        if patch.is_empty() {
            return Ok(connection.version);
        }
        match store.patch_metadata(tenant_id, &patch, Some(connection.version)) {
            Ok(version) => return Ok(version),
            Err(StoreError::VersionConflict { .. }) => {
                debug!(
                    "metadata version conflict tenant_id={} attempt={}",
                    tenant_id, attempt
                );
            }
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::VersionConflict {
        tenant_id: tenant_id.to_string(),
    })
}
