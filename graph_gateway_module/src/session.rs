use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{CredentialError, GatewayError, GatewayResult};
use crate::metadata::{keys, MetadataPatch, TokenRefreshStatus};
use crate::store::{run_blocking, ConnectionStore, OrganizationSettings, TenantConnection};
use crate::token::{AuthMode, AuthPolicy, TokenProvider};

/// Credentials and identity for one tenant's Graph calls.
#[derive(Clone)]
pub struct GraphSession {
    pub tenant_id: String,
    pub mode: AuthMode,
    pub access_token: String,
    pub remote_tenant_id: Option<String>,
    pub sender_mailbox: Option<String>,
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("tenant_id", &self.tenant_id)
            .field("mode", &self.mode)
            .field("remote_tenant_id", &self.remote_tenant_id)
            .field("sender_mailbox", &self.sender_mailbox)
            .finish_non_exhaustive()
    }
}

impl GraphSession {
    /// Service identity has no mailbox of its own, so it needs an explicit sender.
    pub fn require_sender(&self) -> GatewayResult<Option<&str>> {
        match (self.mode, self.sender_mailbox.as_deref()) {
            (AuthMode::ServiceIdentity, None) => Err(GatewayError::Configuration(format!(
                "tenant {} uses service-identity auth but no sender mailbox is configured",
                self.tenant_id
            ))),
            (_, sender) => Ok(sender),
        }
    }

    /// Path segment for the mailbox this session reads and sends from.
    pub fn mailbox_path(&self) -> GatewayResult<String> {
        match self.mode {
            AuthMode::ServiceIdentity => {
                let sender = self.require_sender()?.unwrap_or_default();
                Ok(format!("users/{}", urlencoding::encode(sender)))
            }
            AuthMode::Delegated => Ok("me".to_string()),
        }
    }
}

pub struct SessionResolver {
    tokens: Arc<TokenProvider>,
    store: Arc<dyn ConnectionStore>,
    organizations: Arc<dyn OrganizationSettings>,
    default_policy: AuthPolicy,
    default_sender_mailbox: Option<String>,
}

impl SessionResolver {
    pub fn new(
        tokens: Arc<TokenProvider>,
        store: Arc<dyn ConnectionStore>,
        organizations: Arc<dyn OrganizationSettings>,
        default_policy: AuthPolicy,
        default_sender_mailbox: Option<String>,
    ) -> Self {
        Self {
            tokens,
            store,
            organizations,
            default_policy,
            default_sender_mailbox,
        }
    }

    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    /// Metadata overrides win over the configured defaults.
    pub fn policy_for(&self, connection: &TenantConnection) -> AuthPolicy {
        AuthPolicy {
            service_identity_enabled: connection
                .metadata
                .service_identity_enabled
                .unwrap_or(self.default_policy.service_identity_enabled),
            strict: connection
                .metadata
                .service_identity_strict
                .unwrap_or(self.default_policy.strict),
        }
    }

    pub async fn sender_mailbox(&self, tenant_id: &str) -> GatewayResult<Option<String>> {
        let organizations = self.organizations.clone();
        let tenant = tenant_id.to_string();
        let configured =
            run_blocking(move || organizations.notification_sender_email(&tenant)).await?;
        Ok(configured.or_else(|| self.default_sender_mailbox.clone()))
    }

    pub async fn resolve(&self, connection: &TenantConnection) -> GatewayResult<GraphSession> {
        let tenant_id = connection.tenant_id.as_str();
        let policy = self.policy_for(connection);
        let result = self
            .tokens
            .resolve_access_token(tenant_id, connection.remote_tenant_id.as_deref(), policy)
            .await;
        self.record_token_refresh(tenant_id, &result).await;
        let (mode, access_token) = result?;

        Ok(GraphSession {
            tenant_id: tenant_id.to_string(),
            mode,
            access_token,
            remote_tenant_id: connection.remote_tenant_id.clone(),
            sender_mailbox: self.sender_mailbox(tenant_id).await?,
        })
    }

    async fn record_token_refresh(
        &self,
        tenant_id: &str,
        result: &GatewayResult<(AuthMode, String)>,
    ) {
        let now = Utc::now();
        let patch = match result {
            Ok(_) => MetadataPatch::new()
                .set(keys::LAST_TOKEN_REFRESH_STATUS, TokenRefreshStatus::Ok.as_str())
                .set_time(keys::LAST_TOKEN_REFRESH_AT, now)
                .clear(keys::LAST_TOKEN_REFRESH_ERROR),
            Err(err) => {
                let status = refresh_status_for(err);
                info!(
                    "graph token refresh failed tenant_id={} status={}",
                    tenant_id,
                    status.as_str()
                );
                MetadataPatch::new()
                    .set(keys::LAST_TOKEN_REFRESH_STATUS, status.as_str())
                    .set_time(keys::LAST_TOKEN_REFRESH_AT, now)
                    .set(keys::LAST_TOKEN_REFRESH_ERROR, err.to_string())
            }
        };
        let store = self.store.clone();
        let tenant = tenant_id.to_string();
        let written = run_blocking(move || store.patch_metadata(&tenant, &patch, None)).await;
        if let Err(err) = written {
            warn!(
                "failed to record token refresh status tenant_id={}: {}",
                tenant_id, err
            );
        }
    }
}

fn refresh_status_for(err: &GatewayError) -> TokenRefreshStatus {
    match err {
        GatewayError::Credential(CredentialError::ReconsentRequired(_)) => {
            TokenRefreshStatus::ReconsentRequired
        }
        GatewayError::StrictAuthFailure { source, .. } => refresh_status_for(source),
        _ => TokenRefreshStatus::TemporaryFailure,
    }
}
