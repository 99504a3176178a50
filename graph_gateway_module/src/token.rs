//! Access tokens for Microsoft Graph.
//!
//! Service-identity tokens come from the client-credentials grant against the
//! remote tenant's token endpoint and are cached per remote tenant id.
//! Delegated tokens are owned by the [`CredentialStore`] and never cached here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::store::CredentialStore;

/// Refresh once less than this much validity remains.
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ServiceIdentity,
    Delegated,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceIdentity => "service_identity",
            Self::Delegated => "delegated",
        }
    }
}

/// Tenant-level choice of auth mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthPolicy {
    pub service_identity_enabled: bool,
    /// No delegated fallback when service identity fails.
    pub strict: bool,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now + Duration::seconds(TOKEN_REFRESH_BUFFER_SECS)
    }
}

type TokenSlot = Arc<Mutex<Option<CachedToken>>>;

/// In-memory service-identity token cache, keyed by remote tenant id.
///
/// Each key has its own lock, so concurrent callers for one tenant share a
/// single token request while other tenants proceed.
#[derive(Debug, Default)]
pub struct TokenCache {
    slots: Mutex<HashMap<String, TokenSlot>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, remote_tenant_id: &str) -> TokenSlot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(remote_tenant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    pub async fn invalidate(&self, remote_tenant_id: &str) {
        let slot = self.slot(remote_tenant_id).await;
        *slot.lock().await = None;
    }

    pub async fn clear(&self) {
        self.slots.lock().await.clear();
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct TokenProvider {
    client: reqwest::Client,
    login_base_url: String,
    scope: String,
    credentials: Arc<dyn CredentialStore>,
    cache: Arc<TokenCache>,
}

impl TokenProvider {
    pub fn new(
        client: reqwest::Client,
        login_base_url: impl Into<String>,
        scope: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
        cache: Arc<TokenCache>,
    ) -> Self {
        Self {
            client,
            login_base_url: login_base_url.into().trim_end_matches('/').to_string(),
            scope: scope.into(),
            credentials,
            cache,
        }
    }

    /// Token for an explicit mode.
    pub async fn get_access_token(
        &self,
        tenant_id: &str,
        remote_tenant_id: Option<&str>,
        mode: AuthMode,
    ) -> GatewayResult<String> {
        match mode {
            AuthMode::ServiceIdentity => {
                let remote = remote_tenant_id.ok_or_else(|| {
                    GatewayError::Configuration(format!(
                        "tenant {} has no remote tenant id for service-identity auth",
                        tenant_id
                    ))
                })?;
                self.service_identity_token(remote).await
            }
            AuthMode::Delegated => self.delegated_token(tenant_id).await,
        }
    }

    /// Pick the mode from `policy`, falling back to delegated unless strict.
    pub async fn resolve_access_token(
        &self,
        tenant_id: &str,
        remote_tenant_id: Option<&str>,
        policy: AuthPolicy,
    ) -> GatewayResult<(AuthMode, String)> {
        if policy.strict && remote_tenant_id.is_none() {
            return Err(GatewayError::StrictAuthFailure {
                remote_tenant_id: None,
                source: Box::new(GatewayError::Configuration(
                    "strict service-identity mode requires a remote tenant id".to_string(),
                )),
            });
        }
        if policy.service_identity_enabled {
            match remote_tenant_id {
                Some(remote) => match self.service_identity_token(remote).await {
                    Ok(token) => return Ok((AuthMode::ServiceIdentity, token)),
                    Err(err) if policy.strict => {
                        return Err(GatewayError::StrictAuthFailure {
                            remote_tenant_id: Some(remote.to_string()),
                            source: Box::new(err),
                        });
                    }
                    Err(err) => {
                        warn!(
                            "service-identity token failed tenant_id={}, falling back to delegated: {}",
                            tenant_id, err
                        );
                    }
                },
                None => {
                    debug!(
                        "no remote tenant id tenant_id={}, using delegated auth",
                        tenant_id
                    );
                }
            }
        }
        let token = self.delegated_token(tenant_id).await?;
        Ok((AuthMode::Delegated, token))
    }

    pub async fn delegated_token(&self, tenant_id: &str) -> GatewayResult<String> {
        Ok(self.credentials.delegated_access_token(tenant_id).await?)
    }

    pub async fn service_identity_token(&self, remote_tenant_id: &str) -> GatewayResult<String> {
        let slot = self.cache.slot(remote_tenant_id).await;
        let mut cached = slot.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }

        let fresh = self.request_app_token(remote_tenant_id).await?;
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    async fn request_app_token(&self, remote_tenant_id: &str) -> GatewayResult<CachedToken> {
        let credentials = self.credentials.app_credentials().ok_or_else(|| {
            GatewayError::Configuration(
                "GRAPH_CLIENT_ID and GRAPH_CLIENT_SECRET must be set for service-identity auth"
                    .to_string(),
            )
        })?;
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base_url,
            urlencoding::encode(remote_tenant_id)
        );
        debug!("requesting service-identity token remote_tenant_id={}", remote_tenant_id);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", credentials.client_id.as_str()),
                ("client_secret", credentials.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<TokenErrorResponse>(&body).ok();
            let (code, description) = match parsed {
                Some(parsed) => (parsed.error, parsed.error_description),
                None => (None, None),
            };
            return Err(GatewayError::UpstreamAuth {
                status: Some(status.as_u16()),
                code: code.unwrap_or_else(|| "token_request_failed".to_string()),
                description: description
                    .map(|value| first_line(&value))
                    .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|err| GatewayError::UpstreamAuth {
                status: Some(status.as_u16()),
                code: "invalid_token_response".to_string(),
                description: err.to_string(),
            })?;
        let lifetime = parsed
            .expires_in
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }
}

/// AADSTS descriptions carry trace and correlation ids on later lines.
fn first_line(value: &str) -> String {
    value.lines().next().unwrap_or("").trim().to_string()
}
