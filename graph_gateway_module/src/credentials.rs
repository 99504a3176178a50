//! Delegated Graph tokens backed by refresh grants stored in SQLite.
//!
//! An administrator's consent leaves a refresh token per tenant; access tokens
//! are minted from it on demand and cached until shortly before expiry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::env_var_non_empty;
use crate::error::CredentialError;
use crate::metadata::format_timestamp;
use crate::store::{AppCredentials, CredentialStore, StoreError};

pub const DELEGATED_SCOPE: &str = "offline_access https://graph.microsoft.com/.default";
/// Authority used when a grant was stored without a remote tenant id.
const COMMON_AUTHORITY: &str = "organizations";
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Reads `GRAPH_CLIENT_ID` / `GRAPH_CLIENT_SECRET`.
pub fn app_credentials_from_env() -> Option<AppCredentials> {
    Some(AppCredentials {
        client_id: env_var_non_empty("GRAPH_CLIENT_ID")?,
        client_secret: env_var_non_empty("GRAPH_CLIENT_SECRET")?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub remote_tenant_id: Option<String>,
    pub refresh_token: String,
}

#[derive(Debug, Clone)]
struct DelegatedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RefreshErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

pub struct SqliteCredentialStore {
    path: PathBuf,
    client: reqwest::Client,
    login_base_url: String,
    app: Option<AppCredentials>,
    cache: Mutex<HashMap<String, DelegatedToken>>,
}

impl SqliteCredentialStore {
    pub fn new(
        path: impl Into<PathBuf>,
        client: reqwest::Client,
        login_base_url: impl Into<String>,
        app: Option<AppCredentials>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            path: path.into(),
            client,
            login_base_url: login_base_url.into().trim_end_matches('/').to_string(),
            app,
            cache: Mutex::new(HashMap::new()),
        };
        let _ = store.open()?;
        Ok(store)
    }

    /// Store the grant obtained from an administrator's sign-in.
    pub fn save_refresh_grant(
        &self,
        tenant_id: &str,
        remote_tenant_id: Option<&str>,
        refresh_token: &str,
    ) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO graph_refresh_grants (tenant_id, remote_tenant_id, refresh_token, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tenant_id) DO UPDATE SET
                remote_tenant_id = excluded.remote_tenant_id,
                refresh_token = excluded.refresh_token,
                updated_at = excluded.updated_at",
            params![
                tenant_id,
                remote_tenant_id,
                refresh_token,
                format_timestamp(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn load_refresh_grant(&self, tenant_id: &str) -> Result<Option<RefreshGrant>, StoreError> {
        let conn = self.open()?;
        let grant = conn
            .query_row(
                "SELECT remote_tenant_id, refresh_token FROM graph_refresh_grants WHERE tenant_id = ?1",
                params![tenant_id],
                |row| {
                    Ok(RefreshGrant {
                        remote_tenant_id: row.get(0)?,
                        refresh_token: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(grant)
    }

    /// Drop the stored grant and any cached access token.
    pub async fn revoke(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.cache.lock().await.remove(tenant_id);
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM graph_refresh_grants WHERE tenant_id = ?1",
            params![tenant_id],
        )?;
        Ok(())
    }

    fn rotate_refresh_token(&self, tenant_id: &str, refresh_token: &str) -> Result<(), StoreError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE graph_refresh_grants SET refresh_token = ?2, updated_at = ?3 WHERE tenant_id = ?1",
            params![tenant_id, refresh_token, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    async fn redeem(
        &self,
        tenant_id: &str,
        grant: &RefreshGrant,
    ) -> Result<DelegatedToken, CredentialError> {
        let app = self.app.as_ref().ok_or_else(|| {
            CredentialError::Unavailable(
                "GRAPH_CLIENT_ID and GRAPH_CLIENT_SECRET must be set to refresh delegated tokens"
                    .to_string(),
            )
        })?;
        let authority = grant
            .remote_tenant_id
            .as_deref()
            .unwrap_or(COMMON_AUTHORITY);
        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.login_base_url,
            urlencoding::encode(authority)
        );
        debug!("refreshing delegated token tenant_id={}", tenant_id);

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("refresh_token", grant.refresh_token.as_str()),
                ("scope", DELEGATED_SCOPE),
            ])
            .send()
            .await
            .map_err(|err| CredentialError::Unavailable(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| CredentialError::Unavailable(err.to_string()))?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<RefreshErrorResponse>(&body).ok();
            let code = parsed.as_ref().and_then(|p| p.error.clone());
            let description = parsed
                .and_then(|p| p.error_description)
                .map(|value| value.lines().next().unwrap_or("").trim().to_string())
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            if code.as_deref() == Some("invalid_grant") {
                return Err(CredentialError::ReconsentRequired(description));
            }
            return Err(CredentialError::Unavailable(format!(
                "{}: {}",
                code.unwrap_or_else(|| "token_request_failed".to_string()),
                description
            )));
        }

        let parsed: RefreshResponse = serde_json::from_str(&body)
            .map_err(|err| CredentialError::Unavailable(format!("invalid token response: {}", err)))?;
        if let Some(rotated) = parsed
            .refresh_token
            .as_deref()
            .filter(|value| !value.is_empty() && *value != grant.refresh_token)
        {
            if let Err(err) = self.rotate_refresh_token(tenant_id, rotated) {
                warn!("failed to store rotated refresh token tenant_id={}: {}", tenant_id, err);
            } else {
                info!("delegated refresh token rotated tenant_id={}", tenant_id);
            }
        }
        let lifetime = parsed
            .expires_in
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Ok(DelegatedToken {
            access_token: parsed.access_token,
            expires_at: Utc::now() + Duration::seconds(lifetime),
        })
    }

    fn open(&self) -> Result<Connection, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graph_refresh_grants (
                tenant_id TEXT PRIMARY KEY,
                remote_tenant_id TEXT,
                refresh_token TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )?;
        Ok(conn)
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn delegated_access_token(&self, tenant_id: &str) -> Result<String, CredentialError> {
        // Held across the refresh so one tenant never redeems its grant twice at once.
        let mut cache = self.cache.lock().await;
        let now = Utc::now();
        if let Some(token) = cache.get(tenant_id) {
            if token.expires_at > now + Duration::seconds(TOKEN_REFRESH_BUFFER_SECS) {
                return Ok(token.access_token.clone());
            }
        }

        let grant = self
            .load_refresh_grant(tenant_id)
            .map_err(|err| CredentialError::Unavailable(err.to_string()))?
            .ok_or_else(|| {
                CredentialError::ReconsentRequired(format!(
                    "no delegated grant stored for tenant {}",
                    tenant_id
                ))
            })?;

        match self.redeem(tenant_id, &grant).await {
            Ok(token) => {
                let access_token = token.access_token.clone();
                cache.insert(tenant_id.to_string(), token);
                Ok(access_token)
            }
            Err(err) => {
                cache.remove(tenant_id);
                Err(err)
            }
        }
    }

    fn app_credentials(&self) -> Option<AppCredentials> {
        self.app.clone()
    }
}
