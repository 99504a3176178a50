//! Inbox change-notification subscriptions.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::executor::{GraphRequest, RequestExecutor};
use crate::metadata::{format_timestamp, keys, MetadataPatch};
use crate::session::GraphSession;
use crate::store::{run_blocking, ConnectionStore, TenantConnection};
use crate::token::AuthMode;

/// Cached subscriptions further out than this are reused as-is.
const RENEWAL_MARGIN_MINUTES: i64 = 60;
const SUBSCRIPTION_LIFETIME_HOURS: i64 = 48;
/// Lower bound for the batch renewal horizon.
pub const MIN_RENEW_HORIZON_MINUTES: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub subscription_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionResponse {
    id: String,
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Parsed `clientState` value `<prefix>:<tenant id>:<nonce>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState<'a> {
    pub prefix: &'a str,
    pub tenant_id: &'a str,
    pub nonce: &'a str,
}

pub fn build_client_state(prefix: &str, tenant_id: &str) -> String {
    format!("{}:{}:{}", prefix, tenant_id, Uuid::new_v4().simple())
}

pub fn parse_client_state(value: &str) -> Option<ClientState<'_>> {
    let (prefix, rest) = value.trim().split_once(':')?;
    let (tenant_id, nonce) = rest.rsplit_once(':')?;
    if prefix.is_empty() || tenant_id.is_empty() || nonce.is_empty() {
        return None;
    }
    Some(ClientState {
        prefix,
        tenant_id,
        nonce,
    })
}

/// Notification URLs must be public HTTPS.
pub fn validate_webhook_url(raw: &str) -> GatewayResult<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|err| GatewayError::Validation(format!("invalid webhook URL {}: {}", raw, err)))?;
    if url.scheme() != "https" {
        return Err(GatewayError::Validation(format!(
            "webhook URL must use https: {}",
            raw
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| GatewayError::Validation(format!("webhook URL has no host: {}", raw)))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    if is_local_host(&host) {
        return Err(GatewayError::Validation(format!(
            "webhook URL must be publicly reachable: {}",
            raw
        )));
    }
    Ok(url)
}

fn is_local_host(host: &str) -> bool {
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

pub struct SubscriptionManager {
    executor: Arc<RequestExecutor>,
    store: Arc<dyn ConnectionStore>,
    graph_base_url: String,
    webhook_url: Option<String>,
    client_state_prefix: String,
}

impl SubscriptionManager {
    pub fn new(
        executor: Arc<RequestExecutor>,
        store: Arc<dyn ConnectionStore>,
        graph_base_url: impl Into<String>,
        webhook_url: Option<String>,
        client_state_prefix: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            store,
            graph_base_url: graph_base_url.into().trim_end_matches('/').to_string(),
            webhook_url,
            client_state_prefix: client_state_prefix.into(),
        }
    }

    pub fn client_state_prefix(&self) -> &str {
        &self.client_state_prefix
    }

    /// Reuse, renew or create the tenant's inbox subscription and persist it.
    pub async fn ensure(
        &self,
        connection: &TenantConnection,
        session: &GraphSession,
    ) -> GatewayResult<SubscriptionInfo> {
        let webhook_url = self.webhook_url.as_deref().ok_or_else(|| {
            GatewayError::Configuration("GRAPH_WEBHOOK_URL is not configured".to_string())
        })?;
        let webhook_url = validate_webhook_url(webhook_url)?;

        let tenant_id = connection.tenant_id.as_str();
        let meta = &connection.metadata;
        let client_state = meta
            .mail_webhook_client_state
            .clone()
            .filter(|value| {
                parse_client_state(value)
                    .map(|parsed| {
                        parsed.prefix == self.client_state_prefix && parsed.tenant_id == tenant_id
                    })
                    .unwrap_or(false)
            })
            .unwrap_or_else(|| build_client_state(&self.client_state_prefix, tenant_id));
        let client_state_changed =
            meta.mail_webhook_client_state.as_deref() != Some(client_state.as_str());

        // Graph echoes the clientState a subscription was created with.
        let existing_id = if client_state_changed {
            if let Some(id) = meta.mail_subscription_id.as_deref() {
                info!(
                    "client state replaced, recreating subscription tenant_id={} subscription_id={}",
                    tenant_id, id
                );
            }
            None
        } else {
            meta.mail_subscription_id.as_deref()
        };

        let now = Utc::now();
        if let (Some(id), Some(expires_at)) = (existing_id, meta.mail_subscription_expires_at) {
            if expires_at > now + Duration::minutes(RENEWAL_MARGIN_MINUTES) {
                return Ok(SubscriptionInfo {
                    subscription_id: id.to_string(),
                    expires_at,
                });
            }
        }

        let requested_expiry = now + Duration::hours(SUBSCRIPTION_LIFETIME_HOURS);
        let mut renewed = None;
        if let Some(id) = existing_id {
            match self.renew(session, id, requested_expiry).await {
                Ok(info) => renewed = Some(info),
                Err(err) => {
                    warn!(
                        "subscription renewal failed tenant_id={} subscription_id={}, creating a new one: {}",
                        tenant_id, id, err
                    );
                }
            }
        }
        let info = match renewed {
            Some(info) => info,
            None => {
                self.create(session, &webhook_url, &client_state, requested_expiry)
                    .await?
            }
        };

        let patch = MetadataPatch::new()
            .set(keys::MAIL_SUBSCRIPTION_ID, info.subscription_id.clone())
            .set_time(keys::MAIL_SUBSCRIPTION_EXPIRES_AT, info.expires_at)
            .set(keys::MAIL_WEBHOOK_CLIENT_STATE, client_state);
        let store = self.store.clone();
        let tenant = tenant_id.to_string();
        run_blocking(move || store.patch_metadata(&tenant, &patch, None)).await?;
        info!(
            "mail subscription ready tenant_id={} subscription_id={} expires_at={}",
            tenant_id,
            info.subscription_id,
            format_timestamp(info.expires_at)
        );
        Ok(info)
    }

    async fn renew(
        &self,
        session: &GraphSession,
        subscription_id: &str,
        expires_at: DateTime<Utc>,
    ) -> GatewayResult<SubscriptionInfo> {
        let url = format!(
            "{}/subscriptions/{}",
            self.graph_base_url,
            urlencoding::encode(subscription_id)
        );
        let body = json!({ "expirationDateTime": format_timestamp(expires_at) });
        let response = self
            .executor
            .execute_json(GraphRequest::patch(url, &session.access_token, body))
            .await?;
        to_info(response, expires_at)
    }

    async fn create(
        &self,
        session: &GraphSession,
        webhook_url: &Url,
        client_state: &str,
        expires_at: DateTime<Utc>,
    ) -> GatewayResult<SubscriptionInfo> {
        let url = format!("{}/subscriptions", self.graph_base_url);
        let body = json!({
            "changeType": "created",
            "notificationUrl": webhook_url.as_str(),
            "resource": inbox_resource(session)?,
            "expirationDateTime": format_timestamp(expires_at),
            "clientState": client_state,
        });
        let response = self
            .executor
            .execute_json(GraphRequest::post(url, &session.access_token, body))
            .await?;
        to_info(response, expires_at)
    }
}

/// Watched resource: the sender mailbox for service identity, the signed-in
/// user's own inbox otherwise.
pub fn inbox_resource(session: &GraphSession) -> GatewayResult<String> {
    match session.mode {
        AuthMode::ServiceIdentity => {
            let mailbox = session.require_sender()?.unwrap_or_default();
            Ok(format!("users/{}/mailFolders('Inbox')/messages", mailbox))
        }
        AuthMode::Delegated => Ok("me/mailFolders('Inbox')/messages".to_string()),
    }
}

fn to_info(
    response: serde_json::Value,
    requested_expiry: DateTime<Utc>,
) -> GatewayResult<SubscriptionInfo> {
    let parsed: SubscriptionResponse = serde_json::from_value(response).map_err(|err| {
        GatewayError::InvalidUpstreamResponse(format!("subscription response: {}", err))
    })?;
    Ok(SubscriptionInfo {
        subscription_id: parsed.id,
        expires_at: parsed.expiration_date_time.unwrap_or(requested_expiry),
    })
}
