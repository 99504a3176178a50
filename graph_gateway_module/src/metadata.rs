//! Connection metadata: the per-tenant JSON record holding subscription,
//! cursor, breaker and diagnostic state.
//!
//! Reads go through the typed [`ConnectionMetadata`] view; writes are partial
//! [`MetadataPatch`]es merged key by key into the stored object.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stored key names.
pub mod keys {
    pub const MAIL_SUBSCRIPTION_ID: &str = "mailSubscriptionId";
    pub const MAIL_SUBSCRIPTION_EXPIRES_AT: &str = "mailSubscriptionExpiresAt";
    pub const MAIL_DELTA_LINK: &str = "mailDeltaLink";
    pub const MAIL_WEBHOOK_CLIENT_STATE: &str = "mailWebhookClientState";

    pub const GRAPH_CONSECUTIVE_FAILURES: &str = "graphConsecutiveFailures";
    pub const GRAPH_CIRCUIT_BREAKER_UNTIL: &str = "graphCircuitBreakerUntil";
    pub const GRAPH_CIRCUIT_BREAKER_REASON: &str = "graphCircuitBreakerReason";

    pub const GRAPH_THROTTLE_COUNT_24H: &str = "graphThrottleCount24h";
    pub const LAST_GRAPH_THROTTLE_AT: &str = "lastGraphThrottleAt";
    pub const INBOUND_DUPLICATE_DROP_COUNT_24H: &str = "inboundDuplicateDropCount24h";
    pub const LAST_INBOUND_DUPLICATE_DROP_AT: &str = "lastInboundDuplicateDropAt";
    pub const WEBHOOK_CLIENT_STATE_MISMATCH_COUNT_24H: &str = "webhookClientStateMismatchCount24h";
    pub const LAST_WEBHOOK_CLIENT_STATE_MISMATCH_AT: &str = "lastWebhookClientStateMismatchAt";

    pub const LAST_TOKEN_REFRESH_STATUS: &str = "lastTokenRefreshStatus";
    pub const LAST_TOKEN_REFRESH_AT: &str = "lastTokenRefreshAt";
    pub const LAST_TOKEN_REFRESH_ERROR: &str = "lastTokenRefreshError";

    pub const LAST_MAIL_DELTA_SYNC_AT: &str = "lastMailDeltaSyncAt";
    pub const LAST_WEBHOOK_AT: &str = "lastWebhookAt";

    pub const SERVICE_IDENTITY_ENABLED: &str = "serviceIdentityEnabled";
    pub const SERVICE_IDENTITY_STRICT: &str = "serviceIdentityStrict";
    pub const NOTIFICATION_CHAT_ID: &str = "notificationChatId";
    pub const NOTIFICATION_TEAM_ID: &str = "notificationTeamId";
    pub const NOTIFICATION_CHANNEL_ID: &str = "notificationChannelId";
}

/// Outcome of the last token acquisition, kept for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRefreshStatus {
    Ok,
    TemporaryFailure,
    ReconsentRequired,
}

impl TokenRefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::TemporaryFailure => "temporary_failure",
            Self::ReconsentRequired => "reconsent_required",
        }
    }
}

/// Typed view over the stored metadata object. Unknown keys are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub mail_subscription_id: Option<String>,
    pub mail_subscription_expires_at: Option<DateTime<Utc>>,
    pub mail_delta_link: Option<String>,
    pub mail_webhook_client_state: Option<String>,

    pub graph_consecutive_failures: u32,
    pub graph_circuit_breaker_until: Option<DateTime<Utc>>,
    pub graph_circuit_breaker_reason: Option<String>,

    pub graph_throttle_count24h: u64,
    pub last_graph_throttle_at: Option<DateTime<Utc>>,
    pub inbound_duplicate_drop_count24h: u64,
    pub last_inbound_duplicate_drop_at: Option<DateTime<Utc>>,
    pub webhook_client_state_mismatch_count24h: u64,
    pub last_webhook_client_state_mismatch_at: Option<DateTime<Utc>>,

    pub last_token_refresh_status: Option<TokenRefreshStatus>,
    pub last_token_refresh_at: Option<DateTime<Utc>>,
    pub last_token_refresh_error: Option<String>,

    pub last_mail_delta_sync_at: Option<DateTime<Utc>>,
    pub last_webhook_at: Option<DateTime<Utc>>,

    pub service_identity_enabled: Option<bool>,
    pub service_identity_strict: Option<bool>,
    pub notification_chat_id: Option<String>,
    pub notification_team_id: Option<String>,
    pub notification_channel_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConnectionMetadata {
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(object.clone()))
    }
}

/// Partial update merged into the stored metadata object.
///
/// A key set to JSON `null` is removed from the stored object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataPatch {
    entries: Map<String, Value>,
}

impl MetadataPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.entries.insert(key.to_string(), value.into());
        self
    }

    pub fn set_time(self, key: &str, at: DateTime<Utc>) -> Self {
        self.set(key, format_timestamp(at))
    }

    pub fn clear(mut self, key: &str) -> Self {
        self.entries.insert(key.to_string(), Value::Null);
        self
    }

    pub fn merge(mut self, other: MetadataPatch) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Merge into `target`; `null` entries delete their key.
    pub fn apply_to(&self, target: &mut Map<String, Value>) {
        for (key, value) in &self.entries {
            if value.is_null() {
                target.remove(key);
            } else {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Rolling 24-hour counter: resets to `occurrences` when the previous
/// occurrence is older than a day, otherwise adds to the previous count.
pub fn roll_counter(
    previous: u64,
    last_at: Option<DateTime<Utc>>,
    occurrences: u64,
    now: DateTime<Utc>,
) -> u64 {
    match last_at {
        Some(last) if now.signed_duration_since(last) <= Duration::hours(24) => {
            previous.saturating_add(occurrences)
        }
        _ => occurrences,
    }
}
