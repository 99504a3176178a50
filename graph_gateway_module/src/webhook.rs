//! Authenticating inbound change notifications by their `clientState`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::metadata::{keys, roll_counter, MetadataPatch};
use crate::store::{update_metadata, ConnectionStore, StoreError};
use crate::subscription::parse_client_state;

/// Body of a Graph notification POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookNotificationBatch {
    #[serde(default)]
    pub value: Vec<WebhookNotification>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookNotification {
    pub subscription_id: Option<String>,
    pub client_state: Option<String>,
    pub change_type: Option<String>,
    pub resource: Option<String>,
    /// Remote (Microsoft 365) tenant id.
    pub tenant_id: Option<String>,
}

#[derive(Clone)]
pub struct WebhookValidator {
    store: Arc<dyn ConnectionStore>,
    client_state_prefix: String,
}

impl WebhookValidator {
    pub fn new(store: Arc<dyn ConnectionStore>, client_state_prefix: impl Into<String>) -> Self {
        Self {
            store,
            client_state_prefix: client_state_prefix.into(),
        }
    }

    /// Tenants whose notifications carried the stored client state, in first-seen
    /// order without repeats. Mismatches are tallied per tenant.
    pub fn validate(&self, notifications: &[WebhookNotification]) -> Result<Vec<String>, StoreError> {
        let mut accepted = Vec::new();
        let mut accepted_set = HashSet::new();
        let mut mismatches: BTreeMap<String, u64> = BTreeMap::new();

        for notification in notifications {
            let Some(client_state) = notification.client_state.as_deref() else {
                debug!("webhook notification without client state dropped");
                continue;
            };
            let Some(parsed) = parse_client_state(client_state) else {
                debug!("webhook notification with malformed client state dropped");
                continue;
            };
            if parsed.prefix != self.client_state_prefix {
                debug!("webhook notification with foreign prefix dropped");
                continue;
            }
            let tenant_id = parsed.tenant_id;
            let Some(connection) = self.store.get_connection(tenant_id)? else {
                debug!("webhook notification for unknown tenant_id={}", tenant_id);
                continue;
            };

            let expected = connection.metadata.mail_webhook_client_state.as_deref();
            if connection.connected && expected == Some(client_state.trim()) {
                if accepted_set.insert(tenant_id.to_string()) {
                    accepted.push(tenant_id.to_string());
                }
            } else {
                *mismatches.entry(tenant_id.to_string()).or_insert(0) += 1;
            }
        }

        let now = Utc::now();
        for (tenant_id, count) in mismatches {
            warn!(
                "webhook client state mismatch tenant_id={} count={}",
                tenant_id, count
            );
            let result = update_metadata(self.store.as_ref(), &tenant_id, |meta| {
                let total = roll_counter(
                    meta.webhook_client_state_mismatch_count24h,
                    meta.last_webhook_client_state_mismatch_at,
                    count,
                    now,
                );
                MetadataPatch::new()
                    .set(keys::WEBHOOK_CLIENT_STATE_MISMATCH_COUNT_24H, total)
                    .set_time(keys::LAST_WEBHOOK_CLIENT_STATE_MISMATCH_AT, now)
            });
            if let Err(err) = result {
                warn!(
                    "failed to record client state mismatch tenant_id={}: {}",
                    tenant_id, err
                );
            }
        }

        Ok(accepted)
    }

    pub fn record_hit(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.store.patch_metadata(
            tenant_id,
            &MetadataPatch::new().set_time(keys::LAST_WEBHOOK_AT, Utc::now()),
            None,
        )?;
        Ok(())
    }
}
