//! Per-tenant Graph health tracking and circuit breaker.
//!
//! State lives in connection metadata so every gateway process sharing the
//! store sees the same breaker.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::metadata::{keys, roll_counter, ConnectionMetadata, MetadataPatch};
use crate::store::{run_blocking, update_metadata, ConnectionStore};

/// Consecutive failures that open the breaker.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
pub const BREAKER_COOLDOWN_MINUTES: i64 = 5;
const DEFAULT_BREAKER_REASON: &str = "Microsoft Graph requests failed repeatedly";

#[derive(Clone)]
pub struct HealthTracker {
    store: Arc<dyn ConnectionStore>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn ConnectionStore>) -> Self {
        Self { store }
    }

    pub fn is_open(&self, tenant_id: &str) -> GatewayResult<bool> {
        Ok(self.open_error(tenant_id)?.is_some())
    }

    /// The error an entry point should fail with while the breaker is open.
    pub fn open_error(&self, tenant_id: &str) -> GatewayResult<Option<GatewayError>> {
        let connection = self
            .store
            .get_connection(tenant_id)?
            .ok_or_else(|| GatewayError::NotConnected(tenant_id.to_string()))?;
        Ok(breaker_error(tenant_id, &connection.metadata, Utc::now()))
    }

    /// Fail fast with `CircuitOpen` when the breaker is open.
    pub fn ensure_closed(&self, tenant_id: &str) -> GatewayResult<()> {
        match self.open_error(tenant_id)? {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn record_outcome<T>(&self, tenant_id: &str, outcome: &GatewayResult<T>) {
        if let Some(outcome) = Outcome::of(outcome) {
            self.apply(tenant_id, outcome);
        }
    }

    /// `record_outcome` on the blocking pool, for async callers.
    pub async fn record<T>(&self, tenant_id: &str, outcome: &GatewayResult<T>) {
        self.apply_blocking(tenant_id, Outcome::of(outcome)).await;
    }

    /// `record_failure` on the blocking pool.
    pub async fn record_error(&self, tenant_id: &str, error: &GatewayError) {
        self.apply_blocking(tenant_id, Outcome::failure(error)).await;
    }

    async fn apply_blocking(&self, tenant_id: &str, outcome: Option<Outcome>) {
        let Some(outcome) = outcome else {
            return;
        };
        let tracker = self.clone();
        let tenant = tenant_id.to_string();
        let result = run_blocking(move || {
            tracker.apply(&tenant, outcome);
            Ok(())
        })
        .await;
        if let Err(err) = result {
            warn!("failed to record graph outcome tenant_id={}: {}", tenant_id, err);
        }
    }

    /// Reset the failure counter and clear the breaker.
    pub fn record_success(&self, tenant_id: &str) {
        self.apply(tenant_id, Outcome::Success);
    }

    pub fn record_failure(&self, tenant_id: &str, error: &GatewayError) {
        if let Some(outcome) = Outcome::failure(error) {
            self.apply(tenant_id, outcome);
        }
    }

    fn apply(&self, tenant_id: &str, outcome: Outcome) {
        let result = match &outcome {
            Outcome::Success => update_metadata(self.store.as_ref(), tenant_id, success_patch),
            Outcome::Failure { message, throttled } => {
                let now = Utc::now();
                update_metadata(self.store.as_ref(), tenant_id, |meta| {
                    failure_patch(meta, message, *throttled, now)
                })
            }
        };
        if let Err(err) = result {
            warn!("failed to record graph outcome tenant_id={}: {}", tenant_id, err);
        }
    }
}

enum Outcome {
    Success,
    Failure { message: String, throttled: bool },
}

impl Outcome {
    fn of<T>(outcome: &GatewayResult<T>) -> Option<Self> {
        match outcome {
            Ok(_) => Some(Self::Success),
            Err(err) => Self::failure(err),
        }
    }

    fn failure(error: &GatewayError) -> Option<Self> {
        // Only outcomes that involved Graph count toward the breaker.
        if matches!(
            error,
            GatewayError::CircuitOpen { .. }
                | GatewayError::Configuration(_)
                | GatewayError::Validation(_)
                | GatewayError::NotConnected(_)
        ) {
            return None;
        }
        Some(Self::Failure {
            message: error.to_string(),
            throttled: error.is_throttle(),
        })
    }
}

pub fn breaker_error(
    tenant_id: &str,
    metadata: &ConnectionMetadata,
    now: DateTime<Utc>,
) -> Option<GatewayError> {
    let until = metadata.graph_circuit_breaker_until?;
    if until <= now {
        return None;
    }
    Some(GatewayError::CircuitOpen {
        tenant_id: tenant_id.to_string(),
        until,
        reason: metadata
            .graph_circuit_breaker_reason
            .clone()
            .filter(|reason| !reason.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BREAKER_REASON.to_string()),
    })
}

fn success_patch(meta: &ConnectionMetadata) -> MetadataPatch {
    let mut patch = MetadataPatch::new();
    if meta.graph_consecutive_failures != 0 {
        patch = patch.set(keys::GRAPH_CONSECUTIVE_FAILURES, 0);
    }
    if meta.graph_circuit_breaker_until.is_some() {
        patch = patch.clear(keys::GRAPH_CIRCUIT_BREAKER_UNTIL);
    }
    if meta.graph_circuit_breaker_reason.is_some() {
        patch = patch.clear(keys::GRAPH_CIRCUIT_BREAKER_REASON);
    }
    patch
}

fn failure_patch(
    meta: &ConnectionMetadata,
    message: &str,
    throttled: bool,
    now: DateTime<Utc>,
) -> MetadataPatch {
    let failures = meta.graph_consecutive_failures.saturating_add(1);
    let mut patch = MetadataPatch::new().set(keys::GRAPH_CONSECUTIVE_FAILURES, failures);

    if throttled {
        let count = roll_counter(
            meta.graph_throttle_count24h,
            meta.last_graph_throttle_at,
            1,
            now,
        );
        patch = patch
            .set(keys::GRAPH_THROTTLE_COUNT_24H, count)
            .set_time(keys::LAST_GRAPH_THROTTLE_AT, now);
    }

    if failures >= BREAKER_FAILURE_THRESHOLD {
        let until = now + Duration::minutes(BREAKER_COOLDOWN_MINUTES);
        let reason = if message.trim().is_empty() {
            DEFAULT_BREAKER_REASON.to_string()
        } else {
            message.chars().take(500).collect()
        };
        info!(
            "graph circuit breaker open failures={} until={}",
            failures,
            until.to_rfc3339()
        );
        patch = patch
            .set_time(keys::GRAPH_CIRCUIT_BREAKER_UNTIL, until)
            .set(keys::GRAPH_CIRCUIT_BREAKER_REASON, reason);
    }
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteConnectionStore;
    use tempfile::TempDir;

    fn tracker(temp: &TempDir) -> (HealthTracker, Arc<SqliteConnectionStore>) {
        let store = Arc::new(SqliteConnectionStore::new(temp.path().join("graph.db")).unwrap());
        store.upsert_connection("org-1", Some("remote-1"), true).unwrap();
        (HealthTracker::new(store.clone()), store)
    }

    fn upstream_503() -> GatewayError {
        GatewayError::RetriesExhausted {
            attempts: 3,
            last_status: 503,
            message: "Service Unavailable".to_string(),
        }
    }

    #[test]
    fn breaker_opens_after_exactly_five_failures() {
        let temp = TempDir::new().unwrap();
        let (tracker, _) = tracker(&temp);
        for _ in 0..4 {
            tracker.record_failure("org-1", &upstream_503());
        }
        assert!(!tracker.is_open("org-1").unwrap());
        tracker.record_failure("org-1", &upstream_503());
        assert!(tracker.is_open("org-1").unwrap());

        let err = tracker.ensure_closed("org-1").unwrap_err();
        assert!(err.to_string().contains("temporarily paused until"));
        assert!(err.to_string().contains("Service Unavailable"));
    }

    #[test]
    fn success_resets_counter_and_breaker() {
        let temp = TempDir::new().unwrap();
        let (tracker, store) = tracker(&temp);
        for _ in 0..5 {
            tracker.record_failure("org-1", &upstream_503());
        }
        tracker.record_success("org-1");
        let meta = store.get_connection("org-1").unwrap().unwrap().metadata;
        assert_eq!(meta.graph_consecutive_failures, 0);
        assert!(meta.graph_circuit_breaker_until.is_none());
        assert!(meta.graph_circuit_breaker_reason.is_none());
        assert!(!tracker.is_open("org-1").unwrap());
    }

    #[test]
    fn expired_breaker_is_closed_but_next_failure_reopens() {
        let temp = TempDir::new().unwrap();
        let (tracker, store) = tracker(&temp);
        let past = Utc::now() - Duration::minutes(1);
        store
            .patch_metadata(
                "org-1",
                &MetadataPatch::new()
                    .set(keys::GRAPH_CONSECUTIVE_FAILURES, 5)
                    .set_time(keys::GRAPH_CIRCUIT_BREAKER_UNTIL, past)
                    .set(keys::GRAPH_CIRCUIT_BREAKER_REASON, "old"),
                None,
            )
            .unwrap();
        assert!(!tracker.is_open("org-1").unwrap());

        tracker.record_failure("org-1", &upstream_503());
        assert!(tracker.is_open("org-1").unwrap());
    }

    #[test]
    fn throttle_failures_roll_the_daily_counter() {
        let temp = TempDir::new().unwrap();
        let (tracker, store) = tracker(&temp);
        let throttled = GatewayError::RetriesExhausted {
            attempts: 3,
            last_status: 429,
            message: "Too Many Requests".to_string(),
        };
        tracker.record_failure("org-1", &throttled);
        tracker.record_failure("org-1", &throttled);
        tracker.record_failure("org-1", &upstream_503());
        let meta = store.get_connection("org-1").unwrap().unwrap().metadata;
        assert_eq!(meta.graph_throttle_count24h, 2);
        assert_eq!(meta.graph_consecutive_failures, 3);
        assert!(meta.last_graph_throttle_at.is_some());
    }
}
