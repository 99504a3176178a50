//! The tenant-scoped public surface of the Graph integration.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use send_notifications_module::AdaptiveCard;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::delta_sync::{DeltaSyncEngine, DeltaSyncOutcome};
use crate::error::{GatewayError, GatewayResult};
use crate::executor::RequestExecutor;
use crate::health::{breaker_error, HealthTracker};
use crate::notify::{ChatDestination, NotificationDispatcher, TicketCard, TicketMail, WorkspaceMail};
use crate::session::{GraphSession, SessionResolver};
use crate::store::{
    run_blocking, ConnectionStore, CredentialStore, DedupStore, OrganizationSettings,
    TenantConnection, TicketStore,
};
use crate::subscription::{SubscriptionInfo, SubscriptionManager, MIN_RENEW_HORIZON_MINUTES};
use crate::token::{AuthPolicy, TokenCache, TokenProvider};
use crate::webhook::{WebhookNotification, WebhookValidator};

/// Collaborators the gateway is wired with.
#[derive(Clone)]
pub struct GatewayDeps {
    pub connections: Arc<dyn ConnectionStore>,
    pub organizations: Arc<dyn OrganizationSettings>,
    pub dedup: Arc<dyn DedupStore>,
    pub tickets: Arc<dyn TicketStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub token_cache: Arc<TokenCache>,
}

/// One async mutex per tenant; subscription and delta-sync work for the
/// same tenant runs one at a time.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TenantLocks {
    pub async fn acquire(&self, tenant_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalSummary {
    pub scanned: usize,
    pub renewed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncAllSummary {
    pub scanned: usize,
    pub synced: usize,
    pub failed: usize,
    pub processed: usize,
}

pub struct GraphGateway {
    pub(crate) config: GatewayConfig,
    pub(crate) store: Arc<dyn ConnectionStore>,
    pub(crate) executor: Arc<RequestExecutor>,
    pub(crate) health: HealthTracker,
    pub(crate) sessions: SessionResolver,
    pub(crate) subscriptions: SubscriptionManager,
    pub(crate) delta: DeltaSyncEngine,
    pub(crate) notifier: NotificationDispatcher,
    pub(crate) webhooks: WebhookValidator,
    locks: TenantLocks,
}

impl GraphGateway {
    pub fn new(config: GatewayConfig, deps: GatewayDeps) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        let executor = Arc::new(RequestExecutor::new(client.clone(), config.retry.clone()));
        let tokens = Arc::new(TokenProvider::new(
            client,
            config.login_base_url.clone(),
            config.app_scope.clone(),
            deps.credentials,
            deps.token_cache,
        ));
        let sessions = SessionResolver::new(
            tokens,
            deps.connections.clone(),
            deps.organizations,
            AuthPolicy {
                service_identity_enabled: config.service_identity_enabled,
                strict: config.service_identity_strict,
            },
            config.default_sender_mailbox.clone(),
        );
        let subscriptions = SubscriptionManager::new(
            executor.clone(),
            deps.connections.clone(),
            config.graph_base_url.clone(),
            config.webhook_url.clone(),
            config.client_state_prefix.clone(),
        );
        let delta = DeltaSyncEngine::new(
            executor.clone(),
            deps.connections.clone(),
            deps.dedup,
            deps.tickets,
            config.graph_base_url.clone(),
            config.delta_page_limit,
            config.delta_page_size,
        );
        let notifier = NotificationDispatcher::new(
            executor.clone(),
            config.graph_base_url.clone(),
            config.app_base_url.clone(),
        );
        let webhooks =
            WebhookValidator::new(deps.connections.clone(), config.client_state_prefix.clone());

        Ok(Self {
            health: HealthTracker::new(deps.connections.clone()),
            store: deps.connections,
            executor,
            sessions,
            subscriptions,
            delta,
            notifier,
            webhooks,
            locks: TenantLocks::default(),
            config,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn health(&self) -> &HealthTracker {
        &self.health
    }

    pub(crate) async fn load_connection(&self, tenant_id: &str) -> GatewayResult<TenantConnection> {
        let store = self.store.clone();
        let tenant = tenant_id.to_string();
        match run_blocking(move || store.get_connection(&tenant)).await? {
            Some(connection) if connection.connected => Ok(connection),
            _ => Err(GatewayError::NotConnected(tenant_id.to_string())),
        }
    }

    async fn connected_tenants(&self) -> GatewayResult<Vec<TenantConnection>> {
        let store = self.store.clone();
        let connections = run_blocking(move || store.list_connections()).await?;
        Ok(connections
            .into_iter()
            .filter(|connection| connection.connected)
            .collect())
    }

    /// Connection plus session, after the breaker check.
    async fn open_session(&self, tenant_id: &str) -> GatewayResult<(TenantConnection, GraphSession)> {
        let connection = self.load_connection(tenant_id).await?;
        if let Some(err) = breaker_error(tenant_id, &connection.metadata, Utc::now()) {
            return Err(err);
        }
        let session = self.sessions.resolve(&connection).await;
        if let Err(err) = &session {
            self.health.record_error(tenant_id, err).await;
        }
        Ok((connection, session?))
    }

    pub async fn ensure_mail_subscription(&self, tenant_id: &str) -> GatewayResult<SubscriptionInfo> {
        let _guard = self.locks.acquire(tenant_id).await;
        let (connection, session) = self.open_session(tenant_id).await?;
        let result = self.subscriptions.ensure(&connection, &session).await;
        self.health.record(tenant_id, &result).await;
        result
    }

    /// Ensure subscriptions for connected tenants expiring within the horizon
    /// (or never subscribed). Failures are counted per tenant.
    pub async fn renew_expiring_mail_subscriptions(
        &self,
        horizon_minutes: Option<i64>,
    ) -> GatewayResult<RenewalSummary> {
        let horizon = horizon_minutes
            .unwrap_or(self.config.renew_horizon_minutes)
            .max(MIN_RENEW_HORIZON_MINUTES);
        let cutoff = Utc::now() + Duration::minutes(horizon);
        let connections: Vec<TenantConnection> = self
            .connected_tenants()
            .await?
            .into_iter()
            .collect();
        let scanned = connections.len();
        let due: Vec<String> = connections
            .into_iter()
            .filter(|connection| {
                connection
                    .metadata
                    .mail_subscription_expires_at
                    .map(|expires_at| expires_at <= cutoff)
                    .unwrap_or(true)
            })
            .map(|connection| connection.tenant_id)
            .collect();

        let results: Vec<(String, GatewayResult<SubscriptionInfo>)> = stream::iter(due)
            .map(|tenant_id| async move {
                let result = self.ensure_mail_subscription(&tenant_id).await;
                (tenant_id, result)
            })
            .buffer_unordered(self.config.tenant_concurrency.max(1))
            .collect()
            .await;

        let mut summary = RenewalSummary {
            scanned,
            ..Default::default()
        };
        for (tenant_id, result) in results {
            match result {
                Ok(_) => summary.renewed += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!("subscription renewal failed tenant_id={}: {}", tenant_id, err);
                }
            }
        }
        info!(
            "subscription renewal scanned={} renewed={} failed={}",
            summary.scanned, summary.renewed, summary.failed
        );
        Ok(summary)
    }

    pub async fn sync_mail_delta(&self, tenant_id: &str) -> GatewayResult<DeltaSyncOutcome> {
        let _guard = self.locks.acquire(tenant_id).await;
        let (connection, session) = self.open_session(tenant_id).await?;
        let result = self.delta.sync(&connection, &session).await;
        self.health.record(tenant_id, &result).await;
        result
    }

    pub async fn sync_all_mail_delta(&self) -> GatewayResult<SyncAllSummary> {
        let tenants: Vec<String> = self
            .connected_tenants()
            .await?
            .into_iter()
            .map(|connection| connection.tenant_id)
            .collect();
        let scanned = tenants.len();

        let results: Vec<(String, GatewayResult<DeltaSyncOutcome>)> = stream::iter(tenants)
            .map(|tenant_id| async move {
                let result = self.sync_mail_delta(&tenant_id).await;
                (tenant_id, result)
            })
            .buffer_unordered(self.config.tenant_concurrency.max(1))
            .collect()
            .await;

        let mut summary = SyncAllSummary {
            scanned,
            ..Default::default()
        };
        for (tenant_id, result) in results {
            match result {
                Ok(outcome) => {
                    summary.synced += 1;
                    summary.processed += outcome.processed;
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!("mail delta sync failed tenant_id={}: {}", tenant_id, err);
                }
            }
        }
        Ok(summary)
    }

    pub async fn send_ticket_mail(&self, tenant_id: &str, mail: TicketMail) -> GatewayResult<()> {
        let (_, session) = self.open_session(tenant_id).await?;
        let result = self.notifier.send_ticket_mail(&session, mail).await;
        self.health.record(tenant_id, &result).await;
        result
    }

    pub async fn send_workspace_mail(&self, tenant_id: &str, mail: WorkspaceMail) -> GatewayResult<()> {
        let (_, session) = self.open_session(tenant_id).await?;
        let result = self.notifier.send_workspace_mail(&session, mail).await;
        self.health.record(tenant_id, &result).await;
        result
    }

    /// `Ok(false)` when the tenant has no chat or channel configured.
    pub async fn send_ticket_chat_card(&self, tenant_id: &str, card: TicketCard) -> GatewayResult<bool> {
        let connection = self.load_connection(tenant_id).await?;
        let Some(destination) = ChatDestination::from_metadata(&connection.metadata) else {
            return Ok(false);
        };
        let (_, session) = self.open_session(tenant_id).await?;
        let result = self
            .notifier
            .send_ticket_chat_card(&session, Some(&destination), card)
            .await;
        self.health.record(tenant_id, &result).await;
        result
    }

    pub async fn send_workspace_chat_card(
        &self,
        tenant_id: &str,
        card: &AdaptiveCard,
    ) -> GatewayResult<bool> {
        let connection = self.load_connection(tenant_id).await?;
        let Some(destination) = ChatDestination::from_metadata(&connection.metadata) else {
            return Ok(false);
        };
        let (_, session) = self.open_session(tenant_id).await?;
        let result = self
            .notifier
            .send_workspace_chat_card(&session, Some(&destination), card)
            .await;
        self.health.record(tenant_id, &result).await;
        result
    }

    pub async fn record_webhook_hit(&self, tenant_id: &str) -> GatewayResult<()> {
        let webhooks = self.webhooks.clone();
        let tenant = tenant_id.to_string();
        Ok(run_blocking(move || webhooks.record_hit(&tenant)).await?)
    }

    pub async fn validate_webhook_notifications(
        &self,
        notifications: &[WebhookNotification],
    ) -> GatewayResult<Vec<String>> {
        let webhooks = self.webhooks.clone();
        let notifications = notifications.to_vec();
        Ok(run_blocking(move || webhooks.validate(&notifications)).await?)
    }
}
