#[path = "graph_gateway/config.rs"]
mod config;
#[path = "graph_gateway/handlers.rs"]
mod handlers;
#[path = "graph_gateway/state.rs"]
mod state;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use graph_gateway_module::credentials::{app_credentials_from_env, SqliteCredentialStore};
use graph_gateway_module::ticket_api::TicketApiClient;
use graph_gateway_module::{
    GatewayConfig, GatewayDeps, GraphGateway, SqliteConnectionStore, SqliteDedupStore, TokenCache,
};

use config::{
    env_or, env_string, load_gateway_config, resolve_gateway_config_path, GatewayConfigFile,
    DEFAULT_DB_PATH, DEFAULT_PORT, DEFAULT_RENEW_INTERVAL_SECS, DEFAULT_SYNC_INTERVAL_SECS,
};
use handlers::{graph_notifications, health};
use state::GatewayState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_target(false).init();
    dotenvy::dotenv().ok();

    let config_path = resolve_gateway_config_path();
    let config_file = match &config_path {
        Some(path) => load_gateway_config(path)?,
        None => GatewayConfigFile::default(),
    };

    let host = env_string("GRAPH_GATEWAY_HOST")
        .or(config_file.server.host)
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = env_or("GRAPH_GATEWAY_PORT", config_file.server.port, DEFAULT_PORT);
    let renew_interval = env_or(
        "GRAPH_RENEW_INTERVAL_SECS",
        config_file.schedule.renew_interval_secs,
        DEFAULT_RENEW_INTERVAL_SECS,
    )
    .max(1);
    let sync_interval = env_or(
        "GRAPH_SYNC_INTERVAL_SECS",
        config_file.schedule.sync_interval_secs,
        DEFAULT_SYNC_INTERVAL_SECS,
    )
    .max(1);
    let db_path = PathBuf::from(
        env_string("GRAPH_GATEWAY_DB_PATH")
            .or(config_file.storage.db_path)
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
    );
    let ticket_api_base_url = env_string("TICKET_API_BASE_URL")
        .or(config_file.tickets.api_base_url)
        .ok_or("TICKET_API_BASE_URL is not set")?;
    let ticket_api_token = env_string("TICKET_API_TOKEN").ok_or("TICKET_API_TOKEN is not set")?;

    let gateway_config = GatewayConfig::from_env();
    let client = reqwest::Client::builder()
        .timeout(gateway_config.request_timeout)
        .build()?;

    let connections = Arc::new(SqliteConnectionStore::new(&db_path)?);
    let deps = GatewayDeps {
        connections: connections.clone(),
        organizations: connections,
        dedup: Arc::new(SqliteDedupStore::new(&db_path)?),
        tickets: Arc::new(TicketApiClient::new(
            client.clone(),
            ticket_api_base_url,
            ticket_api_token,
        )),
        credentials: Arc::new(SqliteCredentialStore::new(
            &db_path,
            client,
            gateway_config.login_base_url.clone(),
            app_credentials_from_env(),
        )?),
        token_cache: Arc::new(TokenCache::new()),
    };
    let gateway = Arc::new(GraphGateway::new(gateway_config, deps)?);

    info!(
        "graph gateway config path={}, host={}, port={}, db_path={}",
        config_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string()),
        host,
        port,
        db_path.display()
    );

    spawn_renewal_loop(gateway.clone(), Duration::from_secs(renew_interval));
    spawn_sync_loop(gateway.clone(), Duration::from_secs(sync_interval));

    let state = Arc::new(GatewayState { gateway });
    let app = Router::new()
        .route("/health", get(health))
        .route("/graph/notifications", post(graph_notifications))
        .with_state(state);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("graph gateway listening on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn spawn_renewal_loop(gateway: Arc<GraphGateway>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            if let Err(err) = gateway.renew_expiring_mail_subscriptions(None).await {
                error!("subscription renewal pass failed: {}", err);
            }
        }
    });
}

fn spawn_sync_loop(gateway: Arc<GraphGateway>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            match gateway.sync_all_mail_delta().await {
                Ok(summary) => info!(
                    "scheduled mail sync scanned={} synced={} failed={} processed={}",
                    summary.scanned, summary.synced, summary.failed, summary.processed
                ),
                Err(err) => error!("scheduled mail sync failed: {}", err),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("graph gateway shutting down");
}
