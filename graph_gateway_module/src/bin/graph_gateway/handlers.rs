use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use graph_gateway_module::webhook::WebhookNotificationBatch;
use graph_gateway_module::GraphGateway;

use super::state::GatewayState;

#[derive(Debug, Deserialize)]
pub(super) struct NotificationParams {
    #[serde(rename = "validationToken")]
    pub(super) validation_token: Option<String>,
}

pub(super) async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Graph change notifications. Answers the subscription handshake, otherwise
/// queues a delta sync for every tenant whose client state checks out.
pub(super) async fn graph_notifications(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<NotificationParams>,
    body: Bytes,
) -> Response {
    if let Some(token) = params.validation_token {
        debug!("graph subscription validation handshake");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token,
        )
            .into_response();
    }

    let batch: WebhookNotificationBatch = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!("graph notification body rejected: {}", err);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"status": "invalid_body"})),
            )
                .into_response();
        }
    };

    let tenants = match state.gateway.validate_webhook_notifications(&batch.value).await {
        Ok(tenants) => tenants,
        Err(err) => {
            error!("graph notification validation failed: {}", err);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "error"})),
            )
                .into_response();
        }
    };

    info!(
        "graph notifications received={} accepted_tenants={}",
        batch.value.len(),
        tenants.len()
    );
    for tenant_id in &tenants {
        if let Err(err) = state.gateway.record_webhook_hit(tenant_id).await {
            warn!("failed to record webhook hit tenant_id={}: {}", tenant_id, err);
        }
        spawn_delta_sync(state.gateway.clone(), tenant_id.clone());
    }

    (
        StatusCode::ACCEPTED,
        Json(json!({"status": "accepted", "tenants": tenants.len()})),
    )
        .into_response()
}

fn spawn_delta_sync(gateway: Arc<GraphGateway>, tenant_id: String) {
    tokio::spawn(async move {
        match gateway.sync_mail_delta(&tenant_id).await {
            Ok(outcome) => debug!(
                "webhook delta sync tenant_id={} processed={}",
                tenant_id, outcome.processed
            ),
            Err(err) => warn!("webhook delta sync failed tenant_id={}: {}", tenant_id, err),
        }
    });
}
