//! Ticket store backed by the ticketing service's internal REST API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};
use crate::store::{Ticket, TicketComment, TicketStore};

const COMMENT_SOURCE: &str = "email";

#[derive(Debug, Deserialize)]
struct TicketBody {
    id: String,
    code: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommentBody<'a> {
    author_email: &'a str,
    body: &'a str,
    created_at: DateTime<Utc>,
    source: &'static str,
}

pub struct TicketApiClient {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
}

impl std::fmt::Debug for TicketApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TicketApiClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        service_token: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            service_token: service_token.into(),
        }
    }

    fn tenant_url(&self, tenant_id: &str, rest: &str) -> String {
        format!(
            "{}/internal/tenants/{}/{}",
            self.base_url,
            urlencoding::encode(tenant_id),
            rest
        )
    }

    async fn fetch_ticket(&self, url: String) -> GatewayResult<Option<Ticket>> {
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.service_token)
            .send()
            .await
            .map_err(|err| GatewayError::TicketStore(err.to_string()))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(GatewayError::TicketStore(format!(
                "ticket lookup failed with status {}",
                status.as_u16()
            )));
        }
        let body: TicketBody = response
            .json()
            .await
            .map_err(|err| GatewayError::TicketStore(format!("invalid ticket body: {}", err)))?;
        Ok(Some(Ticket {
            id: body.id,
            code: body.code,
            title: body.title,
        }))
    }
}

#[async_trait]
impl TicketStore for TicketApiClient {
    async fn find_ticket_by_code(
        &self,
        tenant_id: &str,
        code: &str,
    ) -> GatewayResult<Option<Ticket>> {
        let url = self.tenant_url(
            tenant_id,
            &format!("tickets/by-code/{}", urlencoding::encode(code)),
        );
        self.fetch_ticket(url).await
    }

    async fn find_ticket_by_id(&self, tenant_id: &str, id: &str) -> GatewayResult<Option<Ticket>> {
        let url = self.tenant_url(tenant_id, &format!("tickets/{}", urlencoding::encode(id)));
        self.fetch_ticket(url).await
    }

    async fn append_comment(
        &self,
        tenant_id: &str,
        ticket_id: &str,
        comment: TicketComment,
    ) -> GatewayResult<()> {
        let url = self.tenant_url(
            tenant_id,
            &format!("tickets/{}/comments", urlencoding::encode(ticket_id)),
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_token)
            .json(&CommentBody {
                author_email: &comment.author_email,
                body: &comment.body,
                created_at: comment.created_at,
                source: COMMENT_SOURCE,
            })
            .send()
            .await
            .map_err(|err| GatewayError::TicketStore(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::TicketStore(format!(
                "comment append failed for ticket {} with status {}",
                ticket_id,
                status.as_u16()
            )));
        }
        debug!("ticket comment appended tenant_id={} ticket_id={}", tenant_id, ticket_id);
        Ok(())
    }
}
