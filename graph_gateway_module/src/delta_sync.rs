//! Incremental inbox sync: pages through the Graph messages delta feed and
//! turns ticket replies into ticket comments.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use send_notifications_module::{THREAD_KEY_HEADER, TICKET_ID_HEADER};

use crate::comment_text::extract_comment_text;
use crate::correlation::{extract_ticket_ref, CorrelationInput, TicketRef};
use crate::error::{GatewayError, GatewayResult};
use crate::executor::{GraphRequest, RequestExecutor};
use crate::metadata::{keys, roll_counter, ConnectionMetadata, MetadataPatch};
use crate::session::GraphSession;
use crate::store::{
    run_blocking, update_metadata, ConnectionStore, DedupStore, TenantConnection, TicketComment,
    TicketStore,
};

const DELTA_SELECT: &str =
    "id,subject,body,bodyPreview,from,conversationId,internetMessageHeaders,receivedDateTime";
const UNKNOWN_AUTHOR: &str = "unknown";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSyncOutcome {
    /// Messages that produced a ticket comment.
    pub processed: usize,
    /// Messages dropped because they were already seen.
    pub duplicates: u64,
    pub pages: usize,
    pub delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<Value>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundMessage {
    id: Option<String>,
    subject: Option<String>,
    conversation_id: Option<String>,
    body_preview: Option<String>,
    body: Option<MessageBody>,
    from: Option<Recipient>,
    internet_message_headers: Option<Vec<MessageHeader>>,
    #[serde(rename = "@removed")]
    removed: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    content_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    name: String,
    value: String,
}

impl InboundMessage {
    fn header(&self, name: &str) -> Option<&str> {
        self.internet_message_headers
            .iter()
            .flatten()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    fn author_email(&self) -> String {
        self.from
            .as_ref()
            .and_then(|from| from.email_address.as_ref())
            .and_then(|email| email.address.as_deref())
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .unwrap_or(UNKNOWN_AUTHOR)
            .to_string()
    }
}

enum MessageOutcome {
    Commented,
    Duplicate,
    Skipped(&'static str),
}

pub struct DeltaSyncEngine {
    executor: Arc<RequestExecutor>,
    store: Arc<dyn ConnectionStore>,
    dedup: Arc<dyn DedupStore>,
    tickets: Arc<dyn TicketStore>,
    graph_base_url: String,
    page_limit: usize,
    page_size: u32,
}

impl DeltaSyncEngine {
    pub fn new(
        executor: Arc<RequestExecutor>,
        store: Arc<dyn ConnectionStore>,
        dedup: Arc<dyn DedupStore>,
        tickets: Arc<dyn TicketStore>,
        graph_base_url: impl Into<String>,
        page_limit: usize,
        page_size: u32,
    ) -> Self {
        Self {
            executor,
            store,
            dedup,
            tickets,
            graph_base_url: graph_base_url.into().trim_end_matches('/').to_string(),
            page_limit: page_limit.max(1),
            page_size: page_size.max(1),
        }
    }

    /// One full pass from the stored cursor to a fresh delta link.
    ///
    /// Dedup marks and comments land as messages are processed; the cursor
    /// is only persisted once the pass reaches a delta link.
    pub async fn sync(
        &self,
        connection: &TenantConnection,
        session: &GraphSession,
    ) -> GatewayResult<DeltaSyncOutcome> {
        let tenant_id = connection.tenant_id.as_str();
        let mailbox_path = session.mailbox_path()?;
        let mut url = match connection.metadata.mail_delta_link.as_deref() {
            Some(link) if !link.trim().is_empty() => rescope_delta_link(link, &mailbox_path),
            _ => format!(
                "{}/{}/mailFolders/inbox/messages/delta?$select={}",
                self.graph_base_url, mailbox_path, DELTA_SELECT
            ),
        };

        let mut outcome = DeltaSyncOutcome::default();
        let delta_link = loop {
            if outcome.pages >= self.page_limit {
                return Err(GatewayError::PageLimitExceeded(self.page_limit));
            }
            outcome.pages += 1;

            let request = GraphRequest::get(&url, &session.access_token)
                .with_header("Prefer", format!("odata.maxpagesize={}", self.page_size));
            let body = self.executor.execute_json(request).await?;
            let page: DeltaPage = serde_json::from_value(body).map_err(|err| {
                GatewayError::InvalidUpstreamResponse(format!("delta page: {}", err))
            })?;

            for item in page.value {
                match self.process_message(tenant_id, item).await? {
                    MessageOutcome::Commented => outcome.processed += 1,
                    MessageOutcome::Duplicate => outcome.duplicates += 1,
                    MessageOutcome::Skipped(reason) => {
                        debug!("delta message skipped tenant_id={} reason={}", tenant_id, reason);
                    }
                }
            }

            match (page.next_link, page.delta_link) {
                (Some(next), _) => url = next,
                (None, Some(delta)) => break delta,
                (None, None) => {
                    return Err(GatewayError::InvalidUpstreamResponse(
                        "delta page has neither a next link nor a delta link".to_string(),
                    ))
                }
            }
        };

        let now = Utc::now();
        let duplicates = outcome.duplicates;
        let store = self.store.clone();
        let tenant = tenant_id.to_string();
        let cursor = delta_link.clone();
        run_blocking(move || {
            update_metadata(store.as_ref(), &tenant, |meta| {
                cursor_patch(meta, &cursor, duplicates, now)
            })
        })
        .await?;

        info!(
            "mail delta sync done tenant_id={} pages={} processed={} duplicates={}",
            tenant_id, outcome.pages, outcome.processed, outcome.duplicates
        );
        outcome.delta_link = Some(delta_link);
        Ok(outcome)
    }

    async fn process_message(&self, tenant_id: &str, item: Value) -> GatewayResult<MessageOutcome> {
        let message: InboundMessage = match serde_json::from_value(item) {
            Ok(message) => message,
            Err(err) => {
                warn!("unreadable delta message tenant_id={}: {}", tenant_id, err);
                return Ok(MessageOutcome::Skipped("unreadable"));
            }
        };
        if message.removed.is_some() {
            return Ok(MessageOutcome::Skipped("removed"));
        }
        let Some(message_id) = message
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            return Ok(MessageOutcome::Skipped("no message id"));
        };

        // Marked before the comment is written: a crash in between drops
        // the message rather than commenting twice.
        let dedup = self.dedup.clone();
        let (tenant, key) = (tenant_id.to_string(), message_id.to_string());
        if !run_blocking(move || dedup.check_and_mark(&tenant, &key)).await? {
            return Ok(MessageOutcome::Duplicate);
        }

        let input = CorrelationInput {
            subject: message.subject.as_deref(),
            ticket_id_header: message.header(TICKET_ID_HEADER),
            thread_key_header: message.header(THREAD_KEY_HEADER),
            references: message.header("References"),
            in_reply_to: message.header("In-Reply-To"),
            conversation_id: message.conversation_id.as_deref(),
        };
        let Some(ticket_ref) = extract_ticket_ref(&input) else {
            return Ok(MessageOutcome::Skipped("no ticket reference"));
        };

        let ticket = match &ticket_ref {
            TicketRef::Code(code) => self.tickets.find_ticket_by_code(tenant_id, code).await?,
            TicketRef::Id(id) => self.tickets.find_ticket_by_id(tenant_id, id).await?,
        };
        let Some(ticket) = ticket else {
            return Ok(MessageOutcome::Skipped("ticket not found"));
        };

        let body = message.body.as_ref();
        let Some(text) = extract_comment_text(
            body.and_then(|body| body.content_type.as_deref()),
            body.and_then(|body| body.content.as_deref()),
            message.body_preview.as_deref(),
        ) else {
            return Ok(MessageOutcome::Skipped("empty comment"));
        };

        self.tickets
            .append_comment(
                tenant_id,
                &ticket.id,
                TicketComment {
                    author_email: message.author_email(),
                    body: text,
                    created_at: Utc::now(),
                },
            )
            .await?;
        debug!(
            "inbound reply added tenant_id={} ticket_id={}",
            tenant_id, ticket.id
        );
        Ok(MessageOutcome::Commented)
    }
}

/// Cursor and duplicate-drop counters written after a completed pass.
fn cursor_patch(
    meta: &ConnectionMetadata,
    delta_link: &str,
    duplicates: u64,
    now: DateTime<Utc>,
) -> MetadataPatch {
    let mut patch = MetadataPatch::new()
        .set(keys::MAIL_DELTA_LINK, delta_link)
        .set_time(keys::LAST_MAIL_DELTA_SYNC_AT, now);
    if duplicates > 0 {
        let count = roll_counter(
            meta.inbound_duplicate_drop_count24h,
            meta.last_inbound_duplicate_drop_at,
            duplicates,
            now,
        );
        patch = patch
            .set(keys::INBOUND_DUPLICATE_DROP_COUNT_24H, count)
            .set_time(keys::LAST_INBOUND_DUPLICATE_DROP_AT, now);
    }
    patch
}

/// Point a stored cursor at the mailbox the current auth mode reads.
pub fn rescope_delta_link(link: &str, mailbox_path: &str) -> String {
    static SCOPE: OnceLock<Option<Regex>> = OnceLock::new();
    let scope = SCOPE.get_or_init(|| Regex::new(r"/(?:me|users/[^/?]+)/mailFolders").ok());
    match scope {
        Some(regex) => regex
            .replace(link, format!("/{}/mailFolders", mailbox_path).as_str())
            .into_owned(),
        None => link.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescope_switches_between_me_and_users() {
        let me = "https://graph.microsoft.com/v1.0/me/mailFolders/inbox/messages/delta?$deltatoken=abc";
        assert_eq!(
            rescope_delta_link(me, "users/support%40contoso.com"),
            "https://graph.microsoft.com/v1.0/users/support%40contoso.com/mailFolders/inbox/messages/delta?$deltatoken=abc"
        );
        let users = "https://graph.microsoft.com/v1.0/users/old%40contoso.com/mailFolders/inbox/messages/delta?$deltatoken=abc";
        assert_eq!(
            rescope_delta_link(users, "me"),
            "https://graph.microsoft.com/v1.0/me/mailFolders/inbox/messages/delta?$deltatoken=abc"
        );
    }

    #[test]
    fn message_fields_parse() {
        let message: InboundMessage = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "subject": "Re: [ENG-000042] Printer",
            "from": {"emailAddress": {"address": "jane@contoso.com", "name": "Jane"}},
            "internetMessageHeaders": [{"name": "x-ticket-id", "value": "42"}],
        }))
        .unwrap();
        assert_eq!(message.header(TICKET_ID_HEADER), Some("42"));
        assert_eq!(message.author_email(), "jane@contoso.com");

        let anonymous: InboundMessage =
            serde_json::from_value(serde_json::json!({"id": "m2"})).unwrap();
        assert_eq!(anonymous.author_email(), "unknown");
    }
}
