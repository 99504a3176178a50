//! Outbound mail and chat-card delivery through Graph.

use std::sync::Arc;

use send_notifications_module::{prefix_subject, AdaptiveCard, MailAttachment, MailEnvelope};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::executor::{GraphRequest, RequestExecutor};
use crate::metadata::ConnectionMetadata;
use crate::session::GraphSession;
use crate::token::AuthMode;

/// Mail about a specific ticket; replies are correlated back to it.
#[derive(Debug, Clone, Default)]
pub struct TicketMail {
    pub ticket_id: String,
    pub ticket_code: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<MailAttachment>,
}

/// Mail not tied to a ticket (invitations, digests).
#[derive(Debug, Clone, Default)]
pub struct WorkspaceMail {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub attachments: Vec<MailAttachment>,
}

#[derive(Debug, Clone, Default)]
pub struct TicketCard {
    pub ticket_id: String,
    pub ticket_code: Option<String>,
    pub title: String,
    pub summary: String,
    pub facts: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDestination {
    Chat(String),
    Channel { team_id: String, channel_id: String },
}

impl ChatDestination {
    /// A chat id wins over a team/channel pair; `None` when neither is set.
    pub fn from_metadata(metadata: &ConnectionMetadata) -> Option<Self> {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        if let Some(chat_id) = non_empty(&metadata.notification_chat_id) {
            return Some(Self::Chat(chat_id));
        }
        match (
            non_empty(&metadata.notification_team_id),
            non_empty(&metadata.notification_channel_id),
        ) {
            (Some(team_id), Some(channel_id)) => Some(Self::Channel {
                team_id,
                channel_id,
            }),
            _ => None,
        }
    }
}

pub struct NotificationDispatcher {
    executor: Arc<RequestExecutor>,
    graph_base_url: String,
    app_base_url: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(
        executor: Arc<RequestExecutor>,
        graph_base_url: impl Into<String>,
        app_base_url: Option<String>,
    ) -> Self {
        Self {
            executor,
            graph_base_url: graph_base_url.into().trim_end_matches('/').to_string(),
            app_base_url: app_base_url.map(|value| value.trim_end_matches('/').to_string()),
        }
    }

    pub async fn send_ticket_mail(&self, session: &GraphSession, mail: TicketMail) -> GatewayResult<()> {
        let subject = prefix_subject(mail.ticket_code.as_deref(), &mail.subject);
        let mut envelope = MailEnvelope::new(mail.to, subject, mail.html_body)
            .with_ticket_correlation(&mail.ticket_id);
        envelope.cc = mail.cc;
        envelope.attachments = mail.attachments;
        self.send_mail(session, envelope).await
    }

    pub async fn send_workspace_mail(
        &self,
        session: &GraphSession,
        mail: WorkspaceMail,
    ) -> GatewayResult<()> {
        let mut envelope = MailEnvelope::new(mail.to, mail.subject, mail.html_body);
        envelope.cc = mail.cc;
        envelope.attachments = mail.attachments;
        self.send_mail(session, envelope).await
    }

    /// Send as the configured sender. In delegated mode a denied send-as is
    /// retried once as the signed-in user.
    pub async fn send_mail(&self, session: &GraphSession, envelope: MailEnvelope) -> GatewayResult<()> {
        let sender = session.require_sender()?.map(str::to_string);
        let url = match session.mode {
            AuthMode::ServiceIdentity => format!(
                "{}/users/{}/sendMail",
                self.graph_base_url,
                urlencoding::encode(sender.as_deref().unwrap_or_default())
            ),
            AuthMode::Delegated => format!("{}/me/sendMail", self.graph_base_url),
        };
        let envelope = envelope.with_sender(sender);

        match self.post_mail(session, &url, &envelope).await {
            Ok(()) => Ok(()),
            Err(err)
                if session.mode == AuthMode::Delegated
                    && envelope.from.is_some()
                    && err.is_authorization_denied() =>
            {
                warn!(
                    "send-as denied tenant_id={}, retrying as the signed-in user: {}",
                    session.tenant_id, err
                );
                self.post_mail(session, &url, &envelope.without_sender_override())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn post_mail(
        &self,
        session: &GraphSession,
        url: &str,
        envelope: &MailEnvelope,
    ) -> GatewayResult<()> {
        let payload = envelope.to_send_mail_payload()?;
        self.executor
            .execute(GraphRequest::post(url, &session.access_token, payload).without_response_body())
            .await?;
        info!(
            "mail sent tenant_id={} recipients={}",
            session.tenant_id,
            envelope.to.len() + envelope.cc.len() + envelope.bcc.len()
        );
        Ok(())
    }

    /// Returns `false` when the tenant has no chat destination.
    pub async fn send_ticket_chat_card(
        &self,
        session: &GraphSession,
        destination: Option<&ChatDestination>,
        card: TicketCard,
    ) -> GatewayResult<bool> {
        let title = match card.ticket_code.as_deref() {
            Some(code) => prefix_subject(Some(code), &card.title),
            None => card.title,
        };
        let mut adaptive = AdaptiveCard::new(title, card.summary);
        for (name, value) in card.facts {
            adaptive = adaptive.with_fact(name, value);
        }
        if let Some(url) = self.ticket_url(&card.ticket_id) {
            adaptive = adaptive.with_action("Open ticket", url);
        }
        self.send_chat_card(session, destination, &adaptive).await
    }

    pub async fn send_workspace_chat_card(
        &self,
        session: &GraphSession,
        destination: Option<&ChatDestination>,
        card: &AdaptiveCard,
    ) -> GatewayResult<bool> {
        self.send_chat_card(session, destination, card).await
    }

    async fn send_chat_card(
        &self,
        session: &GraphSession,
        destination: Option<&ChatDestination>,
        card: &AdaptiveCard,
    ) -> GatewayResult<bool> {
        let Some(destination) = destination else {
            return Ok(false);
        };
        let url = match destination {
            ChatDestination::Chat(chat_id) => format!(
                "{}/chats/{}/messages",
                self.graph_base_url,
                urlencoding::encode(chat_id)
            ),
            ChatDestination::Channel {
                team_id,
                channel_id,
            } => format!(
                "{}/teams/{}/channels/{}/messages",
                self.graph_base_url,
                urlencoding::encode(team_id),
                urlencoding::encode(channel_id)
            ),
        };
        let attachment_id = Uuid::new_v4().simple().to_string();
        let payload = card.to_chat_message_payload(&attachment_id);
        self.executor
            .execute(GraphRequest::post(url, &session.access_token, payload).without_response_body())
            .await?;
        info!("chat card sent tenant_id={}", session.tenant_id);
        Ok(true)
    }

    pub fn ticket_url(&self, ticket_id: &str) -> Option<String> {
        self.app_base_url.as_ref().map(|base| {
            format!("{}/tickets/{}", base, urlencoding::encode(ticket_id.trim()))
        })
    }
}
