//! Operator-facing sender diagnostics.
//!
//! Every step becomes a named check; nothing here returns an error.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::GatewayError;
use crate::executor::GraphRequest;
use crate::gateway::GraphGateway;
use crate::health::breaker_error;
use crate::notify::WorkspaceMail;
use crate::session::GraphSession;
use crate::store::run_blocking;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightCheck {
    pub name: &'static str,
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub ok: bool,
    pub sender_email: Option<String>,
    pub checks: Vec<PreflightCheck>,
}

impl PreflightReport {
    fn pass(&mut self, name: &'static str, message: impl Into<String>) {
        self.checks.push(PreflightCheck {
            name,
            ok: true,
            message: message.into(),
        });
    }

    fn fail(&mut self, name: &'static str, message: impl Into<String>) {
        self.checks.push(PreflightCheck {
            name,
            ok: false,
            message: message.into(),
        });
    }

    fn finish(mut self) -> Self {
        self.ok = self.checks.iter().all(|check| check.ok);
        self
    }

    pub fn check(&self, name: &str) -> Option<&PreflightCheck> {
        self.checks.iter().find(|check| check.name == name)
    }
}

impl GraphGateway {
    /// Dry-run the path an outbound notification takes for `tenant_id`, with
    /// an optional live send to `test_recipient`.
    pub async fn run_sender_preflight(
        &self,
        tenant_id: &str,
        test_recipient: Option<&str>,
    ) -> PreflightReport {
        let mut report = PreflightReport::default();

        let store = self.store.clone();
        let tenant = tenant_id.to_string();
        let connection = match run_blocking(move || store.get_connection(&tenant)).await {
            Ok(Some(connection)) if connection.connected => connection,
            Ok(Some(_)) => {
                report.fail("connection", "Microsoft 365 is disconnected for this workspace");
                return report.finish();
            }
            Ok(None) => {
                report.fail("connection", "Microsoft 365 is not connected for this workspace");
                return report.finish();
            }
            Err(err) => {
                report.fail("connection", format!("could not load the connection: {}", err));
                return report.finish();
            }
        };
        report.pass(
            "connection",
            match connection.remote_tenant_id.as_deref() {
                Some(remote) => format!("connected to Microsoft 365 tenant {}", remote),
                None => "connected".to_string(),
            },
        );

        if let Some(err) = breaker_error(tenant_id, &connection.metadata, Utc::now()) {
            report.fail("circuit_breaker", err.to_string());
            return report.finish();
        }
        report.pass("circuit_breaker", "closed");

        let session = match self.sessions.resolve(&connection).await {
            Ok(session) => session,
            Err(err) => {
                report.fail("token", token_failure_message(&err));
                return report.finish();
            }
        };
        report.pass("token", format!("acquired ({})", session.mode.as_str()));
        report.sender_email = session.sender_mailbox.clone();

        if let Err(err) = session.require_sender() {
            report.fail("sender_mailbox", err.to_string());
            return report.finish();
        }
        report.pass(
            "sender_mailbox",
            match session.sender_mailbox.as_deref() {
                Some(sender) => format!("sending as {}", sender),
                None => "sending as the signed-in user".to_string(),
            },
        );

        match self.lookup_principal(&session).await {
            Ok(address) => {
                if report.sender_email.is_none() {
                    report.sender_email = address.clone();
                }
                report.pass(
                    "principal",
                    format!("resolved {}", address.as_deref().unwrap_or("mailbox owner")),
                );
            }
            Err(err) => {
                report.fail("principal", describe(&err, "look up the sender mailbox"));
                return report.finish();
            }
        }

        match self.read_inbox(&session).await {
            Ok(()) => report.pass("mailbox_read", "inbox is readable"),
            Err(err) => report.fail("mailbox_read", describe(&err, "read the inbox")),
        }

        let meta = &connection.metadata;
        match (meta.mail_subscription_id.as_deref(), meta.mail_subscription_expires_at) {
            (Some(_), Some(expires_at)) if expires_at > Utc::now() => report.pass(
                "subscription",
                format!("active until {}", expires_at.to_rfc3339()),
            ),
            (Some(_), Some(expires_at)) => report.fail(
                "subscription",
                format!("expired at {}; renewal has not run", expires_at.to_rfc3339()),
            ),
            _ => report.fail("subscription", "no inbox subscription; replies rely on scheduled sync"),
        }

        if let Some(recipient) = test_recipient.map(str::trim).filter(|value| !value.is_empty()) {
            let mail = WorkspaceMail {
                to: vec![recipient.to_string()],
                subject: "Microsoft 365 sender test".to_string(),
                html_body: "<p>This is a test message confirming outbound mail delivery.</p>"
                    .to_string(),
                ..Default::default()
            };
            match self.notifier.send_workspace_mail(&session, mail).await {
                Ok(()) => report.pass("test_send", format!("test message sent to {}", recipient)),
                Err(err) => report.fail("test_send", describe(&err, "send the test message")),
            }
        }

        let report = report.finish();
        info!("sender preflight tenant_id={} ok={}", tenant_id, report.ok);
        report
    }

    async fn lookup_principal(&self, session: &GraphSession) -> Result<Option<String>, GatewayError> {
        let url = format!(
            "{}/{}?$select=id,mail,userPrincipalName",
            self.config.graph_base_url.trim_end_matches('/'),
            session.mailbox_path()?
        );
        let body = self
            .executor
            .execute_json(GraphRequest::get(url, &session.access_token))
            .await?;
        Ok(["mail", "userPrincipalName"]
            .iter()
            .find_map(|key| body.get(*key).and_then(Value::as_str))
            .map(str::to_string))
    }

    async fn read_inbox(&self, session: &GraphSession) -> Result<(), GatewayError> {
        let url = format!(
            "{}/{}/mailFolders/inbox/messages?$top=1&$select=id",
            self.config.graph_base_url.trim_end_matches('/'),
            session.mailbox_path()?
        );
        self.executor
            .execute_json(GraphRequest::get(url, &session.access_token))
            .await?;
        Ok(())
    }
}

fn token_failure_message(err: &GatewayError) -> String {
    match err {
        GatewayError::Credential(_) => format!("{}; reconnect Microsoft 365", err),
        GatewayError::StrictAuthFailure { .. } => {
            format!("{}; check the app registration and admin consent", err)
        }
        _ => err.to_string(),
    }
}

fn describe(err: &GatewayError, action: &str) -> String {
    match err.status() {
        Some(404) => format!("could not {}: mailbox not found ({})", action, err),
        Some(401) | Some(403) => {
            format!("could not {}: missing Graph permission ({})", action, err)
        }
        _ => format!("could not {}: {}", action, err),
    }
}
