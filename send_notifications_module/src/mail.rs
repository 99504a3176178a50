use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::NotifyError;

/// Header carrying the local ticket id on outbound mail.
pub const TICKET_ID_HEADER: &str = "X-Ticket-Id";
/// Header carrying the conversation thread key on outbound mail.
pub const THREAD_KEY_HEADER: &str = "X-Ticket-Thread-Key";
pub const THREAD_KEY_PREFIX: &str = "ticket-thread-";

/// Thread key embedded in outbound mail so replies can be matched back to a ticket.
pub fn thread_key_for_ticket(ticket_id: &str) -> String {
    format!("{}{}", THREAD_KEY_PREFIX, ticket_id.trim())
}

/// Prefix a subject with `[CODE]` unless the code is already present.
pub fn prefix_subject(ticket_code: Option<&str>, subject: &str) -> String {
    let subject = subject.trim();
    match ticket_code.map(str::trim).filter(|code| !code.is_empty()) {
        Some(code) => {
            let tag = format!("[{}]", code);
            if subject.contains(&tag) {
                subject.to_string()
            } else if subject.is_empty() {
                tag
            } else {
                format!("{} {}", tag, subject)
            }
        }
        None => subject.to_string(),
    }
}

/// A file attached to an outbound mail as a Graph `fileAttachment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailAttachment {
    pub name: String,
    pub content_type: String,
    pub content_base64: String,
}

impl MailAttachment {
    pub fn from_bytes(name: impl Into<String>, content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            content_base64: BASE64_STANDARD.encode(bytes),
        }
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub fn from_path(path: &Path) -> Result<Self, NotifyError> {
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .ok_or_else(|| NotifyError::MissingFileName(path.display().to_string()))?
            .to_string();
        let bytes = std::fs::read(path)?;
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::from_bytes(name, content_type, &bytes))
    }

    fn to_json(&self) -> Value {
        json!({
            "@odata.type": "#microsoft.graph.fileAttachment",
            "name": self.name,
            "contentType": self.content_type,
            "contentBytes": self.content_base64,
        })
    }
}

/// Everything needed to build a Graph `sendMail` request body.
#[derive(Debug, Clone, Default)]
pub struct MailEnvelope {
    /// Send-as address; `None` sends as the authenticated identity.
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    pub html_body: String,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<MailAttachment>,
}

impl MailEnvelope {
    pub fn new(to: Vec<String>, subject: impl Into<String>, html_body: impl Into<String>) -> Self {
        Self {
            to,
            subject: subject.into(),
            html_body: html_body.into(),
            ..Default::default()
        }
    }

    /// Attach the ticket id and thread key headers used for inbound correlation.
    pub fn with_ticket_correlation(mut self, ticket_id: &str) -> Self {
        self.headers
            .push((TICKET_ID_HEADER.to_string(), ticket_id.trim().to_string()));
        self.headers.push((
            THREAD_KEY_HEADER.to_string(),
            thread_key_for_ticket(ticket_id),
        ));
        self
    }

    pub fn with_sender(mut self, sender: Option<String>) -> Self {
        self.from = sender
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }

    /// Copy of this envelope with the send-as fields removed.
    pub fn without_sender_override(&self) -> Self {
        Self {
            from: None,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.to.iter().all(|addr| addr.trim().is_empty()) {
            return Err(NotifyError::NoRecipients);
        }
        for address in self
            .to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .chain(self.reply_to.iter())
            .chain(self.from.iter())
        {
            if !looks_like_address(address) {
                return Err(NotifyError::InvalidAddress(address.clone()));
            }
        }
        for (name, _) in &self.headers {
            if !name.to_ascii_lowercase().starts_with("x-") {
                return Err(NotifyError::InvalidHeader(name.clone()));
            }
        }
        Ok(())
    }

    /// Build the JSON body for `POST .../sendMail`.
    pub fn to_send_mail_payload(&self) -> Result<Value, NotifyError> {
        self.validate()?;

        let mut message = json!({
            "subject": self.subject,
            "body": {
                "contentType": "HTML",
                "content": self.html_body,
            },
            "toRecipients": recipients(&self.to),
        });
        if !self.cc.is_empty() {
            message["ccRecipients"] = recipients(&self.cc);
        }
        if !self.bcc.is_empty() {
            message["bccRecipients"] = recipients(&self.bcc);
        }
        if !self.reply_to.is_empty() {
            message["replyTo"] = recipients(&self.reply_to);
        }
        if !self.headers.is_empty() {
            message["internetMessageHeaders"] = Value::Array(
                self.headers
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "value": value }))
                    .collect(),
            );
        }
        if !self.attachments.is_empty() {
            message["attachments"] =
                Value::Array(self.attachments.iter().map(MailAttachment::to_json).collect());
        }
        if let Some(from) = self.from.as_deref() {
            message["from"] = json!({ "emailAddress": { "address": from } });
            message["sender"] = json!({ "emailAddress": { "address": from } });
        }

        Ok(json!({
            "message": message,
            "saveToSentItems": true,
        }))
    }
}

fn recipients(addresses: &[String]) -> Value {
    Value::Array(
        addresses
            .iter()
            .map(|addr| addr.trim())
            .filter(|addr| !addr.is_empty())
            .map(|addr| json!({ "emailAddress": { "address": addr } }))
            .collect(),
    )
}

fn looks_like_address(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.contains(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn prefix_subject_adds_code_once() {
        assert_eq!(
            prefix_subject(Some("ENG-000042"), "Printer is down"),
            "[ENG-000042] Printer is down"
        );
        assert_eq!(
            prefix_subject(Some("ENG-000042"), "Re: [ENG-000042] Printer is down"),
            "Re: [ENG-000042] Printer is down"
        );
        assert_eq!(prefix_subject(None, "  Hello "), "Hello");
    }

    #[test]
    fn payload_carries_correlation_headers() {
        let envelope = MailEnvelope::new(
            vec!["user@example.com".to_string()],
            "[ENG-000042] Update",
            "<p>Hi</p>",
        )
        .with_ticket_correlation("5f1c");

        let payload = envelope.to_send_mail_payload().expect("payload");
        let headers = payload["message"]["internetMessageHeaders"]
            .as_array()
            .expect("headers");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0]["name"], TICKET_ID_HEADER);
        assert_eq!(headers[0]["value"], "5f1c");
        assert_eq!(headers[1]["value"], "ticket-thread-5f1c");
        assert_eq!(payload["saveToSentItems"], true);
        assert!(payload["message"].get("from").is_none());
    }

    #[test]
    fn sender_override_can_be_stripped() {
        let envelope = MailEnvelope::new(vec!["user@example.com".to_string()], "Hi", "<p>Hi</p>")
            .with_sender(Some("support@contoso.com".to_string()));
        let payload = envelope.to_send_mail_payload().expect("payload");
        assert_eq!(
            payload["message"]["from"]["emailAddress"]["address"],
            "support@contoso.com"
        );

        let stripped = envelope.without_sender_override();
        let payload = stripped.to_send_mail_payload().expect("payload");
        assert!(payload["message"].get("from").is_none());
        assert!(payload["message"].get("sender").is_none());
    }

    #[test]
    fn validate_rejects_bad_input() {
        let empty = MailEnvelope::new(Vec::new(), "Hi", "");
        assert!(matches!(empty.validate(), Err(NotifyError::NoRecipients)));

        let bad = MailEnvelope::new(vec!["not-an-address".to_string()], "Hi", "");
        assert!(matches!(bad.validate(), Err(NotifyError::InvalidAddress(_))));

        let mut header = MailEnvelope::new(vec!["a@example.com".to_string()], "Hi", "");
        header
            .headers
            .push(("Ticket".to_string(), "1".to_string()));
        assert!(matches!(header.validate(), Err(NotifyError::InvalidHeader(_))));
    }

    #[test]
    fn attachment_from_path_encodes_file() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("report.txt");
        std::fs::write(&path, "hello").expect("write");

        let attachment = MailAttachment::from_path(&path).expect("attachment");
        assert_eq!(attachment.name, "report.txt");
        assert_eq!(attachment.content_type, "text/plain");
        assert_eq!(attachment.content_base64, "aGVsbG8=");

        let mut envelope =
            MailEnvelope::new(vec!["a@example.com".to_string()], "Report", "<p>see</p>");
        envelope.attachments.push(attachment);
        let payload = envelope.to_send_mail_payload().expect("payload");
        assert_eq!(
            payload["message"]["attachments"][0]["@odata.type"],
            "#microsoft.graph.fileAttachment"
        );
    }
}
