//! Outbound notification payloads for Microsoft Graph.
//!
//! Builds `sendMail` request bodies (with ticket correlation headers and file
//! attachments) and adaptive-card chat messages. Nothing in this crate talks
//! to the network; the gateway sends what is composed here.

mod card;
mod mail;

pub use card::{AdaptiveCard, CardAction, ADAPTIVE_CARD_CONTENT_TYPE};
pub use mail::{
    prefix_subject, thread_key_for_ticket, MailAttachment, MailEnvelope, THREAD_KEY_HEADER,
    THREAD_KEY_PREFIX, TICKET_ID_HEADER,
};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("mail has no recipients")]
    NoRecipients,
    #[error("invalid email address: {0}")]
    InvalidAddress(String),
    #[error("invalid header {0}: custom headers must start with X-")]
    InvalidHeader(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("attachment has no file name: {0}")]
    MissingFileName(String),
}
