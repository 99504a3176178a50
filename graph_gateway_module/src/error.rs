//! Error taxonomy for the Microsoft Graph gateway.

use chrono::{DateTime, Utc};

use crate::store::StoreError;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failure reported by the delegated-token collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// The stored grant was revoked or expired; an administrator must sign in again.
    #[error("reconsent required: {0}")]
    ReconsentRequired(String),
    #[error("delegated token unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    /// The token endpoint rejected the client-credentials grant.
    #[error("token request rejected (status {status:?}): {code}: {description}")]
    UpstreamAuth {
        status: Option<u16>,
        code: String,
        description: String,
    },

    #[error("service-identity auth failed in strict mode (remote tenant {}): {source}", .remote_tenant_id.as_deref().unwrap_or("<none>"))]
    StrictAuthFailure {
        remote_tenant_id: Option<String>,
        #[source]
        source: Box<GatewayError>,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Non-retryable response from Graph (4xx other than 429).
    #[error("Graph request failed with status {status}: {}{message}", .code.as_deref().map(|c| format!("{}: ", c)).unwrap_or_default())]
    UpstreamRequest {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Every attempt got a 429 or 5xx. Surfaces as a bad-gateway condition.
    #[error("Graph request failed after {attempts} attempts (last status {last_status}): {message}")]
    RetriesExhausted {
        attempts: u32,
        last_status: u16,
        message: String,
    },

    #[error("invalid Graph response: {0}")]
    InvalidUpstreamResponse(String),

    #[error("Graph transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Microsoft Graph calls for tenant {tenant_id} are temporarily paused until {}: {reason}", .until.to_rfc3339())]
    CircuitOpen {
        tenant_id: String,
        until: DateTime<Utc>,
        reason: String,
    },

    #[error("tenant {0} has no Microsoft Graph connection")]
    NotConnected(String),

    #[error("delta sync stopped after {0} pages without reaching a delta link")]
    PageLimitExceeded(usize),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ticket store error: {0}")]
    TicketStore(String),

    #[error(transparent)]
    Notify(#[from] send_notifications_module::NotifyError),
}

impl GatewayError {
    /// HTTP status associated with the failure, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UpstreamRequest { status, .. } => Some(*status),
            Self::RetriesExhausted { last_status, .. } => Some(*last_status),
            Self::UpstreamAuth { status, .. } => *status,
            Self::StrictAuthFailure { source, .. } => source.status(),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Status a caller-facing API should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Configuration(_) | Self::Validation(_) => 400,
            Self::NotConnected(_) => 404,
            Self::CircuitOpen { .. } => 503,
            Self::RetriesExhausted { .. }
            | Self::InvalidUpstreamResponse(_)
            | Self::Transport(_)
            | Self::PageLimitExceeded(_) => 502,
            Self::UpstreamAuth { .. } | Self::StrictAuthFailure { .. } | Self::Credential(_) => 401,
            Self::UpstreamRequest { status, .. } => *status,
            _ => 500,
        }
    }

    pub fn is_throttle(&self) -> bool {
        if self.status() == Some(429) {
            return true;
        }
        let message = self.to_string().to_ascii_lowercase();
        message.contains("throttl") || message.contains("too many requests")
    }

    /// 401/403 from Graph, or an access-denied error code.
    pub fn is_authorization_denied(&self) -> bool {
        match self {
            Self::UpstreamRequest { status, code, .. } => {
                matches!(status, 401 | 403)
                    || code
                        .as_deref()
                        .map(|c| c.eq_ignore_ascii_case("ErrorAccessDenied"))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }
}
