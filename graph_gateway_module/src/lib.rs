pub mod comment_text;
pub mod config;
pub mod correlation;
pub mod credentials;
pub mod delta_sync;
pub mod error;
pub mod executor;
pub mod health;
pub mod metadata;
pub mod notify;
pub mod session;
pub mod store;
pub mod subscription;
pub mod ticket_api;
pub mod token;
pub mod webhook;

mod gateway;
mod preflight;

pub use config::{GatewayConfig, RetryPolicy};
pub use error::{CredentialError, GatewayError, GatewayResult};
pub use gateway::{GatewayDeps, GraphGateway, RenewalSummary, SyncAllSummary, TenantLocks};
pub use preflight::{PreflightCheck, PreflightReport};
pub use store::{
    AppCredentials, ConnectionStore, CredentialStore, DedupStore, OrganizationSettings,
    SqliteConnectionStore, SqliteDedupStore, StoreError, TenantConnection, Ticket, TicketComment,
    TicketStore,
};
pub use token::{AuthMode, AuthPolicy, TokenCache};
