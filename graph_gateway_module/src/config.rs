use std::env;
use std::time::Duration;

pub const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
pub const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
pub const DEFAULT_APP_SCOPE: &str = "https://graph.microsoft.com/.default";
pub const DEFAULT_CLIENT_STATE_PREFIX: &str = "graphmail";

/// Retry schedule for outbound Graph calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each retry.
    pub base_delay: Duration,
    /// Upper bound of random jitter added to each computed delay, as a fraction.
    pub jitter_ratio: f64,
    /// Longest server-directed (`Retry-After`) wait honoured.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(400),
            jitter_ratio: 0.2,
            max_retry_after: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Millisecond delays for tests.
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            jitter_ratio: 0.0,
            max_retry_after: Duration::from_secs(5),
        }
    }

    /// Computed backoff before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub graph_base_url: String,
    pub login_base_url: String,
    pub app_scope: String,
    /// Default for tenants without a `serviceIdentityEnabled` override.
    pub service_identity_enabled: bool,
    /// Default for tenants without a `serviceIdentityStrict` override.
    pub service_identity_strict: bool,
    pub default_sender_mailbox: Option<String>,
    pub webhook_url: Option<String>,
    pub app_base_url: Option<String>,
    pub retry: RetryPolicy,
    pub delta_page_limit: usize,
    pub delta_page_size: u32,
    pub tenant_concurrency: usize,
    pub renew_horizon_minutes: i64,
    pub client_state_prefix: String,
    pub request_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            graph_base_url: DEFAULT_GRAPH_BASE_URL.to_string(),
            login_base_url: DEFAULT_LOGIN_BASE_URL.to_string(),
            app_scope: DEFAULT_APP_SCOPE.to_string(),
            service_identity_enabled: false,
            service_identity_strict: false,
            default_sender_mailbox: None,
            webhook_url: None,
            app_base_url: None,
            retry: RetryPolicy::default(),
            delta_page_limit: 200,
            delta_page_size: 50,
            tenant_concurrency: 4,
            renew_horizon_minutes: 180,
            client_state_prefix: DEFAULT_CLIENT_STATE_PREFIX.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        let default_retry = RetryPolicy::default();

        Self {
            graph_base_url: env_var_non_empty("GRAPH_API_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.graph_base_url),
            login_base_url: env_var_non_empty("GRAPH_LOGIN_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.login_base_url),
            app_scope: env_var_non_empty("GRAPH_APP_SCOPE").unwrap_or(defaults.app_scope),
            service_identity_enabled: env_flag("GRAPH_APP_ONLY_ENABLED", false),
            service_identity_strict: env_flag("GRAPH_APP_ONLY_STRICT", false),
            default_sender_mailbox: env_var_non_empty("GRAPH_SENDER_MAILBOX"),
            webhook_url: env_var_non_empty("GRAPH_WEBHOOK_URL"),
            app_base_url: env_var_non_empty("APP_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            retry: RetryPolicy {
                max_attempts: env_parse("GRAPH_RETRY_MAX_ATTEMPTS")
                    .filter(|value: &u32| *value > 0)
                    .unwrap_or(default_retry.max_attempts),
                base_delay: env_parse("GRAPH_RETRY_BASE_DELAY_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(default_retry.base_delay),
                ..default_retry
            },
            delta_page_limit: env_parse("GRAPH_DELTA_PAGE_LIMIT")
                .filter(|value: &usize| *value > 0)
                .unwrap_or(defaults.delta_page_limit),
            delta_page_size: env_parse("GRAPH_DELTA_PAGE_SIZE")
                .filter(|value: &u32| *value > 0)
                .unwrap_or(defaults.delta_page_size),
            tenant_concurrency: env_parse("GRAPH_TENANT_CONCURRENCY")
                .filter(|value: &usize| *value > 0)
                .unwrap_or(defaults.tenant_concurrency),
            renew_horizon_minutes: env_parse("GRAPH_SUBSCRIPTION_RENEW_HORIZON_MINUTES")
                .unwrap_or(defaults.renew_horizon_minutes),
            client_state_prefix: env_var_non_empty("GRAPH_CLIENT_STATE_PREFIX")
                .unwrap_or(defaults.client_state_prefix),
            request_timeout: env_parse("GRAPH_REQUEST_TIMEOUT_SECS")
                .filter(|value: &u64| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
        }
    }
}

pub(crate) fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y"
        ),
        Err(_) => default,
    }
}

pub(crate) fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var_non_empty(key).and_then(|value| value.parse::<T>().ok())
}
