//! Retrying wrapper around every Microsoft Graph call.
//!
//! Only HTTP outcomes are classified here: 429 and 5xx are retried with
//! exponential backoff (or a server-directed `Retry-After` wait), everything
//! else surfaces immediately as a typed [`GatewayError`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::RETRY_AFTER;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{GatewayError, GatewayResult};

/// One outbound Graph request.
#[derive(Debug, Clone)]
pub struct GraphRequest {
    pub method: Method,
    pub url: String,
    pub bearer_token: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Whether a JSON payload is required in the success response.
    pub expect_json: bool,
}

impl GraphRequest {
    pub fn new(method: Method, url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer_token: bearer_token.into(),
            body: None,
            headers: Vec::new(),
            expect_json: true,
        }
    }

    pub fn get(url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self::new(Method::GET, url, bearer_token)
    }

    pub fn post(url: impl Into<String>, bearer_token: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, url, bearer_token).with_body(body)
    }

    pub fn patch(url: impl Into<String>, bearer_token: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, url, bearer_token).with_body(body)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Accept an empty success body (e.g. `sendMail` answers 202 with nothing).
    pub fn without_response_body(mut self) -> Self {
        self.expect_json = false;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ODataErrorEnvelope {
    error: ODataError,
}

#[derive(Debug, Deserialize)]
struct ODataError {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestExecutor {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RequestExecutor {
    pub fn new(client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the request and require a JSON payload back.
    pub async fn execute_json(&self, request: GraphRequest) -> GatewayResult<Value> {
        let url = request.url.clone();
        self.execute(GraphRequest {
            expect_json: true,
            ..request
        })
        .await?
        .ok_or_else(|| {
            GatewayError::InvalidUpstreamResponse(format!("no response body from {}", url))
        })
    }

    /// Run the request with retries. `Ok(None)` means success without a payload.
    pub async fn execute(&self, request: GraphRequest) -> GatewayResult<Option<Value>> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut retry_after_honoured = false;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .bearer_auth(&request.bearer_token);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            if status.is_success() {
                let body = response.text().await?;
                return parse_success_body(status.as_u16(), &body, request.expect_json);
            }

            let status = status.as_u16();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| parse_retry_after(value, Utc::now()));
            let body = response.text().await.unwrap_or_default();
            let (code, message) = parse_error_body(status, &body);

            if !GatewayError::is_retryable_status(status) {
                debug!(
                    "graph request {} {} failed status={} code={:?}",
                    request.method,
                    redact_url(&request.url),
                    status,
                    code
                );
                return Err(GatewayError::UpstreamRequest {
                    status,
                    code,
                    message,
                });
            }

            if attempt >= max_attempts {
                warn!(
                    "graph request {} {} exhausted {} attempts last_status={}",
                    request.method,
                    redact_url(&request.url),
                    attempt,
                    status
                );
                return Err(GatewayError::RetriesExhausted {
                    attempts: attempt,
                    last_status: status,
                    message,
                });
            }

            let delay = match retry_after {
                Some(wait) if !retry_after_honoured => {
                    retry_after_honoured = true;
                    wait.min(self.policy.max_retry_after)
                }
                _ => self.jittered(self.policy.backoff_delay(attempt)),
            };
            warn!(
                "graph request {} {} got status={}, retry {}/{} after {:?}",
                request.method,
                redact_url(&request.url),
                status,
                attempt,
                max_attempts - 1,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.policy.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.policy.jitter_ratio);
        delay.mul_f64(1.0 + factor)
    }
}

fn parse_success_body(status: u16, body: &str, expect_json: bool) -> GatewayResult<Option<Value>> {
    if body.trim().is_empty() {
        if !expect_json || matches!(status, 202 | 204) {
            return Ok(None);
        }
        return Err(GatewayError::InvalidUpstreamResponse(format!(
            "empty body with status {}",
            status
        )));
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => Ok(Some(value)),
        Err(_) if !expect_json => Ok(None),
        Err(err) => Err(GatewayError::InvalidUpstreamResponse(format!(
            "non-JSON body with status {}: {}",
            status, err
        ))),
    }
}

fn parse_error_body(status: u16, body: &str) -> (Option<String>, String) {
    if let Ok(envelope) = serde_json::from_str::<ODataErrorEnvelope>(body) {
        let message = envelope
            .error
            .message
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| format!("HTTP {}", status));
        return (envelope.error.code, message);
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        (None, format!("HTTP {}", status))
    } else {
        (None, trimmed.chars().take(500).collect())
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Strip the query string, which can carry delta tokens.
fn redact_url(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
