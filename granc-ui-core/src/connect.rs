//! # Connection Helpers
//!
//! Builds a configured `Endpoint` and dials it, optionally retrying with exponential backoff
//! following the [gRPC connection backoff specification](https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md).
use std::time::Duration;
use tonic::transport::{Channel, Endpoint, Uri};

/// Default configuration values based on the gRPC connection backoff spec.
pub mod defaults {
    use std::time::Duration;

    /// Initial delay before the first retry.
    pub const BASE_DELAY: Duration = Duration::from_secs(1);

    /// Multiplier for exponential backoff.
    pub const MULTIPLIER: f64 = 1.6;

    /// Jitter factor (0.2 means +/- 20%).
    pub const JITTER: f64 = 0.2;

    /// Maximum delay between retries.
    pub const MAX_DELAY: Duration = Duration::from_secs(120);

    /// Maximum number of retry attempts.
    pub const MAX_RETRIES: u32 = 3;

    /// Dial timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

/// Errors that can occur when connecting to a gRPC server.
#[derive(Debug, thiserror::Error)]
pub enum ClientConnectError {
    #[error("Invalid URL '{0}': {1}")]
    InvalidUrl(String, #[source] tonic::transport::Error),
    #[error("Invalid authority '{0}': {1}")]
    InvalidAuthority(String, #[source] http::uri::InvalidUri),
    #[error("Failed to connect to '{0}': {1}")]
    ConnectionFailed(String, #[source] tonic::transport::Error),
}

/// Configuration for retrying a failed dial.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Initial delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier for exponential backoff. Should be >= 1.0.
    pub multiplier: f64,
    /// Jitter factor for randomizing delays, between 0.0 and 1.0.
    pub jitter: f64,
    /// The delay never exceeds this value.
    pub max_delay: Duration,
    /// Maximum number of retry attempts, not counting the first dial.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: defaults::BASE_DELAY,
            multiplier: defaults::MULTIPLIER,
            jitter: defaults::JITTER,
            max_delay: defaults::MAX_DELAY,
            max_retries: defaults::MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Values below 1.0 are raised to 1.0.
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(self.clone())
    }
}

/// Yields `base * multiplier^attempt` delays with +/- jitter, capped at `max_delay`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    /// Current delay without jitter.
    current_delay_secs: f64,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        let current_delay_secs = policy.base_delay.as_secs_f64();
        Self {
            policy,
            current_delay_secs,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.policy.max_retries
    }

    /// The delay before the next attempt. Advances the internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay_secs;

        let jittered = if self.policy.jitter > 0.0 {
            let random_factor =
                rand::random::<f64>() * self.policy.jitter * 2.0 - self.policy.jitter;
            delay * (1.0 + random_factor)
        } else {
            delay
        };

        let max_delay = self.policy.max_delay.as_secs_f64();
        let clamped = jittered.min(max_delay);

        self.current_delay_secs = (self.current_delay_secs * self.policy.multiplier).min(max_delay);
        self.attempts += 1;

        Duration::from_secs_f64(clamped.max(0.0))
    }
}

/// Dial settings applied to the endpoint.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub connect_timeout: Option<Duration>,
    /// HTTP/2 keepalive interval; also used as the keepalive timeout.
    pub keepalive: Option<Duration>,
    /// Overrides the `:authority` of every request.
    pub authority: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(defaults::CONNECT_TIMEOUT),
            keepalive: None,
            authority: None,
        }
    }
}

/// Prefixes a bare `host:port` with `http://`.
pub fn target_uri(target: &str) -> String {
    if target.contains("://") {
        target.to_string()
    } else {
        format!("http://{target}")
    }
}

/// Builds an endpoint for `target` with `options` applied.
pub fn endpoint(target: &str, options: &ConnectOptions) -> Result<Endpoint, ClientConnectError> {
    let uri = target_uri(target);
    let mut endpoint =
        Endpoint::from_shared(uri.clone()).map_err(|e| ClientConnectError::InvalidUrl(uri, e))?;

    if let Some(timeout) = options.connect_timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    if let Some(keepalive) = options.keepalive {
        endpoint = endpoint
            .http2_keep_alive_interval(keepalive)
            .keep_alive_timeout(keepalive);
    }

    if let Some(authority) = &options.authority {
        let scheme = endpoint.uri().scheme_str().unwrap_or("http");
        let origin: Uri = format!("{scheme}://{authority}")
            .parse()
            .map_err(|e| ClientConnectError::InvalidAuthority(authority.clone(), e))?;
        endpoint = endpoint.origin(origin);
    }

    Ok(endpoint)
}

/// Dials `endpoint`. Unless `fail_fast` is set, failures are retried according to `policy`
/// and the last error is returned once retries are exhausted.
pub async fn connect(
    endpoint: &Endpoint,
    fail_fast: bool,
    policy: &RetryPolicy,
) -> Result<Channel, ClientConnectError> {
    let target = endpoint.uri().to_string();
    let mut backoff = policy.backoff();

    loop {
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(err) if !fail_fast && backoff.can_retry() => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    uri = %target,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "failed to connect, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(ClientConnectError::ConnectionFailed(target, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_clamps_without_jitter() {
        let policy = RetryPolicy::new()
            .jitter(0.0)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(2));
        let mut backoff = policy.backoff();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs_f64(1.6));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.attempts(), 3);
        assert!(!backoff.can_retry());
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..20 {
            let delay = RetryPolicy::new().backoff().next_delay().as_secs_f64();
            assert!((0.8..=1.2).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_target_uri_adds_scheme() {
        assert_eq!(target_uri("localhost:50051"), "http://localhost:50051");
        assert_eq!(target_uri("https://example.com"), "https://example.com");
    }

    #[test]
    fn test_authority_override_keeps_the_dial_target() {
        let options = ConnectOptions {
            authority: Some("api.internal".to_string()),
            ..Default::default()
        };

        let endpoint = endpoint("127.0.0.1:50051", &options).unwrap();

        assert_eq!(endpoint.uri().to_string(), "http://127.0.0.1:50051/");
    }

    #[test]
    fn test_endpoint_rejects_invalid_authority() {
        let options = ConnectOptions {
            authority: Some("bad authority".to_string()),
            ..Default::default()
        };

        let result = endpoint("127.0.0.1:50051", &options);

        assert!(matches!(
            result,
            Err(ClientConnectError::InvalidAuthority(authority, _)) if authority == "bad authority"
        ));
    }

    #[test]
    fn test_endpoint_rejects_invalid_url() {
        let result = endpoint("http://bad host", &ConnectOptions::default());
        assert!(matches!(result, Err(ClientConnectError::InvalidUrl(..))));
    }
}
