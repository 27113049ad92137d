//! Blocking HTTP transport with retry and exponential backoff.
use std::time::Duration;

use reqwest::{blocking::RequestBuilder, StatusCode, Url};

use crate::{Error, Result};

/// Retry policy for outbound requests.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Whether failed requests should be retried at all.
    pub should_retry: bool,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Each subsequent delay is multiplied by this factor.
    pub backoff_multiplier: u32,
}

impl RetryConfig {
    /// Default value for [`RetryConfig::max_retries`].
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    /// Default value for [`RetryConfig::initial_delay`].
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);
    /// Default value for [`RetryConfig::backoff_multiplier`].
    pub const DEFAULT_BACKOFF_MULTIPLIER: u32 = 2;

    /// Create a new `RetryConfig` using default configuration.
    pub fn new() -> RetryConfig {
        RetryConfig::default()
    }

    /// Disable retries.
    pub fn disabled() -> RetryConfig {
        RetryConfig {
            should_retry: false,
            ..RetryConfig::default()
        }
    }

    /// Update the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> RetryConfig {
        self.max_retries = max_retries;
        self
    }

    /// Update the delay before the first retry.
    pub fn with_initial_delay(mut self, initial_delay: Duration) -> RetryConfig {
        self.initial_delay = initial_delay;
        self
    }

    /// Update the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, backoff_multiplier: u32) -> RetryConfig {
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    /// Delay before retry number `attempt` (1-based): `initial_delay * multiplier^(attempt - 1)`.
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            should_retry: true,
            max_retries: RetryConfig::DEFAULT_MAX_RETRIES,
            initial_delay: RetryConfig::DEFAULT_INITIAL_DELAY,
            backoff_multiplier: RetryConfig::DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// Timeout applied to every outbound request.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Blocking HTTP client shared by the settings fetcher, gateway and event senders.
#[derive(Clone)]
pub(crate) struct NetworkClient {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    retry: RetryConfig,
}

impl NetworkClient {
    pub(crate) fn new(retry: RetryConfig) -> Result<NetworkClient> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(NetworkClient { client, retry })
    }

    /// GET `url` and return the body. Only `200 OK` is accepted.
    pub(crate) fn get_text(&self, url: Url) -> Result<String> {
        let response = self.send_with_retry(|| self.client.get(url.clone()), true)?;
        if response.status() != StatusCode::OK {
            return Err(Error::UnexpectedStatus(response.status().as_u16()));
        }
        Ok(response.text()?)
    }

    /// POST a JSON body. Set `retry` to `false` for fire-once endpoints.
    pub(crate) fn post_json(
        &self,
        url: Url,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
        retry: bool,
    ) -> Result<()> {
        self.send_with_retry(
            || {
                let mut request = self.client.post(url.clone()).json(body);
                for (name, value) in headers {
                    request = request.header(*name, *value);
                }
                request
            },
            retry,
        )?;
        Ok(())
    }

    fn send_with_retry(
        &self,
        build_request: impl Fn() -> RequestBuilder,
        retry: bool,
    ) -> Result<reqwest::blocking::Response> {
        let max_retries = if retry && self.retry.should_retry {
            self.retry.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let error = match build_request().send() {
                Ok(response) if response.status().is_success() => {
                    if attempt > 0 {
                        log::debug!(target: "vwo", attempt; "request succeeded after retries");
                    }
                    return Ok(response);
                }
                Ok(response) if response.status().is_client_error() => {
                    // Client errors will not go away on retry.
                    log::warn!(target: "vwo", status = response.status().as_u16(); "request rejected");
                    return Err(Error::UnexpectedStatus(response.status().as_u16()));
                }
                Ok(response) => Error::UnexpectedStatus(response.status().as_u16()),
                Err(err) => Error::from(err),
            };

            if attempt >= max_retries {
                log::warn!(target: "vwo", attempt; "request failed: {error:?}");
                return Err(error);
            }

            attempt += 1;
            let delay = self.retry.delay(attempt);
            log::debug!(target: "vwo", attempt, delay:? = delay; "retrying request: {error:?}");
            std::thread::sleep(delay);
        }
    }
}
