use std::sync::Arc;

use thiserror::Error;

/// Result type used throughout the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the VWO SDK.
///
/// Evaluation APIs ([`VwoClient::get_flag`](crate::VwoClient::get_flag) and friends) never
/// return errors. Failures there are logged and a safe default is returned instead.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// `sdk_key` was empty.
    #[error("sdk_key is required to initialize the client")]
    MissingSdkKey,

    /// `account_id` was zero.
    #[error("account_id is required to initialize the client")]
    MissingAccountId,

    /// One of the init options has an unusable value.
    #[error("invalid option {option}: {reason}")]
    InvalidOption {
        /// Name of the offending option.
        option: &'static str,
        /// Human-readable description of the problem.
        reason: String,
    },

    /// Settings were parsed but failed validation.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Settings are not valid JSON or do not match the expected shape.
    #[error("error parsing settings")]
    SettingsParse(#[source] Arc<serde_json::Error>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server rejected the SDK key.
    #[error("client is not authorized. Check your sdk_key")]
    Unauthorized,

    /// Server responded with a non-success status code.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Storage connector failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Gateway service failure.
    #[error("gateway service error: {0}")]
    Gateway(String),

    /// Attributes passed to `set_attribute` were empty or of unsupported type.
    #[error("attributes must be a non-empty map of string, number or boolean values")]
    InvalidAttributes,

    /// User context has an empty id.
    #[error("user context must have a non-empty id")]
    InvalidContext,

    /// [`VwoClient::flush_events`](crate::VwoClient::flush_events) was called on a client
    /// created without [`BatchEventData`](crate::BatchEventData).
    #[error("event batching is not enabled")]
    BatchingNotEnabled,

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::SettingsParse(Arc::new(value))
    }
}
