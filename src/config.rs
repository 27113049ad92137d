use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;

use crate::client::{ClientParts, VwoClient};
use crate::events::{BatchEventData, HttpEventTransport};
use crate::gateway::{GatewayService, HttpGatewayService};
use crate::integrations::{IntegrationCallback, NoopIntegrationCallback};
use crate::network::{NetworkClient, RetryConfig};
use crate::poller::PollerThreadConfig;
use crate::settings_fetcher::{SettingsFetcher, SettingsFetcherConfig, DEFAULT_BASE_URL};
use crate::settings_store::SettingsStore;
use crate::storage::Storage;
use crate::{Error, Result};

/// Configuration for [`VwoClient`].
///
/// ```no_run
/// # use std::time::Duration;
/// # use vwo_fme::{ClientConfig, InMemoryStorage};
/// let client = ClientConfig::new("sdk-key", 123456)
///     .storage(InMemoryStorage::new())
///     .poll_interval(Duration::from_secs(60))
///     .init()?;
/// # Ok::<(), vwo_fme::Error>(())
/// ```
pub struct ClientConfig {
    pub(crate) sdk_key: String,
    pub(crate) account_id: i64,
    pub(crate) storage: Option<Arc<dyn Storage + Send + Sync>>,
    pub(crate) gateway_service: Option<Arc<dyn GatewayService + Send + Sync>>,
    pub(crate) gateway_service_url: Option<String>,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) poll_jitter: Duration,
    pub(crate) integrations: Box<dyn IntegrationCallback + Send + Sync>,
    pub(crate) settings: Option<String>,
    pub(crate) retry_config: RetryConfig,
    pub(crate) batch_event_data: Option<BatchEventData>,
    pub(crate) is_usage_stats_disabled: bool,
    pub(crate) is_aliasing_enabled: bool,
    pub(crate) base_url: Option<String>,
}

impl ClientConfig {
    /// Default base URL for settings and event requests.
    pub const DEFAULT_BASE_URL: &'static str = DEFAULT_BASE_URL;

    /// Create a default configuration for the given SDK key and account.
    ///
    /// ```
    /// # use vwo_fme::ClientConfig;
    /// ClientConfig::new("sdk-key", 123456);
    /// ```
    pub fn new(sdk_key: impl Into<String>, account_id: i64) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            account_id,
            storage: None,
            gateway_service: None,
            gateway_service_url: None,
            poll_interval: None,
            poll_jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
            integrations: Box::new(NoopIntegrationCallback),
            settings: None,
            retry_config: RetryConfig::default(),
            batch_event_data: None,
            is_usage_stats_disabled: false,
            is_aliasing_enabled: false,
            base_url: None,
        }
    }

    /// Persist decisions so users keep their variation across calls and processes.
    pub fn storage(mut self, storage: impl Storage + Send + Sync + 'static) -> Self {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Use a custom gateway service for location, user-agent and list segments.
    pub fn gateway_service(
        mut self,
        gateway_service: impl GatewayService + Send + Sync + 'static,
    ) -> Self {
        self.gateway_service = Some(Arc::new(gateway_service));
        self
    }

    /// Use a self-hosted VWO gateway at `url`. Settings and events are routed through it unless
    /// [`ClientConfig::base_url`] is set.
    pub fn gateway_service_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_service_url = Some(url.into());
        self
    }

    /// How often to refresh settings. Values below one second are ignored.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set both the poll interval and its jitter.
    pub fn poller_config(mut self, config: PollerThreadConfig) -> Self {
        self.poll_interval = Some(config.interval);
        self.poll_jitter = config.jitter;
        self
    }

    /// Receive every flag decision and tracked event.
    ///
    /// The callback runs synchronously inside [`VwoClient::get_flag`] and
    /// [`VwoClient::track_event`], so it should not block.
    pub fn integrations(
        mut self,
        integrations: impl IntegrationCallback + Send + Sync + 'static,
    ) -> Self {
        self.integrations = Box::new(integrations);
        self
    }

    /// Start from this settings document instead of fetching one.
    pub fn settings(mut self, settings: impl Into<String>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    /// Retry policy for network requests.
    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Queue events and send them in batches.
    pub fn batch_event_data(mut self, batch_event_data: BatchEventData) -> Self {
        self.batch_event_data = Some(batch_event_data);
        self
    }

    /// Opt out of usage statistics. This SDK does not report any, so the flag is only recorded.
    pub fn is_usage_stats_disabled(mut self, disabled: bool) -> Self {
        self.is_usage_stats_disabled = disabled;
        self
    }

    /// Resolve user aliases through the gateway service.
    pub fn is_aliasing_enabled(mut self, enabled: bool) -> Self {
        self.is_aliasing_enabled = enabled;
        self
    }

    /// Override base URL for settings and event requests. Clients should use the default setting
    /// in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.sdk_key.trim().is_empty() {
            return Err(Error::MissingSdkKey);
        }
        if self.account_id == 0 {
            return Err(Error::MissingAccountId);
        }
        if self.account_id < 0 {
            return Err(Error::InvalidOption {
                option: "account_id",
                reason: "must be a positive number".to_owned(),
            });
        }
        for (option, url) in [
            ("gateway_service_url", &self.gateway_service_url),
            ("base_url", &self.base_url),
        ] {
            if let Some(url) = url {
                Url::parse(url).map_err(|err| Error::InvalidOption {
                    option,
                    reason: err.to_string(),
                })?;
            }
        }
        Ok(())
    }

    /// Create a new [`VwoClient`]: load settings, start the settings poller and the event
    /// sender.
    ///
    /// Settings problems do not fail initialization. The client is created "not valid" and
    /// returns safe defaults until valid settings arrive.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingSdkKey`], [`Error::MissingAccountId`], [`Error::InvalidOption`] for a bad
    ///   configuration.
    /// - [`Error::Io`] if a background thread could not be started.
    pub fn init(self) -> Result<VwoClient> {
        self.validate()?;

        let network = NetworkClient::new(self.retry_config.clone())?;
        let base_url = self
            .base_url
            .clone()
            .or_else(|| self.gateway_service_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());

        let gateway = match (&self.gateway_service, &self.gateway_service_url) {
            (Some(gateway), _) => Some(Arc::clone(gateway)),
            (None, Some(url)) => Some(Arc::new(HttpGatewayService::new(
                url.clone(),
                self.account_id,
                self.sdk_key.clone(),
                network.clone(),
            )) as Arc<dyn GatewayService + Send + Sync>),
            (None, None) => None,
        };

        let store = Arc::new(SettingsStore::new());
        let fetcher = Arc::new(SettingsFetcher::new(
            network.clone(),
            SettingsFetcherConfig {
                base_url: base_url.clone(),
                account_id: self.account_id,
                sdk_key: self.sdk_key.clone(),
            },
        ));
        let transport = Arc::new(HttpEventTransport::new(
            network,
            base_url,
            self.account_id,
            self.sdk_key.clone(),
            store.clone(),
        ));

        VwoClient::start(
            self,
            ClientParts {
                store,
                fetcher,
                transport,
                gateway,
            },
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdk_key_is_required() {
        assert!(matches!(
            ClientConfig::new("  ", 1).init(),
            Err(Error::MissingSdkKey)
        ));
    }

    #[test]
    fn account_id_is_required() {
        assert!(matches!(
            ClientConfig::new("sdk-key", 0).init(),
            Err(Error::MissingAccountId)
        ));
        assert!(matches!(
            ClientConfig::new("sdk-key", -5).init(),
            Err(Error::InvalidOption {
                option: "account_id",
                ..
            })
        ));
    }

    #[test]
    fn gateway_url_must_parse() {
        assert!(matches!(
            ClientConfig::new("sdk-key", 1)
                .gateway_service_url("localhost without scheme")
                .init(),
            Err(Error::InvalidOption {
                option: "gateway_service_url",
                ..
            })
        ));
    }

    #[test]
    fn poller_config_sets_interval_and_jitter() {
        let config = ClientConfig::new("sdk-key", 1).poller_config(
            PollerThreadConfig::new()
                .with_interval(Duration::from_secs(5))
                .with_jitter(Duration::from_secs(1)),
        );
        assert_eq!(config.poll_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.poll_jitter, Duration::from_secs(1));
    }
}
