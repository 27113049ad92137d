//! An HTTP client that fetches settings from the server.
use std::sync::atomic::{AtomicBool, Ordering};

use rand::{thread_rng, Rng};
use reqwest::Url;

use crate::network::NetworkClient;
use crate::settings::Settings;
use crate::{Error, Result};

pub(crate) const DEFAULT_BASE_URL: &str = "https://dev.visualwebsiteoptimizer.com";

const SETTINGS_ENDPOINT: &str = "/server-side/v2-settings";
const WEBHOOK_SETTINGS_ENDPOINT: &str = "/server-side/v2-pull";

/// Something settings can be fetched from.
pub(crate) trait FetchSettings: Send + Sync {
    /// Fetch, parse and validate the latest settings. `via_webhook` selects the endpoint that
    /// bypasses the settings cache.
    fn fetch_settings(&self, via_webhook: bool) -> Result<Settings>;
}

pub(crate) struct SettingsFetcherConfig {
    pub base_url: String,
    pub account_id: i64,
    pub sdk_key: String,
}

/// A client that fetches VWO settings from the server.
pub(crate) struct SettingsFetcher {
    network: NetworkClient,
    config: SettingsFetcherConfig,
    /// If we receive a 401 Unauthorized error during a request, it means the SDK key is not
    /// valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl SettingsFetcher {
    pub(crate) fn new(network: NetworkClient, config: SettingsFetcherConfig) -> SettingsFetcher {
        SettingsFetcher {
            network,
            config,
            unauthorized: AtomicBool::new(false),
        }
    }

    fn url(&self, via_webhook: bool) -> Result<Url> {
        let endpoint = if via_webhook {
            WEBHOOK_SETTINGS_ENDPOINT
        } else {
            SETTINGS_ENDPOINT
        };
        let random = format!("{:.16}", thread_rng().gen::<f64>());
        let account_id = self.config.account_id.to_string();
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint),
            &[
                ("i", &*self.config.sdk_key),
                ("r", &*random),
                ("a", &*account_id),
            ],
        )
        .map_err(Error::InvalidBaseUrl)
    }
}

impl FetchSettings for SettingsFetcher {
    fn fetch_settings(&self, via_webhook: bool) -> Result<Settings> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let url = self.url(via_webhook)?;

        log::debug!(target: "vwo", via_webhook; "fetching settings");
        let body = self.network.get_text(url).map_err(|err| match err {
            Error::UnexpectedStatus(401) => {
                log::warn!(target: "vwo", "client is not authorized. Check your sdk_key");
                self.unauthorized.store(true, Ordering::Relaxed);
                Error::Unauthorized
            }
            err => {
                log::warn!(target: "vwo", "failed to fetch settings: {err:?}");
                err
            }
        })?;

        let settings = Settings::from_json(body.as_bytes())?;

        log::debug!(target: "vwo", "successfully fetched settings");

        Ok(settings)
    }
}
