use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;

use crate::context::{AttributeValue, Attributes, UserContext};
use crate::events::{EventBuilder, EventSink, EventTransport};
use crate::gateway::GatewayService;
use crate::get_flag::{self, DecisionContext, GetFlag};
use crate::integrations::{Decision, IntegrationCallback};
use crate::poller::{self, PollerThread, PollerThreadConfig};
use crate::settings::Settings;
use crate::settings_fetcher::FetchSettings;
use crate::settings_store::SettingsStore;
use crate::storage::StorageFacade;
use crate::{ClientConfig, Error, Result};

/// Collaborators built by [`ClientConfig::init`].
pub(crate) struct ClientParts {
    pub store: Arc<SettingsStore>,
    pub fetcher: Arc<dyn FetchSettings>,
    pub transport: Arc<dyn EventTransport>,
    pub gateway: Option<Arc<dyn GatewayService + Send + Sync>>,
}

/// A client for VWO Feature Management and Experimentation.
///
/// In order to create a client instance, first create [`ClientConfig`]. The client is `Sync` and
/// can be shared between threads.
///
/// # Examples
/// ```no_run
/// # use vwo_fme::{ClientConfig, UserContext};
/// let client = ClientConfig::new("sdk-key", 123456).init()?;
///
/// let flag = client.get_flag("new_checkout", &UserContext::new("user-1"));
/// if flag.is_enabled() {
///     let color = flag.get_variable("color", "blue");
/// }
/// # Ok::<(), vwo_fme::Error>(())
/// ```
pub struct VwoClient {
    store: Arc<SettingsStore>,
    fetcher: Arc<dyn FetchSettings>,
    storage: StorageFacade,
    gateway: Option<Arc<dyn GatewayService + Send + Sync>>,
    integrations: Box<dyn IntegrationCallback + Send + Sync>,
    event_builder: EventBuilder,
    events: EventSink,
    poller: Mutex<Option<PollerThread>>,
}

impl VwoClient {
    pub(crate) fn start(
        mut config: ClientConfig,
        parts: ClientParts,
        start_poller: bool,
    ) -> Result<VwoClient> {
        let ClientParts {
            store,
            fetcher,
            transport,
            gateway,
        } = parts;

        let initial = match config.settings.take() {
            Some(json) => Settings::from_json(json.as_bytes()),
            None => fetcher.fetch_settings(false),
        };
        match initial {
            Ok(settings) => {
                store.set_settings(settings);
            }
            Err(err) => {
                log::warn!(target: "vwo",
                           account_id = config.account_id;
                           "settings are not valid, all flags will be disabled: {err}");
                store.set_invalid(err.to_string());
            }
        }

        let batch_event_data = match (config.batch_event_data.take(), &gateway) {
            (Some(_), Some(_)) => {
                log::warn!(target: "vwo", "event batching is not supported with a gateway service, sending events directly");
                None
            }
            (batch_event_data, _) => batch_event_data,
        };
        let events = EventSink::start(batch_event_data, transport)?;

        if config.is_aliasing_enabled && gateway.is_none() {
            log::warn!(target: "vwo", "aliasing requires a gateway service and is ignored");
        }

        let poller = if start_poller {
            let interval =
                poller::effective_interval(config.poll_interval, store.get_settings().as_deref());
            Some(PollerThread::start(
                fetcher.clone(),
                store.clone(),
                PollerThreadConfig::new()
                    .with_interval(interval)
                    .with_jitter(config.poll_jitter),
            )?)
        } else {
            None
        };

        log::info!(target: "vwo",
                   account_id = config.account_id,
                   is_usage_stats_disabled = config.is_usage_stats_disabled,
                   is_aliasing_enabled = config.is_aliasing_enabled,
                   is_valid = store.invalid_reason().is_none();
                   "client initialized");

        Ok(VwoClient {
            store,
            fetcher,
            storage: StorageFacade::new(config.storage),
            gateway,
            integrations: config.integrations,
            event_builder: EventBuilder::new(config.account_id, config.sdk_key),
            events,
            poller: Mutex::new(poller),
        })
    }

    #[cfg(test)]
    pub(crate) fn new_with_transport(
        config: ClientConfig,
        fetcher: Arc<dyn FetchSettings>,
        transport: Arc<dyn EventTransport>,
    ) -> VwoClient {
        let gateway = config.gateway_service.clone();
        VwoClient::start(
            config,
            ClientParts {
                store: Arc::new(SettingsStore::new()),
                fetcher,
                transport,
                gateway,
            },
            false,
        )
        .unwrap()
    }

    fn settings(&self, api: &str) -> Option<Arc<Settings>> {
        let settings = self.store.get_settings();
        if settings.is_none() {
            let reason = self.store.invalid_reason();
            log::warn!(target: "vwo",
                       api,
                       reason:? = reason;
                       "client is not initialized with valid settings");
        }
        settings
    }

    /// Decide whether `feature_key` is enabled for the user and which variables they get.
    ///
    /// Never fails: any problem is logged and a disabled flag is returned.
    pub fn get_flag(&self, feature_key: &str, context: &UserContext) -> GetFlag {
        if feature_key.is_empty() || context.id.is_empty() {
            log::warn!(target: "vwo",
                       feature_key,
                       user_id = context.id;
                       "get_flag requires a feature key and a user id");
            return GetFlag::default();
        }
        let Some(settings) = self.settings("getFlag") else {
            return GetFlag::default();
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            let ctx = DecisionContext {
                settings: &settings,
                storage: &self.storage,
                gateway: self.gateway.as_deref(),
                integrations: &*self.integrations,
            };
            get_flag::get_flag(&ctx, feature_key, context)
        }));
        let evaluation = match result {
            Ok(evaluation) => evaluation,
            Err(_) => {
                log::warn!(target: "vwo",
                           feature_key,
                           user_id = context.id;
                           "panic while evaluating a flag, returning disabled");
                return GetFlag::default();
            }
        };

        for impression in evaluation.impressions {
            self.events
                .send(self.event_builder.impression(context, impression));
        }

        log::debug!(target: "vwo",
                    feature_key,
                    user_id = context.id,
                    is_enabled = evaluation.flag.is_enabled(),
                    variation_id:? = evaluation.flag.variation_id();
                    "evaluated a flag");
        evaluation.flag
    }

    /// Track a conversion of `event_name` for the user.
    ///
    /// Only events that some feature lists as a metric are sent. Returns `{event_name: sent}`.
    pub fn track_event(
        &self,
        event_name: &str,
        context: &UserContext,
        event_properties: &Attributes,
    ) -> HashMap<String, bool> {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.try_track_event(event_name, context, event_properties)
        }))
        .unwrap_or_else(|_| {
            log::warn!(target: "vwo", event_name; "panic while tracking an event");
            false
        });
        HashMap::from([(event_name.to_owned(), result)])
    }

    fn try_track_event(
        &self,
        event_name: &str,
        context: &UserContext,
        event_properties: &Attributes,
    ) -> bool {
        if event_name.is_empty() || context.id.is_empty() {
            log::warn!(target: "vwo",
                       event_name,
                       user_id = context.id;
                       "track_event requires an event name and a user id");
            return false;
        }
        let Some(settings) = self.settings("trackEvent") else {
            return false;
        };
        if !settings.has_metric(event_name) {
            log::warn!(target: "vwo",
                       event_name;
                       "event is not a metric of any feature, not tracking it");
            return false;
        }

        self.events.send(
            self.event_builder
                .track(context, event_name, event_properties),
        );

        let decision = Decision::from([
            ("eventName".to_owned(), json!(event_name)),
            ("api".to_owned(), json!("track")),
        ]);
        self.integrations.execute(&decision);

        log::debug!(target: "vwo", event_name, user_id = context.id; "event tracked");
        true
    }

    /// Sync visitor attributes to VWO.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidAttributes`] if `attributes` is empty or holds a null value.
    /// - [`Error::InvalidContext`] if the user id is empty.
    /// - [`Error::InvalidSettings`] if the client has no valid settings.
    pub fn set_attribute(&self, attributes: &Attributes, context: &UserContext) -> Result<()> {
        if attributes.is_empty()
            || attributes
                .values()
                .any(|value| matches!(value, AttributeValue::Null))
        {
            return Err(Error::InvalidAttributes);
        }
        if context.id.is_empty() {
            return Err(Error::InvalidContext);
        }
        if self.settings("setAttribute").is_none() {
            return Err(Error::InvalidSettings(
                self.store.invalid_reason().unwrap_or_default(),
            ));
        }

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.events
                .send(self.event_builder.set_attribute(context, attributes));
        }));
        if result.is_err() {
            log::warn!(target: "vwo", user_id = context.id; "panic while setting attributes");
        }
        Ok(())
    }

    /// Replace the settings, with `settings` when given or by fetching them otherwise.
    ///
    /// `is_via_webhook` fetches from the endpoint that bypasses the settings cache, for use when
    /// a VWO webhook signals a change. Identical settings are not swapped.
    ///
    /// # Errors
    ///
    /// Returns the fetch, parse or validation error. The current settings are kept in that case.
    pub fn update_settings(&self, settings: Option<String>, is_via_webhook: bool) -> Result<()> {
        let result = match settings {
            Some(json) => Settings::from_json(json.as_bytes()),
            None => self.fetcher.fetch_settings(is_via_webhook),
        };
        let settings = result.inspect_err(|err| {
            log::warn!(target: "vwo", is_via_webhook; "failed to update settings: {err}");
        })?;
        poller::swap_settings(&self.store, settings);
        Ok(())
    }

    /// Send all queued events now and stop the batch timer. Later events are sent as soon as the
    /// queue reaches `events_per_request`.
    ///
    /// # Errors
    ///
    /// - [`Error::BatchingNotEnabled`] if the client was created without
    ///   [`BatchEventData`](crate::BatchEventData).
    /// - The request error if sending failed. Unsent events stay queued.
    pub fn flush_events(&self) -> Result<()> {
        self.events.flush()
    }

    /// Stop the settings poller and event threads and wait for them to exit. Queued events are
    /// sent first.
    pub fn shutdown(&self) -> Result<()> {
        let poller = self
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(poller) = poller {
            poller.shutdown()?;
        }
        self.events.shutdown()
    }
}
