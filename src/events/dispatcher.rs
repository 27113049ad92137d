//! Event delivery: the HTTP transport and the sender thread used when batching is off.
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use rand::{thread_rng, Rng};
use reqwest::Url;
use serde_json::json;

use super::payload::{EventPayload, SDK_NAME, SDK_VERSION};
use crate::network::NetworkClient;
use crate::settings_store::SettingsStore;
use crate::{Error, Result};

const EVENTS_ENDPOINT: &str = "/events/t";
const BATCH_EVENTS_ENDPOINT: &str = "/server-side/batch-events-v2";

const USER_AGENT_HEADER: &str = "X-Device-User-Agent";
const IP_ADDRESS_HEADER: &str = "VWO-X-Forwarded-For";

/// Sends events somewhere. The HTTP implementation posts them to VWO.
pub(crate) trait EventTransport: Send + Sync {
    fn send_event(&self, event: &EventPayload) -> Result<()>;

    fn send_batch(&self, events: &[EventPayload]) -> Result<()>;
}

pub(crate) struct HttpEventTransport {
    network: NetworkClient,
    base_url: String,
    account_id: i64,
    sdk_key: String,
    /// Source of the current collection prefix.
    store: Arc<SettingsStore>,
}

impl HttpEventTransport {
    pub(crate) fn new(
        network: NetworkClient,
        base_url: impl Into<String>,
        account_id: i64,
        sdk_key: impl Into<String>,
        store: Arc<SettingsStore>,
    ) -> HttpEventTransport {
        HttpEventTransport {
            network,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            account_id,
            sdk_key: sdk_key.into(),
            store,
        }
    }

    fn url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        let prefix = self
            .store
            .get_settings()
            .and_then(|settings| settings.collection_prefix.clone())
            .filter(|prefix| !prefix.is_empty());
        let base = match prefix {
            Some(prefix) => format!("{}/{}{}", self.base_url, prefix, endpoint),
            None => format!("{}{}", self.base_url, endpoint),
        };
        Url::parse_with_params(&base, params).map_err(Error::InvalidBaseUrl)
    }
}

impl EventTransport for HttpEventTransport {
    fn send_event(&self, event: &EventPayload) -> Result<()> {
        let account_id = self.account_id.to_string();
        let event_time = chrono::Utc::now().timestamp_millis().to_string();
        let random = thread_rng().gen::<f64>().to_string();
        let mut params = vec![
            ("en", event.name.as_str()),
            ("a", &*account_id),
            ("env", &*self.sdk_key),
            ("eTime", &*event_time),
            ("random", &*random),
            ("p", "FS"),
            ("sn", SDK_NAME),
            ("sv", SDK_VERSION),
        ];
        let mut headers = Vec::new();
        if let Some(user_agent) = &event.user_agent {
            params.push(("visitor_ua", user_agent));
            headers.push((USER_AGENT_HEADER, user_agent.as_str()));
        }
        if let Some(ip_address) = &event.ip_address {
            params.push(("visitor_ip", ip_address));
            headers.push((IP_ADDRESS_HEADER, ip_address.as_str()));
        }

        let url = self.url(EVENTS_ENDPOINT, &params)?;
        self.network
            .post_json(url, &headers, &event.body, event.is_retryable())
    }

    fn send_batch(&self, events: &[EventPayload]) -> Result<()> {
        let account_id = self.account_id.to_string();
        let url = self.url(
            BATCH_EVENTS_ENDPOINT,
            &[("a", &*account_id), ("env", &*self.sdk_key)],
        )?;
        let body = json!({
            "ev": events.iter().map(|event| &event.body).collect::<Vec<_>>(),
        });
        self.network
            .post_json(url, &[("Authorization", &*self.sdk_key)], &body, true)
    }
}

/// Sends events one by one from a background thread. Failures are logged and dropped.
pub(crate) struct EventDispatcher {
    sender: Mutex<Option<Sender<EventPayload>>>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventDispatcher {
    pub(crate) fn start(transport: Arc<dyn EventTransport>) -> std::io::Result<EventDispatcher> {
        let (sender, receiver) = mpsc::channel::<EventPayload>();

        let join_handle = std::thread::Builder::new()
            .name("vwo-events".to_owned())
            .spawn(move || {
                // The loop ends once every sender is dropped.
                for event in receiver {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        transport.send_event(&event)
                    }));
                    match result {
                        Ok(Ok(())) => {
                            log::debug!(target: "vwo", event_name = event.name; "event sent");
                        }
                        Ok(Err(err)) => {
                            log::warn!(target: "vwo", event_name = event.name; "failed to send event: {err:?}");
                        }
                        Err(_) => {
                            log::warn!(target: "vwo", event_name = event.name; "event sender panicked");
                        }
                    }
                }
                log::debug!(target: "vwo", "event sender thread stopped");
            })?;

        Ok(EventDispatcher {
            sender: Mutex::new(Some(sender)),
            join_handle: Mutex::new(Some(join_handle)),
        })
    }

    pub(crate) fn dispatch(&self, event: EventPayload) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            log::warn!(target: "vwo", event_name = event.name; "event dropped: sender is stopped");
            return;
        };
        if sender.send(event).is_err() {
            log::warn!(target: "vwo", "event dropped: sender thread exited");
        }
    }

    /// Send the events already queued, then stop the thread.
    pub(crate) fn shutdown(&self) -> Result<()> {
        // Dropping the sender ends the thread's receive loop.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let join_handle = self
            .join_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join_handle) = join_handle {
            join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        }
        Ok(())
    }
}
