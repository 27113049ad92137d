//! A background poller thread that periodically requests settings from the server and swaps them
//! into the settings store.
use std::{
    sync::{mpsc::RecvTimeoutError, Arc},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::settings::{Settings, MIN_POLL_INTERVAL};
use crate::settings_fetcher::FetchSettings;
use crate::settings_store::SettingsStore;
use crate::{Error, Result};

/// Configuration for the settings poller.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for settings. Values below one second are ignored.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`], or to the `pollInterval` of the
    /// settings document when it has one.
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests. This helps to avoid
    /// multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(600);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::ZERO;

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// Pick the poll interval: a usable configured value wins, then the settings' `pollInterval`,
/// then the default.
pub(crate) fn effective_interval(
    configured: Option<Duration>,
    settings: Option<&Settings>,
) -> Duration {
    if let Some(interval) = configured {
        if interval >= MIN_POLL_INTERVAL {
            return interval;
        }
        log::warn!(target: "vwo",
                   interval:? = interval;
                   "poll interval must be at least {MIN_POLL_INTERVAL:?}, ignoring it");
    }
    settings
        .and_then(Settings::poll_interval)
        .unwrap_or(PollerThreadConfig::DEFAULT_POLL_INTERVAL)
}

/// Store `settings` unless they are identical to the current snapshot. Returns whether the
/// snapshot was replaced.
pub(crate) fn swap_settings(store: &SettingsStore, settings: Settings) -> bool {
    if let Some(current) = store.get_settings() {
        if current.canonical_json() == settings.canonical_json() {
            log::debug!(target: "vwo", "settings unchanged");
            return false;
        }
    }
    store.set_settings(settings);
    log::info!(target: "vwo", "settings updated");
    true
}

/// A settings poller thread.
pub(crate) struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl PollerThread {
    /// Starts the poller thread. The first request happens after one interval: initial settings
    /// are loaded by the client before the poller starts.
    pub(crate) fn start(
        fetcher: Arc<dyn FetchSettings>,
        store: Arc<SettingsStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 is enough as a stop command is sent with `try_send()`.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        log::info!(target: "vwo", interval:? = config.interval; "starting settings poller");
        let join_handle = std::thread::Builder::new()
            .name("vwo-poller".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                    let timeout = jitter(config.interval, config.jitter);
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Fetch new settings below.
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::info!(target: "vwo", "settings poller stopped");
                            return;
                        }
                    }

                    match fetcher.fetch_settings(false) {
                        Ok(settings) => {
                            swap_settings(&store, settings);
                        }
                        Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                            // Unrecoverable errors
                            log::warn!(target: "vwo", "stopping settings poller: {err}");
                            return;
                        }
                        Err(err) => {
                            // Other errors are retriable. Keep the current snapshot.
                            log::warn!(target: "vwo", "failed to refresh settings: {err:?}");
                        }
                    }
                }));

                if result.is_err() {
                    log::warn!(target: "vwo", "settings poller panicked");
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub(crate) fn stop(&self) {
        // Error means that the thread exited or another stop command is already pending.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub(crate) fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::ThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::*;

    const V1: &[u8] = br#"{"version": 1, "accountId": 1, "campaigns": [], "features": []}"#;
    const V2: &[u8] = br#"{"version": 2, "accountId": 1, "campaigns": [], "features": []}"#;

    /// Serves the documents in order, repeating the last one.
    struct ScriptedFetcher {
        documents: Mutex<Vec<Result<&'static [u8]>>>,
        calls: AtomicUsize,
    }

    impl FetchSettings for ScriptedFetcher {
        fn fetch_settings(&self, _via_webhook: bool) -> Result<Settings> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut documents = self.documents.lock().unwrap();
            let next = if documents.len() > 1 {
                documents.remove(0)
            } else {
                documents[0].clone()
            };
            Settings::from_json(next?)
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn fast() -> PollerThreadConfig {
        PollerThreadConfig::new().with_interval(Duration::from_millis(10))
    }

    #[test]
    fn poller_swaps_changed_settings_and_survives_errors() {
        let store = Arc::new(SettingsStore::new());
        store.set_settings(Settings::from_json(V1).unwrap());
        let fetcher = Arc::new(ScriptedFetcher {
            documents: Mutex::new(vec![Err(Error::UnexpectedStatus(500)), Ok(V2)]),
            calls: AtomicUsize::new(0),
        });

        let poller = PollerThread::start(fetcher.clone(), store.clone(), fast()).unwrap();
        wait_until(|| store.get_settings().unwrap().canonical_json().contains("\"version\":2"));
        poller.shutdown().unwrap();

        assert!(fetcher.calls.load(Ordering::SeqCst) >= 2);
        assert!(store
            .get_settings()
            .unwrap()
            .canonical_json()
            .contains("\"version\":2"));
    }

    #[test]
    fn poller_stops_when_unauthorized() {
        let store = Arc::new(SettingsStore::new());
        let fetcher = Arc::new(ScriptedFetcher {
            documents: Mutex::new(vec![Err(Error::Unauthorized)]),
            calls: AtomicUsize::new(0),
        });

        let poller = PollerThread::start(fetcher.clone(), store, fast()).unwrap();
        wait_until(|| fetcher.calls.load(Ordering::SeqCst) > 0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        poller.shutdown().unwrap();
    }

    #[test]
    fn identical_settings_are_not_swapped() {
        let store = SettingsStore::new();
        assert!(swap_settings(&store, Settings::from_json(V1).unwrap()));
        let before = store.get_settings().unwrap();

        let reordered = br#"{"features": [], "campaigns": [], "accountId": 1, "version": 1}"#;
        assert!(!swap_settings(&store, Settings::from_json(reordered).unwrap()));
        assert!(Arc::ptr_eq(&before, &store.get_settings().unwrap()));

        assert!(swap_settings(&store, Settings::from_json(V2).unwrap()));
    }

    #[test]
    fn configured_interval_wins_over_settings() {
        let settings = Settings::from_json(
            br#"{"version": 1, "accountId": 1, "campaigns": [], "features": [], "pollInterval": 5000}"#,
        )
        .unwrap();

        assert_eq!(
            effective_interval(Some(Duration::from_secs(2)), Some(&settings)),
            Duration::from_secs(2)
        );
        assert_eq!(
            effective_interval(None, Some(&settings)),
            Duration::from_secs(5)
        );
        // Below the minimum: fall back to settings.
        assert_eq!(
            effective_interval(Some(Duration::from_millis(999)), Some(&settings)),
            Duration::from_secs(5)
        );
        assert_eq!(
            effective_interval(None, None),
            PollerThreadConfig::DEFAULT_POLL_INTERVAL
        );
    }
}
