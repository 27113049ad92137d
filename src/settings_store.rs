use std::sync::{Arc, PoisonError, RwLock};

use crate::settings::Settings;

struct Slot {
    settings: Option<Arc<Settings>>,
    /// Set when the last settings document could not be used.
    invalid_reason: Option<String>,
}

/// `SettingsStore` provides a Sync storage for the settings snapshot that allows concurrent
/// access for readers and writers.
///
/// Readers take an `Arc` to the current snapshot and keep using it for the whole request, even if
/// a newer one is swapped in meanwhile.
pub(crate) struct SettingsStore {
    slot: RwLock<Slot>,
}

impl SettingsStore {
    pub(crate) fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                settings: None,
                invalid_reason: None,
            }),
        }
    }

    pub(crate) fn get_settings(&self) -> Option<Arc<Settings>> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.settings.clone()
    }

    /// Set new settings, returning the previous ones. Clears any invalid marker.
    pub(crate) fn set_settings(&self, settings: Settings) -> Option<Arc<Settings>> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(settings));

        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.invalid_reason = None;
        std::mem::replace(&mut slot.settings, new_value)
    }

    /// Mark the client as not valid. The current snapshot (if any) is dropped so that no
    /// decision is made from stale settings.
    pub(crate) fn set_invalid(&self, reason: impl Into<String>) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        slot.settings = None;
        slot.invalid_reason = Some(reason.into());
    }

    /// Why the client is not valid, if it is not.
    pub(crate) fn invalid_reason(&self) -> Option<String> {
        let slot = self.slot.read().unwrap_or_else(PoisonError::into_inner);
        slot.invalid_reason.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::SettingsStore;
    use crate::settings::Settings;

    fn empty_settings() -> Settings {
        Settings::from_json(br#"{"version": 1, "accountId": 1, "campaigns": [], "features": []}"#)
            .unwrap()
    }

    #[test]
    fn can_set_settings_from_another_thread() {
        let store = Arc::new(SettingsStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_settings(empty_settings());
            })
            .join();
        }

        assert!(store.get_settings().is_some());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let store = SettingsStore::new();
        store.set_settings(empty_settings());
        let snapshot = store.get_settings().unwrap();

        let previous = store.set_settings(empty_settings()).unwrap();
        assert!(Arc::ptr_eq(&snapshot, &previous));
        assert!(!Arc::ptr_eq(&snapshot, &store.get_settings().unwrap()));
    }

    #[test]
    fn invalid_marker_is_cleared_by_new_settings() {
        let store = SettingsStore::new();
        store.set_settings(empty_settings());
        store.set_invalid("bad settings");
        assert!(store.get_settings().is_none());
        assert_eq!(store.invalid_reason().as_deref(), Some("bad settings"));

        store.set_settings(empty_settings());
        assert!(store.get_settings().is_some());
        assert_eq!(store.invalid_reason(), None);
    }
}
