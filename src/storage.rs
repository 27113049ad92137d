//! User-scoped decision storage used for stickiness.
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix of the synthetic feature key under which mutually exclusive group winners are stored.
pub(crate) const MEG_STORAGE_KEY_PREFIX: &str = "_vwo_meta_meg_";

/// A decision persisted for a `(feature_key, user)` pair.
///
/// Serialized as `{featureKey, featureId, user, rolloutId?, rolloutKey?, rolloutVariationId?,
/// experimentId?, experimentKey?, experimentVariationId?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDecision {
    /// Feature key, or `_vwo_meta_meg_<group_id>` for group winners.
    pub feature_key: String,
    /// Feature id. Zero for group winners.
    #[serde(default)]
    pub feature_id: i64,
    /// User id.
    pub user: String,
    /// Rollout campaign that let the user through.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_id: Option<i64>,
    /// Key of the rollout campaign.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_key: Option<String>,
    /// Variation of the rollout campaign.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_variation_id: Option<i64>,
    /// Experiment (A/B or personalize) campaign the user was bucketed into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<i64>,
    /// Key of the experiment campaign.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_key: Option<String>,
    /// Variation the user received in the experiment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_variation_id: Option<i64>,
}

impl StoredDecision {
    pub(crate) fn new(feature_key: impl Into<String>, feature_id: i64, user: impl Into<String>) -> Self {
        StoredDecision {
            feature_key: feature_key.into(),
            feature_id,
            user: user.into(),
            ..StoredDecision::default()
        }
    }

    /// Experiment id and key, when both are present and meaningful.
    pub(crate) fn experiment(&self) -> Option<(i64, &str)> {
        match (self.experiment_id, self.experiment_key.as_deref()) {
            (Some(id), Some(key)) if id != 0 && !key.is_empty() => Some((id, key)),
            _ => None,
        }
    }

    /// Experiment variation id, ignoring the `-1` placeholder some writers use.
    pub(crate) fn experiment_variation(&self) -> Option<i64> {
        self.experiment_variation_id.filter(|id| *id > 0)
    }

    /// Rollout id and key, when both are present and meaningful.
    pub(crate) fn rollout(&self) -> Option<(i64, &str)> {
        match (self.rollout_id, self.rollout_key.as_deref()) {
            (Some(id), Some(key)) if id != 0 && !key.is_empty() => Some((id, key)),
            _ => None,
        }
    }
}

/// A pluggable backend for sticky decisions.
///
/// Implementations must be safe to call from multiple threads. Errors are logged by the SDK and
/// treated as a cache miss; they never reach `get_flag` callers.
pub trait Storage {
    /// Fetch the decision stored for `feature_key` and `user_id`.
    fn get(&self, feature_key: &str, user_id: &str) -> Result<Option<StoredDecision>>;

    /// Store `decision`, overwriting any previous value.
    fn set(&self, decision: &StoredDecision) -> Result<()>;
}

/// [`Storage`] that keeps decisions in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    decisions: RwLock<HashMap<(String, String), StoredDecision>>,
}

impl InMemoryStorage {
    /// Create an empty storage.
    pub fn new() -> InMemoryStorage {
        InMemoryStorage::default()
    }
}

impl Storage for InMemoryStorage {
    fn get(&self, feature_key: &str, user_id: &str) -> Result<Option<StoredDecision>> {
        let decisions = self
            .decisions
            .read()
            .map_err(|_| Error::Storage("storage lock poisoned".to_owned()))?;
        Ok(decisions
            .get(&(feature_key.to_owned(), user_id.to_owned()))
            .cloned())
    }

    fn set(&self, decision: &StoredDecision) -> Result<()> {
        let key = (decision.feature_key.clone(), decision.user.clone());
        let mut decisions = self
            .decisions
            .write()
            .map_err(|_| Error::Storage("storage lock poisoned".to_owned()))?;
        decisions.insert(key, decision.clone());
        Ok(())
    }
}

/// Wraps the user-supplied [`Storage`] and swallows its errors.
#[derive(Clone, Default)]
pub(crate) struct StorageFacade {
    storage: Option<Arc<dyn Storage + Send + Sync>>,
}

impl StorageFacade {
    pub(crate) fn new(storage: Option<Arc<dyn Storage + Send + Sync>>) -> StorageFacade {
        StorageFacade { storage }
    }

    pub(crate) fn get(&self, feature_key: &str, user_id: &str) -> Option<StoredDecision> {
        let storage = self.storage.as_ref()?;
        match storage.get(feature_key, user_id) {
            Ok(decision) => decision,
            Err(err) => {
                log::warn!(target: "vwo", feature_key, user_id; "failed to read from storage: {err:?}");
                None
            }
        }
    }

    pub(crate) fn set(&self, decision: &StoredDecision) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };
        match storage.set(decision) {
            Ok(()) => {
                log::debug!(target: "vwo",
                            feature_key = decision.feature_key,
                            user_id = decision.user;
                            "stored decision");
            }
            Err(err) => {
                log::warn!(target: "vwo",
                           feature_key = decision.feature_key,
                           user_id = decision.user;
                           "failed to write to storage: {err:?}");
            }
        }
    }
}
