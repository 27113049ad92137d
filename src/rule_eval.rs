//! Per-campaign rule evaluation: whitelisting, pre-segmentation, mutually exclusive group
//! arbitration and traffic bucketing.
use std::collections::HashMap;

use crate::allocation;
use crate::bucketer::{self, MAX_TRAFFIC_VALUE};
use crate::context::{AttributeValue, Attributes, UserContext, VWO_USER_ID_KEY};
use crate::gateway::GatewayService;
use crate::meg;
use crate::segmentation::SegmentContext;
use crate::settings::{Campaign, Feature, Settings, Variation};
use crate::storage::{StorageFacade, MEG_STORAGE_KEY_PREFIX};

/// Outcome of [`RuleEvaluator::evaluate_rule`].
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleResult {
    pub pre_segmentation: bool,
    /// Variation forced through whitelisting. Traffic allocation is skipped when set.
    pub whitelisted: Option<Variation>,
}

/// Request-scoped evaluator. Caches group winners and rollout outcomes for the duration of a
/// single `get_flag` call.
pub(crate) struct RuleEvaluator<'a> {
    pub(crate) settings: &'a Settings,
    pub(crate) storage: &'a StorageFacade,
    pub(crate) gateway: Option<&'a (dyn GatewayService + Send + Sync)>,
    pub(crate) user: &'a UserContext,
    /// Group id → winning member id. `None` means no campaign of the group may win.
    pub(crate) meg_winners: HashMap<i64, Option<String>>,
    /// Feature key → whether its rollout prerequisite passed.
    pub(crate) evaluated_features: HashMap<String, bool>,
    /// Last custom variables used for pre-segmentation, reported to integrations.
    pub(crate) custom_variables: Attributes,
    /// Last targeting variables used for whitelisting, reported to integrations.
    pub(crate) variation_targeting_variables: Attributes,
}

impl<'a> RuleEvaluator<'a> {
    pub(crate) fn new(
        settings: &'a Settings,
        storage: &'a StorageFacade,
        gateway: Option<&'a (dyn GatewayService + Send + Sync)>,
        user: &'a UserContext,
    ) -> RuleEvaluator<'a> {
        RuleEvaluator {
            settings,
            storage,
            gateway,
            user,
            meg_winners: HashMap::new(),
            evaluated_features: HashMap::new(),
            custom_variables: user.custom_variables.clone(),
            variation_targeting_variables: user.variation_targeting_variables.clone(),
        }
    }

    fn segment_context(&self) -> SegmentContext<'_> {
        SegmentContext {
            settings: self.settings,
            user: self.user,
            storage: self.storage,
            gateway: self.gateway,
        }
    }

    /// `_vwoUserId` value for `campaign`: the visitor UUID for user-list campaigns, the raw id
    /// otherwise.
    fn vwo_user_id(&self, campaign: &Campaign) -> AttributeValue {
        if campaign.is_user_list_enabled {
            AttributeValue::String(self.user.uuid(self.settings.account_id))
        } else {
            AttributeValue::String(self.user.id.clone())
        }
    }

    /// Custom variables with `_vwoUserId` injected for `campaign`.
    pub(crate) fn custom_variables_for(&self, campaign: &Campaign) -> Attributes {
        let mut variables = self.user.custom_variables.clone();
        variables.insert(VWO_USER_ID_KEY.to_owned(), self.vwo_user_id(campaign));
        variables
    }

    /// Whitelisting, then pre-segmentation and group arbitration for one rule of `feature`.
    pub(crate) fn evaluate_rule(&mut self, feature: &Feature, campaign: &Campaign) -> RuleResult {
        if campaign.is_testing() {
            let mut targeting = self.user.variation_targeting_variables.clone();
            targeting.insert(VWO_USER_ID_KEY.to_owned(), self.vwo_user_id(campaign));
            self.variation_targeting_variables = targeting;

            if campaign.is_forced_variation_enabled {
                if let Some(variation) = self.whitelisted_variation(campaign) {
                    log::debug!(target: "vwo",
                                user_id = self.user.id,
                                campaign_key = campaign.log_key(),
                                variation_id = variation.id;
                                "user is whitelisted");
                    return RuleResult {
                        pre_segmentation: true,
                        whitelisted: Some(variation),
                    };
                }
            }
        }

        self.custom_variables = self.custom_variables_for(campaign);

        let group_id = self.settings.group_of(campaign).map(|(group_id, _)| group_id);
        if let Some(group_id) = group_id {
            if let Some(passed) = self.check_known_group_winner(group_id, campaign) {
                return RuleResult {
                    pre_segmentation: passed,
                    whitelisted: None,
                };
            }
        }

        let pre_segmentation = self.pre_segmentation(campaign);

        let pre_segmentation = match group_id {
            Some(group_id) if pre_segmentation => {
                let winner = meg::resolve(self, feature, group_id);
                let passed = winner.as_deref() == Some(campaign.group_member_id().as_str());
                self.meg_winners.insert(group_id, winner);
                passed
            }
            _ => pre_segmentation,
        };

        RuleResult {
            pre_segmentation,
            whitelisted: None,
        }
    }

    /// Decide from the per-request cache or a stored group decision. `None` when neither knows.
    fn check_known_group_winner(&mut self, group_id: i64, campaign: &Campaign) -> Option<bool> {
        let member_id = campaign.group_member_id();

        if let Some(winner) = self.meg_winners.get(&group_id) {
            return Some(winner.as_deref() == Some(member_id.as_str()));
        }

        let stored = self
            .storage
            .get(&format!("{MEG_STORAGE_KEY_PREFIX}{group_id}"), &self.user.id)?;
        let (experiment_id, experiment_key) = stored.experiment()?;
        log::debug!(target: "vwo",
                    user_id = self.user.id,
                    group_id,
                    campaign_key = experiment_key;
                    "group winner found in storage");

        let stored_member = match stored.experiment_variation() {
            Some(variation_id) => format!("{experiment_id}_{variation_id}"),
            None => experiment_id.to_string(),
        };
        let passed = if experiment_id == campaign.id {
            match campaign.personalize_variation_id() {
                Some(variation_id) => stored.experiment_variation() == Some(variation_id),
                None => true,
            }
        } else {
            false
        };
        if !passed {
            self.meg_winners.insert(group_id, Some(stored_member));
        }
        Some(passed)
    }

    /// Evaluate the campaign's pre-segmentation against the custom variables. Empty segments pass.
    pub(crate) fn pre_segmentation(&self, campaign: &Campaign) -> bool {
        let Some(segments) = campaign.pre_segments() else {
            return true;
        };
        if segments.is_empty() {
            return true;
        }
        let properties = self.custom_variables_for(campaign);
        let passed = segments.evaluate(&properties, &self.segment_context());
        log::debug!(target: "vwo",
                    user_id = self.user.id,
                    campaign_key = campaign.log_key(),
                    passed;
                    "pre-segmentation evaluated");
        passed
    }

    /// Variation whose segments match the targeting variables. Several matches are split by
    /// bucketing on their rescaled weights.
    fn whitelisted_variation(&self, campaign: &Campaign) -> Option<Variation> {
        let context = self.segment_context();
        let mut targeted: Vec<Variation> = campaign
            .variations
            .iter()
            .filter(|variation| !variation.segments.is_empty())
            .filter(|variation| {
                variation
                    .segments
                    .evaluate(&self.variation_targeting_variables, &context)
            })
            .cloned()
            .collect();

        if targeted.len() <= 1 {
            return targeted.pop();
        }

        allocation::scale_weights(&mut targeted);
        allocation::assign_ranges(&mut targeted);
        let bucket = bucketer::bucket_for_string(&campaign.bucketing_seed(&self.user.id));
        allocation::find_by_bucket(&targeted, bucket).cloned()
    }

    /// Whether the rollout rules of `feature` let the user through. Features without rollout
    /// rules always pass. The result is cached for the request.
    ///
    /// The variables of the rule currently being evaluated are left untouched.
    pub(crate) fn rollout_passed(&mut self, feature: &Feature) -> bool {
        if let Some(passed) = self.evaluated_features.get(&feature.key) {
            return *passed;
        }

        let mut rollout_rules = feature.rollout_rules().peekable();
        let passed = if rollout_rules.peek().is_none() {
            true
        } else {
            let custom_variables = self.custom_variables.clone();
            let targeting_variables = self.variation_targeting_variables.clone();
            let candidate = rollout_rules.find(|campaign| {
                self.evaluate_rule(feature, campaign).pre_segmentation
            });
            self.custom_variables = custom_variables;
            self.variation_targeting_variables = targeting_variables;
            candidate.is_some_and(|campaign| {
                variation_allotted(campaign, self.settings.account_id, &self.user.id).is_some()
            })
        };

        self.evaluated_features.insert(feature.key.clone(), passed);
        passed
    }
}

/// Whether the user falls within the campaign's traffic.
///
/// Bucket key is `"<salt or id>_<user>"` in `[1, 100]`. Rollout and personalize campaigns use
/// their variation's weight as traffic, A/B campaigns use `percent_traffic`.
pub(crate) fn is_user_part_of_campaign(campaign: &Campaign, user_id: &str) -> bool {
    if user_id.is_empty() {
        return false;
    }
    let traffic = if campaign.is_rollout_or_personalize() {
        campaign.variations.first().map_or(0.0, |variation| variation.weight)
    } else {
        f64::from(campaign.percent_traffic)
    };

    let bucket = bucketer::bucket_for_user(&campaign.bucketing_seed(user_id));
    let is_part = bucket != 0 && f64::from(bucket) <= traffic;
    log::debug!(target: "vwo",
                user_id,
                campaign_key = campaign.log_key(),
                bucket,
                traffic,
                is_part;
                "campaign traffic evaluated");
    is_part
}

/// Bucket the user into one of the campaign's variation ranges.
///
/// Key is `"<salt or id>_<account id>_<user>"`. A campaign with zero traffic maps everyone to
/// bucket 0 which belongs to no variation.
pub(crate) fn bucket_user_to_variation<'c>(
    campaign: &'c Campaign,
    account_id: i64,
    user_id: &str,
) -> Option<&'c Variation> {
    if user_id.is_empty() {
        return None;
    }
    let multiplier = if campaign.percent_traffic == 0 { 0 } else { 1 };
    let key = match campaign.salt() {
        Some(salt) => format!("{salt}_{account_id}_{user_id}"),
        None => format!("{}_{account_id}_{user_id}", campaign.id),
    };
    let hash = bucketer::murmur_hash_32(&key);
    let bucket = bucketer::bucket_value(hash, MAX_TRAFFIC_VALUE, multiplier);
    log::trace!(target: "vwo",
                user_id,
                campaign_key = campaign.log_key(),
                hash,
                bucket;
                "bucketing user to variation");
    allocation::find_by_bucket(&campaign.variations, bucket)
}

/// Traffic gate followed by variation bucketing. Rollout and personalize campaigns have a
/// single variation which is returned when the user is within traffic.
pub(crate) fn variation_allotted<'c>(
    campaign: &'c Campaign,
    account_id: i64,
    user_id: &str,
) -> Option<&'c Variation> {
    if !is_user_part_of_campaign(campaign, user_id) {
        return None;
    }
    if campaign.is_rollout_or_personalize() {
        campaign.variations.first()
    } else {
        bucket_user_to_variation(campaign, account_id, user_id)
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::sync::Arc;

    use super::*;
    use crate::storage::{InMemoryStorage, StoredDecision};

    fn settings(name: &str) -> Settings {
        let mut buf = Vec::new();
        File::open(format!("tests/data/settings/{name}"))
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        Settings::from_json(&buf).unwrap()
    }

    #[test]
    fn rollout_traffic() {
        let settings = settings("basic.json");
        let campaign = &settings.feature("feature_rollout").unwrap().rules_linked_campaign[0];

        // bucket_for_user("1_Ashley") == 46, weight is 50.
        assert!(is_user_part_of_campaign(campaign, "Ashley"));
        // bucket_for_user("1_u42") == 6.
        assert!(is_user_part_of_campaign(campaign, "u42"));
        assert!(!is_user_part_of_campaign(campaign, ""));

        let variation = variation_allotted(campaign, settings.account_id, "Ashley").unwrap();
        assert_eq!(variation.id, 1);
    }

    #[test]
    fn zero_and_full_traffic() {
        let mut settings = settings("basic.json");
        let campaign = &mut settings.campaigns[1];

        campaign.percent_traffic = 0;
        for user in ["a", "b", "c", "Ashley", "u42"] {
            assert!(!is_user_part_of_campaign(campaign, user));
            assert!(bucket_user_to_variation(campaign, 123456, user).is_none());
        }

        campaign.percent_traffic = 100;
        for user in ["a", "b", "c", "Ashley", "u42"] {
            assert!(is_user_part_of_campaign(campaign, user));
            assert!(bucket_user_to_variation(campaign, 123456, user).is_some());
        }
    }

    #[test]
    fn testing_variation_bucketing() {
        let settings = settings("basic.json");
        let campaign = settings.campaign_by_key("feature_ab_testingRule1").unwrap();
        // bucket_for_string("2_123456_Ashley") == 3454, bucket_for_string("2_123456_u1") == 9744.
        assert_eq!(
            bucket_user_to_variation(campaign, 123456, "Ashley").map(|v| v.id),
            Some(1)
        );
        assert_eq!(
            bucket_user_to_variation(campaign, 123456, "u1").map(|v| v.id),
            Some(2)
        );
    }

    #[test]
    fn whitelisting_bypasses_traffic() {
        let mut settings = settings("basic.json");
        settings.features[1].rules_linked_campaign[0].percent_traffic = 0;
        let storage = StorageFacade::default();
        let user = UserContext::new("u1").with_variation_targeting_variables(
            [("plan".to_owned(), AttributeValue::from("premium"))].into(),
        );
        let mut evaluator = RuleEvaluator::new(&settings, &storage, None, &user);

        let feature = settings.feature("feature_ab").unwrap();
        let result = evaluator.evaluate_rule(feature, &feature.rules_linked_campaign[0]);

        assert!(result.pre_segmentation);
        let variation = result.whitelisted.unwrap();
        assert_eq!(variation.name, "Variation-1");
        assert_eq!(
            evaluator.variation_targeting_variables.get(VWO_USER_ID_KEY),
            Some(&AttributeValue::from("u1"))
        );
    }

    #[test]
    fn no_whitelisting_without_match() {
        let settings = settings("basic.json");
        let storage = StorageFacade::default();
        let user = UserContext::new("u1");
        let mut evaluator = RuleEvaluator::new(&settings, &storage, None, &user);

        let feature = settings.feature("feature_ab").unwrap();
        let result = evaluator.evaluate_rule(feature, &feature.rules_linked_campaign[0]);
        assert!(result.whitelisted.is_none());
    }

    #[test]
    fn personalize_pre_segmentation_uses_variation_segments() {
        let settings = settings("basic.json");
        let storage = StorageFacade::default();
        let feature = settings.feature("feature_personalize").unwrap();
        let campaign = &feature.rules_linked_campaign[0];

        let user = UserContext::new("Ashley").with_custom_variable("plan", "gold");
        let evaluator = RuleEvaluator::new(&settings, &storage, None, &user);
        assert!(evaluator.pre_segmentation(campaign));

        let user = UserContext::new("Ashley").with_custom_variable("plan", "silver");
        let evaluator = RuleEvaluator::new(&settings, &storage, None, &user);
        assert!(!evaluator.pre_segmentation(campaign));
    }

    #[test]
    fn user_list_campaigns_use_uuid() {
        let mut settings = settings("basic.json");
        settings.campaigns[1].is_user_list_enabled = true;
        let storage = StorageFacade::default();
        let user = UserContext::new("Ashley");
        let evaluator = RuleEvaluator::new(&settings, &storage, None, &user);

        let variables = evaluator.custom_variables_for(&settings.campaigns[1]);
        assert_eq!(
            variables.get(VWO_USER_ID_KEY),
            Some(&AttributeValue::from("4C9BA81BAF53591488EB5FD5E66A98B9"))
        );
        let variables = evaluator.custom_variables_for(&settings.campaigns[0]);
        assert_eq!(
            variables.get(VWO_USER_ID_KEY),
            Some(&AttributeValue::from("Ashley"))
        );
    }

    #[test]
    fn rollout_check_keeps_current_rule_variables() {
        let mut settings = settings("basic.json");
        for feature in &mut settings.features {
            if feature.key == "feature_rollout" {
                for campaign in &mut feature.rules_linked_campaign {
                    campaign.is_user_list_enabled = true;
                }
            }
        }
        let storage = StorageFacade::default();
        let user = UserContext::new("Ashley");
        let mut evaluator = RuleEvaluator::new(&settings, &storage, None, &user);
        evaluator.custom_variables = evaluator.custom_variables_for(&settings.campaigns[1]);

        let feature = settings.feature("feature_rollout").unwrap();
        evaluator.rollout_passed(feature);
        assert_eq!(
            evaluator.custom_variables.get(VWO_USER_ID_KEY),
            Some(&AttributeValue::from("Ashley"))
        );
    }

    #[test]
    fn stored_group_winner_decides() {
        let settings = settings("basic.json");
        let storage = StorageFacade::new(Some(Arc::new(InMemoryStorage::new())));
        storage.set(&StoredDecision {
            experiment_id: Some(3),
            experiment_key: Some("feature_personalize_personalizeRule1".to_owned()),
            experiment_variation_id: Some(2),
            ..StoredDecision::new("_vwo_meta_meg_7", 0, "u1")
        });
        let user = UserContext::new("u1");
        let mut evaluator = RuleEvaluator::new(&settings, &storage, None, &user);

        let feature = settings.feature("feature_ab").unwrap();
        let result = evaluator.evaluate_rule(feature, &feature.rules_linked_campaign[0]);
        assert!(!result.pre_segmentation);
        assert_eq!(evaluator.meg_winners.get(&7), Some(&Some("3_2".to_owned())));

        let feature = settings.feature("feature_personalize").unwrap();
        let result = evaluator.evaluate_rule(feature, &feature.rules_linked_campaign[0]);
        assert!(result.pre_segmentation);
    }

    #[test]
    fn rollout_prerequisite_is_cached() {
        let settings = settings("basic.json");
        let storage = StorageFacade::default();
        let user = UserContext::new("Ashley");
        let mut evaluator = RuleEvaluator::new(&settings, &storage, None, &user);

        let feature = settings.feature("feature_rollout").unwrap();
        assert!(evaluator.rollout_passed(feature));
        assert_eq!(evaluator.evaluated_features.get("feature_rollout"), Some(&true));

        let feature = settings.feature("feature_ab").unwrap();
        assert!(evaluator.rollout_passed(feature));
    }
}
