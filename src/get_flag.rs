//! Flag decisions: storage lookup, rollout gate, experiment rules, persistence and impressions.
use serde::Serialize;
use serde_json::json;

use crate::context::{attributes_to_json, UserContext};
use crate::gateway::GatewayService;
use crate::integrations::{Decision, IntegrationCallback};
use crate::rule_eval::{self, RuleEvaluator};
use crate::settings::{Feature, Settings, Variable, Variation};
use crate::storage::{StorageFacade, StoredDecision};

/// A variable of the variation a user received.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlagVariable {
    #[allow(missing_docs)]
    pub id: i64,
    #[allow(missing_docs)]
    pub key: String,
    #[allow(missing_docs)]
    pub value: serde_json::Value,
    /// `string`, `integer`, `double`, `boolean` or `json`.
    #[serde(rename = "type")]
    pub variable_type: String,
}

impl From<&Variable> for FlagVariable {
    fn from(variable: &Variable) -> FlagVariable {
        FlagVariable {
            id: variable.id,
            key: variable.key.clone(),
            value: coerce_value(variable),
            variable_type: variable.variable_type.clone(),
        }
    }
}

/// Integer variables may arrive as JSON doubles (`10.0`).
fn coerce_value(variable: &Variable) -> serde_json::Value {
    let value = &variable.value;
    if variable.variable_type == "integer" && value.is_f64() {
        if let Some(n) = value.as_f64() {
            return serde_json::Value::from(n as i64);
        }
    }
    value.clone()
}

/// Result of [`VwoClient::get_flag`](crate::VwoClient::get_flag).
///
/// A disabled flag has no variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFlag {
    is_enabled: bool,
    variation_id: Option<i64>,
    variables: Vec<FlagVariable>,
}

impl GetFlag {
    /// Whether the flag is on for the user.
    pub fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    /// Id of the variation whose variables are exposed. Useful for diagnostics.
    pub fn variation_id(&self) -> Option<i64> {
        self.variation_id
    }

    /// All variables of the variation, in declared order.
    pub fn get_variables(&self) -> &[FlagVariable] {
        &self.variables
    }

    /// Value of variable `key`, or `default` when the variation has no such variable.
    ///
    /// ```
    /// # fn test(flag: vwo_fme::GetFlag) {
    /// let color = flag.get_variable("color", "blue");
    /// # }
    /// ```
    pub fn get_variable(
        &self,
        key: &str,
        default: impl Into<serde_json::Value>,
    ) -> serde_json::Value {
        self.variables
            .iter()
            .find(|variable| variable.key == key)
            .map_or_else(|| default.into(), |variable| variable.value.clone())
    }

    fn set_variation(&mut self, variation: &Variation) {
        self.is_enabled = true;
        self.variation_id = Some(variation.id);
        self.variables = variation.variables.iter().map(FlagVariable::from).collect();
    }
}

/// A `vwo_variationShown` event to send for a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Impression {
    pub campaign_id: i64,
    pub variation_id: i64,
}

#[derive(Debug, Default)]
pub(crate) struct FlagEvaluation {
    pub flag: GetFlag,
    pub impressions: Vec<Impression>,
}

/// Collaborators consulted while deciding a flag.
pub(crate) struct DecisionContext<'a> {
    pub settings: &'a Settings,
    pub storage: &'a StorageFacade,
    pub gateway: Option<&'a (dyn GatewayService + Send + Sync)>,
    pub integrations: &'a dyn IntegrationCallback,
}

/// Decide `feature_key` for `user`.
///
/// Impressions are returned rather than sent so the caller decides how to deliver them.
pub(crate) fn get_flag(
    ctx: &DecisionContext<'_>,
    feature_key: &str,
    user: &UserContext,
) -> FlagEvaluation {
    let mut evaluation = FlagEvaluation::default();
    let settings = ctx.settings;

    let Some(feature) = settings.feature(feature_key) else {
        log::warn!(target: "vwo", feature_key, user_id = user.id; "feature not found in settings");
        return evaluation;
    };

    let stored = ctx.storage.get(feature_key, &user.id);
    if let Some(variation) = stored
        .as_ref()
        .and_then(|stored| stored_experiment_variation(settings, stored))
    {
        log::info!(target: "vwo",
                   feature_key,
                   user_id = user.id,
                   variation_id = variation.id;
                   "experiment decision found in storage");
        evaluation.flag.set_variation(variation);
        push_impact_impression(feature, &mut evaluation);
        return evaluation;
    }

    let user = enrich_user(feature, user, ctx.gateway);
    let mut evaluator = RuleEvaluator::new(settings, ctx.storage, ctx.gateway, &user);
    let mut passed = StoredDecision::new(feature.key.clone(), feature.id, user.id.clone());
    let mut should_check_experiments = false;

    let stored_rollout = stored
        .as_ref()
        .and_then(|stored| stored_rollout_variation(settings, stored));
    if let Some((campaign_id, campaign_key, variation)) = stored_rollout {
        log::info!(target: "vwo",
                   feature_key,
                   user_id = user.id,
                   campaign_key;
                   "rollout decision found in storage");
        evaluation.flag.set_variation(variation);
        passed.rollout_id = Some(campaign_id);
        passed.rollout_key = Some(campaign_key.to_owned());
        passed.rollout_variation_id = Some(variation.id);
        should_check_experiments = true;
        evaluator
            .evaluated_features
            .insert(feature.key.clone(), true);
    } else {
        let mut rollout_rules = feature.rollout_rules().peekable();
        if rollout_rules.peek().is_none() {
            should_check_experiments = true;
        } else {
            let candidate = rollout_rules
                .find(|campaign| evaluator.evaluate_rule(feature, campaign).pre_segmentation);
            let allotted = candidate.and_then(|campaign| {
                rule_eval::variation_allotted(campaign, settings.account_id, &user.id)
                    .map(|variation| (campaign, variation))
            });
            if let Some((campaign, variation)) = allotted {
                log::debug!(target: "vwo",
                            feature_key,
                            user_id = user.id,
                            campaign_key = campaign.log_key();
                            "user passed rollout");
                evaluation.flag.set_variation(variation);
                passed.rollout_id = Some(campaign.id);
                passed.rollout_key = Some(campaign.key.clone());
                passed.rollout_variation_id = Some(variation.id);
                evaluation.impressions.push(Impression {
                    campaign_id: campaign.id,
                    variation_id: variation.id,
                });
                should_check_experiments = true;
            }
            evaluator
                .evaluated_features
                .insert(feature.key.clone(), should_check_experiments);
        }
    }

    if should_check_experiments {
        let candidate = feature.experiment_rules().find_map(|campaign| {
            let result = evaluator.evaluate_rule(feature, campaign);
            result
                .pre_segmentation
                .then_some((campaign, result.whitelisted))
        });
        if let Some((campaign, whitelisted)) = candidate {
            let variation = whitelisted.or_else(|| {
                rule_eval::variation_allotted(campaign, settings.account_id, &user.id).cloned()
            });
            if let Some(variation) = variation {
                log::debug!(target: "vwo",
                            feature_key,
                            user_id = user.id,
                            campaign_key = campaign.log_key(),
                            variation_id = variation.id;
                            "user bucketed into experiment");
                evaluation.flag.set_variation(&variation);
                passed.experiment_id = Some(campaign.id);
                passed.experiment_key = Some(campaign.key.clone());
                passed.experiment_variation_id = Some(variation.id);
                evaluation.impressions.push(Impression {
                    campaign_id: campaign.id,
                    variation_id: variation.id,
                });
            }
        }
    }

    if evaluation.flag.is_enabled() {
        ctx.storage.set(&passed);
    }

    ctx.integrations
        .execute(&decision(feature, &user, &evaluator, &passed));

    push_impact_impression(feature, &mut evaluation);

    log::info!(target: "vwo",
               feature_key,
               user_id = user.id,
               enabled = evaluation.flag.is_enabled();
               "flag evaluated");
    evaluation
}

/// Impact analysis records every decision: variation 2 when the flag is on, 1 when off.
fn push_impact_impression(feature: &Feature, evaluation: &mut FlagEvaluation) {
    if let Some(impact) = feature
        .impact_campaign
        .as_ref()
        .filter(|impact| impact.campaign_id != 0)
    {
        evaluation.impressions.push(Impression {
            campaign_id: impact.campaign_id,
            variation_id: if evaluation.flag.is_enabled() { 2 } else { 1 },
        });
    }
}

fn stored_experiment_variation<'s>(
    settings: &'s Settings,
    stored: &StoredDecision,
) -> Option<&'s Variation> {
    let (_, experiment_key) = stored.experiment()?;
    let variation_id = stored.experiment_variation()?;
    settings.variation_by_campaign_key(experiment_key, variation_id)
}

/// A stored rollout whose campaign or variation has since been removed is ignored.
fn stored_rollout_variation<'s>(
    settings: &'s Settings,
    stored: &'s StoredDecision,
) -> Option<(i64, &'s str, &'s Variation)> {
    let (rollout_id, rollout_key) = stored.rollout()?;
    let variation_id = stored.rollout_variation_id?;
    let variation = settings.variation_by_campaign_key(rollout_key, variation_id)?;
    Some((rollout_id, rollout_key, variation))
}

/// Fetch location and user-agent details once per request for features that segment on them.
fn enrich_user(
    feature: &Feature,
    user: &UserContext,
    gateway: Option<&(dyn GatewayService + Send + Sync)>,
) -> UserContext {
    let mut user = user.clone();
    let Some(gateway) = gateway else {
        return user;
    };
    if !feature.is_gateway_service_required || user.gateway_data.is_some() {
        return user;
    }
    if user.user_agent().is_none() && user.ip_address().is_none() {
        return user;
    }
    match gateway.get_user_data(user.user_agent(), user.ip_address()) {
        Ok(data) => user.gateway_data = Some(data),
        Err(err) => {
            log::warn!(target: "vwo",
                       feature_key = feature.key,
                       user_id = user.id;
                       "failed to fetch user details from gateway: {err:?}");
        }
    }
    user
}

fn decision(
    feature: &Feature,
    user: &UserContext,
    evaluator: &RuleEvaluator<'_>,
    passed: &StoredDecision,
) -> Decision {
    let mut decision = Decision::from([
        ("featureName".to_owned(), json!(feature.name)),
        ("featureId".to_owned(), json!(feature.id)),
        ("featureKey".to_owned(), json!(feature.key)),
        ("userId".to_owned(), json!(user.id)),
        ("api".to_owned(), json!("getFlag")),
        (
            "customVariables".to_owned(),
            attributes_to_json(&evaluator.custom_variables),
        ),
        (
            "variationTargetingVariables".to_owned(),
            attributes_to_json(&evaluator.variation_targeting_variables),
        ),
    ]);
    let optional = [
        ("rolloutId", passed.rollout_id.map(|id| json!(id))),
        ("rolloutKey", passed.rollout_key.as_ref().map(|key| json!(key))),
        (
            "rolloutVariationId",
            passed.rollout_variation_id.map(|id| json!(id)),
        ),
        ("experimentId", passed.experiment_id.map(|id| json!(id))),
        (
            "experimentKey",
            passed.experiment_key.as_ref().map(|key| json!(key)),
        ),
        (
            "experimentVariationId",
            passed.experiment_variation_id.map(|id| json!(id)),
        ),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            decision.insert(key.to_owned(), value);
        }
    }
    decision
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::context::{AttributeValue, Attributes};
    use crate::gateway::GatewayUserData;
    use crate::integrations::NoopIntegrationCallback;
    use crate::storage::InMemoryStorage;
    use crate::Result;

    fn settings(name: &str) -> Settings {
        let mut buf = Vec::new();
        File::open(format!("tests/data/settings/{name}"))
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        Settings::from_json(&buf).unwrap()
    }

    fn storage() -> StorageFacade {
        StorageFacade::new(Some(Arc::new(InMemoryStorage::new())))
    }

    fn evaluate(
        settings: &Settings,
        storage: &StorageFacade,
        feature_key: &str,
        user: &UserContext,
    ) -> FlagEvaluation {
        let ctx = DecisionContext {
            settings,
            storage,
            gateway: None,
            integrations: &NoopIntegrationCallback,
        };
        get_flag(&ctx, feature_key, user)
    }

    #[test]
    fn unknown_feature_is_disabled() {
        let settings = settings("basic.json");
        let storage = storage();
        let evaluation = evaluate(&settings, &storage, "missing", &UserContext::new("Ashley"));

        assert!(!evaluation.flag.is_enabled());
        assert!(evaluation.flag.get_variables().is_empty());
        assert!(evaluation.impressions.is_empty());
    }

    #[test]
    fn rollout_enables_flag() {
        let _ = env_logger::builder().is_test(true).try_init();
        let settings = settings("basic.json");
        let storage = storage();

        // bucket_for_user("1_Ashley") == 46 is within the 50% rollout.
        let evaluation = evaluate(
            &settings,
            &storage,
            "feature_rollout",
            &UserContext::new("Ashley"),
        );

        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(1));
        assert_eq!(evaluation.flag.get_variable("color", "none"), json!("blue"));
        assert_eq!(
            evaluation.impressions,
            vec![Impression {
                campaign_id: 1,
                variation_id: 1
            }]
        );

        let stored = storage.get("feature_rollout", "Ashley").unwrap();
        assert_eq!(stored.rollout_id, Some(1));
        assert_eq!(stored.rollout_key.as_deref(), Some("feature_rollout_rolloutRule1"));
        assert_eq!(stored.rollout_variation_id, Some(1));
        assert_eq!(stored.experiment_id, None);
    }

    #[test]
    fn user_outside_rollout_is_disabled() {
        let mut settings = settings("basic.json");
        let storage = storage();

        // bucket_for_user("1_carol") == 26 is outside a 10% rollout.
        settings.features[0].rules_linked_campaign[0].variations[0].weight = 10.0;
        let evaluation = evaluate(
            &settings,
            &storage,
            "feature_rollout",
            &UserContext::new("carol"),
        );

        assert!(!evaluation.flag.is_enabled());
        assert!(evaluation.impressions.is_empty());
        assert!(storage.get("feature_rollout", "carol").is_none());
    }

    #[test]
    fn integer_variables_are_coerced() {
        let settings = settings("basic.json");
        let storage = storage();
        let evaluation = evaluate(
            &settings,
            &storage,
            "feature_rollout",
            &UserContext::new("Ashley"),
        );

        assert_eq!(evaluation.flag.get_variable("count", 0), json!(10));
        assert!(evaluation.flag.get_variable("count", 0).is_i64());
        assert_eq!(evaluation.flag.get_variable("missing", 7), json!(7));
        assert_eq!(
            serde_json::to_value(evaluation.flag.get_variables()).unwrap(),
            json!([
                {"id": 1, "key": "color", "value": "blue", "type": "string"},
                {"id": 2, "key": "count", "value": 10, "type": "integer"},
            ])
        );
    }

    #[test]
    fn whitelisted_user_gets_forced_variation() {
        let settings = settings("basic.json");
        let storage = storage();
        let user = UserContext::new("u1").with_variation_targeting_variables(Attributes::from([(
            "plan".to_owned(),
            AttributeValue::from("premium"),
        )]));

        let evaluation = evaluate(&settings, &storage, "feature_ab", &user);

        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(2));
        assert_eq!(evaluation.flag.get_variable("color", "none"), json!("red"));
        assert_eq!(
            evaluation.impressions,
            vec![
                Impression {
                    campaign_id: 2,
                    variation_id: 2
                },
                // Impact campaign.
                Impression {
                    campaign_id: 99,
                    variation_id: 2
                },
            ]
        );
    }

    #[test]
    fn experiment_bucketing_and_group_winner() {
        let settings = settings("basic.json");
        let storage = storage();
        // u2 fails the personalize pre-segmentation so campaign 2 wins group 7 alone;
        // bucket_for_string("2_123456_u2") == 7149 falls into Variation-1.
        let evaluation = evaluate(&settings, &storage, "feature_ab", &UserContext::new("u2"));

        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(2));

        let stored = storage.get("feature_ab", "u2").unwrap();
        assert_eq!(stored.experiment_id, Some(2));
        assert_eq!(stored.experiment_variation_id, Some(2));
        let group = storage.get("_vwo_meta_meg_7", "u2").unwrap();
        assert_eq!(group.experiment_id, Some(2));
    }

    #[test]
    fn stored_experiment_is_sticky() {
        let settings = settings("basic.json");
        let storage = storage();
        storage.set(&StoredDecision {
            experiment_id: Some(2),
            experiment_key: Some("feature_ab_testingRule1".to_owned()),
            experiment_variation_id: Some(1),
            ..StoredDecision::new("feature_ab", 2, "u2")
        });

        let evaluation = evaluate(&settings, &storage, "feature_ab", &UserContext::new("u2"));

        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(1));
        assert_eq!(evaluation.flag.get_variable("color", "none"), json!("blue"));
        assert_eq!(
            evaluation.impressions,
            vec![Impression {
                campaign_id: 99,
                variation_id: 2
            }]
        );
    }

    #[test]
    fn stored_decision_for_removed_experiment_is_reevaluated() {
        let settings = settings("basic.json");
        let storage = storage();
        storage.set(&StoredDecision {
            experiment_id: Some(77),
            experiment_key: Some("removed_experiment".to_owned()),
            experiment_variation_id: Some(1),
            ..StoredDecision::new("feature_ab", 2, "u2")
        });

        let evaluation = evaluate(&settings, &storage, "feature_ab", &UserContext::new("u2"));

        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(2));
        let impact: Vec<&Impression> = evaluation
            .impressions
            .iter()
            .filter(|impression| impression.campaign_id == 99)
            .collect();
        assert_eq!(
            impact,
            [&Impression {
                campaign_id: 99,
                variation_id: 2
            }]
        );
        let stored = storage.get("feature_ab", "u2").unwrap();
        assert_eq!(stored.experiment_id, Some(2));
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let settings = settings("basic.json");
        let user = UserContext::new("u2");

        let first = evaluate(&settings, &storage(), "feature_ab", &user);
        let second = evaluate(&settings, &storage(), "feature_ab", &user);
        assert_eq!(first.flag, second.flag);

        let storage = storage();
        let first = evaluate(&settings, &storage, "feature_ab", &user);
        let second = evaluate(&settings, &storage, "feature_ab", &user);
        assert_eq!(first.flag, second.flag);
    }

    #[test]
    fn personalize_winner_blocks_other_group_member() {
        let settings = settings("basic.json");
        let storage = storage();
        let user = UserContext::new("Ashley").with_custom_variable("plan", "gold");

        // bucket_for_string("7_Ashley") == 6184 falls into the second of two equal ranges,
        // which belongs to the personalize member "3_2".
        let evaluation = evaluate(&settings, &storage, "feature_personalize", &user);
        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.flag.variation_id(), Some(2));
        assert_eq!(evaluation.flag.get_variable("enabled", false), json!(true));

        let group = storage.get("_vwo_meta_meg_7", "Ashley").unwrap();
        assert_eq!(group.experiment_id, Some(3));
        assert_eq!(group.experiment_variation_id, Some(2));

        let evaluation = evaluate(&settings, &storage, "feature_ab", &user);
        assert!(!evaluation.flag.is_enabled());
        assert_eq!(
            evaluation.impressions,
            vec![Impression {
                campaign_id: 99,
                variation_id: 1
            }]
        );
    }

    #[test]
    fn stored_rollout_skips_rollout_evaluation() {
        let mut settings = settings("basic.json");
        // Nobody would pass the rollout any more.
        settings.features[0].rules_linked_campaign[0].variations[0].weight = 0.0;
        let storage = storage();
        storage.set(&StoredDecision {
            rollout_id: Some(1),
            rollout_key: Some("feature_rollout_rolloutRule1".to_owned()),
            rollout_variation_id: Some(1),
            ..StoredDecision::new("feature_rollout", 1, "bob")
        });

        let evaluation = evaluate(&settings, &storage, "feature_rollout", &UserContext::new("bob"));
        assert!(evaluation.flag.is_enabled());
        assert!(evaluation.impressions.is_empty());
    }

    #[test]
    fn stored_rollout_of_removed_campaign_is_ignored() {
        let settings = settings("basic.json");
        let storage = storage();
        storage.set(&StoredDecision {
            rollout_id: Some(42),
            rollout_key: Some("removed_rollout".to_owned()),
            rollout_variation_id: Some(1),
            ..StoredDecision::new("feature_rollout", 1, "Ashley")
        });

        let evaluation = evaluate(
            &settings,
            &storage,
            "feature_rollout",
            &UserContext::new("Ashley"),
        );
        assert!(evaluation.flag.is_enabled());
        assert_eq!(evaluation.impressions.len(), 1);
        let stored = storage.get("feature_rollout", "Ashley").unwrap();
        assert_eq!(stored.rollout_id, Some(1));
    }

    #[test]
    fn integration_receives_decision_once() {
        let settings = settings("basic.json");
        let storage = storage();
        let decisions = Mutex::new(Vec::new());
        let callback = |decision: &Decision| decisions.lock().unwrap().push(decision.clone());
        let ctx = DecisionContext {
            settings: &settings,
            storage: &storage,
            gateway: None,
            integrations: &callback,
        };

        get_flag(
            &ctx,
            "feature_rollout",
            &UserContext::new("Ashley").with_custom_variable("plan", "gold"),
        );

        let decisions = decisions.into_inner().unwrap();
        assert_eq!(decisions.len(), 1);
        let decision = &decisions[0];
        assert_eq!(decision["featureKey"], json!("feature_rollout"));
        assert_eq!(decision["featureName"], json!("Feature Rollout"));
        assert_eq!(decision["featureId"], json!(1));
        assert_eq!(decision["userId"], json!("Ashley"));
        assert_eq!(decision["api"], json!("getFlag"));
        assert_eq!(decision["rolloutId"], json!(1));
        assert_eq!(decision["rolloutKey"], json!("feature_rollout_rolloutRule1"));
        assert_eq!(decision["rolloutVariationId"], json!(1));
        assert_eq!(decision["customVariables"]["plan"], json!("gold"));
        assert_eq!(decision["customVariables"]["_vwoUserId"], json!("Ashley"));
        assert!(!decision.contains_key("experimentId"));
    }

    struct StaticGateway;

    impl GatewayService for StaticGateway {
        fn get_user_data(
            &self,
            _user_agent: Option<&str>,
            _ip_address: Option<&str>,
        ) -> Result<GatewayUserData> {
            Ok(GatewayUserData {
                location: [("country".to_owned(), "IN".to_owned())].into(),
                user_agent: Default::default(),
            })
        }

        fn check_attribute(&self, _attribute: &str, _list_id: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn gateway_enrichment_feeds_segmentation() {
        let settings = settings("gateway.json");
        let storage = storage();
        let gateway = StaticGateway;
        let ctx = DecisionContext {
            settings: &settings,
            storage: &storage,
            gateway: Some(&gateway),
            integrations: &NoopIntegrationCallback,
        };

        let user = UserContext::new("Ashley").with_ip_address("1.2.3.4");
        assert!(get_flag(&ctx, "feature_country", &user).flag.is_enabled());

        // No user agent or IP to look up.
        let user = UserContext::new("Ashley");
        assert!(!get_flag(&ctx, "feature_country", &user).flag.is_enabled());
    }
}
