//! Settings snapshot: features, campaigns, variations, rules and mutually exclusive groups.
//!
//! A snapshot is parsed from JSON, validated, then processed once (variation ranges are allocated,
//! rule-linked campaign copies are materialized and gateway requirements are derived). After that
//! it is immutable and shared between requests behind an `Arc`.
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::allocation::{self, Weighted};
use crate::segmentation::Segment;
use crate::{Error, Result};

/// Poll intervals below this are ignored.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum CampaignType {
    #[serde(rename = "FLAG_ROLLOUT")]
    Rollout,
    #[serde(rename = "FLAG_TESTING")]
    Testing,
    #[serde(rename = "FLAG_PERSONALIZE")]
    Personalize,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Variable {
    #[serde(default)]
    pub id: i64,
    #[serde(default, rename = "type")]
    pub variable_type: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Variation {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub segments: Segment,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(skip)]
    pub start_range: i32,
    #[serde(skip)]
    pub end_range: i32,
}

impl Weighted for Variation {
    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn range(&self) -> (i32, i32) {
        (self.start_range, self.end_range)
    }

    fn set_range(&mut self, start: i32, end: i32) {
        self.start_range = start;
        self.end_range = end;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Campaign {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub campaign_type: Option<CampaignType>,
    #[serde(default)]
    pub segments: Segment,
    #[serde(default)]
    pub salt: Option<String>,
    #[serde(default)]
    pub percent_traffic: u32,
    #[serde(default)]
    pub is_user_list_enabled: bool,
    #[serde(default)]
    pub is_forced_variation_enabled: bool,
    #[serde(default)]
    pub variations: Vec<Variation>,
    /// Key of the feature rule this copy was materialized for.
    #[serde(skip)]
    pub rule_key: Option<String>,
}

impl Campaign {
    pub(crate) fn is_rollout_or_personalize(&self) -> bool {
        matches!(
            self.campaign_type,
            Some(CampaignType::Rollout | CampaignType::Personalize)
        )
    }

    pub(crate) fn is_testing(&self) -> bool {
        self.campaign_type == Some(CampaignType::Testing)
    }

    pub(crate) fn is_personalize(&self) -> bool {
        self.campaign_type == Some(CampaignType::Personalize)
    }

    /// Segments used for pre-segmentation: the campaign's own for A/B, the (only) variation's for
    /// rollout and personalize.
    pub(crate) fn pre_segments(&self) -> Option<&Segment> {
        match self.campaign_type {
            Some(CampaignType::Testing) => Some(&self.segments),
            Some(CampaignType::Rollout | CampaignType::Personalize) => {
                self.variations.first().map(|variation| &variation.segments)
            }
            _ => None,
        }
    }

    /// Salt used in bucketing keys. Rollout and personalize carry it on their variation.
    pub(crate) fn salt(&self) -> Option<&str> {
        let salt = if self.is_rollout_or_personalize() {
            self.variations.first().and_then(|v| v.salt.as_deref())
        } else {
            self.salt.as_deref()
        };
        salt.filter(|salt| !salt.is_empty())
    }

    /// `"<salt>_<user>"`, or `"<id>_<user>"` when there is no salt.
    pub(crate) fn bucketing_seed(&self, user_id: &str) -> String {
        match self.salt() {
            Some(salt) => format!("{salt}_{user_id}"),
            None => format!("{}_{user_id}", self.id),
        }
    }

    /// Identifier of this campaign inside mutually exclusive groups: `"<id>"`, or
    /// `"<id>_<variation id>"` for personalize.
    pub(crate) fn group_member_id(&self) -> String {
        match self.personalize_variation_id() {
            Some(variation_id) => format!("{}_{variation_id}", self.id),
            None => self.id.to_string(),
        }
    }

    pub(crate) fn personalize_variation_id(&self) -> Option<i64> {
        if self.is_personalize() {
            self.variations.first().map(|variation| variation.id)
        } else {
            None
        }
    }

    /// Human-readable key used in logs.
    pub(crate) fn log_key(&self) -> String {
        if self.is_testing() {
            self.key.clone()
        } else {
            format!("{}_{}", self.name, self.rule_key.as_deref().unwrap_or_default())
        }
    }

    pub(crate) fn variation(&self, variation_id: i64) -> Option<&Variation> {
        self.variations.iter().find(|variation| variation.id == variation_id)
    }

    fn allocate(&mut self) {
        if self.is_rollout_or_personalize() {
            for variation in &mut self.variations {
                allocation::assign_rollout_range(variation);
            }
        } else {
            allocation::allocate(&mut self.variations);
        }
        for variation in &self.variations {
            log::trace!(target: "vwo",
                        campaign_key = self.key,
                        variation_id = variation.id,
                        weight = variation.weight,
                        start_range = variation.start_range,
                        end_range = variation.end_range;
                        "allocated variation range");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Metric {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub identifier: String,
    #[serde(default, rename = "type")]
    pub metric_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Rule {
    #[serde(default, rename = "type")]
    pub rule_type: String,
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub campaign_id: i64,
    /// Zero unless the rule targets a single personalize variation.
    #[serde(default)]
    pub variation_id: i64,
    #[serde(default)]
    pub rule_key: String,
}

/// Synthetic on/off tracker attached to a feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ImpactCampaign {
    #[serde(default)]
    pub campaign_id: i64,
    #[serde(default, rename = "type")]
    pub campaign_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Feature {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub feature_type: String,
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub impact_campaign: Option<ImpactCampaign>,
    #[serde(default)]
    pub is_debugger_enabled: bool,
    /// Campaign copies referenced by `rules`, in rule order.
    #[serde(skip)]
    pub rules_linked_campaign: Vec<Campaign>,
    #[serde(skip)]
    pub is_gateway_service_required: bool,
}

impl Feature {
    pub(crate) fn rollout_rules(&self) -> impl Iterator<Item = &Campaign> {
        self.rules_linked_campaign
            .iter()
            .filter(|campaign| campaign.campaign_type == Some(CampaignType::Rollout))
    }

    /// A/B and personalize rules, in declared order.
    pub(crate) fn experiment_rules(&self) -> impl Iterator<Item = &Campaign> {
        self.rules_linked_campaign.iter().filter(|campaign| {
            matches!(
                campaign.campaign_type,
                Some(CampaignType::Testing | CampaignType::Personalize)
            )
        })
    }

    fn link_campaigns(&mut self, campaigns: &HashMap<i64, &Campaign>) {
        self.rules_linked_campaign = self
            .rules
            .iter()
            .filter_map(|rule| {
                let mut linked = (*campaigns.get(&rule.campaign_id)?).clone();
                linked.rule_key = Some(rule.rule_key.clone());
                if rule.variation_id != 0 {
                    if let Some(variation) = linked.variation(rule.variation_id).cloned() {
                        linked.variations = vec![variation];
                    }
                }
                Some(linked)
            })
            .collect();
    }
}

/// Mutually exclusive group definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Group {
    #[serde(default)]
    pub name: String,
    /// Members: `"<campaign id>"` or `"<campaign id>_<variation id>"`.
    #[serde(default)]
    pub campaigns: Vec<String>,
    /// Algorithm: 1 = random, 2 = advanced.
    #[serde(default)]
    pub et: Option<u8>,
    /// Priority order for the advanced algorithm.
    #[serde(default)]
    pub p: Vec<String>,
    /// Weights for the advanced algorithm.
    #[serde(default)]
    pub wt: HashMap<String, f64>,
}

/// Group tie-break algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupAlgorithm {
    Random,
    Advanced,
}

impl Group {
    pub(crate) fn algorithm(&self) -> GroupAlgorithm {
        match self.et {
            Some(2) => GroupAlgorithm::Advanced,
            _ => GroupAlgorithm::Random,
        }
    }
}

/// A validated and processed settings snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Settings {
    #[serde(default)]
    pub sdk_key: String,
    #[serde(default)]
    pub account_id: i64,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub collection_prefix: Option<String>,
    #[serde(default)]
    pub usage_stats_account_id: Option<i64>,
    #[serde(default)]
    pub features: Vec<Feature>,
    #[serde(default)]
    pub campaigns: Vec<Campaign>,
    /// Group member id → group id.
    #[serde(default)]
    pub campaign_groups: HashMap<String, i64>,
    #[serde(default)]
    pub groups: HashMap<String, Group>,
    #[serde(default)]
    poll_interval: Option<u64>,
    #[serde(skip)]
    canonical_json: String,
}

impl Settings {
    /// Parse, validate and process a settings document.
    pub(crate) fn from_json(json: &[u8]) -> Result<Settings> {
        let mut value: serde_json::Value = serde_json::from_slice(json)?;

        let Some(root) = value.as_object_mut() else {
            return Err(Error::InvalidSettings("settings must be a JSON object".to_owned()));
        };
        // Older payloads encode empty lists as empty objects.
        for field in ["features", "campaigns"] {
            if let Some(entry) = root.get_mut(field) {
                if entry.as_object().is_some_and(|object| object.is_empty()) {
                    *entry = serde_json::Value::Array(Vec::new());
                }
            }
        }
        let has_campaigns = root.get("campaigns").is_some_and(|c| !c.is_null());

        // serde_json::Map is sorted by key, so this is stable across field order.
        let canonical_json = serde_json::to_string(&value)?;
        let mut settings: Settings = serde_json::from_value(value)?;
        settings.canonical_json = canonical_json;

        settings.validate(has_campaigns)?;
        settings.process();
        Ok(settings)
    }

    /// Canonical JSON form of the document this snapshot was parsed from.
    pub(crate) fn canonical_json(&self) -> &str {
        &self.canonical_json
    }

    fn validate(&self, has_campaigns: bool) -> Result<()> {
        let mut errors = Vec::new();

        if self.version == 0 {
            errors.push("settings version is missing".to_owned());
        }
        if self.account_id == 0 {
            errors.push("settings accountId is missing".to_owned());
        }
        if !has_campaigns {
            errors.push("settings campaigns list is missing".to_owned());
        }

        for (i, campaign) in self.campaigns.iter().enumerate() {
            let prefix = format!("campaigns[{i}]");
            if campaign.id == 0 {
                errors.push(format!("{prefix}: id is missing"));
            }
            if campaign.campaign_type.is_none() {
                errors.push(format!("{prefix}: type is missing"));
            }
            if campaign.key.is_empty() {
                errors.push(format!("{prefix}: key is missing"));
            }
            if campaign.name.is_empty() {
                errors.push(format!("{prefix}: name is missing"));
            }
            if campaign.variations.is_empty() {
                errors.push(format!("{prefix}: variations list is empty"));
            }
            for (j, variation) in campaign.variations.iter().enumerate() {
                let prefix = format!("{prefix}.variations[{j}]");
                if variation.id == 0 {
                    errors.push(format!("{prefix}: id is missing"));
                }
                if variation.name.is_empty() {
                    errors.push(format!("{prefix}: name is missing"));
                }
                for (k, variable) in variation.variables.iter().enumerate() {
                    validate_variable(variable, &format!("{prefix}.variables[{k}]"), &mut errors);
                }
            }
        }

        for (i, feature) in self.features.iter().enumerate() {
            let prefix = format!("features[{i}]");
            if feature.id == 0 {
                errors.push(format!("{prefix}: id is missing"));
            }
            if feature.key.is_empty() {
                errors.push(format!("{prefix}: key is missing"));
            }
            if feature.name.is_empty() {
                errors.push(format!("{prefix}: name is missing"));
            }
            if feature.feature_type.is_empty() {
                errors.push(format!("{prefix}: type is missing"));
            }
            if feature.metrics.is_empty() {
                errors.push(format!("{prefix}: metrics list is empty"));
            }
            for (j, metric) in feature.metrics.iter().enumerate() {
                let prefix = format!("{prefix}.metrics[{j}]");
                if metric.id == 0 {
                    errors.push(format!("{prefix}: id is missing"));
                }
                if metric.metric_type.is_empty() {
                    errors.push(format!("{prefix}: type is missing"));
                }
                if metric.identifier.is_empty() {
                    errors.push(format!("{prefix}: identifier is missing"));
                }
            }
            for (j, rule) in feature.rules.iter().enumerate() {
                let prefix = format!("{prefix}.rules[{j}]");
                if rule.rule_type.is_empty() {
                    errors.push(format!("{prefix}: type is missing"));
                }
                if rule.rule_key.is_empty() {
                    errors.push(format!("{prefix}: ruleKey is missing"));
                }
                if rule.campaign_id == 0 {
                    errors.push(format!("{prefix}: campaignId is missing"));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidSettings(errors.join("; ")))
        }
    }

    fn process(&mut self) {
        for campaign in &mut self.campaigns {
            campaign.allocate();
        }

        let campaigns: HashMap<i64, &Campaign> = self
            .campaigns
            .iter()
            .map(|campaign| (campaign.id, campaign))
            .collect();
        for feature in &mut self.features {
            feature.link_campaigns(&campaigns);
            feature.is_gateway_service_required = feature
                .rules_linked_campaign
                .iter()
                .filter_map(Campaign::pre_segments)
                .any(Segment::requires_gateway);
        }
    }

    pub(crate) fn feature(&self, key: &str) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.key == key)
    }

    pub(crate) fn feature_by_id(&self, id: i64) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.id == id)
    }

    pub(crate) fn campaign_by_key(&self, key: &str) -> Option<&Campaign> {
        self.campaigns.iter().find(|campaign| campaign.key == key)
    }

    /// Variation `variation_id` of the campaign with key `campaign_key`.
    pub(crate) fn variation_by_campaign_key(
        &self,
        campaign_key: &str,
        variation_id: i64,
    ) -> Option<&Variation> {
        self.campaign_by_key(campaign_key)?.variation(variation_id)
    }

    /// The group `campaign` belongs to, if any.
    pub(crate) fn group_of(&self, campaign: &Campaign) -> Option<(i64, &Group)> {
        let group_id = *self.campaign_groups.get(&campaign.group_member_id())?;
        let group = self.groups.get(&group_id.to_string())?;
        Some((group_id, group))
    }

    pub(crate) fn group(&self, group_id: i64) -> Option<&Group> {
        self.groups.get(&group_id.to_string())
    }

    /// Features owning at least one of the group `members`, in declared order.
    pub(crate) fn features_with_members(&self, members: &[String]) -> Vec<&Feature> {
        self.features
            .iter()
            .filter(|feature| {
                members.iter().any(|member| {
                    let (campaign_id, variation_id) = match member.split_once('_') {
                        Some((campaign_id, variation_id)) => {
                            (campaign_id, variation_id.parse::<i64>().ok())
                        }
                        None => (member.as_str(), None),
                    };
                    let Ok(campaign_id) = campaign_id.parse::<i64>() else {
                        return false;
                    };
                    feature.rules.iter().any(|rule| {
                        rule.campaign_id == campaign_id
                            && variation_id.map_or(true, |id| rule.variation_id == id)
                    })
                })
            })
            .collect()
    }

    /// Poll interval requested by the settings document, if valid.
    pub(crate) fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
            .map(Duration::from_millis)
            .filter(|interval| *interval >= MIN_POLL_INTERVAL)
    }

    /// Whether some feature tracks `event_name` as a metric.
    pub(crate) fn has_metric(&self, event_name: &str) -> bool {
        self.features.iter().any(|feature| {
            feature
                .metrics
                .iter()
                .any(|metric| metric.identifier == event_name)
        })
    }
}

fn validate_variable(variable: &Variable, prefix: &str, errors: &mut Vec<String>) {
    if variable.id == 0 {
        errors.push(format!("{prefix}: id is missing"));
    }
    if variable.variable_type.is_empty() {
        errors.push(format!("{prefix}: type is missing"));
    }
    if variable.key.is_empty() {
        errors.push(format!("{prefix}: key is missing"));
    }
    if variable.value.is_null() {
        errors.push(format!("{prefix}: value is missing"));
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::time::Duration;

    use super::{CampaignType, GroupAlgorithm, Settings};
    use crate::Error;

    fn read_fixture(name: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        File::open(format!("tests/data/settings/{name}"))
            .unwrap()
            .read_to_end(&mut buf)
            .unwrap();
        buf
    }

    fn basic() -> Settings {
        Settings::from_json(&read_fixture("basic.json")).unwrap()
    }

    #[test]
    fn parse_basic_settings() {
        let settings = basic();
        assert_eq!(settings.account_id, 123456);
        assert_eq!(settings.sdk_key, "000000000000_MASKED_000000000000");
        assert_eq!(settings.features.len(), 3);
        assert_eq!(settings.campaigns.len(), 3);
        assert_eq!(
            settings.campaigns[0].campaign_type,
            Some(CampaignType::Rollout)
        );
    }

    #[test]
    fn testing_ranges_cover_all_buckets() {
        let settings = basic();
        let campaign = settings.campaign_by_key("feature_ab_testingRule1").unwrap();
        let ranges: Vec<_> = campaign
            .variations
            .iter()
            .map(|v| (v.start_range, v.end_range))
            .collect();
        assert_eq!(ranges, vec![(1, 5000), (5001, 10_000)]);
    }

    #[test]
    fn rollout_range_is_weight_times_hundred() {
        let settings = basic();
        let campaign = settings.campaign_by_key("feature_rollout_rolloutRule1").unwrap();
        assert_eq!(campaign.variations[0].start_range, 1);
        assert_eq!(campaign.variations[0].end_range, 5000);
    }

    #[test]
    fn rules_link_campaign_copies() {
        let settings = basic();

        let feature = settings.feature("feature_ab").unwrap();
        assert_eq!(feature.rules_linked_campaign.len(), 1);
        let linked = &feature.rules_linked_campaign[0];
        assert_eq!(linked.rule_key.as_deref(), Some("testingRule1"));
        assert_eq!(linked.variations.len(), 2);

        let feature = settings.feature("feature_personalize").unwrap();
        let linked = &feature.rules_linked_campaign[0];
        assert_eq!(linked.rule_key.as_deref(), Some("personalizeRule1"));
        assert_eq!(linked.variations.len(), 1);
        assert_eq!(linked.variations[0].id, 2);
        assert_eq!(linked.group_member_id(), "3_2");
    }

    #[test]
    fn rule_for_missing_campaign_is_skipped() {
        let json = br#"{
            "version": 1, "accountId": 1, "sdkKey": "k",
            "campaigns": [],
            "features": [{
                "id": 1, "key": "f", "name": "f", "type": "FEATURE_FLAG",
                "metrics": [{"id": 1, "type": "CUSTOM_GOAL", "identifier": "e"}],
                "rules": [{"type": "FLAG_ROLLOUT", "campaignId": 42, "ruleKey": "r"}]
            }]
        }"#;
        let settings = Settings::from_json(json).unwrap();
        assert!(settings.features[0].rules_linked_campaign.is_empty());
    }

    #[test]
    fn gateway_requirement_is_derived() {
        let settings = basic();
        assert!(!settings.feature("feature_rollout").unwrap().is_gateway_service_required);

        let settings = Settings::from_json(&read_fixture("gateway.json")).unwrap();
        assert!(settings.feature("feature_country").unwrap().is_gateway_service_required);
        assert!(!settings.feature("feature_custom").unwrap().is_gateway_service_required);
    }

    #[test]
    fn empty_objects_become_lists() {
        let settings =
            Settings::from_json(br#"{"version": 1, "accountId": 1, "features": {}, "campaigns": {}}"#)
                .unwrap();
        assert!(settings.features.is_empty());
        assert!(settings.campaigns.is_empty());
    }

    #[test]
    fn missing_required_fields_are_reported() {
        let err = Settings::from_json(br#"{"accountId": 1, "features": []}"#).unwrap_err();
        match err {
            Error::InvalidSettings(reason) => {
                assert!(reason.contains("version"), "{reason}");
                assert!(reason.contains("campaigns"), "{reason}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn invalid_campaign_is_reported() {
        let json = br#"{
            "version": 1, "accountId": 1,
            "campaigns": [{"id": 1, "type": "FLAG_TESTING", "key": "", "name": "c", "variations": []}],
            "features": []
        }"#;
        let Err(Error::InvalidSettings(reason)) = Settings::from_json(json) else {
            panic!("expected validation error");
        };
        assert_eq!(
            reason,
            "campaigns[0]: key is missing; campaigns[0]: variations list is empty"
        );
    }

    #[test]
    fn feature_without_metrics_is_reported() {
        let json = br#"{
            "version": 1, "accountId": 1,
            "campaigns": [],
            "features": [{"id": 1, "key": "f", "name": "f", "type": "FEATURE_FLAG", "metrics": []}]
        }"#;
        let Err(Error::InvalidSettings(reason)) = Settings::from_json(json) else {
            panic!("expected validation error");
        };
        assert_eq!(reason, "features[0]: metrics list is empty");
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            Settings::from_json(b"{not json"),
            Err(Error::SettingsParse(_))
        ));
    }

    #[test]
    fn canonical_json_ignores_field_order() {
        let a = Settings::from_json(br#"{"version": 1, "accountId": 1, "campaigns": [], "features": []}"#)
            .unwrap();
        let b = Settings::from_json(br#"{"features": [], "campaigns": [], "accountId": 1, "version": 1}"#)
            .unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn poll_interval_below_minimum_is_ignored() {
        assert_eq!(basic().poll_interval(), Some(Duration::from_millis(2000)));

        let settings = Settings::from_json(
            br#"{"version": 1, "accountId": 1, "campaigns": [], "pollInterval": 500}"#,
        )
        .unwrap();
        assert_eq!(settings.poll_interval(), None);
    }

    #[test]
    fn group_lookup() {
        let settings = basic();
        let campaign = &settings.feature("feature_ab").unwrap().rules_linked_campaign[0];
        let (group_id, group) = settings.group_of(campaign).unwrap();
        assert_eq!(group_id, 7);
        assert_eq!(group.algorithm(), GroupAlgorithm::Random);

        let personalize = &settings.feature("feature_personalize").unwrap().rules_linked_campaign[0];
        assert_eq!(settings.group_of(personalize).map(|(id, _)| id), Some(7));

        let members = &settings.group(7).unwrap().campaigns;
        let features: Vec<_> = settings
            .features_with_members(members)
            .into_iter()
            .map(|feature| feature.key.as_str())
            .collect();
        assert_eq!(features, vec!["feature_ab", "feature_personalize"]);
    }

    #[test]
    fn metrics_lookup() {
        let settings = basic();
        assert!(settings.has_metric("purchase"));
        assert!(!settings.has_metric("unknown"));
    }

    #[test]
    fn variation_by_campaign_key() {
        let settings = basic();
        let variation = settings
            .variation_by_campaign_key("feature_ab_testingRule1", 2)
            .unwrap();
        assert_eq!(variation.name, "Variation-1");
        assert!(settings.variation_by_campaign_key("feature_ab_testingRule1", 9).is_none());
    }
}
