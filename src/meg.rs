//! Mutually exclusive groups: at most one campaign of a group wins for a given user.
use std::collections::HashSet;

use crate::allocation::{self, Weighted};
use crate::bucketer;
use crate::rule_eval::{self, RuleEvaluator};
use crate::settings::{Campaign, Feature, GroupAlgorithm};
use crate::storage::{StoredDecision, MEG_STORAGE_KEY_PREFIX};

/// A group member taking part in the tie-break.
#[derive(Debug, Clone)]
struct Candidate<'a> {
    campaign: &'a Campaign,
    weight: f64,
    range: (i32, i32),
}

impl<'a> Candidate<'a> {
    fn new(campaign: &'a Campaign) -> Candidate<'a> {
        Candidate {
            campaign,
            weight: 0.0,
            range: (-1, -1),
        }
    }

    fn matches_member(&self, member: &str) -> bool {
        self.campaign.id.to_string() == member || self.campaign.group_member_id() == member
    }
}

impl Weighted for Candidate<'_> {
    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn range(&self) -> (i32, i32) {
        self.range
    }

    fn set_range(&mut self, start: i32, end: i32) {
        self.range = (start, end);
    }
}

/// Pick the winner of group `group_id` for the evaluator's user while `feature` is being
/// evaluated. Returns the winner's member id (`"<id>"` or `"<id>_<variation id>"`), or `None`
/// when nobody in the group is eligible.
///
/// The winner is persisted under `_vwo_meta_meg_<group_id>` so the same campaign wins on later
/// requests.
pub(crate) fn resolve(
    evaluator: &mut RuleEvaluator<'_>,
    feature: &Feature,
    group_id: i64,
) -> Option<String> {
    let settings = evaluator.settings;
    let group = settings.group(group_id)?;
    log::debug!(target: "vwo",
                user_id = evaluator.user.id,
                feature_key = feature.key,
                group_id;
                "resolving mutually exclusive group");

    // Group members, per owning feature, for features whose rollout prerequisite passes.
    let mut members: Vec<(&str, &Campaign)> = Vec::new();
    for owner in settings.features_with_members(&group.campaigns) {
        if !evaluator.rollout_passed(owner) {
            continue;
        }
        let mut seen_rules = HashSet::new();
        for campaign in &owner.rules_linked_campaign {
            let is_member = group
                .campaigns
                .iter()
                .any(|member| Candidate::new(campaign).matches_member(member));
            if is_member && seen_rules.insert(campaign.rule_key.as_deref()) {
                members.push((owner.key.as_str(), campaign));
            }
        }
    }

    let mut eligible: Vec<Candidate> = Vec::new();
    let mut eligible_with_storage: Vec<Candidate> = Vec::new();
    for (feature_key, campaign) in members {
        if has_stored_experiment(evaluator, feature_key, campaign) {
            if !eligible_with_storage
                .iter()
                .any(|candidate| candidate.campaign.key == campaign.key)
            {
                eligible_with_storage.push(Candidate::new(campaign));
            }
            continue;
        }
        if evaluator.pre_segmentation(campaign)
            && rule_eval::is_user_part_of_campaign(campaign, &evaluator.user.id)
        {
            eligible.push(Candidate::new(campaign));
        }
    }

    let candidates = if eligible_with_storage.is_empty() {
        eligible
    } else {
        eligible_with_storage
    };
    log::debug!(target: "vwo",
                user_id = evaluator.user.id,
                group_id,
                eligible = candidates.len();
                "group candidates collected");

    let winner = match candidates.len() {
        0 => None,
        1 => Some(candidates[0].campaign),
        _ => match group.algorithm() {
            GroupAlgorithm::Random => random_winner(candidates, group_id, &evaluator.user.id),
            GroupAlgorithm::Advanced => {
                advanced_winner(candidates, &group.p, &group.wt, group_id, &evaluator.user.id)
            }
        },
    }?;

    log::debug!(target: "vwo",
                user_id = evaluator.user.id,
                group_id,
                campaign_key = winner.log_key();
                "group winner selected");
    evaluator.storage.set(&StoredDecision {
        experiment_id: Some(winner.id),
        experiment_key: Some(winner.key.clone()),
        experiment_variation_id: winner.personalize_variation_id(),
        ..StoredDecision::new(
            format!("{MEG_STORAGE_KEY_PREFIX}{group_id}"),
            0,
            evaluator.user.id.clone(),
        )
    });

    Some(winner.group_member_id())
}

/// Whether the owning feature already has a stored experiment decision naming `campaign`.
fn has_stored_experiment(
    evaluator: &RuleEvaluator<'_>,
    feature_key: &str,
    campaign: &Campaign,
) -> bool {
    let Some(stored) = evaluator.storage.get(feature_key, &evaluator.user.id) else {
        return false;
    };
    let Some((_, experiment_key)) = stored.experiment() else {
        return false;
    };
    let Some(variation_id) = stored.experiment_variation() else {
        return false;
    };
    experiment_key == campaign.key
        && evaluator
            .settings
            .variation_by_campaign_key(experiment_key, variation_id)
            .is_some()
}

/// Equal weights, then bucket on `"<group_id>_<user>"`.
fn random_winner<'a>(
    mut candidates: Vec<Candidate<'a>>,
    group_id: i64,
    user_id: &str,
) -> Option<&'a Campaign> {
    let weight = round_to_four_decimals(100.0 / candidates.len() as f64);
    for candidate in &mut candidates {
        candidate.set_weight(weight);
    }
    bucket_candidates(candidates, group_id, user_id)
}

/// First candidate in priority order wins. Without a priority match, candidates listed in the
/// group weights are bucketed on those weights.
fn advanced_winner<'a>(
    candidates: Vec<Candidate<'a>>,
    priority: &[String],
    weights: &std::collections::HashMap<String, f64>,
    group_id: i64,
    user_id: &str,
) -> Option<&'a Campaign> {
    for member in priority {
        if let Some(candidate) = candidates.iter().find(|c| c.matches_member(member)) {
            return Some(candidate.campaign);
        }
    }

    let weighted: Vec<Candidate> = candidates
        .into_iter()
        .filter_map(|mut candidate| {
            let weight = weights
                .get(&candidate.campaign.id.to_string())
                .or_else(|| weights.get(&candidate.campaign.group_member_id()))?;
            candidate.set_weight(*weight);
            Some(candidate)
        })
        .collect();
    bucket_candidates(weighted, group_id, user_id)
}

fn bucket_candidates<'a>(
    mut candidates: Vec<Candidate<'a>>,
    group_id: i64,
    user_id: &str,
) -> Option<&'a Campaign> {
    allocation::assign_ranges(&mut candidates);
    let bucket = bucketer::bucket_for_string(&format!("{group_id}_{user_id}"));
    log::trace!(target: "vwo", group_id, user_id, bucket; "bucketing user within group");
    allocation::find_by_bucket(&candidates, bucket).map(|candidate| candidate.campaign)
}

fn round_to_four_decimals(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
