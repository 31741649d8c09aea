use std::{collections::HashMap, sync::Arc};

use serde::{de, Deserialize, Deserializer};

use crate::audience::{AudienceRef, ConditionNode, UserCondition};

/// Raw datafile as delivered by the backend. Turned into a [`ProjectConfig`](super::ProjectConfig)
/// by indexing.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datafile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
    #[serde(default)]
    pub holdouts: Vec<Holdout>,
    #[serde(default)]
    pub audiences: Vec<Audience>,
    /// Audiences using condition types the legacy `audiences` list cannot express. Take
    /// precedence over entries of `audiences` with the same id.
    #[serde(default)]
    pub typed_audiences: Vec<Audience>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub send_flag_decisions: bool,
}

/// Range entry of an ordered traffic allocation.
///
/// An entry covers bucket values below `end_of_range` not covered by a previous entry. An empty
/// `entity_id` marks traffic that is deliberately left unallocated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    pub entity_id: String,
    pub end_of_range: u32,
}

impl TrafficAllocation {
    pub fn new(entity_id: impl Into<String>, end_of_range: u32) -> TrafficAllocation {
        TrafficAllocation {
            entity_id: entity_id.into(),
            end_of_range,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentStatus {
    Running,
    Launched,
    Paused,
    NotStarted,
    Archived,
    Draft,
    Concluded,
}

impl<'de> Deserialize<'de> for ExperimentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let status = String::deserialize(deserializer)?;
        Ok(match status.as_str() {
            "Running" => ExperimentStatus::Running,
            "Launched" => ExperimentStatus::Launched,
            "Paused" => ExperimentStatus::Paused,
            "Archived" => ExperimentStatus::Archived,
            "Draft" => ExperimentStatus::Draft,
            "Concluded" => ExperimentStatus::Concluded,
            // "Not started" and anything unrecognized.
            _ => ExperimentStatus::NotStarted,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUsage {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: bool,
    #[serde(default)]
    pub variables: Vec<VariableUsage>,
}

impl Variation {
    pub fn variable_value(&self, variable_id: &str) -> Option<&str> {
        self.variables
            .iter()
            .find(|usage| usage.id == variable_id)
            .map(|usage| usage.value.as_str())
    }
}

/// Marks an experiment as controlled by a contextual multi-armed bandit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cmab {
    /// Ids of the attributes the bandit service receives.
    #[serde(default)]
    pub attribute_ids: Vec<String>,
    /// Share of traffic (out of 10000) that is eligible for the bandit.
    pub traffic_allocation: u32,
}

/// An experiment, a rollout rule, or the experiment part of a holdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub layer_id: String,
    /// Set for members of a mutually-exclusive group. Filled in from the group when the
    /// experiment is listed inside it.
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    #[serde(default)]
    pub audience_conditions: Option<ConditionNode<AudienceRef>>,
    pub variations: Vec<Arc<Variation>>,
    pub traffic_allocation: Vec<TrafficAllocation>,
    /// Static whitelist: user id to variation key.
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[serde(default)]
    pub cmab: Option<Cmab>,
}

impl Experiment {
    /// Experiments and rules are only served while running or launched.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ExperimentStatus::Running | ExperimentStatus::Launched
        )
    }

    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }

    pub fn variation_by_id(&self, id: &str) -> Option<&Arc<Variation>> {
        self.variations.iter().find(|variation| variation.id == id)
    }

    pub fn variation_by_key(&self, key: &str) -> Option<&Arc<Variation>> {
        self.variations.iter().find(|variation| variation.key == key)
    }
}

/// Flag-level holdout: an experiment evaluated before any other rule of the flags it applies to.
///
/// A holdout with no `included_flags` is global and applies to every flag except the excluded
/// ones.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holdout {
    #[serde(flatten)]
    pub experiment: Arc<Experiment>,
    #[serde(default)]
    pub included_flags: Vec<String>,
    #[serde(default)]
    pub excluded_flags: Vec<String>,
}

impl Holdout {
    pub fn is_global(&self) -> bool {
        self.included_flags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Users are hashed into at most one member experiment.
    Random,
    Overlapping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub policy: GroupPolicy,
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVariable {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: String,
    /// `"json"` for JSON variables declared with type `"string"`.
    #[serde(default)]
    pub sub_type: Option<String>,
    pub default_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rollout_id: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<FeatureVariable>,
}

/// Ordered delivery rules of a flag. The last rule is the "Everyone Else" catch-all.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<Arc<Experiment>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audience {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(deserialize_with = "deserialize_audience_conditions")]
    pub conditions: ConditionNode<UserCondition>,
}

/// Legacy audiences carry their condition tree as a JSON-encoded string, typed audiences as a
/// plain JSON value. Accept both.
fn deserialize_audience_conditions<'de, D>(
    deserializer: D,
) -> Result<ConditionNode<UserCondition>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let value = match value {
        serde_json::Value::String(encoded) => {
            serde_json::from_str(&encoded).map_err(de::Error::custom)?
        }
        other => other,
    };
    ConditionNode::from_json(&value).map_err(de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub id: String,
    pub key: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_status_is_not_started() {
        let status: ExperimentStatus = serde_json::from_value(json!("Not started")).unwrap();
        assert_eq!(status, ExperimentStatus::NotStarted);
        let status: ExperimentStatus = serde_json::from_value(json!("Whatever")).unwrap();
        assert_eq!(status, ExperimentStatus::NotStarted);
    }

    #[test]
    fn parses_holdout() {
        let holdout: Holdout = serde_json::from_value(json!({
            "id": "h1",
            "key": "holdout",
            "status": "Running",
            "variations": [{"id": "hv", "key": "off", "featureEnabled": false}],
            "trafficAllocation": [{"entityId": "hv", "endOfRange": 500}],
            "excludedFlags": ["f2"]
        }))
        .unwrap();

        assert!(holdout.is_global());
        assert!(holdout.experiment.is_running());
        assert_eq!(holdout.excluded_flags, vec!["f2".to_owned()]);
        assert_eq!(
            holdout.experiment.traffic_allocation,
            vec![TrafficAllocation::new("hv", 500)]
        );
    }

    #[test]
    fn parses_cmab_marker() {
        let experiment: Experiment = serde_json::from_value(json!({
            "id": "e1",
            "key": "bandit",
            "status": "Running",
            "variations": [],
            "trafficAllocation": [],
            "cmab": {"attributeIds": ["a1"], "trafficAllocation": 5000}
        }))
        .unwrap();

        assert_eq!(
            experiment.cmab,
            Some(Cmab {
                attribute_ids: vec!["a1".to_owned()],
                traffic_allocation: 5000
            })
        );
    }
}
