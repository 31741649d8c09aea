//! Read-only configuration entities and the indexes resolution needs.
mod models;

use std::{collections::HashMap, sync::Arc};

pub use models::{
    Attribute, Audience, Cmab, Datafile, Experiment, ExperimentStatus, FeatureFlag,
    FeatureVariable, Group, GroupPolicy, Holdout, Rollout, TrafficAllocation, VariableUsage,
    Variation,
};

use crate::Result;

/// Indexed configuration that decisions are resolved against.
///
/// Built once from a [`Datafile`] and never mutated afterwards, so it can be shared between
/// threads (e.g., in an `Arc`). Indexing does not validate references: a flag pointing at a
/// missing experiment or an experiment pointing at a missing audience is only noticed, and
/// tolerated, during resolution.
#[derive(Debug, Default)]
pub struct ProjectConfig {
    revision: Option<String>,
    send_flag_decisions: bool,

    experiments_by_id: HashMap<String, Arc<Experiment>>,
    experiments_by_key: HashMap<String, Arc<Experiment>>,
    groups_by_id: HashMap<String, Arc<Group>>,
    /// Flags in datafile order.
    flags: Vec<Arc<FeatureFlag>>,
    flags_by_key: HashMap<String, Arc<FeatureFlag>>,
    rollouts_by_id: HashMap<String, Arc<Rollout>>,
    audiences_by_id: HashMap<String, Arc<Audience>>,
    attributes_by_id: HashMap<String, Attribute>,
    attributes_by_key: HashMap<String, Attribute>,
    /// Every variation reachable from a flag's experiments and rollout rules, by flag key.
    flag_variations: HashMap<String, Vec<Arc<Variation>>>,

    global_holdouts: Vec<Arc<Holdout>>,
    included_holdouts: HashMap<String, Vec<Arc<Holdout>>>,
}

impl ProjectConfig {
    /// Parse and index a JSON datafile.
    ///
    /// ```
    /// # use flagcore::ProjectConfig;
    /// let config = ProjectConfig::from_json(r#"{"revision": "42", "experiments": []}"#).unwrap();
    /// assert_eq!(config.revision(), Some("42"));
    /// ```
    pub fn from_json(json: &str) -> Result<ProjectConfig> {
        let datafile: Datafile = serde_json::from_str(json).inspect_err(|err| {
            log::warn!(target: "flagcore", "failed to parse datafile: {err}");
        })?;
        Ok(ProjectConfig::from_datafile(datafile))
    }

    pub fn from_datafile(datafile: Datafile) -> ProjectConfig {
        let mut config = ProjectConfig {
            revision: datafile.revision,
            send_flag_decisions: datafile.send_flag_decisions,
            ..ProjectConfig::default()
        };

        for experiment in datafile.experiments {
            config.add_experiment(Arc::new(experiment));
        }

        for mut group in datafile.groups {
            for mut experiment in std::mem::take(&mut group.experiments) {
                experiment.group_id.get_or_insert_with(|| group.id.clone());
                let experiment = Arc::new(experiment);
                config.add_experiment(experiment.clone());
                group.experiments.push((*experiment).clone());
            }
            config.groups_by_id.insert(group.id.clone(), Arc::new(group));
        }

        for rollout in datafile.rollouts {
            for rule in &rollout.experiments {
                config
                    .experiments_by_id
                    .entry(rule.id.clone())
                    .or_insert_with(|| rule.clone());
            }
            config
                .rollouts_by_id
                .insert(rollout.id.clone(), Arc::new(rollout));
        }

        for audience in datafile.audiences.into_iter().chain(datafile.typed_audiences) {
            config
                .audiences_by_id
                .insert(audience.id.clone(), Arc::new(audience));
        }

        for attribute in datafile.attributes {
            config
                .attributes_by_key
                .insert(attribute.key.clone(), attribute.clone());
            config.attributes_by_id.insert(attribute.id.clone(), attribute);
        }

        for flag in datafile.feature_flags {
            let flag = Arc::new(flag);
            let variations = config.collect_flag_variations(&flag);
            config.flag_variations.insert(flag.key.clone(), variations);
            config.flags_by_key.insert(flag.key.clone(), flag.clone());
            config.flags.push(flag);
        }

        for holdout in datafile.holdouts {
            let holdout = Arc::new(holdout);
            if holdout.is_global() {
                config.global_holdouts.push(holdout);
            } else {
                for flag_id in &holdout.included_flags {
                    config
                        .included_holdouts
                        .entry(flag_id.clone())
                        .or_default()
                        .push(holdout.clone());
                }
            }
        }

        log::debug!(target: "flagcore",
                    revision:? = config.revision,
                    experiments = config.experiments_by_key.len(),
                    flags = config.flags.len();
                    "indexed project config");

        config
    }

    fn add_experiment(&mut self, experiment: Arc<Experiment>) {
        self.experiments_by_id
            .insert(experiment.id.clone(), experiment.clone());
        self.experiments_by_key
            .insert(experiment.key.clone(), experiment);
    }

    fn collect_flag_variations(&self, flag: &FeatureFlag) -> Vec<Arc<Variation>> {
        let experiments = flag
            .experiment_ids
            .iter()
            .filter_map(|id| self.experiments_by_id.get(id));
        let rules = self
            .rollouts_by_id
            .get(&flag.rollout_id)
            .into_iter()
            .flat_map(|rollout| rollout.experiments.iter());

        let mut variations: Vec<Arc<Variation>> = Vec::new();
        for rule in experiments.chain(rules) {
            for variation in &rule.variations {
                if !variations.iter().any(|v| v.id == variation.id) {
                    variations.push(variation.clone());
                }
            }
        }
        variations
    }

    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Whether decisions that did not come from an experiment should still be reported.
    pub fn send_flag_decisions(&self) -> bool {
        self.send_flag_decisions
    }

    /// Experiments (including group members and rollout rules) by id.
    pub fn experiment_by_id(&self, id: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_id.get(id)
    }

    /// Experiments (including group members, excluding rollout rules) by key.
    pub fn experiment_by_key(&self, key: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_key.get(key)
    }

    pub fn group_by_id(&self, id: &str) -> Option<&Arc<Group>> {
        self.groups_by_id.get(id)
    }

    pub fn flag_by_key(&self, key: &str) -> Option<&Arc<FeatureFlag>> {
        self.flags_by_key.get(key)
    }

    /// All flags in datafile order.
    pub fn flags(&self) -> impl Iterator<Item = &Arc<FeatureFlag>> {
        self.flags.iter()
    }

    pub fn rollout_by_id(&self, id: &str) -> Option<&Arc<Rollout>> {
        self.rollouts_by_id.get(id)
    }

    pub fn audience_by_id(&self, id: &str) -> Option<&Arc<Audience>> {
        self.audiences_by_id.get(id)
    }

    pub fn attribute_by_id(&self, id: &str) -> Option<&Attribute> {
        self.attributes_by_id.get(id)
    }

    pub fn attribute_by_key(&self, key: &str) -> Option<&Attribute> {
        self.attributes_by_key.get(key)
    }

    /// Variation of any experiment or rollout rule attached to the flag.
    pub fn flag_variation_by_key(&self, flag_key: &str, variation_key: &str) -> Option<&Arc<Variation>> {
        self.flag_variations
            .get(flag_key)?
            .iter()
            .find(|variation| variation.key == variation_key)
    }

    /// Holdouts applying to the flag, in evaluation order: global holdouts not excluding the
    /// flag, then holdouts that explicitly include it.
    pub fn holdouts_for_flag(&self, flag_id: &str) -> Vec<Arc<Holdout>> {
        let global = self
            .global_holdouts
            .iter()
            .filter(|holdout| !holdout.excluded_flags.iter().any(|id| id == flag_id));
        let included = self.included_holdouts.get(flag_id).into_iter().flatten();
        global.chain(included).cloned().collect()
    }
}
