use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    decision::{DecisionReasons, DecisionResponse},
    project_config::{Experiment, Variation},
};

/// Manual per-user, per-experiment variation overrides.
///
/// Overrides supersede every computed decision and live as long as the table (they are never
/// persisted). Entries are keyed by `(user_id, experiment_id)`; writes to one key replace the
/// previous value atomically and never lock other keys.
#[derive(Debug, Default)]
pub struct OverrideTable {
    entries: DashMap<(String, String), String>,
}

impl OverrideTable {
    pub fn new() -> OverrideTable {
        OverrideTable::default()
    }

    /// Force `variation_key` for the user in `experiment`, or remove the override when
    /// `variation_key` is `None`.
    ///
    /// Returns `false` without changing anything if `user_id` is empty or the experiment has no
    /// variation with the given key.
    pub fn set(&self, experiment: &Experiment, user_id: &str, variation_key: Option<&str>) -> bool {
        if user_id.is_empty() {
            log::warn!(target: "flagcore",
                       experiment_key:display = experiment.key;
                       "refusing to set an override for an empty user id");
            return false;
        }

        let key = (user_id.to_owned(), experiment.id.clone());

        let Some(variation_key) = variation_key else {
            if self.entries.remove(&key).is_some() {
                log::debug!(target: "flagcore",
                            user_id,
                            experiment_key:display = experiment.key;
                            "removed override");
            }
            return true;
        };

        let Some(variation) = experiment.variation_by_key(variation_key) else {
            log::warn!(target: "flagcore",
                       user_id,
                       experiment_key:display = experiment.key,
                       variation_key;
                       "refusing to set an override to a variation that is not in the experiment");
            return false;
        };

        self.entries.insert(key, variation.id.clone());
        log::debug!(target: "flagcore",
                    user_id,
                    experiment_key:display = experiment.key,
                    variation_key;
                    "set override");
        true
    }

    /// The overriding variation for the user in `experiment`, if any.
    pub fn get(&self, experiment: &Experiment, user_id: &str) -> DecisionResponse<Option<Arc<Variation>>> {
        let mut reasons = DecisionReasons::new();

        let Some(variation_id) = self.get_variation_id(experiment, user_id) else {
            return DecisionResponse::new(None, reasons);
        };

        let variation = experiment.variation_by_id(&variation_id).cloned();
        match &variation {
            Some(variation) => reasons.info(format!(
                "Variation \"{}\" is mapped to experiment \"{}\" and user \"{user_id}\" in the forced variation map",
                variation.key, experiment.key
            )),
            None => reasons.error(format!(
                "Overridden variation \"{variation_id}\" of experiment \"{}\" for user \"{user_id}\" is no longer in the datafile.",
                experiment.key
            )),
        }
        DecisionResponse::new(variation, reasons)
    }

    pub fn get_variation_id(&self, experiment: &Experiment, user_id: &str) -> Option<String> {
        if user_id.is_empty() {
            return None;
        }
        self.entries
            .get(&(user_id.to_owned(), experiment.id.clone()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
