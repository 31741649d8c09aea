//! Sticky bucketing: persisted per-user decisions, loaded and saved through a pluggable service.
use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};

use crate::{
    decision::{DecisionReasons, DecisionResponse},
    project_config::{Experiment, Variation},
};

/// Error type returned by gateway implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Storage for previously computed decisions, implemented by the application.
///
/// Profiles are exchanged as JSON objects of the form
/// `{"user_id": "...", "experiment_bucket_map": {"<experiment id>": {"variation_id": "..."}}}`.
/// Data returned from `lookup` is validated before use; anything malformed is treated as an empty
/// profile. Errors are logged and recorded as reasons but never fail a decision.
pub trait UserProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<Map<String, Value>>, BoxError>;
    fn save(&self, profile: Map<String, Value>) -> Result<(), BoxError>;
}

impl<T: UserProfileService + ?Sized> UserProfileService for Arc<T> {
    fn lookup(&self, user_id: &str) -> Result<Option<Map<String, Value>>, BoxError> {
        (**self).lookup(user_id)
    }

    fn save(&self, profile: Map<String, Value>) -> Result<(), BoxError> {
        (**self).save(profile)
    }
}

impl<T: UserProfileService + ?Sized> UserProfileService for Box<T> {
    fn lookup(&self, user_id: &str) -> Result<Option<Map<String, Value>>, BoxError> {
        (**self).lookup(user_id)
    }

    fn save(&self, profile: Map<String, Value>) -> Result<(), BoxError> {
        (**self).save(profile)
    }
}

pub const USER_ID_KEY: &str = "user_id";
pub const EXPERIMENT_BUCKET_MAP_KEY: &str = "experiment_bucket_map";
pub const VARIATION_ID_KEY: &str = "variation_id";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    /// Experiment id to variation id.
    pub experiment_bucket_map: HashMap<String, String>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            experiment_bucket_map: HashMap::new(),
        }
    }

    /// Validate and convert a stored profile. `None` if the map does not have the expected shape.
    pub fn from_map(map: &Map<String, Value>) -> Option<UserProfile> {
        let user_id = map.get(USER_ID_KEY)?.as_str()?;
        let bucket_map = map.get(EXPERIMENT_BUCKET_MAP_KEY)?.as_object()?;

        let experiment_bucket_map = bucket_map
            .iter()
            .map(|(experiment_id, decision)| {
                let variation_id = decision.as_object()?.get(VARIATION_ID_KEY)?.as_str()?;
                Some((experiment_id.clone(), variation_id.to_owned()))
            })
            .collect::<Option<HashMap<_, _>>>()?;

        Some(UserProfile {
            user_id: user_id.to_owned(),
            experiment_bucket_map,
        })
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let bucket_map = self
            .experiment_bucket_map
            .iter()
            .map(|(experiment_id, variation_id)| {
                let mut decision = Map::new();
                decision.insert(VARIATION_ID_KEY.to_owned(), variation_id.clone().into());
                (experiment_id.clone(), Value::Object(decision))
            })
            .collect::<Map<_, _>>();

        let mut map = Map::new();
        map.insert(USER_ID_KEY.to_owned(), self.user_id.clone().into());
        map.insert(EXPERIMENT_BUCKET_MAP_KEY.to_owned(), Value::Object(bucket_map));
        map
    }
}

/// Profile state of one user during one resolution call.
///
/// The profile is loaded on first use and saved at most once, and only if a decision was added.
pub(crate) struct UserProfileTracker<'a> {
    user_id: &'a str,
    service: &'a dyn UserProfileService,
    profile: Option<UserProfile>,
    updated: bool,
}

impl<'a> UserProfileTracker<'a> {
    pub(crate) fn new(user_id: &'a str, service: &'a dyn UserProfileService) -> Self {
        UserProfileTracker {
            user_id,
            service,
            profile: None,
            updated: false,
        }
    }

    /// Load the profile unless already loaded. Always leaves `self.profile` set.
    fn load(&mut self) -> DecisionReasons {
        let mut reasons = DecisionReasons::new();
        if self.profile.is_some() {
            return reasons;
        }

        let loaded = match self.service.lookup(self.user_id) {
            Ok(None) => {
                reasons.info("We were unable to get a user profile map from the UserProfileService.");
                None
            }
            Ok(Some(map)) => {
                let profile = UserProfile::from_map(&map);
                if profile.is_none() {
                    reasons.warn("The UserProfileService returned an invalid map.");
                }
                profile
            }
            Err(err) => {
                reasons.error(format!(
                    "Failed to look up the user profile of user \"{}\": {err}",
                    self.user_id
                ));
                None
            }
        };
        self.profile = Some(loaded.unwrap_or_else(|| UserProfile::new(self.user_id)));
        reasons
    }

    /// The stored variation of `experiment`, if it still exists in configuration.
    pub(crate) fn stored_variation(
        &mut self,
        experiment: &Experiment,
    ) -> DecisionResponse<Option<Arc<Variation>>> {
        let mut reasons = self.load();
        let user_id = self.user_id;
        let variation_id = self
            .profile
            .as_ref()
            .and_then(|profile| profile.experiment_bucket_map.get(&experiment.id))
            .cloned();

        let Some(variation_id) = variation_id else {
            reasons.info(format!(
                "No previously activated variation of experiment \"{}\" for user \"{user_id}\" found in user profile.",
                experiment.key
            ));
            return DecisionResponse::new(None, reasons);
        };

        let variation = experiment.variation_by_id(&variation_id).cloned();
        match &variation {
            Some(variation) => reasons.info(format!(
                "Returning previously activated variation \"{}\" of experiment \"{}\" for user \"{user_id}\" from user profile.",
                variation.key, experiment.key
            )),
            None => reasons.info(format!(
                "User \"{user_id}\" was previously bucketed into variation with ID \"{variation_id}\" for experiment \"{}\", but no matching variation was found for that user. We will re-bucket the user.",
                experiment.key
            )),
        }
        DecisionResponse::new(variation, reasons)
    }

    /// Record a computed decision. Written back by [`UserProfileTracker::save`].
    pub(crate) fn update(&mut self, experiment: &Experiment, variation: &Variation) -> DecisionReasons {
        let reasons = self.load();
        let user_id = self.user_id;
        if let Some(profile) = self.profile.as_mut() {
            profile
                .experiment_bucket_map
                .insert(experiment.id.clone(), variation.id.clone());
            self.updated = true;
            log::info!(target: "flagcore",
                       user_id,
                       experiment_key:display = experiment.key,
                       variation_key:display = variation.key;
                       "updated user profile");
        }
        reasons
    }

    /// Save the profile if any decision was recorded.
    pub(crate) fn save(self) -> DecisionReasons {
        let mut reasons = DecisionReasons::new();
        if !self.updated {
            return reasons;
        }
        let Some(profile) = self.profile else {
            return reasons;
        };

        match self.service.save(profile.to_map()) {
            Ok(()) => log::info!(target: "flagcore",
                                 user_id = self.user_id;
                                 "saved user profile"),
            Err(err) => reasons.error(format!(
                "Failed to save the user profile of user \"{}\": {err}",
                self.user_id
            )),
        }
        reasons
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{json, Map, Value};

    use super::*;
    use crate::decision::DecisionReasons;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn validates_shape() {
        let valid = map(json!({
            "user_id": "user",
            "experiment_bucket_map": {"e1": {"variation_id": "v1"}}
        }));
        let profile = UserProfile::from_map(&valid).unwrap();
        assert_eq!(profile.experiment_bucket_map["e1"], "v1");
        assert_eq!(UserProfile::from_map(&profile.to_map()), Some(profile));

        for invalid in [
            json!({"experiment_bucket_map": {}}),
            json!({"user_id": 5, "experiment_bucket_map": {}}),
            json!({"user_id": "user"}),
            json!({"user_id": "user", "experiment_bucket_map": []}),
            json!({"user_id": "user", "experiment_bucket_map": {"e1": "v1"}}),
            json!({"user_id": "user", "experiment_bucket_map": {"e1": {"id": "v1"}}}),
            json!({"user_id": "user", "experiment_bucket_map": {"e1": {"variation_id": 1}}}),
        ] {
            assert_eq!(UserProfile::from_map(&map(invalid.clone())), None, "{invalid}");
        }
    }

    #[derive(Default)]
    struct RecordingService {
        stored: Option<Map<String, Value>>,
        lookups: Mutex<usize>,
        saved: Mutex<Vec<Map<String, Value>>>,
    }

    impl UserProfileService for RecordingService {
        fn lookup(&self, _user_id: &str) -> Result<Option<Map<String, Value>>, BoxError> {
            *self.lookups.lock().unwrap() += 1;
            Ok(self.stored.clone())
        }

        fn save(&self, profile: Map<String, Value>) -> Result<(), BoxError> {
            self.saved.lock().unwrap().push(profile);
            Ok(())
        }
    }

    struct FailingService;

    impl UserProfileService for FailingService {
        fn lookup(&self, _user_id: &str) -> Result<Option<Map<String, Value>>, BoxError> {
            Err("storage unavailable".into())
        }

        fn save(&self, _profile: Map<String, Value>) -> Result<(), BoxError> {
            Err("storage unavailable".into())
        }
    }

    fn experiment() -> Experiment {
        serde_json::from_value(json!({
            "id": "e1", "key": "exp", "status": "Running",
            "variations": [{"id": "v1", "key": "control"}],
            "trafficAllocation": []
        }))
        .unwrap()
    }

    #[test]
    fn loads_once_and_saves_once() {
        let service = RecordingService::default();
        let experiment = experiment();
        let mut reasons = DecisionReasons::new();

        let mut tracker = UserProfileTracker::new("user", &service);
        assert!(tracker.stored_variation(&experiment).unpack(&mut reasons).is_none());
        assert!(tracker.stored_variation(&experiment).unpack(&mut reasons).is_none());
        let variation = experiment.variation_by_id("v1").unwrap().clone();
        reasons.merge(tracker.update(&experiment, &variation));
        assert_eq!(
            tracker.stored_variation(&experiment).result.unwrap().id,
            "v1"
        );
        reasons.merge(tracker.save());

        assert_eq!(*service.lookups.lock().unwrap(), 1);
        let saved = service.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(
            UserProfile::from_map(&saved[0]).unwrap().experiment_bucket_map["e1"],
            "v1"
        );
    }

    #[test]
    fn no_save_without_updates() {
        let service = RecordingService::default();
        let mut reasons = DecisionReasons::new();

        let mut tracker = UserProfileTracker::new("user", &service);
        tracker.stored_variation(&experiment()).unpack(&mut reasons);
        reasons.merge(tracker.save());

        assert!(service.saved.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_profile_is_empty() {
        let service = RecordingService {
            stored: Some(map(json!({"user_id": "user", "experiment_bucket_map": {"e1": 1}}))),
            ..RecordingService::default()
        };
        let mut reasons = DecisionReasons::new();

        let mut tracker = UserProfileTracker::new("user", &service);
        assert!(tracker.stored_variation(&experiment()).unpack(&mut reasons).is_none());
        assert!(reasons
            .messages()
            .contains(&"The UserProfileService returned an invalid map."));
        assert!(!reasons.has_errors());
    }

    #[test]
    fn dangling_variation_is_ignored() {
        let service = RecordingService {
            stored: Some(map(json!({
                "user_id": "user",
                "experiment_bucket_map": {"e1": {"variation_id": "deleted"}}
            }))),
            ..RecordingService::default()
        };
        let mut reasons = DecisionReasons::new();

        let mut tracker = UserProfileTracker::new("user", &service);
        assert!(tracker.stored_variation(&experiment()).unpack(&mut reasons).is_none());
        assert!(!reasons.has_errors());
    }

    #[test]
    fn service_errors_become_reasons() {
        let experiment = experiment();
        let mut reasons = DecisionReasons::new();

        let mut tracker = UserProfileTracker::new("user", &FailingService);
        assert!(tracker.stored_variation(&experiment).unpack(&mut reasons).is_none());
        let variation = experiment.variation_by_id("v1").unwrap().clone();
        reasons.merge(tracker.update(&experiment, &variation));
        reasons.merge(tracker.save());

        assert_eq!(reasons.to_report(false).len(), 2);
    }
}
