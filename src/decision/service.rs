use std::{collections::HashMap, sync::Arc};

use crate::{
    audience::does_user_meet_audience_conditions,
    bucketer::{Bucketer, Sharder},
    cmab::CmabService,
    project_config::{Cmab, Experiment, FeatureFlag, Holdout, ProjectConfig, Variation},
    user_profile::{UserProfileService, UserProfileTracker},
    DecisionServiceConfig, Error, OverrideTable, Result, UserContext,
};

use super::{
    DecideOption, DecideOptions, DecisionReasons, DecisionResponse, DecisionSource,
    FeatureDecision, FlagDecision, RuleType, VariationDecision,
};

/// Resolves experiments and flags for users.
///
/// Resolution is synchronous and never fails: every anomaly is recorded as a reason and yields a
/// decision without a variation. The only long-lived mutable state is the [`OverrideTable`], so
/// a single instance can be shared between threads (e.g., in an `Arc`).
///
/// In order to create a `DecisionService`, first create a [`DecisionServiceConfig`].
///
/// # Examples
/// ```
/// # use flagcore::{DecisionServiceConfig, ProjectConfig, UserContext, Attributes};
/// # use flagcore::decision::DecideOptions;
/// let service = DecisionServiceConfig::new().to_decision_service();
/// let config = ProjectConfig::from_json(r#"{"featureFlags": []}"#).unwrap();
/// let user = UserContext::new("user-1", Attributes::new());
///
/// let decision = service.decide("unknown_flag", &user, &config, &DecideOptions::new());
/// assert!(decision.error);
/// assert!(!decision.enabled);
/// ```
pub struct DecisionService {
    bucketer: Bucketer<Box<dyn Sharder + Send + Sync>>,
    overrides: OverrideTable,
    user_profile_service: Option<Box<dyn UserProfileService + Send + Sync>>,
    cmab_service: Option<Box<dyn CmabService + Send + Sync>>,
    default_decide_options: DecideOptions,
}

impl DecisionService {
    /// Create a new `DecisionService` using the specified configuration.
    pub fn new(config: DecisionServiceConfig) -> DecisionService {
        DecisionService {
            bucketer: Bucketer::new(config.sharder),
            overrides: OverrideTable::new(),
            user_profile_service: config.user_profile_service,
            cmab_service: config.cmab_service,
            default_decide_options: config.default_decide_options,
        }
    }

    pub fn overrides(&self) -> &OverrideTable {
        &self.overrides
    }

    /// Force a variation of the experiment with key `experiment_key` for `user_id`, or remove the
    /// override if `variation_key` is `None`. See [`OverrideTable::set`].
    pub fn set_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
        variation_key: Option<&str>,
    ) -> bool {
        let Some(experiment) = config.experiment_by_key(experiment_key) else {
            log::warn!(target: "flagcore",
                       experiment_key,
                       user_id;
                       "cannot set an override for an unknown experiment");
            return false;
        };
        self.overrides.set(experiment, user_id, variation_key)
    }

    pub fn get_forced_variation(
        &self,
        config: &ProjectConfig,
        experiment_key: &str,
        user_id: &str,
    ) -> Option<Arc<Variation>> {
        let experiment = config.experiment_by_key(experiment_key)?;
        self.overrides.get(experiment, user_id).result
    }

    /// Resolve the variation of a single experiment.
    ///
    /// Returns an error only if no experiment with `experiment_key` exists.
    pub fn get_variation(
        &self,
        experiment_key: &str,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> Result<VariationDecision> {
        let experiment = config
            .experiment_by_key(experiment_key)
            .ok_or_else(|| Error::UnknownExperiment(experiment_key.to_owned()))
            .inspect_err(|err| {
                log::warn!(target: "flagcore",
                           experiment_key,
                           user_id = user.user_id();
                           "{err}");
            })?;

        let options = self.default_decide_options.union(options);
        let mut tracker = self.tracker(user, &options);
        let mut decision =
            self.resolve_experiment(experiment, user, config, &options, tracker.as_mut());
        if let Some(tracker) = tracker {
            decision.reasons.merge(tracker.save());
        }

        log::debug!(target: "flagcore",
                    experiment_key,
                    user_id = user.user_id(),
                    variation_key:? = decision.variation_key(),
                    source:? = decision.source;
                    "resolved experiment");
        Ok(decision)
    }

    /// Resolve which rule of a flag serves the user, and with which variation.
    ///
    /// Returns an error only if no flag with `flag_key` exists.
    pub fn get_variation_for_feature(
        &self,
        flag_key: &str,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> Result<FeatureDecision> {
        let flag = config
            .flag_by_key(flag_key)
            .ok_or_else(|| Error::UnknownFlag(flag_key.to_owned()))?;
        let options = self.default_decide_options.union(options);
        Ok(self.decide_feature(flag, user, config, &options))
    }

    /// Decide a flag for the user.
    ///
    /// An unknown flag key produces a decision with `error` set and no variation.
    pub fn decide(
        &self,
        flag_key: &str,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> FlagDecision {
        let options = self.default_decide_options.union(options);
        let Some(flag) = config.flag_by_key(flag_key) else {
            return FlagDecision::unknown_flag(flag_key, user);
        };

        let decision = self.decide_feature(flag, user, config, &options);
        let decision = FlagDecision::new(flag, decision, user, config, &options);
        log_decision(&decision);
        decision
    }

    /// Decide several flags at once, sharing one profile lookup and save.
    ///
    /// With [`DecideOption::EnabledFlagsOnly`] disabled flags are left out of the result.
    pub fn decide_for_keys(
        &self,
        flag_keys: &[&str],
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> HashMap<String, FlagDecision> {
        let options = self.default_decide_options.union(options);
        let enabled_only = options.contains(DecideOption::EnabledFlagsOnly);

        let mut tracker = self.tracker(user, &options);
        let resolved = flag_keys
            .iter()
            .map(|&flag_key| match config.flag_by_key(flag_key) {
                Some(flag) => Ok((
                    flag,
                    self.resolve_flag(flag, user, config, &options, tracker.as_mut()),
                )),
                None => Err(flag_key),
            })
            .collect::<Vec<_>>();
        let save_reasons = tracker.map(UserProfileTracker::save).unwrap_or_default();

        resolved
            .into_iter()
            .map(|resolved| match resolved {
                Ok((flag, mut decision)) => {
                    decision.reasons.merge(save_reasons.clone());
                    FlagDecision::new(flag, decision, user, config, &options)
                }
                Err(flag_key) => FlagDecision::unknown_flag(flag_key, user),
            })
            .inspect(log_decision)
            .filter(|decision| !enabled_only || decision.enabled)
            .map(|decision| (decision.flag_key.clone(), decision))
            .collect()
    }

    /// Decide every flag in configuration.
    pub fn decide_all(
        &self,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> HashMap<String, FlagDecision> {
        let flag_keys = config
            .flags()
            .map(|flag| flag.key.as_str())
            .collect::<Vec<_>>();
        self.decide_for_keys(&flag_keys, user, config, options)
    }

    /// Profile tracker for one call, unless sticky bucketing is unavailable or bypassed.
    fn tracker<'a>(
        &'a self,
        user: &'a UserContext,
        options: &DecideOptions,
    ) -> Option<UserProfileTracker<'a>> {
        if options.ignore_user_profile() {
            return None;
        }
        let service = self.user_profile_service.as_deref()?;
        Some(UserProfileTracker::new(user.user_id(), service))
    }

    fn decide_feature(
        &self,
        flag: &FeatureFlag,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> FeatureDecision {
        let mut tracker = self.tracker(user, options);
        let mut decision = self.resolve_flag(flag, user, config, options, tracker.as_mut());
        if let Some(tracker) = tracker {
            decision.reasons.merge(tracker.save());
        }
        decision
    }

    /// The experiment pipeline: active check, override, whitelist, sticky, audience gate and
    /// assignment. The first stage producing a variation wins.
    fn resolve_experiment(
        &self,
        experiment: &Experiment,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
        mut tracker: Option<&mut UserProfileTracker<'_>>,
    ) -> VariationDecision {
        let mut reasons = DecisionReasons::new();
        let user_id = user.user_id();

        if !experiment.is_active() {
            reasons.info(format!("Experiment \"{}\" is not running.", experiment.key));
            return VariationDecision::none(reasons);
        }

        if let Some(variation) = self.overrides.get(experiment, user_id).unpack(&mut reasons) {
            return VariationDecision::new(variation, DecisionSource::Override, reasons);
        }

        if let Some(variation) = whitelisted_variation(experiment, user_id).unpack(&mut reasons) {
            return VariationDecision::new(variation, DecisionSource::Whitelist, reasons);
        }

        if let Some(tracker) = tracker.as_deref_mut() {
            if let Some(variation) = tracker.stored_variation(experiment).unpack(&mut reasons) {
                return VariationDecision::new(variation, DecisionSource::Sticky, reasons);
            }
        }

        let qualified = does_user_meet_audience_conditions(
            experiment,
            config,
            user.attributes(),
            "experiment",
            &experiment.key,
        )
        .unpack(&mut reasons);
        if !qualified {
            reasons.info(format!(
                "User \"{user_id}\" does not meet conditions to be in experiment \"{}\".",
                experiment.key
            ));
            return VariationDecision::none(reasons);
        }

        let bucketing_id = user.bucketing_id().unpack(&mut reasons);
        let assignment = match (&experiment.cmab, &self.cmab_service) {
            (Some(cmab), Some(service)) => self.assign_by_cmab(
                experiment,
                cmab,
                &**service,
                bucketing_id,
                user,
                config,
                options,
            ),
            (Some(_), None) => {
                reasons.warn(format!(
                    "Experiment \"{}\" is controlled by a contextual bandit but no CMAB service is configured. Falling back to traffic allocation.",
                    experiment.key
                ));
                self.assign_by_hash(experiment, bucketing_id, config)
            }
            (None, _) => self.assign_by_hash(experiment, bucketing_id, config),
        };

        let VariationDecision {
            variation,
            source,
            error,
            cmab_uuid,
            reasons: assignment_reasons,
        } = assignment;
        reasons.merge(assignment_reasons);

        if let (Some(variation), Some(tracker)) = (&variation, tracker) {
            reasons.merge(tracker.update(experiment, variation));
        }

        VariationDecision {
            variation,
            source,
            error,
            cmab_uuid,
            reasons,
        }
    }

    fn assign_by_hash(
        &self,
        experiment: &Experiment,
        bucketing_id: &str,
        config: &ProjectConfig,
    ) -> VariationDecision {
        let DecisionResponse { result, reasons } =
            self.bucketer.bucket(experiment, bucketing_id, config);
        match result {
            Some(variation) => VariationDecision::new(variation, DecisionSource::Experiment, reasons),
            None => VariationDecision::none(reasons),
        }
    }

    /// Bandit assignment. Falling outside the bandit's traffic is terminal for the experiment;
    /// a gateway failure yields an error-flagged decision.
    #[allow(clippy::too_many_arguments)]
    fn assign_by_cmab(
        &self,
        experiment: &Experiment,
        cmab: &Cmab,
        service: &dyn CmabService,
        bucketing_id: &str,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> VariationDecision {
        let mut reasons = DecisionReasons::new();
        let user_id = user.user_id();

        let eligible = self
            .bucketer
            .bucket_for_cmab(experiment, cmab.traffic_allocation, bucketing_id, config)
            .unpack(&mut reasons);
        if eligible.is_none() {
            reasons.info(format!(
                "User \"{user_id}\" not in CMAB experiment \"{}\" due to traffic allocation.",
                experiment.key
            ));
            return VariationDecision::none(reasons);
        }

        let decision = match service.get_decision(config, user, &experiment.id, options) {
            Ok(decision) => decision,
            Err(err) => {
                log::warn!(target: "flagcore",
                           user_id,
                           experiment_key:display = experiment.key;
                           "contextual bandit decision failed: {err}");
                reasons.error(format!(
                    "Failed to fetch CMAB data for experiment {}.",
                    experiment.key
                ));
                return VariationDecision {
                    source: Some(DecisionSource::Cmab),
                    error: true,
                    ..VariationDecision::none(reasons)
                };
            }
        };

        let Some(variation) = experiment.variation_by_id(&decision.variation_id).cloned() else {
            reasons.error(format!(
                "CMAB returned variation \"{}\" which is not in experiment \"{}\".",
                decision.variation_id, experiment.key
            ));
            return VariationDecision {
                source: Some(DecisionSource::Cmab),
                error: true,
                cmab_uuid: Some(decision.cmab_uuid),
                ..VariationDecision::none(reasons)
            };
        };

        reasons.info(format!(
            "CMAB decision fetched for user \"{user_id}\" and experiment \"{}\": variation \"{}\".",
            experiment.key, variation.key
        ));
        VariationDecision {
            variation: Some(variation),
            source: Some(DecisionSource::Cmab),
            error: false,
            cmab_uuid: Some(decision.cmab_uuid),
            reasons,
        }
    }

    /// Holdouts go through the active check, the audience gate and hash assignment only.
    fn resolve_holdout(
        &self,
        holdout: &Holdout,
        user: &UserContext,
        config: &ProjectConfig,
    ) -> VariationDecision {
        let mut reasons = DecisionReasons::new();
        let experiment = &holdout.experiment;
        let user_id = user.user_id();

        if !experiment.is_running() {
            reasons.info(format!("Holdout \"{}\" is not running.", experiment.key));
            return VariationDecision::none(reasons);
        }

        let qualified = does_user_meet_audience_conditions(
            experiment,
            config,
            user.attributes(),
            "holdout",
            &experiment.key,
        )
        .unpack(&mut reasons);
        if !qualified {
            reasons.info(format!(
                "User \"{user_id}\" does not meet conditions for holdout \"{}\".",
                experiment.key
            ));
            return VariationDecision::none(reasons);
        }

        let bucketing_id = user.bucketing_id().unpack(&mut reasons);
        match self
            .bucketer
            .bucket(experiment, bucketing_id, config)
            .unpack(&mut reasons)
        {
            Some(variation) => {
                reasons.info(format!(
                    "User \"{user_id}\" is in variation \"{}\" of holdout \"{}\".",
                    variation.key, experiment.key
                ));
                VariationDecision::new(variation, DecisionSource::Holdout, reasons)
            }
            None => {
                reasons.info(format!(
                    "User \"{user_id}\" is not in holdout \"{}\".",
                    experiment.key
                ));
                VariationDecision::none(reasons)
            }
        }
    }

    /// Flag layering: flag-level forced decision, holdouts, experiment rules, rollout rules.
    fn resolve_flag(
        &self,
        flag: &FeatureFlag,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
        tracker: Option<&mut UserProfileTracker<'_>>,
    ) -> FeatureDecision {
        let mut reasons = DecisionReasons::new();

        let mut decision = forced_decision(&flag.key, None, user, config)
            .unpack(&mut reasons)
            .map(|variation| FeatureDecision {
                variation: Some(variation),
                source: Some(DecisionSource::ForcedDecision),
                ..FeatureDecision::default()
            });
        if decision.is_none() {
            decision = self.holdout_decision(flag, user, config).unpack(&mut reasons);
        }
        if decision.is_none() {
            decision = self
                .experiment_decision(flag, user, config, options, tracker)
                .unpack(&mut reasons);
        }
        if decision.is_none() {
            decision = self.rollout_decision(flag, user, config).unpack(&mut reasons);
        }

        match decision {
            Some(decision) => FeatureDecision { reasons, ..decision },
            None => FeatureDecision::none(reasons),
        }
    }

    fn holdout_decision(
        &self,
        flag: &FeatureFlag,
        user: &UserContext,
        config: &ProjectConfig,
    ) -> DecisionResponse<Option<FeatureDecision>> {
        let mut reasons = DecisionReasons::new();

        for holdout in config.holdouts_for_flag(&flag.id) {
            let mut decision = self.resolve_holdout(&holdout, user, config);
            reasons.merge(std::mem::take(&mut decision.reasons));
            if decision.variation.is_some() {
                let decision =
                    FeatureDecision::from_rule(&holdout.experiment, RuleType::Holdout, decision);
                return DecisionResponse::new(Some(decision), reasons);
            }
        }

        DecisionResponse::new(None, reasons)
    }

    /// Experiment rules in order. Stops at the first rule that produces a variation or an error.
    fn experiment_decision(
        &self,
        flag: &FeatureFlag,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
        mut tracker: Option<&mut UserProfileTracker<'_>>,
    ) -> DecisionResponse<Option<FeatureDecision>> {
        let mut reasons = DecisionReasons::new();

        for experiment_id in &flag.experiment_ids {
            let Some(experiment) = config.experiment_by_id(experiment_id) else {
                reasons.debug(format!(
                    "Experiment \"{experiment_id}\" of flag \"{}\" is not in the datafile.",
                    flag.key
                ));
                continue;
            };

            if let Some(variation) =
                forced_decision(&flag.key, Some(&experiment.key), user, config).unpack(&mut reasons)
            {
                let decision = FeatureDecision::from_rule(
                    experiment,
                    RuleType::Experiment,
                    VariationDecision::new(
                        variation,
                        DecisionSource::ForcedDecision,
                        DecisionReasons::new(),
                    ),
                );
                return DecisionResponse::new(Some(decision), reasons);
            }

            let mut decision = self.resolve_experiment(
                experiment,
                user,
                config,
                options,
                tracker.as_deref_mut(),
            );
            reasons.merge(std::mem::take(&mut decision.reasons));
            if decision.variation.is_some() || decision.error {
                let decision =
                    FeatureDecision::from_rule(experiment, RuleType::Experiment, decision);
                return DecisionResponse::new(Some(decision), reasons);
            }
        }

        DecisionResponse::new(None, reasons)
    }

    /// Rollout rules in order. A rule whose audience matches but whose traffic excludes the user
    /// jumps straight to the last ("Everyone Else") rule; an audience mismatch moves on to the
    /// next rule.
    fn rollout_decision(
        &self,
        flag: &FeatureFlag,
        user: &UserContext,
        config: &ProjectConfig,
    ) -> DecisionResponse<Option<FeatureDecision>> {
        let mut reasons = DecisionReasons::new();
        let user_id = user.user_id();

        let rules = match config.rollout_by_id(&flag.rollout_id) {
            Some(rollout) if !rollout.experiments.is_empty() => &rollout.experiments,
            _ => {
                reasons.info(format!(
                    "The feature flag \"{}\" is not used in a rollout.",
                    flag.key
                ));
                return DecisionResponse::new(None, reasons);
            }
        };
        let everyone_else = rules.len() - 1;
        let bucketing_id = user.bucketing_id().unpack(&mut reasons);

        let mut index = 0;
        while index < rules.len() {
            let rule = &rules[index];
            let logging_key = if index == everyone_else {
                "Everyone Else".to_owned()
            } else {
                (index + 1).to_string()
            };

            if let Some(variation) =
                forced_decision(&flag.key, Some(&rule.key), user, config).unpack(&mut reasons)
            {
                let decision = FeatureDecision::from_rule(
                    rule,
                    RuleType::Rollout,
                    VariationDecision::new(
                        variation,
                        DecisionSource::ForcedDecision,
                        DecisionReasons::new(),
                    ),
                );
                return DecisionResponse::new(Some(decision), reasons);
            }

            if !rule.is_active() {
                reasons.info(format!("Targeting rule \"{logging_key}\" is not running."));
                index += 1;
                continue;
            }

            let qualified = does_user_meet_audience_conditions(
                rule,
                config,
                user.attributes(),
                "rule",
                &logging_key,
            )
            .unpack(&mut reasons);
            if !qualified {
                reasons.info(format!(
                    "User \"{user_id}\" does not meet conditions for targeting rule \"{logging_key}\"."
                ));
                index += 1;
                continue;
            }
            reasons.info(format!(
                "User \"{user_id}\" meets conditions for targeting rule \"{logging_key}\"."
            ));

            match self
                .bucketer
                .bucket(rule, bucketing_id, config)
                .unpack(&mut reasons)
            {
                Some(variation) => {
                    reasons.info(format!(
                        "User \"{user_id}\" bucketed into a targeting rule \"{logging_key}\"."
                    ));
                    let decision = FeatureDecision::from_rule(
                        rule,
                        RuleType::Rollout,
                        VariationDecision::new(
                            variation,
                            DecisionSource::Rollout,
                            DecisionReasons::new(),
                        ),
                    );
                    return DecisionResponse::new(Some(decision), reasons);
                }
                None if index < everyone_else => {
                    reasons.info(format!(
                        "User \"{user_id}\" is not in the traffic group for targeting rule \"{logging_key}\". Checking \"Everyone Else\" rule now."
                    ));
                    index = everyone_else;
                }
                None => {
                    reasons.info(format!(
                        "User \"{user_id}\" is not in the traffic group for \"Everyone Else\" rule."
                    ));
                    index += 1;
                }
            }
        }

        DecisionResponse::new(None, reasons)
    }
}

/// Static whitelist of `experiment`. A key that names no variation is ignored.
fn whitelisted_variation(
    experiment: &Experiment,
    user_id: &str,
) -> DecisionResponse<Option<Arc<Variation>>> {
    let mut reasons = DecisionReasons::new();

    let Some(variation_key) = experiment.forced_variations.get(user_id) else {
        return DecisionResponse::new(None, reasons);
    };

    let variation = experiment.variation_by_key(variation_key).cloned();
    match &variation {
        Some(_) => reasons.info(format!(
            "User \"{user_id}\" is forced in variation \"{variation_key}\"."
        )),
        None => reasons.warn(format!(
            "Variation \"{variation_key}\" is not in the datafile. Not activating user \"{user_id}\"."
        )),
    }
    DecisionResponse::new(variation, reasons)
}

/// Forced decision of the user context for `(flag_key, rule_key)`, validated against the flag's
/// variations.
fn forced_decision(
    flag_key: &str,
    rule_key: Option<&str>,
    user: &UserContext,
    config: &ProjectConfig,
) -> DecisionResponse<Option<Arc<Variation>>> {
    let mut reasons = DecisionReasons::new();

    let Some(variation_key) = user.forced_decision(flag_key, rule_key) else {
        return DecisionResponse::new(None, reasons);
    };

    let target = match rule_key {
        Some(rule_key) => format!("flag ({flag_key}), rule ({rule_key})"),
        None => format!("flag ({flag_key})"),
    };
    let user_id = user.user_id();

    let variation = config.flag_variation_by_key(flag_key, variation_key).cloned();
    match &variation {
        Some(_) => reasons.info(format!(
            "Variation ({variation_key}) is mapped to {target} and user ({user_id}) in the forced decision map."
        )),
        None => reasons.info(format!(
            "Invalid variation is mapped to {target} and user ({user_id}) in the forced decision map."
        )),
    }
    DecisionResponse::new(variation, reasons)
}

fn log_decision(decision: &FlagDecision) {
    log::debug!(target: "flagcore",
                flag_key:display = decision.flag_key,
                user_id:display = decision.user_id,
                variation_key:? = decision.variation_key,
                rule_key:? = decision.rule_key,
                enabled = decision.enabled;
                "decided flag");
}
