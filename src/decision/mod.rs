//! Decision values and the resolver that produces them.
mod flag_decision;
mod options;
mod reasons;
mod service;

use std::sync::Arc;

use serde::Serialize;

use crate::project_config::{Experiment, Variation};

pub use flag_decision::FlagDecision;
pub use options::{DecideOption, DecideOptions};
pub use reasons::{DecisionReasons, DecisionResponse, Reason, ReasonSeverity};
pub use service::DecisionService;

/// The stage of resolution that produced a variation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionSource {
    /// Runtime override from the [`OverrideTable`](crate::OverrideTable).
    Override,
    /// Static whitelist of the experiment.
    Whitelist,
    /// Previously persisted decision.
    Sticky,
    /// Hash bucketing into an experiment.
    Experiment,
    /// Hash bucketing into a rollout rule.
    Rollout,
    Holdout,
    /// Contextual-bandit decision.
    Cmab,
    /// Forced decision set on the user context.
    ForcedDecision,
}

/// Layer of flag resolution a rule belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleType {
    Holdout,
    Experiment,
    Rollout,
}

/// Result of resolving a single experiment or rule.
///
/// A missing variation with `error == false` is a regular "no decision". `error` is only set when
/// the contextual-bandit gateway failed; callers are expected to apply their own fallback.
#[derive(Debug, Clone, Default)]
pub struct VariationDecision {
    pub variation: Option<Arc<Variation>>,
    pub source: Option<DecisionSource>,
    pub error: bool,
    /// Correlation id of a contextual-bandit decision.
    pub cmab_uuid: Option<String>,
    pub reasons: DecisionReasons,
}

impl VariationDecision {
    pub(crate) fn none(reasons: DecisionReasons) -> VariationDecision {
        VariationDecision {
            reasons,
            ..VariationDecision::default()
        }
    }

    pub(crate) fn new(
        variation: Arc<Variation>,
        source: DecisionSource,
        reasons: DecisionReasons,
    ) -> VariationDecision {
        VariationDecision {
            variation: Some(variation),
            source: Some(source),
            error: false,
            cmab_uuid: None,
            reasons,
        }
    }

    pub fn variation_key(&self) -> Option<&str> {
        self.variation.as_ref().map(|variation| variation.key.as_str())
    }
}

/// Result of resolving a flag: the rule that decided and the variation it served.
#[derive(Debug, Clone, Default)]
pub struct FeatureDecision {
    /// The deciding experiment, rollout rule or holdout. `None` for flag-level forced decisions
    /// and when nothing matched.
    pub rule: Option<Arc<Experiment>>,
    pub rule_type: Option<RuleType>,
    pub variation: Option<Arc<Variation>>,
    pub source: Option<DecisionSource>,
    pub error: bool,
    pub cmab_uuid: Option<String>,
    pub reasons: DecisionReasons,
}

impl FeatureDecision {
    pub(crate) fn none(reasons: DecisionReasons) -> FeatureDecision {
        FeatureDecision {
            reasons,
            ..FeatureDecision::default()
        }
    }

    /// Wrap the decision of a single rule.
    pub(crate) fn from_rule(
        rule: &Arc<Experiment>,
        rule_type: RuleType,
        decision: VariationDecision,
    ) -> FeatureDecision {
        FeatureDecision {
            rule: Some(rule.clone()),
            rule_type: Some(rule_type),
            variation: decision.variation,
            source: decision.source,
            error: decision.error,
            cmab_uuid: decision.cmab_uuid,
            reasons: decision.reasons,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled)
    }
}
