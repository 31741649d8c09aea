//! Audience targeting: condition trees, match operators and their evaluation against a user.
//!
//! Evaluation is three-valued. Every anomaly found at a leaf (a type mismatch, a malformed
//! version, an audience id missing from configuration) is reported as an [`EvalError`] by the
//! leaf, recorded as a reason and turned into "unknown" before it reaches the tree operators.
mod condition;
mod match_type;
mod semver;

use thiserror::Error;

use crate::{
    decision::{DecisionReasons, DecisionResponse},
    project_config::{Experiment, ProjectConfig},
    Attributes,
};

pub use condition::{
    AudienceRef, ConditionLeaf, ConditionNode, UserCondition, CUSTOM_ATTRIBUTE_CONDITION_TYPE,
};
pub use match_type::MatchType;
pub use semver::SemanticVersion;

/// Leaf-level evaluation anomaly. Never escapes condition evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvalError {
    #[error("invalid semantic version {0:?}")]
    InvalidSemanticVersion(String),

    #[error("number is not finite or exceeds 2^53 in magnitude")]
    InvalidNumber,

    #[error("condition value is not valid for match type {0:?}")]
    InvalidOperand(&'static str),

    #[error("expected a {expected} attribute, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("audience {0:?} is not in configuration")]
    MissingAudience(String),

    #[error("unsupported condition type {0:?}")]
    UnknownConditionType(String),
}

/// Evaluate attribute conditions against `attributes`. Leaf errors become unknown and are
/// reported as reasons.
pub fn evaluate_user_conditions(
    conditions: &ConditionNode<UserCondition>,
    attributes: &Attributes,
) -> DecisionResponse<Option<bool>> {
    let mut reasons = DecisionReasons::new();
    let result = conditions.evaluate(&mut |condition: &UserCondition| {
        match condition.evaluate(attributes) {
            Ok(result) => result,
            Err(err) => {
                log::debug!(target: "flagcore",
                            attribute:display = condition.name,
                            match_type:display = condition.match_type;
                            "condition evaluated to unknown: {err}");
                reasons.info(format!(
                    "Condition {condition} evaluated to UNKNOWN: {err}."
                ));
                None
            }
        }
    });
    DecisionResponse::new(result, reasons)
}

/// Evaluate a tree of audience references, resolving each id through `config`.
pub fn evaluate_audience_conditions(
    conditions: &ConditionNode<AudienceRef>,
    config: &ProjectConfig,
    attributes: &Attributes,
) -> DecisionResponse<Option<bool>> {
    let mut reasons = DecisionReasons::new();
    let result = conditions.evaluate(&mut |audience_ref: &AudienceRef| {
        let Some(audience) = config.audience_by_id(&audience_ref.0) else {
            let err = EvalError::MissingAudience(audience_ref.0.clone());
            reasons.error(format!("Audience {audience_ref} evaluated to UNKNOWN: {err}."));
            return None;
        };

        reasons.debug(format!(
            "Starting to evaluate audience \"{}\" ({}).",
            audience.id, audience.name
        ));
        let result = evaluate_user_conditions(&audience.conditions, attributes).unpack(&mut reasons);
        reasons.debug(format!(
            "Audience \"{}\" evaluated to {}.",
            audience.id,
            display_result(result)
        ));
        result
    });
    DecisionResponse::new(result, reasons)
}

/// Whether `attributes` satisfy the targeting of `experiment` (an experiment, rollout rule or
/// holdout).
///
/// `audience_conditions` takes precedence over `audience_ids`; the latter is an implicit `or`.
/// With neither, everyone qualifies. Unknown counts as not qualifying. `kind` and `logging_key`
/// only shape the reasons, e.g. `("rule", "Everyone Else")`.
pub fn does_user_meet_audience_conditions(
    experiment: &Experiment,
    config: &ProjectConfig,
    attributes: &Attributes,
    kind: &str,
    logging_key: &str,
) -> DecisionResponse<bool> {
    let mut reasons = DecisionReasons::new();

    let implicit;
    let conditions = match &experiment.audience_conditions {
        Some(conditions) => conditions,
        None if experiment.audience_ids.is_empty() => {
            reasons.info(format!(
                "Audiences for {kind} \"{logging_key}\" collectively evaluated to TRUE."
            ));
            return DecisionResponse::new(true, reasons);
        }
        None => {
            implicit = ConditionNode::Or(
                experiment
                    .audience_ids
                    .iter()
                    .map(|id| ConditionNode::Leaf(AudienceRef(id.clone())))
                    .collect(),
            );
            &implicit
        }
    };

    reasons.debug(format!(
        "Evaluating audiences for {kind} \"{logging_key}\": {}.",
        describe(conditions)
    ));
    let result = evaluate_audience_conditions(conditions, config, attributes).unpack(&mut reasons);
    reasons.info(format!(
        "Audiences for {kind} \"{logging_key}\" collectively evaluated to {}.",
        display_result(result)
    ));

    DecisionResponse::new(result.unwrap_or(false), reasons)
}

fn display_result(result: Option<bool>) -> &'static str {
    match result {
        Some(true) => "TRUE",
        Some(false) => "FALSE",
        None => "UNKNOWN",
    }
}

fn describe(node: &ConditionNode<AudienceRef>) -> String {
    match node {
        ConditionNode::And(children) => describe_list("and", children),
        ConditionNode::Or(children) => describe_list("or", children),
        ConditionNode::Not(child) => match child {
            Some(child) => format!("[\"not\", {}]", describe(child)),
            None => "[\"not\"]".to_owned(),
        },
        ConditionNode::Leaf(audience) => format!("{:?}", audience.0),
    }
}

fn describe_list(operator: &str, children: &[ConditionNode<AudienceRef>]) -> String {
    let mut out = format!("[\"{operator}\"");
    for child in children {
        out.push_str(", ");
        out.push_str(&describe(child));
    }
    out.push(']');
    out
}
