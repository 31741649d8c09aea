use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::{
    project_config::{FeatureFlag, FeatureVariable, ProjectConfig, Variation},
    UserContext,
};

use super::{
    DecideOption, DecideOptions, DecisionReasons, DecisionResponse, DecisionSource,
    FeatureDecision, RuleType,
};

/// Outcome of deciding a flag for a user, ready to be handed to the application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagDecision {
    pub flag_key: String,
    pub variation_key: Option<String>,
    pub enabled: bool,
    /// Flag variables by key, typed according to their declared type. Empty when variables were
    /// excluded or the decision failed.
    pub variables: Map<String, Value>,
    pub rule_key: Option<String>,
    pub user_id: String,
    /// Errors, plus informational notes when [`DecideOption::IncludeReasons`] is set.
    pub reasons: Vec<String>,
    pub source: Option<DecisionSource>,
    pub cmab_uuid: Option<String>,
    /// The flag is unknown or the contextual-bandit gateway failed.
    pub error: bool,
    /// Whether an impression should be reported for this decision.
    pub report_impression: bool,
}

impl FlagDecision {
    pub(crate) fn new(
        flag: &FeatureFlag,
        decision: FeatureDecision,
        user: &UserContext,
        config: &ProjectConfig,
        options: &DecideOptions,
    ) -> FlagDecision {
        let FeatureDecision {
            rule,
            rule_type,
            variation,
            source,
            error,
            cmab_uuid,
            mut reasons,
        } = decision;

        let enabled = variation
            .as_ref()
            .is_some_and(|variation| variation.feature_enabled);

        let variables = if error || options.contains(DecideOption::ExcludeVariables) {
            Map::new()
        } else {
            resolve_variables(flag, variation.as_deref(), enabled).unpack(&mut reasons)
        };

        // Rollout decisions are only reported when the project asks for every flag decision.
        let report_impression = !error
            && (config.send_flag_decisions()
                || (variation.is_some() && rule_type != Some(RuleType::Rollout)));

        FlagDecision {
            flag_key: flag.key.clone(),
            variation_key: variation.as_ref().map(|variation| variation.key.clone()),
            enabled,
            variables,
            rule_key: rule.as_ref().map(|rule| rule.key.clone()),
            user_id: user.user_id().to_owned(),
            reasons: reasons.to_report(options.include_reasons()),
            source,
            cmab_uuid,
            error,
            report_impression,
        }
    }

    pub(crate) fn unknown_flag(flag_key: &str, user: &UserContext) -> FlagDecision {
        let mut reasons = DecisionReasons::new();
        reasons.error(format!("No flag was found for key \"{flag_key}\"."));

        FlagDecision {
            flag_key: flag_key.to_owned(),
            variation_key: None,
            enabled: false,
            variables: Map::new(),
            rule_key: None,
            user_id: user.user_id().to_owned(),
            reasons: reasons.to_report(false),
            source: None,
            cmab_uuid: None,
            error: true,
            report_impression: false,
        }
    }
}

/// Flag defaults, overridden by the variation's values when the variation enables the flag.
fn resolve_variables(
    flag: &FeatureFlag,
    variation: Option<&Variation>,
    enabled: bool,
) -> DecisionResponse<Map<String, Value>> {
    let mut reasons = DecisionReasons::new();

    if !enabled && !flag.variables.is_empty() {
        reasons.info(format!(
            "Flag \"{}\" is not enabled for this user. Returning the default variable values.",
            flag.key
        ));
    }

    let mut variables = Map::new();
    for variable in &flag.variables {
        let raw = variation
            .filter(|_| enabled)
            .and_then(|variation| variation.variable_value(&variable.id))
            .unwrap_or(variable.default_value.as_str());

        let value = typed_value(variable, raw).unwrap_or_else(|| {
            reasons.warn(format!(
                "Variable value for key \"{}\" is invalid or wrong type.",
                variable.key
            ));
            Value::Null
        });
        variables.insert(variable.key.clone(), value);
    }

    DecisionResponse::new(variables, reasons)
}

fn typed_value(variable: &FeatureVariable, raw: &str) -> Option<Value> {
    match (variable.variable_type.as_str(), variable.sub_type.as_deref()) {
        ("json", _) | ("string", Some("json")) => serde_json::from_str(raw).ok(),
        ("string", _) => Some(Value::String(raw.to_owned())),
        ("boolean", _) => raw.parse::<bool>().ok().map(Value::Bool),
        ("integer", _) => raw.parse::<i64>().ok().map(Value::from),
        ("double", _) => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}
