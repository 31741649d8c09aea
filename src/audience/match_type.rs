use std::{cmp::Ordering, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{attributes::is_valid_number, AttributeValue, Error};

use super::{semver::SemanticVersion, EvalError};

/// Closed set of operators a condition leaf may apply.
///
/// All operators share one contract ([`MatchType::evaluate`]): `Ok(Some(_))` for a definite
/// answer, `Ok(None)` when the attribute is missing, and `Err(_)` when the attribute or operand
/// cannot be compared. Callers turn errors into "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Option<String>", into = "Option<String>")]
pub enum MatchType {
    Exact,
    Exists,
    Gt,
    Ge,
    Lt,
    Le,
    Substring,
    SemverEq,
    SemverGt,
    SemverGe,
    SemverLt,
    SemverLe,
    /// Conditions written before match types existed: plain string equality.
    #[default]
    Legacy,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Exists => "exists",
            MatchType::Gt => "gt",
            MatchType::Ge => "ge",
            MatchType::Lt => "lt",
            MatchType::Le => "le",
            MatchType::Substring => "substring",
            MatchType::SemverEq => "semver_eq",
            MatchType::SemverGt => "semver_gt",
            MatchType::SemverGe => "semver_ge",
            MatchType::SemverLt => "semver_lt",
            MatchType::SemverLe => "semver_le",
            MatchType::Legacy => "legacy",
        }
    }

    /// Apply the operator to `attribute` (the user's value, `None` when absent) and `operand`
    /// (the condition's value).
    pub fn evaluate(
        self,
        operand: &AttributeValue,
        attribute: Option<&AttributeValue>,
    ) -> Result<Option<bool>, EvalError> {
        let attribute = match attribute {
            None | Some(AttributeValue::Null) if self == MatchType::Exists => {
                return Ok(Some(false))
            }
            None | Some(AttributeValue::Null) => return Ok(None),
            Some(value) => value,
        };

        match self {
            MatchType::Exists => Ok(Some(true)),

            MatchType::Exact => match operand {
                AttributeValue::String(expected) => {
                    let actual = expect_string(attribute)?;
                    Ok(Some(actual == expected))
                }
                AttributeValue::Number(expected) => {
                    let expected = valid_operand(*expected)?;
                    let actual = expect_number(attribute)?;
                    Ok(Some(actual == expected))
                }
                AttributeValue::Boolean(expected) => match attribute {
                    AttributeValue::Boolean(actual) => Ok(Some(actual == expected)),
                    other => Err(type_mismatch("boolean", other)),
                },
                AttributeValue::Null => Err(EvalError::InvalidOperand(self.as_str())),
            },

            MatchType::Gt | MatchType::Ge | MatchType::Lt | MatchType::Le => {
                let AttributeValue::Number(expected) = operand else {
                    return Err(EvalError::InvalidOperand(self.as_str()));
                };
                let expected = valid_operand(*expected)?;
                let actual = expect_number(attribute)?;
                let ordering = actual
                    .partial_cmp(&expected)
                    .ok_or(EvalError::InvalidNumber)?;
                Ok(Some(self.accepts(ordering)))
            }

            MatchType::Substring => {
                let AttributeValue::String(expected) = operand else {
                    return Err(EvalError::InvalidOperand(self.as_str()));
                };
                let actual = expect_string(attribute)?;
                Ok(Some(actual.contains(expected.as_str())))
            }

            MatchType::SemverEq
            | MatchType::SemverGt
            | MatchType::SemverGe
            | MatchType::SemverLt
            | MatchType::SemverLe => {
                let AttributeValue::String(expected) = operand else {
                    return Err(EvalError::InvalidOperand(self.as_str()));
                };
                let target = SemanticVersion::parse(expected)?;
                let actual = SemanticVersion::parse(expect_string(attribute)?)?;
                Ok(Some(self.accepts(actual.compare_to_target(&target))))
            }

            MatchType::Legacy => {
                let AttributeValue::String(expected) = operand else {
                    return Err(EvalError::InvalidOperand(self.as_str()));
                };
                let actual = expect_string(attribute)?;
                Ok(Some(actual == expected))
            }
        }
    }

    /// Whether `ordering` (attribute compared to operand) satisfies a comparison operator.
    fn accepts(self, ordering: Ordering) -> bool {
        match self {
            MatchType::Gt | MatchType::SemverGt => ordering == Ordering::Greater,
            MatchType::Ge | MatchType::SemverGe => ordering != Ordering::Less,
            MatchType::Lt | MatchType::SemverLt => ordering == Ordering::Less,
            MatchType::Le | MatchType::SemverLe => ordering != Ordering::Greater,
            MatchType::SemverEq => ordering == Ordering::Equal,
            _ => false,
        }
    }
}

fn expect_string(value: &AttributeValue) -> Result<&str, EvalError> {
    value.as_str().ok_or_else(|| type_mismatch("string", value))
}

fn expect_number(value: &AttributeValue) -> Result<f64, EvalError> {
    match value {
        AttributeValue::Number(n) if is_valid_number(*n) => Ok(*n),
        AttributeValue::Number(_) => Err(EvalError::InvalidNumber),
        other => Err(type_mismatch("number", other)),
    }
}

fn valid_operand(n: f64) -> Result<f64, EvalError> {
    if is_valid_number(n) {
        Ok(n)
    } else {
        Err(EvalError::InvalidNumber)
    }
}

fn type_mismatch(expected: &'static str, found: &AttributeValue) -> EvalError {
    EvalError::TypeMismatch {
        expected,
        found: found.type_name(),
    }
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "exact" => MatchType::Exact,
            "exists" => MatchType::Exists,
            "gt" => MatchType::Gt,
            "ge" => MatchType::Ge,
            "lt" => MatchType::Lt,
            "le" => MatchType::Le,
            "substring" => MatchType::Substring,
            "semver_eq" => MatchType::SemverEq,
            "semver_gt" => MatchType::SemverGt,
            "semver_ge" => MatchType::SemverGe,
            "semver_lt" => MatchType::SemverLt,
            "semver_le" => MatchType::SemverLe,
            "legacy" => MatchType::Legacy,
            other => return Err(Error::UnknownMatchType(other.to_owned())),
        })
    }
}

impl TryFrom<Option<String>> for MatchType {
    type Error = Error;

    fn try_from(value: Option<String>) -> Result<Self, Self::Error> {
        value.as_deref().map_or(Ok(MatchType::Legacy), str::parse)
    }
}

impl From<MatchType> for Option<String> {
    fn from(value: MatchType) -> Self {
        match value {
            MatchType::Legacy => None,
            other => Some(other.as_str().to_owned()),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::MatchType;
    use crate::{audience::EvalError, AttributeValue};

    fn eval(
        match_type: MatchType,
        operand: impl Into<AttributeValue>,
        attribute: impl Into<AttributeValue>,
    ) -> Option<bool> {
        match_type
            .evaluate(&operand.into(), Some(&attribute.into()))
            .unwrap_or(None)
    }

    #[test]
    fn missing_attribute_is_unknown_except_exists() {
        for match_type in [
            MatchType::Exact,
            MatchType::Gt,
            MatchType::Ge,
            MatchType::Lt,
            MatchType::Le,
            MatchType::Substring,
            MatchType::SemverEq,
            MatchType::SemverGe,
            MatchType::Legacy,
        ] {
            assert_eq!(
                match_type.evaluate(&"1.0.0".into(), None),
                Ok(None),
                "{match_type}"
            );
            assert_eq!(
                match_type.evaluate(&"1.0.0".into(), Some(&AttributeValue::Null)),
                Ok(None),
                "{match_type}"
            );
        }

        assert_eq!(
            MatchType::Exists.evaluate(&AttributeValue::Null, None),
            Ok(Some(false))
        );
        assert_eq!(
            MatchType::Exists.evaluate(&AttributeValue::Null, Some(&AttributeValue::Null)),
            Ok(Some(false))
        );
        assert_eq!(
            MatchType::Exists.evaluate(&AttributeValue::Null, Some(&false.into())),
            Ok(Some(true))
        );
    }

    #[test]
    fn exact_requires_matching_types() {
        assert_eq!(eval(MatchType::Exact, "gold", "gold"), Some(true));
        assert_eq!(eval(MatchType::Exact, "gold", "silver"), Some(false));
        assert_eq!(eval(MatchType::Exact, "gold", true), None);
        assert_eq!(eval(MatchType::Exact, true, true), Some(true));
        assert_eq!(eval(MatchType::Exact, true, "true"), None);
        assert_eq!(eval(MatchType::Exact, 10, 10.0), Some(true));
        assert_eq!(eval(MatchType::Exact, 10, 10.5), Some(false));
        assert_eq!(eval(MatchType::Exact, 10, "10"), None);
    }

    #[test]
    fn numeric_comparisons() {
        assert_eq!(eval(MatchType::Gt, 18, 19), Some(true));
        assert_eq!(eval(MatchType::Gt, 18, 18), Some(false));
        assert_eq!(eval(MatchType::Ge, 18, 18), Some(true));
        assert_eq!(eval(MatchType::Lt, 18, 17.5), Some(true));
        assert_eq!(eval(MatchType::Lt, 18, 18), Some(false));
        assert_eq!(eval(MatchType::Le, 18, 18), Some(true));
        assert_eq!(eval(MatchType::Gt, 18, "19"), None);
        assert_eq!(eval(MatchType::Gt, 18, true), None);
    }

    #[test]
    fn out_of_range_numbers_are_unknown() {
        assert_eq!(
            MatchType::Gt.evaluate(&10.into(), Some(&f64::INFINITY.into())),
            Err(EvalError::InvalidNumber)
        );
        assert_eq!(eval(MatchType::Exact, 10, 2f64.powi(53) + 2.0), None);
        assert_eq!(eval(MatchType::Lt, f64::NAN, 1), None);
        assert_eq!(eval(MatchType::Lt, 2f64.powi(54), 1), None);
    }

    #[test]
    fn substring() {
        assert_eq!(eval(MatchType::Substring, "gold", "golden plan"), Some(true));
        assert_eq!(eval(MatchType::Substring, "gold", "silver"), Some(false));
        assert_eq!(eval(MatchType::Substring, "gold", 1), None);
    }

    #[test]
    fn semantic_versions() {
        assert_eq!(eval(MatchType::SemverGe, "2.1.0", "2.0.5"), Some(false));
        assert_eq!(eval(MatchType::SemverGe, "2.1.0", "2.1.0-beta"), Some(false));
        assert_eq!(eval(MatchType::SemverGe, "2.1.0", "2.2"), Some(true));
        assert_eq!(eval(MatchType::SemverEq, "2.1", "2.1.9"), Some(true));
        assert_eq!(eval(MatchType::SemverLt, "2.1.0", "2.1.0-beta"), Some(true));
        assert_eq!(eval(MatchType::SemverLe, "2.1.0", "2.1.0"), Some(true));
        assert_eq!(eval(MatchType::SemverGt, "2.1.0", "2.1.1"), Some(true));
        assert_eq!(eval(MatchType::SemverGt, "2.1.0", 2.2), None);
    }

    #[test]
    fn malformed_semantic_versions_are_errors() {
        assert!(matches!(
            MatchType::SemverEq.evaluate(&"2.1.0".into(), Some(&"2.x".into())),
            Err(EvalError::InvalidSemanticVersion(_))
        ));
        assert!(matches!(
            MatchType::SemverEq.evaluate(&"bad version".into(), Some(&"2.1.0".into())),
            Err(EvalError::InvalidSemanticVersion(_))
        ));
    }

    #[test]
    fn legacy_is_string_equality() {
        assert_eq!(eval(MatchType::Legacy, "gold", "gold"), Some(true));
        assert_eq!(eval(MatchType::Legacy, "gold", "Gold"), Some(false));
        assert_eq!(eval(MatchType::Legacy, "1", 1), None);
    }

    #[test]
    fn parses_names() {
        assert_eq!("semver_ge".parse::<MatchType>().unwrap(), MatchType::SemverGe);
        assert_eq!(MatchType::try_from(None).unwrap(), MatchType::Legacy);
        assert!("regex".parse::<MatchType>().is_err());
    }
}
