use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Type alias for a HashMap representing key-value pairs of user attributes.
///
/// Keys are strings representing attribute names.
///
/// # Examples
/// ```
/// # use flagcore::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("plan".to_owned(), "gold".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Reserved attribute that overrides the user id as the hashing input.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// Largest magnitude a numeric attribute or operand may have to take part in a comparison (2^53).
/// Beyond it, doubles no longer represent every integer exactly.
pub const MAX_NUMERIC_VALUE: f64 = 9_007_199_254_740_992.0;

/// Enum representing possible values of a user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`, and `bool` types.
///
/// Examples:
/// ```
/// # use flagcore::AttributeValue;
/// let string_attr: AttributeValue = "example".into();
/// let number_attr: AttributeValue = 42.0.into();
/// let bool_attr: AttributeValue = true.into();
/// ```
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone, Default)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    #[default]
    Null,
}

impl AttributeValue {
    /// Returns the string slice if the value is a string.
    pub fn as_str(&self) -> Option<&str> {
        if let AttributeValue::String(s) = self {
            Some(s.as_str())
        } else {
            None
        }
    }

    /// Returns the number if the value is numeric and usable in comparisons (finite and within
    /// ±2^53).
    pub fn as_valid_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) if is_valid_number(*n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    /// Short type name used in diagnostics.
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            AttributeValue::String(_) => "string",
            AttributeValue::Number(_) => "number",
            AttributeValue::Boolean(_) => "boolean",
            AttributeValue::Null => "null",
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

pub(crate) fn is_valid_number(n: f64) -> bool {
    n.is_finite() && n.abs() <= MAX_NUMERIC_VALUE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_numbers() {
        assert_eq!(AttributeValue::from(10.5).as_valid_number(), Some(10.5));
        assert_eq!(
            AttributeValue::from(MAX_NUMERIC_VALUE).as_valid_number(),
            Some(MAX_NUMERIC_VALUE)
        );
        assert_eq!(AttributeValue::from(MAX_NUMERIC_VALUE * 2.0).as_valid_number(), None);
        assert_eq!(AttributeValue::from(f64::INFINITY).as_valid_number(), None);
        assert_eq!(AttributeValue::from(f64::NAN).as_valid_number(), None);
        assert_eq!(AttributeValue::from("10").as_valid_number(), None);
    }

    #[test]
    fn deserializes_untagged() {
        let attributes: Attributes =
            serde_json::from_str(r#"{"plan": "gold", "age": 30, "beta": true, "x": null}"#)
                .unwrap();
        assert_eq!(attributes["plan"], AttributeValue::from("gold"));
        assert_eq!(attributes["age"], AttributeValue::Number(30.0));
        assert_eq!(attributes["beta"], AttributeValue::Boolean(true));
        assert!(attributes["x"].is_null());
    }
}
