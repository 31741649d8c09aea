use std::fmt;

use serde::{de, Deserialize, Deserializer};
use serde_json::Value;

use crate::{Attributes, AttributeValue, Error, Result};

use super::{match_type::MatchType, EvalError};

/// A boolean expression over leaves of type `L`, evaluated with three-valued logic.
///
/// Configuration encodes trees as nested JSON arrays whose first element may name the operator:
/// `["and", leaf, ["or", leaf, leaf], ["not", leaf]]`. A list that does not start with an
/// operator is an implicit `or`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionNode<L> {
    And(Vec<ConditionNode<L>>),
    Or(Vec<ConditionNode<L>>),
    /// `None` for a `["not"]` without an operand, which always evaluates to unknown.
    Not(Option<Box<ConditionNode<L>>>),
    Leaf(L),
}

impl<L> ConditionNode<L> {
    /// Evaluate the tree, calling `leaf` for every leaf that has to be inspected.
    ///
    /// `Some(true)`/`Some(false)` are definite answers, `None` is unknown:
    /// - `and`: false if any child is false, otherwise unknown if any child is unknown, otherwise
    ///   true. Evaluation stops at the first false child. An empty `and` is true.
    /// - `or`: true if any child is true, otherwise unknown if any child is unknown, otherwise
    ///   false. Evaluation stops at the first true child. An empty `or` is false.
    /// - `not`: negates a definite answer, unknown stays unknown.
    pub fn evaluate<F>(&self, leaf: &mut F) -> Option<bool>
    where
        F: FnMut(&L) -> Option<bool>,
    {
        match self {
            ConditionNode::And(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(leaf) {
                        Some(false) => return Some(false),
                        None => saw_unknown = true,
                        Some(true) => {}
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(true)
                }
            }
            ConditionNode::Or(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(leaf) {
                        Some(true) => return Some(true),
                        None => saw_unknown = true,
                        Some(false) => {}
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(false)
                }
            }
            ConditionNode::Not(child) => child.as_ref()?.evaluate(leaf).map(|value| !value),
            ConditionNode::Leaf(l) => leaf(l),
        }
    }

    /// Iterate over all leaves in document order.
    pub fn leaves(&self) -> Box<dyn Iterator<Item = &L> + '_> {
        match self {
            ConditionNode::And(children) | ConditionNode::Or(children) => {
                Box::new(children.iter().flat_map(|child| child.leaves()))
            }
            ConditionNode::Not(child) => Box::new(child.iter().flat_map(|child| child.leaves())),
            ConditionNode::Leaf(l) => Box::new(std::iter::once(l)),
        }
    }
}

/// Something that may appear as a leaf of a [`ConditionNode`].
pub trait ConditionLeaf: Sized {
    fn from_json(value: &Value) -> Result<Self>;
}

impl<L: ConditionLeaf> ConditionNode<L> {
    /// Build a tree from its JSON encoding. A bare leaf (not wrapped in a list) is accepted too.
    pub fn from_json(value: &Value) -> Result<ConditionNode<L>> {
        match value {
            Value::Array(items) => ConditionNode::from_list(items),
            other => L::from_json(other).map(ConditionNode::Leaf),
        }
    }

    fn from_list(items: &[Value]) -> Result<ConditionNode<L>> {
        let Some(first) = items.first() else {
            return Ok(ConditionNode::And(Vec::new()));
        };

        let (operator, operands) = match first.as_str() {
            Some(op @ ("and" | "or" | "not")) => (op, &items[1..]),
            _ => ("or", items),
        };

        let mut children = operands
            .iter()
            .map(ConditionNode::from_json)
            .collect::<Result<Vec<_>>>()?;

        Ok(match operator {
            "and" => ConditionNode::And(children),
            "not" => {
                // Only the first operand of `not` is meaningful.
                children.truncate(1);
                ConditionNode::Not(children.pop().map(Box::new))
            }
            _ => ConditionNode::Or(children),
        })
    }
}

impl<'de, L: ConditionLeaf> Deserialize<'de> for ConditionNode<L> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ConditionNode::from_json(&value).map_err(de::Error::custom)
    }
}

/// Reference to an audience by id, resolved against configuration at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AudienceRef(pub String);

impl ConditionLeaf for AudienceRef {
    fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(id) => Ok(AudienceRef(id.clone())),
            other => Err(Error::InvalidCondition(format!(
                "audience reference must be a string id, got {other}"
            ))),
        }
    }
}

impl fmt::Display for AudienceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The only leaf type that is evaluated against user attributes.
pub const CUSTOM_ATTRIBUTE_CONDITION_TYPE: &str = "custom_attribute";

fn default_condition_type() -> String {
    CUSTOM_ATTRIBUTE_CONDITION_TYPE.to_owned()
}

/// A leaf comparing one user attribute against an operand.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserCondition {
    /// Attribute key.
    pub name: String,
    #[serde(rename = "type", default = "default_condition_type")]
    pub condition_type: String,
    #[serde(rename = "match", default)]
    pub match_type: MatchType,
    #[serde(default)]
    pub value: AttributeValue,
}

impl UserCondition {
    pub fn new(
        name: impl Into<String>,
        match_type: MatchType,
        value: impl Into<AttributeValue>,
    ) -> UserCondition {
        UserCondition {
            name: name.into(),
            condition_type: default_condition_type(),
            match_type,
            value: value.into(),
        }
    }

    pub fn evaluate(&self, attributes: &Attributes) -> std::result::Result<Option<bool>, EvalError> {
        if self.condition_type != CUSTOM_ATTRIBUTE_CONDITION_TYPE {
            return Err(EvalError::UnknownConditionType(self.condition_type.clone()));
        }
        self.match_type
            .evaluate(&self.value, attributes.get(&self.name))
    }
}

impl ConditionLeaf for UserCondition {
    fn from_json(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidCondition(format!(
                "attribute condition must be an object, got {value}"
            )));
        }
        UserCondition::deserialize(value).map_err(|err| {
            // Surface unknown match names as their own error kind.
            let match_name = value.get("match").and_then(Value::as_str);
            match match_name.map(str::parse::<MatchType>) {
                Some(Err(unknown)) => unknown,
                _ => Error::InvalidCondition(err.to_string()),
            }
        })
    }
}

impl fmt::Display for UserCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{\"name\":{:?},\"type\":{:?},\"match\":{:?},\"value\":{}}}",
            self.name,
            self.condition_type,
            self.match_type.as_str(),
            serde_json::to_string(&self.value).unwrap_or_default()
        )
    }
}
