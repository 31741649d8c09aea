use std::collections::HashMap;

use crate::{
    attributes::BUCKETING_ID_ATTRIBUTE,
    decision::{DecisionReasons, DecisionResponse},
    Attributes, AttributeValue,
};

/// The user a decision is made for.
///
/// A context is immutable once built: forced decisions are attached through consuming builder
/// methods, so a context shared between threads never changes under a running resolution.
///
/// ```
/// # use flagcore::{Attributes, UserContext};
/// let user = UserContext::new("user-1", Attributes::new())
///     .with_forced_decision("checkout", Some("experiment_rule"), "treatment");
/// assert_eq!(user.forced_decision("checkout", Some("experiment_rule")), Some("treatment"));
/// assert_eq!(user.forced_decision("checkout", None), None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UserContext {
    user_id: String,
    attributes: Attributes,
    forced_decisions: HashMap<(String, Option<String>), String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, attributes: Attributes) -> UserContext {
        UserContext {
            user_id: user_id.into(),
            attributes,
            forced_decisions: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Force `variation_key` for the flag, either for the whole flag (`rule_key` is `None`) or
    /// for one of its rules.
    pub fn with_forced_decision(
        mut self,
        flag_key: impl Into<String>,
        rule_key: Option<&str>,
        variation_key: impl Into<String>,
    ) -> UserContext {
        self.forced_decisions.insert(
            (flag_key.into(), rule_key.map(str::to_owned)),
            variation_key.into(),
        );
        self
    }

    pub fn without_forced_decision(mut self, flag_key: &str, rule_key: Option<&str>) -> UserContext {
        self.forced_decisions
            .remove(&(flag_key.to_owned(), rule_key.map(str::to_owned)));
        self
    }

    pub fn without_forced_decisions(mut self) -> UserContext {
        self.forced_decisions.clear();
        self
    }

    pub fn forced_decision(&self, flag_key: &str, rule_key: Option<&str>) -> Option<&str> {
        if self.forced_decisions.is_empty() {
            return None;
        }
        self.forced_decisions
            .get(&(flag_key.to_owned(), rule_key.map(str::to_owned)))
            .map(String::as_str)
    }

    /// Hash input identity: the reserved bucketing-id attribute when it is a string, the user id
    /// otherwise.
    pub fn bucketing_id(&self) -> DecisionResponse<&str> {
        let mut reasons = DecisionReasons::new();
        let bucketing_id = match self.attributes.get(BUCKETING_ID_ATTRIBUTE) {
            Some(AttributeValue::String(id)) => id.as_str(),
            None | Some(AttributeValue::Null) => self.user_id.as_str(),
            Some(_) => {
                reasons.warn("BucketingID attribute is not a string. Defaulted to userId");
                self.user_id.as_str()
            }
        };
        DecisionResponse::new(bucketing_id, reasons)
    }
}

#[cfg(test)]
mod tests {
    use super::UserContext;
    use crate::{attributes::BUCKETING_ID_ATTRIBUTE, Attributes};

    #[test]
    fn bucketing_id_prefers_string_attribute() {
        let attributes: Attributes = [(BUCKETING_ID_ATTRIBUTE.to_owned(), "device-7".into())].into();
        let user = UserContext::new("user", attributes);
        let response = user.bucketing_id();
        assert_eq!(response.result, "device-7");
        assert!(response.reasons.is_empty());
    }

    #[test]
    fn non_string_bucketing_id_falls_back_to_user_id() {
        let attributes: Attributes = [(BUCKETING_ID_ATTRIBUTE.to_owned(), 7.into())].into();
        let user = UserContext::new("user", attributes);
        let response = user.bucketing_id();
        assert_eq!(response.result, "user");
        assert_eq!(
            response.reasons.messages(),
            vec!["BucketingID attribute is not a string. Defaulted to userId"]
        );
    }

    #[test]
    fn forced_decisions_are_scoped_by_rule() {
        let user = UserContext::new("user", Attributes::new())
            .with_forced_decision("flag", None, "on")
            .with_forced_decision("flag", Some("rule"), "off");

        assert_eq!(user.forced_decision("flag", None), Some("on"));
        assert_eq!(user.forced_decision("flag", Some("rule")), Some("off"));
        assert_eq!(user.forced_decision("flag", Some("other")), None);

        let user = user.without_forced_decision("flag", None);
        assert_eq!(user.forced_decision("flag", None), None);
        assert_eq!(user.forced_decision("flag", Some("rule")), Some("off"));
        assert_eq!(user.without_forced_decisions().forced_decision("flag", Some("rule")), None);
    }
}
