use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Per-call switches that alter resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecideOption {
    /// Skip the sticky-bucketing stage (no lookup and no write-back).
    IgnoreUserProfileService,
    /// Report informational reasons in addition to errors.
    IncludeReasons,
    /// `decide_all`/`decide_for_keys` drop decisions whose flag is not enabled.
    EnabledFlagsOnly,
    /// Do not resolve flag variables.
    ExcludeVariables,
    /// Always fetch a fresh contextual-bandit decision.
    IgnoreCmabCache,
    /// Clear the whole contextual-bandit cache before looking up.
    ResetCmabCache,
    /// Drop the cached contextual-bandit decision of this user for this rule.
    InvalidateUserCmabCache,
}

/// A set of [`DecideOption`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecideOptions(HashSet<DecideOption>);

impl DecideOptions {
    pub fn new() -> DecideOptions {
        DecideOptions::default()
    }

    pub fn contains(&self, option: DecideOption) -> bool {
        self.0.contains(&option)
    }

    pub fn with(mut self, option: DecideOption) -> DecideOptions {
        self.0.insert(option);
        self
    }

    /// Union of both option sets.
    pub fn union(&self, other: &DecideOptions) -> DecideOptions {
        DecideOptions(self.0.union(&other.0).copied().collect())
    }

    pub(crate) fn include_reasons(&self) -> bool {
        self.contains(DecideOption::IncludeReasons)
    }

    pub(crate) fn ignore_user_profile(&self) -> bool {
        self.contains(DecideOption::IgnoreUserProfileService)
    }
}

impl FromIterator<DecideOption> for DecideOptions {
    fn from_iter<T: IntoIterator<Item = DecideOption>>(iter: T) -> Self {
        DecideOptions(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[DecideOption; N]> for DecideOptions {
    fn from(value: [DecideOption; N]) -> Self {
        value.into_iter().collect()
    }
}
