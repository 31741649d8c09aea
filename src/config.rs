use crate::{
    bucketer::{Murmur3Sharder, Sharder},
    cmab::CmabService,
    decision::{DecideOptions, DecisionService},
    user_profile::UserProfileService,
};

/// Configuration for [`DecisionService`].
///
/// Sticky bucketing and contextual bandits are disabled unless the corresponding gateway is set.
pub struct DecisionServiceConfig {
    pub(crate) sharder: Box<dyn Sharder + Send + Sync>,
    pub(crate) user_profile_service: Option<Box<dyn UserProfileService + Send + Sync>>,
    pub(crate) cmab_service: Option<Box<dyn CmabService + Send + Sync>>,
    pub(crate) default_decide_options: DecideOptions,
}

impl DecisionServiceConfig {
    /// Create a default configuration: MurmurHash3 bucketing, no gateways, no default options.
    ///
    /// ```
    /// # use flagcore::DecisionServiceConfig;
    /// DecisionServiceConfig::new();
    /// ```
    pub fn new() -> Self {
        DecisionServiceConfig {
            sharder: Box::new(Murmur3Sharder),
            user_profile_service: None,
            cmab_service: None,
            default_decide_options: DecideOptions::new(),
        }
    }

    /// Set the storage used for sticky bucketing.
    pub fn user_profile_service(
        &mut self,
        user_profile_service: impl UserProfileService + Send + Sync + 'static,
    ) -> &mut Self {
        self.user_profile_service = Some(Box::new(user_profile_service));
        self
    }

    /// Set the gateway that serves decisions of bandit-controlled experiments.
    ///
    /// ```
    /// # use flagcore::{Attributes, DecisionServiceConfig};
    /// # use flagcore::cmab::{CmabError, DefaultCmabService};
    /// let client = |_rule_id: &str, _user_id: &str, _attributes: &Attributes, _uuid: &str| {
    ///     Err::<String, _>(CmabError::FetchFailed("offline".to_owned()))
    /// };
    /// let mut config = DecisionServiceConfig::new();
    /// config.cmab_service(DefaultCmabService::new(client));
    /// ```
    pub fn cmab_service(
        &mut self,
        cmab_service: impl CmabService + Send + Sync + 'static,
    ) -> &mut Self {
        self.cmab_service = Some(Box::new(cmab_service));
        self
    }

    /// Replace the hash function used for bucketing. Every SDK sharing decisions with this one
    /// must use the same function, so this is mostly useful in tests.
    pub fn sharder(&mut self, sharder: impl Sharder + Send + Sync + 'static) -> &mut Self {
        self.sharder = Box::new(sharder);
        self
    }

    /// Options merged into the options of every call.
    pub fn default_decide_options(&mut self, options: impl Into<DecideOptions>) -> &mut Self {
        self.default_decide_options = options.into();
        self
    }

    /// Create a new [`DecisionService`] using the specified configuration.
    ///
    /// ```
    /// # use flagcore::{DecisionService, DecisionServiceConfig};
    /// let service: DecisionService = DecisionServiceConfig::new().to_decision_service();
    /// ```
    pub fn to_decision_service(self) -> DecisionService {
        DecisionService::new(self)
    }
}

impl Default for DecisionServiceConfig {
    fn default() -> Self {
        DecisionServiceConfig::new()
    }
}
