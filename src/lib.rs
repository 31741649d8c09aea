//! Decision-resolution core for feature flags and experiments.
//!
//! # Overview
//!
//! Given a user (a [`UserContext`] with an id and [`Attributes`]) and an indexed
//! [`ProjectConfig`], a [`DecisionService`] deterministically decides which variation of an
//! experiment or flag the user receives, and records the trail of reasons that led there.
//!
//! Experiments go through a fixed pipeline: runtime overrides ([`OverrideTable`]), the static
//! whitelist, sticky bucketing through a [`UserProfileService`](user_profile::UserProfileService),
//! audience targeting and finally hash bucketing or a contextual-bandit gateway
//! ([`cmab::CmabService`]). Flags layer forced decisions, holdouts, experiment rules and rollout
//! rules on top of that pipeline.
//!
//! ```
//! # use flagcore::{Attributes, DecisionServiceConfig, ProjectConfig, UserContext};
//! # use flagcore::decision::DecideOptions;
//! let config = ProjectConfig::from_json(r#"{
//!     "experiments": [{
//!         "id": "1", "key": "checkout", "status": "Running",
//!         "variations": [{"id": "10", "key": "on", "featureEnabled": true}],
//!         "trafficAllocation": [{"entityId": "10", "endOfRange": 10000}]
//!     }],
//!     "featureFlags": [{"id": "f", "key": "new_checkout", "experimentIds": ["1"]}]
//! }"#).unwrap();
//!
//! let service = DecisionServiceConfig::new().to_decision_service();
//! let user = UserContext::new("user-1", Attributes::new());
//!
//! let decision = service.decide("new_checkout", &user, &config, &DecideOptions::new());
//! assert!(decision.enabled);
//! assert_eq!(decision.variation_key.as_deref(), Some("on"));
//! ```
//!
//! # Error Handling
//!
//! Construction and lookup errors are represented by the [`Error`] enum.
//!
//! Resolution itself does not fail. Malformed conditions, missing references and gateway failures
//! degrade to a decision without a variation, with the cause recorded in its reasons. The only
//! exception is a failing contextual-bandit gateway, which is reported with the decision's
//! `error` flag so that callers can apply their own fallback.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging
//! messages, under the `flagcore` target. Every decision reason is logged as well. Consider
//! integrating a `log`-compatible logger implementation for better visibility into resolution.

#![warn(rustdoc::missing_crate_level_docs)]

mod attributes;
pub mod audience;
pub mod bucketer;
pub mod cmab;
mod config;
pub mod decision;
mod error;
mod overrides;
pub mod project_config;
mod user_context;
pub mod user_profile;

pub use attributes::{AttributeValue, Attributes, BUCKETING_ID_ATTRIBUTE};
pub use config::DecisionServiceConfig;
pub use decision::{
    DecideOption, DecideOptions, DecisionService, DecisionSource, FeatureDecision, FlagDecision,
    VariationDecision,
};
pub use error::{Error, Result};
pub use overrides::OverrideTable;
pub use project_config::ProjectConfig;
pub use user_context::UserContext;
