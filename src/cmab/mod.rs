//! Contextual multi-armed bandit gateway.
//!
//! Bandit-controlled experiments delegate the choice of variation to an external service. The
//! resolver talks to it through [`CmabService`]; [`DefaultCmabService`] adds per-user caching on
//! top of a [`CmabClient`] that performs the actual remote call.
mod cache;
mod service;

use std::sync::Arc;

use thiserror::Error;

use crate::{decision::DecideOptions, project_config::ProjectConfig, Attributes, UserContext};

pub use cache::{CmabCache, CmabCacheValue};
pub use service::{DefaultCmabService, DefaultCmabServiceBuilder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmabDecision {
    pub variation_id: String,
    /// Correlation id tagging impressions of this decision.
    pub cmab_uuid: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CmabError {
    #[error("failed to fetch CMAB decision: {0}")]
    FetchFailed(String),

    #[error("invalid CMAB response")]
    InvalidResponse,
}

/// Source of bandit decisions as seen by the resolver.
///
/// Called synchronously from the resolving thread; timeouts and retries are the implementation's
/// business.
pub trait CmabService {
    fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        rule_id: &str,
        options: &DecideOptions,
    ) -> Result<CmabDecision, CmabError>;
}

impl<T: CmabService + ?Sized> CmabService for Arc<T> {
    fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        rule_id: &str,
        options: &DecideOptions,
    ) -> Result<CmabDecision, CmabError> {
        (**self).get_decision(config, user, rule_id, options)
    }
}

impl<T: CmabService + ?Sized> CmabService for Box<T> {
    fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        rule_id: &str,
        options: &DecideOptions,
    ) -> Result<CmabDecision, CmabError> {
        (**self).get_decision(config, user, rule_id, options)
    }
}

/// Remote bandit endpoint. Returns the id of the chosen variation.
pub trait CmabClient {
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &Attributes,
        cmab_uuid: &str,
    ) -> Result<String, CmabError>;
}

impl<T> CmabClient for T
where
    T: Fn(&str, &str, &Attributes, &str) -> Result<String, CmabError>,
{
    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &Attributes,
        cmab_uuid: &str,
    ) -> Result<String, CmabError> {
        self(rule_id, user_id, attributes, cmab_uuid)
    }
}
