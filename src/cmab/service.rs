use std::collections::BTreeMap;

use chrono::Duration;
use uuid::Uuid;

use crate::{
    bucketer::murmur3_32,
    decision::{DecideOption, DecideOptions},
    project_config::ProjectConfig,
    Attributes, UserContext,
};

use super::{CmabCache, CmabCacheValue, CmabClient, CmabDecision, CmabError, CmabService};

const ATTRIBUTES_HASH_SEED: u32 = 0;

/// [`CmabService`] caching the decisions of a [`CmabClient`] per user and rule.
///
/// Only the attributes listed in the experiment's bandit configuration are sent to the client. A
/// cached decision is reused while those attributes stay the same.
///
/// ```
/// # use flagcore::{Attributes, cmab::{CmabError, DefaultCmabService}};
/// let client = |_rule_id: &str, _user_id: &str, _attributes: &Attributes, _uuid: &str| {
///     Ok::<_, CmabError>("variation-1".to_owned())
/// };
/// let mut builder = DefaultCmabService::builder(client);
/// builder.cache_size(100);
/// let service = builder.build();
/// ```
pub struct DefaultCmabService<C> {
    client: C,
    cache: CmabCache,
}

pub struct DefaultCmabServiceBuilder<C> {
    client: C,
    cache_size: usize,
    cache_timeout: Duration,
    cache: Option<CmabCache>,
}

impl<C: CmabClient> DefaultCmabServiceBuilder<C> {
    /// Maximum number of cached decisions. Default: 1000.
    pub fn cache_size(&mut self, cache_size: usize) -> &mut Self {
        self.cache_size = cache_size;
        self
    }

    /// How long a cached decision stays valid. Default: 5 minutes.
    pub fn cache_timeout(&mut self, cache_timeout: Duration) -> &mut Self {
        self.cache_timeout = cache_timeout;
        self
    }

    /// Use a preconfigured cache. Overrides `cache_size` and `cache_timeout`.
    pub fn cache(&mut self, cache: CmabCache) -> &mut Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> DefaultCmabService<C> {
        let cache = self
            .cache
            .unwrap_or_else(|| CmabCache::new(self.cache_size, self.cache_timeout));
        DefaultCmabService {
            client: self.client,
            cache,
        }
    }
}

impl<C: CmabClient> DefaultCmabService<C> {
    pub fn builder(client: C) -> DefaultCmabServiceBuilder<C> {
        DefaultCmabServiceBuilder {
            client,
            cache_size: CmabCache::DEFAULT_MAX_SIZE,
            cache_timeout: Duration::seconds(CmabCache::DEFAULT_TIMEOUT_SECS),
            cache: None,
        }
    }

    pub fn new(client: C) -> DefaultCmabService<C> {
        DefaultCmabService::builder(client).build()
    }

    pub fn cache(&self) -> &CmabCache {
        &self.cache
    }

    fn fetch_decision(
        &self,
        rule_id: &str,
        user_id: &str,
        attributes: &Attributes,
    ) -> Result<CmabDecision, CmabError> {
        let cmab_uuid = Uuid::new_v4().to_string();
        let variation_id = self
            .client
            .fetch_decision(rule_id, user_id, attributes, &cmab_uuid)
            .inspect_err(|err| {
                log::warn!(target: "flagcore",
                           rule_id,
                           user_id,
                           cmab_uuid:display = cmab_uuid;
                           "CMAB fetch failed: {err}");
            })?;

        if variation_id.is_empty() {
            return Err(CmabError::InvalidResponse);
        }

        log::debug!(target: "flagcore",
                    rule_id,
                    user_id,
                    variation_id:display = variation_id,
                    cmab_uuid:display = cmab_uuid;
                    "fetched CMAB decision");
        Ok(CmabDecision {
            variation_id,
            cmab_uuid,
        })
    }
}

impl<C: CmabClient> CmabService for DefaultCmabService<C> {
    fn get_decision(
        &self,
        config: &ProjectConfig,
        user: &UserContext,
        rule_id: &str,
        options: &DecideOptions,
    ) -> Result<CmabDecision, CmabError> {
        let user_id = user.user_id();
        let attributes = filter_attributes(config, user, rule_id);

        if options.contains(DecideOption::IgnoreCmabCache) {
            return self.fetch_decision(rule_id, user_id, &attributes);
        }

        if options.contains(DecideOption::ResetCmabCache) {
            self.cache.reset();
        }

        let cache_key = cache_key(user_id, rule_id);
        if options.contains(DecideOption::InvalidateUserCmabCache) {
            self.cache.remove(&cache_key);
        }

        let attributes_hash = hash_attributes(&attributes);
        if let Some(cached) = self.cache.lookup(&cache_key) {
            if cached.attributes_hash == attributes_hash {
                return Ok(CmabDecision {
                    variation_id: cached.variation_id,
                    cmab_uuid: cached.cmab_uuid,
                });
            }
            self.cache.remove(&cache_key);
        }

        let decision = self.fetch_decision(rule_id, user_id, &attributes)?;
        self.cache.save(
            cache_key,
            CmabCacheValue {
                attributes_hash,
                variation_id: decision.variation_id.clone(),
                cmab_uuid: decision.cmab_uuid.clone(),
            },
        );
        Ok(decision)
    }
}

/// The user's attributes restricted to those the rule's bandit is configured with.
fn filter_attributes(config: &ProjectConfig, user: &UserContext, rule_id: &str) -> Attributes {
    let Some(experiment) = config.experiment_by_id(rule_id) else {
        log::debug!(target: "flagcore", rule_id; "experiment not found for CMAB rule");
        return Attributes::new();
    };
    let Some(cmab) = &experiment.cmab else {
        log::debug!(target: "flagcore", rule_id; "no CMAB configuration for rule");
        return Attributes::new();
    };

    let mut filtered = Attributes::new();
    for attribute_id in &cmab.attribute_ids {
        let Some(attribute) = config.attribute_by_id(attribute_id) else {
            log::debug!(target: "flagcore",
                        rule_id,
                        attribute_id:display = attribute_id;
                        "CMAB attribute is not in the datafile");
            continue;
        };
        if let Some(value) = user.attributes().get(&attribute.key) {
            filtered.insert(attribute.key.clone(), value.clone());
        }
    }
    filtered
}

fn cache_key(user_id: &str, rule_id: &str) -> String {
    format!("{}-{user_id}-{rule_id}", user_id.len())
}

fn hash_attributes(attributes: &Attributes) -> String {
    if attributes.is_empty() {
        return "empty".to_owned();
    }
    let sorted = attributes.iter().collect::<BTreeMap<_, _>>();
    let encoded = serde_json::to_string(&sorted).unwrap_or_default();
    format!("{:x}", murmur3_32(encoded.as_bytes(), ATTRIBUTES_HASH_SEED))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use serde_json::json;

    use super::*;
    use crate::AttributeValue;

    fn config() -> ProjectConfig {
        ProjectConfig::from_json(
            &json!({
                "attributes": [
                    {"id": "a1", "key": "plan"},
                    {"id": "a2", "key": "age"}
                ],
                "experiments": [{
                    "id": "rule1", "key": "bandit", "status": "Running",
                    "variations": [{"id": "v1", "key": "a"}, {"id": "v2", "key": "b"}],
                    "trafficAllocation": [],
                    "cmab": {"attributeIds": ["a1", "a2", "a404"], "trafficAllocation": 10000}
                }]
            })
            .to_string(),
        )
        .unwrap()
    }

    /// Client counting calls and recording the attributes it received.
    #[derive(Clone, Default)]
    struct ScriptedClient {
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<Attributes>>>,
    }

    impl CmabClient for ScriptedClient {
        fn fetch_decision(
            &self,
            _rule_id: &str,
            _user_id: &str,
            attributes: &Attributes,
            cmab_uuid: &str,
        ) -> Result<String, CmabError> {
            assert!(!cmab_uuid.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(attributes.clone());
            Ok("v2".to_owned())
        }
    }

    fn user(plan: &str) -> UserContext {
        UserContext::new(
            "user",
            [
                ("plan".to_owned(), AttributeValue::from(plan)),
                ("age".to_owned(), 30.into()),
                ("email".to_owned(), "user@example.com".into()),
            ]
            .into(),
        )
    }

    #[test]
    fn sends_only_configured_attributes() {
        let client = ScriptedClient::default();
        let service = DefaultCmabService::new(client.clone());

        let decision = service
            .get_decision(&config(), &user("gold"), "rule1", &DecideOptions::new())
            .unwrap();
        assert_eq!(decision.variation_id, "v2");

        let seen = client.seen.lock().unwrap();
        let mut keys = seen[0].keys().cloned().collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, vec!["age".to_owned(), "plan".to_owned()]);
    }

    #[test]
    fn reuses_cached_decision_while_attributes_match() {
        let client = ScriptedClient::default();
        let service = DefaultCmabService::new(client.clone());
        let config = config();
        let options = DecideOptions::new();

        let first = service.get_decision(&config, &user("gold"), "rule1", &options).unwrap();
        let second = service.get_decision(&config, &user("gold"), "rule1", &options).unwrap();
        assert_eq!(first, second);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);

        let third = service.get_decision(&config, &user("silver"), "rule1", &options).unwrap();
        assert_ne!(first.cmab_uuid, third.cmab_uuid);
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_options() {
        let client = ScriptedClient::default();
        let service = DefaultCmabService::new(client.clone());
        let config = config();
        let user = user("gold");

        service.get_decision(&config, &user, "rule1", &DecideOptions::new()).unwrap();

        let ignore = DecideOptions::from([DecideOption::IgnoreCmabCache]);
        service.get_decision(&config, &user, "rule1", &ignore).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert_eq!(service.cache().len(), 1);

        let invalidate = DecideOptions::from([DecideOption::InvalidateUserCmabCache]);
        service.get_decision(&config, &user, "rule1", &invalidate).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);

        let reset = DecideOptions::from([DecideOption::ResetCmabCache]);
        service.get_decision(&config, &user, "rule1", &reset).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);

        service.get_decision(&config, &user, "rule1", &DecideOptions::new()).unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn errors_are_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let client = move |_: &str, _: &str, _: &Attributes, _: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(CmabError::FetchFailed("503".to_owned()))
        };
        let service = DefaultCmabService::new(client);
        let config = config();

        for _ in 0..2 {
            let result = service.get_decision(&config, &user("gold"), "rule1", &DecideOptions::new());
            assert_eq!(result, Err(CmabError::FetchFailed("503".to_owned())));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(service.cache().is_empty());
    }

    #[test]
    fn empty_variation_is_invalid_response() {
        let client =
            |_: &str, _: &str, _: &Attributes, _: &str| Ok::<_, CmabError>(String::new());
        let service = DefaultCmabService::new(client);
        let result = service.get_decision(&config(), &user("gold"), "rule1", &DecideOptions::new());
        assert_eq!(result, Err(CmabError::InvalidResponse));
    }

    #[test]
    fn cache_key_and_hash() {
        assert_eq!(cache_key("user", "rule1"), "4-user-rule1");
        assert_eq!(hash_attributes(&Attributes::new()), "empty");

        let a: Attributes = [("x".to_owned(), 1.into()), ("y".to_owned(), "z".into())].into();
        let b: Attributes = [("y".to_owned(), "z".into()), ("x".to_owned(), 1.into())].into();
        assert_eq!(hash_attributes(&a), hash_attributes(&b));
    }
}
