//! Hash partitioning of users into groups, variations and bandit eligibility.
use std::{io::Cursor, sync::Arc};

use crate::{
    decision::{DecisionReasons, DecisionResponse},
    project_config::{Experiment, GroupPolicy, ProjectConfig, TrafficAllocation, Variation},
};

/// Size of the hash domain. Bucket values fall into `[0, MAX_TRAFFIC_VALUE)`.
pub const MAX_TRAFFIC_VALUE: u32 = 10_000;

const MURMUR_HASH_SEED: u32 = 1;

/// Entity id of the single allocation entry used to test bandit eligibility.
const CMAB_ELIGIBLE_ENTITY_ID: &str = "$";

pub trait Sharder {
    /// Map `key` to a bucket value in `[0, MAX_TRAFFIC_VALUE)`.
    fn bucket_value(&self, key: &str) -> u32;
}

impl<S: Sharder + ?Sized> Sharder for Box<S> {
    fn bucket_value(&self, key: &str) -> u32 {
        (**self).bucket_value(key)
    }
}

/// The default sharder: 32-bit MurmurHash3 (x86 variant, seed 1) over the UTF-8 bytes of the key,
/// scaled to the hash domain. Must produce the same bucket as every other SDK for the same key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Murmur3Sharder;

impl Sharder for Murmur3Sharder {
    fn bucket_value(&self, key: &str) -> u32 {
        let hash = murmur3_32(key.as_bytes(), MURMUR_HASH_SEED);
        // floor(MAX_TRAFFIC_VALUE * hash / 2^32), computed exactly.
        ((u64::from(hash) * u64::from(MAX_TRAFFIC_VALUE)) >> 32) as u32
    }
}

pub(crate) fn murmur3_32(bytes: &[u8], seed: u32) -> u32 {
    murmur3::murmur3_32(&mut Cursor::new(bytes), seed)
        .expect("reading from an in-memory buffer cannot fail")
}

/// Return the entity of the first allocation whose `end_of_range` exceeds `bucket_value`.
///
/// `None` if no entry covers the value or the covering entry is deliberately unallocated (empty
/// entity id).
pub fn allocate(bucket_value: u32, allocations: &[TrafficAllocation]) -> Option<&str> {
    let allocation = allocations
        .iter()
        .find(|allocation| bucket_value < allocation.end_of_range)?;
    if allocation.entity_id.is_empty() {
        None
    } else {
        Some(&allocation.entity_id)
    }
}

/// Assigns users to variations by hashing their bucketing id.
pub struct Bucketer<S> {
    sharder: S,
}

impl<S: Sharder> Bucketer<S> {
    pub fn new(sharder: S) -> Bucketer<S> {
        Bucketer { sharder }
    }

    /// Bucket a user into a variation of `experiment`, honoring mutually-exclusive groups.
    pub fn bucket(
        &self,
        experiment: &Experiment,
        bucketing_id: &str,
        config: &ProjectConfig,
    ) -> DecisionResponse<Option<Arc<Variation>>> {
        let mut reasons = DecisionReasons::new();

        if !self
            .check_group(experiment, bucketing_id, config)
            .unpack(&mut reasons)
        {
            return DecisionResponse::new(None, reasons);
        }

        let variation = self
            .bucket_to_variation(experiment, bucketing_id)
            .unpack(&mut reasons);
        DecisionResponse::new(variation, reasons)
    }

    /// Decide whether a user falls into the bandit-controlled share of `experiment`.
    ///
    /// Group exclusion applies as for [`Bucketer::bucket`]. Returns the eligibility entity id, or
    /// `None` when the user is outside the bandit's traffic.
    pub fn bucket_for_cmab(
        &self,
        experiment: &Experiment,
        traffic_allocation: u32,
        bucketing_id: &str,
        config: &ProjectConfig,
    ) -> DecisionResponse<Option<String>> {
        let mut reasons = DecisionReasons::new();

        if !self
            .check_group(experiment, bucketing_id, config)
            .unpack(&mut reasons)
        {
            return DecisionResponse::new(None, reasons);
        }

        let allocations = [TrafficAllocation::new(
            CMAB_ELIGIBLE_ENTITY_ID,
            traffic_allocation,
        )];
        let bucket_value = self.bucket_value(&format!("{bucketing_id}{}", experiment.id));
        let entity_id = allocate(bucket_value, &allocations).map(str::to_owned);
        DecisionResponse::new(entity_id, reasons)
    }

    /// For members of a `random` group, whether the group hash lands on `experiment` itself.
    fn check_group(
        &self,
        experiment: &Experiment,
        bucketing_id: &str,
        config: &ProjectConfig,
    ) -> DecisionResponse<bool> {
        let mut reasons = DecisionReasons::new();

        let Some(group_id) = experiment.group_id.as_deref().filter(|id| !id.is_empty()) else {
            return DecisionResponse::new(true, reasons);
        };
        let Some(group) = config.group_by_id(group_id) else {
            reasons.error(format!(
                "Group \"{group_id}\" of experiment \"{}\" is not in the datafile.",
                experiment.key
            ));
            return DecisionResponse::new(false, reasons);
        };
        if group.policy != GroupPolicy::Random {
            return DecisionResponse::new(true, reasons);
        }

        let bucket_value = self.bucket_value(&format!("{bucketing_id}{}", group.id));
        log::debug!(target: "flagcore",
                    bucketing_id,
                    group_id,
                    bucket_value;
                    "assigned bucket during group bucketing");

        let bucketed_experiment = allocate(bucket_value, &group.traffic_allocation)
            .and_then(|experiment_id| config.experiment_by_id(experiment_id));
        let Some(bucketed_experiment) = bucketed_experiment else {
            reasons.info(format!(
                "User with bucketingId \"{bucketing_id}\" is not in any experiment of group {group_id}."
            ));
            return DecisionResponse::new(false, reasons);
        };

        if bucketed_experiment.id != experiment.id {
            reasons.info(format!(
                "User with bucketingId \"{bucketing_id}\" is not in experiment \"{}\" of group {group_id}.",
                experiment.key
            ));
            return DecisionResponse::new(false, reasons);
        }

        reasons.info(format!(
            "User with bucketingId \"{bucketing_id}\" is in experiment \"{}\" of group {group_id}.",
            experiment.key
        ));
        DecisionResponse::new(true, reasons)
    }

    fn bucket_to_variation(
        &self,
        experiment: &Experiment,
        bucketing_id: &str,
    ) -> DecisionResponse<Option<Arc<Variation>>> {
        let mut reasons = DecisionReasons::new();

        let bucket_value = self.bucket_value(&format!("{bucketing_id}{}", experiment.id));
        log::debug!(target: "flagcore",
                    bucketing_id,
                    experiment_key:display = experiment.key,
                    bucket_value;
                    "assigned bucket during variation bucketing");

        let variation = allocate(bucket_value, &experiment.traffic_allocation).and_then(|id| {
            let variation = experiment.variation_by_id(id);
            if variation.is_none() {
                reasons.error(format!(
                    "Variation \"{id}\" allocated in experiment \"{}\" is not in the datafile.",
                    experiment.key
                ));
            }
            variation.cloned()
        });

        match &variation {
            Some(variation) => reasons.info(format!(
                "User with bucketingId \"{bucketing_id}\" is in variation \"{}\" of experiment \"{}\".",
                variation.key, experiment.key
            )),
            None => reasons.info(format!(
                "User with bucketingId \"{bucketing_id}\" is not in any variation of experiment \"{}\".",
                experiment.key
            )),
        }

        DecisionResponse::new(variation, reasons)
    }

    fn bucket_value(&self, key: &str) -> u32 {
        self.sharder.bucket_value(key)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;

    /// Sharder returning a fixed bucket value per key, recording each key it is asked about.
    struct FixedSharder {
        values: Vec<(String, u32)>,
        calls: RefCell<Vec<String>>,
    }

    impl FixedSharder {
        fn new(values: &[(&str, u32)]) -> FixedSharder {
            FixedSharder {
                values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Sharder for FixedSharder {
        fn bucket_value(&self, key: &str) -> u32 {
            self.calls.borrow_mut().push(key.to_owned());
            self.values
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        }
    }

    #[test]
    fn murmur3_matches_reference_vectors() {
        assert_eq!(murmur3_32(b"", 0), 0);
        assert_eq!(murmur3_32(b"", 1), 0x514e_28b7);
        assert_eq!(murmur3_32(b"hello", 0), 0x248b_fa47);
        assert_eq!(murmur3_32(b"Hello, world!", 1234), 0xfaf6_cdb3);
    }

    #[test]
    fn bucket_value_is_deterministic_and_in_range() {
        for key in ["", "user", "ppid1111111", "a much longer bucketing id with ünïcödé"] {
            let value = Murmur3Sharder.bucket_value(key);
            assert!(value < MAX_TRAFFIC_VALUE);
            assert_eq!(value, Murmur3Sharder.bucket_value(key));
        }
    }

    #[test]
    fn bucket_values_match_other_sdks() {
        let experiment_id = 1_886_780_721_u64;
        let cases = [
            (format!("ppid1{experiment_id}"), 5254),
            (format!("ppid2{experiment_id}"), 4299),
            (format!("ppid2{}", experiment_id + 1), 2434),
            (format!("ppid3{experiment_id}"), 5439),
            (
                format!(
                    "a very very very very very very very very very very very very very very very long ppd string{experiment_id}"
                ),
                6128,
            ),
        ];
        for (key, expected) in cases {
            assert_eq!(Murmur3Sharder.bucket_value(&key), expected, "{key}");
        }
    }

    #[test]
    fn bucket_value_scales_hash_exactly() {
        // floor(10000 * h / 2^32) with floating point, for comparison.
        for key in ["ppid1111111", "ppid2222222", "user42", "x"] {
            let hash = murmur3_32(key.as_bytes(), 1);
            let expected = (10_000.0 * (hash as f64) / 4_294_967_296.0).floor() as u32;
            assert_eq!(Murmur3Sharder.bucket_value(key), expected);
        }
    }

    #[test]
    fn allocate_uses_first_range_exceeding_value() {
        let allocations = [
            TrafficAllocation::new("A", 5000),
            TrafficAllocation::new("B", 10000),
        ];
        assert_eq!(allocate(3000, &allocations), Some("A"));
        assert_eq!(allocate(4999, &allocations), Some("A"));
        assert_eq!(allocate(5000, &allocations), Some("B"));
        assert_eq!(allocate(9000, &allocations), Some("B"));
        assert_eq!(allocate(10000, &allocations), None);
    }

    #[test]
    fn allocate_partitions_domain() {
        let allocations = [
            TrafficAllocation::new("A", 2500),
            TrafficAllocation::new("", 4000),
            TrafficAllocation::new("B", 7000),
        ];
        for value in 0..MAX_TRAFFIC_VALUE {
            let expected = match value {
                0..=2499 => Some("A"),
                2500..=3999 => None,
                4000..=6999 => Some("B"),
                _ => None,
            };
            assert_eq!(allocate(value, &allocations), expected, "value {value}");
        }
    }

    fn grouped_config() -> ProjectConfig {
        let experiment = |id: &str, key: &str| {
            json!({
                "id": id, "key": key, "status": "Running",
                "variations": [{"id": format!("{id}_v"), "key": format!("{key}_v")}],
                "trafficAllocation": [{"entityId": format!("{id}_v"), "endOfRange": 10000}]
            })
        };
        ProjectConfig::from_json(
            &json!({
                "groups": [{
                    "id": "g1",
                    "policy": "random",
                    "trafficAllocation": [
                        {"entityId": "e1", "endOfRange": 3000},
                        {"entityId": "e2", "endOfRange": 6000},
                        {"entityId": "", "endOfRange": 8000},
                        {"entityId": "deleted", "endOfRange": 10000}
                    ],
                    "experiments": [experiment("e1", "first"), experiment("e2", "second")]
                }]
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn group_assignment_excludes_other_members() {
        let config = grouped_config();
        let first = config.experiment_by_key("first").unwrap();
        let second = config.experiment_by_key("second").unwrap();

        let bucketer = Bucketer::new(FixedSharder::new(&[("userg1", 1000)]));
        let response = bucketer.bucket(first, "user", &config);
        assert_eq!(response.result.unwrap().key, "first_v");

        let response = bucketer.bucket(second, "user", &config);
        assert!(response.result.is_none());
        assert!(response.reasons.messages().contains(
            &"User with bucketingId \"user\" is not in experiment \"second\" of group g1."
        ));
    }

    #[test]
    fn group_and_variation_use_independent_salts() {
        let config = grouped_config();
        let first = config.experiment_by_key("first").unwrap();

        let bucketer = Bucketer::new(FixedSharder::new(&[("userg1", 1000)]));
        bucketer.bucket(first, "user", &config);
        assert_eq!(
            *bucketer.sharder.calls.borrow(),
            vec!["userg1".to_owned(), "usere1".to_owned()]
        );
    }

    #[test]
    fn unallocated_or_unknown_group_entity_is_no_experiment() {
        let config = grouped_config();
        let first = config.experiment_by_key("first").unwrap();

        for value in [7000, 9000] {
            let bucketer = Bucketer::new(FixedSharder::new(&[("userg1", value)]));
            let response = bucketer.bucket(first, "user", &config);
            assert!(response.result.is_none());
            assert!(response
                .reasons
                .messages()
                .contains(&"User with bucketingId \"user\" is not in any experiment of group g1."));
        }
    }

    #[test]
    fn cmab_eligibility_uses_single_allocation() {
        let config = grouped_config();
        let first = config.experiment_by_key("first").unwrap();

        let bucketer = Bucketer::new(FixedSharder::new(&[("userg1", 0), ("usere1", 4999)]));
        let response = bucketer.bucket_for_cmab(first, 5000, "user", &config);
        assert_eq!(response.result.as_deref(), Some("$"));

        let response = bucketer.bucket_for_cmab(first, 4999, "user", &config);
        assert_eq!(response.result, None);
    }
}
