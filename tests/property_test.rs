// Property-based tests for the partition math.

use citrine::core::admin::partition::{
    NUM_PARTITIONS, compute_all_ranges, compute_ranges, get_proxy_for_partition, hash_namespace,
    validate_coverage,
};
use citrine::core::admin::state::{HealthStatus, ProxyInfo};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn proxy_set(ids: &[String]) -> BTreeMap<String, ProxyInfo> {
    ids.iter()
        .map(|id| {
            (
                id.clone(),
                ProxyInfo {
                    proxy_id: id.clone(),
                    address: format!("{id}:8080"),
                    region: "r".to_string(),
                    version: "1".to_string(),
                    capabilities: Default::default(),
                    status: HealthStatus::Healthy,
                    last_seen: 0,
                    registered_at: 0,
                    resources: Default::default(),
                },
            )
        })
        .collect()
}

prop_compose! {
    fn arb_proxy_ids()(ids in proptest::collection::btree_set("[a-z0-9]{1,12}", 1..64)) -> Vec<String> {
        ids.into_iter().collect()
    }
}

proptest! {
    #[test]
    fn ranges_cover_the_keyspace_exactly_once(ids in arb_proxy_ids()) {
        let set = proxy_set(&ids);
        prop_assert!(validate_coverage(&set).is_ok());
    }

    #[test]
    fn ranges_are_deterministic(ids in arb_proxy_ids()) {
        let set = proxy_set(&ids);
        let first = compute_all_ranges(&set);
        let second = compute_all_ranges(&set);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn every_partition_maps_into_its_owners_range(ids in arb_proxy_ids()) {
        let set = proxy_set(&ids);
        for partition in 0..NUM_PARTITIONS {
            let owner = get_proxy_for_partition(partition, &set).unwrap().unwrap();
            let range = compute_ranges(&owner, &set).unwrap();
            prop_assert!(range.contains(partition));
        }
    }

    #[test]
    fn namespace_hash_is_stable_and_bounded(name in ".{0,64}") {
        let first = hash_namespace(&name);
        prop_assert_eq!(first, hash_namespace(&name));
        prop_assert!((0..NUM_PARTITIONS).contains(&first));
    }
}
