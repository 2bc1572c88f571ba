//! Integration test: clone property composition.
//!
//! For random property sets P, exclusions E and overrides O, a clone's
//! properties equal (P \ E) ∪ O, with O winning on key collisions, and the
//! two tables stay independent afterwards.

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use tablet_admin::{LocalClient, PropertyMap, TableManager, TableOperations};

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

fn arb_key() -> impl Strategy<Value = String> {
    "[a-z]{1,3}(\\.[a-z]{1,3})?"
}

fn arb_props() -> impl Strategy<Value = PropertyMap> {
    prop::collection::btree_map(arb_key(), "[ -~]{0,8}", 0..12)
}

fn arb_exclusions() -> impl Strategy<Value = BTreeSet<String>> {
    prop::collection::btree_set(arb_key(), 0..8)
}

fn expected_clone(source: &PropertyMap, exclude: &BTreeSet<String>, overrides: &PropertyMap) -> PropertyMap {
    let mut expected: PropertyMap = source
        .iter()
        .filter(|(k, _)| !exclude.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    expected.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    expected
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_clone_is_difference_union_overrides(
        source in arb_props(),
        exclude in arb_exclusions(),
        overrides in arb_props(),
    ) {
        let ops = TableOperations::new(LocalClient::new(Arc::new(TableManager::new())));
        ops.create("src").unwrap();
        for (key, value) in &source {
            ops.set_property("src", key, value).unwrap();
        }
        let src_props = ops.get_properties("src").unwrap();

        ops.clone_table("src", "dst", false, overrides.clone(), exclude.clone()).unwrap();

        prop_assert_eq!(
            ops.get_properties("dst").unwrap(),
            expected_clone(&src_props, &exclude, &overrides)
        );
    }

    #[test]
    fn prop_clone_is_independent_of_source(
        source in arb_props(),
        later_key in arb_key(),
        later_value in "[a-z]{1,6}",
    ) {
        let ops = TableOperations::new(LocalClient::new(Arc::new(TableManager::new())));
        ops.create("src").unwrap();
        for (key, value) in &source {
            ops.set_property("src", key, value).unwrap();
        }
        ops.clone_table("src", "dst", false, PropertyMap::new(), BTreeSet::new()).unwrap();
        let snapshot = ops.get_properties("dst").unwrap();

        ops.set_property("src", &later_key, &later_value).unwrap();
        ops.delete("src").unwrap();

        prop_assert_eq!(ops.get_properties("dst").unwrap(), snapshot);
    }
}
