//! Property tests for the versioned cache engine.
//!
//! Covers write-policy enforcement, ETag latest-wins, timestamp history,
//! round trips, sandwich reconciliation, alias resolution and metadata
//! deduplication against real LMDB caches in temporary directories, plus
//! the policy checks on their own.

use proptest::prelude::*;
use vellum_core::{CacheDescriptor, CachePolicy, CacheableObject, Etag, Timestamp};
use vellum_storage::policy;
use vellum_test_utils::assertions::{assert_policy_violation, assert_unique_violation};
use vellum_test_utils::generators::*;
use vellum_test_utils::{fixtures, temp_cache, ts, Geography, Locality, Namespace, Plan};

const NS: &str = "census";

fn write_allowed(policy: CachePolicy, valid_from: bool, etag: bool) -> bool {
    match policy {
        CachePolicy::None => !valid_from && !etag,
        CachePolicy::ETag => !valid_from && etag,
        CachePolicy::Timestamp => valid_from && !etag,
    }
}

fn collect_allowed(policy: CachePolicy, valid_at: bool, etag: bool) -> bool {
    match policy {
        CachePolicy::None => false,
        CachePolicy::ETag => !valid_at && etag,
        CachePolicy::Timestamp => valid_at && etag,
    }
}

// ============================================================================
// WRITE-POLICY ENFORCEMENT
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every marker combination outside the policy's valid set is rejected
    /// and leaves no record behind.
    #[test]
    fn prop_invalid_write_markers_rejected(
        markers in arb_write_markers(),
        locality in arb_locality(),
        namespace in arb_namespace(),
        plan in arb_plan(),
        path in arb_path(),
    ) {
        let (valid_from, etag) = markers;
        let (mut cache, _dir) = temp_cache();

        let outcomes = [
            (
                Locality::CACHE_POLICY,
                Locality::CACHE_NAME,
                cache.insert(&locality, &path, NS, valid_from, etag.as_ref()),
                cache.version_count::<Locality>(&path, NS).unwrap(),
            ),
            (
                Namespace::CACHE_POLICY,
                Namespace::CACHE_NAME,
                cache.insert(&namespace, &path, NS, valid_from, etag.as_ref()),
                cache.version_count::<Namespace>(&path, NS).unwrap(),
            ),
            (
                Plan::CACHE_POLICY,
                Plan::CACHE_NAME,
                cache.insert(&plan, &path, NS, valid_from, etag.as_ref()),
                cache.version_count::<Plan>(&path, NS).unwrap(),
            ),
        ];

        for (policy, name, result, stored) in outcomes {
            if write_allowed(policy, valid_from.is_some(), etag.is_some()) {
                prop_assert!(result.is_ok(), "{name}: {result:?}");
                prop_assert_eq!(stored, 1);
            } else {
                assert_policy_violation(&result, name);
                prop_assert_eq!(stored, 0);
            }
        }
    }

    /// The write and collect checks accept exactly the valid marker sets of
    /// each policy, and every rejection names the checked type.
    #[test]
    fn prop_policy_checks_are_total(policy in arb_policy(), markers in arb_write_markers()) {
        let desc = CacheDescriptor {
            name: "sample",
            policy,
            aliased: false,
        };
        let (marker_at, etag) = markers;

        let write = policy::check_write(&desc, marker_at, etag.as_ref());
        prop_assert_eq!(
            write.is_ok(),
            write_allowed(policy, marker_at.is_some(), etag.is_some())
        );
        if let Err(err) = write {
            prop_assert_eq!(err.type_name(), "sample");
        }

        let collect = policy::check_collect(&desc, marker_at, etag.as_ref());
        prop_assert_eq!(
            collect.is_ok(),
            collect_allowed(policy, marker_at.is_some(), etag.is_some())
        );
        if let Err(err) = collect {
            prop_assert_eq!(err.type_name(), "sample");
        }
    }

    /// Objects and snapshots stored in one namespace are invisible from any
    /// other.
    #[test]
    fn prop_namespaces_are_isolated(
        home in arb_namespace_name(),
        away in arb_namespace_name(),
        path in arb_path(),
        etag in arb_etag(),
    ) {
        prop_assume!(home != away);
        let (mut cache, _dir) = temp_cache();
        cache.insert(&fixtures::namespace(&path), &path, &home, None, None).unwrap();
        cache
            .insert(&fixtures::locality("Boston", &[]), &path, &home, None, Some(&etag))
            .unwrap();
        cache.collect::<Locality>(&home, None, Some(&etag)).unwrap();

        prop_assert!(cache.get::<Namespace>(&path, &away, None, None).unwrap().is_none());
        prop_assert!(cache.get::<Locality>(&path, &away, None, None).unwrap().is_none());
        prop_assert!(cache.all::<Locality>(&away, None).unwrap().is_none());

        let hit = cache.get::<Namespace>(&path, &home, None, None).unwrap().unwrap();
        prop_assert_eq!(hit.value, fixtures::namespace(&path));
        prop_assert_eq!(cache.all::<Locality>(&home, None).unwrap().unwrap().len(), 1);
    }

    /// Any object written under a valid marker reads back equal.
    #[test]
    fn prop_roundtrip_with_matching_selectors(
        locality in arb_locality(),
        plan in arb_plan(),
        namespace in arb_namespace(),
        etag in arb_etag(),
        valid_from in arb_timestamp(),
        path in arb_path(),
    ) {
        let (mut cache, _dir) = temp_cache();
        cache.insert(&locality, &path, NS, None, Some(&etag)).unwrap();
        cache.insert(&plan, &path, NS, Some(valid_from), None).unwrap();
        cache.insert(&namespace, &path, NS, None, None).unwrap();

        let hit = cache.get::<Locality>(&path, NS, None, Some(&etag)).unwrap().unwrap();
        prop_assert_eq!(hit.value, locality);
        prop_assert_eq!(hit.etag, Some(etag));

        let hit = cache.get::<Plan>(&path, NS, Some(valid_from), None).unwrap().unwrap();
        prop_assert_eq!(hit.value, plan);
        prop_assert_eq!(hit.valid_from, Some(valid_from));

        let hit = cache.get::<Namespace>(&path, NS, None, None).unwrap().unwrap();
        prop_assert_eq!(hit.value, namespace);
    }

    /// Timestamp history: every version is kept and `get(at = t_i)` returns
    /// version `i`.
    #[test]
    fn prop_timestamp_history_retained(stamps in arb_ascending_timestamps(4)) {
        let (mut cache, _dir) = temp_cache();
        for (n, at) in stamps.iter().enumerate() {
            cache
                .insert(&fixtures::plan("ward", n as u32), "/p", NS, Some(*at), None)
                .unwrap();
        }
        prop_assert_eq!(cache.version_count::<Plan>("/p", NS).unwrap(), stamps.len());

        for (n, at) in stamps.iter().enumerate() {
            let hit = cache.get::<Plan>("/p", NS, Some(*at), None).unwrap().unwrap();
            prop_assert_eq!(hit.value.assignments, n as u32);
            prop_assert_eq!(hit.valid_from, Some(*at));
        }
    }
}

// ============================================================================
// ETAG LATEST-WINS
// ============================================================================

#[test]
fn etag_latest_wins() {
    let (mut cache, _dir) = temp_cache();
    let a = Etag::from("a");
    let b = Etag::from("b");

    cache
        .insert(&fixtures::locality("Boston", &[]), "/ma/boston", NS, None, Some(&a))
        .unwrap();
    cache
        .insert(&fixtures::locality("Boston v2", &[]), "/ma/boston", NS, None, Some(&b))
        .unwrap();

    assert_eq!(cache.version_count::<Locality>("/ma/boston", NS).unwrap(), 1);
    let latest = cache
        .get::<Locality>("/ma/boston", NS, None, None)
        .unwrap()
        .unwrap();
    assert_eq!(latest.value.name, "Boston v2");
    assert_eq!(latest.etag, Some(b.clone()));

    assert!(cache
        .get::<Locality>("/ma/boston", NS, None, Some(&a))
        .unwrap()
        .is_none());
    assert!(cache
        .get::<Locality>("/ma/boston", NS, None, Some(&b))
        .unwrap()
        .is_some());
}

// ============================================================================
// TIMESTAMP READS
// ============================================================================

#[test]
fn timestamp_get_between_versions() {
    let (mut cache, _dir) = temp_cache();
    for (n, at) in [10, 20, 30].into_iter().enumerate() {
        cache
            .insert(&fixtures::plan("ward", n as u32), "/p", NS, Some(ts(at)), None)
            .unwrap();
    }

    let at = |secs| {
        cache
            .get::<Plan>("/p", NS, Some(ts(secs)), None)
            .unwrap()
            .map(|hit| hit.value.assignments)
    };
    assert_eq!(at(5), None);
    assert_eq!(at(10), Some(0));
    assert_eq!(at(25), Some(1));
    assert_eq!(at(1_000), Some(2));

    let latest = cache.get::<Plan>("/p", NS, None, None).unwrap().unwrap();
    assert_eq!(latest.value.assignments, 2);
    assert_eq!(latest.valid_from, Some(ts(30)));
}

#[test]
fn timestamp_paths_are_isolated() {
    let (mut cache, _dir) = temp_cache();
    cache
        .insert(&fixtures::plan("a", 1), "/p", NS, Some(ts(10)), None)
        .unwrap();
    cache
        .insert(&fixtures::plan("b", 2), "/p/sub", NS, Some(ts(10)), None)
        .unwrap();
    cache
        .insert(&fixtures::plan("c", 3), "/p", "other", Some(ts(10)), None)
        .unwrap();

    assert_eq!(cache.version_count::<Plan>("/p", NS).unwrap(), 1);
    let hit = cache.get::<Plan>("/p", NS, None, None).unwrap().unwrap();
    assert_eq!(hit.value.name, "a");
}

// ============================================================================
// COLLECTIONS
// ============================================================================

fn seed_sandwich(later_etag: &str) -> (vellum_test_utils::VersionedCache, tempfile::TempDir) {
    let (mut cache, dir) = temp_cache();
    let x = Etag::from("x");

    cache
        .insert(&fixtures::plan("a", 1), "/a", NS, Some(ts(10)), None)
        .unwrap();
    cache
        .insert(&fixtures::plan("b", 1), "/b", NS, Some(ts(5)), None)
        .unwrap();
    cache.collect::<Plan>(NS, Some(ts(10)), Some(&x)).unwrap();

    cache
        .insert(&fixtures::plan("a", 2), "/a", NS, Some(ts(25)), None)
        .unwrap();
    cache
        .collect::<Plan>(NS, Some(ts(30)), Some(&Etag::from(later_etag)))
        .unwrap();
    (cache, dir)
}

#[test]
fn sandwich_with_equal_etags_uses_earlier_snapshot() {
    let (cache, _dir) = seed_sandwich("x");
    let all = cache.all::<Plan>(NS, Some(ts(20))).unwrap().unwrap();
    assert_eq!(all.valid_at, Some(ts(10)));
    assert_eq!(all.len(), 2);
    assert_eq!(all.get("/a").unwrap().assignments, 1);
    assert_eq!(all.get("/b").unwrap().assignments, 1);
}

#[test]
fn sandwich_with_different_etags_is_not_found() {
    let (cache, _dir) = seed_sandwich("y");
    assert!(cache.all::<Plan>(NS, Some(ts(20))).unwrap().is_none());
}

#[test]
fn exact_and_open_ended_snapshot_queries() {
    let (cache, _dir) = seed_sandwich("y");

    let exact = cache.all::<Plan>(NS, Some(ts(30))).unwrap().unwrap();
    assert_eq!(exact.valid_at, Some(ts(30)));
    assert_eq!(exact.get("/a").unwrap().assignments, 2);

    let latest = cache.all::<Plan>(NS, None).unwrap().unwrap();
    assert_eq!(latest.valid_at, Some(ts(30)));
    assert_eq!(latest.etag, Some(Etag::from("y")));

    assert!(cache.all::<Plan>(NS, Some(ts(5))).unwrap().is_none());
    assert!(cache.all::<Plan>(NS, Some(ts(40))).unwrap().is_none());
    assert!(cache.all::<Plan>("elsewhere", None).unwrap().is_none());
}

#[test]
fn duplicate_timestamp_snapshot_rejected() {
    let (mut cache, _dir) = temp_cache();
    let x = Etag::from("x");
    cache.collect::<Plan>(NS, Some(ts(10)), Some(&x)).unwrap();
    assert_unique_violation(&cache.collect::<Plan>(NS, Some(ts(10)), Some(&x)));
}

#[test]
fn etag_collection_keeps_single_live_snapshot() {
    let (mut cache, _dir) = temp_cache();
    let v1 = Etag::from("v1");
    let v2 = Etag::from("v2");

    assert!(cache.all::<Locality>(NS, None).unwrap().is_none());

    cache
        .insert(&fixtures::locality("Boston", &[]), "/boston", NS, None, Some(&v1))
        .unwrap();
    cache
        .insert(&fixtures::locality("Salem", &[]), "/salem", NS, None, Some(&v1))
        .unwrap();
    cache.collect::<Locality>(NS, None, Some(&v1)).unwrap();
    cache.collect::<Locality>(NS, None, Some(&v2)).unwrap();

    let all = cache.all::<Locality>(NS, None).unwrap().unwrap();
    assert_eq!(all.etag, Some(v2));
    assert_eq!(all.valid_at, None);
    assert_eq!(
        all.members.keys().cloned().collect::<Vec<_>>(),
        vec!["/boston".to_string(), "/salem".to_string()]
    );

    assert_policy_violation(&cache.all::<Locality>(NS, Some(ts(1))), "locality");
    assert_policy_violation(
        &cache.collect::<Locality>(NS, Some(ts(1)), Some(&Etag::from("v3"))),
        "locality",
    );
}

#[test]
fn unversioned_types_reject_collections() {
    let (mut cache, _dir) = temp_cache();
    assert_policy_violation(&cache.collect::<Namespace>(NS, None, None), "namespace");
    assert_policy_violation(&cache.all::<Namespace>(NS, None), "namespace");
}

// ============================================================================
// ALIASES
// ============================================================================

#[test]
fn alias_resolves_to_canonical_record() {
    let (mut cache, _dir) = temp_cache();
    let etag = Etag::from("e1");
    let locality = fixtures::locality("Foo", &["/bar"]);
    cache.insert(&locality, "/foo", NS, None, Some(&etag)).unwrap();

    let canonical = cache.get::<Locality>("/foo", NS, None, None).unwrap().unwrap();
    let aliased = cache.get::<Locality>("/bar", NS, None, None).unwrap().unwrap();
    assert_eq!(canonical, aliased);
    assert_eq!(aliased.value, locality);
}

#[test]
fn alias_list_is_replaced_on_rewrite() {
    let (mut cache, _dir) = temp_cache();
    cache
        .insert(
            &fixtures::locality("Foo", &["/bar", "/baz", "/bar"]),
            "/foo",
            NS,
            None,
            Some(&Etag::from("e1")),
        )
        .unwrap();
    let mut aliases = cache.aliases_of::<Locality>("/foo", NS).unwrap();
    aliases.sort();
    assert_eq!(aliases, vec!["/bar".to_string(), "/baz".to_string()]);

    cache
        .insert(
            &fixtures::locality("Foo", &["/qux"]),
            "/foo",
            NS,
            None,
            Some(&Etag::from("e2")),
        )
        .unwrap();
    assert!(cache.get::<Locality>("/bar", NS, None, None).unwrap().is_none());
    assert!(cache.get::<Locality>("/qux", NS, None, None).unwrap().is_some());
    assert_eq!(
        cache.aliases_of::<Locality>("/foo", NS).unwrap(),
        vec!["/qux".to_string()]
    );
}

#[test]
fn alias_claimed_by_another_path_is_rejected() {
    let (mut cache, _dir) = temp_cache();
    let etag = Etag::from("e1");
    cache
        .insert(&fixtures::locality("Foo", &["/shared"]), "/foo", NS, None, Some(&etag))
        .unwrap();
    assert_unique_violation(&cache.insert(
        &fixtures::locality("Other", &["/shared"]),
        "/other",
        NS,
        None,
        Some(&etag),
    ));
    let hit = cache.get::<Locality>("/shared", NS, None, None).unwrap().unwrap();
    assert_eq!(hit.value.name, "Foo");
}

#[test]
fn bulk_alias_load_keeps_alias_sets_apart() {
    let (mut cache, _dir) = temp_cache();
    let etag = Etag::from("e1");

    let mut txn = cache.begin().unwrap();
    for n in 0..200 {
        let aliases = [format!("/alias/{n}/a"), format!("/alias/{n}/b")];
        let aliases: Vec<&str> = aliases.iter().map(String::as_str).collect();
        txn.insert(
            &fixtures::locality(&format!("L{n}"), &aliases),
            &format!("/loc/{n}"),
            NS,
            None,
            Some(&etag),
        )
        .unwrap();
    }
    txn.commit().unwrap();

    for n in [0, 1, 10, 100, 199] {
        assert_eq!(
            cache.aliases_of::<Locality>(&format!("/loc/{n}"), NS).unwrap(),
            vec![format!("/alias/{n}/a"), format!("/alias/{n}/b")]
        );
        let hit = cache
            .get::<Locality>(&format!("/alias/{n}/b"), NS, None, None)
            .unwrap()
            .unwrap();
        assert_eq!(hit.value.name, format!("L{n}"));
    }
}

// ============================================================================
// METADATA
// ============================================================================

#[test]
fn shared_metadata_stored_once() {
    let (mut cache, _dir) = temp_cache();
    let etag = Etag::from("e");
    cache
        .insert(&fixtures::locality("A", &[]), "/a", NS, None, Some(&etag))
        .unwrap();
    cache
        .insert(&fixtures::locality("B", &[]), "/b", NS, None, Some(&etag))
        .unwrap();
    cache
        .insert(&fixtures::plan("c", 1), "/c", NS, Some(ts(1)), None)
        .unwrap();
    assert_eq!(cache.metadata_count().unwrap(), 1);

    let mut distinct = fixtures::plan("d", 1);
    if let Some(meta) = distinct.meta.as_mut() {
        meta.notes = Some("second import".to_string());
    }
    cache.insert(&distinct, "/d", NS, Some(ts(1)), None).unwrap();
    assert_eq!(cache.metadata_count().unwrap(), 2);

    let hit = cache.get::<Plan>("/d", NS, None, None).unwrap().unwrap();
    assert_eq!(hit.value, distinct);
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[test]
fn rejected_write_inside_batch_leaves_no_trace() {
    let (mut cache, _dir) = temp_cache();
    let mut txn = cache.begin().unwrap();
    txn.insert(&fixtures::plan("a", 1), "/a", NS, Some(ts(10)), None)
        .unwrap();
    assert_policy_violation(
        &txn.insert(&fixtures::plan("b", 1), "/b", NS, None, None),
        "plan",
    );
    txn.commit().unwrap();

    assert!(cache.get::<Plan>("/a", NS, None, None).unwrap().is_some());
    assert_eq!(cache.version_count::<Plan>("/b", NS).unwrap(), 0);
}

#[test]
fn conflicting_alias_inside_batch_changes_nothing() {
    let (mut cache, _dir) = temp_cache();
    let e1 = Etag::from("e1");
    cache
        .insert(&fixtures::locality("Foo", &["/x"]), "/foo", NS, None, Some(&e1))
        .unwrap();
    cache
        .insert(&fixtures::locality("Bar", &["/y"]), "/bar", NS, None, Some(&e1))
        .unwrap();

    let mut txn = cache.begin().unwrap();
    assert_unique_violation(&txn.insert(
        &fixtures::locality("Bar v2", &["/x", "/z"]),
        "/bar",
        NS,
        None,
        Some(&Etag::from("e2")),
    ));
    txn.insert(&fixtures::locality("Salem", &["/s"]), "/salem", NS, None, Some(&e1))
        .unwrap();
    txn.commit().unwrap();

    let bar = cache.get::<Locality>("/bar", NS, None, None).unwrap().unwrap();
    assert_eq!(bar.value.name, "Bar");
    assert_eq!(bar.etag, Some(e1));
    assert_eq!(
        cache.aliases_of::<Locality>("/bar", NS).unwrap(),
        vec!["/y".to_string()]
    );
    let owner = cache.get::<Locality>("/x", NS, None, None).unwrap().unwrap();
    assert_eq!(owner.value.name, "Foo");
    assert!(cache.get::<Locality>("/z", NS, None, None).unwrap().is_none());
    assert!(cache.get::<Locality>("/s", NS, None, None).unwrap().is_some());
}

#[test]
fn batch_collection_visible_inside_transaction() {
    let (mut cache, _dir) = temp_cache();
    let mut txn = cache.begin().unwrap();
    txn.insert(&fixtures::plan("a", 1), "/a", NS, Some(ts(10)), None)
        .unwrap();
    txn.collect::<Plan>(NS, Some(ts(10)), Some(&Etag::from("x")))
        .unwrap();
    let inside = txn.all::<Plan>(NS, None).unwrap().unwrap();
    assert_eq!(inside.len(), 1);
    txn.rollback();

    assert!(cache.all::<Plan>(NS, None).unwrap().is_none());
}

// ============================================================================
// GEOGRAPHY EXTENSION
// ============================================================================

#[test]
fn geography_history_and_collection() {
    let (mut cache, _dir) = temp_cache();
    let early = fixtures::geography(1.0, 2.0);
    let late = fixtures::geography(3.0, 4.0);
    let other = fixtures::geography(-71.06, 42.36);

    cache.insert(&early, "/tract/1", NS, Some(ts(10)), None).unwrap();
    cache.insert(&late, "/tract/1", NS, Some(ts(20)), None).unwrap();
    cache.insert(&other, "/tract/2", NS, Some(ts(15)), None).unwrap();

    let at = |secs: i64| -> Option<Geography> {
        cache
            .get::<Geography>("/tract/1", NS, Some(ts(secs)), None)
            .unwrap()
            .map(|hit| hit.value)
    };
    assert_eq!(at(9), None);
    assert_eq!(at(12), Some(early.clone()));
    assert_eq!(at(25), Some(late.clone()));

    let x = Etag::from("x");
    cache.collect::<Geography>(NS, Some(ts(12)), Some(&x)).unwrap();
    cache.collect::<Geography>(NS, Some(ts(30)), Some(&x)).unwrap();

    let then = cache.all::<Geography>(NS, Some(ts(18))).unwrap().unwrap();
    assert_eq!(then.valid_at, Some(ts(12)));
    assert_eq!(then.members.len(), 1);
    assert_eq!(then.get("/tract/1"), Some(&early));

    let now = cache.all::<Geography>(NS, None).unwrap().unwrap();
    assert_eq!(now.members.len(), 2);
    assert_eq!(now.get("/tract/1"), Some(&late));
    assert_eq!(now.get("/tract/2"), Some(&other));
}

#[test]
fn geography_rejects_etag_markers() {
    let (mut cache, _dir) = temp_cache();
    let result = cache.insert(
        &fixtures::geography(0.0, 0.0),
        "/tract/1",
        NS,
        None,
        Some(&Etag::from("e")),
    );
    assert_policy_violation(&result, "geography");
    assert!(cache
        .get::<Geography>("/tract/1", NS, None, None)
        .unwrap()
        .is_none());
}

#[test]
fn sub_microsecond_precision_is_normalized() {
    let (mut cache, _dir) = temp_cache();
    let precise: Timestamp = ts(100) + chrono::Duration::nanoseconds(1_500);
    cache
        .insert(&fixtures::plan("p", 1), "/p", NS, Some(precise), None)
        .unwrap();
    let hit = cache.get::<Plan>("/p", NS, Some(precise), None).unwrap().unwrap();
    assert_eq!(hit.valid_from, Some(ts(100) + chrono::Duration::microseconds(1)));
}
