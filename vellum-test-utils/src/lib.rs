//! VELLUM Test Utilities
//!
//! Shared test infrastructure for the vellum workspace:
//! - Fixture object kinds, one per caching policy
//! - Proptest generators for version markers and fixture objects
//! - Temporary cache helpers
//! - Assertions for vellum-specific error kinds

pub use vellum_core::{
    CacheConfig, CachePolicy, CacheableObject, CachedCollection, CachedObject, Etag, InitError,
    ObjectMeta, PolicyError, StorageError, Timestamp, VellumError, VellumResult,
};
pub use vellum_storage::{ExtensionRegistry, Geography, VersionedCache};

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use uuid::Uuid;

// ============================================================================
// FIXTURE OBJECT KINDS
// ============================================================================

/// An ETag-versioned, alias-capable catalog object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locality {
    pub name: String,
    pub parent: Option<String>,
    pub aliases: Vec<String>,
    pub meta: Option<ObjectMeta>,
}

impl CacheableObject for Locality {
    const CACHE_NAME: &'static str = "locality";
    const CACHE_POLICY: CachePolicy = CachePolicy::ETag;
    const CACHE_ALIASED: bool = true;

    fn aliases(&self) -> Option<Vec<String>> {
        Some(self.aliases.clone())
    }
}

/// An unversioned catalog object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub path: String,
    pub description: String,
    pub public: bool,
}

impl CacheableObject for Namespace {
    const CACHE_NAME: &'static str = "namespace";
    const CACHE_POLICY: CachePolicy = CachePolicy::None;
}

/// A timestamp-versioned catalog object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub assignments: u32,
    pub complete: bool,
    pub meta: Option<ObjectMeta>,
}

impl CacheableObject for Plan {
    const CACHE_NAME: &'static str = "plan";
    const CACHE_POLICY: CachePolicy = CachePolicy::Timestamp;
}

// ============================================================================
// TEMPORARY CACHES
// ============================================================================

/// Config for a small cache under `dir`.
pub fn temp_config(dir: &TempDir) -> CacheConfig {
    CacheConfig::new(dir.path().join("cache")).with_map_size_mb(16)
}

/// Open a cache with the default extensions in a fresh temporary directory.
///
/// The directory lives as long as the returned `TempDir`, so tests can drop
/// the cache and reopen it from the same config.
pub fn temp_cache() -> (VersionedCache, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let cache = VersionedCache::open(&temp_config(&dir), ExtensionRegistry::with_defaults())
        .expect("Failed to open cache");
    (cache, dir)
}

/// Seconds since the epoch as a cache timestamp.
pub fn ts(secs: i64) -> Timestamp {
    Utc.timestamp_opt(secs, 0)
        .single()
        .expect("timestamp out of range")
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for version markers and fixture objects.

    use super::*;
    use proptest::prelude::*;

    /// Generate a random UUID.
    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    /// Generate a microsecond-precision timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000_000i64..1_893_456_000_000_000i64).prop_map(|micros| {
            chrono::DateTime::from_timestamp_micros(micros).unwrap_or_else(Utc::now)
        })
    }

    /// Generate `n` strictly increasing timestamps.
    pub fn arb_ascending_timestamps(n: usize) -> impl Strategy<Value = Vec<Timestamp>> {
        (
            1_577_836_800i64..1_700_000_000i64,
            proptest::collection::vec(1i64..86_400, n),
        )
            .prop_map(|(start, gaps)| {
                gaps.iter()
                    .scan(start, |at, gap| {
                        *at += gap;
                        Some(ts(*at))
                    })
                    .collect()
            })
    }

    pub fn arb_etag() -> impl Strategy<Value = Etag> {
        "[0-9a-f]{8,16}".prop_map(|tag| Etag::from(tag.as_str()))
    }

    /// Generate a namespace-relative object path.
    pub fn arb_path() -> impl Strategy<Value = String> {
        "/[a-z]{1,8}(/[a-z0-9]{1,8}){0,2}"
    }

    pub fn arb_namespace_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    pub fn arb_policy() -> impl Strategy<Value = CachePolicy> {
        prop_oneof![
            Just(CachePolicy::None),
            Just(CachePolicy::ETag),
            Just(CachePolicy::Timestamp),
        ]
    }

    pub fn arb_object_meta() -> impl Strategy<Value = ObjectMeta> {
        (
            arb_uuid(),
            proptest::option::of("[a-z ]{0,24}"),
            1_577_836_800i64..1_893_456_000i64,
            "[a-z]{1,8}@example\\.org",
        )
            .prop_map(|(uuid, notes, created, created_by)| ObjectMeta {
                uuid,
                notes,
                created_at: ts(created),
                created_by,
            })
    }

    pub fn arb_locality() -> impl Strategy<Value = Locality> {
        (
            "[A-Z][a-z]{2,12}",
            proptest::option::of(arb_path()),
            proptest::collection::vec(arb_path(), 0..4),
            proptest::option::of(arb_object_meta()),
        )
            .prop_map(|(name, parent, aliases, meta)| Locality {
                name,
                parent,
                aliases,
                meta,
            })
    }

    pub fn arb_namespace() -> impl Strategy<Value = Namespace> {
        (arb_path(), "[a-z ]{0,40}", any::<bool>()).prop_map(|(path, description, public)| {
            Namespace {
                path,
                description,
                public,
            }
        })
    }

    pub fn arb_plan() -> impl Strategy<Value = Plan> {
        (
            "[a-z]{3,12}",
            0u32..10_000,
            any::<bool>(),
            proptest::option::of(arb_object_meta()),
        )
            .prop_map(|(name, assignments, complete, meta)| Plan {
                name,
                assignments,
                complete,
                meta,
            })
    }

    /// Generate an arbitrary `(valid_from, etag)` pair, valid or not.
    pub fn arb_write_markers() -> impl Strategy<Value = (Option<Timestamp>, Option<Etag>)> {
        (
            proptest::option::of(arb_timestamp()),
            proptest::option::of(arb_etag()),
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built objects for common scenarios.

    use super::*;

    pub fn object_meta() -> ObjectMeta {
        ObjectMeta {
            uuid: Uuid::nil(),
            notes: Some("imported from census block assignments".to_string()),
            created_at: ts(1_700_000_000),
            created_by: "loader@example.org".to_string(),
        }
    }

    pub fn locality(name: &str, aliases: &[&str]) -> Locality {
        Locality {
            name: name.to_string(),
            parent: Some("/ma".to_string()),
            aliases: aliases.iter().map(|alias| alias.to_string()).collect(),
            meta: Some(object_meta()),
        }
    }

    pub fn namespace(path: &str) -> Namespace {
        Namespace {
            path: path.to_string(),
            description: format!("Namespace {path}"),
            public: true,
        }
    }

    pub fn plan(name: &str, assignments: u32) -> Plan {
        Plan {
            name: name.to_string(),
            assignments,
            complete: true,
            meta: Some(object_meta()),
        }
    }

    /// Little-endian WKB for `POINT(x y)`.
    pub fn point_wkb(x: f64, y: f64) -> Vec<u8> {
        let mut wkb = vec![0x01, 0x01, 0x00, 0x00, 0x00];
        wkb.extend_from_slice(&x.to_le_bytes());
        wkb.extend_from_slice(&y.to_le_bytes());
        wkb
    }

    pub fn geography(x: f64, y: f64) -> Geography {
        Geography {
            geography: point_wkb(x, y),
            meta: None,
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for vellum-specific error kinds.

    use super::*;

    /// Assert that a result is a policy violation naming `type_name`.
    #[track_caller]
    pub fn assert_policy_violation<T: std::fmt::Debug>(result: &VellumResult<T>, type_name: &str) {
        match result {
            Err(VellumError::Policy(err)) => {
                assert_eq!(err.type_name(), type_name, "Wrong type in policy violation");
            }
            other => panic!("Expected policy violation for {type_name}, got: {other:?}"),
        }
    }

    /// Assert that a result is a uniqueness violation.
    #[track_caller]
    pub fn assert_unique_violation<T: std::fmt::Debug>(result: &VellumResult<T>) {
        match result {
            Err(VellumError::Storage(StorageError::UniqueViolation { .. })) => {}
            other => panic!("Expected unique violation, got: {other:?}"),
        }
    }

    /// Assert that a result is an initialization failure.
    #[track_caller]
    pub fn assert_init_failure<T: std::fmt::Debug>(result: &VellumResult<T>) {
        match result {
            Err(VellumError::Init(_)) => {}
            other => panic!("Expected initialization failure, got: {other:?}"),
        }
    }
}
