//! VELLUM Core - Cache Types and Object Contract
//!
//! Pure data structures shared by the cache engine and the schema layer that
//! feeds it: versioning policies, version tags, metadata identity, the
//! [`CacheableObject`] contract, result wrappers, errors, and configuration.
//! This crate contains no storage logic.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub mod config;
pub mod error;

pub use config::CacheConfig;
pub use error::{
    ConfigError, InitError, ObjectContractError, PolicyError, StorageError, VellumError,
    VellumResult, VersionParameter,
};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// SHA-256 content hash.
pub type ContentHash = [u8; 32];

/// Number of tables in the core physical schema.
pub const CORE_TABLE_COUNT: usize = 5;

/// Body field holding an object's detachable metadata.
pub const META_FIELD: &str = "meta";

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Truncate a timestamp to the microsecond precision the cache stores.
pub fn normalize_timestamp(ts: Timestamp) -> Timestamp {
    ts.trunc_subsecs(6)
}

// ============================================================================
// VERSIONING
// ============================================================================

/// Versioning discipline of an object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CachePolicy {
    /// No version parameters on read or write.
    None,
    /// An opaque tag identifies the latest known version; no history.
    ETag,
    /// A point in time identifies a version; full history is kept.
    Timestamp,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CachePolicy::None => "unversioned",
            CachePolicy::ETag => "ETag-versioned",
            CachePolicy::Timestamp => "timestamp-versioned",
        };
        f.write_str(name)
    }
}

/// Opaque version tag issued by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Etag(Vec<u8>);

impl Etag {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Etag {
    fn from(tag: &str) -> Self {
        Self(tag.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for Etag {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Etag {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Content-derived key of a detached metadata blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaId(ContentHash);

impl MetaId {
    /// Derive the key from the canonical JSON encoding of the metadata body.
    ///
    /// `serde_json` maps are sorted by key, so equal metadata always yields
    /// the same key regardless of field order in the source.
    pub fn derive(meta: &Value) -> VellumResult<Self> {
        let canonical = serde_json::to_vec(meta)?;
        Ok(Self(compute_content_hash(&canonical)))
    }

    pub fn as_bytes(&self) -> &ContentHash {
        &self.0
    }
}

/// Conventional object metadata attached by the remote service on writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub uuid: Uuid,
    pub notes: Option<String>,
    pub created_at: Timestamp,
    pub created_by: String,
}

// ============================================================================
// OBJECT CONTRACT
// ============================================================================

/// Registration data the cache needs for one object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheDescriptor {
    pub name: &'static str,
    pub policy: CachePolicy,
    pub aliased: bool,
}

impl CacheDescriptor {
    /// Read and validate the descriptor of `T`.
    pub fn of<T: CacheableObject>() -> Result<Self, ObjectContractError> {
        validate_cache_name(T::CACHE_NAME)?;
        Ok(Self {
            name: T::CACHE_NAME,
            policy: T::CACHE_POLICY,
            aliased: T::CACHE_ALIASED,
        })
    }
}

/// Check that a type identifier can key physical storage.
pub fn validate_cache_name(name: &str) -> Result<(), ObjectContractError> {
    if name.trim().is_empty() {
        return Err(ObjectContractError::InvalidName {
            name: name.to_string(),
            reason: "cache name is empty".to_string(),
        });
    }
    if name.chars().any(char::is_control) {
        return Err(ObjectContractError::InvalidName {
            name: name.to_string(),
            reason: "cache name contains control characters".to_string(),
        });
    }
    Ok(())
}

/// An object split into the pieces the cache stores separately.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectParts {
    /// Serialized body without metadata.
    pub body: Map<String, Value>,
    /// Detached metadata, if the object carries any.
    pub meta: Option<Value>,
    /// Current alias list of an alias-capable object.
    pub aliases: Option<Vec<String>>,
}

/// Contract between the schema layer and the cache.
///
/// Implementations describe their type once through associated constants and
/// rely on serde for the body encoding. A `meta` field, if present, is
/// detached on write and re-attached on read.
pub trait CacheableObject: Serialize + DeserializeOwned {
    /// Stable type identifier used as the storage key prefix.
    const CACHE_NAME: &'static str;

    /// Versioning discipline of this type.
    const CACHE_POLICY: CachePolicy;

    /// Whether the type can be looked up through alternate paths.
    const CACHE_ALIASED: bool = false;

    /// Current alias list; only consulted for aliased types.
    fn aliases(&self) -> Option<Vec<String>> {
        None
    }

    /// Serialize into body, detached metadata, and aliases.
    fn to_parts(&self) -> VellumResult<ObjectParts> {
        let malformed = |reason: &str| ObjectContractError::MalformedBody {
            type_name: Self::CACHE_NAME.to_string(),
            reason: reason.to_string(),
        };

        let Value::Object(mut body) = serde_json::to_value(self)? else {
            return Err(malformed("object must serialize to a JSON object").into());
        };
        let meta = match body.remove(META_FIELD) {
            None | Some(Value::Null) => None,
            Some(meta @ Value::Object(_)) => Some(meta),
            Some(_) => return Err(malformed("meta must be a JSON object").into()),
        };

        Ok(ObjectParts {
            body,
            meta,
            aliases: self.aliases(),
        })
    }

    /// Rebuild an object from a stored body and its metadata.
    fn from_parts(parts: ObjectParts) -> VellumResult<Self> {
        let ObjectParts { mut body, meta, .. } = parts;
        if let Some(meta) = meta {
            body.insert(META_FIELD.to_string(), meta);
        }
        Ok(serde_json::from_value(Value::Object(body))?)
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// A single cached object with its version markers.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedObject<T> {
    /// The cached object.
    pub value: T,
    /// Local time the object was fetched from the remote service.
    pub cached_at: Timestamp,
    /// Start of the version's lifetime (timestamp-versioned types).
    pub valid_from: Option<Timestamp>,
    /// Version tag (ETag-versioned types).
    pub etag: Option<Etag>,
}

/// A complete namespace-scoped collection resolved from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedCollection<T> {
    /// Members keyed by namespace-relative path.
    pub members: BTreeMap<String, T>,
    /// Local time the snapshot was recorded.
    pub cached_at: Timestamp,
    /// Snapshot instant (timestamp-versioned types).
    pub valid_at: Option<Timestamp>,
    /// Collection version tag.
    pub etag: Option<Etag>,
}

impl<T> CachedCollection<T> {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&T> {
        self.members.get(path)
    }
}

// ============================================================================
// TESTS
// ============================================================================
