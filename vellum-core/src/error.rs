//! Error types for vellum cache operations

use crate::CachePolicy;
use std::fmt;
use thiserror::Error;

/// A version parameter supplied to a cache call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionParameter {
    /// Opaque version tag on an object or collection.
    Etag,
    /// Start of an object version's lifetime.
    ValidFrom,
    /// Completeness instant of a collection snapshot.
    ValidAt,
    /// Upper time bound of an as-of query.
    At,
}

impl fmt::Display for VersionParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VersionParameter::Etag => "etag",
            VersionParameter::ValidFrom => "valid_from",
            VersionParameter::ValidAt => "valid_at",
            VersionParameter::At => "at",
        };
        f.write_str(name)
    }
}

/// Cache initialization errors. Always fatal: no cache is returned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InitError {
    #[error("Failed to open cache at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Invalid cache: missing tables {}", tables.join(", "))]
    MissingTables { tables: Vec<String> },

    #[error("Invalid cache: no schema version in cache metadata")]
    MissingSchemaVersion,

    #[error("Invalid cache: expected schema version {expected}, but got schema version {found}")]
    SchemaVersionMismatch { expected: String, found: String },
}

/// Version parameters that do not match an object type's caching policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Object type \"{type_name}\" is {policy}: {parameter} is required")]
    MissingParameter {
        type_name: String,
        policy: CachePolicy,
        parameter: VersionParameter,
    },

    #[error("Object type \"{type_name}\" is {policy}: {parameter} is not permitted")]
    UnexpectedParameter {
        type_name: String,
        policy: CachePolicy,
        parameter: VersionParameter,
    },

    #[error("Object type \"{type_name}\" does not support collection-level caching")]
    CollectionUnsupported { type_name: String },
}

impl PolicyError {
    /// Name of the object type the violation refers to.
    pub fn type_name(&self) -> &str {
        match self {
            PolicyError::MissingParameter { type_name, .. }
            | PolicyError::UnexpectedParameter { type_name, .. }
            | PolicyError::CollectionUnsupported { type_name } => type_name,
        }
    }
}

/// An object type lacks what the cache needs from the schema layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ObjectContractError {
    #[error("Invalid cache name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Malformed body for object type \"{type_name}\": {reason}")]
    MalformedBody { type_name: String, reason: String },

    #[error("A storage extension is already registered for object type \"{type_name}\"")]
    DuplicateExtension { type_name: String },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Unique constraint violated in table {table}")]
    UniqueViolation { table: String },

    #[error("Corrupt row in table {table}: {reason}")]
    Corrupt { table: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all vellum errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VellumError {
    #[error("Initialization error: {0}")]
    Init(#[from] InitError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyError),

    #[error("Object contract error: {0}")]
    Contract(#[from] ObjectContractError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl VellumError {
    /// Returns true if this is a policy violation.
    pub fn is_policy_violation(&self) -> bool {
        matches!(self, VellumError::Policy(_))
    }

    /// Returns true if this is an initialization failure.
    pub fn is_init_failure(&self) -> bool {
        matches!(self, VellumError::Init(_))
    }
}

impl From<serde_json::Error> for VellumError {
    fn from(e: serde_json::Error) -> Self {
        VellumError::Storage(StorageError::Serialization {
            reason: e.to_string(),
        })
    }
}

/// Result type alias for vellum operations.
pub type VellumResult<T> = Result<T, VellumError>;

// =============================================================================
// TESTS
// =============================================================================
