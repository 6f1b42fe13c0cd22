//! VELLUM Storage - LMDB-Backed Versioned Cache
//!
//! A local cache of remote catalog objects under three versioning
//! disciplines (unversioned, ETag, timestamp), with as-of reads of single
//! objects and of complete namespace collections.
//!
//! ```no_run
//! use vellum_core::CacheConfig;
//! use vellum_storage::{ExtensionRegistry, VersionedCache};
//!
//! # fn main() -> vellum_core::VellumResult<()> {
//! let config = CacheConfig::for_profile("/var/lib/vellum", "default");
//! let cache = VersionedCache::open(&config, ExtensionRegistry::with_defaults())?;
//! assert_eq!(cache.schema_version()?.as_deref(), Some("0"));
//! # Ok(())
//! # }
//! ```

pub mod alias;
pub mod cache;
pub mod collections;
pub mod error;
pub mod extension;
pub mod geography;
pub mod keys;
pub mod policy;
pub mod records;
pub mod schema;

pub use cache::{CacheTxn, VersionedCache};
pub use collections::{reconcile, SnapshotMatch, SnapshotRow};
pub use error::LmdbStoreError;
pub use extension::{ExtensionRegistry, TypedStore};
pub use geography::{Geography, GeographyStore};
pub use records::{Lookup, MetaBlobs, NewRecord, StoredObject};
pub use schema::{CORE_TABLES, SCHEMA_VERSION};
