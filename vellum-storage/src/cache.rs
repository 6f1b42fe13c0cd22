//! Versioned Cache Engine.
//!
//! Composes the Record Store, Metadata Blobs, Collection Snapshot Store,
//! Alias Index and Policy Resolver behind four operations: `get`, `insert`,
//! `collect` and `all`. Types with a registered [`TypedStore`] have their
//! Record reads and writes delegated to it.
//!
//! `VersionedCache::insert` and `VersionedCache::collect` commit on return.
//! Bulk loaders open a [`CacheTxn`] with [`VersionedCache::begin`], issue any
//! number of writes, and finish with [`CacheTxn::commit`] or
//! [`CacheTxn::rollback`]; dropping the guard rolls back. Writes take
//! `&mut self`: LMDB has one write lock per environment, and a second write
//! transaction on the thread holding it would wait forever.
//!
//! [`TypedStore`]: crate::extension::TypedStore

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use heed::{Env, EnvOpenOptions, RoTxn, RwTxn};
use tempfile::TempDir;
use tracing::debug;
use vellum_core::{
    normalize_timestamp, CacheConfig, CacheDescriptor, CachePolicy, CacheableObject,
    CachedCollection, CachedObject, Etag, InitError, MetaId, ObjectParts, Timestamp, VellumResult,
};

use crate::error::{LmdbResultExt, LmdbStoreError};
use crate::extension::ExtensionRegistry;
use crate::policy;
use crate::records::{Lookup, NewRecord, StoredObject};
use crate::schema::{Schema, CORE_TABLES};

/// An object write that passed policy validation and has been split into
/// its stored parts. Building one touches no storage.
struct PreparedInsert {
    desc: CacheDescriptor,
    parts: ObjectParts,
    meta_id: Option<MetaId>,
    valid_from: Option<Timestamp>,
    etag: Option<Etag>,
}

/// A local versioned cache backed by one LMDB environment.
pub struct VersionedCache {
    env: Env,
    schema: Schema,
    extensions: ExtensionRegistry,
    // Dropped after `env`, so the environment closes before its directory goes.
    _temp_dir: Option<TempDir>,
}

impl VersionedCache {
    /// Open the cache at `config.path`, creating the schema on first use and
    /// verifying it otherwise.
    pub fn open(config: &CacheConfig, extensions: ExtensionRegistry) -> VellumResult<Self> {
        config.validate().map_err(|e| InitError::Open {
            path: config.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let env = Self::open_env(&config.path, config.map_size_bytes(), config.max_dbs)?;
        Self::from_env(env, extensions, None)
    }

    /// Open an ephemeral cache in a temporary directory that is removed when
    /// the cache is dropped.
    pub fn open_temporary(extensions: ExtensionRegistry) -> VellumResult<Self> {
        let temp_dir = TempDir::new().map_err(|e| InitError::Open {
            path: std::env::temp_dir().display().to_string(),
            reason: e.to_string(),
        })?;
        let config = CacheConfig::new(temp_dir.path());
        let env = Self::open_env(&config.path, config.map_size_bytes(), config.max_dbs)?;
        Self::from_env(env, extensions, Some(temp_dir))
    }

    fn open_env(path: &Path, map_size: usize, max_dbs: u32) -> VellumResult<Env> {
        let env_open = |reason: String| LmdbStoreError::EnvOpen {
            path: path.display().to_string(),
            reason,
        };
        std::fs::create_dir_all(path).map_err(|e| env_open(e.to_string()))?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_dbs)
                .open(path)
        }
        .map_err(|e| env_open(e.to_string()))?;
        Ok(env)
    }

    fn from_env(
        env: Env,
        mut extensions: ExtensionRegistry,
        temp_dir: Option<TempDir>,
    ) -> VellumResult<Self> {
        let (schema, opened) = Schema::open(&env, &mut extensions)?;
        debug!(?opened, extensions = ?extensions, "Attached storage extensions");
        Ok(Self {
            env,
            schema,
            extensions,
            _temp_dir: temp_dir,
        })
    }

    /// Directory of the LMDB environment.
    pub fn path(&self) -> &Path {
        self.env.path()
    }

    /// Schema version stamped into this cache.
    pub fn schema_version(&self) -> VellumResult<Option<String>> {
        self.schema.stamped_version(&self.env)
    }

    /// Every table of this cache: the core schema plus extension tables.
    pub fn tables(&self) -> Vec<&'static str> {
        let mut tables: Vec<&'static str> = CORE_TABLES.to_vec();
        tables.extend(self.extensions.tables());
        tables
    }

    /// Start a write transaction that stays open across operations.
    ///
    /// The guard borrows the cache exclusively until it is committed or
    /// rolled back. Committed state stays readable through [`CacheTxn::cache`].
    pub fn begin(&mut self) -> VellumResult<CacheTxn<'_>> {
        let cache: &VersionedCache = self;
        Ok(CacheTxn {
            cache,
            wtxn: cache.env.write_txn().lmdb()?,
        })
    }

    // ------------------------------------------------------------------
    // Auto-committing operations
    // ------------------------------------------------------------------

    /// Read one object. `at` bounds timestamp-versioned reads, `etag` pins an
    /// ETag-versioned read to an exact version. Selectors that do not apply
    /// to the type's policy are ignored.
    pub fn get<T: CacheableObject>(
        &self,
        path: &str,
        namespace: &str,
        at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<Option<CachedObject<T>>> {
        let rtxn = self.env.read_txn().lmdb()?;
        self.get_in(&rtxn, path, namespace, at, etag)
    }

    /// Write one object version and commit.
    pub fn insert<T: CacheableObject>(
        &mut self,
        obj: &T,
        path: &str,
        namespace: &str,
        valid_from: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<()> {
        let prepared = Self::prepare_insert(obj, valid_from, etag)?;
        let mut wtxn = self.env.write_txn().lmdb()?;
        self.apply_insert(&mut wtxn, prepared, path, namespace)?;
        wtxn.commit().lmdb()
    }

    /// Record that the namespace's collection of `T` is complete and commit.
    pub fn collect<T: CacheableObject>(
        &mut self,
        namespace: &str,
        valid_at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<()> {
        let desc = Self::prepare_collect::<T>(valid_at, etag)?;
        let mut wtxn = self.env.write_txn().lmdb()?;
        self.apply_collect(&mut wtxn, &desc, namespace, valid_at, etag)?;
        wtxn.commit().lmdb()
    }

    /// Read a complete collection as recorded by `collect`.
    pub fn all<T: CacheableObject>(
        &self,
        namespace: &str,
        at: Option<Timestamp>,
    ) -> VellumResult<Option<CachedCollection<T>>> {
        let rtxn = self.env.read_txn().lmdb()?;
        self.all_in(&rtxn, namespace, at)
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Number of distinct metadata blobs stored.
    pub fn metadata_count(&self) -> VellumResult<u64> {
        let rtxn = self.env.read_txn().lmdb()?;
        self.schema.meta.len(&rtxn)
    }

    /// Number of retained versions of one path in the default Record Store.
    pub fn version_count<T: CacheableObject>(
        &self,
        path: &str,
        namespace: &str,
    ) -> VellumResult<usize> {
        let desc = policy::describe::<T>()?;
        let rtxn = self.env.read_txn().lmdb()?;
        self.schema
            .records
            .version_count(&rtxn, desc.name, namespace, path)
    }

    /// Aliases currently registered for a canonical path.
    pub fn aliases_of<T: CacheableObject>(
        &self,
        canonical_path: &str,
        namespace: &str,
    ) -> VellumResult<Vec<String>> {
        let desc = policy::describe::<T>()?;
        let rtxn = self.env.read_txn().lmdb()?;
        self.schema
            .aliases
            .aliases_of(&rtxn, desc.name, namespace, canonical_path)
    }

    // ------------------------------------------------------------------
    // Shared implementation
    // ------------------------------------------------------------------

    fn prepare_insert<T: CacheableObject>(
        obj: &T,
        valid_from: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<PreparedInsert> {
        let desc = policy::describe::<T>()?;
        policy::check_write(&desc, valid_from, etag)?;
        let parts = obj.to_parts()?;
        let meta_id = parts.meta.as_ref().map(MetaId::derive).transpose()?;
        Ok(PreparedInsert {
            desc,
            parts,
            meta_id,
            valid_from: valid_from.map(normalize_timestamp),
            etag: etag.cloned(),
        })
    }

    fn apply_insert(
        &self,
        wtxn: &mut RwTxn<'_>,
        prepared: PreparedInsert,
        path: &str,
        namespace: &str,
    ) -> VellumResult<()> {
        let PreparedInsert {
            desc,
            parts,
            meta_id,
            valid_from,
            etag,
        } = prepared;

        let record = NewRecord {
            type_name: desc.name,
            policy: desc.policy,
            path,
            namespace,
            body: &parts.body,
            meta_id,
            etag: etag.as_ref(),
            valid_from,
            cached_at: normalize_timestamp(Utc::now()),
        };
        let store = self.extensions.get(desc.name);
        let aliases = match (store, &parts.aliases) {
            (None, Some(aliases)) if desc.aliased && desc.policy == CachePolicy::ETag => {
                Some(aliases)
            }
            _ => None,
        };

        // Every check runs before the first write, so a rejected record
        // leaves an open batch untouched.
        if let Some(store) = store {
            store.check(&record)?;
        }
        if let Some(aliases) = aliases {
            self.schema
                .aliases
                .check_available(wtxn, desc.name, namespace, path, aliases)?;
        }

        match store {
            Some(store) => {
                debug!(type_name = desc.name, path, namespace, "Delegating insert to extension");
                store.insert(wtxn, &record)?;
            }
            None => {
                self.schema.records.insert(wtxn, &record)?;
                debug!(
                    type_name = desc.name,
                    path,
                    namespace,
                    valid_from = ?valid_from,
                    "Inserted record"
                );
            }
        }

        if let Some(aliases) = aliases {
            self.schema
                .aliases
                .replace(wtxn, desc.name, namespace, path, aliases)?;
        }

        if let (Some(id), Some(meta)) = (&meta_id, &parts.meta) {
            let fresh = self.schema.meta.upsert(wtxn, id, meta)?;
            debug!(type_name = desc.name, fresh, "Stored metadata blob");
        }
        Ok(())
    }

    fn prepare_collect<T: CacheableObject>(
        valid_at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<CacheDescriptor> {
        let desc = policy::describe::<T>()?;
        policy::check_collect(&desc, valid_at, etag)?;
        Ok(desc)
    }

    fn apply_collect(
        &self,
        wtxn: &mut RwTxn<'_>,
        desc: &CacheDescriptor,
        namespace: &str,
        valid_at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<()> {
        let row = crate::collections::SnapshotRow {
            etag: etag.cloned(),
            valid_at: valid_at.map(normalize_timestamp),
            cached_at: normalize_timestamp(Utc::now()),
        };
        let replace = desc.policy == CachePolicy::ETag;
        self.schema
            .snapshots
            .insert(wtxn, desc.name, namespace, &row, replace)?;
        debug!(
            type_name = desc.name,
            namespace,
            valid_at = ?row.valid_at,
            "Recorded collection snapshot"
        );
        Ok(())
    }

    fn get_in<T: CacheableObject>(
        &self,
        rtxn: &RoTxn<'_>,
        path: &str,
        namespace: &str,
        at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<Option<CachedObject<T>>> {
        let desc = policy::describe::<T>()?;
        let lookup = Lookup {
            policy: desc.policy,
            at: at.map(normalize_timestamp),
            etag,
        };

        let stored = if let Some(store) = self.extensions.get(desc.name) {
            debug!(type_name = desc.name, path, namespace, "Delegating get to extension");
            store.get(rtxn, &self.schema.meta, namespace, path, &lookup)?
        } else {
            let canonical = if desc.aliased {
                self.schema.aliases.resolve(rtxn, desc.name, namespace, path)?
            } else {
                None
            };
            let path = canonical.as_deref().unwrap_or(path);
            self.schema
                .records
                .get(rtxn, &self.schema.meta, desc.name, namespace, path, &lookup)?
        };

        match stored {
            Some(stored) => {
                debug!(type_name = desc.name, path, namespace, "Cache hit");
                Ok(Some(stored.into_cached()?))
            }
            None => {
                debug!(type_name = desc.name, path, namespace, "Cache miss");
                Ok(None)
            }
        }
    }

    fn all_in<T: CacheableObject>(
        &self,
        rtxn: &RoTxn<'_>,
        namespace: &str,
        at: Option<Timestamp>,
    ) -> VellumResult<Option<CachedCollection<T>>> {
        let desc = policy::describe::<T>()?;
        policy::check_collection_read(&desc, at)?;

        let snapshots = &self.schema.snapshots;
        let snapshot = match (desc.policy, at) {
            (CachePolicy::ETag, _) => snapshots.live(rtxn, desc.name, namespace)?,
            (CachePolicy::Timestamp, None) => snapshots.latest(rtxn, desc.name, namespace)?,
            (CachePolicy::Timestamp, Some(at)) => {
                snapshots.resolve_at(rtxn, desc.name, namespace, normalize_timestamp(at))?
            }
            (CachePolicy::None, _) => None,
        };
        let Some(snapshot) = snapshot else {
            debug!(type_name = desc.name, namespace, "Collection miss");
            return Ok(None);
        };

        let stored: BTreeMap<String, StoredObject> = match self.extensions.get(desc.name) {
            Some(store) => {
                debug!(
                    type_name = desc.name,
                    namespace, "Delegating collection read to extension"
                );
                store.all(rtxn, &self.schema.meta, namespace, snapshot.valid_at)?
            }
            None => self.schema.records.members(
                rtxn,
                &self.schema.meta,
                desc.name,
                namespace,
                snapshot.valid_at,
            )?,
        };

        let members = stored
            .into_iter()
            .map(|(path, stored)| Ok((path, stored.into_object::<T>()?)))
            .collect::<VellumResult<BTreeMap<_, _>>>()?;
        debug!(
            type_name = desc.name,
            namespace,
            members = members.len(),
            "Collection hit"
        );

        Ok(Some(CachedCollection {
            members,
            cached_at: snapshot.cached_at,
            valid_at: snapshot.valid_at,
            etag: snapshot.etag,
        }))
    }
}

impl std::fmt::Debug for VersionedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCache")
            .field("path", &self.env.path())
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// An open write transaction over a [`VersionedCache`].
///
/// Reads through the guard observe its uncommitted writes. A write rejected
/// by policy, alias ownership or body validation changes nothing; a storage
/// failure may leave earlier work of the same call in place, and
/// [`CacheTxn::rollback`] discards it.
///
/// The guard holds the cache mutably, so an auto-committing write cannot run
/// while it is open:
///
/// ```compile_fail
/// # use vellum_core::{CachePolicy, CacheableObject};
/// # use vellum_storage::{ExtensionRegistry, VersionedCache};
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct Note { text: String }
/// # impl CacheableObject for Note {
/// #     const CACHE_NAME: &'static str = "note";
/// #     const CACHE_POLICY: CachePolicy = CachePolicy::None;
/// # }
/// let mut cache = VersionedCache::open_temporary(ExtensionRegistry::new())?;
/// let note = Note { text: "draft".to_string() };
/// let mut txn = cache.begin()?;
/// txn.insert(&note, "/a", "ns", None, None)?;
/// cache.insert(&note, "/b", "ns", None, None)?;
/// txn.commit()?;
/// # Ok::<(), vellum_core::VellumError>(())
/// ```
pub struct CacheTxn<'c> {
    cache: &'c VersionedCache,
    wtxn: RwTxn<'c>,
}

impl<'c> CacheTxn<'c> {
    /// Write one object version into the open transaction.
    pub fn insert<T: CacheableObject>(
        &mut self,
        obj: &T,
        path: &str,
        namespace: &str,
        valid_from: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<()> {
        let prepared = VersionedCache::prepare_insert(obj, valid_from, etag)?;
        self.cache
            .apply_insert(&mut self.wtxn, prepared, path, namespace)
    }

    /// Record a collection snapshot in the open transaction.
    pub fn collect<T: CacheableObject>(
        &mut self,
        namespace: &str,
        valid_at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<()> {
        let desc = VersionedCache::prepare_collect::<T>(valid_at, etag)?;
        self.cache
            .apply_collect(&mut self.wtxn, &desc, namespace, valid_at, etag)
    }

    /// Read one object, including writes not yet committed.
    pub fn get<T: CacheableObject>(
        &self,
        path: &str,
        namespace: &str,
        at: Option<Timestamp>,
        etag: Option<&Etag>,
    ) -> VellumResult<Option<CachedObject<T>>> {
        self.cache.get_in(&self.wtxn, path, namespace, at, etag)
    }

    /// Read a complete collection, including snapshots not yet committed.
    pub fn all<T: CacheableObject>(
        &self,
        namespace: &str,
        at: Option<Timestamp>,
    ) -> VellumResult<Option<CachedCollection<T>>> {
        self.cache.all_in(&self.wtxn, namespace, at)
    }

    /// The cache this guard writes to. Reads through it see committed state
    /// only.
    pub fn cache(&self) -> &'c VersionedCache {
        self.cache
    }

    /// Commit every write of the transaction.
    pub fn commit(self) -> VellumResult<()> {
        self.wtxn.commit().lmdb()
    }

    /// Discard every write of the transaction.
    pub fn rollback(self) {
        self.wtxn.abort();
    }
}
