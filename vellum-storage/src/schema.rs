//! Physical schema: table names, creation, and the consistency check run
//! when a cache is opened.

use heed::types::Str;
use heed::{Database, Env, RwTxn};
use tracing::{info, warn};
use vellum_core::{InitError, VellumError, VellumResult, CORE_TABLE_COUNT};

use crate::alias::AliasIndex;
use crate::collections::SnapshotStore;
use crate::error::LmdbResultExt;
use crate::extension::ExtensionRegistry;
use crate::records::{MetaBlobs, RecordStore};

/// Schema version this engine writes and accepts.
pub const SCHEMA_VERSION: &str = "0";

pub const CACHE_META: &str = "cache_meta";
pub const OBJECT_META: &str = "object_meta";
pub const OBJECT: &str = "object";
pub const OBJECT_ALIAS: &str = "object_alias";
pub const COLLECTION: &str = "collection";

/// Every table of the core schema.
pub const CORE_TABLES: [&str; CORE_TABLE_COUNT] =
    [CACHE_META, OBJECT_META, OBJECT, OBJECT_ALIAS, COLLECTION];

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Handles to every core table of an open cache.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub cache_meta: Database<Str, Str>,
    pub meta: MetaBlobs,
    pub records: RecordStore,
    pub aliases: AliasIndex,
    pub snapshots: SnapshotStore,
}

/// Whether [`Schema::open`] found an existing cache or built a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    Created,
    Verified,
}

impl Schema {
    /// Create a fresh schema or verify an existing one, attaching every
    /// registered extension either way. Nothing is committed on failure.
    pub fn open(env: &Env, extensions: &mut ExtensionRegistry) -> VellumResult<(Self, Opened)> {
        let mut wtxn = env.write_txn().lmdb()?;

        let cache_meta = env
            .open_database::<Str, Str>(&wtxn, Some(CACHE_META))
            .lmdb()?;
        let meta = MetaBlobs::open(env, &wtxn)?;
        let records = RecordStore::open(env, &wtxn)?;
        let aliases = AliasIndex::open(env, &wtxn)?;
        let snapshots = SnapshotStore::open(env, &wtxn)?;

        let present = [
            cache_meta.is_some(),
            meta.is_some(),
            records.is_some(),
            aliases.is_some(),
            snapshots.is_some(),
        ];

        if present.iter().all(|p| !p) {
            let schema = Self::create(env, &mut wtxn, extensions)?;
            wtxn.commit().lmdb()?;
            info!(
                path = %env.path().display(),
                schema_version = SCHEMA_VERSION,
                extensions = ?extensions.tables(),
                "Created cache schema"
            );
            return Ok((schema, Opened::Created));
        }

        let mut missing: Vec<String> = CORE_TABLES
            .iter()
            .zip(present)
            .filter(|(_, present)| !present)
            .map(|(name, _)| name.to_string())
            .collect();
        for store in extensions.stores_mut() {
            missing.extend(store.attach(env, &wtxn)?.into_iter().map(str::to_string));
        }

        let schema = match (cache_meta, meta, records, aliases, snapshots) {
            (Some(cache_meta), Some(meta), Some(records), Some(aliases), Some(snapshots))
                if missing.is_empty() =>
            {
                Self {
                    cache_meta,
                    meta,
                    records,
                    aliases,
                    snapshots,
                }
            }
            _ => return Err(reject(env, InitError::MissingTables { tables: missing })),
        };

        match schema.cache_meta.get(&wtxn, SCHEMA_VERSION_KEY).lmdb()? {
            None => return Err(reject(env, InitError::MissingSchemaVersion)),
            Some(found) if found != SCHEMA_VERSION => {
                return Err(reject(
                    env,
                    InitError::SchemaVersionMismatch {
                        expected: SCHEMA_VERSION.to_string(),
                        found: found.to_string(),
                    },
                ))
            }
            Some(_) => {}
        }

        wtxn.commit().lmdb()?;
        info!(path = %env.path().display(), "Opened existing cache");
        Ok((schema, Opened::Verified))
    }

    fn create(
        env: &Env,
        wtxn: &mut RwTxn<'_>,
        extensions: &mut ExtensionRegistry,
    ) -> VellumResult<Self> {
        let cache_meta: Database<Str, Str> = env.create_database(wtxn, Some(CACHE_META)).lmdb()?;
        let schema = Self {
            cache_meta,
            meta: MetaBlobs::create(env, wtxn)?,
            records: RecordStore::create(env, wtxn)?,
            aliases: AliasIndex::create(env, wtxn)?,
            snapshots: SnapshotStore::create(env, wtxn)?,
        };
        for store in extensions.stores_mut() {
            store.init_db(env, wtxn)?;
        }
        cache_meta.put(wtxn, SCHEMA_VERSION_KEY, SCHEMA_VERSION).lmdb()?;
        Ok(schema)
    }

    /// Schema version stamped into the cache metadata table.
    pub fn stamped_version(&self, env: &Env) -> VellumResult<Option<String>> {
        let rtxn = env.read_txn().lmdb()?;
        Ok(self
            .cache_meta
            .get(&rtxn, SCHEMA_VERSION_KEY)
            .lmdb()?
            .map(str::to_string))
    }
}

fn reject(env: &Env, err: InitError) -> VellumError {
    warn!(path = %env.path().display(), error = %err, "Cache consistency check failed");
    err.into()
}
