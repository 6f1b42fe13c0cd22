//! Record Store and Metadata Blobs.
//!
//! One row per cached object version, keyed by
//! `type ‖ namespace ‖ path ‖ version` (see [`crate::keys`]). Detached
//! metadata lives in its own table keyed by [`MetaId`] and is shared by
//! reference.

use std::collections::BTreeMap;

use heed::types::{Bytes, DecodeIgnore, SerdeJson};
use heed::{Database, Env, PutFlags, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vellum_core::{
    CachePolicy, CacheableObject, CachedObject, Etag, MetaId, ObjectParts, StorageError, Timestamp,
    VellumResult,
};

use crate::error::{unique_put, LmdbResultExt};
use crate::keys::{path_prefix, scope_prefix, KeyBuf, TimeRange, VersionKey};
use crate::schema::{OBJECT, OBJECT_META};

// ============================================================================
// ROW TYPES
// ============================================================================

/// One persisted object version in the default Record Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub path: String,
    pub data: Map<String, Value>,
    pub meta_id: Option<MetaId>,
    pub etag: Option<Etag>,
    pub valid_from: Option<Timestamp>,
    pub cached_at: Timestamp,
}

/// Version markers every stored row carries, whatever its physical encoding.
pub trait VersionedRow {
    fn path(&self) -> &str;
    fn valid_from(&self) -> Option<Timestamp>;
    fn cached_at(&self) -> Timestamp;
}

impl VersionedRow for RecordRow {
    fn path(&self) -> &str {
        &self.path
    }

    fn valid_from(&self) -> Option<Timestamp> {
        self.valid_from
    }

    fn cached_at(&self) -> Timestamp {
        self.cached_at
    }
}

/// A stored object decoded back to its JSON body, before typed deserialization.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub body: Map<String, Value>,
    pub meta: Option<Value>,
    pub cached_at: Timestamp,
    pub valid_from: Option<Timestamp>,
    pub etag: Option<Etag>,
}

impl StoredObject {
    /// Deserialize into the caller's type.
    pub fn into_object<T: CacheableObject>(self) -> VellumResult<T> {
        T::from_parts(ObjectParts {
            body: self.body,
            meta: self.meta,
            aliases: None,
        })
    }

    /// Deserialize and wrap with fetch time and version markers.
    pub fn into_cached<T: CacheableObject>(self) -> VellumResult<CachedObject<T>> {
        let cached_at = self.cached_at;
        let valid_from = self.valid_from;
        let etag = self.etag.clone();
        Ok(CachedObject {
            value: self.into_object()?,
            cached_at,
            valid_from,
            etag,
        })
    }
}

/// A validated write, ready for whichever store owns the type.
#[derive(Debug, Clone)]
pub struct NewRecord<'a> {
    pub type_name: &'a str,
    pub policy: CachePolicy,
    pub path: &'a str,
    pub namespace: &'a str,
    pub body: &'a Map<String, Value>,
    pub meta_id: Option<MetaId>,
    pub etag: Option<&'a Etag>,
    pub valid_from: Option<Timestamp>,
    pub cached_at: Timestamp,
}

impl NewRecord<'_> {
    /// Key suffix for this version under its policy.
    pub fn version(&self) -> VersionKey<'_> {
        match (self.policy, self.etag, self.valid_from) {
            (CachePolicy::ETag, Some(etag), _) => VersionKey::Etag(etag),
            (CachePolicy::Timestamp, _, Some(ts)) => VersionKey::At(ts),
            _ => VersionKey::Unversioned,
        }
    }

    /// Whether older versions of the same path are purged on write.
    pub fn replaces_history(&self) -> bool {
        self.policy != CachePolicy::Timestamp
    }
}

// ============================================================================
// READ SELECTION
// ============================================================================

/// Version selectors of a single-object read.
#[derive(Debug, Clone, Copy)]
pub struct Lookup<'a> {
    pub policy: CachePolicy,
    pub at: Option<Timestamp>,
    pub etag: Option<&'a Etag>,
}

/// How a [`Lookup`] is answered against one path prefix.
pub enum ReadPlan {
    /// Exact key match (ETag given).
    Exact(Vec<u8>),
    /// Greatest timestamp-versioned key inside the range.
    LatestInRange(TimeRange),
    /// Most recently fetched row under the prefix.
    LatestFetched(KeyBuf),
}

impl Lookup<'_> {
    pub fn plan(&self, prefix: KeyBuf) -> ReadPlan {
        match (self.policy, self.etag) {
            (CachePolicy::ETag, Some(etag)) => {
                ReadPlan::Exact(prefix.version(VersionKey::Etag(etag)).into_bytes())
            }
            (CachePolicy::Timestamp, _) => {
                ReadPlan::LatestInRange(TimeRange::new(&prefix, None, self.at))
            }
            _ => ReadPlan::LatestFetched(prefix),
        }
    }
}

/// Keep the newer of two candidates for the same path.
fn newer<R: VersionedRow>(current: Option<R>, candidate: R) -> R {
    match current {
        Some(current)
            if (current.valid_from(), current.cached_at())
                >= (candidate.valid_from(), candidate.cached_at()) =>
        {
            current
        }
        _ => candidate,
    }
}

/// Reduce a scope's rows to each path's latest version as of `valid_at`.
///
/// With `valid_at = None` no time filter applies.
pub fn latest_per_path<R, I>(rows: I, valid_at: Option<Timestamp>) -> BTreeMap<String, R>
where
    R: VersionedRow,
    I: IntoIterator<Item = R>,
{
    let mut members: BTreeMap<String, R> = BTreeMap::new();
    for row in rows {
        if let (Some(bound), Some(from)) = (valid_at, row.valid_from()) {
            if from > bound {
                continue;
            }
        }
        let current = members.remove(row.path());
        let path = row.path().to_string();
        members.insert(path, newer(current, row));
    }
    members
}

/// Delete every key under `prefix`, returning how many were removed.
pub(crate) fn delete_prefix<DC>(
    db: &Database<Bytes, DC>,
    wtxn: &mut RwTxn<'_>,
    prefix: &[u8],
) -> VellumResult<usize> {
    let keys: Vec<Vec<u8>> = {
        let iter = db
            .remap_data_type::<DecodeIgnore>()
            .prefix_iter(wtxn, prefix)
            .lmdb()?;
        iter.map(|entry| entry.map(|(key, ())| key.to_vec()))
            .collect::<Result<_, _>>()
            .lmdb()?
    };
    for key in &keys {
        db.delete(wtxn, key).lmdb()?;
    }
    Ok(keys.len())
}

// ============================================================================
// METADATA BLOBS
// ============================================================================

/// Deduplicated metadata bodies keyed by content hash.
#[derive(Debug, Clone, Copy)]
pub struct MetaBlobs {
    db: Database<Bytes, SerdeJson<Value>>,
}

impl MetaBlobs {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<Self> {
        let db = env.create_database(wtxn, Some(OBJECT_META)).lmdb()?;
        Ok(Self { db })
    }

    pub(crate) fn open(env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Option<Self>> {
        Ok(env
            .open_database(rtxn, Some(OBJECT_META))
            .lmdb()?
            .map(|db| Self { db }))
    }

    /// Store `meta` under `id` unless a blob with that key already exists.
    ///
    /// Returns whether a new blob was written.
    pub fn upsert(&self, wtxn: &mut RwTxn<'_>, id: &MetaId, meta: &Value) -> VellumResult<bool> {
        if self.db.get(wtxn, id.as_bytes().as_slice()).lmdb()?.is_some() {
            return Ok(false);
        }
        self.db.put(wtxn, id.as_bytes().as_slice(), meta).lmdb()?;
        Ok(true)
    }

    pub fn get(&self, rtxn: &RoTxn<'_>, id: &MetaId) -> VellumResult<Option<Value>> {
        self.db.get(rtxn, id.as_bytes().as_slice()).lmdb()
    }

    /// Resolve a row's optional reference. A reference to a blob that is not
    /// stored is a corrupt row.
    pub fn resolve(&self, rtxn: &RoTxn<'_>, id: Option<&MetaId>) -> VellumResult<Option<Value>> {
        let Some(id) = id else {
            return Ok(None);
        };
        match self.get(rtxn, id)? {
            Some(meta) => Ok(Some(meta)),
            None => Err(StorageError::Corrupt {
                table: OBJECT_META.to_string(),
                reason: format!("dangling metadata reference {}", hex::encode(id.as_bytes())),
            }
            .into()),
        }
    }

    pub fn len(&self, rtxn: &RoTxn<'_>) -> VellumResult<u64> {
        self.db.len(rtxn).lmdb()
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// Default physical store for object versions.
#[derive(Debug, Clone, Copy)]
pub struct RecordStore {
    db: Database<Bytes, SerdeJson<RecordRow>>,
}

impl RecordStore {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<Self> {
        let db = env.create_database(wtxn, Some(OBJECT)).lmdb()?;
        Ok(Self { db })
    }

    pub(crate) fn open(env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Option<Self>> {
        Ok(env
            .open_database(rtxn, Some(OBJECT))
            .lmdb()?
            .map(|db| Self { db }))
    }

    /// Write one version. ETag and unversioned writes first purge every older
    /// version of the path; a duplicate version key is a uniqueness violation.
    pub fn insert(&self, wtxn: &mut RwTxn<'_>, record: &NewRecord<'_>) -> VellumResult<()> {
        let prefix = path_prefix(record.type_name, record.namespace, record.path);
        if record.replaces_history() {
            delete_prefix(&self.db, wtxn, prefix.as_slice())?;
        }

        let key = prefix.version(record.version());
        let row = RecordRow {
            path: record.path.to_string(),
            data: record.body.clone(),
            meta_id: record.meta_id,
            etag: record.etag.cloned(),
            valid_from: record.valid_from,
            cached_at: record.cached_at,
        };
        unique_put(
            self.db
                .put_with_flags(wtxn, PutFlags::NO_OVERWRITE, key.as_slice(), &row),
            OBJECT,
        )
    }

    /// Select the single best version of one path.
    pub fn get(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        type_name: &str,
        namespace: &str,
        path: &str,
        lookup: &Lookup<'_>,
    ) -> VellumResult<Option<StoredObject>> {
        let prefix = path_prefix(type_name, namespace, path);
        let row = match lookup.plan(prefix) {
            ReadPlan::Exact(key) => self.db.get(rtxn, key.as_slice()).lmdb()?,
            ReadPlan::LatestInRange(range) => self
                .db
                .rev_range(rtxn, &range.bounds())
                .lmdb()?
                .next()
                .transpose()
                .lmdb()?
                .map(|(_, row)| row),
            ReadPlan::LatestFetched(prefix) => {
                let mut latest: Option<RecordRow> = None;
                for entry in self.db.prefix_iter(rtxn, prefix.as_slice()).lmdb()? {
                    let (_, row) = entry.lmdb()?;
                    if latest.as_ref().map_or(true, |l| row.cached_at > l.cached_at) {
                        latest = Some(row);
                    }
                }
                latest
            }
        };

        row.map(|row| self.hydrate(rtxn, meta, row)).transpose()
    }

    /// Latest version of every path in `(type, namespace)` as of `valid_at`.
    pub fn members(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        type_name: &str,
        namespace: &str,
        valid_at: Option<Timestamp>,
    ) -> VellumResult<BTreeMap<String, StoredObject>> {
        let prefix = scope_prefix(type_name, namespace);
        let rows = self
            .db
            .prefix_iter(rtxn, prefix.as_slice())
            .lmdb()?
            .map(|entry| entry.map(|(_, row)| row))
            .collect::<Result<Vec<_>, _>>()
            .lmdb()?;

        latest_per_path(rows, valid_at)
            .into_iter()
            .map(|(path, row)| Ok((path, self.hydrate(rtxn, meta, row)?)))
            .collect()
    }

    /// Number of retained versions of one path.
    pub fn version_count(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
        path: &str,
    ) -> VellumResult<usize> {
        let prefix = path_prefix(type_name, namespace, path);
        let mut count = 0;
        for entry in self
            .db
            .remap_data_type::<DecodeIgnore>()
            .prefix_iter(rtxn, prefix.as_slice())
            .lmdb()?
        {
            entry.lmdb()?;
            count += 1;
        }
        Ok(count)
    }

    fn hydrate(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        row: RecordRow,
    ) -> VellumResult<StoredObject> {
        Ok(StoredObject {
            meta: meta.resolve(rtxn, row.meta_id.as_ref())?,
            body: row.data,
            cached_at: row.cached_at,
            valid_from: row.valid_from,
            etag: row.etag,
        })
    }
}
