//! Collection Snapshot Store.
//!
//! A snapshot row asserts that, as of its version marker, the records stored
//! under its `(type, namespace)` are the complete collection. ETag snapshots
//! keep a single live row; timestamp snapshots keep full history, one row per
//! instant.

use heed::types::{Bytes, SerdeJson};
use heed::{Database, Env, PutFlags, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use tracing::debug;
use vellum_core::{Etag, Timestamp, VellumResult};

use crate::error::{unique_put, LmdbResultExt};
use crate::keys::{scope_prefix, KeyBuf, TimeRange, VersionKey};
use crate::records::delete_prefix;
use crate::schema::COLLECTION;

/// One recorded collection snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub etag: Option<Etag>,
    pub valid_at: Option<Timestamp>,
    pub cached_at: Timestamp,
}

impl SnapshotRow {
    fn version(&self) -> VersionKey<'_> {
        match (self.valid_at, &self.etag) {
            (Some(ts), _) => VersionKey::At(ts),
            (None, Some(etag)) => VersionKey::Etag(etag),
            (None, None) => VersionKey::Unversioned,
        }
    }
}

/// How an as-of snapshot query was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMatch {
    /// A snapshot was taken exactly at the requested instant.
    Exact,
    /// The nearest snapshots on both sides carry the same version tag, so
    /// the collection did not change in between.
    Sandwich,
}

/// Decide which snapshot answers a query at `at`, given the latest snapshot
/// at or before `at` and the earliest at or after it.
pub fn reconcile(
    before: Option<SnapshotRow>,
    after: Option<SnapshotRow>,
    at: Timestamp,
) -> Option<(SnapshotRow, SnapshotMatch)> {
    let before = before?;
    if before.valid_at == Some(at) {
        return Some((before, SnapshotMatch::Exact));
    }
    let after = after?;
    match (&before.etag, &after.etag) {
        (Some(lhs), Some(rhs)) if lhs == rhs => Some((before, SnapshotMatch::Sandwich)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SnapshotStore {
    db: Database<Bytes, SerdeJson<SnapshotRow>>,
}

impl SnapshotStore {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<Self> {
        let db = env.create_database(wtxn, Some(COLLECTION)).lmdb()?;
        Ok(Self { db })
    }

    pub(crate) fn open(env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Option<Self>> {
        Ok(env
            .open_database(rtxn, Some(COLLECTION))
            .lmdb()?
            .map(|db| Self { db }))
    }

    /// Record a snapshot. With `replace`, every earlier snapshot of the scope
    /// is purged first; otherwise a second snapshot at the same instant is a
    /// uniqueness violation.
    pub fn insert(
        &self,
        wtxn: &mut RwTxn<'_>,
        type_name: &str,
        namespace: &str,
        row: &SnapshotRow,
        replace: bool,
    ) -> VellumResult<()> {
        let prefix = scope_prefix(type_name, namespace);
        if replace {
            delete_prefix(&self.db, wtxn, prefix.as_slice())?;
        }
        let key = prefix.version(row.version());
        unique_put(
            self.db
                .put_with_flags(wtxn, PutFlags::NO_OVERWRITE, key.as_slice(), row),
            COLLECTION,
        )
    }

    /// The single live ETag snapshot of a scope.
    pub fn live(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
    ) -> VellumResult<Option<SnapshotRow>> {
        let prefix = scope_prefix(type_name, namespace);
        let mut latest: Option<SnapshotRow> = None;
        for entry in self.db.prefix_iter(rtxn, prefix.as_slice()).lmdb()? {
            let (_, row) = entry.lmdb()?;
            if latest.as_ref().map_or(true, |l| row.cached_at > l.cached_at) {
                latest = Some(row);
            }
        }
        Ok(latest)
    }

    /// The most recent timestamp snapshot of a scope.
    pub fn latest(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
    ) -> VellumResult<Option<SnapshotRow>> {
        let range = TimeRange::new(&scope_prefix(type_name, namespace), None, None);
        self.first_in(rtxn, &range, true)
    }

    /// Resolve the snapshot that describes the collection at `at`.
    pub fn resolve_at(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
        at: Timestamp,
    ) -> VellumResult<Option<SnapshotRow>> {
        let prefix: KeyBuf = scope_prefix(type_name, namespace);
        let before = self.first_in(rtxn, &TimeRange::new(&prefix, None, Some(at)), true)?;
        let after = self.first_in(rtxn, &TimeRange::new(&prefix, Some(at), None), false)?;

        match reconcile(before, after, at) {
            Some((row, how)) => {
                debug!(
                    type_name,
                    namespace,
                    at = %at,
                    valid_at = ?row.valid_at,
                    resolution = ?how,
                    "Resolved collection snapshot"
                );
                Ok(Some(row))
            }
            None => {
                debug!(type_name, namespace, at = %at, "No snapshot covers requested instant");
                Ok(None)
            }
        }
    }

    fn first_in(
        &self,
        rtxn: &RoTxn<'_>,
        range: &TimeRange,
        reverse: bool,
    ) -> VellumResult<Option<SnapshotRow>> {
        let bounds = range.bounds();
        let first = if reverse {
            self.db.rev_range(rtxn, &bounds).lmdb()?.next()
        } else {
            self.db.range(rtxn, &bounds).lmdb()?.next()
        };
        Ok(first.transpose().lmdb()?.map(|(_, row)| row))
    }
}
