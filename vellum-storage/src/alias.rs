//! Alias Index: alternate lookup paths resolving to one canonical path.
//!
//! Each alias is stored twice in `object_alias`, under two tagged key spaces:
//!
//! - `type ‖ namespace ‖ "a" ‖ alias` answers lookups by alias
//! - `type ‖ namespace ‖ "c" ‖ canonical ‖ alias` lists the aliases of one
//!   canonical path with a prefix scan

use std::collections::BTreeSet;

use heed::types::{Bytes, SerdeJson};
use heed::{Database, Env, PutFlags, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use vellum_core::{StorageError, VellumResult};

use crate::error::{unique_put, LmdbResultExt};
use crate::keys::{scope_prefix, KeyBuf};
use crate::schema::OBJECT_ALIAS;

const BY_ALIAS: &str = "a";
const BY_CANONICAL: &str = "c";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRow {
    pub canonical_path: String,
    pub alias_path: String,
}

fn alias_key(type_name: &str, namespace: &str, alias: &str) -> KeyBuf {
    scope_prefix(type_name, namespace)
        .component(BY_ALIAS)
        .component(alias)
}

fn owner_prefix(type_name: &str, namespace: &str, canonical_path: &str) -> KeyBuf {
    scope_prefix(type_name, namespace)
        .component(BY_CANONICAL)
        .component(canonical_path)
}

fn distinct(aliases: &[String]) -> BTreeSet<&str> {
    aliases.iter().map(String::as_str).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct AliasIndex {
    db: Database<Bytes, SerdeJson<AliasRow>>,
}

impl AliasIndex {
    pub(crate) fn create(env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<Self> {
        let db = env.create_database(wtxn, Some(OBJECT_ALIAS)).lmdb()?;
        Ok(Self { db })
    }

    pub(crate) fn open(env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Option<Self>> {
        Ok(env
            .open_database(rtxn, Some(OBJECT_ALIAS))
            .lmdb()?
            .map(|db| Self { db }))
    }

    /// Canonical path registered for `alias`, if any.
    pub fn resolve(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
        alias: &str,
    ) -> VellumResult<Option<String>> {
        let key = alias_key(type_name, namespace, alias);
        Ok(self
            .db
            .get(rtxn, key.as_slice())
            .lmdb()?
            .map(|row| row.canonical_path))
    }

    /// Fail if any of `aliases` is owned by a path other than
    /// `canonical_path`. Reads only.
    pub fn check_available(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
        canonical_path: &str,
        aliases: &[String],
    ) -> VellumResult<()> {
        for alias in distinct(aliases) {
            match self.resolve(rtxn, type_name, namespace, alias)? {
                Some(owner) if owner != canonical_path => {
                    return Err(StorageError::UniqueViolation {
                        table: OBJECT_ALIAS.to_string(),
                    }
                    .into())
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Replace the alias set of `canonical_path` with `aliases`.
    ///
    /// An alias already owned by a different canonical path is a uniqueness
    /// violation.
    pub fn replace(
        &self,
        wtxn: &mut RwTxn<'_>,
        type_name: &str,
        namespace: &str,
        canonical_path: &str,
        aliases: &[String],
    ) -> VellumResult<()> {
        let owned = owner_prefix(type_name, namespace, canonical_path);
        let stale: Vec<(Vec<u8>, String)> = self
            .db
            .prefix_iter(wtxn, owned.as_slice())
            .lmdb()?
            .map(|entry| entry.map(|(key, row)| (key.to_vec(), row.alias_path)))
            .collect::<Result<_, _>>()
            .lmdb()?;
        for (owner_key, alias) in &stale {
            self.db.delete(wtxn, owner_key).lmdb()?;
            let key = alias_key(type_name, namespace, alias);
            self.db.delete(wtxn, key.as_slice()).lmdb()?;
        }

        for alias in distinct(aliases) {
            let row = AliasRow {
                canonical_path: canonical_path.to_string(),
                alias_path: alias.to_string(),
            };
            let key = alias_key(type_name, namespace, alias);
            unique_put(
                self.db
                    .put_with_flags(wtxn, PutFlags::NO_OVERWRITE, key.as_slice(), &row),
                OBJECT_ALIAS,
            )?;
            let key = owned.clone().component(alias);
            unique_put(
                self.db
                    .put_with_flags(wtxn, PutFlags::NO_OVERWRITE, key.as_slice(), &row),
                OBJECT_ALIAS,
            )?;
        }
        Ok(())
    }

    /// Every alias currently pointing at `canonical_path`, in key order.
    pub fn aliases_of(
        &self,
        rtxn: &RoTxn<'_>,
        type_name: &str,
        namespace: &str,
        canonical_path: &str,
    ) -> VellumResult<Vec<String>> {
        let owned = owner_prefix(type_name, namespace, canonical_path);
        self.db
            .prefix_iter(rtxn, owned.as_slice())
            .lmdb()?
            .map(|entry| entry.map(|(_, row)| row.alias_path))
            .collect::<Result<_, _>>()
            .lmdb()
    }
}
