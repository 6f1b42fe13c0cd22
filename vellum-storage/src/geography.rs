//! Geography extension: binary WKB payloads in a dedicated table.
//!
//! In the generic JSON body the WKB payload travels as a hex string; the
//! `geography` table holds the raw bytes in bincode rows and rebuilds the
//! hex body on read.

use std::collections::BTreeMap;

use heed::types::{Bytes, SerdeBincode};
use heed::{Database, Env, PutFlags, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vellum_core::{
    CachePolicy, CacheableObject, Etag, InitError, MetaId, ObjectContractError, ObjectMeta,
    Timestamp, VellumResult,
};

use crate::error::{unique_put, LmdbResultExt};
use crate::extension::TypedStore;
use crate::keys::KeyBuf;
use crate::records::{
    delete_prefix, latest_per_path, Lookup, MetaBlobs, NewRecord, ReadPlan, StoredObject,
    VersionedRow,
};

/// Cache name and table name of the geography extension.
pub const GEOGRAPHY: &str = "geography";

const TABLES: &[&str] = &[GEOGRAPHY];

/// Body field carrying the WKB payload.
const WKB_FIELD: &str = "geography";

/// A geographic shape as well-known binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geography {
    #[serde(with = "wkb_hex")]
    pub geography: Vec<u8>,
    pub meta: Option<ObjectMeta>,
}

impl CacheableObject for Geography {
    const CACHE_NAME: &'static str = GEOGRAPHY;
    const CACHE_POLICY: CachePolicy = CachePolicy::Timestamp;
}

mod wkb_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeoRow {
    path: String,
    wkb: Vec<u8>,
    meta_id: Option<MetaId>,
    etag: Option<Etag>,
    valid_from: Option<Timestamp>,
    cached_at: Timestamp,
}

impl VersionedRow for GeoRow {
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

fn geo_prefix(namespace: &str) -> KeyBuf {
    KeyBuf::new().component(namespace)
}

fn geo_path_prefix(namespace: &str, path: &str) -> KeyBuf {
    geo_prefix(namespace).component(path)
}

fn decode_wkb(body: &Map<String, Value>) -> Result<Vec<u8>, ObjectContractError> {
    let malformed = |reason: String| ObjectContractError::MalformedBody {
        type_name: GEOGRAPHY.to_string(),
        reason,
    };
    match body.get(WKB_FIELD) {
        Some(Value::String(text)) => hex::decode(text).map_err(|e| malformed(e.to_string())),
        Some(_) => Err(malformed(format!("{WKB_FIELD} must be a hex string"))),
        None => Err(malformed(format!("missing {WKB_FIELD} field"))),
    }
}

/// Timestamp-versioned store for [`Geography`] objects.
#[derive(Debug, Default)]
pub struct GeographyStore {
    db: Option<Database<Bytes, SerdeBincode<GeoRow>>>,
}

impl GeographyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn db(&self) -> VellumResult<Database<Bytes, SerdeBincode<GeoRow>>> {
        self.db.ok_or_else(|| {
            InitError::MissingTables {
                tables: vec![GEOGRAPHY.to_string()],
            }
            .into()
        })
    }

    fn hydrate(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        row: GeoRow,
    ) -> VellumResult<StoredObject> {
        let mut body = Map::new();
        body.insert(WKB_FIELD.to_string(), Value::String(hex::encode(&row.wkb)));
        Ok(StoredObject {
            body,
            meta: meta.resolve(rtxn, row.meta_id.as_ref())?,
            cached_at: row.cached_at,
            valid_from: row.valid_from,
            etag: row.etag,
        })
    }
}

impl TypedStore for GeographyStore {
    fn type_name(&self) -> &'static str {
        GEOGRAPHY
    }

    fn tables(&self) -> &'static [&'static str] {
        TABLES
    }

    fn init_db(&mut self, env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<()> {
        self.db = Some(env.create_database(wtxn, Some(GEOGRAPHY)).lmdb()?);
        Ok(())
    }

    fn attach(&mut self, env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Vec<&'static str>> {
        self.db = env.open_database(rtxn, Some(GEOGRAPHY)).lmdb()?;
        Ok(if self.db.is_some() {
            Vec::new()
        } else {
            vec![GEOGRAPHY]
        })
    }

    fn get(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        namespace: &str,
        path: &str,
        lookup: &Lookup<'_>,
    ) -> VellumResult<Option<StoredObject>> {
        let db = self.db()?;
        let row = match lookup.plan(geo_path_prefix(namespace, path)) {
            ReadPlan::Exact(key) => db.get(rtxn, key.as_slice()).lmdb()?,
            ReadPlan::LatestInRange(range) => db
                .rev_range(rtxn, &range.bounds())
                .lmdb()?
                .next()
                .transpose()
                .lmdb()?
                .map(|(_, row)| row),
            ReadPlan::LatestFetched(prefix) => {
                let mut latest: Option<GeoRow> = None;
                for entry in db.prefix_iter(rtxn, prefix.as_slice()).lmdb()? {
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

    fn check(&self, record: &NewRecord<'_>) -> VellumResult<()> {
        decode_wkb(record.body)?;
        Ok(())
    }

    fn insert(&self, wtxn: &mut RwTxn<'_>, record: &NewRecord<'_>) -> VellumResult<()> {
        let db = self.db()?;
        let wkb = decode_wkb(record.body)?;
        let prefix = geo_path_prefix(record.namespace, record.path);
        if record.replaces_history() {
            delete_prefix(&db, wtxn, prefix.as_slice())?;
        }

        let key = prefix.version(record.version());
        let row = GeoRow {
            path: record.path.to_string(),
            wkb,
            meta_id: record.meta_id,
            etag: record.etag.cloned(),
            valid_from: record.valid_from,
            cached_at: record.cached_at,
        };
        unique_put(
            db.put_with_flags(wtxn, PutFlags::NO_OVERWRITE, key.as_slice(), &row),
            GEOGRAPHY,
        )
    }

    fn all(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        namespace: &str,
        valid_at: Option<Timestamp>,
    ) -> VellumResult<BTreeMap<String, StoredObject>> {
        let db = self.db()?;
        let prefix = geo_prefix(namespace);
        let rows = db
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
}
