//! Storage Extension Registry.
//!
//! Some object kinds need a physical encoding the generic JSON Record Store
//! is not suited for. A [`TypedStore`] takes over every Record read and write
//! of one type; the engine keeps policy validation, metadata detachment and
//! snapshot resolution.

use std::collections::BTreeMap;

use heed::{Env, RoTxn, RwTxn};
use vellum_core::{ObjectContractError, Timestamp, VellumResult};

use crate::geography::GeographyStore;
use crate::records::{Lookup, MetaBlobs, NewRecord, StoredObject};

/// Type-specialized physical store for one object type.
pub trait TypedStore: Send + Sync {
    /// Cache name of the object type this store owns.
    fn type_name(&self) -> &'static str;

    /// Named tables this store needs in the environment.
    fn tables(&self) -> &'static [&'static str];

    /// Create this store's tables on a fresh cache.
    fn init_db(&mut self, env: &Env, wtxn: &mut RwTxn<'_>) -> VellumResult<()>;

    /// Open this store's tables on an existing cache, returning the names of
    /// any that are missing.
    fn attach(&mut self, env: &Env, rtxn: &RoTxn<'_>) -> VellumResult<Vec<&'static str>>;

    fn get(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        namespace: &str,
        path: &str,
        lookup: &Lookup<'_>,
    ) -> VellumResult<Option<StoredObject>>;

    /// Reject a record this store cannot encode. Runs before the engine
    /// writes anything for the record.
    fn check(&self, record: &NewRecord<'_>) -> VellumResult<()> {
        let _ = record;
        Ok(())
    }

    fn insert(&self, wtxn: &mut RwTxn<'_>, record: &NewRecord<'_>) -> VellumResult<()>;

    /// Latest version of every member path as of `valid_at`.
    fn all(
        &self,
        rtxn: &RoTxn<'_>,
        meta: &MetaBlobs,
        namespace: &str,
        valid_at: Option<Timestamp>,
    ) -> VellumResult<BTreeMap<String, StoredObject>>;
}

/// Type name to extension store mapping, fixed once a cache is opened.
#[derive(Default)]
pub struct ExtensionRegistry {
    stores: BTreeMap<&'static str, Box<dyn TypedStore>>,
}

impl ExtensionRegistry {
    /// An empty registry: every type uses the default Record Store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in extensions.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.stores.insert(
            crate::geography::GEOGRAPHY,
            Box::new(GeographyStore::new()),
        );
        registry
    }

    pub fn register(&mut self, store: Box<dyn TypedStore>) -> Result<(), ObjectContractError> {
        let name = store.type_name();
        vellum_core::validate_cache_name(name)?;
        if self.stores.contains_key(name) {
            return Err(ObjectContractError::DuplicateExtension {
                type_name: name.to_string(),
            });
        }
        self.stores.insert(name, store);
        Ok(())
    }

    pub fn get(&self, type_name: &str) -> Option<&dyn TypedStore> {
        self.stores.get(type_name).map(|store| store.as_ref())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.stores.contains_key(type_name)
    }

    /// Every table owned by a registered extension.
    pub fn tables(&self) -> Vec<&'static str> {
        self.stores
            .values()
            .flat_map(|store| store.tables().iter().copied())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub(crate) fn stores_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn TypedStore>> {
        self.stores.values_mut()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("types", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}
