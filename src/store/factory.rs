use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::store::common::Store;
use crate::store::config::StoreConfig;
use crate::store::dynamic::{
    DynamicStore, ARRAY_STORE, PROPERTY_KEY_NAME_STORE, REL_TYPE_NAME_STORE, STRING_STORE,
};
use crate::store::graph_store::{files, GraphStore};
use crate::store::meta::MetaStore;
use crate::store::record::{
    NodeFormat, PropertyFormat, PropertyKeyFormat, RelationshipFormat, RelationshipTypeFormat,
};
use crate::store::record_store::RecordStore;
use crate::types::{Result, StoreError};

/// Creates and opens the sub-stores of a [`GraphStore`] in dependency order:
/// a referenced store is always opened before the stores that point into it.
pub struct StoreFactory {
    config: StoreConfig,
}

impl StoreFactory {
    /// Factory with the given configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// Configuration used for every sub-store.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// True if `dir` holds a meta store.
    pub fn store_exists(dir: &Path) -> bool {
        dir.join(files::META).exists()
    }

    /// Creates every sub-store file in `dir` and opens the result.
    pub fn create(&self, dir: &Path) -> Result<GraphStore> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly("cannot create a store read-only"));
        }
        fs::create_dir_all(dir)?;
        if Self::store_exists(dir) {
            return Err(StoreError::AlreadyExists(dir.join(files::META)));
        }
        MetaStore::create(dir.join(files::META))?;
        DynamicStore::create(
            dir.join(files::PROPERTY_KEY_NAMES),
            PROPERTY_KEY_NAME_STORE,
            self.config.name_block_size,
        )?;
        RecordStore::<PropertyKeyFormat>::create(dir.join(files::PROPERTY_KEYS))?;
        DynamicStore::create(
            dir.join(files::STRINGS),
            STRING_STORE,
            self.config.string_block_size,
        )?;
        DynamicStore::create(dir.join(files::ARRAYS), ARRAY_STORE, self.config.array_block_size)?;
        RecordStore::<PropertyFormat>::create(dir.join(files::PROPERTIES))?;
        DynamicStore::create(
            dir.join(files::REL_TYPE_NAMES),
            REL_TYPE_NAME_STORE,
            self.config.name_block_size,
        )?;
        RecordStore::<RelationshipTypeFormat>::create(dir.join(files::REL_TYPES))?;
        RecordStore::<RelationshipFormat>::create(dir.join(files::RELATIONSHIPS))?;
        RecordStore::<NodeFormat>::create(dir.join(files::NODES))?;
        info!(dir = %dir.display(), "store.factory.create");
        self.open(dir)
    }

    /// Opens every sub-store in `dir`. If one fails, the ones already opened
    /// are closed in reverse order and the error is returned.
    pub fn open(&self, dir: &Path) -> Result<GraphStore> {
        let cfg = &self.config;
        let mut opening = Opening::default();
        let meta = opening.track(MetaStore::open(dir.join(files::META), cfg))?;
        let property_key_names = opening.track(DynamicStore::open(
            dir.join(files::PROPERTY_KEY_NAMES),
            PROPERTY_KEY_NAME_STORE,
            cfg,
        ))?;
        let property_keys = opening.track(RecordStore::<PropertyKeyFormat>::open(
            dir.join(files::PROPERTY_KEYS),
            cfg,
        ))?;
        let strings =
            opening.track(DynamicStore::open(dir.join(files::STRINGS), STRING_STORE, cfg))?;
        let arrays = opening.track(DynamicStore::open(dir.join(files::ARRAYS), ARRAY_STORE, cfg))?;
        let properties = opening.track(RecordStore::<PropertyFormat>::open(
            dir.join(files::PROPERTIES),
            cfg,
        ))?;
        let rel_type_names = opening.track(DynamicStore::open(
            dir.join(files::REL_TYPE_NAMES),
            REL_TYPE_NAME_STORE,
            cfg,
        ))?;
        let rel_types = opening.track(RecordStore::<RelationshipTypeFormat>::open(
            dir.join(files::REL_TYPES),
            cfg,
        ))?;
        let relationships = opening.track(RecordStore::<RelationshipFormat>::open(
            dir.join(files::RELATIONSHIPS),
            cfg,
        ))?;
        let nodes =
            opening.track(RecordStore::<NodeFormat>::open(dir.join(files::NODES), cfg))?;
        opening.finish();
        let store = GraphStore::assemble(
            dir,
            meta,
            property_key_names,
            property_keys,
            strings,
            arrays,
            properties,
            rel_type_names,
            rel_types,
            relationships,
            nodes,
        );
        info!(
            dir = %dir.display(),
            store_ok = store.is_store_ok(),
            "store.factory.open"
        );
        Ok(store)
    }
}

/// Sub-stores opened so far; closed in reverse unless [`Opening::finish`]
/// is reached.
#[derive(Default)]
struct Opening {
    opened: Vec<Arc<dyn Store>>,
}

impl Opening {
    fn track<S: Store + 'static>(&mut self, result: Result<S>) -> Result<Arc<S>> {
        match result {
            Ok(store) => {
                let store = Arc::new(store);
                self.opened.push(store.clone());
                Ok(store)
            }
            Err(err) => {
                self.abort();
                Err(err)
            }
        }
    }

    fn abort(&mut self) {
        for store in self.opened.drain(..).rev() {
            if let Err(err) = store.close() {
                warn!(
                    store = store.type_descriptor(),
                    error = %err,
                    "store.factory.open.unwind_failed"
                );
            }
        }
    }

    fn finish(mut self) {
        self.opened.clear();
    }
}

impl Drop for Opening {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::common::id_file_path;
    use crate::store::record::NodeRecord;
    use crate::types::NodeId;
    use tempfile::tempdir;

    #[test]
    fn create_open_close_cycle() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = StoreFactory::new(StoreConfig::default());
        let store = factory.create(dir.path())?;
        assert!(store.is_store_ok());
        let id = store.nodes().next_id()?;
        store.apply_node(&NodeRecord::new(id), false)?;
        store.close()?;

        assert!(matches!(
            factory.create(dir.path()),
            Err(StoreError::AlreadyExists(_))
        ));
        let store = factory.open(dir.path())?;
        assert_eq!(store.load_node(NodeId(0))?, NodeRecord::new(NodeId(0)));
        assert_eq!(store.stats().stores.len(), 10);
        store.close()
    }

    #[test]
    fn failed_open_releases_already_opened_stores() -> Result<()> {
        let dir = tempdir().unwrap();
        let factory = StoreFactory::new(StoreConfig::default());
        factory.create(dir.path())?.close()?;
        fs::remove_file(dir.path().join(files::NODES))?;
        assert!(matches!(factory.open(dir.path()), Err(StoreError::NotFound)));

        // Locks were released and sidecars closed cleanly by the unwind.
        RecordStore::<NodeFormat>::create(dir.path().join(files::NODES))?;
        assert!(id_file_path(&dir.path().join(files::META)).exists());
        let store = factory.open(dir.path())?;
        assert!(store.is_store_ok());
        store.close()
    }
}
