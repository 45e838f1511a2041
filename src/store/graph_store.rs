//! The composite store: every record store of one graph, opened and closed
//! as a unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::store::common::{Store, StoreStats};
use crate::store::dynamic::DynamicStore;
use crate::store::meta::MetaStore;
use crate::store::property::{PropertyType, PropertyValue};
use crate::store::record::{
    DynamicRecord, NodeFormat, NodeRecord, PropertyFormat, PropertyKeyFormat, PropertyKeyRecord,
    PropertyRecord, RelationshipFormat, RelationshipRecord, RelationshipTypeFormat,
    RelationshipTypeRecord,
};
use crate::store::record_store::RecordStore;
use crate::types::{
    BlockId, NodeId, PropertyId, PropertyKeyId, RelId, RelTypeId, Result, StoreError,
};

/// File names of the sub-stores inside a store directory.
pub mod files {
    /// Meta store.
    pub const META: &str = "graph.meta";
    /// Property key names.
    pub const PROPERTY_KEY_NAMES: &str = "graph.props.keys.names";
    /// Property keys.
    pub const PROPERTY_KEYS: &str = "graph.props.keys";
    /// String values.
    pub const STRINGS: &str = "graph.props.strings";
    /// Array values.
    pub const ARRAYS: &str = "graph.props.arrays";
    /// Properties.
    pub const PROPERTIES: &str = "graph.props";
    /// Relationship type names.
    pub const REL_TYPE_NAMES: &str = "graph.reltypes.names";
    /// Relationship types.
    pub const REL_TYPES: &str = "graph.reltypes";
    /// Relationships.
    pub const RELATIONSHIPS: &str = "graph.rels";
    /// Nodes.
    pub const NODES: &str = "graph.nodes";
}

/// Stats of every sub-store, in open order.
#[derive(Clone, Debug, Serialize)]
pub struct GraphStoreStats {
    /// Store directory.
    pub dir: PathBuf,
    /// Per-store snapshots.
    pub stores: Vec<StoreStats>,
}

/// Every record store of one graph.
pub struct GraphStore {
    pub(crate) dir: PathBuf,
    pub(crate) meta: Arc<MetaStore>,
    pub(crate) property_key_names: Arc<DynamicStore>,
    pub(crate) property_keys: Arc<RecordStore<PropertyKeyFormat>>,
    pub(crate) strings: Arc<DynamicStore>,
    pub(crate) arrays: Arc<DynamicStore>,
    pub(crate) properties: Arc<RecordStore<PropertyFormat>>,
    pub(crate) rel_type_names: Arc<DynamicStore>,
    pub(crate) rel_types: Arc<RecordStore<RelationshipTypeFormat>>,
    pub(crate) relationships: Arc<RecordStore<RelationshipFormat>>,
    pub(crate) nodes: Arc<RecordStore<NodeFormat>>,
    /// Sub-stores in open order.
    order: Vec<Arc<dyn Store>>,
}

impl GraphStore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        dir: &Path,
        meta: Arc<MetaStore>,
        property_key_names: Arc<DynamicStore>,
        property_keys: Arc<RecordStore<PropertyKeyFormat>>,
        strings: Arc<DynamicStore>,
        arrays: Arc<DynamicStore>,
        properties: Arc<RecordStore<PropertyFormat>>,
        rel_type_names: Arc<DynamicStore>,
        rel_types: Arc<RecordStore<RelationshipTypeFormat>>,
        relationships: Arc<RecordStore<RelationshipFormat>>,
        nodes: Arc<RecordStore<NodeFormat>>,
    ) -> Self {
        let order: Vec<Arc<dyn Store>> = vec![
            meta.clone() as Arc<dyn Store>,
            property_key_names.clone() as Arc<dyn Store>,
            property_keys.clone() as Arc<dyn Store>,
            strings.clone() as Arc<dyn Store>,
            arrays.clone() as Arc<dyn Store>,
            properties.clone() as Arc<dyn Store>,
            rel_type_names.clone() as Arc<dyn Store>,
            rel_types.clone() as Arc<dyn Store>,
            relationships.clone() as Arc<dyn Store>,
            nodes.clone() as Arc<dyn Store>,
        ];
        Self {
            dir: dir.to_path_buf(),
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
            order,
        }
    }

    /// Store directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Meta store.
    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    /// Node store.
    pub fn nodes(&self) -> &RecordStore<NodeFormat> {
        &self.nodes
    }

    /// Relationship store.
    pub fn relationships(&self) -> &RecordStore<RelationshipFormat> {
        &self.relationships
    }

    /// Property store.
    pub fn properties(&self) -> &RecordStore<PropertyFormat> {
        &self.properties
    }

    /// Property key store.
    pub fn property_keys(&self) -> &RecordStore<PropertyKeyFormat> {
        &self.property_keys
    }

    /// Relationship type store.
    pub fn rel_types(&self) -> &RecordStore<RelationshipTypeFormat> {
        &self.rel_types
    }

    /// String store.
    pub fn strings(&self) -> &DynamicStore {
        &self.strings
    }

    /// Array store.
    pub fn arrays(&self) -> &DynamicStore {
        &self.arrays
    }

    /// Property key name store.
    pub fn property_key_names(&self) -> &DynamicStore {
        &self.property_key_names
    }

    /// Relationship type name store.
    pub fn rel_type_names(&self) -> &DynamicStore {
        &self.rel_type_names
    }

    /// True when every sub-store is ok.
    pub fn is_store_ok(&self) -> bool {
        self.order.iter().all(|s| s.is_store_ok())
    }

    /// Repairs every sub-store that needs it.
    pub fn make_store_ok(&self) -> Result<()> {
        for store in &self.order {
            store.make_store_ok()?;
        }
        Ok(())
    }

    /// Rebuilds the id generator of every sub-store.
    pub fn rebuild_id_generators(&self) -> Result<()> {
        for store in &self.order {
            store.rebuild_id_generator()?;
        }
        Ok(())
    }

    /// Enables or disables writes to not-ok stores for log replay.
    pub fn set_recovery_mode(&self, on: bool) {
        for store in &self.order {
            store.set_recovery_mode(on);
        }
    }

    /// Writes every dirty window back and syncs.
    pub fn flush_all(&self) -> Result<()> {
        for store in &self.order {
            store.flush()?;
        }
        Ok(())
    }

    /// Closes every sub-store in reverse open order. All stores are closed
    /// even if one fails; the first error is returned.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        for store in self.order.iter().rev() {
            if let Err(err) = store.close() {
                warn!(
                    store = store.type_descriptor(),
                    error = %err,
                    "graph_store.close.failed"
                );
                first_err.get_or_insert(err);
            }
        }
        debug!(dir = %self.dir.display(), "graph_store.close");
        first_err.map_or(Ok(()), Err)
    }

    /// Stats of every sub-store.
    pub fn stats(&self) -> GraphStoreStats {
        GraphStoreStats {
            dir: self.dir.clone(),
            stores: self.order.iter().map(|s| s.stats()).collect(),
        }
    }

    /// Node `id`, or [`StoreError::NotFound`].
    pub fn load_node(&self, id: NodeId) -> Result<NodeRecord> {
        self.nodes.get_record(id)
    }

    /// Relationship `id`, or [`StoreError::NotFound`].
    pub fn load_relationship(&self, id: RelId) -> Result<RelationshipRecord> {
        self.relationships.get_record(id)
    }

    /// Property `id`, or [`StoreError::NotFound`].
    pub fn load_property(&self, id: PropertyId) -> Result<PropertyRecord> {
        self.properties.get_record(id)
    }

    /// Decoded value of an in-use property record.
    pub fn property_value(&self, record: &PropertyRecord) -> Result<PropertyValue> {
        let prop_type = record
            .prop_type
            .ok_or(StoreError::Invalid("property record not in use"))?;
        match prop_type {
            t if t.is_dynamic() => {
                let store = self.dynamic_store_for(t)?;
                let bytes = store.read_bytes(BlockId(record.value))?;
                PropertyValue::from_dynamic(t, bytes)
            }
            t => PropertyValue::from_inline(t, record.value),
        }
    }

    /// Property records of a chain, starting at `first`.
    pub fn property_chain(&self, first: Option<PropertyId>) -> Result<Vec<PropertyRecord>> {
        let limit = self.properties.high_id()?;
        let mut out = Vec::new();
        let mut next = first;
        while let Some(id) = next {
            if out.len() as u64 >= limit {
                return Err(StoreError::Corruption("property chain cycle"));
            }
            let record = self.properties.get_record(id)?;
            next = record.next_prop;
            out.push(record);
        }
        Ok(out)
    }

    /// Relationships of `node`, following its chain.
    pub fn relationship_chain(&self, node: NodeId) -> Result<Vec<RelationshipRecord>> {
        let head = self.load_node(node)?.next_rel;
        let limit = self.relationships.high_id()?;
        let mut out = Vec::new();
        let mut next = head;
        while let Some(id) = next {
            if out.len() as u64 >= limit {
                return Err(StoreError::Corruption("relationship chain cycle"));
            }
            let record = self.relationships.get_record(id)?;
            next = record.next_for(node);
            out.push(record);
        }
        Ok(out)
    }

    /// Name of property key `id`.
    pub fn property_key_name(&self, id: PropertyKeyId) -> Result<String> {
        let record = self.property_keys.get_record(id)?;
        read_name(&self.property_key_names, record.key_block)
    }

    /// Name of relationship type `id`.
    pub fn rel_type_name(&self, id: RelTypeId) -> Result<String> {
        let record = self.rel_types.get_record(id)?;
        read_name(&self.rel_type_names, record.name_block)
    }

    /// Every property key with its name.
    pub fn all_property_keys(&self) -> Result<Vec<(PropertyKeyId, String)>> {
        let mut out = Vec::new();
        for raw in 0..self.property_keys.high_id()? {
            let id = PropertyKeyId(raw);
            if let Some(record) = self.property_keys.get_record_if_in_use(id)? {
                out.push((id, read_name(&self.property_key_names, record.key_block)?));
            }
        }
        Ok(out)
    }

    /// Every relationship type with its name.
    pub fn all_rel_types(&self) -> Result<Vec<(RelTypeId, String)>> {
        let mut out = Vec::new();
        for raw in 0..self.rel_types.high_id()? {
            let id = RelTypeId(raw);
            if let Some(record) = self.rel_types.get_record_if_in_use(id)? {
                out.push((id, read_name(&self.rel_type_names, record.name_block)?));
            }
        }
        Ok(out)
    }

    /// Dynamic store holding values of `prop_type`.
    pub fn dynamic_store_for(&self, prop_type: PropertyType) -> Result<&DynamicStore> {
        match prop_type {
            PropertyType::String => Ok(&self.strings),
            PropertyType::Array => Ok(&self.arrays),
            _ => Err(StoreError::Invalid("inline property type has no dynamic store")),
        }
    }

    /// Writes a node image.
    pub fn apply_node(&self, record: &NodeRecord, recovered: bool) -> Result<()> {
        if recovered {
            self.nodes.update_record_recovered(record)
        } else {
            self.nodes.update_record(record)
        }
    }

    /// Writes a relationship image.
    pub fn apply_relationship(&self, record: &RelationshipRecord, recovered: bool) -> Result<()> {
        if recovered {
            self.relationships.update_record_recovered(record)
        } else {
            self.relationships.update_record(record)
        }
    }

    /// Writes a property image and its value blocks.
    pub fn apply_property(&self, record: &PropertyRecord, recovered: bool) -> Result<()> {
        if !record.value_blocks.is_empty() {
            let prop_type = record
                .prop_type
                .ok_or(StoreError::Invalid("value blocks on untyped property"))?;
            let store = self.dynamic_store_for(prop_type)?;
            apply_blocks(store, &record.value_blocks, recovered)?;
        }
        let before = self
            .properties
            .get_record_if_in_use(record.id)?
            .map(|old| old.key);
        if recovered {
            self.properties.update_record_recovered(record)?;
        } else {
            self.properties.update_record(record)?;
        }
        let after = record.in_use.then_some(record.key);
        if before != after {
            if let Some(key) = before {
                self.count_key_use(key, false, recovered)?;
            }
            if let Some(key) = after {
                self.count_key_use(key, true, recovered)?;
            }
        }
        Ok(())
    }

    /// Moves the property count of `key` by one. Counts follow the property
    /// records actually written, so a replayed image changes nothing.
    fn count_key_use(&self, key: PropertyKeyId, added: bool, recovered: bool) -> Result<()> {
        let Some(mut record) = self.property_keys.get_record_if_in_use(key)? else {
            return Ok(());
        };
        record.prop_count = if added {
            record.prop_count.saturating_add(1)
        } else {
            record.prop_count.saturating_sub(1)
        };
        self.write_property_key(&record, recovered)
    }

    /// Writes a property key image and its name blocks. A key already in
    /// use keeps its stored property count.
    pub fn apply_property_key(&self, record: &PropertyKeyRecord, recovered: bool) -> Result<()> {
        apply_blocks(&self.property_key_names, &record.name_blocks, recovered)?;
        match self.property_keys.get_record_if_in_use(record.id)? {
            Some(stored) if record.in_use && stored.prop_count != record.prop_count => {
                let kept = PropertyKeyRecord {
                    prop_count: stored.prop_count,
                    ..record.clone()
                };
                self.write_property_key(&kept, recovered)
            }
            _ => self.write_property_key(record, recovered),
        }
    }

    fn write_property_key(&self, record: &PropertyKeyRecord, recovered: bool) -> Result<()> {
        if recovered {
            self.property_keys.update_record_recovered(record)
        } else {
            self.property_keys.update_record(record)
        }
    }

    /// Writes a relationship type image and its name blocks.
    pub fn apply_rel_type(&self, record: &RelationshipTypeRecord, recovered: bool) -> Result<()> {
        apply_blocks(&self.rel_type_names, &record.name_blocks, recovered)?;
        if recovered {
            self.rel_types.update_record_recovered(record)
        } else {
            self.rel_types.update_record(record)
        }
    }
}

fn apply_blocks(store: &DynamicStore, blocks: &[DynamicRecord], recovered: bool) -> Result<()> {
    for block in blocks {
        if recovered {
            store.update_record_recovered(block)?;
        } else {
            store.update_record(block)?;
        }
    }
    Ok(())
}

fn read_name(store: &DynamicStore, first: Option<BlockId>) -> Result<String> {
    let first = first.ok_or(StoreError::Corruption("name record without name block"))?;
    String::from_utf8(store.read_bytes(first)?)
        .map_err(|_| StoreError::Corruption("name is not utf-8"))
}
