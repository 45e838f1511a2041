//! The graph store's transaction: changed records are kept in memory, turned
//! into commands at prepare and written through the record stores at commit.
//!
//! Every change is made on a full copy of the record, taken from the store
//! the first time the transaction touches it. Reads look at those copies
//! first, so a transaction sees its own writes.
//!
//! Taking a copy for change also takes the record's write lock in the data
//! source's [`LockTable`]. A record another open transaction holds cannot
//! be changed: the operation fails with [`StoreError::WriteConflict`] and
//! leaves the transaction as it was.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::store::dynamic::DynamicStore;
use crate::store::graph_store::GraphStore;
use crate::store::property::{PropertyType, PropertyValue};
use crate::store::record::{
    DynamicBlocks, DynamicRecord, NodeRecord, PropertyKeyRecord, PropertyRecord,
    RelationshipRecord, RelationshipTypeRecord,
};
use crate::types::{
    BlockId, NodeId, PropertyId, PropertyKeyId, RelId, RelTypeId, Result, StoreError,
};
use crate::xa::command::StoreCommand;
use crate::xa::error::XaResult;
use crate::xa::lock_table::{LockOutcome, LockTable, LockedRecord};
use crate::xa::transaction::CommandApplier;

/// Entity at the head of a property chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyOwner {
    /// A node.
    Node(NodeId),
    /// A relationship.
    Relationship(RelId),
}

#[derive(Clone, Copy, Debug)]
enum BlockStore {
    Strings,
    Arrays,
    PropertyKeyNames,
    RelTypeNames,
}

impl BlockStore {
    fn for_property(prop_type: PropertyType) -> Result<Self> {
        match prop_type {
            PropertyType::String => Ok(BlockStore::Strings),
            PropertyType::Array => Ok(BlockStore::Arrays),
            _ => Err(StoreError::Invalid("inline property type has no dynamic store")),
        }
    }

    fn of(self, store: &GraphStore) -> &DynamicStore {
        match self {
            BlockStore::Strings => store.strings(),
            BlockStore::Arrays => store.arrays(),
            BlockStore::PropertyKeyNames => store.property_key_names(),
            BlockStore::RelTypeNames => store.rel_type_names(),
        }
    }
}

/// Ids issued to this transaction; given back on rollback.
#[derive(Default)]
struct Allocated {
    nodes: Vec<NodeId>,
    relationships: Vec<RelId>,
    properties: Vec<PropertyId>,
    property_keys: Vec<PropertyKeyId>,
    rel_types: Vec<RelTypeId>,
    blocks: Vec<(BlockStore, BlockId)>,
}

/// Write locks held by one transaction, released when it finishes or is
/// dropped.
struct HeldLocks {
    table: Arc<LockTable>,
    owner: u32,
    held: Vec<LockedRecord>,
}

impl HeldLocks {
    /// True if the lock was taken now rather than already held.
    fn take(&mut self, record: LockedRecord) -> Result<bool> {
        match self.table.try_lock(record, self.owner)? {
            LockOutcome::Acquired => {
                self.held.push(record);
                Ok(true)
            }
            LockOutcome::AlreadyHeld => Ok(false),
        }
    }

    fn give_back(&mut self, record: LockedRecord) {
        self.table.unlock(record, self.owner);
        self.held.retain(|r| *r != record);
    }

    fn release_all(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let released = self.table.release(self.owner, self.held.drain(..));
        trace!(identifier = self.owner, released, "xa.tx.locks_released");
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Write transaction over a [`GraphStore`].
///
/// Ids are issued as records are created; nothing reaches the store files
/// before [`CommandApplier::do_commit`]. Nodes, relationships and properties
/// are write-locked from their first load for change until commit or
/// rollback, so two open transactions never change the same record.
pub struct StoreTransaction {
    identifier: u32,
    store: Arc<GraphStore>,
    recovered: bool,
    locks: HeldLocks,
    nodes: BTreeMap<NodeId, NodeRecord>,
    relationships: BTreeMap<RelId, RelationshipRecord>,
    properties: BTreeMap<PropertyId, PropertyRecord>,
    property_keys: BTreeMap<PropertyKeyId, PropertyKeyRecord>,
    rel_types: BTreeMap<RelTypeId, RelationshipTypeRecord>,
    allocated: Allocated,
    commands: Vec<StoreCommand>,
}

/// The transaction's copy of `id`, loaded under its write lock on first
/// touch.
fn for_update<'a, K: Ord + Copy, R>(
    map: &'a mut BTreeMap<K, R>,
    locks: &mut HeldLocks,
    lock: LockedRecord,
    id: K,
    in_use: impl Fn(&R) -> bool,
    load: impl FnOnce() -> Result<R>,
) -> Result<&'a mut R> {
    match map.entry(id) {
        Entry::Occupied(entry) => {
            let record = entry.into_mut();
            if in_use(record) {
                Ok(record)
            } else {
                Err(StoreError::NotFound)
            }
        }
        Entry::Vacant(entry) => {
            let fresh = locks.take(lock)?;
            match load() {
                Ok(record) => Ok(entry.insert(record)),
                Err(err) => {
                    if fresh {
                        locks.give_back(lock);
                    }
                    Err(err)
                }
            }
        }
    }
}

fn view<K: Ord, R: Clone>(
    map: &BTreeMap<K, R>,
    id: &K,
    in_use: impl Fn(&R) -> bool,
    load: impl FnOnce() -> Result<R>,
) -> Result<R> {
    match map.get(id) {
        Some(record) if in_use(record) => Ok(record.clone()),
        Some(_) => Err(StoreError::NotFound),
        None => load(),
    }
}

fn joined(blocks: &[DynamicRecord]) -> Vec<u8> {
    blocks.iter().flat_map(|b| b.data.iter().copied()).collect()
}

fn name_from(blocks: &[DynamicRecord]) -> Result<String> {
    String::from_utf8(joined(blocks)).map_err(|_| StoreError::Corruption("name is not utf-8"))
}

impl StoreTransaction {
    /// Empty transaction logged under `identifier`, taking its write locks
    /// in `locks`.
    pub fn new(identifier: u32, store: Arc<GraphStore>, locks: Arc<LockTable>) -> Self {
        Self {
            identifier,
            store,
            recovered: false,
            locks: HeldLocks {
                table: locks,
                owner: identifier,
                held: Vec::new(),
            },
            nodes: BTreeMap::new(),
            relationships: BTreeMap::new(),
            properties: BTreeMap::new(),
            property_keys: BTreeMap::new(),
            rel_types: BTreeMap::new(),
            allocated: Allocated::default(),
            commands: Vec::new(),
        }
    }

    /// Log identifier.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Store this transaction writes to.
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Number of records this transaction holds write locks on.
    pub fn locked_records(&self) -> usize {
        self.locks.held.len()
    }

    fn node_for_update(&mut self, id: NodeId) -> Result<&mut NodeRecord> {
        let store = &self.store;
        for_update(
            &mut self.nodes,
            &mut self.locks,
            LockedRecord::Node(id),
            id,
            |r| r.in_use,
            || store.load_node(id),
        )
    }

    fn rel_for_update(&mut self, id: RelId) -> Result<&mut RelationshipRecord> {
        let store = &self.store;
        for_update(
            &mut self.relationships,
            &mut self.locks,
            LockedRecord::Relationship(id),
            id,
            |r| r.in_use,
            || store.load_relationship(id),
        )
    }

    fn prop_for_update(&mut self, id: PropertyId) -> Result<&mut PropertyRecord> {
        let store = &self.store;
        for_update(
            &mut self.properties,
            &mut self.locks,
            LockedRecord::Property(id),
            id,
            |r| r.in_use,
            || store.load_property(id),
        )
    }

    fn lock_owner(&mut self, owner: PropertyOwner) -> Result<()> {
        match owner {
            PropertyOwner::Node(id) => self.node_for_update(id).map(|_| ()),
            PropertyOwner::Relationship(id) => self.rel_for_update(id).map(|_| ()),
        }
    }

    fn node_view(&self, id: NodeId) -> Result<NodeRecord> {
        view(&self.nodes, &id, |r| r.in_use, || self.store.load_node(id))
    }

    fn rel_view(&self, id: RelId) -> Result<RelationshipRecord> {
        view(&self.relationships, &id, |r| r.in_use, || {
            self.store.load_relationship(id)
        })
    }

    fn prop_view(&self, id: PropertyId) -> Result<PropertyRecord> {
        view(&self.properties, &id, |r| r.in_use, || self.store.load_property(id))
    }

    fn key_view(&self, id: PropertyKeyId) -> Result<PropertyKeyRecord> {
        view(&self.property_keys, &id, |r| r.in_use, || {
            self.store.property_keys().get_record(id)
        })
    }

    fn rel_type_view(&self, id: RelTypeId) -> Result<RelationshipTypeRecord> {
        view(&self.rel_types, &id, |r| r.in_use, || {
            self.store.rel_types().get_record(id)
        })
    }

    /// Creates a node with empty chains.
    pub fn create_node(&mut self) -> Result<NodeId> {
        let id = self.store.nodes().next_id()?;
        self.allocated.nodes.push(id);
        self.nodes.insert(id, NodeRecord::new(id));
        trace!(identifier = self.identifier, node = %id, "xa.tx.create_node");
        Ok(id)
    }

    /// Deletes a node and its properties. The node must have no
    /// relationships left.
    pub fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_for_update(id)?.clone();
        if node.next_rel.is_some() {
            return Err(StoreError::Invalid("node still has relationships"));
        }
        self.delete_property_chain(node.next_prop)?;
        *self.node_for_update(id)? = NodeRecord {
            in_use: false,
            ..NodeRecord::new(id)
        };
        trace!(identifier = self.identifier, node = %id, "xa.tx.delete_node");
        Ok(())
    }

    /// Creates a relationship from `first` to `second` and puts it at the
    /// head of both nodes' chains (once for a loop).
    pub fn create_relationship(
        &mut self,
        first: NodeId,
        second: NodeId,
        rel_type: RelTypeId,
    ) -> Result<RelId> {
        self.rel_type_view(rel_type)?;
        for node in [first, second] {
            if let Some(head) = self.node_for_update(node)?.next_rel {
                self.rel_for_update(head)?;
            }
        }
        let id = self.store.relationships().next_id()?;
        self.allocated.relationships.push(id);
        self.relationships
            .insert(id, RelationshipRecord::new(id, first, second, rel_type));
        self.link_into_chain(id, first)?;
        if second != first {
            self.link_into_chain(id, second)?;
        }
        trace!(
            identifier = self.identifier,
            rel = %id,
            first = %first,
            second = %second,
            "xa.tx.create_relationship"
        );
        Ok(id)
    }

    fn link_into_chain(&mut self, id: RelId, node: NodeId) -> Result<()> {
        let head = self.node_for_update(node)?.next_rel;
        if let Some(head) = head {
            self.rel_for_update(head)?.set_prev_for(node, Some(id));
        }
        let rel = self.rel_for_update(id)?;
        rel.set_prev_for(node, None);
        rel.set_next_for(node, head);
        self.node_for_update(node)?.next_rel = Some(id);
        Ok(())
    }

    /// Unlinks a relationship from both chains and deletes it with its
    /// properties.
    pub fn delete_relationship(&mut self, id: RelId) -> Result<()> {
        let rel = self.rel_for_update(id)?.clone();
        for node in [rel.first_node, rel.second_node] {
            self.lock_chain_neighbours(&rel, node)?;
        }
        self.unlink_from_chain(&rel, rel.first_node)?;
        if rel.second_node != rel.first_node {
            self.unlink_from_chain(&rel, rel.second_node)?;
        }
        self.delete_property_chain(rel.next_prop)?;
        let mut gone = RelationshipRecord::new(id, rel.first_node, rel.second_node, rel.rel_type);
        gone.in_use = false;
        *self.rel_for_update(id)? = gone;
        trace!(identifier = self.identifier, rel = %id, "xa.tx.delete_relationship");
        Ok(())
    }

    fn lock_chain_neighbours(&mut self, rel: &RelationshipRecord, node: NodeId) -> Result<()> {
        match rel.prev_for(node) {
            Some(prev) => self.rel_for_update(prev).map(|_| ())?,
            None => self.node_for_update(node).map(|_| ())?,
        }
        if let Some(next) = rel.next_for(node) {
            self.rel_for_update(next)?;
        }
        Ok(())
    }

    fn unlink_from_chain(&mut self, rel: &RelationshipRecord, node: NodeId) -> Result<()> {
        let prev = rel.prev_for(node);
        let next = rel.next_for(node);
        match prev {
            Some(prev) => self.rel_for_update(prev)?.set_next_for(node, next),
            None => self.node_for_update(node)?.next_rel = next,
        }
        if let Some(next) = next {
            self.rel_for_update(next)?.set_prev_for(node, prev);
        }
        Ok(())
    }

    fn owner_head(&self, owner: PropertyOwner) -> Result<Option<PropertyId>> {
        match owner {
            PropertyOwner::Node(id) => Ok(self.node_view(id)?.next_prop),
            PropertyOwner::Relationship(id) => Ok(self.rel_view(id)?.next_prop),
        }
    }

    fn set_owner_head(&mut self, owner: PropertyOwner, head: Option<PropertyId>) -> Result<()> {
        match owner {
            PropertyOwner::Node(id) => self.node_for_update(id)?.next_prop = head,
            PropertyOwner::Relationship(id) => self.rel_for_update(id)?.next_prop = head,
        }
        Ok(())
    }

    fn property_chain_from(&self, head: Option<PropertyId>) -> Result<Vec<PropertyRecord>> {
        let limit = self.store.properties().high_id()?;
        let mut out = Vec::new();
        let mut next = head;
        while let Some(id) = next {
            if out.len() as u64 >= limit {
                return Err(StoreError::Corruption("property chain cycle"));
            }
            let record = self.prop_view(id)?;
            next = record.next_prop;
            out.push(record);
        }
        Ok(out)
    }

    /// Sets `key` on `owner`, replacing any previous value. The new record
    /// goes to the head of the owner's chain.
    pub fn set_property(
        &mut self,
        owner: PropertyOwner,
        key: PropertyKeyId,
        value: PropertyValue,
    ) -> Result<PropertyId> {
        self.key_view(key)?;
        self.remove_property(owner, key)?;

        let id = self.store.properties().next_id()?;
        self.allocated.properties.push(id);
        let prop_type = value.property_type();
        let (bits, value_blocks) = match value.dynamic_bytes() {
            Some(bytes) => {
                let target = BlockStore::for_property(prop_type)?;
                let blocks = target.of(&self.store).allocate_records(&bytes)?;
                self.allocated
                    .blocks
                    .extend(blocks.iter().map(|b| (target, b.id)));
                let first = blocks
                    .first()
                    .map(|b| b.id.0)
                    .ok_or(StoreError::Invalid("empty block chain"))?;
                (first, blocks)
            }
            None => (
                value
                    .inline_bits()
                    .ok_or(StoreError::Invalid("value has no inline encoding"))?,
                DynamicBlocks::new(),
            ),
        };

        let head = self.owner_head(owner)?;
        if let Some(head) = head {
            self.prop_for_update(head)?.prev_prop = Some(id);
        }
        self.properties.insert(
            id,
            PropertyRecord {
                id,
                in_use: true,
                prop_type: Some(prop_type),
                key,
                value: bits,
                prev_prop: None,
                next_prop: head,
                value_blocks,
            },
        );
        self.set_owner_head(owner, Some(id))?;
        Ok(id)
    }

    /// Removes `key` from `owner`. Returns false if it was not set.
    pub fn remove_property(&mut self, owner: PropertyOwner, key: PropertyKeyId) -> Result<bool> {
        self.lock_owner(owner)?;
        let head = self.owner_head(owner)?;
        let Some(record) = self
            .property_chain_from(head)?
            .into_iter()
            .find(|r| r.key == key)
        else {
            return Ok(false);
        };
        match record.prev_prop {
            Some(prev) => self.prop_for_update(prev)?.next_prop = record.next_prop,
            None => self.set_owner_head(owner, record.next_prop)?,
        }
        if let Some(next) = record.next_prop {
            self.prop_for_update(next)?.prev_prop = record.prev_prop;
        }
        self.mark_property_deleted(record.id)?;
        Ok(true)
    }

    fn delete_property_chain(&mut self, head: Option<PropertyId>) -> Result<()> {
        for record in self.property_chain_from(head)? {
            self.mark_property_deleted(record.id)?;
        }
        Ok(())
    }

    /// Replaces the record with an unused image carrying unused images of
    /// its value blocks.
    fn mark_property_deleted(&mut self, id: PropertyId) -> Result<()> {
        let record = self.prop_for_update(id)?.clone();
        let value_blocks: DynamicBlocks = if !record.value_blocks.is_empty() {
            record
                .value_blocks
                .iter()
                .map(|b| DynamicRecord::unused(b.id))
                .collect()
        } else {
            match record.prop_type.filter(|t| t.is_dynamic()) {
                Some(t) => self
                    .store
                    .dynamic_store_for(t)?
                    .delete_chain(BlockId(record.value))?,
                None => DynamicBlocks::new(),
            }
        };
        *self.prop_for_update(id)? = PropertyRecord {
            prop_type: record.prop_type,
            key: record.key,
            value_blocks,
            ..PropertyRecord::unused(id)
        };
        Ok(())
    }

    /// Id of the property key called `name`, creating it if needed.
    pub fn create_property_key(&mut self, name: &str) -> Result<PropertyKeyId> {
        if let Some(id) = self.property_key_id(name)? {
            return Ok(id);
        }
        let id = self.store.property_keys().next_id()?;
        self.allocated.property_keys.push(id);
        let blocks = self
            .store
            .property_key_names()
            .allocate_records(name.as_bytes())?;
        self.allocated
            .blocks
            .extend(blocks.iter().map(|b| (BlockStore::PropertyKeyNames, b.id)));
        self.property_keys.insert(
            id,
            PropertyKeyRecord {
                id,
                in_use: true,
                prop_count: 0,
                key_block: blocks.first().map(|b| b.id),
                name_blocks: blocks,
            },
        );
        debug!(identifier = self.identifier, key = %id, name, "xa.tx.create_property_key");
        Ok(id)
    }

    /// Id of the relationship type called `name`, creating it if needed.
    pub fn create_relationship_type(&mut self, name: &str) -> Result<RelTypeId> {
        if let Some(id) = self.relationship_type_id(name)? {
            return Ok(id);
        }
        let id = self.store.rel_types().next_id()?;
        self.allocated.rel_types.push(id);
        let blocks = self
            .store
            .rel_type_names()
            .allocate_records(name.as_bytes())?;
        self.allocated
            .blocks
            .extend(blocks.iter().map(|b| (BlockStore::RelTypeNames, b.id)));
        self.rel_types.insert(
            id,
            RelationshipTypeRecord {
                id,
                in_use: true,
                name_block: blocks.first().map(|b| b.id),
                name_blocks: blocks,
            },
        );
        debug!(identifier = self.identifier, rel_type = %id, name, "xa.tx.create_rel_type");
        Ok(id)
    }

    /// Id of the property key called `name`, if any.
    pub fn property_key_id(&self, name: &str) -> Result<Option<PropertyKeyId>> {
        for (id, record) in &self.property_keys {
            if record.in_use
                && !record.name_blocks.is_empty()
                && joined(&record.name_blocks) == name.as_bytes()
            {
                return Ok(Some(*id));
            }
        }
        Ok(self
            .store
            .all_property_keys()?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id))
    }

    /// Id of the relationship type called `name`, if any.
    pub fn relationship_type_id(&self, name: &str) -> Result<Option<RelTypeId>> {
        for (id, record) in &self.rel_types {
            if record.in_use
                && !record.name_blocks.is_empty()
                && joined(&record.name_blocks) == name.as_bytes()
            {
                return Ok(Some(*id));
            }
        }
        Ok(self
            .store
            .all_rel_types()?
            .into_iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id))
    }

    /// Name of property key `id`.
    pub fn property_key_name(&self, id: PropertyKeyId) -> Result<String> {
        match self.property_keys.get(&id) {
            Some(record) if !record.name_blocks.is_empty() => name_from(&record.name_blocks),
            _ => self.store.property_key_name(id),
        }
    }

    /// Name of relationship type `id`.
    pub fn relationship_type_name(&self, id: RelTypeId) -> Result<String> {
        match self.rel_types.get(&id) {
            Some(record) if !record.name_blocks.is_empty() => name_from(&record.name_blocks),
            _ => self.store.rel_type_name(id),
        }
    }

    /// Node `id` as this transaction sees it.
    pub fn node(&self, id: NodeId) -> Result<NodeRecord> {
        self.node_view(id)
    }

    /// Relationship `id` as this transaction sees it.
    pub fn relationship(&self, id: RelId) -> Result<RelationshipRecord> {
        self.rel_view(id)
    }

    /// Relationships of `node`, head of the chain first.
    pub fn relationships_of(&self, node: NodeId) -> Result<Vec<RelationshipRecord>> {
        let limit = self.store.relationships().high_id()?;
        let mut out = Vec::new();
        let mut next = self.node_view(node)?.next_rel;
        while let Some(id) = next {
            if out.len() as u64 >= limit {
                return Err(StoreError::Corruption("relationship chain cycle"));
            }
            let record = self.rel_view(id)?;
            next = record.next_for(node);
            out.push(record);
        }
        Ok(out)
    }

    /// Every property of `owner`, newest first.
    pub fn properties(&self, owner: PropertyOwner) -> Result<Vec<(PropertyKeyId, PropertyValue)>> {
        let head = self.owner_head(owner)?;
        self.property_chain_from(head)?
            .iter()
            .map(|record| Ok((record.key, self.value_of(record)?)))
            .collect()
    }

    /// Value of `key` on `owner`.
    pub fn property(&self, owner: PropertyOwner, key: PropertyKeyId) -> Result<Option<PropertyValue>> {
        let head = self.owner_head(owner)?;
        match self
            .property_chain_from(head)?
            .into_iter()
            .find(|r| r.key == key)
        {
            Some(record) => self.value_of(&record).map(Some),
            None => Ok(None),
        }
    }

    fn value_of(&self, record: &PropertyRecord) -> Result<PropertyValue> {
        let prop_type = record
            .prop_type
            .ok_or(StoreError::Invalid("property record not in use"))?;
        if prop_type.is_dynamic() && !record.value_blocks.is_empty() {
            PropertyValue::from_dynamic(prop_type, joined(&record.value_blocks))
        } else {
            self.store.property_value(record)
        }
    }

    fn free_allocated(&mut self) -> Result<()> {
        let allocated = std::mem::take(&mut self.allocated);
        for id in allocated.nodes {
            self.store.nodes().free_id(id)?;
        }
        for id in allocated.relationships {
            self.store.relationships().free_id(id)?;
        }
        for id in allocated.properties {
            self.store.properties().free_id(id)?;
        }
        for id in allocated.property_keys {
            self.store.property_keys().free_id(id)?;
        }
        for id in allocated.rel_types {
            self.store.rel_types().free_id(id)?;
        }
        for (target, id) in allocated.blocks {
            target.of(&self.store).free_block(id)?;
        }
        Ok(())
    }
}

impl CommandApplier for StoreTransaction {
    type Command = StoreCommand;

    fn is_read_only(&self) -> bool {
        self.commands.is_empty()
            && self.nodes.is_empty()
            && self.relationships.is_empty()
            && self.properties.is_empty()
            && self.property_keys.is_empty()
            && self.rel_types.is_empty()
    }

    /// Turns the changed records into commands. Commands are grouped by
    /// record kind rather than kept in the order the changes were made:
    /// relationship types and property keys come first so their names exist
    /// before anything refers to them, then nodes, relationships and
    /// properties, each kind in id order. Every command is a full record
    /// image, so the grouping does not change the committed state.
    fn do_prepare(&mut self) -> XaResult<()> {
        if self.recovered {
            return Ok(());
        }
        self.commands.clear();
        self.commands.extend(
            self.rel_types
                .values()
                .cloned()
                .map(StoreCommand::RelationshipType),
        );
        self.commands.extend(
            self.property_keys
                .values()
                .cloned()
                .map(StoreCommand::PropertyKey),
        );
        self.commands
            .extend(self.nodes.values().cloned().map(StoreCommand::Node));
        self.commands.extend(
            self.relationships
                .values()
                .cloned()
                .map(StoreCommand::Relationship),
        );
        self.commands
            .extend(self.properties.values().cloned().map(StoreCommand::Property));
        debug!(
            identifier = self.identifier,
            commands = self.commands.len(),
            "xa.tx.prepare"
        );
        Ok(())
    }

    fn commands(&self) -> &[StoreCommand] {
        &self.commands
    }

    fn inject_command(&mut self, command: StoreCommand) {
        self.commands.push(command);
    }

    fn do_commit(&mut self, tx_id: u64) -> XaResult<()> {
        let store = &self.store;
        for command in &self.commands {
            match command {
                StoreCommand::RelationshipType(r) => store.apply_rel_type(r, self.recovered)?,
                StoreCommand::PropertyKey(r) => store.apply_property_key(r, self.recovered)?,
                StoreCommand::Node(r) => store.apply_node(r, self.recovered)?,
                StoreCommand::Relationship(r) => store.apply_relationship(r, self.recovered)?,
                StoreCommand::Property(r) => store.apply_property(r, self.recovered)?,
            }
        }
        store.meta().set_last_committed_tx(tx_id)?;
        self.locks.release_all();
        debug!(
            identifier = self.identifier,
            tx_id,
            recovered = self.recovered,
            commands = self.commands.len(),
            "xa.tx.commit"
        );
        Ok(())
    }

    fn do_rollback(&mut self) -> XaResult<()> {
        if !self.recovered {
            self.free_allocated()?;
        }
        self.nodes.clear();
        self.relationships.clear();
        self.properties.clear();
        self.property_keys.clear();
        self.rel_types.clear();
        self.commands.clear();
        self.locks.release_all();
        debug!(identifier = self.identifier, "xa.tx.rollback");
        Ok(())
    }

    fn set_recovered(&mut self) {
        self.recovered = true;
    }

    fn is_recovered(&self) -> bool {
        self.recovered
    }
}
