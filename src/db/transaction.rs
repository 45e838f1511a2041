use std::sync::Arc;

use tracing::debug;

use super::Database;
use crate::store::property::PropertyValue;
use crate::store::record::{NodeRecord, RelationshipRecord};
use crate::types::{NodeId, PropertyKeyId, RelId, RelTypeId, Result};
use crate::txn::manager::Transaction;
use crate::xa::data_source::{StoreConnection, XaDataSource};
use crate::xa::error::XaResult;
use crate::xa::resource_manager::XaResource;
use crate::xa::write_transaction::{PropertyOwner, StoreTransaction};
use crate::xa::xid::{GlobalId, Xid};

/// A transaction against a [`Database`].
///
/// Changes are buffered until [`DbTransaction::commit`]; reads through the
/// transaction see them, reads through the [`Database`] do not. Dropping the
/// transaction without committing rolls it back.
///
/// Property keys and relationship types are named; a name used for the
/// first time is created inside the transaction.
pub struct DbTransaction<'db> {
    db: &'db Database,
    tx: Transaction<'db>,
    conn: StoreConnection,
}

impl<'db> DbTransaction<'db> {
    pub(super) fn begin(db: &'db Database) -> XaResult<Self> {
        let mut tx = db.tm.begin()?;
        let xid = tx.enlist(db.source.xa_resource())?;
        let mut conn = db.source.connection();
        conn.bind(xid)?;
        debug!(%xid, "db.tx.begin");
        Ok(Self { db, tx, conn })
    }

    /// Global transaction id.
    pub fn global_id(&self) -> GlobalId {
        self.tx.global_id()
    }

    /// Branch of the store.
    pub fn xid(&self) -> Option<Xid> {
        self.conn.xid()
    }

    /// Enlists another resource, making the commit two-phase.
    pub fn enlist(&mut self, resource: Arc<dyn XaResource>) -> XaResult<Xid> {
        self.tx.enlist(resource)
    }

    fn write<R>(&self, f: impl FnOnce(&mut StoreTransaction) -> Result<R>) -> XaResult<R> {
        let _guard = self.db.source.lock().read();
        self.conn.with_tx(f)
    }

    fn view<R>(&self, f: impl FnOnce(&StoreTransaction) -> Result<R>) -> XaResult<R> {
        let _guard = self.db.source.lock().read();
        self.conn.read_tx(f)
    }

    /// Creates a node.
    pub fn create_node(&mut self) -> XaResult<NodeId> {
        self.write(|tx| tx.create_node())
    }

    /// Deletes a node that has no relationships left.
    pub fn delete_node(&mut self, id: NodeId) -> XaResult<()> {
        self.write(|tx| tx.delete_node(id))
    }

    /// Creates a relationship of type `rel_type` from `first` to `second`.
    pub fn create_relationship(
        &mut self,
        first: NodeId,
        second: NodeId,
        rel_type: &str,
    ) -> XaResult<RelId> {
        self.write(|tx| {
            let rel_type = tx.create_relationship_type(rel_type)?;
            tx.create_relationship(first, second, rel_type)
        })
    }

    /// Deletes a relationship.
    pub fn delete_relationship(&mut self, id: RelId) -> XaResult<()> {
        self.write(|tx| tx.delete_relationship(id))
    }

    /// Sets `key` on `owner`, replacing any previous value.
    pub fn set_property(
        &mut self,
        owner: PropertyOwner,
        key: &str,
        value: PropertyValue,
    ) -> XaResult<()> {
        self.write(|tx| {
            let key = tx.create_property_key(key)?;
            tx.set_property(owner, key, value).map(|_| ())
        })
    }

    /// Removes `key` from `owner`; false if it was not set.
    pub fn remove_property(&mut self, owner: PropertyOwner, key: &str) -> XaResult<bool> {
        self.write(|tx| match tx.property_key_id(key)? {
            Some(key) => tx.remove_property(owner, key),
            None => Ok(false),
        })
    }

    /// Id of the relationship type `name`, created if new.
    pub fn create_relationship_type(&mut self, name: &str) -> XaResult<RelTypeId> {
        self.write(|tx| tx.create_relationship_type(name))
    }

    /// Id of the property key `name`, created if new.
    pub fn create_property_key(&mut self, name: &str) -> XaResult<PropertyKeyId> {
        self.write(|tx| tx.create_property_key(name))
    }

    /// Node `id` as this transaction sees it.
    pub fn node(&self, id: NodeId) -> XaResult<NodeRecord> {
        self.view(|tx| tx.node(id))
    }

    /// Relationship `id` as this transaction sees it.
    pub fn relationship(&self, id: RelId) -> XaResult<RelationshipRecord> {
        self.view(|tx| tx.relationship(id))
    }

    /// Relationships of `node` as this transaction sees them.
    pub fn relationships_of(&self, node: NodeId) -> XaResult<Vec<RelationshipRecord>> {
        self.view(|tx| tx.relationships_of(node))
    }

    /// Name of relationship type `id`.
    pub fn relationship_type_name(&self, id: RelTypeId) -> XaResult<String> {
        self.view(|tx| tx.relationship_type_name(id))
    }

    /// Properties of `owner` by key name, newest first.
    pub fn properties(&self, owner: PropertyOwner) -> XaResult<Vec<(String, PropertyValue)>> {
        self.view(|tx| {
            tx.properties(owner)?
                .into_iter()
                .map(|(key, value)| Ok((tx.property_key_name(key)?, value)))
                .collect()
        })
    }

    /// Value of `key` on `owner`.
    pub fn property(&self, owner: PropertyOwner, key: &str) -> XaResult<Option<PropertyValue>> {
        self.view(|tx| match tx.property_key_id(key)? {
            Some(key) => tx.property(owner, key),
            None => Ok(None),
        })
    }

    /// Commits every enlisted branch.
    pub fn commit(self) -> XaResult<()> {
        let DbTransaction { tx, .. } = self;
        tx.commit()
    }

    /// Rolls every enlisted branch back.
    pub fn rollback(self) -> XaResult<()> {
        let DbTransaction { tx, .. } = self;
        tx.rollback()
    }
}
