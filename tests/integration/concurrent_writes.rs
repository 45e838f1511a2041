#![allow(missing_docs)]

use std::sync::Once;

use recstore::store::PropertyValue;
use recstore::types::{NodeId, StoreError};
use recstore::xa::PropertyOwner;
use recstore::{Database, StoreConfig, XaError, XaResult};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn is_conflict<T>(result: XaResult<T>) -> bool {
    matches!(result, Err(XaError::Store(StoreError::WriteConflict { .. })))
}

fn seed(db: &Database) -> XaResult<(NodeId, NodeId)> {
    let mut tx = db.begin()?;
    let a = tx.create_node()?;
    let b = tx.create_node()?;
    tx.set_property(PropertyOwner::Node(a), "age", PropertyValue::Int(1))?;
    tx.commit()?;
    Ok((a, b))
}

#[test]
fn racing_deletes_leave_one_winner_and_a_working_database() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path(), StoreConfig::default())?;
    let (a, b) = seed(&db)?;

    let mut first = db.begin()?;
    let mut second = db.begin()?;
    first.delete_node(a)?;
    assert!(is_conflict(second.delete_node(a)));
    second.rollback()?;
    first.commit()?;

    let mut tx = db.begin()?;
    assert_eq!(tx.create_node()?, a);
    tx.commit()?;
    let mut tx = db.begin()?;
    let c = tx.create_node()?;
    assert!(c != a && c != b);
    tx.commit()?;

    assert!(!db.data_source().resource_manager().has_failed());
    assert_eq!(db.last_committed_tx()?, 4);
    db.close()
}

#[test]
fn refused_writer_rolls_back_and_the_survivor_persists() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let a = {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let (a, _) = seed(&db)?;

        let mut update = db.begin()?;
        update.set_property(PropertyOwner::Node(a), "age", PropertyValue::Int(2))?;
        let mut delete = db.begin()?;
        assert!(is_conflict(delete.delete_node(a)));
        drop(delete);
        update.commit()?;
        db.close()?;
        a
    };

    let db = Database::open(dir.path(), StoreConfig::default())?;
    assert_eq!(db.stats()?.recovery.replayed, 0);
    assert!(db.node(a)?.in_use);
    assert_eq!(
        db.property(PropertyOwner::Node(a), "age")?,
        Some(PropertyValue::Int(2))
    );
    let mut tx = db.begin()?;
    assert_eq!(tx.create_node()?, NodeId(2));
    tx.commit()?;
    db.close()
}

#[test]
fn conflicts_on_relationships_surface_before_commit() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path(), StoreConfig::default())?;
    let (a, b) = seed(&db)?;
    let rel = {
        let mut tx = db.begin()?;
        let rel = tx.create_relationship(a, b, "KNOWS")?;
        tx.commit()?;
        rel
    };

    let mut unlink = db.begin()?;
    unlink.delete_relationship(rel)?;
    let mut link = db.begin()?;
    assert!(is_conflict(link.create_relationship(b, a, "KNOWS")));
    link.rollback()?;
    unlink.commit()?;

    let mut link = db.begin()?;
    let again = link.create_relationship(b, a, "KNOWS")?;
    link.commit()?;
    assert_eq!(db.relationships_of(a)?.len(), 1);
    assert_eq!(db.relationships_of(a)?[0].id, again);
    assert!(!db.data_source().resource_manager().has_failed());
    db.close()
}
