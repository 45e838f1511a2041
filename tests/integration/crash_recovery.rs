#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::sync::Once;

use recstore::store::PropertyValue;
use recstore::types::NodeId;
use recstore::xa::{GlobalId, PropertyOwner, Vote, XaDataSource, XaResource, Xid, STORE_BRANCH};
use recstore::{Database, StoreConfig, XaResult};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

/// Longer than one string block.
const LONG_NAME: &str = "a name long enough to spill into a second block of the string store, \
                         which keeps one hundred and twenty data bytes in each block it hands out";

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn committed_work_survives_a_crash() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let (a, b) = {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let mut tx = db.begin()?;
        let a = tx.create_node()?;
        let b = tx.create_node()?;
        tx.create_relationship(a, b, "KNOWS")?;
        tx.set_property(PropertyOwner::Node(a), "name", LONG_NAME.into())?;
        tx.commit()?;
        (a, b)
        // Dropped without close.
    };

    let db = Database::open(dir.path(), StoreConfig::default())?;
    let stats = db.stats()?;
    assert_eq!(stats.recovery.replayed, 1);
    assert_eq!(stats.last_committed_tx, 1);
    assert!(db.store().is_store_ok());
    assert_eq!(db.relationships_of(a)?.len(), 1);
    assert_eq!(db.relationships_of(b)?[0].first_node, a);
    match db.property(PropertyOwner::Node(a), "name")? {
        Some(PropertyValue::String(name)) => assert_eq!(name, LONG_NAME),
        other => panic!("unexpected value {other:?}"),
    }

    // New ids continue after the recovered ones.
    let mut tx = db.begin()?;
    assert_eq!(tx.create_node()?, NodeId(2));
    tx.commit()?;
    db.close()
}

#[test]
fn torn_log_tail_loses_only_the_unfinished_commit() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let (segment, keep) = {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let log = db.data_source().resource_manager().logical_log();

        let mut tx = db.begin()?;
        let first = tx.create_node()?;
        tx.commit()?;
        assert_eq!(first, NodeId(0));
        let after_first = log.size()?;

        let mut tx = db.begin()?;
        tx.create_node()?;
        tx.create_node()?;
        tx.commit()?;
        assert!(log.size()? > after_first + 12);
        (log.active_path(), after_first + 12)
    };
    let file = OpenOptions::new()
        .write(true)
        .open(&segment)
        .expect("open log segment");
    file.set_len(keep).expect("truncate log segment");
    drop(file);

    let db = Database::open(dir.path(), StoreConfig::default())?;
    assert_eq!(db.last_committed_tx()?, 1);
    assert!(db.node(NodeId(0))?.in_use);
    assert!(db.node(NodeId(1)).is_err());
    assert!(db.node(NodeId(2)).is_err());
    db.close()
}

#[test]
fn replay_is_idempotent_across_repeated_crashes() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let node = {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let mut tx = db.begin()?;
        let node = tx.create_node()?;
        tx.set_property(PropertyOwner::Node(node), "count", PropertyValue::Long(7))?;
        tx.commit()?;
        node
    };
    for _ in 0..2 {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        assert_eq!(
            db.property(PropertyOwner::Node(node), "count")?,
            Some(PropertyValue::Long(7))
        );
        assert_eq!(db.properties(PropertyOwner::Node(node))?.len(), 1);
        assert_eq!(db.last_committed_tx()?, 1);
        // Dropped without close again.
    }
    let db = Database::open(dir.path(), StoreConfig::default())?;
    assert_eq!(db.property_keys()?.len(), 1);
    db.close()
}

#[test]
fn prepared_branch_without_a_decision_is_rolled_back() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let mut tx = db.begin()?;
        tx.create_node()?;
        tx.commit()?;

        let resource = db.data_source().xa_resource();
        let xid = Xid::new(GlobalId(0xdead), STORE_BRANCH);
        resource.start(xid)?;
        let mut conn = db.data_source().connection();
        conn.bind(xid)?;
        conn.with_tx(|tx| {
            let node = tx.create_node()?;
            let key = tx.create_property_key("draft")?;
            tx.set_property(PropertyOwner::Node(node), key, true.into())
        })?;
        assert_eq!(resource.prepare(xid)?, Vote::Commit);
        // Dropped without a commit decision or close.
    }

    let db = Database::open(dir.path(), StoreConfig::default())?;
    let stats = db.stats()?;
    assert_eq!(stats.recovery.replayed, 1);
    assert_eq!(stats.recovery.dangling, 1);
    assert_eq!(stats.tm_recovery.rolled_back, 1);
    assert_eq!(stats.tm_recovery.committed, 0);
    assert!(db.node(NodeId(1)).is_err());
    assert!(db.property_keys()?.is_empty());
    assert_eq!(db.data_source().resource_manager().active_transactions(), 0);

    let mut tx = db.begin()?;
    tx.create_node()?;
    tx.commit()?;
    assert_eq!(db.last_committed_tx()?, 2);
    db.close()
}
