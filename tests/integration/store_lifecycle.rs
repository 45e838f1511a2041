#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Once;

use recstore::store::graph_store::files;
use recstore::store::{PropertyArray, PropertyValue, StoreFactory};
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

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).expect("store file").len()
}

fn ends_with(path: &Path, suffix: &str) -> bool {
    fs::read(path)
        .map(|bytes| bytes.ends_with(suffix.as_bytes()))
        .unwrap_or(false)
}

#[test]
fn clean_close_leaves_descriptors_and_reopens_ok() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let node = {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        assert!(db.store().is_store_ok());
        let mut tx = db.begin()?;
        let node = tx.create_node()?;
        tx.set_property(
            PropertyOwner::Node(node),
            "scores",
            PropertyValue::Array(PropertyArray::Int(vec![3, 1, 4, 1, 5])),
        )?;
        tx.commit()?;
        db.close()?;
        node
    };
    assert!(ends_with(&dir.path().join(files::NODES), "NodeStore v0.1"));
    assert!(ends_with(&dir.path().join(files::PROPERTIES), "PropertyStore v0.1"));
    assert!(ends_with(
        &dir.path().join(files::ARRAYS),
        "ArrayPropertyStore v0.1"
    ));

    let db = Database::open(dir.path(), StoreConfig::default())?;
    let stats = db.stats()?;
    assert_eq!(stats.recovery.replayed, 0);
    assert!(stats.store.stores.iter().all(|s| s.store_ok));
    assert_eq!(
        db.property(PropertyOwner::Node(node), "scores")?,
        Some(PropertyValue::Array(PropertyArray::Int(vec![3, 1, 4, 1, 5])))
    );
    let json = serde_json::to_value(&stats).expect("stats serialize");
    assert_eq!(json["last_committed_tx"], 1);
    db.close()
}

#[test]
fn older_descriptor_needs_upgrade() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let factory = StoreFactory::new(StoreConfig::default());
    factory.create(dir.path())?.close()?;

    let nodes = dir.path().join(files::NODES);
    let len = fs::metadata(&nodes).expect("node store").len();
    let mut file = OpenOptions::new()
        .write(true)
        .open(&nodes)
        .expect("open node store");
    file.seek(SeekFrom::Start(len - 4)).expect("seek");
    file.write_all(b"v0.0").expect("rewrite version");
    drop(file);

    match factory.open(dir.path()) {
        Err(StoreError::NeedsUpgrade { found, expected, .. }) => {
            assert_eq!(found, "NodeStore v0.0");
            assert_eq!(expected, "NodeStore v0.1");
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("older store opened without upgrade"),
    }
    assert!(matches!(
        Database::open(dir.path(), StoreConfig::default()),
        Err(XaError::Store(StoreError::NeedsUpgrade { .. }))
    ));
    Ok(())
}

#[test]
fn second_open_is_refused_while_the_first_is_live() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let db = Database::open(dir.path(), StoreConfig::default())?;
    assert!(matches!(
        Database::open(dir.path(), StoreConfig::default()),
        Err(XaError::Store(StoreError::StoreLocked(_)))
    ));

    let mut tx = db.begin()?;
    tx.create_node()?;
    tx.commit()?;
    db.close()?;

    let db = Database::open(dir.path(), StoreConfig::default())?;
    assert!(db.node(NodeId(0))?.in_use);
    db.close()
}

#[test]
fn read_only_store_reads_but_never_writes() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    {
        let db = Database::open(dir.path(), StoreConfig::default())?;
        let mut tx = db.begin()?;
        let a = tx.create_node()?;
        let b = tx.create_node()?;
        tx.create_relationship(a, b, "FOLLOWS")?;
        tx.commit()?;
        db.close()?;
    }
    let nodes_len = file_len(&dir.path().join(files::NODES));

    let store = StoreFactory::new(StoreConfig::default().read_only(true)).open(dir.path())?;
    assert_eq!(store.relationship_chain(NodeId(1))?.len(), 1);
    assert_eq!(store.all_rel_types()?[0].1, "FOLLOWS");
    assert!(matches!(
        store.nodes().update_record(&store.load_node(NodeId(0))?),
        Err(StoreError::ReadOnly(_))
    ));
    store.close()?;
    assert_eq!(file_len(&dir.path().join(files::NODES)), nodes_len);
    Ok(())
}

#[test]
fn rotated_segments_are_archived_when_kept() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let config = StoreConfig::default().keep_logical_logs(true);
    let db = Database::open(dir.path(), config.clone())?;
    for _ in 0..3 {
        let mut tx = db.begin()?;
        tx.create_node()?;
        tx.commit()?;
    }
    db.rotate_logical_log()?;
    let log = db.data_source().resource_manager().logical_log();
    assert_eq!(log.history_versions()?.len(), 1);
    let archived = log.history_path(log.history_versions()?[0]);
    assert!(archived.exists());
    db.close()?;

    let db = Database::open(dir.path(), config)?;
    assert_eq!(db.last_committed_tx()?, 3);
    assert_eq!(db.stats()?.recovery.replayed, 0);
    for raw in 0..3 {
        assert!(db.node(NodeId(raw))?.in_use);
    }
    db.close()
}

#[test]
fn small_rotation_threshold_rotates_on_commit() -> XaResult<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let config = StoreConfig::default()
        .keep_logical_logs(true)
        .logical_log_rotation_threshold(256);
    let db = Database::open(dir.path(), config)?;
    for i in 0..8 {
        let mut tx = db.begin()?;
        let node = tx.create_node()?;
        tx.set_property(PropertyOwner::Node(node), "i", PropertyValue::Int(i))?;
        tx.commit()?;
    }
    let log = db.data_source().resource_manager().logical_log();
    assert!(!log.history_versions()?.is_empty());
    assert_eq!(db.last_committed_tx()?, 8);
    db.close()
}
