#![allow(missing_docs)]

use std::path::Path;
use std::sync::{Arc, Once};

use recstore::store::Synchronous;
use recstore::txn::{DataSourceManager, TmRecoveryReport, TxLog, TxManager};
use recstore::types::NodeId;
use recstore::xa::{
    BranchId, GlobalId, PropertyOwner, StoreDataSource, Vote, XaDataSource, XaError, XaResource,
    XaResult, Xid,
};
use recstore::StoreConfig;
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

struct Cluster {
    a: Arc<StoreDataSource>,
    b: Arc<StoreDataSource>,
    tm: TxManager,
    report: TmRecoveryReport,
}

impl Cluster {
    fn open(root: &Path) -> XaResult<Self> {
        let (a, b) = open_sources(root)?;
        let registry = Arc::new(DataSourceManager::new());
        registry.register(Arc::clone(&a) as Arc<dyn XaDataSource>)?;
        registry.register(Arc::clone(&b) as Arc<dyn XaDataSource>)?;
        let tm = TxManager::open(root, registry, Synchronous::Full)?;
        let report = tm.recover()?;
        Ok(Self { a, b, tm, report })
    }

    fn close(self) -> XaResult<()> {
        self.tm.close()?;
        self.a.close()?;
        self.b.close()
    }
}

fn open_sources(root: &Path) -> XaResult<(Arc<StoreDataSource>, Arc<StoreDataSource>)> {
    let config = StoreConfig::default();
    let a = StoreDataSource::open_named(&root.join("a"), &config, "a.log", BranchId(1))?;
    let b = StoreDataSource::open_named(&root.join("b"), &config, "b.log", BranchId(2))?;
    Ok((Arc::new(a), Arc::new(b)))
}

/// Starts `xid` on `source`, creates one node in it and returns the node.
fn write_node(source: &StoreDataSource, xid: Xid) -> XaResult<NodeId> {
    source.xa_resource().start(xid)?;
    let mut conn = source.connection();
    conn.bind(xid)?;
    conn.with_tx(|tx| {
        let node = tx.create_node()?;
        let key = tx.create_property_key("branch")?;
        tx.set_property(PropertyOwner::Node(node), key, i64::from(xid.branch.0).into())?;
        Ok(node)
    })
}

struct RefusingResource;

impl XaResource for RefusingResource {
    fn name(&self) -> &str {
        "refusing"
    }

    fn branch_id(&self) -> BranchId {
        BranchId(9)
    }

    fn start(&self, _xid: Xid) -> XaResult<()> {
        Ok(())
    }

    fn prepare(&self, _xid: Xid) -> XaResult<Vote> {
        Err(XaError::Illegal("prepare refused"))
    }

    fn commit(&self, _xid: Xid, _one_phase: bool) -> XaResult<()> {
        Ok(())
    }

    fn rollback(&self, _xid: Xid) -> XaResult<()> {
        Ok(())
    }

    fn recover(&self) -> XaResult<Vec<Xid>> {
        Ok(Vec::new())
    }

    fn recovery_complete(&self) -> XaResult<()> {
        Ok(())
    }
}

#[test]
fn commit_spans_both_stores() -> XaResult<()> {
    init_tracing();
    let root = tempdir().expect("tempdir");
    let cluster = Cluster::open(root.path())?;

    let mut tx = cluster.tm.begin()?;
    let xa = tx.enlist(cluster.a.xa_resource())?;
    let xb = tx.enlist(cluster.b.xa_resource())?;
    assert_eq!(xa.global, xb.global);
    assert_eq!(tx.branch_count(), 2);
    let mut conn_a = cluster.a.connection();
    conn_a.bind(xa)?;
    let mut conn_b = cluster.b.connection();
    conn_b.bind(xb)?;
    let na = conn_a.with_tx(|tx| tx.create_node())?;
    let nb = conn_b.with_tx(|tx| tx.create_node())?;
    tx.commit()?;

    assert!(cluster.a.store().load_node(na)?.in_use);
    assert!(cluster.b.store().load_node(nb)?.in_use);
    assert_eq!(cluster.a.get_last_committed_tx()?, 1);
    assert_eq!(cluster.b.get_last_committed_tx()?, 1);
    // TxStart, two BranchAdd, MarkCommit and TxDone.
    assert_eq!(cluster.tm.log_stats().frames_appended, 5);
    cluster.close()
}

#[test]
fn branch_without_changes_votes_read_only() -> XaResult<()> {
    init_tracing();
    let root = tempdir().expect("tempdir");
    let cluster = Cluster::open(root.path())?;

    let mut tx = cluster.tm.begin()?;
    let xa = tx.enlist(cluster.a.xa_resource())?;
    tx.enlist(cluster.b.xa_resource())?;
    let mut conn = cluster.a.connection();
    conn.bind(xa)?;
    let node = conn.with_tx(|tx| tx.create_node())?;
    tx.commit()?;

    assert!(cluster.a.store().load_node(node)?.in_use);
    assert_eq!(cluster.a.get_last_committed_tx()?, 1);
    assert_eq!(cluster.b.get_last_committed_tx()?, 0);
    assert_eq!(cluster.b.resource_manager().active_transactions(), 0);
    cluster.close()
}

#[test]
fn refused_prepare_rolls_back_every_branch() -> XaResult<()> {
    init_tracing();
    let root = tempdir().expect("tempdir");
    let cluster = Cluster::open(root.path())?;

    let mut tx = cluster.tm.begin()?;
    let xa = tx.enlist(cluster.a.xa_resource())?;
    tx.enlist(Arc::new(RefusingResource))?;
    let mut conn = cluster.a.connection();
    conn.bind(xa)?;
    let node = conn.with_tx(|tx| tx.create_node())?;
    assert!(matches!(tx.commit(), Err(XaError::RolledBack(_))));

    assert!(cluster.a.store().load_node(node).is_err());
    assert_eq!(cluster.a.get_last_committed_tx()?, 0);
    assert_eq!(cluster.a.resource_manager().active_transactions(), 0);

    // The rolled back id is handed out again.
    let mut tx = cluster.tm.begin()?;
    let xa = tx.enlist(cluster.a.xa_resource())?;
    let mut conn = cluster.a.connection();
    conn.bind(xa)?;
    assert_eq!(conn.with_tx(|tx| tx.create_node())?, node);
    tx.commit()?;
    cluster.close()
}

#[test]
fn prepared_branches_follow_the_logged_decision_after_a_crash() -> XaResult<()> {
    init_tracing();
    let root = tempdir().expect("tempdir");
    let (decided, undecided) = (GlobalId(100), GlobalId(101));
    let (kept, lost) = {
        let (a, b) = open_sources(root.path())?;
        a.xa_resource().recovery_complete()?;
        b.xa_resource().recovery_complete()?;
        let (tm_log, pending) = TxLog::open(root.path(), Synchronous::Full)?;
        assert!(pending.is_empty());

        let mut nodes = Vec::new();
        for global in [decided, undecided] {
            let xa = Xid::new(global, a.branch_id());
            let xb = Xid::new(global, b.branch_id());
            nodes.push(write_node(&a, xa)?);
            write_node(&b, xb)?;
            tm_log.start(global, &[xa.branch, xb.branch])?;
            assert_eq!(a.xa_resource().prepare(xa)?, Vote::Commit);
            assert_eq!(b.xa_resource().prepare(xb)?, Vote::Commit);
        }
        tm_log.mark_commit(decided)?;
        (nodes[0], nodes[1])
        // Crash: nothing is closed and neither decision reaches the stores.
    };

    let cluster = Cluster::open(root.path())?;
    assert_eq!(cluster.report.pending, 2);
    assert_eq!(cluster.report.committed, 2);
    assert_eq!(cluster.report.rolled_back, 2);
    assert_eq!(cluster.a.recovery_report().dangling, 2);

    let a = cluster.a.store();
    assert!(a.load_node(kept)?.in_use);
    assert!(a.load_node(lost).is_err());
    let keys = a.all_property_keys()?;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].1, "branch");
    let b = cluster.b.store();
    assert!(b.load_node(NodeId(0))?.in_use);
    assert!(b.load_node(NodeId(1)).is_err());
    assert_eq!(cluster.a.get_last_committed_tx()?, 1);
    assert_eq!(cluster.b.get_last_committed_tx()?, 1);
    cluster.close()?;

    // Everything was resolved; the next open finds nothing pending.
    let cluster = Cluster::open(root.path())?;
    assert_eq!(cluster.report.pending, 0);
    assert_eq!(cluster.report.committed + cluster.report.rolled_back, 0);
    cluster.close()
}
