//! Global transactions over the registered data sources.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::primitives::log::LogStats;
use crate::store::config::Synchronous;
use crate::txn::registry::DataSourceManager;
use crate::txn::tx_log::{PendingTx, TxLog};
use crate::xa::error::{XaError, XaResult};
use crate::xa::resource_manager::{Vote, XaResource};
use crate::xa::xid::{BranchId, GlobalId, Xid};

/// Outcome of [`TxManager::recover`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct TmRecoveryReport {
    /// Dangling branches committed because the decision was logged.
    pub committed: usize,
    /// Dangling branches rolled back.
    pub rolled_back: usize,
    /// Global transactions found pending in the log.
    pub pending: usize,
}

/// Coordinates one- and two-phase commit across data sources and resolves
/// the branches a crash left prepared.
pub struct TxManager {
    registry: Arc<DataSourceManager>,
    log: TxLog,
    /// High 32 bits of every global id issued by this instance.
    session: u64,
    sequence: AtomicU32,
    pending: Mutex<Vec<PendingTx>>,
    recovered: AtomicBool,
}

impl TxManager {
    /// Opens the transaction manager log in `dir`. Call
    /// [`TxManager::recover`] once every data source is registered.
    pub fn open(
        dir: &Path,
        registry: Arc<DataSourceManager>,
        synchronous: Synchronous,
    ) -> XaResult<Self> {
        let (log, pending) = TxLog::open(dir, synchronous)?;
        Ok(Self {
            registry,
            log,
            session: u64::from(rand::random::<u32>()) << 32,
            sequence: AtomicU32::new(1),
            pending: Mutex::new(pending),
            recovered: AtomicBool::new(false),
        })
    }

    /// Data source registry.
    pub fn registry(&self) -> &Arc<DataSourceManager> {
        &self.registry
    }

    /// Resolves every dangling branch of every registered data source, then
    /// completes recovery on each of them.
    ///
    /// A branch is committed when its global transaction has a logged commit
    /// decision and rolled back otherwise.
    pub fn recover(&self) -> XaResult<TmRecoveryReport> {
        let pending = self.pending.lock().clone();
        let decided: BTreeSet<GlobalId> = pending
            .iter()
            .filter(|tx| tx.committed)
            .map(|tx| tx.global)
            .collect();
        let mut report = TmRecoveryReport {
            pending: pending.len(),
            ..TmRecoveryReport::default()
        };
        let sources = self.registry.all();
        for source in &sources {
            let resource = source.xa_resource();
            for xid in resource.recover()? {
                let commit = decided.contains(&xid.global);
                info!(
                    resource = resource.name(),
                    %xid,
                    decision = if commit { "commit" } else { "rollback" },
                    "tm.recover.dangling"
                );
                if commit {
                    resource.commit(xid, false)?;
                    report.committed += 1;
                } else {
                    resource.rollback(xid)?;
                    report.rolled_back += 1;
                }
            }
        }
        for source in &sources {
            source.xa_resource().recovery_complete()?;
        }
        for tx in &pending {
            self.log.done(tx.global)?;
        }
        self.pending.lock().clear();
        self.recovered.store(true, Ordering::Release);
        info!(
            committed = report.committed,
            rolled_back = report.rolled_back,
            pending = report.pending,
            "tm.recover"
        );
        Ok(report)
    }

    /// True once [`TxManager::recover`] has run.
    pub fn is_recovered(&self) -> bool {
        self.recovered.load(Ordering::Acquire)
    }

    /// Starts a global transaction.
    pub fn begin(&self) -> XaResult<Transaction<'_>> {
        if !self.is_recovered() {
            return Err(XaError::RecoveryPending("transaction manager".to_string()));
        }
        let global = GlobalId(self.session | u64::from(self.sequence.fetch_add(1, Ordering::Relaxed)));
        debug!(%global, "tm.begin");
        Ok(Transaction {
            tm: self,
            global,
            branches: Vec::new(),
            finished: false,
        })
    }

    /// Counters of the transaction manager log.
    pub fn log_stats(&self) -> LogStats {
        self.log.stats()
    }

    /// Forces the log.
    pub fn close(&self) -> XaResult<()> {
        self.log.close()?;
        debug!(path = %self.log.path().display(), "tm.close");
        Ok(())
    }
}

struct Branch {
    xid: Xid,
    resource: Arc<dyn XaResource>,
}

fn roll_back_quietly(branch: &Branch) {
    if let Err(err) = branch.resource.rollback(branch.xid) {
        debug!(xid = %branch.xid, error = %err, "tm.rollback.skipped");
    }
}

/// A global transaction. Dropping it without commit or rollback rolls every
/// branch back.
pub struct Transaction<'tm> {
    tm: &'tm TxManager,
    global: GlobalId,
    branches: Vec<Branch>,
    finished: bool,
}

impl<'tm> Transaction<'tm> {
    /// Global id.
    pub fn global_id(&self) -> GlobalId {
        self.global
    }

    /// Starts a branch on `resource`. Enlisting the same resource twice
    /// returns the existing branch.
    pub fn enlist(&mut self, resource: Arc<dyn XaResource>) -> XaResult<Xid> {
        let branch = resource.branch_id();
        if let Some(existing) = self.branches.iter().find(|b| b.xid.branch == branch) {
            return Ok(existing.xid);
        }
        let xid = Xid::new(self.global, branch);
        resource.start(xid)?;
        debug!(%xid, resource = resource.name(), "tm.enlist");
        self.branches.push(Branch { xid, resource });
        Ok(xid)
    }

    /// Number of enlisted branches.
    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    /// Commits every branch: one-phase with a single branch, two-phase
    /// otherwise. A failed prepare rolls all branches back and returns
    /// [`XaError::RolledBack`].
    pub fn commit(mut self) -> XaResult<()> {
        self.finished = true;
        let branches = std::mem::take(&mut self.branches);
        match branches.as_slice() {
            [] => Ok(()),
            [only] => self.commit_one_phase(only),
            _ => self.commit_two_phase(&branches),
        }
    }

    fn commit_one_phase(&self, branch: &Branch) -> XaResult<()> {
        if let Err(err) = branch.resource.commit(branch.xid, true) {
            roll_back_quietly(branch);
            return Err(err);
        }
        debug!(global = %self.global, "tm.commit.one_phase");
        Ok(())
    }

    fn commit_two_phase(&self, branches: &[Branch]) -> XaResult<()> {
        let log = &self.tm.log;
        let ids: Vec<BranchId> = branches.iter().map(|b| b.xid.branch).collect();
        log.start(self.global, &ids)?;

        let mut prepared: Vec<&Branch> = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            match branch.resource.prepare(branch.xid) {
                Ok(Vote::Commit) => prepared.push(branch),
                Ok(Vote::ReadOnly) => {}
                Err(err) => {
                    warn!(
                        global = %self.global,
                        xid = %branch.xid,
                        error = %err,
                        "tm.prepare.failed"
                    );
                    for other in prepared.iter().copied().chain(branches[i..].iter()) {
                        roll_back_quietly(other);
                    }
                    log.done(self.global)?;
                    return Err(XaError::RolledBack(format!("{}: {err}", self.global)));
                }
            }
        }
        if prepared.is_empty() {
            log.done(self.global)?;
            return Ok(());
        }

        if let Err(err) = log.mark_commit(self.global) {
            error!(global = %self.global, error = %err, "tm.mark_commit.failed");
            for branch in &prepared {
                roll_back_quietly(branch);
            }
            return Err(err.into());
        }

        let mut first_err = None;
        for branch in &prepared {
            if let Err(err) = branch.resource.commit(branch.xid, false) {
                error!(
                    global = %self.global,
                    xid = %branch.xid,
                    error = %err,
                    "tm.commit.branch_failed"
                );
                first_err.get_or_insert(err);
            }
        }
        if let Some(err) = first_err {
            // No done record: recovery commits the rest.
            return Err(err);
        }
        log.done(self.global)?;
        debug!(global = %self.global, branches = prepared.len(), "tm.commit.two_phase");
        Ok(())
    }

    /// Rolls every branch back. All branches are tried; the first error is
    /// returned.
    pub fn rollback(mut self) -> XaResult<()> {
        self.finished = true;
        let mut first_err = None;
        for branch in std::mem::take(&mut self.branches) {
            if let Err(err) = branch.resource.rollback(branch.xid) {
                first_err.get_or_insert(err);
            }
        }
        debug!(global = %self.global, "tm.rollback");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished || self.branches.is_empty() {
            return;
        }
        warn!(global = %self.global, "tm.tx.dropped_active");
        for branch in &self.branches {
            roll_back_quietly(branch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::data_source::{XaConnection, XaDataSource};
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeResource {
        name: String,
        branch: u32,
        fail_prepare: bool,
        events: Mutex<Vec<String>>,
        dangling: Mutex<Vec<Xid>>,
        completed: AtomicBool,
    }

    impl FakeResource {
        fn new(name: &str, branch: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                branch,
                ..Self::default()
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn record(&self, event: &str) {
            self.events.lock().push(event.to_string());
        }
    }

    impl XaResource for FakeResource {
        fn name(&self) -> &str {
            &self.name
        }

        fn branch_id(&self) -> BranchId {
            BranchId(self.branch)
        }

        fn start(&self, _xid: Xid) -> XaResult<()> {
            self.record("start");
            Ok(())
        }

        fn prepare(&self, _xid: Xid) -> XaResult<Vote> {
            if self.fail_prepare {
                return Err(XaError::Illegal("prepare refused"));
            }
            self.record("prepare");
            Ok(Vote::Commit)
        }

        fn commit(&self, xid: Xid, one_phase: bool) -> XaResult<()> {
            self.record(&format!("commit:{one_phase}"));
            self.dangling.lock().retain(|x| *x != xid);
            Ok(())
        }

        fn rollback(&self, xid: Xid) -> XaResult<()> {
            self.record("rollback");
            self.dangling.lock().retain(|x| *x != xid);
            Ok(())
        }

        fn recover(&self) -> XaResult<Vec<Xid>> {
            Ok(self.dangling.lock().clone())
        }

        fn recovery_complete(&self) -> XaResult<()> {
            self.completed.store(true, Ordering::Release);
            Ok(())
        }
    }

    struct FakeConnection(Arc<FakeResource>);

    impl XaConnection for FakeConnection {
        fn xa_resource(&self) -> Arc<dyn XaResource> {
            self.0.clone()
        }
    }

    struct FakeSource(Arc<FakeResource>);

    impl XaDataSource for FakeSource {
        fn name(&self) -> &str {
            &self.0.name
        }

        fn branch_id(&self) -> BranchId {
            BranchId(self.0.branch)
        }

        fn xa_resource(&self) -> Arc<dyn XaResource> {
            self.0.clone()
        }

        fn get_xa_connection(&self) -> Box<dyn XaConnection> {
            Box::new(FakeConnection(self.0.clone()))
        }

        fn get_and_set_new_version(&self) -> XaResult<u64> {
            Ok(0)
        }

        fn get_last_committed_tx(&self) -> XaResult<u64> {
            Ok(0)
        }

        fn rotate_logical_log(&self) -> XaResult<()> {
            Ok(())
        }

        fn close(&self) -> XaResult<()> {
            Ok(())
        }
    }

    fn manager(dir: &Path, resources: &[Arc<FakeResource>]) -> XaResult<TxManager> {
        let registry = Arc::new(DataSourceManager::new());
        for resource in resources {
            registry.register(Arc::new(FakeSource(Arc::clone(resource))))?;
        }
        TxManager::open(dir, registry, Synchronous::Full)
    }

    #[test]
    fn single_branch_commits_in_one_phase() -> XaResult<()> {
        let dir = tempdir().unwrap();
        let a = FakeResource::new("a", 1);
        let tm = manager(dir.path(), &[Arc::clone(&a)])?;
        tm.recover()?;
        let mut tx = tm.begin()?;
        let xid = tx.enlist(a.clone())?;
        assert_eq!(tx.enlist(a.clone())?, xid);
        tx.commit()?;
        assert_eq!(a.events(), vec!["start", "commit:true"]);
        assert_eq!(tm.log.open_transactions(), 0);
        Ok(())
    }

    #[test]
    fn two_branches_commit_in_two_phases() -> XaResult<()> {
        let dir = tempdir().unwrap();
        let a = FakeResource::new("a", 1);
        let b = FakeResource::new("b", 2);
        let tm = manager(dir.path(), &[Arc::clone(&a), Arc::clone(&b)])?;
        tm.recover()?;
        let mut tx = tm.begin()?;
        tx.enlist(a.clone())?;
        tx.enlist(b.clone())?;
        tx.commit()?;
        assert_eq!(a.events(), vec!["start", "prepare", "commit:false"]);
        assert_eq!(b.events(), vec!["start", "prepare", "commit:false"]);
        assert_eq!(tm.log.open_transactions(), 0);
        Ok(())
    }

    #[test]
    fn failed_prepare_rolls_every_branch_back() -> XaResult<()> {
        let dir = tempdir().unwrap();
        let a = FakeResource::new("a", 1);
        let b = Arc::new(FakeResource {
            name: "b".into(),
            branch: 2,
            fail_prepare: true,
            ..FakeResource::default()
        });
        let tm = manager(dir.path(), &[Arc::clone(&a), Arc::clone(&b)])?;
        tm.recover()?;
        let mut tx = tm.begin()?;
        tx.enlist(a.clone())?;
        tx.enlist(b.clone())?;
        assert!(matches!(tx.commit(), Err(XaError::RolledBack(_))));
        assert_eq!(a.events(), vec!["start", "prepare", "rollback"]);
        assert_eq!(b.events(), vec!["start", "rollback"]);
        assert_eq!(tm.log.open_transactions(), 0);
        Ok(())
    }

    #[test]
    fn recovery_follows_the_logged_decision() -> XaResult<()> {
        let dir = tempdir().unwrap();
        {
            let (log, _) = TxLog::open(dir.path(), Synchronous::Full)?;
            log.start(GlobalId(10), &[BranchId(1)])?;
            log.mark_commit(GlobalId(10))?;
            log.start(GlobalId(11), &[BranchId(1)])?;
            log.close()?;
        }
        let a = FakeResource::new("a", 1);
        a.dangling.lock().extend([
            Xid::new(GlobalId(10), BranchId(1)),
            Xid::new(GlobalId(11), BranchId(1)),
            Xid::new(GlobalId(12), BranchId(1)),
        ]);
        let tm = manager(dir.path(), &[Arc::clone(&a)])?;
        assert!(matches!(tm.begin(), Err(XaError::RecoveryPending(_))));
        let report = tm.recover()?;
        assert_eq!(report.committed, 1);
        assert_eq!(report.rolled_back, 2);
        assert_eq!(report.pending, 2);
        assert_eq!(a.events(), vec!["commit:false", "rollback", "rollback"]);
        assert!(a.completed.load(Ordering::Acquire));
        tm.close()?;
        drop(tm);

        let (_log, pending) = TxLog::open(dir.path(), Synchronous::Full)?;
        assert!(pending.is_empty());
        Ok(())
    }

    #[test]
    fn dropped_transaction_rolls_back() -> XaResult<()> {
        let dir = tempdir().unwrap();
        let a = FakeResource::new("a", 1);
        let tm = manager(dir.path(), &[Arc::clone(&a)])?;
        tm.recover()?;
        {
            let mut tx = tm.begin()?;
            tx.enlist(a.clone())?;
        }
        assert_eq!(a.events(), vec!["start", "rollback"]);
        Ok(())
    }
}
