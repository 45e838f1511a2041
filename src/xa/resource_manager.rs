//! Sequencing of prepare, commit and rollback for one resource, and
//! recovery of its logical log.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::primitives::concurrency::DataSourceLock;
use crate::primitives::log::LogStats;
use crate::types::StoreError;
use crate::xa::command::LogCommand;
use crate::xa::error::{XaError, XaResult};
use crate::xa::logical_log::{LogEntry, LogOptions, LogicalLog, ScannedEntry};
use crate::xa::transaction::{CommandApplier, TransactionFactory, TxState, XaTransaction};
use crate::xa::xid::{BranchId, Xid};

/// A transaction shared between its connection and the resource manager.
pub type SharedTx<T> = Arc<Mutex<XaTransaction<T>>>;

/// Outcome of a prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Prepared; the branch must be committed or rolled back.
    Commit,
    /// Nothing changed; the branch is already finished.
    ReadOnly,
}

/// The XA contract the transaction manager drives.
pub trait XaResource: Send + Sync {
    /// Resource name.
    fn name(&self) -> &str;

    /// Branch qualifier used in this resource's xids.
    fn branch_id(&self) -> BranchId;

    /// Starts a branch.
    fn start(&self, xid: Xid) -> XaResult<()>;

    /// Logs the branch's commands and forces a prepare marker.
    fn prepare(&self, xid: Xid) -> XaResult<Vote>;

    /// Commits a prepared branch, or an active one when `one_phase`.
    fn commit(&self, xid: Xid, one_phase: bool) -> XaResult<()>;

    /// Discards a branch that has not started committing.
    fn rollback(&self, xid: Xid) -> XaResult<()>;

    /// Prepared branches found in the log that await a decision.
    fn recover(&self) -> XaResult<Vec<Xid>>;

    /// Ends recovery; new branches are accepted afterwards.
    fn recovery_complete(&self) -> XaResult<()>;
}

/// Counts from the log scan at open.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Committed transactions applied again.
    pub replayed: usize,
    /// Started but never prepared transactions marked done.
    pub discarded: usize,
    /// Prepared transactions waiting for a decision.
    pub dangling: usize,
    /// Offset where an unreadable command ended the log.
    pub truncated_at: Option<u64>,
}

struct ScannedTx<C> {
    xid: Xid,
    commands: Vec<C>,
    prepared: bool,
    commit: Option<(u64, bool)>,
    done: bool,
}

/// Drives the transactions of one resource against its logical log.
pub struct XaResourceManager<F: TransactionFactory> {
    name: String,
    branch: BranchId,
    factory: Arc<F>,
    log: LogicalLog,
    lock: Arc<DataSourceLock>,
    txs: Mutex<HashMap<Xid, SharedTx<F::Tx>>>,
    recovering: AtomicBool,
    failed: AtomicBool,
    report: RecoveryReport,
}

impl<F: TransactionFactory> XaResourceManager<F> {
    /// Opens the logical log `name` in `dir` and replays it.
    ///
    /// Committed transactions are applied again in commit order, unprepared
    /// ones are discarded and prepared ones are kept for
    /// [`XaResource::recover`]. New branches are refused until
    /// [`XaResource::recovery_complete`].
    pub fn open(
        name: &str,
        branch: BranchId,
        dir: &Path,
        factory: Arc<F>,
        lock: Arc<DataSourceLock>,
        options: LogOptions,
    ) -> XaResult<Self> {
        let version = factory.current_log_version()?;
        let last_committed = factory.last_committed_tx()?;
        let (log, entries) = LogicalLog::open(dir, name, options, version, last_committed)?;
        let mut manager = Self {
            name: name.to_string(),
            branch,
            factory,
            log,
            lock,
            txs: Mutex::new(HashMap::new()),
            recovering: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            report: RecoveryReport::default(),
        };
        manager.report = manager.recover_log(entries)?;
        info!(
            resource = %manager.name,
            replayed = manager.report.replayed,
            discarded = manager.report.discarded,
            dangling = manager.report.dangling,
            "xa.recovery.scan"
        );
        Ok(manager)
    }

    fn recover_log(&self, entries: Vec<ScannedEntry>) -> XaResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut scanned: BTreeMap<u32, ScannedTx<<F::Tx as CommandApplier>::Command>> =
            BTreeMap::new();
        let orphan = || StoreError::Corruption("log entry without start");
        for ScannedEntry { offset, entry } in entries {
            match entry {
                LogEntry::Start { identifier, xid } => {
                    if scanned.get(&identifier).is_some_and(|tx| !tx.done) {
                        return Err(StoreError::Corruption("log identifier started twice").into());
                    }
                    scanned.insert(
                        identifier,
                        ScannedTx {
                            xid,
                            commands: Vec::new(),
                            prepared: false,
                            commit: None,
                            done: false,
                        },
                    );
                }
                LogEntry::Command {
                    identifier,
                    payload,
                } => {
                    let tx = scanned.get_mut(&identifier).ok_or_else(orphan)?;
                    match <<F::Tx as CommandApplier>::Command as LogCommand>::read_from(&payload)? {
                        Some(command) => tx.commands.push(command),
                        None => {
                            warn!(resource = %self.name, offset, "xa.recovery.partial_command");
                            self.log.truncate_to(offset)?;
                            report.truncated_at = Some(offset);
                            break;
                        }
                    }
                }
                LogEntry::Prepare { identifier } => {
                    scanned.get_mut(&identifier).ok_or_else(orphan)?.prepared = true;
                }
                LogEntry::OnePhaseCommit { identifier, tx_id } => {
                    scanned.get_mut(&identifier).ok_or_else(orphan)?.commit = Some((tx_id, true));
                }
                LogEntry::TwoPhaseCommit { identifier, tx_id } => {
                    scanned.get_mut(&identifier).ok_or_else(orphan)?.commit = Some((tx_id, false));
                }
                LogEntry::Done { identifier } => {
                    scanned.get_mut(&identifier).ok_or_else(orphan)?.done = true;
                }
            }
        }

        let mut committed: Vec<(u64, u32)> = scanned
            .iter()
            .filter_map(|(id, tx)| tx.commit.map(|(tx_id, _)| (tx_id, *id)))
            .collect();
        committed.sort_unstable();
        for (tx_id, identifier) in committed {
            let Some(tx) = scanned.remove(&identifier) else {
                continue;
            };
            let mut applier = self.factory.create_transaction(identifier)?;
            applier.set_recovered();
            for command in tx.commands {
                applier.inject_command(command);
            }
            debug!(resource = %self.name, xid = %tx.xid, tx_id, "xa.recovery.replay");
            applier.do_commit(tx_id)?;
            if !tx.done {
                self.log.done(identifier)?;
            }
            report.replayed += 1;
        }

        let mut txs = self.txs.lock();
        for (identifier, tx) in scanned {
            if tx.done {
                continue;
            }
            if !tx.prepared {
                self.log.done(identifier)?;
                report.discarded += 1;
                continue;
            }
            let mut applier = self.factory.create_transaction(identifier)?;
            applier.set_recovered();
            for command in tx.commands {
                applier.inject_command(command);
            }
            let mut xa_tx = XaTransaction::new(tx.xid, identifier, applier);
            xa_tx.set_state(TxState::Prepared);
            xa_tx.set_logged();
            warn!(resource = %self.name, xid = %tx.xid, "xa.recovery.dangling");
            txs.insert(tx.xid, Arc::new(Mutex::new(xa_tx)));
            report.dangling += 1;
        }
        Ok(report)
    }

    /// Starts a branch and returns its shared transaction.
    pub fn begin(&self, xid: Xid) -> XaResult<SharedTx<F::Tx>> {
        self.check_not_failed()?;
        if self.recovering.load(Ordering::Acquire) {
            return Err(XaError::RecoveryPending(self.name.clone()));
        }
        let mut txs = self.txs.lock();
        if txs.contains_key(&xid) {
            return Err(XaError::DuplicateXid(xid));
        }
        let identifier = self.log.next_identifier();
        let applier = self.factory.create_transaction(identifier)?;
        let tx = Arc::new(Mutex::new(XaTransaction::new(xid, identifier, applier)));
        txs.insert(xid, Arc::clone(&tx));
        debug!(resource = %self.name, %xid, identifier, "xa.start");
        Ok(tx)
    }

    /// Transaction of branch `xid`.
    pub fn transaction(&self, xid: Xid) -> XaResult<SharedTx<F::Tx>> {
        self.txs
            .lock()
            .get(&xid)
            .cloned()
            .ok_or(XaError::UnknownXid(xid))
    }

    /// Transaction factory of this resource.
    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Logical log of this resource.
    pub fn logical_log(&self) -> &LogicalLog {
        &self.log
    }

    /// Counts from the log scan at open.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// True until recovery completes.
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::Acquire)
    }

    /// True after a commit failed while applying commands.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Branches not yet finished.
    pub fn active_transactions(&self) -> usize {
        self.txs.lock().len()
    }

    /// Counters of the active log segment.
    pub fn log_stats(&self) -> Option<LogStats> {
        self.log.stats()
    }

    /// Rotates the logical log under the data source write lock.
    pub fn rotate(&self) -> XaResult<()> {
        let _guard = self.lock.write();
        self.rotate_locked()
    }

    fn rotate_locked(&self) -> XaResult<()> {
        let previous = self.factory.get_and_set_new_version()?;
        self.factory.flush_all()?;
        let last_committed = self.factory.last_committed_tx()?;
        self.log.rotate(previous + 1, last_committed)?;
        Ok(())
    }

    /// Closes the logical log. With no open branches the log version is
    /// advanced and the segment retired.
    pub fn close(&self) -> XaResult<()> {
        let _guard = self.lock.write();
        if self.log.open_transactions() == 0 && !self.has_failed() {
            self.factory.get_and_set_new_version()?;
            self.factory.flush_all()?;
        }
        self.log.close()?;
        debug!(resource = %self.name, "xa.close");
        Ok(())
    }

    fn check_not_failed(&self) -> XaResult<()> {
        if self.has_failed() {
            Err(XaError::ResourceFailed(self.name.clone()))
        } else {
            Ok(())
        }
    }

    /// Builds and logs the commands of `tx`. Returns false for an empty
    /// change set, which is not logged.
    fn write_prepared(&self, tx: &mut XaTransaction<F::Tx>) -> XaResult<bool> {
        tx.set_state(TxState::Preparing);
        tx.applier_unchecked().do_prepare()?;
        if tx.applier().is_read_only() {
            return Ok(false);
        }
        let payloads: Vec<Vec<u8>> = tx
            .applier()
            .commands()
            .iter()
            .map(|command| {
                let mut out = Vec::new();
                command.write_to(&mut out);
                out
            })
            .collect();
        let xid = tx.xid();
        self.log
            .write_transaction(tx.identifier(), xid, &payloads)
            .map_err(|source| XaError::Prepare { xid, source })?;
        tx.set_logged();
        Ok(true)
    }

    fn finish(&self, xid: Xid) {
        self.txs.lock().remove(&xid);
    }
}

impl<F: TransactionFactory> XaResource for XaResourceManager<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn branch_id(&self) -> BranchId {
        self.branch
    }

    fn start(&self, xid: Xid) -> XaResult<()> {
        self.begin(xid).map(|_| ())
    }

    fn prepare(&self, xid: Xid) -> XaResult<Vote> {
        self.check_not_failed()?;
        let shared = self.transaction(xid)?;
        let mut tx = shared.lock();
        tx.expect_state(TxState::Active, "prepare")?;
        if !self.write_prepared(&mut tx)? {
            tx.set_state(TxState::Committed);
            drop(tx);
            self.finish(xid);
            debug!(resource = %self.name, %xid, "xa.prepare.read_only");
            return Ok(Vote::ReadOnly);
        }
        self.log
            .prepare(tx.identifier())
            .map_err(|source| XaError::Prepare { xid, source })?;
        tx.set_state(TxState::Prepared);
        debug!(resource = %self.name, %xid, "xa.prepare");
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: Xid, one_phase: bool) -> XaResult<()> {
        self.check_not_failed()?;
        let shared = self.transaction(xid)?;
        let _guard = self.lock.write();
        let mut tx = shared.lock();
        if one_phase {
            tx.expect_state(TxState::Active, "one-phase commit")?;
            if !self.write_prepared(&mut tx)? {
                tx.set_state(TxState::Committed);
                drop(tx);
                self.finish(xid);
                return Ok(());
            }
        } else {
            tx.expect_state(TxState::Prepared, "commit")?;
        }
        let tx_id = self.factory.last_committed_tx()? + 1;
        self.log
            .commit(tx.identifier(), tx_id, one_phase)
            .map_err(|source| XaError::Commit { xid, source })?;
        tx.set_state(TxState::Committing);
        if let Err(err) = tx.applier_unchecked().do_commit(tx_id) {
            self.failed.store(true, Ordering::Release);
            error!(
                resource = %self.name,
                %xid,
                tx_id,
                error = %err,
                "xa.commit.apply_failed"
            );
            return Err(err);
        }
        self.log
            .done(tx.identifier())
            .map_err(|source| XaError::Commit { xid, source })?;
        tx.set_state(TxState::Committed);
        drop(tx);
        self.finish(xid);
        debug!(resource = %self.name, %xid, tx_id, one_phase, "xa.commit");
        if self.log.needs_rotation()? {
            self.rotate_locked()?;
        }
        Ok(())
    }

    fn rollback(&self, xid: Xid) -> XaResult<()> {
        let shared = self.transaction(xid)?;
        let mut tx = shared.lock();
        if !tx.state().can_roll_back() {
            return Err(XaError::IllegalState {
                xid,
                state: tx.state(),
                op: "rollback",
            });
        }
        tx.set_state(TxState::RollingBack);
        tx.applier_unchecked().do_rollback()?;
        if tx.is_logged() {
            self.log
                .done(tx.identifier())
                .map_err(|source| XaError::Rollback { xid, source })?;
        }
        tx.set_state(TxState::RolledBack);
        drop(tx);
        self.finish(xid);
        debug!(resource = %self.name, %xid, "xa.rollback");
        Ok(())
    }

    fn recover(&self) -> XaResult<Vec<Xid>> {
        let txs = self.txs.lock();
        let mut dangling: Vec<Xid> = txs
            .iter()
            .filter(|(_, tx)| {
                let tx = tx.lock();
                tx.state() == TxState::Prepared && tx.applier().is_recovered()
            })
            .map(|(xid, _)| *xid)
            .collect();
        dangling.sort_unstable();
        Ok(dangling)
    }

    fn recovery_complete(&self) -> XaResult<()> {
        if !self.recover()?.is_empty() {
            return Err(XaError::Illegal("dangling transactions remain"));
        }
        self.factory.recovery_complete()?;
        self.recovering.store(false, Ordering::Release);
        info!(resource = %self.name, "xa.recovery.complete");
        Ok(())
    }
}
