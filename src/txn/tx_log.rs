//! Durable log of the transaction manager's two-phase commit decisions.
//!
//! Records are framed by [`LogFile`]; bodies are
//! `[type u8][global u64][payload]`. Only the commit decision is forced: a
//! global transaction without a `MarkCommit` record is presumed aborted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::log::{LogFile, LogHeader, LogStats, LOG_HEADER_LEN};
use crate::store::config::Synchronous;
use crate::types::Result;
use crate::xa::xid::{BranchId, GlobalId};

/// File name of the transaction manager log.
pub const TX_LOG_NAME: &str = "tm_tx_log";

const RECORD_TX_START: u8 = 1;
const RECORD_BRANCH_ADD: u8 = 2;
const RECORD_MARK_COMMIT: u8 = 3;
const RECORD_TX_DONE: u8 = 4;

/// Size past which the log is emptied the next time no transaction is open.
const COMPACT_THRESHOLD: u64 = 1024 * 1024;

/// One record of the transaction manager log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxRecord {
    /// A global transaction entered two-phase commit.
    TxStart(GlobalId),
    /// A branch takes part in the global transaction.
    BranchAdd(GlobalId, BranchId),
    /// Every branch prepared; the decision is commit.
    MarkCommit(GlobalId),
    /// Every branch is resolved.
    TxDone(GlobalId),
}

impl TxRecord {
    /// Global transaction of this record.
    pub fn global(&self) -> GlobalId {
        match self {
            TxRecord::TxStart(g)
            | TxRecord::BranchAdd(g, _)
            | TxRecord::MarkCommit(g)
            | TxRecord::TxDone(g) => *g,
        }
    }

    /// Encoded frame body.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, branch) = match self {
            TxRecord::TxStart(_) => (RECORD_TX_START, None),
            TxRecord::BranchAdd(_, b) => (RECORD_BRANCH_ADD, Some(*b)),
            TxRecord::MarkCommit(_) => (RECORD_MARK_COMMIT, None),
            TxRecord::TxDone(_) => (RECORD_TX_DONE, None),
        };
        let mut out = Vec::with_capacity(13);
        out.push(kind);
        out.extend_from_slice(&self.global().0.to_be_bytes());
        if let Some(branch) = branch {
            out.extend_from_slice(&branch.0.to_be_bytes());
        }
        out
    }

    /// Decodes a frame body; `None` if it is malformed.
    pub fn decode(body: &[u8]) -> Option<Self> {
        let (&kind, rest) = body.split_first()?;
        let global = GlobalId(u64::from_be_bytes(rest.get(0..8)?.try_into().ok()?));
        let payload = &rest[8..];
        match (kind, payload.len()) {
            (RECORD_TX_START, 0) => Some(TxRecord::TxStart(global)),
            (RECORD_BRANCH_ADD, 4) => Some(TxRecord::BranchAdd(
                global,
                BranchId(u32::from_be_bytes(payload.try_into().ok()?)),
            )),
            (RECORD_MARK_COMMIT, 0) => Some(TxRecord::MarkCommit(global)),
            (RECORD_TX_DONE, 0) => Some(TxRecord::TxDone(global)),
            _ => None,
        }
    }
}

/// A global transaction found in the log without a done record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingTx {
    /// Global id.
    pub global: GlobalId,
    /// Branches that took part.
    pub branches: Vec<BranchId>,
    /// True if the commit decision was logged.
    pub committed: bool,
}

/// The transaction manager log.
pub struct TxLog {
    path: PathBuf,
    file: LogFile,
    synchronous: Synchronous,
    /// Globals started and not yet done; appends happen under this lock.
    open: Mutex<BTreeSet<GlobalId>>,
}

impl TxLog {
    /// Opens or creates the log in `dir` and returns the transactions left
    /// pending by the previous run, in global id order.
    pub fn open(dir: &Path, synchronous: Synchronous) -> Result<(Self, Vec<PendingTx>)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(TX_LOG_NAME);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
        let file = if io.len()? < LOG_HEADER_LEN as u64 {
            LogFile::create(io, LogHeader::new(0, 0))?
        } else {
            LogFile::open(io)?
        };

        let mut pending: BTreeMap<GlobalId, PendingTx> = BTreeMap::new();
        let mut reader = file.reader(None)?;
        while let Some(frame) = reader.next_frame()? {
            let Some(record) = TxRecord::decode(&frame.body) else {
                warn!(offset = frame.offset, "tm.log.malformed_record");
                reader.rewind_valid_to(frame.offset);
                break;
            };
            match record {
                TxRecord::TxStart(global) => {
                    pending.insert(
                        global,
                        PendingTx {
                            global,
                            branches: Vec::new(),
                            committed: false,
                        },
                    );
                }
                TxRecord::BranchAdd(global, branch) => {
                    if let Some(tx) = pending.get_mut(&global) {
                        tx.branches.push(branch);
                    }
                }
                TxRecord::MarkCommit(global) => {
                    if let Some(tx) = pending.get_mut(&global) {
                        tx.committed = true;
                    }
                }
                TxRecord::TxDone(global) => {
                    pending.remove(&global);
                }
            }
        }
        file.truncate_to(reader.valid_up_to())?;

        let open = pending.keys().copied().collect();
        let pending: Vec<PendingTx> = pending.into_values().collect();
        info!(path = %path.display(), pending = pending.len(), "tm.log.open");
        Ok((
            Self {
                path,
                file,
                synchronous,
                open: Mutex::new(open),
            },
            pending,
        ))
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logs the start of two-phase commit for `global` and its branches.
    pub fn start(&self, global: GlobalId, branches: &[BranchId]) -> Result<()> {
        let mut bodies = vec![TxRecord::TxStart(global).encode()];
        bodies.extend(
            branches
                .iter()
                .map(|b| TxRecord::BranchAdd(global, *b).encode()),
        );
        let refs: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();
        let mut open = self.open.lock();
        self.file.append(&refs)?;
        open.insert(global);
        Ok(())
    }

    /// Logs and forces the commit decision for `global`.
    pub fn mark_commit(&self, global: GlobalId) -> Result<()> {
        let _open = self.open.lock();
        self.file.append(&[&TxRecord::MarkCommit(global).encode()])?;
        if self.synchronous == Synchronous::Full {
            self.file.force()?;
        }
        Ok(())
    }

    /// Logs that every branch of `global` is resolved. Empties the file
    /// once it is large and nothing is open.
    pub fn done(&self, global: GlobalId) -> Result<()> {
        let mut open = self.open.lock();
        self.file.append(&[&TxRecord::TxDone(global).encode()])?;
        open.remove(&global);
        if open.is_empty() && self.file.len()? > COMPACT_THRESHOLD {
            self.file.truncate_to(LOG_HEADER_LEN as u64)?;
            debug!(path = %self.path.display(), "tm.log.compact");
        }
        Ok(())
    }

    /// Globals started and not yet done.
    pub fn open_transactions(&self) -> usize {
        self.open.lock().len()
    }

    /// Size of the log file.
    pub fn size(&self) -> Result<u64> {
        self.file.len()
    }

    /// Append counters.
    pub fn stats(&self) -> LogStats {
        self.file.stats()
    }

    /// Forces everything appended so far.
    pub fn close(&self) -> Result<()> {
        let _open = self.open.lock();
        self.file.force()
    }
}
