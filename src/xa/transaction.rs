use crate::xa::command::LogCommand;
use crate::xa::error::{XaError, XaResult};
use crate::xa::xid::Xid;

/// Lifecycle of one transaction branch.
///
/// `Active → Preparing → Prepared → Committing → Committed`, or
/// `RollingBack → RolledBack` from any state before `Committing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting changes.
    Active,
    /// Change set being turned into logged commands.
    Preparing,
    /// Commands logged and forced; waiting for the decision.
    Prepared,
    /// Commit marker logged; commands being applied.
    Committing,
    /// Applied and marked done.
    Committed,
    /// Being discarded.
    RollingBack,
    /// Discarded.
    RolledBack,
}

impl TxState {
    /// True once the branch can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    /// True while a rollback is still allowed.
    pub fn can_roll_back(self) -> bool {
        matches!(
            self,
            TxState::Active | TxState::Preparing | TxState::Prepared
        )
    }
}

/// The resource-specific half of a transaction: accumulates changes, turns
/// them into commands and applies them.
pub trait CommandApplier: Send + 'static {
    /// Command type logged by this resource.
    type Command: LogCommand;

    /// True if nothing was changed.
    fn is_read_only(&self) -> bool;

    /// Turns every queued change into commands, in queue order.
    fn do_prepare(&mut self) -> XaResult<()>;

    /// Commands built by [`CommandApplier::do_prepare`] or injected during
    /// recovery.
    fn commands(&self) -> &[Self::Command];

    /// Adds a command read back from the log.
    fn inject_command(&mut self, command: Self::Command);

    /// Applies every command and records `tx_id` as the last committed
    /// transaction. Commands are absolute images, so a replay is harmless.
    fn do_commit(&mut self, tx_id: u64) -> XaResult<()>;

    /// Discards changes and gives back ids allocated by this transaction.
    /// Never touches records.
    fn do_rollback(&mut self) -> XaResult<()>;

    /// Marks the transaction as rebuilt from the log.
    fn set_recovered(&mut self);

    /// True when rebuilt from the log.
    fn is_recovered(&self) -> bool;
}

/// Creates transactions for a resource and exposes the counters the log
/// and recovery depend on.
pub trait TransactionFactory: Send + Sync + 'static {
    /// Transaction type created by this factory.
    type Tx: CommandApplier;

    /// New transaction with the given log identifier.
    fn create_transaction(&self, identifier: u32) -> XaResult<Self::Tx>;

    /// Version of the active logical log segment.
    fn current_log_version(&self) -> XaResult<u64>;

    /// Advances the log version and returns the previous one.
    fn get_and_set_new_version(&self) -> XaResult<u64>;

    /// Last committed transaction id; the recovery anchor.
    fn last_committed_tx(&self) -> XaResult<u64>;

    /// Writes every applied change to stable storage.
    fn flush_all(&self) -> XaResult<()>;

    /// Called once recovery has resolved every transaction in the log.
    fn recovery_complete(&self) -> XaResult<()>;
}

/// One transaction branch as tracked by the resource manager.
pub struct XaTransaction<T: CommandApplier> {
    xid: Xid,
    identifier: u32,
    state: TxState,
    /// True once the start entry and commands are in the log.
    logged: bool,
    applier: T,
}

impl<T: CommandApplier> XaTransaction<T> {
    pub(crate) fn new(xid: Xid, identifier: u32, applier: T) -> Self {
        Self {
            xid,
            identifier,
            state: TxState::Active,
            logged: false,
            applier,
        }
    }

    /// Branch id.
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Identifier of this transaction's entries in the logical log.
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Read access to the resource transaction.
    pub fn applier(&self) -> &T {
        &self.applier
    }

    /// Write access to the resource transaction; only while active.
    pub fn applier_mut(&mut self) -> XaResult<&mut T> {
        self.expect_state(TxState::Active, "modify")?;
        Ok(&mut self.applier)
    }

    pub(crate) fn applier_unchecked(&mut self) -> &mut T {
        &mut self.applier
    }

    pub(crate) fn set_state(&mut self, state: TxState) {
        self.state = state;
    }

    pub(crate) fn is_logged(&self) -> bool {
        self.logged
    }

    pub(crate) fn set_logged(&mut self) {
        self.logged = true;
    }

    pub(crate) fn expect_state(&self, state: TxState, op: &'static str) -> XaResult<()> {
        if self.state == state {
            Ok(())
        } else {
            Err(XaError::IllegalState {
                xid: self.xid,
                state: self.state,
                op,
            })
        }
    }
}
