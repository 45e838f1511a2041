use crate::types::StoreError;
use crate::xa::transaction::TxState;
use crate::xa::xid::Xid;

/// Errors raised by the XA layer, one variant per failing phase.
#[derive(thiserror::Error, Debug)]
pub enum XaError {
    /// Building or logging the prepared change set failed.
    #[error("prepare of {xid} failed: {source}")]
    Prepare {
        /// Branch being prepared.
        xid: Xid,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
    /// Logging or applying the commit failed.
    #[error("commit of {xid} failed: {source}")]
    Commit {
        /// Branch being committed.
        xid: Xid,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
    /// Rolling back failed.
    #[error("rollback of {xid} failed: {source}")]
    Rollback {
        /// Branch being rolled back.
        xid: Xid,
        /// Underlying failure.
        #[source]
        source: StoreError,
    },
    /// No transaction is known under this xid.
    #[error("unknown xid {0}")]
    UnknownXid(Xid),
    /// A transaction with this xid already exists.
    #[error("duplicate xid {0}")]
    DuplicateXid(Xid),
    /// The operation is not allowed in the transaction's current state.
    #[error("transaction {xid} is {state:?}: {op} not allowed")]
    IllegalState {
        /// Branch concerned.
        xid: Xid,
        /// State found.
        state: TxState,
        /// Rejected operation.
        op: &'static str,
    },
    /// The resource has not finished recovery.
    #[error("resource {0} is still recovering")]
    RecoveryPending(String),
    /// A commit failed part-way; the resource accepts nothing until restart.
    #[error("resource {0} failed and must be restarted")]
    ResourceFailed(String),
    /// A global transaction was rolled back instead of committed.
    #[error("transaction {0} rolled back")]
    RolledBack(String),
    /// Misuse of the transaction manager or a data source.
    #[error("illegal operation: {0}")]
    Illegal(&'static str),
    /// Store failure outside a specific phase.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias of the XA layer.
pub type XaResult<T> = std::result::Result<T, XaError>;
