//! XA resources: logical logs, logged commands, transaction branches and
//! the resource manager that prepares, commits and recovers them.

/// Commands logged at prepare.
pub mod command;
/// Data sources and connections.
pub mod data_source;
/// Errors of the XA layer.
pub mod error;
/// Record write locks.
pub mod lock_table;
/// The logical log.
pub mod logical_log;
/// Prepare/commit/rollback sequencing and recovery.
pub mod resource_manager;
/// Transaction branches and the resource traits.
pub mod transaction;
/// The graph store's transaction.
pub mod write_transaction;
/// Transaction branch ids.
pub mod xid;

pub use command::{LogCommand, StoreCommand};
pub use data_source::{
    StoreConnection, StoreDataSource, StoreTxFactory, XaConnection, XaDataSource,
    STORE_BRANCH, STORE_LOG_NAME,
};
pub use error::{XaError, XaResult};
pub use lock_table::{LockOutcome, LockTable, LockedRecord};
pub use logical_log::{LogEntry, LogOptions, LogicalLog};
pub use resource_manager::{RecoveryReport, SharedTx, Vote, XaResource, XaResourceManager};
pub use transaction::{CommandApplier, TransactionFactory, TxState, XaTransaction};
pub use write_transaction::{PropertyOwner, StoreTransaction};
pub use xid::{BranchId, GlobalId, Xid};
