//! The transaction manager: global transactions spanning one or more data
//! sources, its decision log and the data source registry.

/// Global transactions and recovery of dangling branches.
pub mod manager;
/// Registry of data sources.
pub mod registry;
/// The transaction manager's decision log.
pub mod tx_log;

pub use manager::{TmRecoveryReport, Transaction, TxManager};
pub use registry::DataSourceManager;
pub use tx_log::{PendingTx, TxLog, TxRecord, TX_LOG_NAME};
