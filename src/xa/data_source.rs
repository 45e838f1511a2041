//! Data sources: a store, its logical log and its resource manager packaged
//! behind the interface the transaction manager registers and enlists.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::primitives::concurrency::DataSourceLock;
use crate::primitives::log::LogStats;
use crate::store::config::StoreConfig;
use crate::store::factory::StoreFactory;
use crate::store::graph_store::GraphStore;
use crate::types::Result;
use crate::xa::error::{XaError, XaResult};
use crate::xa::lock_table::LockTable;
use crate::xa::logical_log::LogOptions;
use crate::xa::resource_manager::{RecoveryReport, SharedTx, XaResource, XaResourceManager};
use crate::xa::transaction::TransactionFactory;
use crate::xa::write_transaction::StoreTransaction;
use crate::xa::xid::{BranchId, Xid};

/// Logical log name of the graph store data source.
pub const STORE_LOG_NAME: &str = "graph.log";
/// Branch qualifier of the graph store data source.
pub const STORE_BRANCH: BranchId = BranchId(1);

/// A connection handing out the XA resource of its data source.
pub trait XaConnection: Send {
    /// Resource to enlist.
    fn xa_resource(&self) -> Arc<dyn XaResource>;
}

/// A transactional resource as seen by the transaction manager and the
/// data source registry.
pub trait XaDataSource: Send + Sync {
    /// Resource name, also the logical log name.
    fn name(&self) -> &str;

    /// Branch qualifier of this source's xids.
    fn branch_id(&self) -> BranchId;

    /// The XA resource of this source.
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// A new connection.
    fn get_xa_connection(&self) -> Box<dyn XaConnection>;

    /// Advances the logical log version; returns the previous one.
    fn get_and_set_new_version(&self) -> XaResult<u64>;

    /// Last committed transaction id.
    fn get_last_committed_tx(&self) -> XaResult<u64>;

    /// Starts a new logical log segment.
    fn rotate_logical_log(&self) -> XaResult<()>;

    /// Closes the log and the underlying store.
    fn close(&self) -> XaResult<()>;
}

/// Creates [`StoreTransaction`]s sharing one record [`LockTable`] and
/// exposes the meta store counters.
pub struct StoreTxFactory {
    store: Arc<GraphStore>,
    locks: Arc<LockTable>,
}

impl StoreTxFactory {
    /// Factory over `store`.
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self {
            store,
            locks: Arc::new(LockTable::new()),
        }
    }

    /// Record write locks of the transactions this factory created.
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }
}

impl TransactionFactory for StoreTxFactory {
    type Tx = StoreTransaction;

    fn create_transaction(&self, identifier: u32) -> XaResult<StoreTransaction> {
        Ok(StoreTransaction::new(
            identifier,
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
        ))
    }

    fn current_log_version(&self) -> XaResult<u64> {
        Ok(self.store.meta().log_version()?)
    }

    fn get_and_set_new_version(&self) -> XaResult<u64> {
        Ok(self.store.meta().increment_log_version()?)
    }

    fn last_committed_tx(&self) -> XaResult<u64> {
        Ok(self.store.meta().last_committed_tx()?)
    }

    fn flush_all(&self) -> XaResult<()> {
        Ok(self.store.flush_all()?)
    }

    fn recovery_complete(&self) -> XaResult<()> {
        self.store.make_store_ok()?;
        self.store.set_recovery_mode(false);
        Ok(())
    }
}

/// The graph store as an XA data source.
pub struct StoreDataSource {
    name: String,
    branch: BranchId,
    store: Arc<GraphStore>,
    lock: Arc<DataSourceLock>,
    manager: Arc<XaResourceManager<StoreTxFactory>>,
    closed: AtomicBool,
}

impl StoreDataSource {
    /// Creates the store in `dir` if needed, opens it and replays its
    /// logical log, under [`STORE_LOG_NAME`] and [`STORE_BRANCH`].
    ///
    /// The stores stay in recovery mode until
    /// [`XaResource::recovery_complete`], which also repairs every store
    /// that is not ok.
    pub fn open(dir: &Path, config: &StoreConfig) -> XaResult<Self> {
        Self::open_named(dir, config, STORE_LOG_NAME, STORE_BRANCH)
    }

    /// Like [`StoreDataSource::open`] with an explicit log name and branch,
    /// for running several stores under one transaction manager.
    pub fn open_named(
        dir: &Path,
        config: &StoreConfig,
        name: &str,
        branch: BranchId,
    ) -> XaResult<Self> {
        if config.read_only {
            return Err(XaError::Illegal("a read-only store cannot be a data source"));
        }
        let factory = StoreFactory::new(config.clone());
        let store = if StoreFactory::store_exists(dir) {
            factory.open(dir)?
        } else {
            factory.create(dir)?
        };
        let store = Arc::new(store);
        store.set_recovery_mode(true);
        let lock = Arc::new(DataSourceLock::new());
        let manager = match XaResourceManager::open(
            name,
            branch,
            dir,
            Arc::new(StoreTxFactory::new(Arc::clone(&store))),
            Arc::clone(&lock),
            LogOptions::from_config(config),
        ) {
            Ok(manager) => manager,
            Err(err) => {
                if let Err(close_err) = store.close() {
                    warn!(error = %close_err, "xa.data_source.open.unwind_failed");
                }
                return Err(err);
            }
        };
        info!(
            dir = %dir.display(),
            name,
            replayed = manager.recovery_report().replayed,
            dangling = manager.recovery_report().dangling,
            "xa.data_source.open"
        );
        Ok(Self {
            name: name.to_string(),
            branch,
            store,
            lock,
            manager: Arc::new(manager),
            closed: AtomicBool::new(false),
        })
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Lock serializing commits against readers.
    pub fn lock(&self) -> &Arc<DataSourceLock> {
        &self.lock
    }

    /// Resource manager of this source.
    pub fn resource_manager(&self) -> &Arc<XaResourceManager<StoreTxFactory>> {
        &self.manager
    }

    /// Counts from the log scan at open.
    pub fn recovery_report(&self) -> &RecoveryReport {
        self.manager.recovery_report()
    }

    /// Counters of the active log segment.
    pub fn log_stats(&self) -> Option<LogStats> {
        self.manager.log_stats()
    }

    /// A typed connection to the store.
    pub fn connection(&self) -> StoreConnection {
        StoreConnection {
            manager: Arc::clone(&self.manager),
            tx: None,
        }
    }

    fn close_inner(&self) -> XaResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let log_result = self.manager.close();
        if let Err(err) = &log_result {
            warn!(error = %err, "xa.data_source.close.log_failed");
        }
        let store_result: Result<()> = self.store.close();
        info!(name = %self.name, dir = %self.store.dir().display(), "xa.data_source.close");
        log_result?;
        Ok(store_result?)
    }
}

impl XaDataSource for StoreDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn branch_id(&self) -> BranchId {
        self.branch
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.manager.clone()
    }

    fn get_xa_connection(&self) -> Box<dyn XaConnection> {
        Box::new(self.connection())
    }

    fn get_and_set_new_version(&self) -> XaResult<u64> {
        self.manager.factory().get_and_set_new_version()
    }

    fn get_last_committed_tx(&self) -> XaResult<u64> {
        self.manager.factory().last_committed_tx()
    }

    fn rotate_logical_log(&self) -> XaResult<()> {
        self.manager.rotate()
    }

    fn close(&self) -> XaResult<()> {
        self.close_inner()
    }
}

/// Connection to the graph store, bound to at most one branch at a time.
pub struct StoreConnection {
    manager: Arc<XaResourceManager<StoreTxFactory>>,
    tx: Option<SharedTx<StoreTransaction>>,
}

impl StoreConnection {
    /// Binds the connection to branch `xid`, which must have been started.
    pub fn bind(&mut self, xid: Xid) -> XaResult<()> {
        self.tx = Some(self.manager.transaction(xid)?);
        Ok(())
    }

    /// Branch the connection is bound to.
    pub fn xid(&self) -> Option<Xid> {
        self.tx.as_ref().map(|tx| tx.lock().xid())
    }

    /// Runs `f` against the bound transaction while it is still active.
    pub fn with_tx<R>(&self, f: impl FnOnce(&mut StoreTransaction) -> Result<R>) -> XaResult<R> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(XaError::Illegal("connection is not bound to a transaction"))?;
        let mut guard = tx.lock();
        Ok(f(guard.applier_mut()?)?)
    }

    /// Runs `f` against a read-only view of the bound transaction.
    pub fn read_tx<R>(&self, f: impl FnOnce(&StoreTransaction) -> Result<R>) -> XaResult<R> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(XaError::Illegal("connection is not bound to a transaction"))?;
        let guard = tx.lock();
        Ok(f(guard.applier())?)
    }
}

impl XaConnection for StoreConnection {
    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.manager.clone()
    }
}
