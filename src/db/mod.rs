//! The embedding facade: one graph store data source under a transaction
//! manager, opened, recovered and closed together.

mod transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::primitives::log::LogStats;
use crate::store::config::StoreConfig;
use crate::store::graph_store::{GraphStore, GraphStoreStats};
use crate::store::property::PropertyValue;
use crate::store::record::{NodeRecord, RelationshipRecord};
use crate::txn::manager::{TmRecoveryReport, TxManager};
use crate::txn::registry::DataSourceManager;
use crate::types::{NodeId, PropertyKeyId, RelId, RelTypeId, Result};
use crate::xa::data_source::{StoreDataSource, XaDataSource};
use crate::xa::error::XaResult;
use crate::xa::resource_manager::RecoveryReport;
use crate::xa::write_transaction::PropertyOwner;

pub use transaction::DbTransaction;

/// Snapshot of the database counters.
#[derive(Clone, Debug, Serialize)]
pub struct DatabaseStats {
    /// Per-store snapshots.
    pub store: GraphStoreStats,
    /// Active logical log segment, if open.
    pub logical_log: Option<LogStats>,
    /// Transaction manager log.
    pub tm_log: LogStats,
    /// Logical log scan at open.
    pub recovery: RecoveryReport,
    /// Dangling branches resolved at open.
    pub tm_recovery: TmRecoveryReport,
    /// Last committed transaction id.
    pub last_committed_tx: u64,
}

/// A graph database.
///
/// Opening replays the logical log and resolves every transaction a crash
/// left prepared before any new transaction can begin. A database dropped
/// without [`Database::close`] is recovered the same way on the next open.
///
/// # Example
///
/// ```rust,no_run
/// use recstore::{Database, StoreConfig};
/// use recstore::xa::PropertyOwner;
///
/// let db = Database::open("graph-dir", StoreConfig::default())?;
/// let mut tx = db.begin()?;
/// let alice = tx.create_node()?;
/// let bob = tx.create_node()?;
/// tx.create_relationship(alice, bob, "KNOWS")?;
/// tx.set_property(PropertyOwner::Node(alice), "name", "Alice".into())?;
/// tx.commit()?;
/// db.close()?;
/// # Ok::<(), recstore::XaError>(())
/// ```
pub struct Database {
    dir: PathBuf,
    source: Arc<StoreDataSource>,
    tm: TxManager,
    tm_recovery: TmRecoveryReport,
    closed: AtomicBool,
}

impl Database {
    /// Creates or opens the database in `dir` and recovers it.
    pub fn open(dir: impl AsRef<Path>, config: StoreConfig) -> XaResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let source = Arc::new(StoreDataSource::open(&dir, &config)?);
        match Self::start_manager(&dir, &source, &config) {
            Ok((tm, tm_recovery)) => {
                info!(
                    dir = %dir.display(),
                    replayed = source.recovery_report().replayed,
                    committed = tm_recovery.committed,
                    rolled_back = tm_recovery.rolled_back,
                    "db.open"
                );
                Ok(Self {
                    dir,
                    source,
                    tm,
                    tm_recovery,
                    closed: AtomicBool::new(false),
                })
            }
            Err(err) => {
                if let Err(close_err) = source.close() {
                    warn!(error = %close_err, "db.open.unwind_failed");
                }
                Err(err)
            }
        }
    }

    fn start_manager(
        dir: &Path,
        source: &Arc<StoreDataSource>,
        config: &StoreConfig,
    ) -> XaResult<(TxManager, TmRecoveryReport)> {
        let registry = Arc::new(DataSourceManager::new());
        registry.register(Arc::clone(source) as Arc<dyn XaDataSource>)?;
        let tm = TxManager::open(dir, registry, config.synchronous)?;
        let report = tm.recover()?;
        Ok((tm, report))
    }

    /// Database directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The store data source.
    pub fn data_source(&self) -> &Arc<StoreDataSource> {
        &self.source
    }

    /// The underlying store. Reads through it bypass the data source lock.
    pub fn store(&self) -> &Arc<GraphStore> {
        self.source.store()
    }

    /// The transaction manager.
    pub fn tx_manager(&self) -> &TxManager {
        &self.tm
    }

    /// Starts a transaction enlisted on the store.
    pub fn begin(&self) -> XaResult<DbTransaction<'_>> {
        DbTransaction::begin(self)
    }

    fn read<R>(&self, f: impl FnOnce(&GraphStore) -> Result<R>) -> Result<R> {
        let _guard = self.source.lock().read();
        f(self.source.store())
    }

    /// Committed node `id`.
    pub fn node(&self, id: NodeId) -> Result<NodeRecord> {
        self.read(|store| store.load_node(id))
    }

    /// Committed relationship `id`.
    pub fn relationship(&self, id: RelId) -> Result<RelationshipRecord> {
        self.read(|store| store.load_relationship(id))
    }

    /// Committed relationships of `node`, head of the chain first.
    pub fn relationships_of(&self, node: NodeId) -> Result<Vec<RelationshipRecord>> {
        self.read(|store| store.relationship_chain(node))
    }

    /// Committed properties of `owner` by key name, newest first.
    pub fn properties(&self, owner: PropertyOwner) -> Result<Vec<(String, PropertyValue)>> {
        self.read(|store| {
            let head = match owner {
                PropertyOwner::Node(id) => store.load_node(id)?.next_prop,
                PropertyOwner::Relationship(id) => store.load_relationship(id)?.next_prop,
            };
            store
                .property_chain(head)?
                .iter()
                .map(|record| {
                    Ok((
                        store.property_key_name(record.key)?,
                        store.property_value(record)?,
                    ))
                })
                .collect()
        })
    }

    /// Committed value of the property called `key` on `owner`.
    pub fn property(&self, owner: PropertyOwner, key: &str) -> Result<Option<PropertyValue>> {
        Ok(self
            .properties(owner)?
            .into_iter()
            .find_map(|(name, value)| (name == key).then_some(value)))
    }

    /// Every property key.
    pub fn property_keys(&self) -> Result<Vec<(PropertyKeyId, String)>> {
        self.read(|store| store.all_property_keys())
    }

    /// Every relationship type.
    pub fn relationship_types(&self) -> Result<Vec<(RelTypeId, String)>> {
        self.read(|store| store.all_rel_types())
    }

    /// Last committed transaction id.
    pub fn last_committed_tx(&self) -> XaResult<u64> {
        self.source.get_last_committed_tx()
    }

    /// Archives the active logical log segment and starts a new one.
    pub fn rotate_logical_log(&self) -> XaResult<()> {
        self.source.rotate_logical_log()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> XaResult<DatabaseStats> {
        Ok(DatabaseStats {
            store: self.source.store().stats(),
            logical_log: self.source.log_stats(),
            tm_log: self.tm.log_stats(),
            recovery: self.source.recovery_report().clone(),
            tm_recovery: self.tm_recovery.clone(),
            last_committed_tx: self.last_committed_tx()?,
        })
    }

    /// Closes the transaction manager log, then the data source. Later
    /// calls are no-ops.
    pub fn close(&self) -> XaResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let tm_result = self.tm.close();
        if let Err(err) = &tm_result {
            warn!(error = %err, "db.close.tm_failed");
        }
        self.source.close()?;
        info!(dir = %self.dir.display(), "db.close");
        tm_result
    }
}
