use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::xa::data_source::XaDataSource;
use crate::xa::error::{XaError, XaResult};
use crate::xa::xid::BranchId;

/// Registry of the data sources the transaction manager coordinates, keyed
/// by name. Names and branch ids are unique.
#[derive(Default)]
pub struct DataSourceManager {
    sources: RwLock<BTreeMap<String, Arc<dyn XaDataSource>>>,
}

impl DataSourceManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `source`.
    pub fn register(&self, source: Arc<dyn XaDataSource>) -> XaResult<()> {
        let mut sources = self.sources.write();
        if sources.contains_key(source.name()) {
            return Err(XaError::Illegal("data source name already registered"));
        }
        if sources.values().any(|s| s.branch_id() == source.branch_id()) {
            return Err(XaError::Illegal("data source branch already registered"));
        }
        debug!(name = source.name(), branch = %source.branch_id(), "tm.registry.register");
        sources.insert(source.name().to_string(), source);
        Ok(())
    }

    /// Removes and returns the source called `name`.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn XaDataSource>> {
        let removed = self.sources.write().remove(name);
        if removed.is_some() {
            debug!(name, "tm.registry.unregister");
        }
        removed
    }

    /// Source called `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn XaDataSource>> {
        self.sources.read().get(name).cloned()
    }

    /// Source owning `branch`.
    pub fn by_branch(&self, branch: BranchId) -> Option<Arc<dyn XaDataSource>> {
        self.sources
            .read()
            .values()
            .find(|s| s.branch_id() == branch)
            .cloned()
    }

    /// Every source, in name order.
    pub fn all(&self) -> Vec<Arc<dyn XaDataSource>> {
        self.sources.read().values().cloned().collect()
    }

    /// Number of registered sources.
    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
