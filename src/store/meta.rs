use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::store::common::{Store, StoreFile};
use crate::store::config::StoreConfig;
use crate::store::record::{MetaFormat, MetaRecord};
use crate::store::record_store::RecordStore;
use crate::types::Result;

/// Fixed slots of the meta store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum MetaSlot {
    /// Creation time in milliseconds since the epoch.
    CreationTime = 0,
    /// Random identifier chosen at creation.
    RandomId = 1,
    /// Current logical log version.
    LogVersion = 2,
    /// Last committed transaction id.
    LastCommittedTx = 3,
}

const SLOT_COUNT: u64 = 4;

/// Store-wide counters kept in fixed records.
pub struct MetaStore {
    records: RecordStore<MetaFormat>,
}

impl MetaStore {
    /// Creates the meta store with a fresh creation time and random id.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let values = [now, rand::random::<u64>(), 0, 0];
        let records: Vec<MetaRecord> = values
            .iter()
            .enumerate()
            .map(|(slot, value)| MetaRecord {
                id: slot as u64,
                in_use: true,
                value: *value,
            })
            .collect();
        RecordStore::<MetaFormat>::create_with(path, &records)
    }

    /// Opens the meta store.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            records: RecordStore::open(path, config)?,
        })
    }

    /// Value of `slot`.
    pub fn get(&self, slot: MetaSlot) -> Result<u64> {
        Ok(self.records.get_raw(slot as u64)?.value)
    }

    /// Overwrites `slot`.
    pub fn set(&self, slot: MetaSlot, value: u64) -> Result<()> {
        let record = MetaRecord {
            id: slot as u64,
            in_use: true,
            value,
        };
        self.records.update_record(&record)
    }

    /// Creation time in milliseconds since the epoch.
    pub fn creation_time(&self) -> Result<u64> {
        self.get(MetaSlot::CreationTime)
    }

    /// Random store identifier.
    pub fn random_id(&self) -> Result<u64> {
        self.get(MetaSlot::RandomId)
    }

    /// Current logical log version.
    pub fn log_version(&self) -> Result<u64> {
        self.get(MetaSlot::LogVersion)
    }

    /// Advances the log version and returns the previous one.
    pub fn increment_log_version(&self) -> Result<u64> {
        let current = self.log_version()?;
        self.set(MetaSlot::LogVersion, current + 1)?;
        Ok(current)
    }

    /// Last committed transaction id.
    pub fn last_committed_tx(&self) -> Result<u64> {
        self.get(MetaSlot::LastCommittedTx)
    }

    /// Records `tx_id` as committed if it is newer than the stored value.
    pub fn set_last_committed_tx(&self, tx_id: u64) -> Result<()> {
        if tx_id > self.last_committed_tx()? {
            self.set(MetaSlot::LastCommittedTx, tx_id)?;
        }
        Ok(())
    }

    /// Number of fixed slots.
    pub fn slot_count() -> u64 {
        SLOT_COUNT
    }
}

impl Store for MetaStore {
    fn file(&self) -> &StoreFile {
        self.records.file()
    }
}
