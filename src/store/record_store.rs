use std::marker::PhantomData;
use std::path::Path;

use crate::store::common::{Store, StoreFile};
use crate::store::config::StoreConfig;
use crate::store::record::RecordFormat;
use crate::types::{Result, StoreError};

/// Store of fixed-size records of one [`RecordFormat`].
pub struct RecordStore<F: RecordFormat> {
    file: StoreFile,
    _format: PhantomData<fn() -> F>,
}

impl<F: RecordFormat> RecordStore<F> {
    /// Creates an empty store file and its id sidecar.
    pub fn create(path: impl AsRef<Path>) -> Result<()> {
        StoreFile::create_storage(path, F::TYPE_DESCRIPTOR, F::RECORD_SIZE, &[])
    }

    /// Creates a store file pre-filled with `records`, which must be the
    /// records for ids `0..records.len()` in order.
    pub fn create_with(path: impl AsRef<Path>, records: &[F::Record]) -> Result<()> {
        let mut bytes = vec![0u8; records.len() * F::RECORD_SIZE];
        for (slot, record) in records.iter().enumerate() {
            if F::id(record).into() != slot as u64 {
                return Err(StoreError::Invalid("initial records must be in id order"));
            }
            let start = slot * F::RECORD_SIZE;
            F::encode(record, &mut bytes[start..start + F::RECORD_SIZE]);
        }
        StoreFile::create_storage(path, F::TYPE_DESCRIPTOR, F::RECORD_SIZE, &bytes)
    }

    /// Opens an existing store.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            file: StoreFile::open_storage(path, F::TYPE_DESCRIPTOR, F::RECORD_SIZE, config)?,
            _format: PhantomData,
        })
    }

    /// Issues an id for a new record. Nothing is written until the record is
    /// updated.
    pub fn next_id(&self) -> Result<F::Id> {
        self.file.next_id().map(F::Id::from)
    }

    /// Returns an id issued by [`RecordStore::next_id`] that was never used.
    pub fn free_id(&self, id: F::Id) -> Result<()> {
        self.file.free_id(id.into())
    }

    /// Decodes record `id` whatever its in-use flag.
    pub fn get_raw(&self, id: F::Id) -> Result<F::Record> {
        let mut buf = vec![0u8; F::RECORD_SIZE];
        self.file.read_raw(id.into(), &mut buf)?;
        F::decode(id, &buf)
    }

    /// Record `id`, or [`StoreError::NotFound`] if not in use.
    pub fn get_record(&self, id: F::Id) -> Result<F::Record> {
        self.get_record_if_in_use(id)?.ok_or(StoreError::NotFound)
    }

    /// Record `id` if it is in use.
    pub fn get_record_if_in_use(&self, id: F::Id) -> Result<Option<F::Record>> {
        if id.into() >= self.file.high_id()? {
            return Ok(None);
        }
        let record = self.get_raw(id)?;
        Ok(F::in_use(&record).then_some(record))
    }

    /// Writes `record`. A record written as not in use gives its id back to
    /// the id generator, one written in use takes it out of the free set.
    pub fn update_record(&self, record: &F::Record) -> Result<()> {
        let id = F::id(record).into();
        let mut buf = vec![0u8; F::RECORD_SIZE];
        F::encode(record, &mut buf);
        self.file.write_raw(id, &buf)?;
        self.file.reconcile_id(id, F::in_use(record))
    }

    /// Writes `record` during log replay. Tolerates records already applied
    /// and keeps the id generator consistent with the in-use flag.
    pub fn update_record_recovered(&self, record: &F::Record) -> Result<()> {
        let id = F::id(record).into();
        let mut buf = vec![0u8; F::RECORD_SIZE];
        F::encode(record, &mut buf);
        self.file.write_raw(id, &buf)?;
        self.file.note_recovered(id, F::in_use(record))
    }

    /// High id of the store.
    pub fn high_id(&self) -> Result<u64> {
        self.file.high_id()
    }
}

impl<F: RecordFormat> Store for RecordStore<F> {
    fn file(&self) -> &StoreFile {
        &self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::common::id_file_path;
    use crate::store::record::{NodeFormat, NodeRecord};
    use crate::types::{NodeId, RelId};
    use tempfile::tempdir;

    #[test]
    fn records_survive_close_and_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        RecordStore::<NodeFormat>::create(&path)?;
        let cfg = StoreConfig::default();
        let store = RecordStore::<NodeFormat>::open(&path, &cfg)?;
        let id = store.next_id()?;
        let rec = NodeRecord {
            next_rel: Some(RelId(4)),
            ..NodeRecord::new(id)
        };
        store.update_record(&rec)?;
        assert_eq!(store.get_record(id)?, rec);
        store.close()?;

        let len = std::fs::metadata(&path)?.len();
        assert_eq!(len, 9 + "NodeStore v0.1".len() as u64);

        let store = RecordStore::<NodeFormat>::open(&path, &cfg)?;
        assert!(store.is_store_ok());
        assert_eq!(store.get_record(id)?, rec);
        assert!(matches!(store.get_record(NodeId(1)), Err(StoreError::NotFound)));
        store.close()?;
        Ok(())
    }

    #[test]
    fn deleting_a_record_frees_its_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        RecordStore::<NodeFormat>::create(&path)?;
        let store = RecordStore::<NodeFormat>::open(&path, &StoreConfig::default())?;
        let a = store.next_id()?;
        let b = store.next_id()?;
        store.update_record(&NodeRecord::new(a))?;
        store.update_record(&NodeRecord::new(b))?;
        store.update_record(&NodeRecord {
            in_use: false,
            ..NodeRecord::new(a)
        })?;
        assert_eq!(store.get_record_if_in_use(a)?, None);
        assert_eq!(store.next_id()?, a);
        store.close()
    }

    #[test]
    fn rewriting_a_record_keeps_the_free_set_consistent() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        RecordStore::<NodeFormat>::create(&path)?;
        let store = RecordStore::<NodeFormat>::open(&path, &StoreConfig::default())?;
        let a = store.next_id()?;
        let b = store.next_id()?;
        store.update_record(&NodeRecord::new(a))?;
        store.update_record(&NodeRecord::new(b))?;
        let gone = NodeRecord {
            in_use: false,
            ..NodeRecord::new(a)
        };
        store.update_record(&gone)?;
        store.update_record(&gone)?;
        assert_eq!(store.stats().free_ids, Some(1));

        // An in-use image of a freed id takes the id back.
        store.update_record(&NodeRecord::new(a))?;
        assert!(!store.file().is_id_free(a.into()));
        assert_eq!(store.next_id()?, NodeId(2));
        store.close()
    }

    #[test]
    fn missing_sidecar_marks_store_not_ok_until_repaired() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        RecordStore::<NodeFormat>::create(&path)?;
        let cfg = StoreConfig::default().rebuild_id_generators_fast(false);
        let store = RecordStore::<NodeFormat>::open(&path, &cfg)?;
        for _ in 0..5 {
            let id = store.next_id()?;
            store.update_record(&NodeRecord::new(id))?;
        }
        for id in [1u64, 3] {
            store.update_record(&NodeRecord {
                in_use: false,
                ..NodeRecord::new(NodeId(id))
            })?;
        }
        store.close()?;
        std::fs::remove_file(id_file_path(&path))?;

        let store = RecordStore::<NodeFormat>::open(&path, &cfg)?;
        assert!(!store.is_store_ok());
        assert!(matches!(store.next_id(), Err(StoreError::NotOk(_))));
        store.make_store_ok()?;
        assert!(store.is_store_ok());
        let stats = store.stats();
        assert_eq!(stats.high_id, Some(5));
        assert_eq!(stats.free_ids, Some(2));
        assert_eq!(store.next_id()?, NodeId(1));
        assert_eq!(store.next_id()?, NodeId(3));
        store.close()
    }

    #[test]
    fn read_only_store_rejects_writes_and_rebuilds() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes");
        RecordStore::<NodeFormat>::create_with(&path, &[NodeRecord::new(NodeId(0))])?;
        let cfg = StoreConfig::default().read_only(true);
        let store = RecordStore::<NodeFormat>::open(&path, &cfg)?;
        assert!(store.get_record(NodeId(0))?.in_use);
        assert_eq!(store.high_id()?, 1);
        assert!(matches!(
            store.update_record(&NodeRecord::new(NodeId(0))),
            Err(StoreError::ReadOnly(_))
        ));
        assert!(matches!(store.rebuild_id_generator(), Err(StoreError::ReadOnly(_))));
        store.close()
    }
}
