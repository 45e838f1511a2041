//! Free-id tracking for a record store, persisted in a `.id` sidecar.
//!
//! Sidecar layout: `[sticky u8][high_id u64]` followed by every free id as a
//! big-endian `u64`. The sticky byte is `1` while a generator has the file
//! open and `0` after a clean close, so a sticky file means the previous run
//! crashed and the free set cannot be trusted.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::types::{Result, StoreError};

const HEADER_LEN: usize = 9;
const STICKY_OPEN: u8 = 1;
const STICKY_CLEAN: u8 = 0;

/// Records scanned between progress events during a rebuild.
pub const REBUILD_PROGRESS_INTERVAL: u64 = 50_000;

/// How [`IdGenerator::rebuild`] reconstructs state from in-use bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RebuildMode {
    /// Visit every record; every unused slot below the high id becomes free.
    Full,
    /// Scan backward to the last in-use record and set the high id after it.
    /// Slots below that record are not visited and none are marked free.
    Fast,
}

/// Allocator of record ids for one store.
pub struct IdGenerator {
    path: PathBuf,
    io: StdFileIo,
    max_id: u64,
    high_id: u64,
    free: BTreeSet<u64>,
    defragged: u64,
    closed: bool,
}

impl IdGenerator {
    /// Writes a fresh, cleanly closed sidecar with the given high id.
    /// Fails if the file already exists.
    pub fn create(path: impl AsRef<Path>, high_id: u64) -> Result<()> {
        let io = StdFileIo::create_new(path.as_ref())?;
        io.write_at(0, &encode(STICKY_CLEAN, high_id, std::iter::empty()))?;
        io.sync_all()
    }

    /// Opens a sidecar and marks it sticky until [`IdGenerator::close`].
    ///
    /// `max_id` is the exclusive upper bound on issued ids.
    pub fn open(path: impl AsRef<Path>, max_id: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let invalid = |reason| StoreError::InvalidIdGenerator {
            path: path.clone(),
            reason,
        };
        let io = match StdFileIo::open_existing(&path, false) {
            Ok(io) => io,
            Err(StoreError::NotFound) => return Err(invalid("missing")),
            Err(err) => return Err(err),
        };
        let len = io.len()? as usize;
        if len < HEADER_LEN {
            return Err(invalid("truncated header"));
        }
        if (len - HEADER_LEN) % 8 != 0 {
            return Err(invalid("misaligned free list"));
        }
        let mut buf = vec![0u8; len];
        io.read_at(0, &mut buf)?;
        match buf[0] {
            STICKY_CLEAN => {}
            STICKY_OPEN => return Err(invalid("not cleanly closed")),
            _ => return Err(invalid("unknown sticky byte")),
        }
        let high_id = u64_at(&buf, 1);
        if high_id > max_id {
            return Err(invalid("high id beyond capacity"));
        }
        let mut free = BTreeSet::new();
        for chunk in buf[HEADER_LEN..].chunks_exact(8) {
            let id = u64_at(chunk, 0);
            if id >= high_id {
                return Err(invalid("free id at or above high id"));
            }
            if !free.insert(id) {
                return Err(invalid("duplicate free id"));
            }
        }
        io.write_at(0, &[STICKY_OPEN])?;
        io.sync_all()?;
        debug!(
            path = %path.display(),
            high_id,
            free = free.len(),
            "store.id_generator.open"
        );
        Ok(Self {
            path,
            io,
            max_id,
            high_id,
            free,
            defragged: 0,
            closed: false,
        })
    }

    /// Reconstructs a generator from the in-use bits of `record_count`
    /// records and writes a new sidecar, replacing any existing one.
    pub fn rebuild<F>(
        path: impl AsRef<Path>,
        max_id: u64,
        mode: RebuildMode,
        record_count: u64,
        mut in_use: F,
    ) -> Result<Self>
    where
        F: FnMut(u64) -> Result<bool>,
    {
        let path = path.as_ref();
        let mut high_id = 0u64;
        let mut free = Vec::new();
        match mode {
            RebuildMode::Full => {
                let mut gaps = Vec::new();
                for id in 0..record_count {
                    if in_use(id)? {
                        high_id = id + 1;
                        free.append(&mut gaps);
                    } else {
                        gaps.push(id);
                    }
                    if (id + 1) % REBUILD_PROGRESS_INTERVAL == 0 {
                        info!(
                            path = %path.display(),
                            scanned = id + 1,
                            total = record_count,
                            "store.rebuild_id_generator.progress"
                        );
                    }
                }
            }
            RebuildMode::Fast => {
                let mut id = record_count;
                while id > 0 {
                    id -= 1;
                    if in_use(id)? {
                        high_id = id + 1;
                        break;
                    }
                }
            }
        }
        if high_id > max_id {
            return Err(StoreError::InvalidIdGenerator {
                path: path.to_path_buf(),
                reason: "rebuilt high id beyond capacity",
            });
        }
        let io = StdFileIo::open(path)?;
        let bytes = encode(STICKY_CLEAN, high_id, free.iter().copied());
        io.write_at(0, &bytes)?;
        io.truncate(bytes.len() as u64)?;
        io.sync_all()?;
        info!(
            path = %path.display(),
            ?mode,
            high_id,
            free = free.len(),
            "store.rebuild_id_generator.done"
        );
        drop(io);
        Self::open(path, max_id)
    }

    /// Returns the lowest freed id, or the high id which then advances.
    pub fn next_id(&mut self) -> Result<u64> {
        self.ensure_open()?;
        if let Some(id) = self.free.pop_first() {
            self.defragged += 1;
            return Ok(id);
        }
        if self.high_id >= self.max_id {
            return Err(StoreError::InvalidOwned(format!(
                "id capacity {} exhausted for {}",
                self.max_id,
                self.path.display()
            )));
        }
        let id = self.high_id;
        self.high_id += 1;
        Ok(id)
    }

    /// Makes `id` available for reuse.
    pub fn free_id(&mut self, id: u64) -> Result<()> {
        self.ensure_open()?;
        if id >= self.high_id {
            return Err(StoreError::InvalidOwned(format!(
                "free of id {id} at or above high id {}",
                self.high_id
            )));
        }
        if !self.free.insert(id) {
            return Err(StoreError::InvalidOwned(format!("id {id} already free")));
        }
        Ok(())
    }

    /// Forces the high id. Free ids at or above it are forgotten.
    pub fn set_high_id(&mut self, high_id: u64) -> Result<()> {
        self.ensure_open()?;
        if high_id > self.max_id {
            return Err(StoreError::Invalid("high id beyond capacity"));
        }
        self.high_id = high_id;
        self.free.split_off(&high_id);
        Ok(())
    }

    /// Marks `id` as used without issuing it: raises the high id past it and
    /// removes it from the free set. Used while replaying the log.
    pub fn mark_used(&mut self, id: u64) -> Result<()> {
        self.ensure_open()?;
        if id >= self.high_id {
            if id >= self.max_id {
                return Err(StoreError::Invalid("id beyond capacity"));
            }
            for gap in self.high_id..id {
                self.free.insert(gap);
            }
            self.high_id = id + 1;
        } else {
            self.free.remove(&id);
        }
        Ok(())
    }

    /// Brings the generator in line with a record just written: an in-use
    /// id leaves the free set, an unused one below the high id joins it.
    /// Writing the same record twice leaves the generator as the first
    /// write did.
    pub fn reconcile(&mut self, id: u64, in_use: bool) -> Result<()> {
        if in_use {
            return self.mark_used(id);
        }
        self.ensure_open()?;
        if id < self.high_id {
            self.free.insert(id);
        }
        Ok(())
    }

    /// True if `id` is in the free set.
    pub fn is_free(&self, id: u64) -> bool {
        self.free.contains(&id)
    }

    /// First never-issued id.
    pub fn high_id(&self) -> u64 {
        self.high_id
    }

    /// Ids below the high id that are not free.
    pub fn number_of_ids_in_use(&self) -> u64 {
        self.high_id - self.free.len() as u64
    }

    /// Number of free ids.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Ids handed out again after being freed, since open.
    pub fn defragged_count(&self) -> u64 {
        self.defragged
    }

    /// Sidecar path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists the high id and free set and clears the sticky byte.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let bytes = encode(STICKY_CLEAN, self.high_id, self.free.iter().copied());
        self.io.write_at(0, &bytes)?;
        self.io.truncate(bytes.len() as u64)?;
        self.io.sync_all()?;
        self.closed = true;
        debug!(
            path = %self.path.display(),
            high_id = self.high_id,
            free = self.free.len(),
            "store.id_generator.close"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Invalid("id generator closed"));
        }
        Ok(())
    }
}

fn encode(sticky: u8, high_id: u64, free: impl Iterator<Item = u64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.push(sticky);
    out.extend_from_slice(&high_id.to_be_bytes());
    for id in free {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

fn u64_at(src: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(arr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MAX: u64 = u32::MAX as u64;

    #[test]
    fn reuses_lowest_freed_id_first() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 0)?;
        let mut ids = IdGenerator::open(&path, MAX)?;
        let issued: Vec<u64> = (0..5).map(|_| ids.next_id()).collect::<Result<_>>()?;
        assert_eq!(issued, vec![0, 1, 2, 3, 4]);
        ids.free_id(3)?;
        ids.free_id(1)?;
        assert_eq!(ids.next_id()?, 1);
        assert_eq!(ids.next_id()?, 3);
        assert_eq!(ids.next_id()?, 5);
        assert_eq!(ids.defragged_count(), 2);
        Ok(())
    }

    #[test]
    fn free_rejects_unissued_and_double_free() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 2)?;
        let mut ids = IdGenerator::open(&path, MAX)?;
        assert!(ids.free_id(2).is_err());
        ids.free_id(0)?;
        assert!(ids.free_id(0).is_err());
        Ok(())
    }

    #[test]
    fn reconcile_twice_matches_reconcile_once() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 0)?;
        let mut ids = IdGenerator::open(&path, MAX)?;
        for _ in 0..3 {
            ids.next_id()?;
        }
        ids.reconcile(1, false)?;
        ids.reconcile(1, false)?;
        assert!(ids.is_free(1));
        assert_eq!(ids.free_count(), 1);

        ids.reconcile(1, true)?;
        assert!(!ids.is_free(1));
        ids.reconcile(5, true)?;
        assert_eq!(ids.high_id(), 6);
        assert!(ids.is_free(3) && ids.is_free(4));
        assert_eq!(ids.next_id()?, 3);
        Ok(())
    }

    #[test]
    fn clean_close_persists_and_sticky_open_is_invalid() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 0)?;
        let mut ids = IdGenerator::open(&path, MAX)?;
        for _ in 0..4 {
            ids.next_id()?;
        }
        ids.free_id(2)?;
        ids.close()?;

        let mut reopened = IdGenerator::open(&path, MAX)?;
        assert_eq!(reopened.high_id(), 4);
        assert_eq!(reopened.number_of_ids_in_use(), 3);
        // Dropped without close: the sidecar stays sticky.
        let _ = reopened.next_id()?;
        drop(reopened);
        let err = IdGenerator::open(&path, MAX).err().expect("sticky file rejected");
        assert!(matches!(
            err,
            StoreError::InvalidIdGenerator { reason: "not cleanly closed", .. }
        ));
        Ok(())
    }

    #[test]
    fn corrupt_sidecars_are_invalid() -> Result<()> {
        let dir = tempdir().unwrap();
        let missing = IdGenerator::open(dir.path().join("none.id"), MAX);
        assert!(matches!(missing, Err(StoreError::InvalidIdGenerator { .. })));

        let path = dir.path().join("bad.id");
        let io = StdFileIo::open(&path)?;
        io.write_at(0, &encode(STICKY_CLEAN, 2, [5u64].into_iter()))?;
        let err = IdGenerator::open(&path, MAX).err().expect("free id >= high");
        assert!(matches!(err, StoreError::InvalidIdGenerator { .. }));

        io.truncate(HEADER_LEN as u64 + 3)?;
        let err = IdGenerator::open(&path, MAX).err().expect("misaligned");
        assert!(matches!(
            err,
            StoreError::InvalidIdGenerator { reason: "misaligned free list", .. }
        ));
        Ok(())
    }

    #[test]
    fn full_rebuild_collects_gaps_below_last_used() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        let used = [0u64, 2, 4];
        let mut ids =
            IdGenerator::rebuild(&path, MAX, RebuildMode::Full, 7, |id| Ok(used.contains(&id)))?;
        assert_eq!(ids.high_id(), 5);
        assert_eq!(ids.free_count(), 2);
        assert_eq!(ids.next_id()?, 1);
        assert_eq!(ids.next_id()?, 3);
        assert_eq!(ids.next_id()?, 5);
        Ok(())
    }

    #[test]
    fn fast_rebuild_only_finds_high_id() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        let used = [0u64, 2, 4];
        let mut scanned = Vec::new();
        let ids = IdGenerator::rebuild(&path, MAX, RebuildMode::Fast, 7, |id| {
            scanned.push(id);
            Ok(used.contains(&id))
        })?;
        assert_eq!(ids.high_id(), 5);
        assert_eq!(ids.free_count(), 0);
        assert_eq!(scanned, vec![6, 5, 4]);
        Ok(())
    }

    #[test]
    fn capacity_is_enforced() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 0)?;
        let mut ids = IdGenerator::open(&path, 2)?;
        ids.next_id()?;
        ids.next_id()?;
        assert!(ids.next_id().is_err());
        Ok(())
    }

    #[test]
    fn mark_used_extends_high_id_with_gaps() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.id");
        IdGenerator::create(&path, 1)?;
        let mut ids = IdGenerator::open(&path, MAX)?;
        ids.mark_used(4)?;
        assert_eq!(ids.high_id(), 5);
        assert_eq!(ids.free_count(), 3);
        ids.mark_used(2)?;
        assert_eq!(ids.next_id()?, 1);
        assert_eq!(ids.next_id()?, 3);
        ids.set_high_id(2)?;
        assert_eq!(ids.free_count(), 0);
        Ok(())
    }
}
