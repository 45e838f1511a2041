//! Lifecycle shared by every record store: file creation, locking,
//! descriptor verification, id generator ownership and close.
//!
//! A store file is a run of fixed-size records followed by the descriptor
//! `"<TypeDescriptor> <version>"`. A writable open strips the descriptor and
//! close writes it back at `high_id * record_size`, so a file found without
//! its descriptor was not closed cleanly.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::concurrency::FileLock;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::window::{WindowPool, WindowPoolOptions, WindowPoolStats};
use crate::store::config::StoreConfig;
use crate::store::id_generator::{IdGenerator, RebuildMode};
use crate::store::record::{raw_in_use, STORE_VERSION};
use crate::types::{Result, StoreError, LINK_ID_LIMIT};

/// Longest descriptor tail inspected when looking for an older version.
const DESCRIPTOR_PROBE_LEN: u64 = 64;

/// Sidecar path of a store file: the store path with `.id` appended.
pub fn id_file_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".id");
    PathBuf::from(os)
}

/// Full trailing descriptor written by this build for `type_descriptor`.
pub fn descriptor_for(type_descriptor: &str) -> String {
    format!("{type_descriptor} {STORE_VERSION}")
}

/// Outcome of [`verify_correct_type_descriptor_and_version`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DescriptorCheck {
    /// The exact descriptor of this build ends the file.
    Current,
    /// Same type descriptor, different version.
    NeedsUpgrade {
        /// Descriptor found at the end of the file.
        found: String,
    },
    /// No recognizable descriptor; the store was not closed cleanly or the
    /// file is damaged.
    Unrecognized,
}

/// Inspects the trailing descriptor of a store file.
pub fn verify_correct_type_descriptor_and_version(
    io: &dyn FileIo,
    type_descriptor: &str,
) -> Result<DescriptorCheck> {
    let expected = descriptor_for(type_descriptor);
    let len = io.len()?;
    let expected_len = expected.len() as u64;
    if len >= expected_len {
        let mut tail = vec![0u8; expected.len()];
        io.read_at(len - expected_len, &mut tail)?;
        if tail == expected.as_bytes() {
            return Ok(DescriptorCheck::Current);
        }
    }
    let probe = len.min(DESCRIPTOR_PROBE_LEN);
    let mut tail = vec![0u8; probe as usize];
    io.read_at(len - probe, &mut tail)?;
    let prefix = format!("{type_descriptor} ");
    if let Some(pos) = find_last(&tail, prefix.as_bytes()) {
        let version = &tail[pos + prefix.len()..];
        let plausible = !version.is_empty()
            && version
                .iter()
                .all(|b| b.is_ascii_graphic() && *b != b' ');
        if plausible {
            return Ok(DescriptorCheck::NeedsUpgrade {
                found: String::from_utf8_lossy(&tail[pos..]).into_owned(),
            });
        }
    }
    Ok(DescriptorCheck::Unrecognized)
}

fn find_last(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Snapshot of one store's state.
#[derive(Clone, Debug, Serialize)]
pub struct StoreStats {
    /// Store file.
    pub path: PathBuf,
    /// Type descriptor.
    pub type_descriptor: &'static str,
    /// Record size in bytes.
    pub record_size: usize,
    /// High id, when the id generator is loaded.
    pub high_id: Option<u64>,
    /// Ids in use, when the id generator is loaded.
    pub ids_in_use: Option<u64>,
    /// Free ids, when the id generator is loaded.
    pub free_ids: Option<usize>,
    /// Whether the store is ok.
    pub store_ok: bool,
    /// Window pool counters.
    pub windows: WindowPoolStats,
}

/// One open store file: records, window pool, lock and id generator.
pub struct StoreFile {
    path: PathBuf,
    id_path: PathBuf,
    type_descriptor: &'static str,
    record_size: usize,
    read_only: bool,
    backup_replica: bool,
    fast_rebuild: bool,
    close_retries: u32,
    /// Length of the record region found at open.
    open_record_bytes: u64,
    io: Arc<StdFileIo>,
    pool: WindowPool,
    lock: Mutex<Option<FileLock>>,
    ids: Mutex<Option<IdGenerator>>,
    store_ok: AtomicBool,
    recovery_mode: AtomicBool,
    closed: AtomicBool,
}

impl StoreFile {
    /// Creates a store file holding `initial` (whole records) followed by the
    /// descriptor, plus a fresh id sidecar. Fails if the file exists.
    pub fn create_storage(
        path: impl AsRef<Path>,
        type_descriptor: &'static str,
        record_size: usize,
        initial: &[u8],
    ) -> Result<()> {
        let path = path.as_ref();
        if initial.len() % record_size != 0 {
            return Err(StoreError::Invalid("initial content is not whole records"));
        }
        let io = StdFileIo::create_new(path)?;
        let descriptor = descriptor_for(type_descriptor);
        io.write_at(0, initial)?;
        io.write_at(initial.len() as u64, descriptor.as_bytes())?;
        io.sync_all()?;
        let id_path = id_file_path(path);
        if id_path.exists() {
            std::fs::remove_file(&id_path)?;
        }
        IdGenerator::create(&id_path, (initial.len() / record_size) as u64)?;
        info!(
            path = %path.display(),
            descriptor = %descriptor,
            "store.create"
        );
        Ok(())
    }

    /// Opens an existing store file.
    ///
    /// Lock contention fails immediately with [`StoreError::StoreLocked`]; an
    /// older descriptor fails with [`StoreError::NeedsUpgrade`]. A missing
    /// descriptor, misaligned size or unusable id sidecar leaves the store
    /// open but not ok.
    pub fn open_storage(
        path: impl AsRef<Path>,
        type_descriptor: &'static str,
        record_size: usize,
        config: &StoreConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io = Arc::new(StdFileIo::open_existing(&path, config.read_only)?);
        let lock = if config.read_only {
            None
        } else {
            Some(FileLock::try_acquire(io.file_handle(), &path)?)
        };
        let mut store_ok = true;
        let descriptor_len = descriptor_for(type_descriptor).len() as u64;
        let record_bytes = match verify_correct_type_descriptor_and_version(&*io, type_descriptor)? {
            DescriptorCheck::Current => {
                let records = io.len()? - descriptor_len;
                if !config.read_only {
                    io.truncate(records)?;
                }
                records
            }
            DescriptorCheck::NeedsUpgrade { found } => {
                return Err(StoreError::NeedsUpgrade {
                    path,
                    found,
                    expected: descriptor_for(type_descriptor),
                });
            }
            DescriptorCheck::Unrecognized => {
                warn!(path = %path.display(), "store.open.descriptor_missing");
                store_ok = false;
                io.len()?
            }
        };
        if record_bytes % record_size as u64 != 0 {
            warn!(
                path = %path.display(),
                len = record_bytes,
                record_size,
                "store.open.misaligned"
            );
            store_ok = false;
        }
        let id_path = id_file_path(&path);
        let ids = if config.read_only {
            None
        } else {
            match IdGenerator::open(&id_path, LINK_ID_LIMIT) {
                Ok(ids) => Some(ids),
                Err(StoreError::InvalidIdGenerator { path: bad, reason }) => {
                    warn!(
                        path = %bad.display(),
                        reason,
                        "store.open.invalid_id_generator"
                    );
                    store_ok = false;
                    None
                }
                Err(err) => return Err(err),
            }
        };
        // A generator loaded for a store that needs repair is not trusted;
        // make_store_ok rebuilds it.
        let ids = if store_ok { ids } else { None };
        let pool = WindowPool::new(
            io.clone(),
            WindowPoolOptions {
                record_size,
                window_bytes: config.window_bytes,
                memory_budget: config.mapped_memory,
                read_only: config.read_only,
            },
        )?;
        debug!(
            path = %path.display(),
            store_ok,
            read_only = config.read_only,
            "store.open"
        );
        Ok(Self {
            path,
            id_path,
            type_descriptor,
            record_size,
            read_only: config.read_only,
            backup_replica: config.backup_replica,
            fast_rebuild: config.rebuild_id_generators_fast,
            close_retries: config.close_retries.max(1),
            open_record_bytes: record_bytes,
            io,
            pool,
            lock: Mutex::new(lock),
            ids: Mutex::new(ids),
            store_ok: AtomicBool::new(store_ok),
            recovery_mode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Type descriptor of the store.
    pub fn type_descriptor(&self) -> &'static str {
        self.type_descriptor
    }

    /// Size of one record.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// True when opened without write access.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True unless the store needs repair.
    pub fn is_store_ok(&self) -> bool {
        self.store_ok.load(Ordering::Acquire)
    }

    /// Allows writes to a not-ok store while the log is replayed.
    pub fn set_recovery_mode(&self, on: bool) {
        self.recovery_mode.store(on, Ordering::Release);
    }

    /// True while the log is being replayed.
    pub fn is_in_recovery_mode(&self) -> bool {
        self.recovery_mode.load(Ordering::Acquire)
    }

    /// Fails unless writes are currently allowed.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly("store opened read-only"));
        }
        if !self.is_store_ok() && !self.is_in_recovery_mode() {
            return Err(StoreError::NotOk(self.path.clone()));
        }
        Ok(())
    }

    /// Issues a new record id.
    pub fn next_id(&self) -> Result<u64> {
        self.ensure_writable()?;
        let mut ids = self.ids.lock();
        match ids.as_mut() {
            Some(ids) => ids.next_id(),
            None => Err(StoreError::NotOk(self.path.clone())),
        }
    }

    /// Returns `id` to the free set.
    pub fn free_id(&self, id: u64) -> Result<()> {
        self.ensure_writable()?;
        let mut ids = self.ids.lock();
        match ids.as_mut() {
            Some(ids) => ids.free_id(id),
            None => Err(StoreError::NotOk(self.path.clone())),
        }
    }

    /// Reconciles the id generator with record `id` just written with the
    /// given in-use flag. Repeating it for the same write is a no-op.
    pub fn reconcile_id(&self, id: u64, in_use: bool) -> Result<()> {
        self.ensure_writable()?;
        let mut ids = self.ids.lock();
        match ids.as_mut() {
            Some(ids) => ids.reconcile(id, in_use),
            None => Err(StoreError::NotOk(self.path.clone())),
        }
    }

    /// Reconciles the id generator with a record written during log replay.
    /// No-op when the generator is not loaded (it is rebuilt afterwards).
    pub fn note_recovered(&self, id: u64, in_use: bool) -> Result<()> {
        match self.ids.lock().as_mut() {
            Some(ids) => ids.reconcile(id, in_use),
            None => Ok(()),
        }
    }

    /// True if `id` sits in the loaded generator's free set.
    pub fn is_id_free(&self, id: u64) -> bool {
        self.ids.lock().as_ref().is_some_and(|ids| ids.is_free(id))
    }

    /// High id of the loaded generator, else the number of whole records in
    /// the file.
    pub fn high_id(&self) -> Result<u64> {
        if let Some(ids) = self.ids.lock().as_ref() {
            return Ok(ids.high_id());
        }
        self.record_count()
    }

    fn record_count(&self) -> Result<u64> {
        let bytes = if self.read_only {
            self.open_record_bytes
        } else {
            self.io.len()?
        };
        Ok(bytes / self.record_size as u64)
    }

    /// Reads the raw bytes of record `id`.
    pub fn read_raw(&self, id: u64, dst: &mut [u8]) -> Result<()> {
        self.pool.read_record(id, dst)
    }

    /// Writes the raw bytes of record `id`.
    pub fn write_raw(&self, id: u64, src: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.pool.write_record(id, src)
    }

    /// True if record `id` has its in-use bit set.
    pub fn is_in_use(&self, id: u64) -> Result<bool> {
        self.pool.with_record(id, raw_in_use)
    }

    /// Rebuilds the id generator from the in-use bits of every record.
    pub fn rebuild_id_generator(&self) -> Result<()> {
        if self.read_only && !self.backup_replica {
            return Err(StoreError::ReadOnly("id generator rebuild on read-only store"));
        }
        self.pool.flush_all()?;
        let record_count = self.record_count()?;
        let mode = if self.fast_rebuild {
            RebuildMode::Fast
        } else {
            RebuildMode::Full
        };
        let mut ids = self.ids.lock();
        // The old generator's sidecar is replaced wholesale.
        ids.take();
        let rebuilt = IdGenerator::rebuild(&self.id_path, LINK_ID_LIMIT, mode, record_count, |id| {
            self.pool.with_record(id, raw_in_use)
        })?;
        info!(
            path = %self.path.display(),
            high_id = rebuilt.high_id(),
            ?mode,
            "store.rebuild_id_generator"
        );
        *ids = Some(rebuilt);
        Ok(())
    }

    /// Rebuilds the id generator if the store is not ok, then marks it ok.
    pub fn make_store_ok(&self) -> Result<()> {
        if self.is_store_ok() {
            return Ok(());
        }
        self.rebuild_id_generator()?;
        self.store_ok.store(true, Ordering::Release);
        info!(path = %self.path.display(), "store.make_store_ok");
        Ok(())
    }

    /// Writes dirty windows back and syncs the file.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.pool.flush_all()?;
        self.io.sync_all()
    }

    /// Flushes, closes the id generator, truncates to the high id and writes
    /// the descriptor, then releases the lock. Safe to call twice.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool.close()?;
        if self.read_only {
            self.lock.lock().take();
            return Ok(());
        }
        let high_id = {
            let mut ids = self.ids.lock();
            match ids.as_mut() {
                Some(ids) => {
                    ids.close()?;
                    Some(ids.high_id())
                }
                None => None,
            }
        };
        if let Some(high_id) = high_id {
            let descriptor = descriptor_for(self.type_descriptor);
            let end = high_id * self.record_size as u64;
            let mut last_err = None;
            for attempt in 1..=self.close_retries {
                let step = self
                    .io
                    .truncate(end)
                    .and_then(|_| self.io.write_at(end, descriptor.as_bytes()))
                    .and_then(|_| self.io.sync_all());
                match step {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            path = %self.path.display(),
                            attempt,
                            error = %err,
                            "store.close.retry"
                        );
                        last_err = Some(err);
                    }
                }
            }
            if let Some(err) = last_err {
                self.lock.lock().take();
                return Err(StoreError::UnderlyingStorage(format!(
                    "closing {} failed after {} attempts: {err}",
                    self.path.display(),
                    self.close_retries
                )));
            }
        } else {
            warn!(path = %self.path.display(), "store.close.not_ok");
        }
        self.lock.lock().take();
        debug!(path = %self.path.display(), ?high_id, "store.close");
        Ok(())
    }

    /// Snapshot of store state.
    pub fn stats(&self) -> StoreStats {
        let ids = self.ids.lock();
        StoreStats {
            path: self.path.clone(),
            type_descriptor: self.type_descriptor,
            record_size: self.record_size,
            high_id: ids.as_ref().map(IdGenerator::high_id),
            ids_in_use: ids.as_ref().map(IdGenerator::number_of_ids_in_use),
            free_ids: ids.as_ref().map(IdGenerator::free_count),
            store_ok: self.is_store_ok(),
            windows: self.pool.stats(),
        }
    }
}

/// Object-safe lifecycle of a store, used by the composite store to drive
/// every sub-store uniformly.
pub trait Store: Send + Sync {
    /// Shared store machinery.
    fn file(&self) -> &StoreFile;

    /// Type descriptor of the store.
    fn type_descriptor(&self) -> &'static str {
        self.file().type_descriptor()
    }

    /// Size of one record.
    fn record_size(&self) -> usize {
        self.file().record_size()
    }

    /// True unless the store needs repair.
    fn is_store_ok(&self) -> bool {
        self.file().is_store_ok()
    }

    /// Rebuilds the id generator from in-use bits.
    fn rebuild_id_generator(&self) -> Result<()> {
        self.file().rebuild_id_generator()
    }

    /// Repairs the store if needed.
    fn make_store_ok(&self) -> Result<()> {
        self.file().make_store_ok()
    }

    /// Allows writes to a not-ok store during log replay.
    fn set_recovery_mode(&self, on: bool) {
        self.file().set_recovery_mode(on)
    }

    /// Writes dirty state back to the file.
    fn flush(&self) -> Result<()> {
        self.file().flush()
    }

    /// Closes the store.
    fn close(&self) -> Result<()> {
        self.file().close()
    }

    /// Snapshot of store state.
    fn stats(&self) -> StoreStats {
        self.file().stats()
    }
}
