#![forbid(unsafe_code)]
//! Windowed buffer pool over a file of fixed-size records.
//!
//! The file is split into windows holding a whole number of records. Each
//! resident window carries its own `RwLock`, so record access on disjoint
//! windows never contends; the pool map is behind a `Mutex` held only for
//! lookup, load and eviction.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use crate::primitives::io::FileIo;
use crate::types::{Result, StoreError};

/// Default window size in bytes before record alignment.
pub const DEFAULT_WINDOW_BYTES: usize = 64 * 1024;

/// Sizing for a [`WindowPool`].
#[derive(Clone, Copy, Debug)]
pub struct WindowPoolOptions {
    /// Size of one record in bytes.
    pub record_size: usize,
    /// Requested window size in bytes, rounded down to whole records.
    pub window_bytes: usize,
    /// Memory budget; determines how many windows stay resident.
    pub memory_budget: usize,
    /// Reject writes when set.
    pub read_only: bool,
}

/// Snapshot of pool counters.
#[derive(Clone, Debug, Default, Serialize)]
pub struct WindowPoolStats {
    /// Record accesses served by a resident window.
    pub hits: u64,
    /// Record accesses that had to load a window.
    pub misses: u64,
    /// Windows evicted to make room.
    pub evictions: u64,
    /// Dirty windows written back to the file.
    pub writebacks: u64,
    /// Windows currently resident.
    pub resident: usize,
    /// Maximum resident windows.
    pub capacity: usize,
    /// Records per window.
    pub records_per_window: u64,
}

struct WindowBuf {
    data: Box<[u8]>,
    dirty: bool,
    /// Exclusive end of the bytes that must reach the file on flush.
    dirty_hi: usize,
}

struct Window {
    index: u64,
    buf: RwLock<WindowBuf>,
}

struct Slot {
    window: Arc<Window>,
    reference: bool,
}

struct PoolInner {
    slots: Vec<Slot>,
    table: HashMap<u64, usize>,
    hand: usize,
    stats: WindowPoolStats,
}

/// Buffer pool of record-aligned windows over one store file.
pub struct WindowPool {
    io: Arc<dyn FileIo>,
    record_size: usize,
    records_per_window: u64,
    window_bytes: usize,
    capacity: usize,
    read_only: bool,
    inner: Mutex<PoolInner>,
}

impl WindowPool {
    /// Creates an empty pool over `io`.
    pub fn new(io: Arc<dyn FileIo>, options: WindowPoolOptions) -> Result<Self> {
        if options.record_size == 0 {
            return Err(StoreError::Invalid("record size must be non-zero"));
        }
        let records_per_window = (options.window_bytes / options.record_size).max(1);
        let window_bytes = records_per_window * options.record_size;
        let capacity = (options.memory_budget / window_bytes).max(1);
        debug!(
            record_size = options.record_size,
            window_bytes,
            capacity,
            "window_pool.new"
        );
        Ok(Self {
            io,
            record_size: options.record_size,
            records_per_window: records_per_window as u64,
            window_bytes,
            capacity,
            read_only: options.read_only,
            inner: Mutex::new(PoolInner {
                slots: Vec::with_capacity(capacity),
                table: HashMap::new(),
                hand: 0,
                stats: WindowPoolStats {
                    capacity,
                    records_per_window: records_per_window as u64,
                    ..WindowPoolStats::default()
                },
            }),
        })
    }

    /// Size of one record in bytes.
    pub fn record_size(&self) -> usize {
        self.record_size
    }

    /// Reads record `id` into `dst`, which must be exactly one record long.
    /// Records past the end of the file read as zeroes.
    pub fn read_record(&self, id: u64, dst: &mut [u8]) -> Result<()> {
        self.check_len(dst.len())?;
        self.with_record(id, |src| dst.copy_from_slice(src))
    }

    /// Overwrites record `id` with `src`.
    pub fn write_record(&self, id: u64, src: &[u8]) -> Result<()> {
        self.check_len(src.len())?;
        self.with_record_mut(id, |dst| dst.copy_from_slice(src))
    }

    /// Runs `f` over record `id` under the window's shared lock.
    pub fn with_record<R>(&self, id: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let window = self.pin(id)?;
        let start = self.offset_in_window(id);
        let guard = window.buf.read();
        Ok(f(&guard.data[start..start + self.record_size]))
    }

    /// Runs `f` over record `id` under the window's exclusive lock and marks
    /// the record dirty.
    pub fn with_record_mut<R>(&self, id: u64, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        if self.read_only {
            return Err(StoreError::ReadOnly("window pool is read-only"));
        }
        let window = self.pin(id)?;
        let start = self.offset_in_window(id);
        let end = start + self.record_size;
        let mut guard = window.buf.write();
        let out = f(&mut guard.data[start..end]);
        guard.dirty = true;
        guard.dirty_hi = guard.dirty_hi.max(end);
        Ok(out)
    }

    /// Writes every dirty window back to the file. Does not sync.
    pub fn flush_all(&self) -> Result<()> {
        let windows: Vec<Arc<Window>> = {
            let inner = self.inner.lock();
            inner.slots.iter().map(|s| Arc::clone(&s.window)).collect()
        };
        let mut written = 0u64;
        for window in windows {
            if self.flush_window(&window)? {
                written += 1;
            }
        }
        if written > 0 {
            self.inner.lock().stats.writebacks += written;
            trace!(windows = written, "window_pool.flush_all");
        }
        Ok(())
    }

    /// Flushes and syncs, then drops every resident window.
    pub fn close(&self) -> Result<()> {
        self.flush_all()?;
        if !self.read_only {
            self.io.sync_all()?;
        }
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.table.clear();
        inner.hand = 0;
        Ok(())
    }

    /// Returns a snapshot of pool counters.
    pub fn stats(&self) -> WindowPoolStats {
        let inner = self.inner.lock();
        let mut stats = inner.stats.clone();
        stats.resident = inner.slots.len();
        stats
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len != self.record_size {
            return Err(StoreError::Invalid("buffer length differs from record size"));
        }
        Ok(())
    }

    fn offset_in_window(&self, id: u64) -> usize {
        (id % self.records_per_window) as usize * self.record_size
    }

    fn pin(&self, id: u64) -> Result<Arc<Window>> {
        let index = id / self.records_per_window;
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.table.get(&index) {
            inner.slots[slot].reference = true;
            inner.stats.hits += 1;
            return Ok(Arc::clone(&inner.slots[slot].window));
        }
        inner.stats.misses += 1;
        let window = Arc::new(self.load_window(index)?);
        if inner.slots.len() < self.capacity {
            inner.slots.push(Slot {
                window: Arc::clone(&window),
                reference: true,
            });
            let slot = inner.slots.len() - 1;
            inner.table.insert(index, slot);
            return Ok(window);
        }
        match self.choose_victim(&mut inner)? {
            Some(slot) => {
                let old = Arc::clone(&inner.slots[slot].window);
                if self.flush_window(&old)? {
                    inner.stats.writebacks += 1;
                }
                inner.table.remove(&old.index);
                inner.slots[slot] = Slot {
                    window: Arc::clone(&window),
                    reference: true,
                };
                inner.table.insert(index, slot);
                inner.stats.evictions += 1;
            }
            None => {
                // Every resident window is held by a caller; run over budget
                // until one is released.
                inner.slots.push(Slot {
                    window: Arc::clone(&window),
                    reference: true,
                });
                let slot = inner.slots.len() - 1;
                inner.table.insert(index, slot);
            }
        }
        Ok(window)
    }

    /// Clock sweep over unreferenced windows nobody else holds.
    fn choose_victim(&self, inner: &mut PoolInner) -> Result<Option<usize>> {
        let len = inner.slots.len();
        if len == 0 {
            return Ok(None);
        }
        for _ in 0..(2 * len) {
            let slot = inner.hand % len;
            inner.hand = (slot + 1) % len;
            let entry = &mut inner.slots[slot];
            if Arc::strong_count(&entry.window) > 1 {
                continue;
            }
            if entry.reference {
                entry.reference = false;
                continue;
            }
            return Ok(Some(slot));
        }
        Ok(None)
    }

    fn load_window(&self, index: u64) -> Result<Window> {
        let offset = index * self.window_bytes as u64;
        let mut data = vec![0u8; self.window_bytes].into_boxed_slice();
        let file_len = self.io.len()?;
        let available = file_len.saturating_sub(offset).min(self.window_bytes as u64) as usize;
        if available > 0 {
            self.io.read_at(offset, &mut data[..available])?;
        }
        Ok(Window {
            index,
            buf: RwLock::new(WindowBuf {
                data,
                dirty: false,
                dirty_hi: 0,
            }),
        })
    }

    /// Writes the window back if dirty. Returns true when bytes were written.
    fn flush_window(&self, window: &Window) -> Result<bool> {
        let mut guard = window.buf.write();
        if !guard.dirty {
            return Ok(false);
        }
        let end = guard.dirty_hi;
        let offset = window.index * self.window_bytes as u64;
        self.io.write_at(offset, &guard.data[..end])?;
        guard.dirty = false;
        guard.dirty_hi = 0;
        Ok(true)
    }
}
