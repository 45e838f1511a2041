#![forbid(unsafe_code)]

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use recstore::primitives::io::{FileIo, StdFileIo};
use recstore::primitives::window::{WindowPool, WindowPoolOptions};
use recstore::store::PropertyValue;
use recstore::xa::PropertyOwner;
use recstore::{Database, StoreConfig, Synchronous};
use tempfile::TempDir;

const RECORD: usize = 33;
const RECORDS: u64 = 16_384;
const NODES_PER_TX: usize = 32;

fn micro_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/window");
    group.sample_size(25);
    // A budget below the data size forces evictions on the sweep.
    for windows in [4usize, 64] {
        let harness = WindowHarness::new(windows);
        group.throughput(Throughput::Elements(RECORDS));
        group.bench_with_input(BenchmarkId::new("write_sweep", windows), &windows, |b, _| {
            b.iter(|| harness.write_sweep());
        });
        group.bench_with_input(BenchmarkId::new("read_sweep", windows), &windows, |b, _| {
            b.iter(|| harness.read_sweep());
        });
    }
    group.finish();
}

fn micro_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("micro/commit");
    group.sample_size(20);
    for mode in [Synchronous::Full, Synchronous::Off] {
        let harness = CommitHarness::new(mode);
        group.throughput(Throughput::Elements(NODES_PER_TX as u64));
        group.bench_with_input(
            BenchmarkId::new("nodes_with_property", format!("{mode:?}")),
            &mode,
            |b, _| {
                b.iter(|| harness.commit_batch());
            },
        );
    }
    group.finish();
}

struct WindowHarness {
    _tmpdir: TempDir,
    pool: WindowPool,
    payload: [u8; RECORD],
}

impl WindowHarness {
    fn new(windows: usize) -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let io: Arc<dyn FileIo> =
            Arc::new(StdFileIo::open(tmpdir.path().join("records")).expect("file"));
        let window_bytes = 256 * RECORD;
        let pool = WindowPool::new(
            io,
            WindowPoolOptions {
                record_size: RECORD,
                window_bytes,
                memory_budget: windows * window_bytes,
                read_only: false,
            },
        )
        .expect("pool");
        Self {
            _tmpdir: tmpdir,
            pool,
            payload: [0xAB; RECORD],
        }
    }

    fn write_sweep(&self) {
        for id in 0..RECORDS {
            self.pool.write_record(id, &self.payload).expect("write");
        }
    }

    fn read_sweep(&self) {
        let mut buf = [0u8; RECORD];
        for id in 0..RECORDS {
            self.pool.read_record(id, &mut buf).expect("read");
        }
    }
}

struct CommitHarness {
    _tmpdir: TempDir,
    db: Database,
}

impl CommitHarness {
    fn new(mode: Synchronous) -> Self {
        let tmpdir = tempfile::tempdir().expect("tmpdir");
        let config = StoreConfig::default().synchronous(mode);
        let db = Database::open(tmpdir.path(), config).expect("database");
        Self {
            _tmpdir: tmpdir,
            db,
        }
    }

    fn commit_batch(&self) {
        let mut tx = self.db.begin().expect("begin");
        for i in 0..NODES_PER_TX {
            let node = tx.create_node().expect("node");
            tx.set_property(PropertyOwner::Node(node), "seq", PropertyValue::Int(i as i32))
                .expect("property");
        }
        tx.commit().expect("commit");
    }
}

impl Drop for CommitHarness {
    fn drop(&mut self) {
        let _ = self.db.close();
    }
}

criterion_group!(benches, micro_window, micro_commit);
criterion_main!(benches);
