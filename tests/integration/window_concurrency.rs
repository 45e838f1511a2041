#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;

use recstore::primitives::io::{FileIo, StdFileIo};
use recstore::primitives::window::{WindowPool, WindowPoolOptions};
use recstore::types::Result;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

const RECORD: usize = 16;
const THREADS: u64 = 8;
const PER_THREAD: u64 = 200;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn record_for(id: u64, writer: u64) -> [u8; RECORD] {
    let mut out = [0u8; RECORD];
    out[..8].copy_from_slice(&id.to_be_bytes());
    out[8..].copy_from_slice(&writer.to_be_bytes());
    out
}

/// A pool far smaller than the data, so windows are evicted while other
/// threads still use them.
fn small_pool(io: Arc<dyn FileIo>) -> Result<WindowPool> {
    WindowPool::new(
        io,
        WindowPoolOptions {
            record_size: RECORD,
            window_bytes: 8 * RECORD,
            memory_budget: 4 * 8 * RECORD,
            read_only: false,
        },
    )
}

#[test]
fn disjoint_writers_never_lose_records() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("records");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
    let pool = small_pool(Arc::clone(&io))?;

    thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|writer| {
                let pool = &pool;
                scope.spawn(move || -> Result<()> {
                    // Interleaved ids: every window is shared by all writers.
                    for i in 0..PER_THREAD {
                        let id = i * THREADS + writer;
                        pool.write_record(id, &record_for(id, writer))?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer panicked")?;
        }
        Ok::<(), recstore::StoreError>(())
    })?;

    let total = THREADS * PER_THREAD;
    let mut buf = [0u8; RECORD];
    for id in 0..total {
        pool.read_record(id, &mut buf)?;
        assert_eq!(buf, record_for(id, id % THREADS), "record {id}");
    }
    let stats = pool.stats();
    assert!(stats.evictions > 0);
    assert!(stats.resident <= stats.capacity);

    pool.close()?;
    assert_eq!(io.len()?, total * RECORD as u64);
    let reopened = small_pool(io)?;
    for id in (0..total).step_by(37) {
        reopened.read_record(id, &mut buf)?;
        assert_eq!(buf, record_for(id, id % THREADS));
    }
    Ok(())
}

#[test]
fn same_record_writers_never_tear() -> Result<()> {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("records"))?);
    let pool = small_pool(io)?;
    let hot = [3u64, 40, 77];

    thread::scope(|scope| {
        let writers: Vec<_> = (0..THREADS)
            .map(|writer| {
                let pool = &pool;
                scope.spawn(move || -> Result<()> {
                    for round in 0..PER_THREAD {
                        let id = hot[(round % hot.len() as u64) as usize];
                        pool.write_record(id, &record_for(id, writer))?;
                        // Touch a cold record to force evictions in between.
                        let cold = 200 + writer * PER_THREAD + round;
                        pool.write_record(cold, &record_for(cold, writer))?;
                    }
                    Ok(())
                })
            })
            .collect();
        let reader = {
            let pool = &pool;
            scope.spawn(move || -> Result<()> {
                let mut buf = [0u8; RECORD];
                for _ in 0..PER_THREAD {
                    for &id in &hot {
                        pool.read_record(id, &mut buf)?;
                        let written_id = u64::from_be_bytes(buf[..8].try_into().expect("8 bytes"));
                        // Unwritten records read as zero; anything else is whole.
                        assert!(written_id == id || buf == [0u8; RECORD], "torn record {id}");
                    }
                }
                Ok(())
            })
        };
        for handle in writers {
            handle.join().expect("writer panicked")?;
        }
        reader.join().expect("reader panicked")
    })?;

    let mut buf = [0u8; RECORD];
    for id in hot {
        pool.read_record(id, &mut buf)?;
        let writer = u64::from_be_bytes(buf[8..].try_into().expect("8 bytes"));
        assert!(writer < THREADS);
        assert_eq!(buf, record_for(id, writer));
    }
    pool.close()
}
