//! Low-level primitives for building the record stores.
//!
//! Includes positioned I/O, file locking, the windowed buffer pool and the
//! framed append-only log used by the logical logs.

/// Advisory file locks and the data source read/write lock.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;

/// Framed append-only log files.
pub mod log;

/// Windowed buffer pool over fixed-size record files.
pub mod window;
