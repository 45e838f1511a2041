//! Fixed-record graph storage with XA write-ahead logging and recovery.
//!
//! The crate is layered bottom-up:
//!
//! - [`primitives`]: positioned file I/O, advisory locks, the windowed
//!   buffer pool and the CRC-framed append-only log file.
//! - [`store`]: id generators, fixed-size record stores, dynamic block
//!   stores and the composite [`store::GraphStore`].
//! - [`xa`]: logical logs, commands, transactions and the resource manager
//!   that prepares, commits and recovers a data source.
//! - [`txn`]: the transaction manager coordinating one or more data sources
//!   with one- or two-phase commit.
//! - [`db`]: the embedding facade tying a store data source to a transaction
//!   manager.

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod store;
pub mod txn;
pub mod types;
pub mod xa;

pub use db::{Database, DbTransaction};
pub use store::{StoreConfig, Synchronous};
pub use types::{Result, StoreError};
pub use xa::{XaError, XaResult};
