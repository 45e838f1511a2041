//! Fixed-record stores: id generators, the shared store lifecycle, typed
//! record stores, dynamic block stores and the composite graph store.

/// Shared store lifecycle and the `Store` trait.
pub mod common;
/// Store configuration.
pub mod config;
/// Dynamic block stores.
pub mod dynamic;
/// Topological creation and opening of the composite store.
pub mod factory;
/// The composite graph store.
pub mod graph_store;
/// Free-id tracking.
pub mod id_generator;
/// The meta store.
pub mod meta;
/// Property values.
pub mod property;
/// Record layouts.
pub mod record;
/// Typed record stores.
pub mod record_store;

pub use common::{Store, StoreFile, StoreStats};
pub use config::{StoreConfig, Synchronous};
pub use factory::StoreFactory;
pub use graph_store::{GraphStore, GraphStoreStats};
pub use id_generator::{IdGenerator, RebuildMode};
pub use property::{PropertyArray, PropertyType, PropertyValue};
pub use record_store::RecordStore;
