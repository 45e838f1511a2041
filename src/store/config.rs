use serde::{Deserialize, Serialize};

use crate::primitives::window::DEFAULT_WINDOW_BYTES;

/// Default data bytes per block in the string and array stores.
pub const DEFAULT_DATA_BLOCK_SIZE: usize = 120;
/// Default data bytes per block in the name stores.
pub const DEFAULT_NAME_BLOCK_SIZE: usize = 30;

/// Configuration for opening or creating a set of record stores and their
/// logical log.
///
/// There is no file format for this; embedders build it in code.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Open every file without write access and skip id generators.
    pub read_only: bool,
    /// The store is a backup replica; allows id rebuilds even when read-only.
    pub backup_replica: bool,
    /// Memory budget per store for resident windows, in bytes.
    pub mapped_memory: usize,
    /// Window size in bytes, rounded down to whole records.
    pub window_bytes: usize,
    /// Rebuild id generators with the backward scan instead of a full scan.
    pub rebuild_id_generators_fast: bool,
    /// Archive rotated log segments instead of deleting them.
    pub keep_logical_logs: bool,
    /// Rotate the logical log once it grows past this many bytes.
    pub logical_log_rotation_threshold: u64,
    /// Durability of logical log appends.
    pub synchronous: Synchronous,
    /// Data bytes per block in the string store.
    pub string_block_size: usize,
    /// Data bytes per block in the array store.
    pub array_block_size: usize,
    /// Data bytes per block in the name stores.
    pub name_block_size: usize,
    /// Attempts at the truncate/descriptor step of a store close.
    pub close_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            backup_replica: false,
            mapped_memory: 4 * 1024 * 1024,
            window_bytes: DEFAULT_WINDOW_BYTES,
            rebuild_id_generators_fast: true,
            keep_logical_logs: false,
            logical_log_rotation_threshold: 25 * 1024 * 1024,
            synchronous: Synchronous::Full,
            string_block_size: DEFAULT_DATA_BLOCK_SIZE,
            array_block_size: DEFAULT_DATA_BLOCK_SIZE,
            name_block_size: DEFAULT_NAME_BLOCK_SIZE,
            close_retries: 3,
        }
    }
}

impl StoreConfig {
    /// Sets read-only mode.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Marks the store as a backup replica.
    pub fn backup_replica(mut self, backup_replica: bool) -> Self {
        self.backup_replica = backup_replica;
        self
    }

    /// Sets the per-store window memory budget.
    pub fn mapped_memory(mut self, bytes: usize) -> Self {
        self.mapped_memory = bytes;
        self
    }

    /// Sets the window size.
    pub fn window_bytes(mut self, bytes: usize) -> Self {
        self.window_bytes = bytes;
        self
    }

    /// Chooses between fast and full id generator rebuilds.
    pub fn rebuild_id_generators_fast(mut self, fast: bool) -> Self {
        self.rebuild_id_generators_fast = fast;
        self
    }

    /// Keeps rotated log segments on disk.
    pub fn keep_logical_logs(mut self, keep: bool) -> Self {
        self.keep_logical_logs = keep;
        self
    }

    /// Sets the automatic rotation threshold.
    pub fn logical_log_rotation_threshold(mut self, bytes: u64) -> Self {
        self.logical_log_rotation_threshold = bytes;
        self
    }

    /// Sets the log durability mode.
    pub fn synchronous(mut self, mode: Synchronous) -> Self {
        self.synchronous = mode;
        self
    }

    /// Sets the close retry count (at least one attempt is always made).
    pub fn close_retries(mut self, retries: u32) -> Self {
        self.close_retries = retries;
        self
    }
}

/// Durability mode for logical log appends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Synchronous {
    /// Force the log to disk at prepare and commit.
    #[default]
    Full,
    /// Never force; rely on the operating system.
    Off,
}

impl Synchronous {
    /// Returns the string representation of the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            Synchronous::Full => "full",
            Synchronous::Off => "off",
        }
    }

    /// Parses a mode from a string (case-insensitive).
    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "full" => Some(Synchronous::Full),
            "off" => Some(Synchronous::Off),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = StoreConfig::default()
            .read_only(true)
            .synchronous(Synchronous::Off)
            .close_retries(5);
        assert!(cfg.read_only);
        assert_eq!(cfg.synchronous, Synchronous::Off);
        assert_eq!(cfg.close_retries, 5);
        assert!(cfg.rebuild_id_generators_fast);
    }

    #[test]
    fn synchronous_parses_case_insensitively() {
        assert_eq!(Synchronous::from_str("FULL"), Some(Synchronous::Full));
        assert_eq!(Synchronous::from_str("off"), Some(Synchronous::Off));
        assert_eq!(Synchronous::from_str("normal"), None);
        assert_eq!(Synchronous::Off.as_str(), "off");
    }

    #[test]
    fn config_serializes_with_lowercase_mode() {
        let json = serde_json::to_string(&StoreConfig::default()).unwrap();
        assert!(json.contains("\"synchronous\":\"full\""));
        let back: StoreConfig = serde_json::from_str("{\"read_only\":true}").unwrap();
        assert!(back.read_only);
        assert_eq!(back.close_retries, 3);
    }
}
