#![forbid(unsafe_code)]

/// Incremental checksum over byte chunks.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC of a log frame: length prefix followed by the frame body.
pub fn frame_crc32(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&(body.len() as u32).to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}
