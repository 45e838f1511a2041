#![forbid(unsafe_code)]

use std::fmt;
use std::io::IoSlice;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::primitives::io::FileIo;
use crate::types::{frame_crc32, Checksum, Crc32Fast, Result, StoreError};

const LOG_MAGIC: [u8; 4] = *b"RSLG";
const LOG_FORMAT_VERSION: u16 = 1;
/// Byte length of the fixed log file header.
pub const LOG_HEADER_LEN: usize = 32;
/// Byte length of the per-frame header (`len u32` + `crc32 u32`).
pub const FRAME_HEADER_LEN: usize = 8;
/// Largest frame body accepted by the reader; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
const LOG_MAX_IO_SLICES: usize = 512;

/// Fixed header at the start of every log file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LogHeader {
    /// Log segment version.
    pub log_version: u64,
    /// Last transaction id committed before this segment started.
    pub last_committed_tx: u64,
}

impl LogHeader {
    /// Creates a header for a new segment.
    pub fn new(log_version: u64, last_committed_tx: u64) -> Self {
        Self {
            log_version,
            last_committed_tx,
        }
    }

    fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[0..4].copy_from_slice(&LOG_MAGIC);
        buf[4..6].copy_from_slice(&LOG_FORMAT_VERSION.to_be_bytes());
        buf[8..16].copy_from_slice(&self.log_version.to_be_bytes());
        buf[16..24].copy_from_slice(&self.last_committed_tx.to_be_bytes());
        let mut hasher = Crc32Fast::default();
        hasher.update(&buf[..28]);
        buf[28..32].copy_from_slice(&hasher.finalize().to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < LOG_HEADER_LEN {
            return Err(StoreError::Corruption("log header truncated"));
        }
        if src[0..4] != LOG_MAGIC {
            return Err(StoreError::Corruption("log magic mismatch"));
        }
        let version = u16::from_be_bytes([src[4], src[5]]);
        if version != LOG_FORMAT_VERSION {
            return Err(StoreError::Corruption("log format version mismatch"));
        }
        if src[6..8] != [0, 0] || src[24..28] != [0, 0, 0, 0] {
            return Err(StoreError::Corruption("log reserved header bytes non-zero"));
        }
        let mut hasher = Crc32Fast::default();
        hasher.update(&src[..28]);
        let stored = u32_at(src, 28);
        if hasher.finalize() != stored {
            return Err(StoreError::Corruption("log header crc mismatch"));
        }
        Ok(Self {
            log_version: u64_at(src, 8),
            last_committed_tx: u64_at(src, 16),
        })
    }
}

/// Statistics tracking log operations.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LogStats {
    /// Number of frames appended.
    pub frames_appended: u64,
    /// Total bytes appended, frame headers included.
    pub bytes_appended: u64,
    /// Number of forced syncs.
    pub syncs: u64,
}

struct LogState {
    header: LogHeader,
    append_offset: u64,
    stats: LogStats,
}

/// Append-only file of CRC-framed entries following a fixed header.
///
/// Frames are `[len u32][crc32 u32][body]`; the CRC covers the length and the
/// body. A frame that fails validation ends the readable log.
pub struct LogFile {
    io: Arc<dyn FileIo>,
    state: Mutex<LogState>,
}

impl LogFile {
    /// Creates (or resets) a log file with the given header.
    pub fn create(io: Arc<dyn FileIo>, header: LogHeader) -> Result<Self> {
        io.write_at(0, &header.encode())?;
        io.truncate(LOG_HEADER_LEN as u64)?;
        io.sync_all()?;
        Ok(Self {
            io,
            state: Mutex::new(LogState {
                header,
                append_offset: LOG_HEADER_LEN as u64,
                stats: LogStats::default(),
            }),
        })
    }

    /// Opens an existing log file. Appends continue at the current file end;
    /// recovery is expected to call [`LogFile::truncate_to`] with the reader's
    /// `valid_up_to` before appending.
    pub fn open(io: Arc<dyn FileIo>) -> Result<Self> {
        let len = io.len()?;
        if len < LOG_HEADER_LEN as u64 {
            return Err(StoreError::Corruption("log header truncated"));
        }
        let mut buf = [0u8; LOG_HEADER_LEN];
        io.read_at(0, &mut buf)?;
        let header = LogHeader::decode(&buf)?;
        Ok(Self {
            io,
            state: Mutex::new(LogState {
                header,
                append_offset: len,
                stats: LogStats::default(),
            }),
        })
    }

    /// Returns the header this log was created or opened with.
    pub fn header(&self) -> LogHeader {
        self.state.lock().header
    }

    /// Appends a batch of frame bodies as one contiguous run and returns the
    /// offset of the first frame. Does not sync.
    pub fn append(&self, bodies: &[&[u8]]) -> Result<u64> {
        let mut state = self.state.lock();
        let first_offset = state.append_offset;
        if bodies.is_empty() {
            return Ok(first_offset);
        }
        for body in bodies {
            if body.len() as u64 > u64::from(MAX_FRAME_LEN) {
                return Err(StoreError::Invalid("log frame exceeds maximum length"));
            }
        }
        let mut index = 0usize;
        while index < bodies.len() {
            let chunk_end = (index + LOG_MAX_IO_SLICES / 2).min(bodies.len());
            let chunk = &bodies[index..chunk_end];
            let headers: Vec<[u8; FRAME_HEADER_LEN]> = chunk
                .iter()
                .map(|body| {
                    let mut hdr = [0u8; FRAME_HEADER_LEN];
                    hdr[0..4].copy_from_slice(&(body.len() as u32).to_be_bytes());
                    hdr[4..8].copy_from_slice(&frame_crc32(body).to_be_bytes());
                    hdr
                })
                .collect();
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(chunk.len() * 2);
            let mut chunk_bytes = 0u64;
            for (hdr, body) in headers.iter().zip(chunk.iter()) {
                slices.push(IoSlice::new(hdr));
                slices.push(IoSlice::new(body));
                chunk_bytes += (FRAME_HEADER_LEN + body.len()) as u64;
            }
            self.io.writev_at(state.append_offset, &slices)?;
            state.append_offset += chunk_bytes;
            state.stats.frames_appended += chunk.len() as u64;
            state.stats.bytes_appended += chunk_bytes;
            index = chunk_end;
        }
        Ok(first_offset)
    }

    /// Forces appended frames to stable storage.
    pub fn force(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Discards everything at and after `offset`.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let offset = offset.max(LOG_HEADER_LEN as u64);
        let mut state = self.state.lock();
        self.io.truncate(offset)?;
        self.io.sync_all()?;
        debug!(
            from = state.append_offset,
            to = offset,
            "log.truncate_to"
        );
        state.append_offset = offset;
        Ok(())
    }

    /// Creates a reader positioned at `offset` (the first frame when `None`).
    pub fn reader(&self, offset: Option<u64>) -> Result<LogReader> {
        let start = offset.unwrap_or(LOG_HEADER_LEN as u64).max(LOG_HEADER_LEN as u64);
        Ok(LogReader {
            io: Arc::clone(&self.io),
            offset: start,
            end: self.io.len()?,
            valid_up_to: start,
        })
    }

    /// Offset at which the next frame will be written.
    pub fn append_offset(&self) -> u64 {
        self.state.lock().append_offset
    }

    /// Total size of the log in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// True if the log holds no frames.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= LOG_HEADER_LEN as u64)
    }

    /// Returns current statistics for this log.
    pub fn stats(&self) -> LogStats {
        self.state.lock().stats.clone()
    }
}

/// A frame read back from a log file.
pub struct LogFrame {
    /// File offset of the frame header.
    pub offset: u64,
    /// Frame body.
    pub body: Vec<u8>,
}

impl fmt::Debug for LogFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogFrame")
            .field("offset", &self.offset)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Sequential frame reader. Stops at the first torn or corrupt frame.
pub struct LogReader {
    io: Arc<dyn FileIo>,
    offset: u64,
    end: u64,
    valid_up_to: u64,
}

impl LogReader {
    /// Reads the next valid frame, or `None` at end of the readable log.
    pub fn next_frame(&mut self) -> Result<Option<LogFrame>> {
        if self.offset + FRAME_HEADER_LEN as u64 > self.end {
            self.offset = self.end;
            return Ok(None);
        }
        let mut hdr = [0u8; FRAME_HEADER_LEN];
        match self.io.read_at(self.offset, &mut hdr) {
            Ok(()) => {}
            Err(err) if err.is_unexpected_eof() => return Ok(self.stop()),
            Err(err) => return Err(err),
        }
        let len = u32_at(&hdr, 0);
        let crc = u32_at(&hdr, 4);
        if len > MAX_FRAME_LEN {
            return Ok(self.stop());
        }
        let body_off = self.offset + FRAME_HEADER_LEN as u64;
        if body_off + u64::from(len) > self.end {
            return Ok(self.stop());
        }
        let mut body = vec![0u8; len as usize];
        match self.io.read_at(body_off, &mut body) {
            Ok(()) => {}
            Err(err) if err.is_unexpected_eof() => return Ok(self.stop()),
            Err(err) => return Err(err),
        }
        if frame_crc32(&body) != crc {
            return Ok(self.stop());
        }
        let frame = LogFrame {
            offset: self.offset,
            body,
        };
        self.offset = body_off + u64::from(len);
        self.valid_up_to = self.offset;
        Ok(Some(frame))
    }

    /// Marks the frame starting at the current position as the logical end.
    pub fn stop_at_current(&mut self) {
        self.end = self.valid_up_to;
        self.offset = self.valid_up_to;
    }

    /// Rewinds the valid region to `offset`, which must be a frame boundary
    /// already returned by this reader.
    pub fn rewind_valid_to(&mut self, offset: u64) {
        self.valid_up_to = offset;
        self.stop_at_current();
    }

    /// File offset up to which frames have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    fn stop(&mut self) -> Option<LogFrame> {
        self.offset = self.end;
        None
    }
}

fn u32_at(src: &[u8], at: usize) -> u32 {
    let mut arr = [0u8; 4];
    arr.copy_from_slice(&src[at..at + 4]);
    u32::from_be_bytes(arr)
}

fn u64_at(src: &[u8], at: usize) -> u64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&src[at..at + 8]);
    u64::from_be_bytes(arr)
}
