//! Logical log of one XA resource.
//!
//! Two segment files, `<name>.1` and `<name>.2`, alternate as the active
//! segment. `<name>.active` holds one byte naming the active segment, or `C`
//! after a clean close. Rotated segments are renamed to `<name>.v<version>`
//! when logs are kept, otherwise deleted.
//!
//! Entry bodies are `[type u8][identifier u32][payload]`. The identifier ties
//! the entries of one transaction together inside a segment.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::log::{LogFile, LogHeader, LogStats, LOG_HEADER_LEN};
use crate::store::config::{StoreConfig, Synchronous};
use crate::types::{Result, StoreError};
use crate::xa::xid::{Xid, XID_LEN};

const ENTRY_START: u8 = 1;
const ENTRY_COMMAND: u8 = 2;
const ENTRY_PREPARE: u8 = 3;
const ENTRY_ONE_PHASE_COMMIT: u8 = 4;
const ENTRY_TWO_PHASE_COMMIT: u8 = 5;
const ENTRY_DONE: u8 = 6;

const MARK_CLEAN: u8 = b'C';
const MARK_ONE: u8 = b'1';
const MARK_TWO: u8 = b'2';

/// One logical log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEntry {
    /// First entry of a transaction.
    Start {
        /// Log identifier.
        identifier: u32,
        /// Branch id.
        xid: Xid,
    },
    /// One encoded command.
    Command {
        /// Log identifier.
        identifier: u32,
        /// Encoded command, tag byte first.
        payload: Vec<u8>,
    },
    /// Commands are complete and forced.
    Prepare {
        /// Log identifier.
        identifier: u32,
    },
    /// Committed without a prepare phase.
    OnePhaseCommit {
        /// Log identifier.
        identifier: u32,
        /// Committed transaction id.
        tx_id: u64,
    },
    /// Committed after prepare.
    TwoPhaseCommit {
        /// Log identifier.
        identifier: u32,
        /// Committed transaction id.
        tx_id: u64,
    },
    /// Fully applied or discarded.
    Done {
        /// Log identifier.
        identifier: u32,
    },
}

impl LogEntry {
    /// Identifier of the transaction this entry belongs to.
    pub fn identifier(&self) -> u32 {
        match self {
            LogEntry::Start { identifier, .. }
            | LogEntry::Command { identifier, .. }
            | LogEntry::Prepare { identifier }
            | LogEntry::OnePhaseCommit { identifier, .. }
            | LogEntry::TwoPhaseCommit { identifier, .. }
            | LogEntry::Done { identifier } => *identifier,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            LogEntry::Start { .. } => ENTRY_START,
            LogEntry::Command { .. } => ENTRY_COMMAND,
            LogEntry::Prepare { .. } => ENTRY_PREPARE,
            LogEntry::OnePhaseCommit { .. } => ENTRY_ONE_PHASE_COMMIT,
            LogEntry::TwoPhaseCommit { .. } => ENTRY_TWO_PHASE_COMMIT,
            LogEntry::Done { .. } => ENTRY_DONE,
        }
    }

    /// Frame body of this entry.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(16);
        body.push(self.kind());
        body.extend_from_slice(&self.identifier().to_be_bytes());
        match self {
            LogEntry::Start { xid, .. } => body.extend_from_slice(&xid.encode()),
            LogEntry::Command { payload, .. } => body.extend_from_slice(payload),
            LogEntry::OnePhaseCommit { tx_id, .. } | LogEntry::TwoPhaseCommit { tx_id, .. } => {
                body.extend_from_slice(&tx_id.to_be_bytes())
            }
            LogEntry::Prepare { .. } | LogEntry::Done { .. } => {}
        }
        body
    }

    /// Decodes a frame body; `None` if it is not a well-formed entry.
    pub fn decode(body: &[u8]) -> Option<Self> {
        let kind = *body.first()?;
        let mut id = [0u8; 4];
        id.copy_from_slice(body.get(1..5)?);
        let identifier = u32::from_be_bytes(id);
        let payload = &body[5..];
        let tx_id = || -> Option<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(payload.get(..8)?);
            (payload.len() == 8).then(|| u64::from_be_bytes(raw))
        };
        let entry = match kind {
            ENTRY_START if payload.len() == XID_LEN => LogEntry::Start {
                identifier,
                xid: Xid::decode(payload)?,
            },
            ENTRY_COMMAND => LogEntry::Command {
                identifier,
                payload: payload.to_vec(),
            },
            ENTRY_PREPARE if payload.is_empty() => LogEntry::Prepare { identifier },
            ENTRY_ONE_PHASE_COMMIT => LogEntry::OnePhaseCommit {
                identifier,
                tx_id: tx_id()?,
            },
            ENTRY_TWO_PHASE_COMMIT => LogEntry::TwoPhaseCommit {
                identifier,
                tx_id: tx_id()?,
            },
            ENTRY_DONE if payload.is_empty() => LogEntry::Done { identifier },
            _ => return None,
        };
        Some(entry)
    }
}

/// An entry read back during recovery, with the offset of its frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedEntry {
    /// Frame offset in the active segment.
    pub offset: u64,
    /// Decoded entry.
    pub entry: LogEntry,
}

/// Logging policy of a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep rotated segments as `<name>.v<version>`.
    pub keep_logs: bool,
    /// Segment size that triggers a rotation after a commit.
    pub rotation_threshold: u64,
    /// Whether prepare and commit markers are forced.
    pub synchronous: Synchronous,
}

impl LogOptions {
    /// Options taken from a store configuration.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            keep_logs: config.keep_logical_logs,
            rotation_threshold: config.logical_log_rotation_threshold,
            synchronous: config.synchronous,
        }
    }
}

impl Default for LogOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Segment {
    One,
    Two,
}

impl Segment {
    fn mark(self) -> u8 {
        match self {
            Segment::One => MARK_ONE,
            Segment::Two => MARK_TWO,
        }
    }

    fn other(self) -> Self {
        match self {
            Segment::One => Segment::Two,
            Segment::Two => Segment::One,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Segment::One => ".1",
            Segment::Two => ".2",
        }
    }
}

struct LogState {
    file: Option<LogFile>,
    segment: Segment,
    next_identifier: u32,
    /// Identifier of every started, not yet done transaction, with the
    /// offset of its start entry.
    open: BTreeMap<u32, u64>,
}

impl LogState {
    fn file(&self) -> Result<&LogFile> {
        self.file
            .as_ref()
            .ok_or(StoreError::Invalid("logical log is closed"))
    }
}

/// The logical log of one resource.
pub struct LogicalLog {
    dir: PathBuf,
    name: String,
    options: LogOptions,
    state: Mutex<LogState>,
}

impl LogicalLog {
    /// Opens the log `name` in `dir`.
    ///
    /// After a clean close a fresh segment is started with the given header
    /// values and no entries are returned. Otherwise the active segment is
    /// scanned, its unreadable tail truncated and every entry returned for
    /// recovery.
    pub fn open(
        dir: &Path,
        name: &str,
        options: LogOptions,
        log_version: u64,
        last_committed_tx: u64,
    ) -> Result<(Self, Vec<ScannedEntry>)> {
        fs::create_dir_all(dir)?;
        let log = Self {
            dir: dir.to_path_buf(),
            name: name.to_string(),
            options,
            state: Mutex::new(LogState {
                file: None,
                segment: Segment::One,
                next_identifier: 1,
                open: BTreeMap::new(),
            }),
        };
        let marker = log.read_marker()?;
        let entries = match marker {
            None | Some(MARK_CLEAN) => {
                log.start_fresh(Segment::One, log_version, last_committed_tx)?;
                Vec::new()
            }
            Some(MARK_ONE) => log.recover_segment(Segment::One, log_version, last_committed_tx)?,
            Some(MARK_TWO) => log.recover_segment(Segment::Two, log_version, last_committed_tx)?,
            Some(_) => return Err(StoreError::Corruption("logical log marker unrecognized")),
        };
        info!(
            log = %log.name,
            dirty = !entries.is_empty(),
            entries = entries.len(),
            "xa.log.open"
        );
        Ok((log, entries))
    }

    fn start_fresh(&self, segment: Segment, log_version: u64, last_committed_tx: u64) -> Result<()> {
        let path = self.segment_path(segment);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let file = create_segment(&path, LogHeader::new(log_version, last_committed_tx))?;
        self.write_marker(segment.mark())?;
        let mut state = self.state.lock();
        state.file = Some(file);
        state.segment = segment;
        Ok(())
    }

    fn recover_segment(
        &self,
        segment: Segment,
        log_version: u64,
        last_committed_tx: u64,
    ) -> Result<Vec<ScannedEntry>> {
        let path = self.segment_path(segment);
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path)?);
        if io.len()? < LOG_HEADER_LEN as u64 {
            // Crashed while the segment was being created.
            warn!(path = %path.display(), "xa.log.segment_header_missing");
            drop(io);
            self.start_fresh(segment, log_version, last_committed_tx)?;
            return Ok(Vec::new());
        }
        let file = LogFile::open(io)?;
        let mut reader = file.reader(None)?;
        let mut entries = Vec::new();
        while let Some(frame) = reader.next_frame()? {
            match LogEntry::decode(&frame.body) {
                Some(entry) => entries.push(ScannedEntry {
                    offset: frame.offset,
                    entry,
                }),
                None => {
                    warn!(offset = frame.offset, "xa.log.malformed_entry");
                    reader.rewind_valid_to(frame.offset);
                    break;
                }
            }
        }
        let valid = reader.valid_up_to();
        if valid < file.len()? {
            warn!(
                path = %path.display(),
                valid_up_to = valid,
                len = file.len()?,
                "xa.log.truncate_tail"
            );
        }
        file.truncate_to(valid)?;
        let mut state = self.state.lock();
        for scanned in &entries {
            match scanned.entry {
                LogEntry::Start { identifier, .. } => {
                    state.open.insert(identifier, scanned.offset);
                }
                LogEntry::Done { identifier } => {
                    state.open.remove(&identifier);
                }
                _ => {}
            }
            let next = scanned.entry.identifier().wrapping_add(1).max(1);
            state.next_identifier = state.next_identifier.max(next);
        }
        state.file = Some(file);
        state.segment = segment;
        Ok(entries)
    }

    /// Log name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the active segment.
    pub fn active_path(&self) -> PathBuf {
        self.segment_path(self.state.lock().segment)
    }

    /// Version of the active segment.
    pub fn current_version(&self) -> Result<u64> {
        Ok(self.state.lock().file()?.header().log_version)
    }

    /// Reserves an identifier for a new transaction.
    pub fn next_identifier(&self) -> u32 {
        let mut state = self.state.lock();
        let identifier = state.next_identifier;
        state.next_identifier = identifier.wrapping_add(1).max(1);
        identifier
    }

    /// Appends the start entry and every command of a transaction as one
    /// unbroken run.
    pub fn write_transaction(&self, identifier: u32, xid: Xid, commands: &[Vec<u8>]) -> Result<()> {
        let mut bodies = Vec::with_capacity(commands.len() + 1);
        bodies.push(LogEntry::Start { identifier, xid }.encode());
        for payload in commands {
            bodies.push(
                LogEntry::Command {
                    identifier,
                    payload: payload.clone(),
                }
                .encode(),
            );
        }
        let refs: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();
        let mut state = self.state.lock();
        let offset = state.file()?.append(&refs)?;
        state.open.insert(identifier, offset);
        Ok(())
    }

    /// Appends the prepare marker, forced per the synchronous policy.
    pub fn prepare(&self, identifier: u32) -> Result<()> {
        self.append_marker(&LogEntry::Prepare { identifier }, true)
    }

    /// Appends a commit marker, forced per the synchronous policy.
    pub fn commit(&self, identifier: u32, tx_id: u64, one_phase: bool) -> Result<()> {
        let entry = if one_phase {
            LogEntry::OnePhaseCommit { identifier, tx_id }
        } else {
            LogEntry::TwoPhaseCommit { identifier, tx_id }
        };
        self.append_marker(&entry, true)
    }

    /// Appends the done marker. Not forced.
    pub fn done(&self, identifier: u32) -> Result<()> {
        self.append_marker(&LogEntry::Done { identifier }, false)?;
        self.state.lock().open.remove(&identifier);
        Ok(())
    }

    fn append_marker(&self, entry: &LogEntry, force: bool) -> Result<()> {
        let body = entry.encode();
        let state = self.state.lock();
        let file = state.file()?;
        file.append(&[&body])?;
        if force && self.options.synchronous == Synchronous::Full {
            file.force()?;
        }
        Ok(())
    }

    /// Discards the active segment from `offset` on.
    pub fn truncate_to(&self, offset: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.file()?.truncate_to(offset)?;
        state.open.retain(|_, start| *start < offset);
        Ok(())
    }

    /// Size of the active segment.
    pub fn size(&self) -> Result<u64> {
        self.state.lock().file()?.len()
    }

    /// True when the active segment has reached the rotation threshold.
    pub fn needs_rotation(&self) -> Result<bool> {
        Ok(self.size()? >= self.options.rotation_threshold)
    }

    /// Number of transactions started and not yet done.
    pub fn open_transactions(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Switches to a new segment with version `new_version`. Entries of
    /// transactions still open are copied over; the old segment is archived
    /// or deleted. Stores must be flushed first.
    pub fn rotate(&self, new_version: u64, last_committed_tx: u64) -> Result<()> {
        let mut state = self.state.lock();
        let old_segment = state.segment;
        let old_version = state.file()?.header().log_version;
        let new_segment = old_segment.other();
        let new_path = self.segment_path(new_segment);
        if new_path.exists() {
            fs::remove_file(&new_path)?;
        }
        let new_file = create_segment(&new_path, LogHeader::new(new_version, last_committed_tx))?;
        let mut new_open = BTreeMap::new();
        if let Some(first) = state.open.values().min().copied() {
            let mut reader = state.file()?.reader(Some(first))?;
            while let Some(frame) = reader.next_frame()? {
                let Some(entry) = LogEntry::decode(&frame.body) else {
                    break;
                };
                if !state.open.contains_key(&entry.identifier()) {
                    continue;
                }
                let offset = new_file.append(&[&frame.body])?;
                if let LogEntry::Start { identifier, .. } = entry {
                    new_open.insert(identifier, offset);
                }
            }
        }
        new_file.force()?;
        self.write_marker(new_segment.mark())?;
        let copied = new_open.len();
        state.open = new_open;
        state.file = Some(new_file);
        state.segment = new_segment;
        self.release_segment(old_segment, old_version)?;
        info!(
            log = %self.name,
            from = old_version,
            to = new_version,
            copied,
            "xa.log.rotate"
        );
        Ok(())
    }

    /// Closes the log. Without open transactions the active segment is
    /// archived or deleted and the marker set to clean; otherwise the
    /// segment stays active for recovery on the next open.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(file) = state.file.take() else {
            return Ok(());
        };
        file.force()?;
        if !state.open.is_empty() {
            warn!(
                log = %self.name,
                open = state.open.len(),
                "xa.log.close.open_transactions"
            );
            return Ok(());
        }
        let version = file.header().log_version;
        drop(file);
        self.write_marker(MARK_CLEAN)?;
        self.release_segment(state.segment, version)?;
        debug!(log = %self.name, version, "xa.log.close");
        Ok(())
    }

    /// Versions of the archived segments in the log directory, ascending.
    pub fn history_versions(&self) -> Result<Vec<u64>> {
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|file| parse_history_version(&self.name, file))
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Path of the archived segment with `version`.
    pub fn history_path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.v{version}", self.name))
    }

    /// Counters of the active segment.
    pub fn stats(&self) -> Option<LogStats> {
        self.state.lock().file.as_ref().map(LogFile::stats)
    }

    fn release_segment(&self, segment: Segment, version: u64) -> Result<()> {
        let path = self.segment_path(segment);
        if self.options.keep_logs {
            let archived = self.history_path(version);
            fs::rename(&path, &archived)?;
            debug!(path = %archived.display(), "xa.log.archive");
        } else {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn segment_path(&self, segment: Segment) -> PathBuf {
        self.dir.join(format!("{}{}", self.name, segment.suffix()))
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(format!("{}.active", self.name))
    }

    fn read_marker(&self) -> Result<Option<u8>> {
        match fs::read(self.marker_path()) {
            Ok(bytes) => Ok(bytes.first().copied()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_marker(&self, mark: u8) -> Result<()> {
        let mut file = File::create(self.marker_path())?;
        file.write_all(&[mark])?;
        file.sync_all()?;
        Ok(())
    }
}

/// Version of an archived segment file name `<name>.v<version>`.
pub fn parse_history_version(name: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(name)?
        .strip_prefix(".v")?
        .parse()
        .ok()
}

fn create_segment(path: &Path, header: LogHeader) -> Result<LogFile> {
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path)?);
    LogFile::create(io, header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::xid::{BranchId, GlobalId};
    use tempfile::tempdir;

    const NAME: &str = "graph.log";

    fn xid(n: u64) -> Xid {
        Xid::new(GlobalId(n), BranchId(1))
    }

    #[test]
    fn entries_encode_type_and_identifier_first() {
        let entry = LogEntry::TwoPhaseCommit {
            identifier: 7,
            tx_id: 42,
        };
        let body = entry.encode();
        assert_eq!(body[0], ENTRY_TWO_PHASE_COMMIT);
        assert_eq!(&body[1..5], &7u32.to_be_bytes());
        assert_eq!(LogEntry::decode(&body), Some(entry));
        assert_eq!(LogEntry::decode(&body[..10]), None);
        assert_eq!(LogEntry::decode(&[99, 0, 0, 0, 1]), None);
    }

    #[test]
    fn clean_close_leaves_no_entries_to_recover() -> Result<()> {
        let dir = tempdir().unwrap();
        let (log, entries) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 0, 0)?;
        assert!(entries.is_empty());
        let id = log.next_identifier();
        log.write_transaction(id, xid(1), &[vec![3, 0]])?;
        log.commit(id, 1, true)?;
        log.done(id)?;
        log.close()?;
        assert_eq!(fs::read(dir.path().join("graph.log.active"))?, b"C");

        let (log, entries) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 1, 1)?;
        assert!(entries.is_empty());
        assert_eq!(log.current_version()?, 1);
        log.close()
    }

    #[test]
    fn crash_returns_entries_and_keeps_identifiers_unique() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let (log, _) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 0, 0)?;
            let a = log.next_identifier();
            log.write_transaction(a, xid(1), &[vec![3, 1], vec![3, 2]])?;
            log.prepare(a)?;
            let b = log.next_identifier();
            log.write_transaction(b, xid(2), &[])?;
            // Dropped without close.
        }
        let (log, entries) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 0, 0)?;
        let kinds: Vec<u8> = entries.iter().map(|e| e.entry.kind()).collect();
        assert_eq!(
            kinds,
            vec![ENTRY_START, ENTRY_COMMAND, ENTRY_COMMAND, ENTRY_PREPARE, ENTRY_START]
        );
        assert_eq!(log.open_transactions(), 2);
        assert_eq!(log.next_identifier(), 3);
        Ok(())
    }

    #[test]
    fn torn_tail_is_truncated() -> Result<()> {
        let dir = tempdir().unwrap();
        let segment = dir.path().join("graph.log.1");
        {
            let (log, _) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 0, 0)?;
            let a = log.next_identifier();
            log.write_transaction(a, xid(1), &[vec![3; 40]])?;
            log.commit(a, 1, true)?;
        }
        let len = fs::metadata(&segment)?.len();
        let file = fs::OpenOptions::new().write(true).open(&segment)?;
        file.set_len(len - 3)?;
        drop(file);

        let (log, entries) = LogicalLog::open(dir.path(), NAME, LogOptions::default(), 0, 0)?;
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[1].entry, LogEntry::Command { .. }));
        assert!(log.size()? < len);
        Ok(())
    }

    #[test]
    fn rotation_copies_open_transactions_and_archives() -> Result<()> {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            keep_logs: true,
            ..LogOptions::default()
        };
        let (log, _) = LogicalLog::open(dir.path(), NAME, options, 0, 0)?;
        let finished = log.next_identifier();
        log.write_transaction(finished, xid(1), &[vec![3, 9]])?;
        log.commit(finished, 1, true)?;
        log.done(finished)?;
        let pending = log.next_identifier();
        log.write_transaction(pending, xid(2), &[vec![3, 7]])?;
        log.prepare(pending)?;

        log.rotate(1, 1)?;
        assert_eq!(log.current_version()?, 1);
        assert_eq!(log.history_versions()?, vec![0]);
        assert!(log.history_path(0).exists());
        assert_eq!(fs::read(dir.path().join("graph.log.active"))?, b"2");
        drop(log);

        let (_log, entries) = LogicalLog::open(dir.path(), NAME, options, 1, 1)?;
        let ids: Vec<u32> = entries.iter().map(|e| e.entry.identifier()).collect();
        assert_eq!(ids, vec![pending; 3]);
        Ok(())
    }

    #[test]
    fn history_names_parse_only_exact_versions() {
        assert_eq!(parse_history_version(NAME, "graph.log.v12"), Some(12));
        assert_eq!(parse_history_version(NAME, "graph.log.1"), None);
        assert_eq!(parse_history_version(NAME, "graph.log.vx"), None);
        assert_eq!(parse_history_version(NAME, "other.v1"), None);
    }
}
