//! Append-only JSONL ledger with segmented files and a live tail.
//!
//! History is truth: every entry is one newline-terminated JSON line,
//! written once and fsynced before `append` returns. Existing bytes are
//! never rewritten; rotation seals the current segment and opens a new
//! one. A single writer lock serializes appends; readers only ever see
//! fully written lines and skip a torn trailing record.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::events::{KernelEvent, LedgerEntry};

/// Rotation threshold for a single segment file.
const SEGMENT_MAX_BYTES: u64 = 64 * 1024 * 1024;

/// Capacity of the live-tail broadcast channel.
const LIVE_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The backing disk rejected the write; the event was NOT recorded
    /// and the caller must not drop it silently.
    #[error("storage full while appending to {0}")]
    StorageFull(String),

    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("corrupt record in segment {segment} at byte {offset}")]
    CorruptTail { segment: String, offset: u64 },

    #[error("ledger closed")]
    Closed,
}

/// Result type for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// ENOSPC, without pulling in libc.
fn is_disk_full(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(28)
}

/// Filter for bounded scans over the segment files.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub from_seq: u64,
    pub kinds: Option<Vec<String>>,
    pub mission_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl LedgerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seq(mut self, seq: u64) -> Self {
        self.from_seq = seq;
        self
    }

    pub fn kinds(mut self, kinds: Vec<&str>) -> Self {
        self.kinds = Some(kinds.into_iter().map(String::from).collect());
        self
    }

    pub fn mission(mut self, mission_id: &str) -> Self {
        self.mission_id = Some(mission_id.to_string());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &LedgerEntry) -> bool {
        if entry.seq < self.from_seq {
            return false;
        }
        if let Some(ref kinds) = self.kinds {
            if !kinds.iter().any(|k| k == entry.event.kind()) {
                return false;
            }
        }
        if let Some(ref mid) = self.mission_id {
            if entry.event.mission_id() != Some(mid.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.ts > until {
                return false;
            }
        }
        true
    }
}

struct Writer {
    file: File,
    date: NaiveDate,
    index: u32,
    bytes: u64,
    next_seq: u64,
    last_ts: DateTime<Utc>,
    last_digest: Option<String>,
}

/// The append-only event log. Sole owner of its directory.
pub struct Ledger {
    dir: PathBuf,
    name: String,
    max_segment_bytes: u64,
    writer: Mutex<Writer>,
    live: broadcast::Sender<Arc<LedgerEntry>>,
}

impl Ledger {
    /// Open (or create) the ledger under `dir` with the given segment
    /// name prefix. Recovers a torn tail on the active segment by
    /// truncating it to the last fully written record.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> LedgerResult<Ledger> {
        Self::open_with_limit(dir, name, SEGMENT_MAX_BYTES)
    }

    fn open_with_limit(
        dir: impl AsRef<Path>,
        name: &str,
        max_segment_bytes: u64,
    ) -> LedgerResult<Ledger> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let segments = list_segments(&dir, name)?;
        let (date, index) = match segments.last() {
            Some((path, date, index)) => {
                recover_segment(path)?;
                (*date, *index)
            }
            None => (Utc::now().date_naive(), 0),
        };

        // Seed seq / ts / digest from the newest valid record on disk.
        let mut next_seq = 0u64;
        let mut last_ts = DateTime::<Utc>::MIN_UTC;
        let mut last_digest = None;
        for (path, _, _) in segments.iter().rev() {
            if let Some(entry) = last_valid_entry(path)? {
                next_seq = entry.seq + 1;
                last_ts = entry.ts;
                last_digest = entry.digest.clone();
                break;
            }
        }

        let path = segment_path(&dir, name, date, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let bytes = file.metadata()?.len();
        mark_active(&dir, name, date, index)?;

        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Ok(Ledger {
            dir,
            name: name.to_string(),
            max_segment_bytes,
            writer: Mutex::new(Writer {
                file,
                date,
                index,
                bytes,
                next_seq,
                last_ts,
                last_digest,
            }),
            live,
        })
    }

    /// Durably append one event. Blocks until the line is flushed and
    /// fsynced on the active segment, then notifies live tails.
    pub fn append(&self, event: KernelEvent) -> LedgerResult<Arc<LedgerEntry>> {
        let entry = {
            let mut w = self.writer.lock().expect("ledger writer lock poisoned");

            let now = Utc::now();
            let ts = if now > w.last_ts { now } else { w.last_ts };
            self.maybe_rotate(&mut w, ts.date_naive())?;

            let mut entry = LedgerEntry {
                ts,
                seq: w.next_seq,
                event,
                digest: None,
            };
            let digest = entry.chained_digest(w.last_digest.as_deref())?;
            entry.digest = Some(digest.clone());

            let mut line = serde_json::to_vec(&entry)?;
            line.push(b'\n');
            let write_result = w.file.write_all(&line).and_then(|_| w.file.sync_data());
            if let Err(err) = write_result {
                if is_disk_full(&err) {
                    return Err(LedgerError::StorageFull(
                        segment_path(&self.dir, &self.name, w.date, w.index)
                            .display()
                            .to_string(),
                    ));
                }
                return Err(err.into());
            }

            w.bytes += line.len() as u64;
            w.next_seq = entry.seq + 1;
            w.last_ts = ts;
            w.last_digest = Some(digest);
            Arc::new(entry)
        };

        // No receivers is fine; the entry is already durable.
        let _ = self.live.send(entry.clone());
        debug!(seq = entry.seq, kind = entry.event.kind(), "ledger append");
        Ok(entry)
    }

    fn maybe_rotate(&self, w: &mut Writer, today: NaiveDate) -> LedgerResult<()> {
        if w.bytes < self.max_segment_bytes && today == w.date {
            return Ok(());
        }
        let old = (w.date, w.index);
        let (date, index) = if today == w.date {
            (w.date, w.index + 1)
        } else {
            (today, 0)
        };
        let path = segment_path(&self.dir, &self.name, date, index);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        unmark_active(&self.dir, &self.name, old.0, old.1);
        mark_active(&self.dir, &self.name, date, index)?;
        w.file = file;
        w.date = date;
        w.index = index;
        w.bytes = 0;
        debug!(segment = %path.display(), "ledger segment rotated");
        Ok(())
    }

    /// Bounded scan over all segments. Corrupt records are logged and
    /// skipped; earlier records in the same segment remain valid and the
    /// reader advances to the next segment.
    pub fn read(&self, filter: &LedgerFilter) -> LedgerResult<Vec<LedgerEntry>> {
        // Hold the writer lock briefly so we never race a rotation while
        // listing files; reads of sealed bytes need no lock.
        let segments = {
            let _w = self.writer.lock().expect("ledger writer lock poisoned");
            list_segments(&self.dir, &self.name)?
        };

        let mut out = Vec::new();
        'segments: for (path, _, _) in &segments {
            let file = File::open(path)?;
            let mut reader = BufReader::new(file);
            let mut offset = 0u64;
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line)?;
                if n == 0 {
                    break;
                }
                if !line.ends_with('\n') {
                    debug!(segment = %path.display(), offset, "partial tail skipped");
                    continue 'segments;
                }
                match serde_json::from_str::<LedgerEntry>(&line) {
                    Ok(entry) => {
                        if filter.matches(&entry) {
                            out.push(entry);
                            if let Some(limit) = filter.limit {
                                if out.len() >= limit {
                                    return Ok(out);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        warn!(
                            segment = %path.display(),
                            offset,
                            error = %err,
                            "corrupt ledger record skipped; advancing to next segment"
                        );
                        continue 'segments;
                    }
                }
                offset += n as u64;
            }
        }
        Ok(out)
    }

    /// Lazy, restartable sequence of entries in append order: catches up
    /// from disk starting at `from_seq`, then follows live appends.
    pub fn tail(self: &Arc<Self>, from_seq: u64) -> LedgerTail {
        // Subscribe before scanning so nothing appended in between is lost;
        // duplicates are filtered by sequence number.
        let rx = self.live.subscribe();
        LedgerTail {
            ledger: Arc::clone(self),
            rx,
            backlog: VecDeque::new(),
            next_seq: from_seq,
            caught_up: false,
        }
    }

}

/// A restartable reader over the ledger: replays history from a starting
/// sequence, then yields live entries as they are appended.
pub struct LedgerTail {
    ledger: Arc<Ledger>,
    rx: broadcast::Receiver<Arc<LedgerEntry>>,
    backlog: VecDeque<Arc<LedgerEntry>>,
    next_seq: u64,
    caught_up: bool,
}

impl LedgerTail {
    /// Next entry in append order. Pending when the tail has caught up
    /// and no new entry has been appended yet.
    pub async fn next(&mut self) -> LedgerResult<Arc<LedgerEntry>> {
        loop {
            if !self.caught_up {
                self.refill()?;
                self.caught_up = true;
            }
            if let Some(entry) = self.backlog.pop_front() {
                if entry.seq < self.next_seq {
                    continue;
                }
                self.next_seq = entry.seq + 1;
                return Ok(entry);
            }
            match self.rx.recv().await {
                Ok(entry) => {
                    if entry.seq < self.next_seq {
                        continue;
                    }
                    if entry.seq > self.next_seq {
                        // Missed entries (lag); re-sync from disk.
                        self.refill()?;
                        continue;
                    }
                    self.next_seq = entry.seq + 1;
                    return Ok(entry);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "ledger tail lagged; re-syncing from disk");
                    self.refill()?;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(LedgerError::Closed),
            }
        }
    }

    fn refill(&mut self) -> LedgerResult<()> {
        let entries = self
            .ledger
            .read(&LedgerFilter::new().from_seq(self.next_seq))?;
        self.backlog = entries.into_iter().map(Arc::new).collect();
        Ok(())
    }
}

fn segment_file_name(name: &str, date: NaiveDate, index: u32) -> String {
    format!("{name}-{}-{index:03}.jsonl", date.format("%Y%m%d"))
}

fn segment_path(dir: &Path, name: &str, date: NaiveDate, index: u32) -> PathBuf {
    dir.join(segment_file_name(name, date, index))
}

fn mark_active(dir: &Path, name: &str, date: NaiveDate, index: u32) -> LedgerResult<()> {
    let marker = dir.join(format!("{}.active", segment_file_name(name, date, index)));
    fs::write(marker, b"")?;
    Ok(())
}

fn unmark_active(dir: &Path, name: &str, date: NaiveDate, index: u32) {
    let marker = dir.join(format!("{}.active", segment_file_name(name, date, index)));
    if let Err(err) = fs::remove_file(&marker) {
        debug!(marker = %marker.display(), error = %err, "active marker removal failed");
    }
}

/// All segment files for `name`, sorted by (date, index).
fn list_segments(dir: &Path, name: &str) -> LedgerResult<Vec<(PathBuf, NaiveDate, u32)>> {
    let mut segments = Vec::new();
    for dent in fs::read_dir(dir)? {
        let dent = dent?;
        let file_name = dent.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if let Some((date, index)) = parse_segment_name(file_name, name) {
            segments.push((dent.path(), date, index));
        }
    }
    segments.sort_by_key(|(_, date, index)| (*date, *index));
    Ok(segments)
}

fn parse_segment_name(file_name: &str, name: &str) -> Option<(NaiveDate, u32)> {
    let rest = file_name.strip_prefix(name)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".jsonl")?;
    let (date_part, index_part) = rest.split_at(rest.len().checked_sub(4)?);
    let date_part = date_part.strip_suffix('-')?;
    let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
    let index: u32 = index_part.parse().ok()?;
    Some((date, index))
}

/// Truncate a torn trailing record, if any, from a segment file.
fn recover_segment(path: &Path) -> LedgerResult<()> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut valid_end = 0u64;
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if line.ends_with('\n') && serde_json::from_str::<LedgerEntry>(&line).is_ok() {
            valid_end += n as u64;
        } else {
            break;
        }
    }
    if valid_end < len {
        warn!(
            segment = %path.display(),
            truncated = len - valid_end,
            "torn tail truncated on recovery"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(valid_end)?;
        file.sync_data()?;
    }
    Ok(())
}

/// Newest parseable record in a segment, if any.
fn last_valid_entry(path: &Path) -> LedgerResult<Option<LedgerEntry>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut last = None;
    for line in reader.lines() {
        let line = line?;
        if let Ok(entry) = serde_json::from_str::<LedgerEntry>(&line) {
            last = Some(entry);
        }
    }
    Ok(last)
}
