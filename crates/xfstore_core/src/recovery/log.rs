//! Per-transaction recovery logs.
//!
//! ```text
//! x                   <- status line, fixed width, rewritten in place
//! R /series/path      <- range path touched
//! C /points/path      <- point path touched
//! S /blob/path/name   <- blob modified
//! O 42                <- commit order, written before status `x`
//! ```
//!
//! The log file is created on the first record, so a transaction that never
//! enrolls an item leaves nothing on disk. Journals live next to the log as
//! `<stem>.journal` and `<stem>.pjournal` and are created on first append.

use crate::dir::sync_dir;
use crate::error::{CoreError, CoreResult};
use crate::item::ItemJournals;
use crate::journal::Journal;
use crate::types::Xid;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xfstore_storage::ItemId;

const STATUS_WIDTH: usize = 20;

pub(crate) const LOCAL_EXT: &str = "local";
pub(crate) const XA_EXT: &str = "xa";
pub(crate) const RANGE_JOURNAL_EXT: &str = "journal";
pub(crate) const POINTS_JOURNAL_EXT: &str = "pjournal";

/// Final state of a distributed transaction resolved without its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeadState {
    /// Recovery committed the branch.
    Committed,
    /// Recovery rolled the branch back.
    Rollback,
    /// Part of the branch committed and part did not.
    HeuristicMixed,
}

impl DeadState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Committed => "COMMITTED",
            Self::Rollback => "ROLLBACK",
            Self::HeuristicMixed => "HEURISTIC_MIXED",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "COMMITTED" => Some(Self::Committed),
            "ROLLBACK" => Some(Self::Rollback),
            "HEURISTIC_MIXED" => Some(Self::HeuristicMixed),
            _ => None,
        }
    }
}

/// The last lifecycle state a transaction reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStatus {
    /// Running; nothing is durable yet.
    Clean,
    /// Prepared; journals and metadata are durable.
    Preparing,
    /// The commit decision is durable.
    Committing,
    /// Rollback was decided.
    RolledBack,
    /// Resolved by recovery, kept until its manager forgets it.
    Dead(DeadState),
}

impl LogStatus {
    fn encode(self) -> String {
        match self {
            Self::Clean => "c".to_string(),
            Self::Preparing => "p".to_string(),
            Self::Committing => "x".to_string(),
            Self::RolledBack => "r".to_string(),
            Self::Dead(state) => format!("d{}", state.as_str()),
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "c" => Some(Self::Clean),
            "p" => Some(Self::Preparing),
            "x" => Some(Self::Committing),
            "r" => Some(Self::RolledBack),
            _ => DeadState::parse(text.strip_prefix('d')?).map(Self::Dead),
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn status_line(status: LogStatus) -> String {
    format!("{:<width$}\n", status.encode(), width = STATUS_WIDTH - 1)
}

/// Returns the log path of a transaction.
pub(crate) fn log_path(dir: &Path, xid: &Xid) -> PathBuf {
    let ext = if xid.is_global() { XA_EXT } else { LOCAL_EXT };
    dir.join(format!("{}.{ext}", xid.file_stem()))
}

/// Returns the range and point journal paths of a transaction.
pub(crate) fn journal_paths(dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{stem}.{RANGE_JOURNAL_EXT}")),
        dir.join(format!("{stem}.{POINTS_JOURNAL_EXT}")),
    )
}

/// Rewrites the status line of an existing log.
pub(crate) fn rewrite_status(path: &Path, status: LogStatus, sync: bool) -> CoreResult<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(status_line(status).as_bytes())?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Removes a log and both journals of `stem`.
pub(crate) fn discard_files(dir: &Path, log: &Path, stem: &str) -> CoreResult<()> {
    let (range, points) = journal_paths(dir, stem);
    remove_if_present(&range)?;
    remove_if_present(&points)?;
    remove_if_present(log)
}

#[derive(Default)]
struct LogState {
    file: Option<File>,
    status: Option<LogStatus>,
    closed: bool,
    ranges: BTreeSet<String>,
    points: BTreeSet<String>,
    blobs: BTreeSet<ItemId>,
    range_journal: Option<Arc<Journal>>,
    points_journal: Option<Arc<Journal>>,
}

/// The recovery log and journals of one live transaction.
pub struct TransactionLog {
    xid: Xid,
    stem: String,
    dir: PathBuf,
    path: PathBuf,
    sync: bool,
    state: Mutex<LogState>,
}

impl TransactionLog {
    pub(crate) fn new(dir: &Path, xid: Xid, sync: bool) -> Self {
        Self {
            stem: xid.file_stem(),
            path: log_path(dir, &xid),
            dir: dir.to_path_buf(),
            xid,
            sync,
            state: Mutex::new(LogState::default()),
        }
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last status written, if the log exists.
    #[must_use]
    pub fn status(&self) -> Option<LogStatus> {
        self.state.lock().status
    }

    fn open_file<'a>(&self, state: &'a mut LogState) -> CoreResult<&'a mut File> {
        if state.file.is_none() {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&self.path)?;
            file.write_all(status_line(LogStatus::Clean).as_bytes())?;
            if self.sync {
                file.sync_all()?;
                sync_dir(&self.dir)?;
            }
            state.status = Some(LogStatus::Clean);
            state.file = Some(file);
        }
        state
            .file
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("recovery log not open"))
    }

    fn append_line(&self, state: &mut LogState, line: &str) -> CoreResult<()> {
        let sync = self.sync;
        let file = self.open_file(state)?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    fn set_status(&self, state: &mut LogState, status: LogStatus) -> CoreResult<()> {
        let sync = self.sync;
        let file = self.open_file(state)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(status_line(status).as_bytes())?;
        if sync {
            file.sync_data()?;
        }
        state.status = Some(status);
        Ok(())
    }

    fn check_open(&self, state: &LogState) -> CoreResult<()> {
        if state.closed {
            return Err(CoreError::enrollment_closed(&self.xid));
        }
        Ok(())
    }

    /// Records that a range item under `path` is enrolled.
    pub(crate) fn record_range_path(&self, path: &str) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if state.ranges.insert(path.to_string()) {
            self.append_line(&mut state, &format!("R {path}"))?;
        }
        Ok(())
    }

    /// Records that a point item under `path` is enrolled.
    pub(crate) fn record_points_path(&self, path: &str) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if state.points.insert(path.to_string()) {
            self.append_line(&mut state, &format!("C {path}"))?;
        }
        Ok(())
    }

    /// Makes journals durable and marks the transaction prepared.
    pub(crate) fn prepare_reached(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        for journal in [&state.range_journal, &state.points_journal]
            .into_iter()
            .flatten()
        {
            journal.flush()?;
            if self.sync {
                journal.sync()?;
            }
        }
        self.set_status(&mut state, LogStatus::Preparing)
    }

    /// Writes the commit order and marks the commit decision durable.
    ///
    /// No item can enroll afterwards.
    pub(crate) fn commit_reached(&self, order: u64) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        self.append_line(&mut state, &format!("O {order}"))?;
        self.set_status(&mut state, LogStatus::Committing)
    }

    /// Marks rollback decided if the log exists.
    pub(crate) fn rollback_reached(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        if state.file.is_none() {
            return Ok(());
        }
        self.set_status(&mut state, LogStatus::RolledBack)
    }

    /// Returns the journal files that exist.
    pub(crate) fn journal_files(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        let state = self.state.lock();
        (
            state.range_journal.as_ref().map(|j| j.path().to_path_buf()),
            state.points_journal.as_ref().map(|j| j.path().to_path_buf()),
        )
    }

    /// Deletes the log and journals.
    pub(crate) fn discard(&self) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.file = None;
        state.range_journal = None;
        state.points_journal = None;
        discard_files(&self.dir, &self.path, &self.stem)
    }

    fn journal(&self, points: bool) -> CoreResult<Arc<Journal>> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        let slot = if points {
            &mut state.points_journal
        } else {
            &mut state.range_journal
        };
        if let Some(journal) = slot {
            return Ok(Arc::clone(journal));
        }
        let (range, point) = journal_paths(&self.dir, &self.stem);
        let journal = Arc::new(Journal::open(if points { &point } else { &range })?);
        *slot = Some(Arc::clone(&journal));
        Ok(journal)
    }
}

impl ItemJournals for TransactionLog {
    fn range_journal(&self) -> CoreResult<Arc<Journal>> {
        self.journal(false)
    }

    fn points_journal(&self) -> CoreResult<Arc<Journal>> {
        self.journal(true)
    }

    fn record_modified_blob(&self, id: &ItemId) -> CoreResult<()> {
        let mut state = self.state.lock();
        self.check_open(&state)?;
        if state.blobs.insert(id.clone()) {
            self.append_line(&mut state, &format!("S {id}"))?;
        }
        Ok(())
    }
}

impl fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionLog")
            .field("xid", &self.xid)
            .field("path", &self.path)
            .field("status", &self.state.lock().status)
            .finish_non_exhaustive()
    }
}

/// A recovery log read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLog {
    /// The transaction the log belongs to.
    pub xid: Xid,
    /// Path of the log file.
    pub path: PathBuf,
    /// Last status reached. An empty log reads as rolled back.
    pub status: LogStatus,
    /// Range paths touched.
    pub ranges: Vec<String>,
    /// Point paths touched.
    pub points: Vec<String>,
    /// Blob items modified.
    pub blobs: Vec<ItemId>,
    /// Commit order, once the outcome was decided.
    pub order: Option<u64>,
}

impl ParsedLog {
    /// Returns the transaction's file stem.
    #[must_use]
    pub fn stem(&self) -> String {
        self.xid.file_stem()
    }
}

/// Parses the log at `path`.
///
/// A final line without a newline was never completely written and is
/// ignored.
///
/// # Errors
///
/// Returns `RecoveryAborted` for an unknown status, a malformed line, or a
/// committing log without a commit order.
pub fn parse_log(path: &Path) -> CoreResult<ParsedLog> {
    let abort = |why: String| CoreError::recovery_aborted(format!("{}: {why}", path.display()));

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| abort("log name is not UTF-8".to_string()))?;
    let xid = Xid::from_file_stem(stem).map_err(|e| abort(e.to_string()))?;
    let text = fs::read_to_string(path)?;

    let complete = match text.rfind('\n') {
        Some(end) => &text[..end],
        None => "",
    };
    let mut parsed = ParsedLog {
        xid,
        path: path.to_path_buf(),
        status: LogStatus::RolledBack,
        ranges: Vec::new(),
        points: Vec::new(),
        blobs: Vec::new(),
        order: None,
    };
    if complete.is_empty() {
        return Ok(parsed);
    }

    let mut lines = complete.split('\n');
    let first = lines.next().unwrap_or_default().trim_end();
    parsed.status =
        LogStatus::parse(first).ok_or_else(|| abort(format!("unknown status {first:?}")))?;

    for line in lines.filter(|l| !l.is_empty()) {
        let (tag, value) = line
            .split_once(' ')
            .ok_or_else(|| abort(format!("malformed line {line:?}")))?;
        match tag {
            "R" => parsed.ranges.push(value.to_string()),
            "C" => parsed.points.push(value.to_string()),
            "S" => parsed.blobs.push(
                ItemId::parse(value).map_err(|e| abort(format!("bad blob id: {e}")))?,
            ),
            "O" => {
                parsed.order = Some(
                    value
                        .parse()
                        .map_err(|_| abort(format!("bad commit order {value:?}")))?,
                );
            }
            _ => return Err(abort(format!("malformed line {line:?}"))),
        }
    }

    if parsed.status == LogStatus::Committing && parsed.order.is_none() {
        return Err(abort("committing log has no commit order".to_string()));
    }
    Ok(parsed)
}
