//! Per-log owner of the append channel.
//!
//! `TxLog` serializes every append behind one mutex so the START, COMMAND*
//! and COMMIT entries of different transactions never interleave, tracks the
//! last committed transaction id, and recovers the file on open.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use crate::error::{KiteError, Result};
use crate::types::{CommittedTransaction, TransactionRepresentation, TxId, BASE_TX_ID};

use super::wal::channel::{FileLogChannel, LogChannel, MemoryLogChannel};
use super::wal::recovery::{scan_entries, scan_log, RecoveryReport};
use super::wal::writer::TransactionLogWriter;

/// How hard a commit pushes bytes to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
  /// fsync data and metadata on every commit.
  #[default]
  Full,
  /// fdatasync on every commit.
  Normal,
  /// Leave flushing to the OS. Commits may be lost on power failure.
  Off,
}

/// Options for [`open_tx_log`].
#[derive(Debug, Clone)]
pub struct TxLogOptions {
  pub create_if_missing: bool,
  pub create_new: bool,
  pub read_only: bool,
  pub sync_mode: SyncMode,
}

impl Default for TxLogOptions {
  fn default() -> Self {
    Self {
      create_if_missing: true,
      create_new: false,
      read_only: false,
      sync_mode: SyncMode::Full,
    }
  }
}

impl TxLogOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn create_if_missing(mut self, value: bool) -> Self {
    self.create_if_missing = value;
    self
  }

  /// Require a fresh log; opening fails with [`KiteError::LogExists`] if the
  /// file is already there.
  pub fn create_new(mut self, value: bool) -> Self {
    self.create_new = value;
    self
  }

  pub fn read_only(mut self, value: bool) -> Self {
    self.read_only = value;
    self
  }

  pub fn sync_mode(mut self, mode: SyncMode) -> Self {
    self.sync_mode = mode;
    self
  }
}

/// Source of the highest committed transaction id.
pub trait TransactionIdStore: Send + Sync {
  fn last_committed_tx_id(&self) -> TxId;
}

/// Commit path shared by local writers and the replica response unpacker.
pub trait TransactionCommitProcess: Send + Sync {
  /// Assign the next id to `transaction` and append it.
  fn commit(&self, transaction: TransactionRepresentation) -> Result<TxId>;

  /// Append a transaction under the id its primary assigned.
  ///
  /// Returns `false` if that id was already applied.
  fn commit_replicated(&self, committed: CommittedTransaction) -> Result<bool>;
}

/// A transaction log with single-writer append discipline.
pub struct TxLog {
  path: Option<PathBuf>,
  state: Mutex<LogState>,
  last_committed_tx_id: AtomicI64,
  read_only: bool,
}

struct LogState {
  writer: TransactionLogWriter<Box<dyn LogChannel>>,
  /// `(tx_id, START offset)` of every committed transaction, in id order.
  commits: Vec<(TxId, u64)>,
  /// Set once a failed append could not be rolled back. The channel then
  /// holds a partial run and only a reopen (recovery) may continue.
  broken: Option<String>,
}

impl std::fmt::Debug for TxLog {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TxLog")
      .field("path", &self.path)
      .field("last_committed_tx_id", &self.last_committed_tx_id())
      .field("read_only", &self.read_only)
      .finish()
  }
}

/// Open (and recover) a transaction log file.
pub fn open_tx_log(path: impl AsRef<Path>, options: TxLogOptions) -> Result<TxLog> {
  let path = path.as_ref();
  let exists = path.exists();

  if exists && options.create_new {
    return Err(KiteError::LogExists(path.to_path_buf()));
  }

  if !exists {
    if !options.create_if_missing || options.read_only {
      return Err(KiteError::InvalidLog(format!(
        "transaction log does not exist: {}",
        path.display()
      )));
    }
    return create_log_file(path, options.sync_mode);
  }

  let file = OpenOptions::new()
    .read(true)
    .write(!options.read_only)
    .open(path)?;
  let file_len = file.metadata()?.len();
  let mut channel = FileLogChannel::new(file, path, file_len, options.sync_mode)?;
  if !options.read_only {
    channel.lock_exclusive()?;
  }

  let bytes = std::fs::read(path)?;
  if bytes.is_empty() {
    if options.read_only {
      return Err(KiteError::InvalidLog(format!(
        "transaction log is empty: {}",
        path.display()
      )));
    }
    let writer = TransactionLogWriter::create(Box::new(channel) as Box<dyn LogChannel>)?;
    return Ok(TxLog::from_parts(
      Some(path.to_path_buf()),
      writer,
      Vec::new(),
      false,
    ));
  }

  let report = scan_log(&bytes)?;
  if report.discarded_bytes() > 0 {
    if options.read_only {
      tracing::debug!(
        path = %path.display(),
        discarded = report.discarded_bytes(),
        "read-only open ignores uncommitted log tail"
      );
    } else {
      tracing::warn!(
        path = %path.display(),
        discarded = report.discarded_bytes(),
        incomplete = report.incomplete.is_some(),
        "truncating uncommitted log tail"
      );
      channel.truncate(report.valid_length as u64)?;
      channel.flush()?;
    }
  }

  let last_committed = report.last_committed_tx_id().unwrap_or(BASE_TX_ID);
  tracing::debug!(
    path = %path.display(),
    committed = report.committed.len(),
    last_committed,
    "transaction log opened"
  );

  if !report.abandoned.is_empty() {
    tracing::debug!(
      path = %path.display(),
      abandoned = report.abandoned.len(),
      "log contains abandoned transaction runs"
    );
  }

  let writer = TransactionLogWriter::new(Box::new(channel) as Box<dyn LogChannel>);
  Ok(TxLog::from_parts(
    Some(path.to_path_buf()),
    writer,
    commit_index(&report),
    options.read_only,
  ))
}

fn commit_index(report: &RecoveryReport) -> Vec<(TxId, u64)> {
  report
    .committed
    .iter()
    .zip(&report.start_offsets)
    .map(|(tx, offset)| (tx.tx_id, *offset as u64))
    .collect()
}

fn create_log_file(path: &Path, sync_mode: SyncMode) -> Result<TxLog> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }

  let file = OpenOptions::new()
    .read(true)
    .write(true)
    .create_new(true)
    .open(path)
    .map_err(|error| match error.kind() {
      io::ErrorKind::AlreadyExists => KiteError::LogExists(path.to_path_buf()),
      _ => KiteError::Io(error),
    })?;
  let mut channel = FileLogChannel::new(file, path, 0, sync_mode)?;
  channel.lock_exclusive()?;

  let writer = TransactionLogWriter::create(Box::new(channel) as Box<dyn LogChannel>)?;
  sync_parent_dir(path.parent())?;

  tracing::debug!(path = %path.display(), "transaction log created");
  Ok(TxLog::from_parts(
    Some(path.to_path_buf()),
    writer,
    Vec::new(),
    false,
  ))
}

impl TxLog {
  /// Log kept entirely in memory.
  pub fn in_memory() -> Result<Self> {
    let writer = TransactionLogWriter::create(Box::new(MemoryLogChannel::new()) as Box<dyn LogChannel>)?;
    Ok(Self::from_parts(None, writer, Vec::new(), false))
  }

  /// Log over a caller-supplied channel that is still empty.
  pub fn with_channel(channel: Box<dyn LogChannel>) -> Result<Self> {
    let writer = TransactionLogWriter::create(channel)?;
    Ok(Self::from_parts(None, writer, Vec::new(), false))
  }

  fn from_parts(
    path: Option<PathBuf>,
    writer: TransactionLogWriter<Box<dyn LogChannel>>,
    commits: Vec<(TxId, u64)>,
    read_only: bool,
  ) -> Self {
    let last_committed_tx_id = commits.last().map_or(BASE_TX_ID, |(tx_id, _)| *tx_id);
    Self {
      path,
      state: Mutex::new(LogState {
        writer,
        commits,
        broken: None,
      }),
      last_committed_tx_id: AtomicI64::new(last_committed_tx_id),
      read_only,
    }
  }

  pub fn path(&self) -> Option<&Path> {
    self.path.as_deref()
  }

  pub fn last_committed_tx_id(&self) -> TxId {
    self.last_committed_tx_id.load(Ordering::SeqCst)
  }

  /// Every committed transaction, in commit order.
  pub fn committed_transactions(&self) -> Result<Vec<CommittedTransaction>> {
    self.transactions_after(BASE_TX_ID)
  }

  /// Committed transactions with an id greater than `tx_id`.
  ///
  /// Only the log suffix starting at the first such transaction is read.
  pub fn transactions_after(&self, tx_id: TxId) -> Result<Vec<CommittedTransaction>> {
    let bytes = {
      let state = self.state.lock();
      let first = state.commits.partition_point(|(committed, _)| *committed <= tx_id);
      match state.commits.get(first) {
        Some((_, offset)) => state.writer.channel().read_from(*offset)?,
        None => return Ok(Vec::new()),
      }
    };
    let mut committed = scan_entries(&bytes, 0)?.committed;
    committed.retain(|tx| tx.tx_id > tx_id);
    Ok(committed)
  }

  /// Whether appends are refused until the log is reopened.
  pub fn needs_recovery(&self) -> bool {
    self.state.lock().broken.is_some()
  }

  /// Flush and release the log.
  pub fn close(self) -> Result<()> {
    let mut state = self.state.into_inner();
    state.writer.channel_mut().close()?;
    Ok(())
  }

  fn append_locked(
    &self,
    state: &mut LogState,
    transaction: &TransactionRepresentation,
    tx_id: TxId,
  ) -> Result<()> {
    if let Some(reason) = &state.broken {
      return Err(KiteError::NeedsRecovery(reason.clone()));
    }

    let rollback_to = state.writer.position();
    if let Err(error) = state.writer.append(transaction, tx_id) {
      // Cut the partial run so the next append starts on a commit boundary.
      if let Err(truncate_error) = state.writer.channel_mut().truncate(rollback_to) {
        tracing::warn!(
          tx_id,
          rollback_to,
          error = %truncate_error,
          "could not roll back partial append, refusing further appends"
        );
        state.broken = Some(format!(
          "rollback of tx {tx_id} to offset {rollback_to} failed: {truncate_error}"
        ));
      }
      return Err(error);
    }
    state.commits.push((tx_id, rollback_to));
    self.last_committed_tx_id.store(tx_id, Ordering::SeqCst);
    Ok(())
  }
}

impl TransactionIdStore for TxLog {
  fn last_committed_tx_id(&self) -> TxId {
    TxLog::last_committed_tx_id(self)
  }
}

impl TransactionCommitProcess for TxLog {
  fn commit(&self, transaction: TransactionRepresentation) -> Result<TxId> {
    if self.read_only {
      return Err(KiteError::ReadOnly);
    }

    let mut state = self.state.lock();
    let tx_id = self.last_committed_tx_id().saturating_add(1);
    self.append_locked(&mut state, &transaction, tx_id)?;
    Ok(tx_id)
  }

  fn commit_replicated(&self, committed: CommittedTransaction) -> Result<bool> {
    if self.read_only {
      return Err(KiteError::ReadOnly);
    }

    let mut state = self.state.lock();
    let last = self.last_committed_tx_id();
    if committed.tx_id <= last {
      tracing::trace!(tx_id = committed.tx_id, last, "replicated transaction already applied");
      return Ok(false);
    }
    if committed.tx_id != last + 1 {
      return Err(KiteError::InvalidReplication(format!(
        "replicated transaction {} does not follow last applied {last}",
        committed.tx_id
      )));
    }

    self.append_locked(&mut state, &committed.transaction, committed.tx_id)?;
    Ok(true)
  }
}

fn sync_parent_dir(parent: Option<&Path>) -> Result<()> {
  #[cfg(unix)]
  {
    // A bare file name has an empty parent: the working directory.
    let parent = match parent {
      Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
      Some(parent) => parent,
      None => return Ok(()),
    };
    File::open(parent)?.sync_all()?;
  }

  #[cfg(not(unix))]
  {
    let _ = parent;
  }

  Ok(())
}
