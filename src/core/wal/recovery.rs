//! Recovery scan over a transaction log.
//!
//! Rebuilds committed transactions from the entry stream. A START..COMMAND*
//! run with no COMMIT, or a torn/corrupt trailing entry, is reported but
//! never exposed as committed. A run cut short by a failed append may be
//! followed by further transactions; the next START abandons it.

use std::path::Path;

use crate::error::{KiteError, Result};
use crate::types::{Command, CommittedTransaction, TransactionRepresentation, TxId};

use super::record::{parse_log_header, EntryRead, LogEntry, LogEntryReader};

/// A START that never reached its COMMIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteTransaction {
  /// Byte offset of the START entry.
  pub start_offset: usize,
  pub commands_written: usize,
}

/// What a recovery scan found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
  /// Committed transactions in log order.
  pub committed: Vec<CommittedTransaction>,
  /// Offset of the START entry of each committed transaction.
  pub start_offsets: Vec<usize>,
  /// Runs superseded by a later START before reaching COMMIT.
  pub abandoned: Vec<IncompleteTransaction>,
  /// Trailing run with no COMMIT.
  pub incomplete: Option<IncompleteTransaction>,
  /// Length of the prefix that ends after the last COMMIT (or the header).
  pub valid_length: usize,
  /// Total bytes scanned.
  pub scanned_length: usize,
  /// A torn or checksum-failing trailing entry was hit.
  pub damaged_tail: bool,
}

impl RecoveryReport {
  pub fn last_committed_tx_id(&self) -> Option<TxId> {
    self.committed.last().map(|tx| tx.tx_id)
  }

  pub fn is_committed(&self, tx_id: TxId) -> bool {
    self.committed.iter().any(|tx| tx.tx_id == tx_id)
  }

  /// Bytes past the committed prefix that recovery discards.
  pub fn discarded_bytes(&self) -> usize {
    self.scanned_length - self.valid_length
  }
}

struct OpenTransaction {
  start_offset: usize,
  master_id: u32,
  author_id: u32,
  time_written: i64,
  last_committed_tx: TxId,
  header: Vec<u8>,
  commands: Vec<Command>,
}

impl OpenTransaction {
  fn incomplete(&self) -> IncompleteTransaction {
    IncompleteTransaction {
      start_offset: self.start_offset,
      commands_written: self.commands.len(),
    }
  }
}

/// Scan a complete log image (header included).
pub fn scan_log(bytes: &[u8]) -> Result<RecoveryReport> {
  let first_entry = parse_log_header(bytes)?;
  scan_entries(bytes, first_entry)
}

/// Scan the entries of `bytes` starting at `start`, which must be an entry
/// boundary outside any transaction. Offsets in the report index `bytes`.
pub fn scan_entries(bytes: &[u8], start: usize) -> Result<RecoveryReport> {
  let mut reader = LogEntryReader::new(bytes, start);
  let mut report = RecoveryReport {
    valid_length: start,
    scanned_length: bytes.len(),
    ..RecoveryReport::default()
  };
  let mut open: Option<OpenTransaction> = None;

  loop {
    match reader.read_next() {
      EntryRead::Entry { entry, offset } => match entry {
        LogEntry::Start {
          master_id,
          author_id,
          time_written,
          last_committed_tx,
          header,
        } => {
          if let Some(previous) = open.take() {
            tracing::debug!(
              offset = previous.start_offset,
              commands = previous.commands.len(),
              "transaction abandoned before commit"
            );
            report.abandoned.push(previous.incomplete());
          }
          open = Some(OpenTransaction {
            start_offset: offset,
            master_id,
            author_id,
            time_written,
            last_committed_tx,
            header,
            commands: Vec::new(),
          });
        }
        LogEntry::Command { payload } => match open.as_mut() {
          Some(tx) => tx.commands.push(Command::new(payload)),
          None => {
            return Err(KiteError::InvalidLog(format!(
              "COMMAND at offset {offset} outside a transaction"
            )));
          }
        },
        LogEntry::Commit { tx_id, .. } => {
          let tx = open.take().ok_or_else(|| {
            KiteError::InvalidLog(format!("COMMIT at offset {offset} without START"))
          })?;
          if let Some(previous) = report.last_committed_tx_id() {
            if tx_id <= previous {
              return Err(KiteError::InvalidLog(format!(
                "COMMIT at offset {offset} has tx id {tx_id}, not after {previous}"
              )));
            }
          }
          let transaction = TransactionRepresentation::new(tx.commands).with_header(
            tx.master_id,
            tx.author_id,
            tx.time_written,
            tx.last_committed_tx,
            tx.header,
          );
          report
            .committed
            .push(CommittedTransaction::new(tx_id, transaction));
          report.start_offsets.push(tx.start_offset);
          report.valid_length = reader.offset();
        }
      },
      EntryRead::End => break,
      EntryRead::Torn { offset } => {
        tracing::debug!(offset, "torn entry at log tail");
        report.damaged_tail = true;
        break;
      }
      EntryRead::Corrupt { offset, reason } => {
        tracing::warn!(offset, %reason, "corrupt entry in log, treating rest as absent");
        report.damaged_tail = true;
        break;
      }
    }
  }

  report.incomplete = open.map(|tx| tx.incomplete());

  Ok(report)
}

/// Read and scan a log file.
pub fn recover_file(path: impl AsRef<Path>) -> Result<RecoveryReport> {
  let bytes = std::fs::read(path.as_ref())?;
  scan_log(&bytes)
}
