//! Three-phase transaction append: START, COMMAND*, COMMIT.

use std::fmt;

use crate::error::{KiteError, Result};
use crate::types::{TransactionRepresentation, TxId};

use super::channel::LogChannel;
use super::record::LogEntryWriter;

/// How far an append has progressed.
///
/// Only `Committed` means the transaction is durable. Anything short of it
/// is discarded by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendState {
  NotStarted,
  Started { commands_written: usize },
  Committed,
}

impl AppendState {
  pub fn is_committed(&self) -> bool {
    matches!(self, AppendState::Committed)
  }
}

impl fmt::Display for AppendState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AppendState::NotStarted => write!(f, "not-started"),
      AppendState::Started { commands_written } => {
        write!(f, "started ({commands_written} commands written)")
      }
      AppendState::Committed => write!(f, "committed"),
    }
  }
}

/// Appends whole transactions to a log channel.
///
/// Holds `&mut self` for the full append, so one writer never interleaves
/// two transactions. Sharing a writer between threads needs an outer lock
/// (see [`crate::core::log::TxLog`]).
#[derive(Debug)]
pub struct TransactionLogWriter<C: LogChannel> {
  writer: LogEntryWriter<C>,
  last_state: AppendState,
}

impl<C: LogChannel> TransactionLogWriter<C> {
  /// Writer over a channel that already holds a valid log header.
  pub fn new(channel: C) -> Self {
    Self {
      writer: LogEntryWriter::new(channel),
      last_state: AppendState::NotStarted,
    }
  }

  /// Writer over an empty channel; writes the log header first.
  pub fn create(channel: C) -> Result<Self> {
    let mut writer = LogEntryWriter::new(channel);
    writer.write_log_header()?;
    writer.channel_mut().flush()?;
    Ok(Self {
      writer,
      last_state: AppendState::NotStarted,
    })
  }

  /// Append `transaction` under `tx_id`.
  ///
  /// Returns once the COMMIT entry is written and the channel flushed. On
  /// error nothing is retried and the transaction must be treated as not
  /// committed; [`KiteError::LogWrite`] carries the state reached.
  pub fn append(&mut self, transaction: &TransactionRepresentation, tx_id: TxId) -> Result<()> {
    let mut state = AppendState::NotStarted;
    let result = self.append_phases(transaction, tx_id, &mut state);
    self.last_state = state;

    result.map_err(|source| {
      tracing::warn!(tx_id, %state, error = %source, "transaction append failed");
      KiteError::LogWrite {
        tx_id,
        state,
        source,
      }
    })?;

    tracing::trace!(
      tx_id,
      commands = transaction.commands().len(),
      "transaction appended"
    );
    Ok(())
  }

  fn append_phases(
    &mut self,
    transaction: &TransactionRepresentation,
    tx_id: TxId,
    state: &mut AppendState,
  ) -> std::io::Result<()> {
    self.writer.write_start(
      transaction.master_id(),
      transaction.author_id(),
      transaction.time_written(),
      transaction.latest_committed_tx_when_started(),
      transaction.additional_header(),
    )?;
    *state = AppendState::Started {
      commands_written: 0,
    };

    for (index, command) in transaction.commands().iter().enumerate() {
      self.writer.write_command(command.payload())?;
      *state = AppendState::Started {
        commands_written: index + 1,
      };
    }

    self
      .writer
      .write_commit(tx_id, transaction.time_written())?;
    self.writer.channel_mut().flush()?;
    *state = AppendState::Committed;
    Ok(())
  }

  /// State the most recent append stopped in.
  pub fn last_state(&self) -> AppendState {
    self.last_state
  }

  pub fn position(&self) -> u64 {
    self.writer.channel().position()
  }

  pub fn channel(&self) -> &C {
    self.writer.channel()
  }

  pub fn channel_mut(&mut self) -> &mut C {
    self.writer.channel_mut()
  }

  pub fn into_channel(self) -> C {
    self.writer.into_channel()
  }
}
