//! Error types for the transaction log and replication core.

use std::path::PathBuf;

use crate::core::wal::writer::AppendState;
use crate::types::TxId;

/// Errors raised by log appends, recovery and replica token creation.
#[derive(Debug, thiserror::Error)]
pub enum KiteError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// The channel failed while a transaction was being appended. The
  /// transaction is not committed; `state` records how far the append got.
  #[error("log write failed for tx {tx_id} at {state}: {source}")]
  LogWrite {
    tx_id: TxId,
    state: AppendState,
    #[source]
    source: std::io::Error,
  },

  #[error("log file already exists: {}", .0.display())]
  LogExists(PathBuf),

  #[error("invalid transaction log: {0}")]
  InvalidLog(String),

  #[error("version mismatch: file requires {required}, supported {current}")]
  VersionMismatch { required: u32, current: u32 },

  /// The primary could not be reached or rejected the call.
  #[error("remote {operation} failed: {message}")]
  Remote {
    operation: &'static str,
    message: String,
  },

  /// A transaction bundled with a primary response could not be applied.
  /// The replica's position relative to the primary is unknown afterwards.
  #[error("failed to apply bundled transaction #{index} (tx {tx_id}): {source}")]
  Unpack {
    index: usize,
    tx_id: TxId,
    #[source]
    source: Box<KiteError>,
  },

  #[error("invalid replication state: {0}")]
  InvalidReplication(String),

  #[error("serialization error: {0}")]
  Serialization(String),

  /// A failed append left a partial run that could not be cut off. The
  /// log refuses appends until it is reopened and recovered.
  #[error("log needs recovery before further appends: {0}")]
  NeedsRecovery(String),

  #[error("no {0} ids left")]
  TokenIdsExhausted(crate::token::TokenKind),

  #[error("log is opened read-only")]
  ReadOnly,

  #[error("internal error: {0}")]
  Internal(String),
}

impl KiteError {
  /// True when the replica may have diverged from the primary and should
  /// resynchronize before serving further work.
  pub fn is_replica_stale(&self) -> bool {
    matches!(self, KiteError::Unpack { .. })
  }

  pub(crate) fn remote(operation: &'static str, message: impl Into<String>) -> Self {
    KiteError::Remote {
      operation,
      message: message.into(),
    }
  }
}

pub type Result<T> = std::result::Result<T, KiteError>;
