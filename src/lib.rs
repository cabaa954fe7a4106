//! Transaction log and replica token creation.
//!
//! [`TxLog`](crate::core::log::TxLog) appends each transaction as START, its commands and
//! COMMIT to a CRC-framed log, one writer at a time, and on open discards any
//! transaction that never reached COMMIT. Replicas create schema tokens by
//! asking the primary ([`replication::Master`]); every answer carries the
//! transactions the replica is missing, and those are committed locally
//! before the token id is handed out.

pub mod constants;
pub mod core;
pub mod error;
pub mod replication;
pub mod token;
pub mod types;
pub mod util;

pub use crate::core::log::{
  open_tx_log, SyncMode, TransactionCommitProcess, TransactionIdStore, TxLog, TxLogOptions,
};
pub use error::{KiteError, Result};
pub use token::{TokenHolder, TokenKind};
pub use types::{Command, CommittedTransaction, TransactionRepresentation, TxId};
