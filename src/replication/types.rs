//! Replication role, request context and response types.

use std::fmt;

use crate::types::{CommittedTransaction, TxId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicationRole {
  /// Standalone instance; tokens are created locally.
  #[default]
  Disabled,
  Primary,
  Replica,
}

impl ReplicationRole {
  /// Whether this role assigns token ids itself.
  pub fn creates_tokens_locally(&self) -> bool {
    !matches!(self, ReplicationRole::Replica)
  }
}

/// Where a replica stands in the primary's history when it issues a request.
///
/// Rendered as `epoch:machine_id:event_id:last_applied_tx_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestContext {
  pub epoch: u64,
  pub machine_id: u32,
  /// Per-replica request counter; never reused.
  pub event_id: u64,
  pub last_applied_tx_id: TxId,
}

impl RequestContext {
  pub const fn new(epoch: u64, machine_id: u32, event_id: u64, last_applied_tx_id: TxId) -> Self {
    Self {
      epoch,
      machine_id,
      event_id,
      last_applied_tx_id,
    }
  }
}

impl fmt::Display for RequestContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}:{}:{}:{}",
      self.epoch, self.machine_id, self.event_id, self.last_applied_tx_id
    )
  }
}

/// Result of a call to the primary plus the transactions the caller has not
/// applied yet. The value may only be used once those are applied, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response<T> {
  value: T,
  transactions: Vec<CommittedTransaction>,
}

impl<T> Response<T> {
  pub fn new(value: T, transactions: Vec<CommittedTransaction>) -> Self {
    Self {
      value,
      transactions,
    }
  }

  /// Response with nothing to apply.
  pub fn empty(value: T) -> Self {
    Self::new(value, Vec::new())
  }

  /// The carried value. Not valid for use until the transactions are applied.
  pub fn value(&self) -> &T {
    &self.value
  }

  pub fn transactions(&self) -> &[CommittedTransaction] {
    &self.transactions
  }

  pub fn has_transactions(&self) -> bool {
    !self.transactions.is_empty()
  }

  /// Split into the value and the transactions to apply first.
  pub fn into_parts(self) -> (T, Vec<CommittedTransaction>) {
    (self.value, self.transactions)
  }
}
