//! Request context stamping for calls from a replica to its primary.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::log::TransactionIdStore;

use super::types::RequestContext;

/// Produces a fresh [`RequestContext`] for each outbound request.
pub trait RequestContextFactory: Send + Sync {
  fn new_request_context(&self) -> RequestContext;
}

/// Stamps requests with this replica's machine id, the epoch of the primary
/// it follows, and the last transaction it has applied locally.
pub struct ReplicaRequestContextFactory {
  machine_id: u32,
  epoch: AtomicU64,
  next_event_id: AtomicU64,
  tx_ids: Arc<dyn TransactionIdStore>,
}

impl ReplicaRequestContextFactory {
  pub fn new(machine_id: u32, epoch: u64, tx_ids: Arc<dyn TransactionIdStore>) -> Self {
    Self {
      machine_id,
      epoch: AtomicU64::new(epoch),
      next_event_id: AtomicU64::new(1),
      tx_ids,
    }
  }

  pub fn machine_id(&self) -> u32 {
    self.machine_id
  }

  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::SeqCst)
  }

  /// Record that a different primary (a new epoch) is now followed.
  pub fn set_epoch(&self, epoch: u64) {
    let previous = self.epoch.swap(epoch, Ordering::SeqCst);
    if previous != epoch {
      tracing::debug!(machine_id = self.machine_id, previous, epoch, "request epoch changed");
    }
  }
}

impl RequestContextFactory for ReplicaRequestContextFactory {
  fn new_request_context(&self) -> RequestContext {
    let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
    RequestContext::new(
      self.epoch(),
      self.machine_id,
      event_id,
      self.tx_ids.last_committed_tx_id(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::{ReplicaRequestContextFactory, RequestContextFactory};
  use crate::core::log::{TransactionCommitProcess, TxLog};
  use crate::types::{Command, TransactionRepresentation};
  use std::sync::Arc;

  #[test]
  fn contexts_track_applied_position_and_never_reuse_events() {
    let log = Arc::new(TxLog::in_memory().expect("log"));
    let factory = ReplicaRequestContextFactory::new(3, 5, log.clone());

    let first = factory.new_request_context();
    assert_eq!(first.machine_id, 3);
    assert_eq!(first.epoch, 5);
    assert_eq!(first.last_applied_tx_id, 0);

    log
      .commit(TransactionRepresentation::new(vec![Command::new(b"x".as_slice())]))
      .expect("commit");
    factory.set_epoch(6);

    let second = factory.new_request_context();
    assert_eq!(second.last_applied_tx_id, 1);
    assert_eq!(second.epoch, 6);
    assert!(second.event_id > first.event_id);
  }
}
