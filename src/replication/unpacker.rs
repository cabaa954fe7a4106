//! Applies transactions bundled with a primary response before releasing
//! the response value.

use std::sync::Arc;

use crate::core::log::TransactionCommitProcess;
use crate::error::{KiteError, Result};

use super::types::Response;

/// Drives the replica's commit path with a response's bundled transactions.
///
/// Transactions are applied strictly in delivered order. Ids the replica
/// already has are skipped, so a replayed response completes trivially.
#[derive(Clone)]
pub struct TransactionCommittingResponseUnpacker {
  commit_process: Arc<dyn TransactionCommitProcess>,
}

impl TransactionCommittingResponseUnpacker {
  pub fn new(commit_process: Arc<dyn TransactionCommitProcess>) -> Self {
    Self { commit_process }
  }

  /// Apply every bundled transaction, then hand back the value.
  ///
  /// If bundled transaction `index` cannot be applied the value is dropped
  /// and [`KiteError::Unpack`] is returned.
  pub fn unpack_response<T>(&self, response: Response<T>) -> Result<T> {
    let (value, transactions) = response.into_parts();
    let delivered = transactions.len();
    let mut applied = 0usize;

    for (index, committed) in transactions.into_iter().enumerate() {
      let tx_id = committed.tx_id;
      match self.commit_process.commit_replicated(committed) {
        Ok(true) => applied += 1,
        Ok(false) => {}
        Err(source) => {
          tracing::warn!(index, tx_id, error = %source, "failed to apply bundled transaction");
          return Err(KiteError::Unpack {
            index,
            tx_id,
            source: Box::new(source),
          });
        }
      }
    }

    if delivered > 0 {
      tracing::debug!(delivered, applied, "response transactions applied");
    }
    Ok(value)
  }
}
