//! The primary as seen from a replica, and an in-process primary.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::log::{TransactionCommitProcess, TxLog};
use crate::error::{KiteError, Result};
use crate::token::{TokenCommand, TokenKind, TokenRegistry};
use crate::types::{now_millis, MasterId, TransactionRepresentation};

use super::transport::{
  decode_token_request, decode_token_response, encode_token_request, encode_token_response,
  TokenRequest,
};
use super::types::{RequestContext, Response};

const CREATE_TOKEN: &str = "create_token";

/// Operations a replica invokes on its primary.
///
/// Every response carries the transactions the primary committed after the
/// caller's `context.last_applied_tx_id`. Timeouts and transport faults are
/// reported as [`KiteError::Remote`]; nothing here retries.
pub trait Master: Send + Sync {
  fn create_token(
    &self,
    kind: TokenKind,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>>;

  fn create_label(&self, context: &RequestContext, name: &str) -> Result<Response<u32>> {
    self.create_token(TokenKind::Label, context, name)
  }

  fn create_property_key(&self, context: &RequestContext, name: &str) -> Result<Response<u32>> {
    self.create_token(TokenKind::PropertyKey, context, name)
  }

  fn create_relationship_type(
    &self,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>> {
    self.create_token(TokenKind::RelationshipType, context, name)
  }
}

impl<M: Master + ?Sized> Master for Arc<M> {
  fn create_token(
    &self,
    kind: TokenKind,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>> {
    (**self).create_token(kind, context, name)
  }
}

/// Primary running in this process over its own transaction log.
pub struct LocalMaster {
  log: Arc<TxLog>,
  master_id: MasterId,
  epoch: u64,
  registry: Arc<Mutex<TokenRegistry>>,
}

impl LocalMaster {
  /// Serve tokens from `log`, rebuilding the token tables it already holds.
  pub fn open(log: Arc<TxLog>, master_id: MasterId, epoch: u64) -> Result<Self> {
    let registry = TokenRegistry::from_transactions(&log.committed_transactions()?)?;
    Ok(Self {
      log,
      master_id,
      epoch,
      registry: Arc::new(Mutex::new(registry)),
    })
  }

  pub fn epoch(&self) -> u64 {
    self.epoch
  }

  pub fn log(&self) -> &Arc<TxLog> {
    &self.log
  }

  /// Token tables, shared with the primary's own local token creators.
  pub fn registry(&self) -> Arc<Mutex<TokenRegistry>> {
    self.registry.clone()
  }

  /// Serve an encoded token request, returning the encoded response.
  pub fn handle_token_request(&self, payload: &[u8]) -> Result<Vec<u8>> {
    let request = decode_token_request(payload)?;
    let response = self.create_token(request.kind, &request.context, &request.name)?;
    encode_token_response(&response)
  }

  fn create_token_locked(
    &self,
    kind: TokenKind,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>> {
    if context.epoch != self.epoch {
      return Err(KiteError::InvalidReplication(format!(
        "request from epoch {} but primary is at epoch {}",
        context.epoch, self.epoch
      )));
    }

    let id = {
      let mut registry = self.registry.lock();
      match registry.get(kind, name) {
        Some(id) => id,
        None => {
          let id = registry.next_id(kind)?;
          let command = TokenCommand {
            kind,
            id,
            name: name.to_string(),
          }
          .encode()?;
          let transaction = TransactionRepresentation::new(vec![command]).with_header(
            self.master_id,
            context.machine_id,
            now_millis(),
            self.log.last_committed_tx_id(),
            Vec::new(),
          );
          let tx_id = self.log.commit(transaction)?;
          registry.insert(kind, name.to_string(), id);
          tracing::debug!(%kind, name, id, tx_id, requester = context.machine_id, "token created on primary");
          id
        }
      }
    };

    let transactions = self.log.transactions_after(context.last_applied_tx_id)?;
    Ok(Response::new(id, transactions))
  }
}

impl Master for LocalMaster {
  fn create_token(
    &self,
    kind: TokenKind,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>> {
    self
      .create_token_locked(kind, context, name)
      .map_err(|error| KiteError::remote(CREATE_TOKEN, error.to_string()))
  }
}

/// Request/response byte transport to a primary.
pub trait MasterTransport: Send + Sync {
  fn call(&self, operation: &'static str, payload: Vec<u8>) -> io::Result<Vec<u8>>;
}

impl<F> MasterTransport for F
where
  F: Fn(&'static str, Vec<u8>) -> io::Result<Vec<u8>> + Send + Sync,
{
  fn call(&self, operation: &'static str, payload: Vec<u8>) -> io::Result<Vec<u8>> {
    self(operation, payload)
  }
}

/// [`Master`] that encodes calls and ships them over a [`MasterTransport`].
pub struct RemoteMaster<T: MasterTransport> {
  transport: T,
}

impl<T: MasterTransport> RemoteMaster<T> {
  pub fn new(transport: T) -> Self {
    Self { transport }
  }
}

impl<T: MasterTransport> Master for RemoteMaster<T> {
  fn create_token(
    &self,
    kind: TokenKind,
    context: &RequestContext,
    name: &str,
  ) -> Result<Response<u32>> {
    let payload = encode_token_request(&TokenRequest {
      context: *context,
      kind,
      name: name.to_string(),
    })?;
    let reply = self
      .transport
      .call(CREATE_TOKEN, payload)
      .map_err(|error| KiteError::remote(CREATE_TOKEN, error.to_string()))?;
    decode_token_response(&reply)
  }
}
