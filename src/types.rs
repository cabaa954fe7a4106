//! Core value types shared by the log writer and the replication path.

use std::fmt;

/// Transaction id assigned at commit time. Ids start at [`BASE_TX_ID`] + 1.
pub type TxId = i64;

/// Identifier of the primary that authored a transaction.
pub type MasterId = u32;

/// Identifier of the instance whose client started a transaction.
pub type AuthorId = u32;

/// Id of the empty log: no transaction has been committed yet.
pub const BASE_TX_ID: TxId = 0;

/// One opaque command record of a transaction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Command(Vec<u8>);

impl Command {
  pub fn new(payload: impl Into<Vec<u8>>) -> Self {
    Self(payload.into())
  }

  pub fn payload(&self) -> &[u8] {
    &self.0
  }

  pub fn into_payload(self) -> Vec<u8> {
    self.0
  }
}

impl fmt::Debug for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Command({} bytes)", self.0.len())
  }
}

impl From<Vec<u8>> for Command {
  fn from(payload: Vec<u8>) -> Self {
    Self(payload)
  }
}

impl From<&[u8]> for Command {
  fn from(payload: &[u8]) -> Self {
    Self(payload.to_vec())
  }
}

/// An ordered command sequence plus the header metadata written in the
/// START entry. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRepresentation {
  commands: Vec<Command>,
  master_id: MasterId,
  author_id: AuthorId,
  time_written: i64,
  latest_committed_tx_when_started: TxId,
  additional_header: Vec<u8>,
}

impl TransactionRepresentation {
  pub fn new(commands: Vec<Command>) -> Self {
    Self {
      commands,
      master_id: 0,
      author_id: 0,
      time_written: 0,
      latest_committed_tx_when_started: BASE_TX_ID,
      additional_header: Vec::new(),
    }
  }

  pub fn with_header(
    mut self,
    master_id: MasterId,
    author_id: AuthorId,
    time_written: i64,
    latest_committed_tx_when_started: TxId,
    additional_header: Vec<u8>,
  ) -> Self {
    self.master_id = master_id;
    self.author_id = author_id;
    self.time_written = time_written;
    self.latest_committed_tx_when_started = latest_committed_tx_when_started;
    self.additional_header = additional_header;
    self
  }

  pub fn commands(&self) -> &[Command] {
    &self.commands
  }

  pub fn master_id(&self) -> MasterId {
    self.master_id
  }

  pub fn author_id(&self) -> AuthorId {
    self.author_id
  }

  pub fn time_written(&self) -> i64 {
    self.time_written
  }

  pub fn latest_committed_tx_when_started(&self) -> TxId {
    self.latest_committed_tx_when_started
  }

  pub fn additional_header(&self) -> &[u8] {
    &self.additional_header
  }
}

/// A transaction together with the id it was committed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransaction {
  pub tx_id: TxId,
  pub transaction: TransactionRepresentation,
}

impl CommittedTransaction {
  pub fn new(tx_id: TxId, transaction: TransactionRepresentation) -> Self {
    Self { tx_id, transaction }
  }
}

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn now_millis() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or(0)
}
