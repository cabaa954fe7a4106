//! Schema tokens (labels, property keys, relationship types) and the two
//! ways of creating them: locally, or through the primary from a replica.

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};

use crate::core::log::TransactionCommitProcess;
use crate::error::{KiteError, Result};
use crate::replication::context::RequestContextFactory;
use crate::replication::master::Master;
use crate::replication::types::ReplicationRole;
use crate::replication::unpacker::TransactionCommittingResponseUnpacker;
use crate::types::{
  now_millis, Command, CommittedTransaction, TransactionRepresentation, TxId, BASE_TX_ID,
};

/// First byte of every token command payload.
const TOKEN_COMMAND_TAG: u8 = 0x54;
const TOKEN_COMMAND_FIXED_SIZE: usize = 1 + 1 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
  Label,
  PropertyKey,
  RelationshipType,
}

impl TokenKind {
  pub const ALL: [TokenKind; 3] = [
    TokenKind::Label,
    TokenKind::PropertyKey,
    TokenKind::RelationshipType,
  ];

  pub fn as_u8(self) -> u8 {
    match self {
      TokenKind::Label => 1,
      TokenKind::PropertyKey => 2,
      TokenKind::RelationshipType => 3,
    }
  }

  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(TokenKind::Label),
      2 => Some(TokenKind::PropertyKey),
      3 => Some(TokenKind::RelationshipType),
      _ => None,
    }
  }
}

impl fmt::Display for TokenKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let value = match self {
      TokenKind::Label => "label",
      TokenKind::PropertyKey => "property-key",
      TokenKind::RelationshipType => "relationship-type",
    };
    write!(f, "{value}")
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Token {
  pub kind: TokenKind,
  pub name: String,
  pub id: u32,
}

/// Command payload recording that `name` was bound to `id`.
///
/// Layout: `tag u8 | kind u8 | id u32 | name_len u32 | name utf8`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCommand {
  pub kind: TokenKind,
  pub id: u32,
  pub name: String,
}

impl TokenCommand {
  pub fn encode(&self) -> Result<Command> {
    let name_len = u32::try_from(self.name.len())
      .map_err(|_| KiteError::Serialization(format!("token name too long: {}", self.name.len())))?;

    let mut bytes = Vec::with_capacity(TOKEN_COMMAND_FIXED_SIZE + self.name.len());
    bytes.push(TOKEN_COMMAND_TAG);
    bytes.push(self.kind.as_u8());
    bytes.write_u32::<LittleEndian>(self.id)?;
    bytes.write_u32::<LittleEndian>(name_len)?;
    bytes.extend_from_slice(self.name.as_bytes());
    Ok(Command::new(bytes))
  }

  /// Decode a command; `Ok(None)` if it is not a token command.
  pub fn decode(command: &Command) -> Result<Option<Self>> {
    let payload = command.payload();
    if payload.first() != Some(&TOKEN_COMMAND_TAG) {
      return Ok(None);
    }
    if payload.len() < TOKEN_COMMAND_FIXED_SIZE {
      return Err(KiteError::Serialization(
        "token command too short".to_string(),
      ));
    }

    let kind = TokenKind::from_u8(payload[1]).ok_or_else(|| {
      KiteError::Serialization(format!("unknown token kind {}", payload[1]))
    })?;
    let mut cursor = Cursor::new(&payload[2..]);
    let id = cursor.read_u32::<LittleEndian>()?;
    let name_len = cursor.read_u32::<LittleEndian>()? as usize;
    if payload.len() - TOKEN_COMMAND_FIXED_SIZE != name_len {
      return Err(KiteError::Serialization(
        "token command name length mismatch".to_string(),
      ));
    }
    let mut name = vec![0; name_len];
    cursor.read_exact(&mut name)?;
    let name = String::from_utf8(name)
      .map_err(|error| KiteError::Serialization(format!("token name is not utf-8: {error}")))?;

    Ok(Some(Self { kind, id, name }))
  }
}

#[derive(Debug, Default, Clone)]
struct KindTable {
  ids: HashMap<String, u32>,
  /// One past the highest id seen; reaches `u32::MAX + 1` once exhausted.
  next_id: u64,
}

/// `name -> id` tables for every token kind.
#[derive(Debug, Default, Clone)]
pub struct TokenRegistry {
  tables: HashMap<TokenKind, KindTable>,
}

impl TokenRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Rebuild from the token commands found in committed transactions.
  pub fn from_transactions(transactions: &[CommittedTransaction]) -> Result<Self> {
    let mut registry = Self::new();
    for committed in transactions {
      registry.apply_transaction(&committed.transaction)?;
    }
    Ok(registry)
  }

  /// Record every token command in `transaction`.
  pub fn apply_transaction(&mut self, transaction: &TransactionRepresentation) -> Result<()> {
    for command in transaction.commands() {
      if let Some(token) = TokenCommand::decode(command)? {
        self.insert(token.kind, token.name, token.id);
      }
    }
    Ok(())
  }

  pub fn get(&self, kind: TokenKind, name: &str) -> Option<u32> {
    self
      .tables
      .get(&kind)
      .and_then(|table| table.ids.get(name).copied())
  }

  /// The id the next new name of `kind` gets.
  pub fn next_id(&self, kind: TokenKind) -> Result<u32> {
    let next = self.tables.get(&kind).map_or(0, |table| table.next_id);
    u32::try_from(next).map_err(|_| KiteError::TokenIdsExhausted(kind))
  }

  pub fn insert(&mut self, kind: TokenKind, name: String, id: u32) {
    let table = self.tables.entry(kind).or_default();
    table.next_id = table.next_id.max(u64::from(id) + 1);
    table.ids.insert(name, id);
  }

  pub fn len(&self, kind: TokenKind) -> usize {
    self.tables.get(&kind).map_or(0, |table| table.ids.len())
  }

  pub fn is_empty(&self) -> bool {
    self.tables.values().all(|table| table.ids.is_empty())
  }
}

/// Returns the id bound to a token name, creating the binding if needed.
pub trait TokenCreator: Send + Sync {
  fn get_or_create(&self, name: &str) -> Result<u32>;
}

impl<C: TokenCreator + ?Sized> TokenCreator for Arc<C> {
  fn get_or_create(&self, name: &str) -> Result<u32> {
    (**self).get_or_create(name)
  }
}

impl<C: TokenCreator + ?Sized> TokenCreator for Box<C> {
  fn get_or_create(&self, name: &str) -> Result<u32> {
    (**self).get_or_create(name)
  }
}

/// Token creator for a standalone instance or the primary itself.
///
/// New names are committed through the local commit path as a single
/// [`TokenCommand`] transaction before the id is handed out.
pub struct LocalTokenCreator {
  kind: TokenKind,
  commit_process: Arc<dyn TransactionCommitProcess>,
  registry: Arc<Mutex<TokenRegistry>>,
}

impl LocalTokenCreator {
  pub fn new(
    kind: TokenKind,
    commit_process: Arc<dyn TransactionCommitProcess>,
    registry: Arc<Mutex<TokenRegistry>>,
  ) -> Self {
    Self {
      kind,
      commit_process,
      registry,
    }
  }
}

impl TokenCreator for LocalTokenCreator {
  fn get_or_create(&self, name: &str) -> Result<u32> {
    let mut registry = self.registry.lock();
    if let Some(id) = registry.get(self.kind, name) {
      return Ok(id);
    }

    let id = registry.next_id(self.kind)?;
    let command = TokenCommand {
      kind: self.kind,
      id,
      name: name.to_string(),
    }
    .encode()?;
    let transaction = TransactionRepresentation::new(vec![command]).with_header(
      0,
      0,
      now_millis(),
      BASE_TX_ID,
      Vec::new(),
    );
    let tx_id = self.commit_process.commit(transaction)?;

    registry.insert(self.kind, name.to_string(), id);
    tracing::debug!(kind = %self.kind, name, id, tx_id, "token created locally");
    Ok(id)
  }
}

/// Commit process that keeps a [`TokenRegistry`] in step with the token
/// commands it appends.
///
/// A replica applies the primary's token transactions through this, so its
/// own registry knows every name the primary has bound.
pub struct RegistryTrackingCommitProcess {
  inner: Arc<dyn TransactionCommitProcess>,
  registry: Arc<Mutex<TokenRegistry>>,
}

impl RegistryTrackingCommitProcess {
  pub fn new(
    inner: Arc<dyn TransactionCommitProcess>,
    registry: Arc<Mutex<TokenRegistry>>,
  ) -> Self {
    Self { inner, registry }
  }

  fn decode_tokens(transaction: &TransactionRepresentation) -> Result<Vec<TokenCommand>> {
    let mut tokens = Vec::new();
    for command in transaction.commands() {
      if let Some(token) = TokenCommand::decode(command)? {
        tokens.push(token);
      }
    }
    Ok(tokens)
  }

  fn record(&self, tokens: Vec<TokenCommand>) {
    if tokens.is_empty() {
      return;
    }
    let mut registry = self.registry.lock();
    for token in tokens {
      registry.insert(token.kind, token.name, token.id);
    }
  }
}

impl TransactionCommitProcess for RegistryTrackingCommitProcess {
  fn commit(&self, transaction: TransactionRepresentation) -> Result<TxId> {
    let tokens = Self::decode_tokens(&transaction)?;
    let tx_id = self.inner.commit(transaction)?;
    self.record(tokens);
    Ok(tx_id)
  }

  fn commit_replicated(&self, committed: CommittedTransaction) -> Result<bool> {
    let tokens = Self::decode_tokens(&committed.transaction)?;
    let applied = self.inner.commit_replicated(committed)?;
    // Recorded for replays too: the registry may have been built empty.
    self.record(tokens);
    Ok(applied)
  }
}

/// Token creator for a replica: asks the primary, then applies whatever the
/// primary bundled with its answer before returning the id.
pub struct SlaveTokenCreator<M: Master> {
  kind: TokenKind,
  master: M,
  request_context_factory: Arc<dyn RequestContextFactory>,
  unpacker: TransactionCommittingResponseUnpacker,
}

impl<M: Master> SlaveTokenCreator<M> {
  pub fn new(
    kind: TokenKind,
    master: M,
    request_context_factory: Arc<dyn RequestContextFactory>,
    unpacker: TransactionCommittingResponseUnpacker,
  ) -> Self {
    Self {
      kind,
      master,
      request_context_factory,
      unpacker,
    }
  }
}

impl<M: Master> TokenCreator for SlaveTokenCreator<M> {
  fn get_or_create(&self, name: &str) -> Result<u32> {
    let context = self.request_context_factory.new_request_context();
    let response = self.master.create_token(self.kind, &context, name)?;
    let id = self.unpacker.unpack_response(response)?;
    tracing::debug!(kind = %self.kind, name, id, %context, "token obtained from primary");
    Ok(id)
  }
}

/// Collaborators needed to build a token creator for a given role.
pub struct TokenCreatorDeps {
  pub commit_process: Arc<dyn TransactionCommitProcess>,
  /// Local creators allocate from it; a replica keeps it updated with the
  /// tokens the primary bundles.
  pub registry: Arc<Mutex<TokenRegistry>>,
  /// Required for [`ReplicationRole::Replica`].
  pub replica: Option<ReplicaTokenDeps>,
}

pub struct ReplicaTokenDeps {
  pub master: Arc<dyn Master>,
  pub request_context_factory: Arc<dyn RequestContextFactory>,
}

/// Pick the creator variant for `role`.
pub fn build_token_creator(
  role: ReplicationRole,
  kind: TokenKind,
  deps: TokenCreatorDeps,
) -> Result<Box<dyn TokenCreator>> {
  if role.creates_tokens_locally() {
    return Ok(Box::new(LocalTokenCreator::new(
      kind,
      deps.commit_process,
      deps.registry,
    )));
  }

  let replica = deps.replica.ok_or_else(|| {
    KiteError::InvalidReplication(
      "replica token creator requires a master and request context factory".to_string(),
    )
  })?;
  Ok(Box::new(SlaveTokenCreator::new(
    kind,
    replica.master,
    replica.request_context_factory,
    TransactionCommittingResponseUnpacker::new(Arc::new(RegistryTrackingCommitProcess::new(
      deps.commit_process,
      deps.registry,
    ))),
  )))
}

/// Caches `name -> id` in front of a creator so each name is only created
/// (or fetched from the primary) once.
pub struct TokenHolder {
  kind: TokenKind,
  creator: Box<dyn TokenCreator>,
  cache: RwLock<HashMap<String, u32>>,
  create_lock: Mutex<()>,
}

impl TokenHolder {
  pub fn new(kind: TokenKind, creator: Box<dyn TokenCreator>) -> Self {
    Self {
      kind,
      creator,
      cache: RwLock::new(HashMap::new()),
      create_lock: Mutex::new(()),
    }
  }

  pub fn kind(&self) -> TokenKind {
    self.kind
  }

  pub fn get(&self, name: &str) -> Option<u32> {
    self.cache.read().get(name).copied()
  }

  pub fn get_or_create(&self, name: &str) -> Result<u32> {
    if let Some(id) = self.get(name) {
      return Ok(id);
    }

    let _create = self.create_lock.lock();
    if let Some(id) = self.get(name) {
      return Ok(id);
    }
    let id = self.creator.get_or_create(name)?;
    self.cache.write().insert(name.to_string(), id);
    Ok(id)
  }

  /// Seed the cache, e.g. from a registry rebuilt at startup.
  pub fn add_token(&self, token: Token) -> Result<()> {
    if token.kind != self.kind {
      return Err(KiteError::Internal(format!(
        "{} token added to {} holder",
        token.kind, self.kind
      )));
    }
    self.cache.write().insert(token.name, token.id);
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.cache.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.cache.read().is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::log::TxLog;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn token_command_roundtrip_and_foreign_commands() {
    let command = TokenCommand {
      kind: TokenKind::RelationshipType,
      id: 12,
      name: "KNOWS".to_string(),
    };
    let encoded = command.encode().expect("encode");
    assert_eq!(TokenCommand::decode(&encoded).expect("decode"), Some(command));

    let foreign = Command::new(vec![0x01, 0x02]);
    assert_eq!(TokenCommand::decode(&foreign).expect("decode"), None);

    let mut truncated = encoded.into_payload();
    truncated.pop();
    assert!(TokenCommand::decode(&Command::new(truncated)).is_err());
  }

  #[test]
  fn local_creator_commits_once_per_name() {
    let log = Arc::new(TxLog::in_memory().expect("log"));
    let registry = Arc::new(Mutex::new(TokenRegistry::new()));
    let creator = LocalTokenCreator::new(TokenKind::Label, log.clone(), registry.clone());

    assert_eq!(creator.get_or_create("Person").expect("person"), 0);
    assert_eq!(creator.get_or_create("Movie").expect("movie"), 1);
    assert_eq!(creator.get_or_create("Person").expect("person again"), 0);
    assert_eq!(log.last_committed_tx_id(), 2);

    let rebuilt =
      TokenRegistry::from_transactions(&log.committed_transactions().expect("read")).expect("rebuild");
    assert_eq!(rebuilt.get(TokenKind::Label, "Movie"), Some(1));
    assert_eq!(rebuilt.next_id(TokenKind::Label).expect("next id"), 2);
    assert_eq!(rebuilt.len(TokenKind::PropertyKey), 0);
  }

  #[test]
  fn next_id_runs_out_after_max_id() {
    let mut registry = TokenRegistry::new();
    registry.insert(TokenKind::Label, "last".to_string(), u32::MAX);
    assert!(matches!(
      registry.next_id(TokenKind::Label),
      Err(KiteError::TokenIdsExhausted(TokenKind::Label))
    ));
    assert_eq!(registry.next_id(TokenKind::PropertyKey).expect("other kind"), 0);

    let log = Arc::new(TxLog::in_memory().expect("log"));
    let creator = LocalTokenCreator::new(TokenKind::Label, log.clone(), Arc::new(Mutex::new(registry)));
    assert_eq!(creator.get_or_create("last").expect("existing"), u32::MAX);
    assert!(matches!(
      creator.get_or_create("one-more"),
      Err(KiteError::TokenIdsExhausted(TokenKind::Label))
    ));
    assert_eq!(log.last_committed_tx_id(), BASE_TX_ID);
  }

  #[test]
  fn tracking_commit_process_records_replicated_tokens() {
    let primary = TxLog::in_memory().expect("primary");
    let token = |kind, id, name: &str| {
      TokenCommand {
        kind,
        id,
        name: name.to_string(),
      }
      .encode()
      .expect("encode")
    };
    primary
      .commit(TransactionRepresentation::new(vec![
        token(TokenKind::Label, 0, "Person"),
        Command::new(vec![0x01]),
      ]))
      .expect("commit person");
    primary
      .commit(TransactionRepresentation::new(vec![token(
        TokenKind::RelationshipType,
        4,
        "KNOWS",
      )]))
      .expect("commit knows");

    let replica = Arc::new(TxLog::in_memory().expect("replica"));
    let registry = Arc::new(Mutex::new(TokenRegistry::new()));
    let tracking = RegistryTrackingCommitProcess::new(replica.clone(), registry.clone());
    for committed in primary.committed_transactions().expect("read") {
      assert!(tracking.commit_replicated(committed).expect("apply"));
    }

    let registry = registry.lock();
    assert_eq!(registry.get(TokenKind::Label, "Person"), Some(0));
    assert_eq!(registry.get(TokenKind::RelationshipType, "KNOWS"), Some(4));
    assert_eq!(registry.next_id(TokenKind::RelationshipType).expect("next"), 5);
    assert_eq!(replica.last_committed_tx_id(), 2);
  }

  #[test]
  fn tracking_commit_process_skips_registry_on_failed_append() {
    let replica = Arc::new(TxLog::in_memory().expect("replica"));
    let registry = Arc::new(Mutex::new(TokenRegistry::new()));
    let tracking = RegistryTrackingCommitProcess::new(replica, registry.clone());
    let gap = CommittedTransaction::new(
      3,
      TransactionRepresentation::new(vec![TokenCommand {
        kind: TokenKind::Label,
        id: 0,
        name: "Person".to_string(),
      }
      .encode()
      .expect("encode")]),
    );
    assert!(tracking.commit_replicated(gap).is_err());
    assert!(registry.lock().is_empty());
  }

  struct CountingCreator {
    calls: AtomicUsize,
  }

  impl TokenCreator for CountingCreator {
    fn get_or_create(&self, _name: &str) -> Result<u32> {
      Ok(self.calls.fetch_add(1, Ordering::SeqCst) as u32 + 100)
    }
  }

  #[test]
  fn holder_calls_creator_once_per_name() {
    let creator = Arc::new(CountingCreator {
      calls: AtomicUsize::new(0),
    });
    let holder = TokenHolder::new(TokenKind::PropertyKey, Box::new(creator.clone()));

    assert_eq!(holder.get_or_create("name").expect("first"), 100);
    assert_eq!(holder.get_or_create("name").expect("cached"), 100);
    assert_eq!(holder.get_or_create("age").expect("second"), 101);
    assert_eq!(creator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(holder.len(), 2);
  }

  #[test]
  fn holder_rejects_tokens_of_another_kind() {
    let holder = TokenHolder::new(
      TokenKind::Label,
      Box::new(CountingCreator {
        calls: AtomicUsize::new(0),
      }),
    );
    let err = holder
      .add_token(Token {
        kind: TokenKind::PropertyKey,
        name: "name".to_string(),
        id: 1,
      })
      .expect_err("wrong kind");
    assert!(matches!(err, KiteError::Internal(_)));
  }
}
