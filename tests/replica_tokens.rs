use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use kitedb_txlog::core::log::{
  open_tx_log, TransactionCommitProcess, TransactionIdStore, TxLog, TxLogOptions,
};
use kitedb_txlog::replication::{
  LocalMaster, Master, RemoteMaster, ReplicaRequestContextFactory, ReplicationRole,
  RequestContext, RequestContextFactory, Response, TransactionCommittingResponseUnpacker,
};
use kitedb_txlog::token::{
  build_token_creator, LocalTokenCreator, ReplicaTokenDeps, SlaveTokenCreator, TokenCreator,
  TokenCreatorDeps, TokenKind, TokenRegistry,
};
use kitedb_txlog::{Command, CommittedTransaction, KiteError, TokenHolder, TransactionRepresentation, TxId};

fn committed(tx_id: TxId, payload: &[u8]) -> CommittedTransaction {
  CommittedTransaction::new(
    tx_id,
    TransactionRepresentation::new(vec![Command::new(payload)]).with_header(1, 0, 0, tx_id - 1, Vec::new()),
  )
}

/// Master that answers with `value` and the primary-log transactions the
/// caller has not seen yet.
struct ScriptedMaster {
  value: u32,
  primary: Arc<TxLog>,
  bundled: Mutex<Vec<usize>>,
}

impl Master for ScriptedMaster {
  fn create_token(
    &self,
    _kind: TokenKind,
    context: &RequestContext,
    _name: &str,
  ) -> kitedb_txlog::Result<Response<u32>> {
    let transactions = self.primary.transactions_after(context.last_applied_tx_id)?;
    self.bundled.lock().push(transactions.len());
    Ok(Response::new(self.value, transactions))
  }
}

/// Commit path that records each applied id and can fail on one of them.
struct RecordingCommitProcess {
  log: TxLog,
  applied: Mutex<Vec<TxId>>,
  fail_on: Option<TxId>,
}

impl TransactionIdStore for RecordingCommitProcess {
  fn last_committed_tx_id(&self) -> TxId {
    self.log.last_committed_tx_id()
  }
}

impl TransactionCommitProcess for RecordingCommitProcess {
  fn commit(&self, transaction: TransactionRepresentation) -> kitedb_txlog::Result<TxId> {
    self.log.commit(transaction)
  }

  fn commit_replicated(&self, committed: CommittedTransaction) -> kitedb_txlog::Result<bool> {
    if self.fail_on == Some(committed.tx_id) {
      return Err(KiteError::Internal(format!("cannot apply {}", committed.tx_id)));
    }
    let tx_id = committed.tx_id;
    let applied = self.log.commit_replicated(committed)?;
    if applied {
      self.applied.lock().push(tx_id);
    }
    Ok(applied)
  }
}

fn recording(fail_on: Option<TxId>) -> Arc<RecordingCommitProcess> {
  Arc::new(RecordingCommitProcess {
    log: TxLog::in_memory().expect("replica log"),
    applied: Mutex::new(Vec::new()),
    fail_on,
  })
}

fn primary_with(payloads: &[&[u8]]) -> Arc<TxLog> {
  let primary = Arc::new(TxLog::in_memory().expect("primary log"));
  for payload in payloads {
    primary
      .commit(TransactionRepresentation::new(vec![Command::new(*payload)]))
      .expect("seed primary");
  }
  primary
}

fn slave_creator(
  master: ScriptedMaster,
  replica: Arc<RecordingCommitProcess>,
) -> SlaveTokenCreator<ScriptedMaster> {
  let factory = Arc::new(ReplicaRequestContextFactory::new(2, 1, replica.clone()));
  SlaveTokenCreator::new(
    TokenKind::Label,
    master,
    factory,
    TransactionCommittingResponseUnpacker::new(replica),
  )
}

#[test]
fn bundled_transactions_are_applied_before_id_is_returned() {
  let replica = recording(None);
  let creator = slave_creator(
    ScriptedMaster {
      value: 7,
      primary: primary_with(&[b"t1", b"t2", b"t3"]),
      bundled: Mutex::new(Vec::new()),
    },
    replica.clone(),
  );

  assert_eq!(creator.get_or_create("Person").expect("create"), 7);
  assert_eq!(*replica.applied.lock(), vec![1, 2, 3]);

  let payloads: Vec<Vec<u8>> = replica
    .log
    .committed_transactions()
    .expect("read")
    .into_iter()
    .map(|tx| tx.transaction.commands()[0].payload().to_vec())
    .collect();
  assert_eq!(payloads, vec![b"t1".to_vec(), b"t2".to_vec(), b"t3".to_vec()]);
}

#[test]
fn unpack_failure_withholds_the_id() {
  let replica = recording(Some(2));
  let creator = slave_creator(
    ScriptedMaster {
      value: 7,
      primary: primary_with(&[b"t1", b"t2", b"t3"]),
      bundled: Mutex::new(Vec::new()),
    },
    replica.clone(),
  );

  let err = creator.get_or_create("Person").expect_err("must fail");
  assert!(err.is_replica_stale());
  assert!(matches!(err, KiteError::Unpack { index: 1, tx_id: 2, .. }));
  assert_eq!(*replica.applied.lock(), vec![1]);
}

#[test]
fn repeated_request_returns_same_id_with_empty_bundle() {
  let replica = recording(None);
  let primary = primary_with(&[b"t1"]);
  let master = ScriptedMaster {
    value: 7,
    primary,
    bundled: Mutex::new(Vec::new()),
  };
  let factory = Arc::new(ReplicaRequestContextFactory::new(2, 1, replica.clone()));
  let master = Arc::new(master);
  let creator = SlaveTokenCreator::new(
    TokenKind::Label,
    master.clone(),
    factory,
    TransactionCommittingResponseUnpacker::new(replica.clone()),
  );

  assert_eq!(creator.get_or_create("Person").expect("first"), 7);
  assert_eq!(creator.get_or_create("Person").expect("second"), 7);
  assert_eq!(*master.bundled.lock(), vec![1, 0]);
  assert_eq!(replica.log.last_committed_tx_id(), 1);
}

#[test]
fn master_failure_propagates_without_applying() {
  let replica = Arc::new(TxLog::in_memory().expect("replica"));
  let remote = RemoteMaster::new(|_: &'static str, _: Vec<u8>| -> io::Result<Vec<u8>> {
    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "primary down"))
  });
  let factory = Arc::new(ReplicaRequestContextFactory::new(2, 1, replica.clone()));
  let creator = SlaveTokenCreator::new(
    TokenKind::PropertyKey,
    remote,
    factory,
    TransactionCommittingResponseUnpacker::new(replica.clone()),
  );

  let err = creator.get_or_create("name").expect_err("remote down");
  assert!(matches!(err, KiteError::Remote { .. }));
  assert!(!err.is_replica_stale());
  assert_eq!(replica.last_committed_tx_id(), 0);
}

#[test]
fn unpacker_applies_already_committed_prefix_idempotently() {
  let replica = Arc::new(TxLog::in_memory().expect("replica"));
  replica.commit_replicated(committed(1, b"a")).expect("seed");
  let unpacker = TransactionCommittingResponseUnpacker::new(replica.clone());

  let value = unpacker
    .unpack_response(Response::new(
      9u32,
      vec![committed(1, b"a"), committed(2, b"b"), committed(3, b"c")],
    ))
    .expect("unpack");
  assert_eq!(value, 9);
  assert_eq!(replica.last_committed_tx_id(), 3);
  assert_eq!(replica.committed_transactions().expect("read").len(), 3);
}

struct Cluster {
  _dir: tempfile::TempDir,
  primary_log: Arc<TxLog>,
  master: Arc<LocalMaster>,
  replica_log: Arc<TxLog>,
  replica_path: std::path::PathBuf,
}

fn cluster() -> Cluster {
  let dir = tempfile::tempdir().expect("tempdir");
  let primary_log =
    Arc::new(open_tx_log(dir.path().join("primary.ktxlog"), TxLogOptions::new()).expect("primary"));
  let master = Arc::new(LocalMaster::open(primary_log.clone(), 1, 1).expect("master"));
  let replica_path = dir.path().join("replica.ktxlog");
  let replica_log = Arc::new(open_tx_log(&replica_path, TxLogOptions::new()).expect("replica"));
  Cluster {
    _dir: dir,
    primary_log,
    master,
    replica_log,
    replica_path,
  }
}

fn replica_holder(kind: TokenKind, master: Arc<dyn Master>, replica_log: &Arc<TxLog>) -> TokenHolder {
  replica_holder_with_registry(kind, master, replica_log, Arc::new(Mutex::new(TokenRegistry::new())))
}

fn replica_holder_with_registry(
  kind: TokenKind,
  master: Arc<dyn Master>,
  replica_log: &Arc<TxLog>,
  registry: Arc<Mutex<TokenRegistry>>,
) -> TokenHolder {
  let creator = build_token_creator(
    ReplicationRole::Replica,
    kind,
    TokenCreatorDeps {
      commit_process: replica_log.clone(),
      registry,
      replica: Some(ReplicaTokenDeps {
        master,
        request_context_factory: Arc::new(ReplicaRequestContextFactory::new(
          2,
          1,
          replica_log.clone(),
        )),
      }),
    },
  )
  .expect("replica creator");
  TokenHolder::new(kind, creator)
}

#[test]
fn replica_catches_up_with_primary_local_tokens() {
  let cluster = cluster();

  let primary_labels = LocalTokenCreator::new(
    TokenKind::Label,
    cluster.primary_log.clone(),
    cluster.master.registry(),
  );
  assert_eq!(primary_labels.get_or_create("Person").expect("person"), 0);
  assert_eq!(primary_labels.get_or_create("Movie").expect("movie"), 1);

  let labels = replica_holder(TokenKind::Label, cluster.master.clone(), &cluster.replica_log);
  assert_eq!(labels.get_or_create("Movie").expect("movie"), 1);
  assert_eq!(labels.get_or_create("Genre").expect("genre"), 2);
  assert_eq!(labels.get_or_create("Genre").expect("cached"), 2);

  assert_eq!(cluster.primary_log.last_committed_tx_id(), 3);
  assert_eq!(cluster.replica_log.last_committed_tx_id(), 3);
  assert_eq!(primary_labels.get_or_create("Genre").expect("shared"), 2);
}

#[test]
fn replica_registry_tracks_bundled_tokens() {
  let cluster = cluster();
  let primary_labels = LocalTokenCreator::new(
    TokenKind::Label,
    cluster.primary_log.clone(),
    cluster.master.registry(),
  );
  primary_labels.get_or_create("Person").expect("person");
  primary_labels.get_or_create("Movie").expect("movie");

  let registry = Arc::new(Mutex::new(TokenRegistry::new()));
  let labels = replica_holder_with_registry(
    TokenKind::Label,
    cluster.master.clone(),
    &cluster.replica_log,
    registry.clone(),
  );
  assert_eq!(labels.get_or_create("Genre").expect("genre"), 2);
  {
    let registry = registry.lock();
    assert_eq!(registry.get(TokenKind::Label, "Person"), Some(0));
    assert_eq!(registry.get(TokenKind::Label, "Movie"), Some(1));
    assert_eq!(registry.get(TokenKind::Label, "Genre"), Some(2));
  }

  // Once promoted, a local creator over the same registry continues the id
  // sequence instead of reusing bundled ids.
  let promoted = LocalTokenCreator::new(TokenKind::Label, cluster.replica_log.clone(), registry);
  assert_eq!(promoted.get_or_create("Person").expect("known"), 0);
  assert_eq!(promoted.get_or_create("Studio").expect("studio"), 3);
}

#[test]
fn replica_log_survives_reopen_with_same_tokens() {
  let cluster = cluster();
  let master: Arc<dyn Master> = cluster.master.clone();

  let keys = replica_holder(TokenKind::PropertyKey, master.clone(), &cluster.replica_log);
  let types = replica_holder(TokenKind::RelationshipType, master, &cluster.replica_log);
  assert_eq!(keys.get_or_create("name").expect("name"), 0);
  assert_eq!(types.get_or_create("KNOWS").expect("knows"), 0);
  assert_eq!(keys.get_or_create("age").expect("age"), 1);

  drop(keys);
  drop(types);
  let replica_log = match Arc::try_unwrap(cluster.replica_log) {
    Ok(log) => log,
    Err(_) => panic!("replica log still shared"),
  };
  replica_log.close().expect("close");

  let reopened = open_tx_log(&cluster.replica_path, TxLogOptions::new()).expect("reopen");
  let registry =
    TokenRegistry::from_transactions(&reopened.committed_transactions().expect("read")).expect("rebuild");
  assert_eq!(registry.get(TokenKind::PropertyKey, "age"), Some(1));
  assert_eq!(registry.get(TokenKind::RelationshipType, "KNOWS"), Some(0));
  assert_eq!(registry.len(TokenKind::Label), 0);
}

#[test]
fn replica_over_byte_transport_matches_direct_calls() {
  let cluster = cluster();
  let calls = Arc::new(AtomicUsize::new(0));
  let server = cluster.master.clone();
  let counter = calls.clone();
  let remote = RemoteMaster::new(move |operation: &'static str, payload: Vec<u8>| {
    assert_eq!(operation, "create_token");
    counter.fetch_add(1, Ordering::SeqCst);
    server
      .handle_token_request(&payload)
      .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))
  });

  let labels = replica_holder(TokenKind::Label, Arc::new(remote), &cluster.replica_log);
  assert_eq!(labels.get_or_create("Person").expect("person"), 0);
  assert_eq!(labels.get_or_create("Person").expect("cached"), 0);
  assert_eq!(labels.get_or_create("Movie").expect("movie"), 1);
  assert_eq!(calls.load(Ordering::SeqCst), 2);

  let primary = cluster.primary_log.committed_transactions().expect("primary");
  let replica = cluster.replica_log.committed_transactions().expect("replica");
  assert_eq!(primary, replica);
}

#[test]
fn stale_epoch_request_is_rejected() {
  let cluster = cluster();
  let factory = ReplicaRequestContextFactory::new(2, 0, cluster.replica_log.clone());
  let err = cluster
    .master
    .create_label(&factory.new_request_context(), "Person")
    .expect_err("stale epoch");
  assert!(matches!(err, KiteError::Remote { .. }));

  factory.set_epoch(1);
  let response = cluster
    .master
    .create_label(&factory.new_request_context(), "Person")
    .expect("current epoch");
  assert_eq!(*response.value(), 0);
}

#[test]
fn concurrent_replica_requests_converge() {
  let cluster = cluster();
  let labels = Arc::new(replica_holder(
    TokenKind::Label,
    cluster.master.clone(),
    &cluster.replica_log,
  ));

  let handles: Vec<_> = (0..6)
    .map(|thread_id| {
      let labels = labels.clone();
      thread::spawn(move || {
        (0..10)
          .map(|i| {
            let name = format!("L{}", (thread_id + i) % 12);
            (name.clone(), labels.get_or_create(&name).expect("create"))
          })
          .collect::<Vec<_>>()
      })
    })
    .collect();

  let mut seen = std::collections::HashMap::new();
  for handle in handles {
    for (name, id) in handle.join().expect("join") {
      let previous = seen.insert(name.clone(), id);
      assert!(previous.is_none() || previous == Some(id), "{name} changed id");
    }
  }

  let registry =
    TokenRegistry::from_transactions(&cluster.replica_log.committed_transactions().expect("read"))
      .expect("rebuild");
  for (name, id) in seen {
    assert_eq!(registry.get(TokenKind::Label, &name), Some(id));
  }
  assert_eq!(
    cluster.primary_log.last_committed_tx_id(),
    cluster.replica_log.last_committed_tx_id()
  );
}
