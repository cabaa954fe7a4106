//! Replica-side plumbing: request contexts, the primary interface, the
//! payload codec, and the unpacker that applies bundled transactions.

pub mod context;
pub mod master;
pub mod transport;
pub mod types;
pub mod unpacker;

pub use context::{ReplicaRequestContextFactory, RequestContextFactory};
pub use master::{LocalMaster, Master, MasterTransport, RemoteMaster};
pub use types::{ReplicationRole, RequestContext, Response};
pub use unpacker::TransactionCommittingResponseUnpacker;
