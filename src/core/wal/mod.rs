//! Write-ahead transaction log: channels, entry codec, writer, recovery.

pub mod channel;
pub mod record;
pub mod recovery;
pub mod writer;

pub use channel::{FileLogChannel, LogChannel, MemoryLogChannel};
pub use record::{LogEntry, LogEntryKind, LogEntryReader, LogEntryWriter};
pub use recovery::{recover_file, scan_entries, scan_log, IncompleteTransaction, RecoveryReport};
pub use writer::{AppendState, TransactionLogWriter};
