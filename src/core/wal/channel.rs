//! Append-only byte channels backing the transaction log.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::core::log::SyncMode;

/// Append-only byte sink the entry codec writes to.
///
/// A failed `append` may leave a partial write behind; callers either
/// truncate back to a known position or leave it to recovery.
pub trait LogChannel: Send {
  fn append(&mut self, bytes: &[u8]) -> io::Result<()>;

  /// Make everything appended so far durable (as far as the channel can).
  fn flush(&mut self) -> io::Result<()>;

  /// Current write position, i.e. the number of bytes in the channel.
  fn position(&self) -> u64;

  /// Cut the channel back to `len` bytes.
  fn truncate(&mut self, len: u64) -> io::Result<()>;

  /// Everything written so far.
  fn read_all(&self) -> io::Result<Vec<u8>>;

  /// Bytes from `offset` up to the current position.
  fn read_from(&self, offset: u64) -> io::Result<Vec<u8>> {
    let mut bytes = self.read_all()?;
    let start = (offset as usize).min(bytes.len());
    bytes.drain(..start);
    Ok(bytes)
  }

  fn close(&mut self) -> io::Result<()> {
    self.flush()
  }
}

impl<C: LogChannel + ?Sized> LogChannel for Box<C> {
  fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
    (**self).append(bytes)
  }

  fn flush(&mut self) -> io::Result<()> {
    (**self).flush()
  }

  fn position(&self) -> u64 {
    (**self).position()
  }

  fn truncate(&mut self, len: u64) -> io::Result<()> {
    (**self).truncate(len)
  }

  fn read_all(&self) -> io::Result<Vec<u8>> {
    (**self).read_all()
  }

  fn read_from(&self, offset: u64) -> io::Result<Vec<u8>> {
    (**self).read_from(offset)
  }

  fn close(&mut self) -> io::Result<()> {
    (**self).close()
  }
}

/// File-backed channel. Holds an exclusive advisory lock for its lifetime.
#[derive(Debug)]
pub struct FileLogChannel {
  file: File,
  path: PathBuf,
  position: u64,
  sync_mode: SyncMode,
  locked: bool,
}

impl FileLogChannel {
  /// Wrap the opened file at `path`, positioning writes at `position`.
  pub fn new(
    mut file: File,
    path: impl AsRef<Path>,
    position: u64,
    sync_mode: SyncMode,
  ) -> io::Result<Self> {
    file.seek(SeekFrom::Start(position))?;
    Ok(Self {
      file,
      path: path.as_ref().to_path_buf(),
      position,
      sync_mode,
      locked: false,
    })
  }

  /// Take an exclusive lock so no other process appends to the same log.
  pub fn lock_exclusive(&mut self) -> io::Result<()> {
    self.file.try_lock_exclusive().map_err(|error| {
      io::Error::new(
        error.kind(),
        format!("transaction log is locked by another writer: {error}"),
      )
    })?;
    self.locked = true;
    Ok(())
  }
}

impl LogChannel for FileLogChannel {
  fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
    self.file.write_all(bytes)?;
    self.position += bytes.len() as u64;
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    self.file.flush()?;
    match self.sync_mode {
      SyncMode::Full => self.file.sync_all(),
      SyncMode::Normal => self.file.sync_data(),
      SyncMode::Off => Ok(()),
    }
  }

  fn position(&self) -> u64 {
    self.position
  }

  fn truncate(&mut self, len: u64) -> io::Result<()> {
    self.file.set_len(len)?;
    self.file.seek(SeekFrom::Start(len))?;
    self.position = len;
    Ok(())
  }

  fn read_all(&self) -> io::Result<Vec<u8>> {
    self.read_from(0)
  }

  fn read_from(&self, offset: u64) -> io::Result<Vec<u8>> {
    let len = self.position.saturating_sub(offset);
    let mut file = File::open(&self.path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut bytes = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut bytes)?;
    Ok(bytes)
  }

  fn close(&mut self) -> io::Result<()> {
    self.flush()?;
    if self.locked {
      fs2::FileExt::unlock(&self.file)?;
      self.locked = false;
    }
    Ok(())
  }
}

/// In-memory channel for embedded use and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogChannel {
  bytes: Vec<u8>,
}

impl MemoryLogChannel {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.bytes
  }
}

impl LogChannel for MemoryLogChannel {
  fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
    self.bytes.extend_from_slice(bytes);
    Ok(())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }

  fn position(&self) -> u64 {
    self.bytes.len() as u64
  }

  fn truncate(&mut self, len: u64) -> io::Result<()> {
    self.bytes.truncate(len as usize);
    Ok(())
  }

  fn read_all(&self) -> io::Result<Vec<u8>> {
    Ok(self.bytes.clone())
  }

  fn read_from(&self, offset: u64) -> io::Result<Vec<u8>> {
    let start = (offset as usize).min(self.bytes.len());
    Ok(self.bytes[start..].to_vec())
  }
}
