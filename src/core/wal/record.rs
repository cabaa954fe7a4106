//! Log entry framing.
//!
//! Every entry is written as `kind u8 | body_len u32 | crc32 u32 | body`,
//! little endian, where the CRC covers the kind byte and the body. A log
//! file starts with an 8 byte header (`KTXL` + format version).

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::constants::{
  COMMIT_BODY_SIZE, ENTRY_HEADER_SIZE, LOG_FORMAT_VERSION, LOG_HEADER_SIZE, LOG_MAGIC,
  MAX_ENTRY_BODY_SIZE, START_BODY_FIXED_SIZE,
};
use crate::error::{KiteError, Result};
use crate::types::{AuthorId, MasterId, TransactionRepresentation, TxId};
use crate::util::crc::crc32_parts;

use super::channel::LogChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEntryKind {
  Start = 1,
  Command = 2,
  Commit = 3,
}

impl LogEntryKind {
  pub fn from_u8(value: u8) -> Option<Self> {
    match value {
      1 => Some(Self::Start),
      2 => Some(Self::Command),
      3 => Some(Self::Commit),
      _ => None,
    }
  }
}

/// A decoded log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
  Start {
    master_id: MasterId,
    author_id: AuthorId,
    time_written: i64,
    last_committed_tx: TxId,
    header: Vec<u8>,
  },
  Command {
    payload: Vec<u8>,
  },
  Commit {
    tx_id: TxId,
    time_written: i64,
  },
}

impl LogEntry {
  pub fn kind(&self) -> LogEntryKind {
    match self {
      LogEntry::Start { .. } => LogEntryKind::Start,
      LogEntry::Command { .. } => LogEntryKind::Command,
      LogEntry::Commit { .. } => LogEntryKind::Commit,
    }
  }
}

// ============================================================================
// Encoding
// ============================================================================

pub fn build_log_header() -> [u8; LOG_HEADER_SIZE] {
  let mut bytes = [0u8; LOG_HEADER_SIZE];
  bytes[..4].copy_from_slice(LOG_MAGIC);
  bytes[4..].copy_from_slice(&LOG_FORMAT_VERSION.to_le_bytes());
  bytes
}

pub fn build_start_body(
  master_id: MasterId,
  author_id: AuthorId,
  time_written: i64,
  last_committed_tx: TxId,
  header: &[u8],
) -> io::Result<Vec<u8>> {
  let header_len = u32::try_from(header.len()).map_err(|_| {
    io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("additional header too large: {} bytes", header.len()),
    )
  })?;

  let mut body = Vec::with_capacity(START_BODY_FIXED_SIZE + header.len());
  body.write_u32::<LittleEndian>(master_id)?;
  body.write_u32::<LittleEndian>(author_id)?;
  body.write_i64::<LittleEndian>(time_written)?;
  body.write_i64::<LittleEndian>(last_committed_tx)?;
  body.write_u32::<LittleEndian>(header_len)?;
  body.extend_from_slice(header);
  Ok(body)
}

pub fn build_commit_body(tx_id: TxId, time_written: i64) -> [u8; COMMIT_BODY_SIZE] {
  let mut body = [0u8; COMMIT_BODY_SIZE];
  body[..8].copy_from_slice(&tx_id.to_le_bytes());
  body[8..].copy_from_slice(&time_written.to_le_bytes());
  body
}

/// Frame a body into a complete entry.
pub fn encode_entry(kind: LogEntryKind, body: &[u8]) -> io::Result<Vec<u8>> {
  if body.len() > MAX_ENTRY_BODY_SIZE {
    return Err(io::Error::new(
      io::ErrorKind::InvalidInput,
      format!("log entry too large: {} bytes", body.len()),
    ));
  }

  let kind_byte = [kind as u8];
  let mut bytes = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len());
  bytes.push(kind as u8);
  bytes.write_u32::<LittleEndian>(body.len() as u32)?;
  bytes.write_u32::<LittleEndian>(crc32_parts(&[&kind_byte, body]))?;
  bytes.extend_from_slice(body);
  Ok(bytes)
}

/// Writes framed entries onto a channel. Owns no policy: callers decide
/// the order, and [`super::writer::TransactionLogWriter`] enforces it.
#[derive(Debug)]
pub struct LogEntryWriter<C: LogChannel> {
  channel: C,
}

impl<C: LogChannel> LogEntryWriter<C> {
  pub fn new(channel: C) -> Self {
    Self { channel }
  }

  pub fn write_log_header(&mut self) -> io::Result<()> {
    self.channel.append(&build_log_header())
  }

  pub fn write_start(
    &mut self,
    master_id: MasterId,
    author_id: AuthorId,
    time_written: i64,
    last_committed_tx: TxId,
    header: &[u8],
  ) -> io::Result<()> {
    let body = build_start_body(
      master_id,
      author_id,
      time_written,
      last_committed_tx,
      header,
    )?;
    self
      .channel
      .append(&encode_entry(LogEntryKind::Start, &body)?)
  }

  pub fn write_command(&mut self, payload: &[u8]) -> io::Result<()> {
    self
      .channel
      .append(&encode_entry(LogEntryKind::Command, payload)?)
  }

  pub fn write_commit(&mut self, tx_id: TxId, time_written: i64) -> io::Result<()> {
    let body = build_commit_body(tx_id, time_written);
    self
      .channel
      .append(&encode_entry(LogEntryKind::Commit, &body)?)
  }

  /// Write every command of the transaction, in order.
  pub fn serialize(&mut self, transaction: &TransactionRepresentation) -> io::Result<()> {
    for command in transaction.commands() {
      self.write_command(command.payload())?;
    }
    Ok(())
  }

  pub fn channel(&self) -> &C {
    &self.channel
  }

  pub fn channel_mut(&mut self) -> &mut C {
    &mut self.channel
  }

  pub fn into_channel(self) -> C {
    self.channel
  }
}

// ============================================================================
// Decoding
// ============================================================================

/// Check the file header and return the offset of the first entry.
pub fn parse_log_header(bytes: &[u8]) -> Result<usize> {
  if bytes.len() < LOG_HEADER_SIZE {
    return Err(KiteError::InvalidLog(format!(
      "log too short for header: {} bytes",
      bytes.len()
    )));
  }

  if &bytes[..4] != LOG_MAGIC {
    return Err(KiteError::InvalidLog("log has invalid magic".to_string()));
  }

  let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
  if version != LOG_FORMAT_VERSION {
    return Err(KiteError::VersionMismatch {
      required: version,
      current: LOG_FORMAT_VERSION,
    });
  }

  Ok(LOG_HEADER_SIZE)
}

/// Outcome of reading one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryRead {
  Entry { entry: LogEntry, offset: usize },
  /// No bytes left.
  End,
  /// The trailing entry is shorter than its frame claims.
  Torn { offset: usize },
  /// The frame is complete but its checksum or kind is wrong.
  Corrupt { offset: usize, reason: String },
}

/// Sequential entry decoder over a byte slice.
pub struct LogEntryReader<'a> {
  bytes: &'a [u8],
  offset: usize,
}

impl<'a> LogEntryReader<'a> {
  /// Reader positioned at `offset` (usually right after the file header).
  pub fn new(bytes: &'a [u8], offset: usize) -> Self {
    Self { bytes, offset }
  }

  pub fn offset(&self) -> usize {
    self.offset
  }

  pub fn read_next(&mut self) -> EntryRead {
    let offset = self.offset;
    let remaining = self.bytes.len().saturating_sub(offset);
    if remaining == 0 {
      return EntryRead::End;
    }
    if remaining < ENTRY_HEADER_SIZE {
      return EntryRead::Torn { offset };
    }

    let kind_byte = self.bytes[offset];
    let body_len = u32::from_le_bytes([
      self.bytes[offset + 1],
      self.bytes[offset + 2],
      self.bytes[offset + 3],
      self.bytes[offset + 4],
    ]) as usize;
    let stored_crc = u32::from_le_bytes([
      self.bytes[offset + 5],
      self.bytes[offset + 6],
      self.bytes[offset + 7],
      self.bytes[offset + 8],
    ]);

    if body_len > MAX_ENTRY_BODY_SIZE {
      return EntryRead::Corrupt {
        offset,
        reason: format!("entry body length {body_len} exceeds limit"),
      };
    }

    let body_start = offset + ENTRY_HEADER_SIZE;
    if remaining - ENTRY_HEADER_SIZE < body_len {
      return EntryRead::Torn { offset };
    }
    let body = &self.bytes[body_start..body_start + body_len];

    let computed_crc = crc32_parts(&[&[kind_byte], body]);
    if computed_crc != stored_crc {
      return EntryRead::Corrupt {
        offset,
        reason: format!("crc mismatch: stored={stored_crc:#010x}, computed={computed_crc:#010x}"),
      };
    }

    let Some(kind) = LogEntryKind::from_u8(kind_byte) else {
      return EntryRead::Corrupt {
        offset,
        reason: format!("unknown entry kind {kind_byte}"),
      };
    };

    match decode_body(kind, body) {
      Ok(entry) => {
        self.offset = body_start + body_len;
        EntryRead::Entry { entry, offset }
      }
      Err(error) => EntryRead::Corrupt {
        offset,
        reason: error.to_string(),
      },
    }
  }
}

fn decode_body(kind: LogEntryKind, body: &[u8]) -> Result<LogEntry> {
  match kind {
    LogEntryKind::Command => Ok(LogEntry::Command {
      payload: body.to_vec(),
    }),
    LogEntryKind::Commit => {
      if body.len() != COMMIT_BODY_SIZE {
        return Err(KiteError::InvalidLog(format!(
          "commit entry has {} bytes, expected {COMMIT_BODY_SIZE}",
          body.len()
        )));
      }
      let mut cursor = Cursor::new(body);
      let tx_id = cursor.read_i64::<LittleEndian>()?;
      let time_written = cursor.read_i64::<LittleEndian>()?;
      Ok(LogEntry::Commit {
        tx_id,
        time_written,
      })
    }
    LogEntryKind::Start => {
      if body.len() < START_BODY_FIXED_SIZE {
        return Err(KiteError::InvalidLog(format!(
          "start entry too short: {} bytes",
          body.len()
        )));
      }
      let mut cursor = Cursor::new(body);
      let master_id = cursor.read_u32::<LittleEndian>()?;
      let author_id = cursor.read_u32::<LittleEndian>()?;
      let time_written = cursor.read_i64::<LittleEndian>()?;
      let last_committed_tx = cursor.read_i64::<LittleEndian>()?;
      let header_len = cursor.read_u32::<LittleEndian>()? as usize;
      if body.len() - START_BODY_FIXED_SIZE != header_len {
        return Err(KiteError::InvalidLog(format!(
          "start entry header length {header_len} does not match body"
        )));
      }
      let mut header = vec![0; header_len];
      cursor.read_exact(&mut header)?;
      Ok(LogEntry::Start {
        master_id,
        author_id,
        time_written,
        last_committed_tx,
        header,
      })
    }
  }
}
