//! Wire payloads for token requests to the primary and its responses.
//!
//! Bundled transactions travel as the exact START/COMMAND*/COMMIT entry
//! bytes the log writer produces.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

use crate::core::wal::channel::MemoryLogChannel;
use crate::core::wal::record::{EntryRead, LogEntry, LogEntryReader};
use crate::core::wal::writer::TransactionLogWriter;
use crate::error::{KiteError, Result};
use crate::token::TokenKind;
use crate::types::{Command, CommittedTransaction, TransactionRepresentation, TxId};

use super::types::{RequestContext, Response};

const REQUEST_MAGIC: &[u8; 4] = b"RQC1";
const RESPONSE_MAGIC: &[u8; 4] = b"RSP1";
const REQUEST_HEADER_BYTES: usize = 4 + 8 + 4 + 8 + 8 + 1 + 4;
const RESPONSE_HEADER_BYTES: usize = 4 + 4 + 4;

/// A token-creation call as sent to the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
  pub context: RequestContext,
  pub kind: TokenKind,
  pub name: String,
}

pub fn encode_token_request(request: &TokenRequest) -> Result<Vec<u8>> {
  let name_len = u32::try_from(request.name.len()).map_err(|_| {
    KiteError::InvalidReplication(format!("token name too large: {}", request.name.len()))
  })?;

  let context = &request.context;
  let mut bytes = Vec::with_capacity(REQUEST_HEADER_BYTES + request.name.len());
  bytes.extend_from_slice(REQUEST_MAGIC);
  bytes.write_u64::<LittleEndian>(context.epoch)?;
  bytes.write_u32::<LittleEndian>(context.machine_id)?;
  bytes.write_u64::<LittleEndian>(context.event_id)?;
  bytes.write_i64::<LittleEndian>(context.last_applied_tx_id)?;
  bytes.push(request.kind.as_u8());
  bytes.write_u32::<LittleEndian>(name_len)?;
  bytes.extend_from_slice(request.name.as_bytes());
  Ok(bytes)
}

pub fn decode_token_request(payload: &[u8]) -> Result<TokenRequest> {
  if payload.len() < REQUEST_HEADER_BYTES {
    return Err(KiteError::InvalidReplication(
      "token request payload too short".to_string(),
    ));
  }
  if &payload[..4] != REQUEST_MAGIC {
    return Err(KiteError::InvalidReplication(
      "token request payload has invalid magic".to_string(),
    ));
  }

  let mut cursor = Cursor::new(&payload[4..]);
  let epoch = cursor.read_u64::<LittleEndian>()?;
  let machine_id = cursor.read_u32::<LittleEndian>()?;
  let event_id = cursor.read_u64::<LittleEndian>()?;
  let last_applied_tx_id = cursor.read_i64::<LittleEndian>()?;
  let kind_byte = cursor.read_u8()?;
  let kind = TokenKind::from_u8(kind_byte).ok_or_else(|| {
    KiteError::InvalidReplication(format!("token request has unknown kind {kind_byte}"))
  })?;
  let name_len = cursor.read_u32::<LittleEndian>()? as usize;

  let mut name = vec![0; name_len];
  cursor
    .read_exact(&mut name)
    .map_err(|_| KiteError::InvalidReplication("token request truncated".to_string()))?;
  ensure_consumed(&cursor, payload.len() - 4, "token request")?;

  let name = String::from_utf8(name)
    .map_err(|_| KiteError::InvalidReplication("token name is not utf-8".to_string()))?;

  Ok(TokenRequest {
    context: RequestContext::new(epoch, machine_id, event_id, last_applied_tx_id),
    kind,
    name,
  })
}

pub fn encode_token_response(response: &Response<u32>) -> Result<Vec<u8>> {
  let count = u32::try_from(response.transactions().len()).map_err(|_| {
    KiteError::InvalidReplication("too many bundled transactions".to_string())
  })?;

  let mut bytes = Vec::with_capacity(RESPONSE_HEADER_BYTES);
  bytes.extend_from_slice(RESPONSE_MAGIC);

  bytes.write_u32::<LittleEndian>(*response.value())?;
  bytes.write_u32::<LittleEndian>(count)?;

  for committed in response.transactions() {
    let body = encode_transaction_entries(committed)?;
    let body_len = u32::try_from(body.len()).map_err(|_| {
      KiteError::InvalidReplication(format!("bundled transaction too large: {}", body.len()))
    })?;
    bytes.write_i64::<LittleEndian>(committed.tx_id)?;
    bytes.write_u32::<LittleEndian>(body_len)?;
    bytes.extend_from_slice(&body);
  }

  Ok(bytes)
}

pub fn decode_token_response(payload: &[u8]) -> Result<Response<u32>> {
  if payload.len() < RESPONSE_HEADER_BYTES {
    return Err(KiteError::InvalidReplication(
      "token response payload too short".to_string(),
    ));
  }
  if &payload[..4] != RESPONSE_MAGIC {
    return Err(KiteError::InvalidReplication(
      "token response payload has invalid magic".to_string(),
    ));
  }

  let mut cursor = Cursor::new(&payload[4..]);
  let value = cursor.read_u32::<LittleEndian>()?;
  let count = cursor.read_u32::<LittleEndian>()? as usize;

  let mut transactions = Vec::new();
  for _ in 0..count {
    let truncated = || KiteError::InvalidReplication("token response truncated".to_string());
    let tx_id = cursor.read_i64::<LittleEndian>().map_err(|_| truncated())?;
    let body_len = cursor.read_u32::<LittleEndian>().map_err(|_| truncated())? as usize;
    let mut body = vec![0; body_len];
    cursor.read_exact(&mut body).map_err(|_| truncated())?;
    transactions.push(decode_transaction_entries(tx_id, &body)?);
  }
  ensure_consumed(&cursor, payload.len() - 4, "token response")?;

  Ok(Response::new(value, transactions))
}

/// Log entry bytes for one committed transaction, without a file header.
pub fn encode_transaction_entries(committed: &CommittedTransaction) -> Result<Vec<u8>> {
  let mut writer = TransactionLogWriter::new(MemoryLogChannel::new());
  writer.append(&committed.transaction, committed.tx_id)?;
  Ok(writer.into_channel().into_bytes())
}

/// Inverse of [`encode_transaction_entries`]; the COMMIT must carry `tx_id`.
pub fn decode_transaction_entries(tx_id: TxId, bytes: &[u8]) -> Result<CommittedTransaction> {
  let mut reader = LogEntryReader::new(bytes, 0);
  let malformed = |what: &str| {
    KiteError::InvalidReplication(format!("bundled transaction {tx_id} is malformed: {what}"))
  };

  let (master_id, author_id, time_written, last_committed_tx, header) = match reader.read_next() {
    EntryRead::Entry {
      entry:
        LogEntry::Start {
          master_id,
          author_id,
          time_written,
          last_committed_tx,
          header,
        },
      ..
    } => (master_id, author_id, time_written, last_committed_tx, header),
    _ => return Err(malformed("missing START")),
  };

  let mut commands = Vec::new();
  loop {
    match reader.read_next() {
      EntryRead::Entry {
        entry: LogEntry::Command { payload },
        ..
      } => commands.push(Command::new(payload)),
      EntryRead::Entry {
        entry: LogEntry::Commit {
          tx_id: committed_id,
          ..
        },
        ..
      } => {
        if committed_id != tx_id {
          return Err(malformed(&format!("COMMIT carries tx {committed_id}")));
        }
        break;
      }
      EntryRead::Entry {
        entry: LogEntry::Start { .. },
        ..
      } => return Err(malformed("nested START")),
      EntryRead::End | EntryRead::Torn { .. } => return Err(malformed("missing COMMIT")),
      EntryRead::Corrupt { reason, .. } => return Err(malformed(&reason)),
    }
  }

  if reader.offset() != bytes.len() {
    return Err(malformed("trailing bytes after COMMIT"));
  }

  let transaction = TransactionRepresentation::new(commands).with_header(
    master_id,
    author_id,
    time_written,
    last_committed_tx,
    header,
  );
  Ok(CommittedTransaction::new(tx_id, transaction))
}

fn ensure_consumed(cursor: &Cursor<&[u8]>, expected: usize, what: &str) -> Result<()> {
  if cursor.position() as usize != expected {
    return Err(KiteError::InvalidReplication(format!(
      "{what} payload contains unexpected trailing bytes"
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn committed(tx_id: TxId, payloads: &[&[u8]]) -> CommittedTransaction {
    CommittedTransaction::new(
      tx_id,
      TransactionRepresentation::new(payloads.iter().map(|p| Command::new(*p)).collect())
        .with_header(1, 2, 3, tx_id - 1, b"hdr".to_vec()),
    )
  }

  #[test]
  fn request_roundtrip() {
    let request = TokenRequest {
      context: RequestContext::new(4, 2, 17, 99),
      kind: TokenKind::Label,
      name: "Person".to_string(),
    };
    let bytes = encode_token_request(&request).expect("encode");
    assert_eq!(decode_token_request(&bytes).expect("decode"), request);
  }

  #[test]
  fn response_roundtrip_keeps_transaction_order() {
    let response = Response::new(
      7,
      vec![
        committed(5, &[b"a", b"b"]),
        committed(6, &[]),
        committed(7, &[b"c"]),
      ],
    );
    let bytes = encode_token_response(&response).expect("encode");
    assert_eq!(decode_token_response(&bytes).expect("decode"), response);
  }

  #[test]
  fn rejects_bad_magic_and_trailing_bytes() {
    let mut bytes = encode_token_response(&Response::empty(1)).expect("encode");
    bytes.push(0);
    assert!(decode_token_response(&bytes).is_err());

    bytes.pop();
    bytes[0] = b'X';
    assert!(decode_token_response(&bytes).is_err());
  }

  #[test]
  fn rejects_commit_with_wrong_tx_id() {
    let body = encode_transaction_entries(&committed(9, &[b"x"])).expect("encode");
    assert!(decode_transaction_entries(10, &body).is_err());
    assert_eq!(
      decode_transaction_entries(9, &body).expect("decode").tx_id,
      9
    );
  }
}
