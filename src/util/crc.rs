//! CRC32 helpers.

use crc32fast::Hasher;

/// CRC32 of a single buffer.
pub fn crc32(data: &[u8]) -> u32 {
  crc32fast::hash(data)
}

/// CRC32 over several buffers, as if they were concatenated.
pub fn crc32_parts(parts: &[&[u8]]) -> u32 {
  let mut hasher = Hasher::new();
  for part in parts {
    hasher.update(part);
  }
  hasher.finalize()
}
