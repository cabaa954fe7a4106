//! On-disk constants for the transaction log format.

/// Magic bytes at the start of every transaction log file.
pub const LOG_MAGIC: &[u8; 4] = b"KTXL";

/// Current log format version.
pub const LOG_FORMAT_VERSION: u32 = 1;

/// Size of the file header (magic + version).
pub const LOG_HEADER_SIZE: usize = 8;

/// Size of an entry frame header (kind u8 + body_len u32 + crc32 u32).
pub const ENTRY_HEADER_SIZE: usize = 9;

/// Fixed part of a START body, before the additional header bytes.
pub const START_BODY_FIXED_SIZE: usize = 4 + 4 + 8 + 8 + 4;

/// Size of a COMMIT body.
pub const COMMIT_BODY_SIZE: usize = 16;

/// Upper bound on a single entry body. Larger frames are treated as corrupt.
pub const MAX_ENTRY_BODY_SIZE: usize = 64 * 1024 * 1024;
