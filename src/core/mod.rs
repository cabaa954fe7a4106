//! Durability core.

pub mod log;
pub mod wal;
