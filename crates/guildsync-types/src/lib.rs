//! Core types for guildsync.
//!
//! Defines the logical blob keys, the typed blob contents with their
//! per-kind merge semantics, and the records that make up message ledgers.
//! This crate has no I/O: everything here is pure data.

pub mod content;
pub mod error;
pub mod key;
pub mod record;

pub use content::{BlobContent, BlobKind, GuildInfo, MergeDepth, StreamCursor};
pub use error::TypeError;
pub use key::{BlobKey, StreamClass};
pub use record::{LedgerMap, Record, RecordId};
