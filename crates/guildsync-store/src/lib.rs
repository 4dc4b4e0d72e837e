//! Merge-safe synchronization engine for guildsync.
//!
//! Keeps an in-memory mirror of structured guild records consistent with a
//! versioned remote blob store while multiple producers append
//! concurrently. The remote offers per-key compare-and-swap only; this
//! crate layers on top of it:
//!
//! - [`LocalMirror`]: the in-memory cache, sole owner of all entry state.
//! - [`WriteCoalescer`]: per-key trailing debounce of remote writes.
//! - [`ConflictResolver`]: CAS puts with refetch-and-remerge retries.
//! - [`AppendOnlyLedger`]: dedup-and-grow-only record streams with the
//!   no-loss integrity guard.
//! - [`Store`]: the facade producers and the serving layer talk to.

pub mod coalescer;
pub mod config;
pub mod error;
pub mod ledger;
pub mod mirror;
pub mod resolver;
pub mod store;

pub use coalescer::{FlushSummary, WriteCoalescer};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use ledger::AppendOnlyLedger;
pub use mirror::LocalMirror;
pub use resolver::{CommitOutcome, ConflictResolver};
pub use store::Store;
