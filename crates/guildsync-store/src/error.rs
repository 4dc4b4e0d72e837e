use guildsync_remote::RemoteError;
use guildsync_types::{BlobKey, TypeError};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Remote I/O failure that exhausted its retry budget.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Key or content error (invalid key, kind mismatch, encode failure).
    #[error("type error: {0}")]
    Type(#[from] TypeError),

    /// A commit would have shrunk a previously durable record set. The
    /// write was aborted before reaching the remote.
    #[error("integrity violation on {key}: record count would shrink from {before} to {after}")]
    IntegrityViolation {
        key: BlobKey,
        before: usize,
        after: usize,
    },

    /// The operation requires a ledger key but was given something else.
    #[error("{key} is not a ledger key")]
    NotLedger { key: BlobKey },

    /// A commit gave up after its configured attempts. The cache entry
    /// stays dirty and will be retried on the next scheduled write or flush.
    #[error("commit of {key} failed after {attempts} attempts")]
    CommitFailed {
        key: BlobKey,
        attempts: u32,
        #[source]
        source: RemoteError,
    },
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
