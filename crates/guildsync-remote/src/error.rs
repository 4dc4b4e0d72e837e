use thiserror::Error;

/// Errors from remote blob store operations.
///
/// `NotFound` is deliberately absent: an absent blob is a normal outcome
/// (`Ok(None)` from `get`), never an error.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The supplied version token no longer matches the remote's current
    /// token (or the blob already exists when no token was supplied). The
    /// write was rejected atomically; re-fetch, re-merge, retry.
    #[error("version conflict on {path}")]
    Conflict { path: String },

    /// Network failure or server-side 5xx. Safe to retry with backoff.
    #[error("transient remote failure on {path} (status {status:?}): {message}")]
    Transient {
        path: String,
        status: Option<u16>,
        message: String,
    },

    /// The remote answered but the response body could not be decoded.
    #[error("malformed remote response for {path}: {reason}")]
    Malformed { path: String, reason: String },

    /// Transport-level error from the HTTP client (connect, timeout, TLS).
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RemoteError {
    /// Returns `true` for errors a caller should retry with backoff.
    ///
    /// Conflicts are retryable too, but only after a re-fetch and re-merge;
    /// they are reported separately via [`RemoteError::is_conflict`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient { .. } | RemoteError::Http(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, RemoteError::Conflict { .. })
    }
}

/// Result alias for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;
