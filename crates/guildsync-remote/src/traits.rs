use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RemoteResult;

/// Opaque per-blob version token (a content SHA on the hosted backend, a
/// counter on the in-memory backend). Compared for equality only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A fetched blob: the decoded JSON body plus its current version token.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedBlob {
    pub value: Value,
    pub version: VersionToken,
}

/// Versioned key-to-blob store with per-key optimistic concurrency.
///
/// All implementations must satisfy these invariants:
/// - `put` with a stale token fails atomically with `Conflict`; the remote
///   blob is never partially applied.
/// - A successful `put` is durably visible to subsequent `get` calls.
/// - An absent blob is `Ok(None)`, never an error.
/// - The store never interprets blob contents beyond JSON framing.
#[async_trait]
pub trait RemoteBlobStore: Send + Sync {
    /// Fetch the blob at `path`.
    ///
    /// Returns `Ok(None)` if the blob does not exist remotely.
    async fn get(&self, path: &str) -> RemoteResult<Option<FetchedBlob>>;

    /// Conditionally write the blob at `path`.
    ///
    /// `expected` is the last token this writer observed; `None` asserts
    /// the blob does not exist yet. Fails with `Conflict` if the remote's
    /// current token differs (or the blob exists when `None` was supplied).
    /// Returns the new token on success.
    async fn put(
        &self,
        path: &str,
        body: &Value,
        expected: Option<&VersionToken>,
    ) -> RemoteResult<VersionToken>;
}
