//! Remote blob store client for guildsync.
//!
//! Defines the [`RemoteBlobStore`] trait — a versioned key-to-blob store
//! with per-key compare-and-swap — together with two backends: the hosted
//! content API over HTTP and an in-memory store for tests and embedding.

pub mod error;
pub mod hosted;
pub mod memory;
pub mod traits;

pub use error::{RemoteError, RemoteResult};
pub use hosted::{HostedContentConfig, HostedContentStore};
pub use memory::{InMemoryRemoteStore, InjectedFault};
pub use traits::{FetchedBlob, RemoteBlobStore, VersionToken};
