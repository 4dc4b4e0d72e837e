use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RemoteError, RemoteResult};
use crate::traits::{FetchedBlob, RemoteBlobStore, VersionToken};

/// A fault to inject into the next `put` call(s).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectedFault {
    Conflict,
    Transient,
}

/// In-memory, HashMap-based remote store with genuine CAS semantics.
///
/// Intended for tests and embedding. Version tokens are drawn from a
/// monotonic counter, so any out-of-band write is observable as a token
/// change exactly like on the hosted backend. Call counters and a fault
/// injection queue support retry and coalescing assertions.
pub struct InMemoryRemoteStore {
    blobs: RwLock<HashMap<String, (Value, VersionToken)>>,
    next_token: AtomicU64,
    get_calls: AtomicU64,
    put_calls: AtomicU64,
    puts_by_path: Mutex<HashMap<String, u64>>,
    faults: Mutex<VecDeque<InjectedFault>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            get_calls: AtomicU64::new(0),
            put_calls: AtomicU64::new(0),
            puts_by_path: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }

    /// The current body of a blob, if present. Test inspection helper.
    pub fn blob(&self, path: &str) -> Option<Value> {
        self.blobs
            .read()
            .expect("lock poisoned")
            .get(path)
            .map(|(value, _)| value.clone())
    }

    /// Seed a blob directly, bypassing CAS. Simulates another writer.
    pub fn seed(&self, path: &str, value: Value) -> VersionToken {
        let token = self.mint_token();
        self.blobs
            .write()
            .expect("lock poisoned")
            .insert(path.to_string(), (value, token.clone()));
        token
    }

    /// Total `get` calls observed.
    pub fn get_count(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    /// Total `put` calls observed (including rejected ones).
    pub fn put_count(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    /// Successful `put` calls for one path.
    pub fn puts_for(&self, path: &str) -> u64 {
        self.puts_by_path
            .lock()
            .expect("lock poisoned")
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    /// Queue faults to be returned by upcoming `put` calls, in order.
    pub fn inject_put_faults(&self, faults: &[InjectedFault]) {
        self.faults
            .lock()
            .expect("lock poisoned")
            .extend(faults.iter().copied());
    }

    fn mint_token(&self) -> VersionToken {
        let n = self.next_token.fetch_add(1, Ordering::Relaxed);
        VersionToken::new(format!("v{n}"))
    }

    fn take_fault(&self, path: &str) -> Option<RemoteError> {
        let fault = self.faults.lock().expect("lock poisoned").pop_front()?;
        Some(match fault {
            InjectedFault::Conflict => RemoteError::Conflict {
                path: path.to_string(),
            },
            InjectedFault::Transient => RemoteError::Transient {
                path: path.to_string(),
                status: Some(503),
                message: "injected fault".into(),
            },
        })
    }
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBlobStore for InMemoryRemoteStore {
    async fn get(&self, path: &str) -> RemoteResult<Option<FetchedBlob>> {
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let blobs = self.blobs.read().expect("lock poisoned");
        Ok(blobs.get(path).map(|(value, version)| FetchedBlob {
            value: value.clone(),
            version: version.clone(),
        }))
    }

    async fn put(
        &self,
        path: &str,
        body: &Value,
        expected: Option<&VersionToken>,
    ) -> RemoteResult<VersionToken> {
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.take_fault(path) {
            return Err(err);
        }

        let mut blobs = self.blobs.write().expect("lock poisoned");
        let current = blobs.get(path).map(|(_, version)| version);
        if current != expected {
            return Err(RemoteError::Conflict {
                path: path.to_string(),
            });
        }

        let token = self.mint_token();
        blobs.insert(path.to_string(), (body.clone(), token.clone()));
        *self
            .puts_by_path
            .lock()
            .expect("lock poisoned")
            .entry(path.to_string())
            .or_insert(0) += 1;
        Ok(token)
    }
}

impl std::fmt::Debug for InMemoryRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRemoteStore")
            .field("blob_count", &self.len())
            .finish()
    }
}
