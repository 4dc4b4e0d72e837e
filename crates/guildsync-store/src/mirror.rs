//! The local in-memory mirror of remote blobs.
//!
//! `LocalMirror` is the sole owner of all cache state. Producers mutate it
//! through `merge`/`append_ledger`, which are synchronous with respect to
//! the cache lock — the network is never touched while a producer waits.
//! The only async entry points are the lazy seed from the remote on first
//! access and the commit handshake used by the conflict resolver.
//!
//! Per entry the mirror tracks, besides the content itself:
//! - `pending`: the accumulated partials merged since the last successful
//!   commit. On a CAS conflict this delta is replayed on top of freshly
//!   fetched remote content, so remote wins on untouched keys and local
//!   wins on keys it explicitly merged.
//! - `generation`: bumped on every mutation. A commit snapshots it and only
//!   clears the dirty flag if no mutation arrived during the round trip.
//! - `committed_count`: for ledgers, the record count last known durable.
//!   A commit that would shrink below it is an integrity violation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use guildsync_remote::{FetchedBlob, RemoteBlobStore, VersionToken};
use guildsync_types::{BlobContent, BlobKey, Record, RecordId};

use crate::error::{StoreError, StoreResult};

/// One cached blob and its synchronization state.
struct CacheEntry {
    content: BlobContent,
    version: Option<VersionToken>,
    dirty: bool,
    pending: Option<BlobContent>,
    generation: u64,
    in_flight: bool,
    committed_count: usize,
}

impl CacheEntry {
    fn clean(content: BlobContent, version: Option<VersionToken>) -> Self {
        let committed_count = content.record_count().unwrap_or(0);
        Self {
            content,
            version,
            dirty: false,
            pending: None,
            generation: 0,
            in_flight: false,
            committed_count,
        }
    }
}

/// What the resolver gets when it asks to start a commit.
pub(crate) enum BeginCommit {
    /// Nothing to do: the entry is absent or not dirty.
    Clean,
    /// Another commit for this key is mid-flight; try again later.
    InFlight,
    /// Commit this snapshot.
    Snapshot(CommitSnapshot),
}

/// A consistent view of one entry taken under the lock.
pub(crate) struct CommitSnapshot {
    pub content: BlobContent,
    pub version: Option<VersionToken>,
    pub generation: u64,
    pub committed_count: usize,
}

/// In-memory mapping from blob key to decoded content; source of truth for
/// reads until flushed. Constructed per server scope — no global state.
pub struct LocalMirror {
    scope: String,
    remote: Arc<dyn RemoteBlobStore>,
    entries: Mutex<HashMap<BlobKey, CacheEntry>>,
}

impl LocalMirror {
    pub fn new(scope: impl Into<String>, remote: Arc<dyn RemoteBlobStore>) -> Self {
        Self {
            scope: scope.into(),
            remote,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The remote object path for a key under this mirror's scope.
    pub fn path(&self, key: &BlobKey) -> String {
        key.remote_path(&self.scope)
    }

    /// Return the cached content, seeding from the remote on first access.
    ///
    /// An absent remote blob yields the kind's empty content; a blob that
    /// fetches but fails to decode is logged and also treated as empty (an
    /// empty local view is safer than blocking all progress).
    pub async fn get(&self, key: &BlobKey) -> StoreResult<BlobContent> {
        self.ensure_loaded(key).await?;
        let entries = self.entries.lock().expect("mirror lock poisoned");
        Ok(entries
            .get(key)
            .map(|entry| entry.content.clone())
            .unwrap_or_else(|| key.kind().empty_content()))
    }

    /// Seed the cache entry for `key` from the remote if not yet present.
    pub async fn ensure_loaded(&self, key: &BlobKey) -> StoreResult<()> {
        {
            let entries = self.entries.lock().expect("mirror lock poisoned");
            if entries.contains_key(key) {
                return Ok(());
            }
        }

        // Fetch outside the lock; NotFound is a normal outcome.
        let fetched = self.remote.get(&self.path(key)).await?;
        let (content, version) = self.decode_fetched(key, fetched);

        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        // A concurrent task may have seeded (or merged into) the entry
        // while we were fetching; its state is newer than our fetch.
        entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::clean(content, version));
        Ok(())
    }

    /// Merge a partial into the cached content. Synchronous: no I/O.
    ///
    /// If the key was never loaded, the entry starts from the kind's empty
    /// content with no version token; the eventual create-put will CAS
    /// against an existing remote blob and rebase if one appears.
    pub fn merge(&self, key: &BlobKey, partial: &BlobContent) -> StoreResult<()> {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::clean(key.kind().empty_content(), None));

        entry.content.merge(partial)?;
        match &mut entry.pending {
            Some(pending) => pending.merge(partial)?,
            None => entry.pending = Some(partial.clone()),
        }
        entry.dirty = true;
        entry.generation += 1;
        Ok(())
    }

    /// Append unseen records to a ledger entry, enforcing the no-loss
    /// guard before the content is touched. Returns the count actually
    /// added; 0 means full deduplication.
    pub fn append_ledger(&self, key: &BlobKey, records: &[Record]) -> StoreResult<usize> {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::clean(key.kind().empty_content(), None));

        let ledger = entry
            .content
            .as_ledger_mut()
            .ok_or_else(|| StoreError::NotLedger { key: key.clone() })?;

        let before = ledger.len();
        let mut delta = guildsync_types::LedgerMap::new();
        for record in records {
            if !ledger.contains_key(&record.id) {
                ledger.insert(record.id.clone(), record.body.clone());
                delta.insert(record.id.clone(), record.body.clone());
            }
        }
        let after = ledger.len();
        if after < before {
            // Unreachable through the union above; the guard stays because
            // a shrink here would otherwise be committed as durable loss.
            return Err(StoreError::IntegrityViolation {
                key: key.clone(),
                before,
                after,
            });
        }

        let appended = delta.len();
        if appended > 0 {
            let partial = BlobContent::LedgerMap(delta);
            match &mut entry.pending {
                Some(pending) => pending.merge(&partial)?,
                None => entry.pending = Some(partial),
            }
            entry.dirty = true;
            entry.generation += 1;
        }
        Ok(appended)
    }

    /// The set of record ids currently known for a ledger key.
    pub fn known_ids(&self, key: &BlobKey) -> StoreResult<HashSet<RecordId>> {
        let entries = self.entries.lock().expect("mirror lock poisoned");
        match entries.get(key) {
            Some(entry) => {
                let ledger = entry
                    .content
                    .as_ledger()
                    .ok_or_else(|| StoreError::NotLedger { key: key.clone() })?;
                Ok(ledger.keys().cloned().collect())
            }
            None => Ok(HashSet::new()),
        }
    }

    /// All keys currently marked dirty.
    pub fn dirty_keys(&self) -> Vec<BlobKey> {
        let entries = self.entries.lock().expect("mirror lock poisoned");
        entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn is_dirty(&self, key: &BlobKey) -> bool {
        let entries = self.entries.lock().expect("mirror lock poisoned");
        entries.get(key).map(|e| e.dirty).unwrap_or(false)
    }

    // ---- Commit handshake (resolver only) ----

    pub(crate) fn begin_commit(&self, key: &BlobKey) -> BeginCommit {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return BeginCommit::Clean;
        };
        if !entry.dirty {
            return BeginCommit::Clean;
        }
        if entry.in_flight {
            return BeginCommit::InFlight;
        }
        entry.in_flight = true;
        BeginCommit::Snapshot(CommitSnapshot {
            content: entry.content.clone(),
            version: entry.version.clone(),
            generation: entry.generation,
            committed_count: entry.committed_count,
        })
    }

    /// Rebase the entry on freshly fetched remote content after a CAS
    /// conflict: the remote body becomes the base, the accumulated pending
    /// delta is replayed on top, and a new snapshot is taken.
    pub(crate) fn rebase_on_remote(
        &self,
        key: &BlobKey,
        fetched: Option<FetchedBlob>,
    ) -> StoreResult<CommitSnapshot> {
        let remote_count = fetched
            .as_ref()
            .and_then(|blob| blob.value.as_object().map(|m| m.len()));
        let (remote_content, remote_version) = self.decode_fetched(key, fetched);

        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let entry = entries
            .get_mut(key)
            .expect("rebase of an entry that was never committed");

        let mut merged = remote_content;
        if let Some(pending) = &entry.pending {
            merged.merge(pending)?;
        }

        if key.is_ledger() {
            let after = merged.record_count().unwrap_or(0);
            let before = remote_count.unwrap_or(0).max(entry.committed_count);
            if after < before {
                entry.in_flight = false;
                return Err(StoreError::IntegrityViolation {
                    key: key.clone(),
                    before,
                    after,
                });
            }
            entry.committed_count = entry.committed_count.max(remote_count.unwrap_or(0));
        }

        entry.content = merged.clone();
        entry.version = remote_version.clone();
        Ok(CommitSnapshot {
            content: merged,
            version: remote_version,
            generation: entry.generation,
            committed_count: entry.committed_count,
        })
    }

    /// Record a successful put. Returns `true` if new mutations arrived
    /// during the round trip and the entry is still dirty.
    pub(crate) fn finish_commit_success(
        &self,
        key: &BlobKey,
        new_version: VersionToken,
        snapshot_generation: u64,
        committed_count: Option<usize>,
    ) -> bool {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.in_flight = false;
        entry.version = Some(new_version);
        if let Some(count) = committed_count {
            entry.committed_count = entry.committed_count.max(count);
        }
        if entry.generation == snapshot_generation {
            entry.dirty = false;
            entry.pending = None;
            false
        } else {
            debug!(key = %key, "mutations arrived during commit, entry stays dirty");
            true
        }
    }

    /// Record a failed put: release the in-flight flag and keep the entry
    /// dirty so the next scheduled write or flush retries it.
    pub(crate) fn finish_commit_failure(&self, key: &BlobKey) {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        if let Some(entry) = entries.get_mut(key) {
            entry.in_flight = false;
        }
    }

    fn decode_fetched(
        &self,
        key: &BlobKey,
        fetched: Option<FetchedBlob>,
    ) -> (BlobContent, Option<VersionToken>) {
        match fetched {
            None => (key.kind().empty_content(), None),
            Some(blob) => {
                let content = match BlobContent::from_json(key.kind(), blob.value) {
                    Ok(content) => content,
                    Err(err) => {
                        // Keep the version token: the next commit then
                        // CAS-replaces the unreadable blob instead of
                        // conflicting against it forever.
                        warn!(key = %key, error = %err, "malformed remote content, treating as empty");
                        key.kind().empty_content()
                    }
                };
                (content, Some(blob.version))
            }
        }
    }

    // ---- Test support ----

    /// Overwrite an entry's content wholesale, bypassing merge. Simulates
    /// the stale full-overwrite race the integrity guard exists for.
    #[cfg(test)]
    pub(crate) fn force_content(&self, key: &BlobKey, content: BlobContent) {
        let mut entries = self.entries.lock().expect("mirror lock poisoned");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::clean(key.kind().empty_content(), None));
        entry.pending = Some(content.clone());
        entry.content = content;
        entry.dirty = true;
        entry.generation += 1;
    }

    #[cfg(test)]
    pub(crate) fn version_of(&self, key: &BlobKey) -> Option<VersionToken> {
        let entries = self.entries.lock().expect("mirror lock poisoned");
        entries.get(key).and_then(|e| e.version.clone())
    }
}

impl std::fmt::Debug for LocalMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.entries.lock().expect("mirror lock poisoned").len();
        f.debug_struct("LocalMirror")
            .field("scope", &self.scope)
            .field("entry_count", &count)
            .finish()
    }
}
