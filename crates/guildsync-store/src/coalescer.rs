//! Per-key debounce scheduling of remote writes.
//!
//! Rapid successive mutations of one key collapse into a single remote put
//! after a quiet period, keeping the store under the content API's rate
//! limits. Two policies apply:
//!
//! - Singleton blobs use a trailing debounce: a new mutation cancels the
//!   pending timer and starts a fresh window.
//! - Ledger blobs keep the first timer's deadline: a backfill appending a
//!   page every second must not push the write out forever, so later pages
//!   join the pending window instead of resetting it.
//!
//! Timer tasks never run the commit themselves; they hand it to a detached
//! task. Cancelling a timer therefore can never kill a commit mid-put.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use guildsync_types::BlobKey;

use crate::config::StoreConfig;
use crate::mirror::LocalMirror;
use crate::resolver::{CommitOutcome, ConflictResolver};

/// At most one of these exists per key (the single-PendingWrite invariant).
struct PendingWrite {
    id: u64,
    handle: JoinHandle<()>,
}

/// Outcome counts of a [`WriteCoalescer::flush_all`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub committed: usize,
    pub failed: usize,
}

/// Schedules debounced commits, one pending write per key.
pub struct WriteCoalescer {
    mirror: Arc<LocalMirror>,
    resolver: Arc<ConflictResolver>,
    config: StoreConfig,
    pending: Mutex<HashMap<BlobKey, PendingWrite>>,
    next_id: Mutex<u64>,
    // Handle to ourselves for the timer tasks we spawn.
    weak: Weak<WriteCoalescer>,
}

impl WriteCoalescer {
    pub fn new(
        mirror: Arc<LocalMirror>,
        resolver: Arc<ConflictResolver>,
        config: StoreConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            mirror,
            resolver,
            config,
            pending: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
            weak: weak.clone(),
        })
    }

    /// Number of keys with a pending timer.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("coalescer lock poisoned").len()
    }

    /// Request a debounced write for `key`.
    pub fn schedule(&self, key: BlobKey) {
        let mut pending = self.pending.lock().expect("coalescer lock poisoned");
        if let Some(existing) = pending.get(&key) {
            if key.is_ledger() {
                // Keep the original deadline; the pending write picks up
                // whatever has accumulated by the time it fires.
                return;
            }
            existing.handle.abort();
        }

        let id = {
            let mut next = self.next_id.lock().expect("coalescer lock poisoned");
            *next += 1;
            *next
        };
        let delay = self.delay_for(&key);
        let this = self.weak.upgrade().expect("coalescer dropped");
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let ours = {
                let mut pending = this.pending.lock().expect("coalescer lock poisoned");
                match pending.get(&task_key) {
                    Some(p) if p.id == id => {
                        pending.remove(&task_key);
                        true
                    }
                    // Superseded by a newer schedule; that timer owns the key.
                    _ => false,
                }
            };
            if ours {
                let commit_key = task_key.clone();
                tokio::spawn(async move {
                    this.run_commit(commit_key).await;
                });
            }
        });

        debug!(key = %key, ?delay, "scheduled debounced write");
        pending.insert(key, PendingWrite { id, handle });
    }

    /// Cancel every pending timer and commit every dirty key immediately.
    ///
    /// Idempotent and safe to call concurrently with new `schedule` calls:
    /// a key scheduled mid-flush is committed as part of the flush. Keys
    /// whose commit fails are left dirty and reported in the summary.
    pub async fn flush_all(&self) -> FlushSummary {
        let mut summary = FlushSummary::default();
        let mut failed: HashSet<BlobKey> = HashSet::new();

        loop {
            let drained: Vec<PendingWrite> = {
                let mut pending = self.pending.lock().expect("coalescer lock poisoned");
                pending.drain().map(|(_, p)| p).collect()
            };
            for p in &drained {
                p.handle.abort();
            }

            let remaining: Vec<BlobKey> = self
                .mirror
                .dirty_keys()
                .into_iter()
                .filter(|key| !failed.contains(key))
                .collect();
            if remaining.is_empty() {
                break;
            }

            for key in remaining {
                match self.resolver.commit(&key).await {
                    Ok(CommitOutcome::Committed { .. }) => summary.committed += 1,
                    Ok(CommitOutcome::Clean) => {}
                    Ok(CommitOutcome::InFlight) => {
                        // A detached commit already owns the key; give it
                        // time to finish and re-check on the next pass.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(err) => {
                        warn!(key = %key, error = %err, "flush commit failed, key stays dirty");
                        failed.insert(key);
                        summary.failed += 1;
                    }
                }
            }
        }

        info!(
            committed = summary.committed,
            failed = summary.failed,
            "flush complete"
        );
        summary
    }

    async fn run_commit(&self, key: BlobKey) {
        match self.resolver.commit(&key).await {
            Ok(CommitOutcome::Committed { still_dirty: true }) | Ok(CommitOutcome::InFlight) => {
                // More work arrived (or someone beat us to the wire); give
                // the key a fresh window.
                self.schedule(key);
            }
            Ok(_) => {}
            Err(err) => {
                // Already logged by the resolver; the entry stays dirty and
                // the next merge or flush retries it.
                debug!(key = %key, error = %err, "debounced commit failed");
            }
        }
    }

    fn delay_for(&self, key: &BlobKey) -> Duration {
        let base = if key.is_ledger() {
            self.config.ledger_debounce_base
        } else {
            self.config.debounce_base
        };
        let jitter_ms = self.config.debounce_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        }
    }
}
