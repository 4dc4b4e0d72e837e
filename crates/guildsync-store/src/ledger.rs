//! Append-only write path for high-volume record streams.
//!
//! A ledger blob is a mapping from record id to record body. Appends dedup
//! against the known-id set and only ever grow the map; the no-loss guard
//! refuses any commit that would shrink the record count below what is
//! already durable.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use guildsync_types::{BlobKey, Record, RecordId};

use crate::coalescer::WriteCoalescer;
use crate::error::{StoreError, StoreResult};
use crate::mirror::LocalMirror;
use crate::resolver::{CommitOutcome, ConflictResolver};

/// Append-mostly record streams over the mirror.
pub struct AppendOnlyLedger {
    mirror: Arc<LocalMirror>,
    coalescer: Arc<WriteCoalescer>,
    resolver: Arc<ConflictResolver>,
}

impl AppendOnlyLedger {
    pub fn new(
        mirror: Arc<LocalMirror>,
        coalescer: Arc<WriteCoalescer>,
        resolver: Arc<ConflictResolver>,
    ) -> Self {
        Self {
            mirror,
            coalescer,
            resolver,
        }
    }

    /// The ids already present in a stream, loading the blob on first use.
    pub async fn load_known_ids(&self, stream_key: &BlobKey) -> StoreResult<HashSet<RecordId>> {
        self.require_ledger(stream_key)?;
        self.mirror.ensure_loaded(stream_key).await?;
        self.mirror.known_ids(stream_key)
    }

    /// Append unseen records to the stream and schedule a coalesced write.
    ///
    /// Returns the count actually added; 0 means every record was already
    /// known (a valid, non-error result).
    pub async fn append(&self, stream_key: &BlobKey, records: &[Record]) -> StoreResult<usize> {
        self.require_ledger(stream_key)?;
        self.mirror.ensure_loaded(stream_key).await?;

        let appended = self.mirror.append_ledger(stream_key, records)?;
        if appended > 0 {
            debug!(key = %stream_key, appended, "appended records");
            self.coalescer.schedule(stream_key.clone());
        }
        Ok(appended)
    }

    /// Commit the stream's dirty state to the remote right now, bypassing
    /// the debounce window. Used to bound data loss at shutdown or after a
    /// backfill completes.
    pub async fn commit(&self, stream_key: &BlobKey) -> StoreResult<CommitOutcome> {
        self.require_ledger(stream_key)?;
        let outcome = self.resolver.commit(stream_key).await?;
        if matches!(
            outcome,
            CommitOutcome::Committed { still_dirty: true } | CommitOutcome::InFlight
        ) {
            self.coalescer.schedule(stream_key.clone());
        }
        Ok(outcome)
    }

    fn require_ledger(&self, key: &BlobKey) -> StoreResult<()> {
        if key.is_ledger() {
            Ok(())
        } else {
            Err(StoreError::NotLedger { key: key.clone() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use guildsync_remote::{InMemoryRemoteStore, RemoteBlobStore};
    use guildsync_types::StreamClass;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryRemoteStore>, AppendOnlyLedger) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = StoreConfig::new("srv");
        let mirror = Arc::new(LocalMirror::new(
            "srv",
            remote.clone() as Arc<dyn RemoteBlobStore>,
        ));
        let resolver = Arc::new(ConflictResolver::new(
            mirror.clone(),
            remote.clone() as Arc<dyn RemoteBlobStore>,
            config.clone(),
        ));
        let coalescer = WriteCoalescer::new(mirror.clone(), resolver.clone(), config);
        (remote, AppendOnlyLedger::new(mirror, coalescer, resolver))
    }

    #[tokio::test(start_paused = true)]
    async fn known_ids_come_from_the_remote() {
        let (remote, ledger) = setup();
        remote.seed(
            "srv/messages/42/member_messages.json",
            json!({"a": {}, "b": {}}),
        );

        let key = BlobKey::ledger("42", StreamClass::Member).unwrap();
        let ids = ledger.load_known_ids(&key).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&RecordId::new("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn appended_counts_sum_to_distinct_total() {
        let (_, ledger) = setup();
        let key = BlobKey::ledger("42", StreamClass::Member).unwrap();

        let first = ledger
            .append(&key, &[Record::new("a", json!({})), Record::new("b", json!({}))])
            .await
            .unwrap();
        let second = ledger
            .append(&key, &[Record::new("b", json!({})), Record::new("c", json!({}))])
            .await
            .unwrap();
        let third = ledger
            .append(&key, &[Record::new("a", json!({}))])
            .await
            .unwrap();

        assert_eq!((first, second, third), (2, 1, 0));
        let ids = ledger.load_known_ids(&key).await.unwrap();
        assert_eq!(first + second + third, ids.len());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_bypasses_the_debounce_window() {
        let (remote, ledger) = setup();
        let key = BlobKey::ledger("42", StreamClass::Member).unwrap();

        ledger
            .append(&key, &[Record::new("a", json!({"content": "hi"}))])
            .await
            .unwrap();
        // No time has passed: the debounced write has not fired yet.
        assert_eq!(remote.puts_for("srv/messages/42/member_messages.json"), 0);

        let outcome = ledger.commit(&key).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { still_dirty: false });
        assert_eq!(remote.puts_for("srv/messages/42/member_messages.json"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_ledger_keys_are_rejected() {
        let (_, ledger) = setup();
        let err = ledger
            .append(&BlobKey::guild_info(), &[Record::new("a", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotLedger { .. }));
    }
}
