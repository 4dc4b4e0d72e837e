//! CAS commit with refetch-and-remerge conflict resolution.
//!
//! A commit snapshots the cache entry, puts it with the last-known version
//! token, and on a conflict rebases the entry on freshly fetched remote
//! content before retrying. Transient failures retry with the same
//! snapshot. Both paths share one bounded attempt budget with randomized
//! backoff so two colliding writers de-synchronize.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info, warn};

use guildsync_remote::RemoteBlobStore;
use guildsync_types::BlobKey;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::mirror::{BeginCommit, LocalMirror};

/// How a commit attempt ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The entry was not dirty; nothing was written.
    Clean,
    /// Another commit for this key is already on the wire.
    InFlight,
    /// The put landed. `still_dirty` reports whether mutations arrived
    /// during the round trip (the caller should reschedule).
    Committed { still_dirty: bool },
}

/// Serializes and retries remote writes for the mirror.
pub struct ConflictResolver {
    mirror: Arc<LocalMirror>,
    remote: Arc<dyn RemoteBlobStore>,
    config: StoreConfig,
}

impl ConflictResolver {
    pub fn new(
        mirror: Arc<LocalMirror>,
        remote: Arc<dyn RemoteBlobStore>,
        config: StoreConfig,
    ) -> Self {
        Self {
            mirror,
            remote,
            config,
        }
    }

    /// Commit the dirty content of `key` to the remote store.
    ///
    /// Errors leave the entry dirty; it is retried on the next scheduled
    /// write or flush. An [`StoreError::IntegrityViolation`] aborts before
    /// anything reaches the remote.
    pub async fn commit(&self, key: &BlobKey) -> StoreResult<CommitOutcome> {
        let mut snapshot = match self.mirror.begin_commit(key) {
            BeginCommit::Clean => return Ok(CommitOutcome::Clean),
            BeginCommit::InFlight => return Ok(CommitOutcome::InFlight),
            BeginCommit::Snapshot(snapshot) => snapshot,
        };

        let path = self.mirror.path(key);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            if key.is_ledger() {
                let count = snapshot.content.record_count().unwrap_or(0);
                if count < snapshot.committed_count {
                    self.mirror.finish_commit_failure(key);
                    let err = StoreError::IntegrityViolation {
                        key: key.clone(),
                        before: snapshot.committed_count,
                        after: count,
                    };
                    error!(key = %key, %err, "refusing to commit a shrunk ledger");
                    return Err(err);
                }
            }

            let body = match snapshot.content.to_json() {
                Ok(body) => body,
                Err(err) => {
                    self.mirror.finish_commit_failure(key);
                    return Err(err.into());
                }
            };

            match self
                .remote
                .put(&path, &body, snapshot.version.as_ref())
                .await
            {
                Ok(token) => {
                    let committed_count = snapshot.content.record_count();
                    let still_dirty = self.mirror.finish_commit_success(
                        key,
                        token,
                        snapshot.generation,
                        committed_count,
                    );
                    info!(key = %key, attempt, "committed");
                    return Ok(CommitOutcome::Committed { still_dirty });
                }
                Err(err) if err.is_conflict() && attempt < self.config.max_commit_attempts => {
                    warn!(key = %key, attempt, "version conflict, refetching and re-merging");
                    self.backoff().await;
                    snapshot = match self.refetch_and_rebase(key, &path).await {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            self.mirror.finish_commit_failure(key);
                            return Err(err);
                        }
                    };
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_commit_attempts => {
                    warn!(key = %key, attempt, error = %err, "transient put failure, backing off");
                    self.backoff().await;
                }
                Err(err) => {
                    self.mirror.finish_commit_failure(key);
                    warn!(
                        key = %key,
                        attempts = attempt,
                        error = %err,
                        "commit gave up, entry stays dirty until the next write or flush"
                    );
                    return Err(StoreError::CommitFailed {
                        key: key.clone(),
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    async fn refetch_and_rebase(
        &self,
        key: &BlobKey,
        path: &str,
    ) -> StoreResult<crate::mirror::CommitSnapshot> {
        let fetched = self.remote.get(path).await?;
        debug!(key = %key, found = fetched.is_some(), "refetched after conflict");
        self.mirror.rebase_on_remote(key, fetched)
    }

    async fn backoff(&self) {
        let min = self.config.retry_backoff_min;
        let max = self.config.retry_backoff_max;
        let span_ms = max.saturating_sub(min).as_millis() as u64;
        let delay = min + std::time::Duration::from_millis(rand::thread_rng().gen_range(0..=span_ms));
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildsync_remote::{InMemoryRemoteStore, InjectedFault};
    use guildsync_types::{BlobContent, BlobKind, Record, StreamClass};
    use serde_json::json;

    fn setup() -> (Arc<InMemoryRemoteStore>, Arc<LocalMirror>, ConflictResolver) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let mirror = Arc::new(LocalMirror::new(
            "srv",
            remote.clone() as Arc<dyn RemoteBlobStore>,
        ));
        let resolver = ConflictResolver::new(
            mirror.clone(),
            remote.clone() as Arc<dyn RemoteBlobStore>,
            StoreConfig::new("srv"),
        );
        (remote, mirror, resolver)
    }

    fn guild_partial(value: serde_json::Value) -> BlobContent {
        BlobContent::from_json(BlobKind::GuildInfo, value).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn clean_entry_commits_nothing() {
        let (remote, _, resolver) = setup();
        let outcome = resolver.commit(&BlobKey::guild_info()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Clean);
        assert_eq!(remote.put_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_creates_then_updates() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::guild_info();

        mirror.merge(&key, &guild_partial(json!({"name": "Foo"}))).unwrap();
        let outcome = resolver.commit(&key).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { still_dirty: false });
        assert_eq!(
            remote.blob("srv/info/guild_info.json").unwrap()["name"],
            json!("Foo")
        );

        mirror.merge(&key, &guild_partial(json!({"icon": "x.png"}))).unwrap();
        resolver.commit(&key).await.unwrap();
        let blob = remote.blob("srv/info/guild_info.json").unwrap();
        assert_eq!(blob["name"], json!("Foo"));
        assert_eq!(blob["icon"], json!("x.png"));
        assert!(!mirror.is_dirty(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_rebases_and_retries() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::guild_info();

        // Someone else created the blob after our cache went dirty.
        remote.seed("srv/info/guild_info.json", json!({"ownerId": "o1"}));
        mirror.merge(&key, &guild_partial(json!({"name": "Foo"}))).unwrap();

        let outcome = resolver.commit(&key).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { still_dirty: false });

        // Both contributions survive the re-merge.
        let blob = remote.blob("srv/info/guild_info.json").unwrap();
        assert_eq!(blob["name"], json!("Foo"));
        assert_eq!(blob["ownerId"], json!("o1"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::guild_info();
        remote.inject_put_faults(&[InjectedFault::Transient, InjectedFault::Transient]);

        mirror.merge(&key, &guild_partial(json!({"name": "Foo"}))).unwrap();
        let outcome = resolver.commit(&key).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { still_dirty: false });
        assert_eq!(remote.put_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_leaves_entry_dirty() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::guild_info();
        remote.inject_put_faults(&[
            InjectedFault::Transient,
            InjectedFault::Transient,
            InjectedFault::Transient,
        ]);

        mirror.merge(&key, &guild_partial(json!({"name": "Foo"}))).unwrap();
        let err = resolver.commit(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::CommitFailed { attempts: 3, .. }));
        assert!(mirror.is_dirty(&key));

        // The fault queue is drained; the next commit goes through.
        resolver.commit(&key).await.unwrap();
        assert!(!mirror.is_dirty(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn shrunk_ledger_never_reaches_the_remote() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::ledger("123", StreamClass::Member).unwrap();

        mirror
            .append_ledger(
                &key,
                &[
                    Record::new("a", json!({})),
                    Record::new("b", json!({})),
                    Record::new("c", json!({})),
                ],
            )
            .unwrap();
        resolver.commit(&key).await.unwrap();
        let committed = remote.blob("srv/messages/123/member_messages.json").unwrap();
        assert_eq!(committed.as_object().unwrap().len(), 3);

        // Simulate a stale full overwrite losing record "c".
        mirror.force_content(
            &key,
            BlobContent::from_json(BlobKind::LedgerMap, json!({"a": {}, "b": {}})).unwrap(),
        );
        let err = resolver.commit(&key).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::IntegrityViolation { before: 3, after: 2, .. }
        ));

        // Remote blob unchanged.
        assert_eq!(
            remote.blob("srv/messages/123/member_messages.json").unwrap(),
            committed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_rebase_refuses_a_stomped_down_remote() {
        let (remote, mirror, resolver) = setup();
        let key = BlobKey::ledger("123", StreamClass::Member).unwrap();
        let path = "srv/messages/123/member_messages.json";

        mirror
            .append_ledger(
                &key,
                &[
                    Record::new("a", json!({})),
                    Record::new("b", json!({})),
                    Record::new("c", json!({})),
                ],
            )
            .unwrap();
        resolver.commit(&key).await.unwrap();

        // An out-of-band writer truncates the stream to a single record,
        // invalidating our token.
        remote.seed(path, json!({"x": {}}));

        // The next append conflicts; the rebase would land at 2 records
        // against 3 known durable, so the retry put must never happen.
        mirror
            .append_ledger(&key, &[Record::new("d", json!({}))])
            .unwrap();
        let err = resolver.commit(&key).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::IntegrityViolation { before: 3, after: 2, .. }
        ));
        assert_eq!(remote.blob(path).unwrap(), json!({"x": {}}));
        assert!(mirror.is_dirty(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn two_writers_converge_through_cas() {
        // Two independent stores sharing one remote, both starting from the
        // same (absent) version.
        let remote = Arc::new(InMemoryRemoteStore::new());
        let key = BlobKey::guild_info();

        let mirror_a = Arc::new(LocalMirror::new(
            "srv",
            remote.clone() as Arc<dyn RemoteBlobStore>,
        ));
        let resolver_a = ConflictResolver::new(
            mirror_a.clone(),
            remote.clone() as Arc<dyn RemoteBlobStore>,
            StoreConfig::new("srv"),
        );
        let mirror_b = Arc::new(LocalMirror::new(
            "srv",
            remote.clone() as Arc<dyn RemoteBlobStore>,
        ));
        let resolver_b = ConflictResolver::new(
            mirror_b.clone(),
            remote.clone() as Arc<dyn RemoteBlobStore>,
            StoreConfig::new("srv"),
        );

        mirror_a.merge(&key, &guild_partial(json!({"name": "Foo"}))).unwrap();
        mirror_b.merge(&key, &guild_partial(json!({"icon": "x.png"}))).unwrap();

        // A wins the race; B conflicts, re-merges, succeeds on retry.
        resolver_a.commit(&key).await.unwrap();
        resolver_b.commit(&key).await.unwrap();

        let blob = remote.blob("srv/info/guild_info.json").unwrap();
        assert_eq!(blob["name"], json!("Foo"));
        assert_eq!(blob["icon"], json!("x.png"));
    }
}
