//! The `Store` facade: the producer- and consumer-facing API.
//!
//! One `Store` owns the mirror, the coalescer, the resolver, and the
//! ledger for a single server scope. Producers (scrapers, event handlers)
//! call `merge` and `append_*`; the serving layer calls `read`. All remote
//! I/O happens behind the debounce/retry machinery — a producer is never
//! blocked on the network and never observes a write failure synchronously.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use guildsync_remote::RemoteBlobStore;
use guildsync_types::{BlobContent, BlobKey, LedgerMap, Record, StreamClass, StreamCursor};

use crate::coalescer::{FlushSummary, WriteCoalescer};
use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::ledger::AppendOnlyLedger;
use crate::mirror::LocalMirror;
use crate::resolver::{CommitOutcome, ConflictResolver};

/// Merge-safe synchronized store for one mirrored server.
pub struct Store {
    config: StoreConfig,
    mirror: Arc<LocalMirror>,
    resolver: Arc<ConflictResolver>,
    coalescer: Arc<WriteCoalescer>,
    ledger: AppendOnlyLedger,
}

impl Store {
    pub fn new(config: StoreConfig, remote: Arc<dyn RemoteBlobStore>) -> Self {
        let mirror = Arc::new(LocalMirror::new(config.server_scope.clone(), remote.clone()));
        let resolver = Arc::new(ConflictResolver::new(
            mirror.clone(),
            remote,
            config.clone(),
        ));
        let coalescer = WriteCoalescer::new(mirror.clone(), resolver.clone(), config.clone());
        let ledger = AppendOnlyLedger::new(mirror.clone(), coalescer.clone(), resolver.clone());
        Self {
            config,
            mirror,
            resolver,
            coalescer,
            ledger,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ---- Consumer-facing reads ----

    /// Read a blob's content, lazily seeding the cache from the remote.
    ///
    /// Reads keep serving the last good in-memory snapshot even while
    /// remote sync is failing; only the very first access of a key can
    /// surface a transient remote error.
    pub async fn read(&self, key: &BlobKey) -> StoreResult<BlobContent> {
        self.mirror.get(key).await
    }

    /// All messages of a channel: the union of its member and bot ledgers.
    pub async fn channel_messages(&self, channel_id: &str) -> StoreResult<LedgerMap> {
        let mut merged = LedgerMap::new();
        for class in [StreamClass::Member, StreamClass::Bot] {
            let key = BlobKey::ledger(channel_id, class)?;
            let content = self.mirror.get(&key).await?;
            if let Some(ledger) = content.as_ledger() {
                for (id, body) in ledger {
                    merged.entry(id.clone()).or_insert_with(|| body.clone());
                }
            }
        }
        Ok(merged)
    }

    // ---- Producer-facing writes ----

    /// Shallow-merge a partial into a blob and schedule a coalesced write.
    /// Synchronous with respect to the cache: no network I/O on this path.
    pub fn merge(&self, key: &BlobKey, partial: &BlobContent) -> StoreResult<()> {
        self.mirror.merge(key, partial)?;
        self.coalescer.schedule(key.clone());
        Ok(())
    }

    /// Like [`Store::merge`], decoding the partial from raw JSON by the
    /// key's kind.
    pub fn merge_json(&self, key: &BlobKey, partial: Value) -> StoreResult<()> {
        let partial = BlobContent::from_json(key.kind(), partial)?;
        self.merge(key, &partial)
    }

    /// Append records to a stream, deduplicating by id. Large batches are
    /// processed in pages so a backfill scan persists incrementally.
    pub async fn append_records(
        &self,
        stream_key: &BlobKey,
        records: &[Record],
    ) -> StoreResult<usize> {
        let page_size = self.config.ledger_page_size.max(1);
        let mut appended = 0;
        for page in records.chunks(page_size) {
            appended += self.ledger.append(stream_key, page).await?;
        }
        Ok(appended)
    }

    /// Route one message to the channel's member or bot ledger based on
    /// the record's author flags.
    pub async fn append_message(&self, channel_id: &str, record: Record) -> StoreResult<usize> {
        let key = BlobKey::ledger(channel_id, record.stream_class())?;
        self.ledger.append(&key, &[record]).await
    }

    /// Direct access to the ledger component.
    pub fn ledger(&self) -> &AppendOnlyLedger {
        &self.ledger
    }

    // ---- Backfill cursors ----

    /// The last record id a backfill scan reached for a channel.
    pub async fn stream_cursor(&self, channel_id: &str) -> StoreResult<StreamCursor> {
        let key = BlobKey::stream_cursor(channel_id)?;
        let content = self.mirror.get(&key).await?;
        Ok(content.as_stream_cursor().cloned().unwrap_or_default())
    }

    /// Advance a channel's backfill cursor.
    ///
    /// Written eagerly rather than debounced: a lost cursor makes the next
    /// scan repeat a whole window of work.
    pub async fn set_stream_cursor(&self, channel_id: &str, last_id: &str) -> StoreResult<()> {
        let key = BlobKey::stream_cursor(channel_id)?;
        let cursor = StreamCursor {
            last_message_id: Some(last_id.to_string()),
            last_update: Some(Utc::now()),
        };
        self.mirror.merge(&key, &BlobContent::StreamCursor(cursor))?;
        match self.resolver.commit(&key).await? {
            CommitOutcome::Committed { still_dirty: true } | CommitOutcome::InFlight => {
                self.coalescer.schedule(key);
            }
            _ => {}
        }
        Ok(())
    }

    // ---- Lifecycle ----

    /// Warm the mirror with every well-known singleton blob. Absent blobs
    /// seed as empty content; this never fails for a missing remote file.
    pub async fn preload(&self) -> StoreResult<()> {
        for key in BlobKey::preload_set() {
            self.mirror.ensure_loaded(&key).await?;
        }
        Ok(())
    }

    /// Cancel all pending debounce timers and commit every dirty key.
    /// Call before process exit; an unclean exit loses at most the most
    /// recent debounce window of merges.
    pub async fn flush(&self) -> FlushSummary {
        self.coalescer.flush_all().await
    }

    /// Keys with uncommitted local changes.
    pub fn dirty_keys(&self) -> Vec<BlobKey> {
        self.mirror.dirty_keys()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("scope", &self.config.server_scope)
            .field("mirror", &self.mirror)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guildsync_remote::InMemoryRemoteStore;
    use guildsync_types::BlobKind;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<InMemoryRemoteStore>, Store) {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let config = StoreConfig {
            debounce_jitter: Duration::ZERO,
            ..StoreConfig::new("srv")
        };
        let store = Store::new(config, remote.clone() as Arc<dyn RemoteBlobStore>);
        (remote, store)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn merges_coalesce_and_read_sees_them_before_the_put() {
        let (remote, store) = setup();
        let key = BlobKey::guild_info();

        store.merge_json(&key, json!({"name": "Foo"})).unwrap();
        store.merge_json(&key, json!({"icon": "x.png"})).unwrap();

        // The cache already serves the merged view, before any remote write.
        let content = store.read(&key).await.unwrap();
        let info = content.as_guild_info().unwrap();
        assert_eq!(info.name.as_deref(), Some("Foo"));
        assert_eq!(info.icon.as_deref(), Some("x.png"));
        assert_eq!(remote.put_count(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        // One remote PUT carrying both merges.
        assert_eq!(remote.puts_for("srv/info/guild_info.json"), 1);
        let blob = remote.blob("srv/info/guild_info.json").unwrap();
        assert_eq!(blob, json!({"name": "Foo", "icon": "x.png"}));
    }

    #[tokio::test(start_paused = true)]
    async fn append_scenario_from_two_batches() {
        let (remote, store) = setup();
        let key = BlobKey::ledger("123", StreamClass::Member).unwrap();

        let first = store
            .append_records(
                &key,
                &[Record::new("a", json!({})), Record::new("b", json!({}))],
            )
            .await
            .unwrap();
        assert_eq!(first, 2);

        let second = store
            .append_records(
                &key,
                &[Record::new("b", json!({})), Record::new("c", json!({}))],
            )
            .await
            .unwrap();
        assert_eq!(second, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        let blob = remote.blob("srv/messages/123/member_messages.json").unwrap();
        assert_eq!(blob.as_object().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_route_by_author_class() {
        let (_, store) = setup();
        store
            .append_message("9", Record::new("m1", json!({"content": "hi"})))
            .await
            .unwrap();
        store
            .append_message("9", Record::new("b1", json!({"isBot": true})))
            .await
            .unwrap();

        let member_key = BlobKey::ledger("9", StreamClass::Member).unwrap();
        let bot_key = BlobKey::ledger("9", StreamClass::Bot).unwrap();
        assert_eq!(store.read(&member_key).await.unwrap().record_count(), Some(1));
        assert_eq!(store.read(&bot_key).await.unwrap().record_count(), Some(1));

        let all = store.channel_messages("9").await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_round_trip_is_eager() {
        let (remote, store) = setup();

        store.set_stream_cursor("123", "m999").await.unwrap();
        // No debounce wait: the cursor is already durable.
        assert_eq!(remote.puts_for("srv/messages/123/metadata.json"), 1);

        let cursor = store.stream_cursor("123").await.unwrap();
        assert_eq!(cursor.last_message_id.as_deref(), Some("m999"));
        assert!(cursor.last_update.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn preload_tolerates_absent_blobs() {
        let (remote, store) = setup();
        remote.seed("srv/info/guild_info.json", json!({"name": "Foo"}));

        store.preload().await.unwrap();
        let loaded = remote.get_count();
        assert_eq!(loaded as usize, BlobKey::preload_set().len());

        // Every preloaded key reads from cache afterwards.
        for key in BlobKey::preload_set() {
            store.read(&key).await.unwrap();
        }
        assert_eq!(remote.get_count(), loaded);

        let info = store.read(&BlobKey::guild_info()).await.unwrap();
        assert_eq!(info.as_guild_info().unwrap().name.as_deref(), Some("Foo"));
        let members = store.read(&BlobKey::member_map()).await.unwrap();
        assert_eq!(members, BlobKind::MemberMap.empty_content());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_drains_every_dirty_key() {
        let (remote, store) = setup();

        store
            .merge_json(&BlobKey::guild_info(), json!({"name": "Foo"}))
            .unwrap();
        store
            .merge_json(&BlobKey::role_info(), json!({"r1": {"name": "admin"}}))
            .unwrap();
        store
            .append_message("7", Record::new("m1", json!({"content": "hi"})))
            .await
            .unwrap();
        assert_eq!(store.dirty_keys().len(), 3);

        let summary = store.flush().await;
        assert_eq!(summary.committed, 3);
        assert_eq!(summary.failed, 0);
        assert!(store.dirty_keys().is_empty());
        assert_eq!(remote.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_failures_are_invisible_to_producers() {
        use guildsync_remote::InjectedFault;

        let (remote, store) = setup();
        let key = BlobKey::guild_info();
        remote.inject_put_faults(&[
            InjectedFault::Transient,
            InjectedFault::Transient,
            InjectedFault::Transient,
        ]);

        // The merge itself never errors, whatever the remote does.
        store.merge_json(&key, json!({"name": "Foo"})).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;

        // The commit gave up for now; the data is still served and dirty.
        assert!(store.dirty_keys().contains(&key));
        let content = store.read(&key).await.unwrap();
        assert_eq!(content.as_guild_info().unwrap().name.as_deref(), Some("Foo"));

        // The next flush (fault queue drained) makes it durable.
        let summary = store.flush().await;
        assert_eq!(summary.committed, 1);
        assert_eq!(
            remote.blob("srv/info/guild_info.json").unwrap()["name"],
            json!("Foo")
        );
    }
}
