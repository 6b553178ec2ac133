#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    use recall_config::{CompactionConfig, CompactionTrigger, MemoryMode, RecallConfig};
    use recall_core::{
        DurableStats, MemoryError, Message, Result, Role, ScoredMessage, Summary,
    };
    use recall_memory::{
        CacheStats, CacheStore, DurableStore, MemoryCoordinator, SessionCache, SqliteStore,
    };

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    /// Message `i` of `session`, alternating user/assistant, one second apart.
    fn msg(session: &str, i: usize) -> Message {
        let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
        Message::new(session, role, format!("message {i}"))
            .with_id(format!("{session}-m{i}"))
            .with_timestamp(base_time() + ChronoDuration::seconds(i as i64))
    }

    fn ids(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.id.clone()).collect()
    }

    fn expected_ids(session: &str, range: std::ops::RangeInclusive<usize>) -> Vec<String> {
        range.map(|i| format!("{session}-m{i}")).collect()
    }

    fn config(cap: usize) -> RecallConfig {
        let mut config = RecallConfig::default();
        config.memory.max_session_messages = cap;
        config.memory.operation_timeout_ms = 1_000;
        config.background.shutdown_grace_ms = 200;
        config
    }

    // ── Fault injection ────────────────────────────────────────

    /// Durable tier wrapper with switches for failing writes, reads, ping,
    /// and for slowing writes down.
    #[derive(Default)]
    struct Switches {
        fail_writes: AtomicBool,
        fail_reads: AtomicBool,
        fail_ping: AtomicBool,
        write_delay_ms: AtomicU64,
    }

    struct FaultyDurable {
        inner: SqliteStore,
        sw: Switches,
    }

    impl FaultyDurable {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                sw: Switches::default(),
            })
        }

        async fn write_gate(&self) -> Result<()> {
            let delay = self.sw.write_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if self.sw.fail_writes.load(Ordering::SeqCst) {
                return Err(MemoryError::Storage("injected write failure".into()));
            }
            Ok(())
        }

        fn read_gate(&self) -> Result<()> {
            if self.sw.fail_reads.load(Ordering::SeqCst) {
                return Err(MemoryError::Storage("injected read failure".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DurableStore for FaultyDurable {
        async fn upsert(&self, message: &Message) -> Result<()> {
            self.write_gate().await?;
            self.inner.upsert(message).await
        }
        async fn query_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
            self.read_gate()?;
            self.inner.query_recent(session_id, limit).await
        }
        async fn query_prefix(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
            self.read_gate()?;
            self.inner.query_prefix(session_id, limit).await
        }
        async fn delete_session(&self, session_id: &str) -> Result<()> {
            self.write_gate().await?;
            self.inner.delete_session(session_id).await
        }
        async fn vector_search(
            &self,
            vector: &[f32],
            limit: usize,
            threshold: f32,
        ) -> Result<Vec<ScoredMessage>> {
            self.read_gate()?;
            self.inner.vector_search(vector, limit, threshold).await
        }
        async fn put_summary(&self, summary: &Summary) -> Result<()> {
            self.write_gate().await?;
            self.inner.put_summary(summary).await
        }
        async fn get_summary(&self, session_id: &str) -> Result<Option<Summary>> {
            self.read_gate()?;
            self.inner.get_summary(session_id).await
        }
        async fn aggregate_stats(&self, session_id: &str) -> Result<DurableStats> {
            self.read_gate()?;
            self.inner.aggregate_stats(session_id).await
        }
        async fn ping(&self) -> Result<()> {
            if self.sw.fail_ping.load(Ordering::SeqCst) {
                return Err(MemoryError::Storage("injected ping failure".into()));
            }
            self.inner.ping().await
        }
        fn name(&self) -> &str {
            "faulty-sqlite"
        }
    }

    /// Cache tier wrapper that can be switched fully unavailable.
    struct FaultyCache {
        inner: SessionCache,
        down: AtomicBool,
    }

    impl FaultyCache {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: SessionCache::new(),
                down: AtomicBool::new(false),
            })
        }

        fn gate(&self) -> Result<()> {
            if self.down.load(Ordering::SeqCst) {
                return Err(MemoryError::Cache("injected: cache unreachable".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheStore for FaultyCache {
        async fn push_recent(
            &self,
            session_id: &str,
            message: Message,
            max_len: usize,
            ttl: Duration,
        ) -> Result<usize> {
            self.gate()?;
            self.inner.push_recent(session_id, message, max_len, ttl).await
        }
        async fn read_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
            self.gate()?;
            self.inner.read_recent(session_id, limit).await
        }
        async fn delete_session(&self, session_id: &str) -> Result<()> {
            self.gate()?;
            self.inner.delete_session(session_id).await
        }
        async fn session_len(&self, session_id: &str) -> Result<usize> {
            self.gate()?;
            self.inner.session_len(session_id).await
        }
        async fn stats(&self) -> Result<CacheStats> {
            self.gate()?;
            self.inner.stats().await
        }
        fn name(&self) -> &str {
            "faulty-cache"
        }
    }

    // ── Cache tier ─────────────────────────────────────────────

    mod cache {
        use super::*;

        const TTL: Duration = Duration::from_secs(60);

        #[test]
        fn test_eviction_keeps_last_cap_messages() {
            let cache = SessionCache::new();
            for i in 1..=8 {
                cache.push("s", msg("s", i), 5, TTL);
            }
            let held = cache.read("s", 100);
            assert_eq!(ids(&held), expected_ids("s", 4..=8));
            assert_eq!(cache.len("s"), 5);
        }

        #[test]
        fn test_read_returns_newest_oldest_first() {
            let cache = SessionCache::new();
            for i in 1..=5 {
                cache.push("s", msg("s", i), 10, TTL);
            }
            assert_eq!(ids(&cache.read("s", 2)), expected_ids("s", 4..=5));
            assert!(cache.read("missing", 5).is_empty());
        }

        #[test]
        fn test_repush_same_id_replaces_in_slot() {
            let cache = SessionCache::new();
            for i in 1..=3 {
                cache.push("s", msg("s", i), 10, TTL);
            }
            let edited = Message::new("s", Role::User, "edited").with_id("s-m2");
            let len = cache.push("s", edited, 10, TTL);
            assert_eq!(len, 3);
            let held = cache.read("s", 10);
            assert_eq!(ids(&held), expected_ids("s", 1..=3));
            assert_eq!(held[1].content, "edited");
        }

        #[test]
        fn test_expired_session_reads_as_miss() {
            let cache = SessionCache::new();
            cache.push("s", msg("s", 1), 10, Duration::from_millis(30));
            std::thread::sleep(Duration::from_millis(60));
            assert!(cache.read("s", 10).is_empty());
            assert_eq!(cache.len("s"), 0);
        }

        #[test]
        fn test_ttl_slides_on_write() {
            let cache = SessionCache::new();
            let ttl = Duration::from_millis(300);
            cache.push("s", msg("s", 1), 10, ttl);
            std::thread::sleep(Duration::from_millis(200));
            cache.push("s", msg("s", 2), 10, ttl);
            std::thread::sleep(Duration::from_millis(200));
            assert_eq!(cache.len("s"), 2);
        }

        #[test]
        fn test_push_after_expiry_starts_fresh() {
            let cache = SessionCache::new();
            cache.push("s", msg("s", 1), 10, Duration::from_millis(20));
            std::thread::sleep(Duration::from_millis(40));
            assert_eq!(cache.push("s", msg("s", 2), 10, TTL), 1);
        }

        #[test]
        fn test_populate_fills_empty_but_never_clobbers() {
            let cache = SessionCache::new();
            let history: Vec<Message> = (1..=8).map(|i| msg("s", i)).collect();
            assert!(cache.populate("s", history.clone(), 5, TTL));
            assert_eq!(ids(&cache.read("s", 10)), expected_ids("s", 4..=8));

            assert!(!cache.populate("s", history[..2].to_vec(), 5, TTL));
            assert_eq!(cache.len("s"), 5);
        }

        #[test]
        fn test_purge_expired_and_stats() {
            let cache = SessionCache::with_shards(4);
            cache.push("short", msg("short", 1), 10, Duration::from_millis(10));
            cache.push("long", msg("long", 1), 10, TTL);
            cache.push("long", msg("long", 2), 10, TTL);
            std::thread::sleep(Duration::from_millis(30));

            assert_eq!(
                cache.snapshot_stats(),
                CacheStats {
                    sessions: 1,
                    messages: 2
                }
            );
            assert_eq!(cache.purge_expired(), 1);
            assert_eq!(cache.purge_expired(), 0);
        }

        #[test]
        fn test_concurrent_writers_same_session() {
            let cache = SessionCache::new();
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let cache = cache.clone();
                    std::thread::spawn(move || {
                        for i in 0..25 {
                            let m = Message::new("s", Role::User, "x").with_id(format!("t{t}-{i}"));
                            cache.push("s", m, 1_000, TTL);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(cache.len("s"), 100);
        }

        #[tokio::test]
        async fn test_trait_populate_default_respects_live_buffer() {
            let cache = FaultyCache::new();
            cache.push_recent("s", msg("s", 1), 5, TTL).await.unwrap();
            let filled = cache
                .populate("s", vec![msg("s", 7), msg("s", 8)], 5, TTL)
                .await
                .unwrap();
            assert!(!filled);
            assert_eq!(cache.session_len("s").await.unwrap(), 1);
        }
    }

    // ── Durable tier ───────────────────────────────────────────

    mod durable {
        use super::*;

        #[tokio::test]
        async fn test_upsert_is_idempotent_on_id() {
            let store = SqliteStore::open_in_memory().unwrap();
            let first = msg("s", 1);
            store.upsert(&first).await.unwrap();

            let mut edited = first.clone();
            edited.content = "edited".into();
            edited.timestamp = base_time() + ChronoDuration::hours(5);
            store.upsert(&edited).await.unwrap();

            let all = store.query_recent("s", 10).await.unwrap();
            assert_eq!(all.len(), 1);
            assert_eq!(all[0].content, "edited");
            // Original timestamp is kept
            assert_eq!(all[0].timestamp, first.timestamp);
        }

        #[tokio::test]
        async fn test_query_recent_and_prefix_are_chronological() {
            let store = SqliteStore::open_in_memory().unwrap();
            // Insert out of order
            for i in [3, 1, 5, 2, 4] {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let recent = store.query_recent("s", 3).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("s", 3..=5));
            let prefix = store.query_prefix("s", 2).await.unwrap();
            assert_eq!(ids(&prefix), expected_ids("s", 1..=2));
        }

        #[tokio::test]
        async fn test_equal_timestamps_keep_insertion_order() {
            let store = SqliteStore::open_in_memory().unwrap();
            for i in 1..=3 {
                let m = msg("s", i).with_timestamp(base_time());
                store.upsert(&m).await.unwrap();
            }
            let all = store.query_recent("s", 10).await.unwrap();
            assert_eq!(ids(&all), expected_ids("s", 1..=3));
        }

        #[tokio::test]
        async fn test_embedding_and_metadata_roundtrip() {
            let store = SqliteStore::open_in_memory().unwrap();
            let mut m = msg("s", 1)
                .with_user("alice")
                .with_embedding(vec![0.25, -1.5, 3.0]);
            m.metadata.insert("model".into(), serde_json::json!("gpt-4o"));
            store.upsert(&m).await.unwrap();

            let got = store.query_recent("s", 1).await.unwrap().remove(0);
            assert_eq!(got.embedding, Some(vec![0.25, -1.5, 3.0]));
            assert_eq!(got.user_id.as_deref(), Some("alice"));
            assert_eq!(got.metadata["model"], "gpt-4o");
            assert_eq!(got.role, m.role);
        }

        #[tokio::test]
        async fn test_delete_session_is_scoped() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.upsert(&msg("a", 1)).await.unwrap();
            store.upsert(&msg("b", 1)).await.unwrap();
            store
                .put_summary(&summary_for("a", 1, "old"))
                .await
                .unwrap();

            store.delete_session("a").await.unwrap();
            assert!(store.query_recent("a", 10).await.unwrap().is_empty());
            assert!(store.get_summary("a").await.unwrap().is_none());
            assert_eq!(store.query_recent("b", 10).await.unwrap().len(), 1);
        }

        fn summary_for(session: &str, count: usize, content: &str) -> Summary {
            Summary {
                session_id: session.into(),
                content: content.into(),
                token_count: 3,
                message_count: count,
                source_tokens: 10 * count,
                covered_range: recall_core::CoveredRange {
                    start: base_time(),
                    end: base_time() + ChronoDuration::seconds(count as i64),
                },
                created_at: Utc::now(),
            }
        }

        #[tokio::test]
        async fn test_latest_summary_is_authoritative() {
            let store = SqliteStore::open_in_memory().unwrap();
            assert!(store.get_summary("s").await.unwrap().is_none());
            store.put_summary(&summary_for("s", 10, "first")).await.unwrap();
            store.put_summary(&summary_for("s", 20, "second")).await.unwrap();

            let current = store.get_summary("s").await.unwrap().unwrap();
            assert_eq!(current.content, "second");
            assert_eq!(current.message_count, 20);
            assert_eq!(current.source_tokens, 200);
        }

        #[tokio::test]
        async fn test_aggregate_stats_per_session_and_global() {
            let store = SqliteStore::open_in_memory().unwrap();
            store.upsert(&msg("a", 1).with_user("u1")).await.unwrap();
            store.upsert(&msg("a", 2).with_user("u2")).await.unwrap();
            store.upsert(&msg("a", 3).with_user("u1")).await.unwrap();
            store.upsert(&msg("b", 1)).await.unwrap();

            let a = store.aggregate_stats("a").await.unwrap();
            assert_eq!(a.message_count, 3);
            assert_eq!(a.unique_users, 2);
            assert_eq!(a.oldest_message, Some(msg("a", 1).timestamp));
            assert_eq!(a.latest_message, Some(msg("a", 3).timestamp));
            assert!(a.total_tokens > 0);
            assert!(a.storage_size > 0);

            let all = store.aggregate_stats("").await.unwrap();
            assert_eq!(all.message_count, 4);

            let empty = store.aggregate_stats("nobody").await.unwrap();
            assert_eq!(empty, DurableStats::default());
        }

        #[tokio::test]
        async fn test_file_store_survives_reopen() {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("recall.db");
            {
                let store = SqliteStore::open(&path).unwrap();
                store.upsert(&msg("s", 1)).await.unwrap();
            }
            let store = SqliteStore::open(&path).unwrap();
            assert_eq!(store.query_recent("s", 5).await.unwrap().len(), 1);
            store.ping().await.unwrap();
        }

        #[tokio::test]
        async fn test_vector_search_skips_unembedded() {
            let store = SqliteStore::open_in_memory().unwrap();
            store
                .upsert(&msg("s", 1).with_embedding(vec![1.0, 0.0]))
                .await
                .unwrap();
            store.upsert(&msg("s", 2)).await.unwrap();
            let hits = store.vector_search(&[1.0, 0.0], 10, -1.0).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].message.id, "s-m1");
            assert!((hits[0].score - 1.0).abs() < 1e-6);
        }
    }

    // ── Similarity ranking ─────────────────────────────────────

    mod search {
        use super::*;
        use recall_llm::MockEmbedding;
        use recall_memory::{cosine_similarity, rank};

        #[test]
        fn test_cosine_similarity_basics() {
            assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
            assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
            assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
            assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
            assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        }

        #[test]
        fn test_rank_filters_sorts_and_truncates() {
            let candidates = vec![
                msg("s", 1).with_embedding(vec![1.0, 0.0]),
                msg("s", 2).with_embedding(vec![0.6, 0.8]),
                msg("s", 3).with_embedding(vec![0.0, 1.0]),
                msg("s", 4).with_embedding(vec![0.8, 0.6]),
            ];
            let ranked = rank(&[1.0, 0.0], candidates, 2, 0.5);
            let got: Vec<&str> = ranked.iter().map(|r| r.message.id.as_str()).collect();
            assert_eq!(got, vec!["s-m1", "s-m4"]);
            assert!((ranked[0].distance - 0.0).abs() < 1e-6);
        }

        #[test]
        fn test_rank_ties_prefer_most_recent() {
            let candidates = vec![
                msg("s", 1).with_embedding(vec![1.0, 0.0]),
                msg("s", 3).with_embedding(vec![1.0, 0.0]),
                msg("s", 2).with_embedding(vec![1.0, 0.0]),
            ];
            let ranked = rank(&[1.0, 0.0], candidates, 10, 0.0);
            let got: Vec<&str> = ranked.iter().map(|r| r.message.id.as_str()).collect();
            assert_eq!(got, vec!["s-m3", "s-m2", "s-m1"]);
        }

        #[test]
        fn test_rank_excludes_wrong_dimension() {
            let candidates = vec![
                msg("s", 1).with_embedding(vec![1.0, 0.0, 0.0]),
                msg("s", 2),
            ];
            assert!(rank(&[1.0, 0.0], candidates, 10, -1.0).is_empty());
        }

        #[test]
        fn test_raising_threshold_only_shrinks_results() {
            let gateway = MockEmbedding::new(64);
            let texts = [
                "rust ownership and borrowing",
                "the borrow checker rejects this code",
                "rust async runtimes",
                "sourdough starter feeding schedule",
                "ownership rules in rust",
                "borrowing a ladder from the neighbour",
            ];
            let candidates: Vec<Message> = texts
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    Message::new("s", Role::User, *t)
                        .with_id(format!("c{i}"))
                        .with_timestamp(base_time() + ChronoDuration::seconds(i as i64))
                        .with_embedding(gateway.vector_for(t))
                })
                .collect();
            let query = gateway.vector_for("rust borrowing rules");

            for limit in [1, 3, 10] {
                let mut previous: Option<Vec<String>> = None;
                for threshold in [-1.0, 0.0, 0.1, 0.3, 0.5, 0.9] {
                    let got: Vec<String> = rank(&query, candidates.clone(), limit, threshold)
                        .into_iter()
                        .map(|r| r.message.id)
                        .collect();
                    if let Some(prev) = &previous {
                        assert!(got.iter().all(|id| prev.contains(id)));
                    }
                    previous = Some(got);
                }
            }
        }
    }

    // ── Compactor ──────────────────────────────────────────────

    mod compactor {
        use super::*;
        use recall_llm::MockSummarizer;
        use recall_memory::{CompactionOutcome, Compactor};

        fn compaction(trigger: CompactionTrigger, threshold: usize) -> CompactionConfig {
            CompactionConfig {
                trigger,
                summarize_threshold: threshold,
                ..CompactionConfig::default()
            }
        }

        fn stats(messages: usize, tokens: usize) -> DurableStats {
            DurableStats {
                message_count: messages,
                total_tokens: tokens,
                ..DurableStats::default()
            }
        }

        fn covering(messages: usize, tokens: usize) -> Summary {
            Summary {
                session_id: "s".into(),
                content: "summary".into(),
                token_count: 2,
                message_count: messages,
                source_tokens: tokens,
                covered_range: recall_core::CoveredRange {
                    start: base_time(),
                    end: base_time(),
                },
                created_at: Utc::now(),
            }
        }

        fn compactor_with(
            store: Arc<SqliteStore>,
            summarizer: MockSummarizer,
            config: CompactionConfig,
        ) -> Compactor {
            Compactor::new(store, Arc::new(summarizer), config, Duration::from_secs(1))
        }

        #[test]
        fn test_message_trigger_counts_uncovered() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let c = compactor_with(
                store,
                MockSummarizer::new(),
                compaction(CompactionTrigger::Messages, 10),
            );
            assert!(!c.needs_compaction(&stats(9, 0), None));
            assert!(c.needs_compaction(&stats(10, 0), None));
            assert!(!c.needs_compaction(&stats(12, 0), Some(&covering(10, 0))));
            assert!(c.needs_compaction(&stats(20, 0), Some(&covering(10, 0))));
        }

        #[test]
        fn test_token_trigger_counts_uncovered_tokens() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let c = compactor_with(
                store,
                MockSummarizer::new(),
                compaction(CompactionTrigger::Tokens, 100),
            );
            assert!(!c.needs_compaction(&stats(50, 99), None));
            assert!(c.needs_compaction(&stats(50, 100), None));
            assert!(!c.needs_compaction(&stats(60, 150), Some(&covering(50, 100))));
        }

        #[test]
        fn test_disabled_never_triggers() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let mut config = compaction(CompactionTrigger::Messages, 1);
            config.enabled = false;
            let c = compactor_with(store, MockSummarizer::new(), config);
            assert!(!c.needs_compaction(&stats(1_000, 0), None));
        }

        #[tokio::test]
        async fn test_compact_covers_prefix() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            for i in 1..=12 {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let summarizer = MockSummarizer::new().with_response("they talked");
            let c = compactor_with(
                Arc::clone(&store),
                summarizer.clone(),
                compaction(CompactionTrigger::Messages, 10),
            );

            let outcome = c.compact("s", 10).await.unwrap();
            let CompactionOutcome::Compacted(summary) = outcome else {
                panic!("expected a summary");
            };
            assert_eq!(summary.message_count, 10);
            assert_eq!(summary.content, "they talked");
            assert_eq!(summary.covered_range.start, msg("s", 1).timestamp);
            assert_eq!(summary.covered_range.end, msg("s", 10).timestamp);
            assert_eq!(*summarizer.requests.lock(), vec![10]);
            assert_eq!(store.get_summary("s").await.unwrap(), Some(summary));
        }

        #[tokio::test]
        async fn test_failed_compaction_keeps_messages() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            for i in 1..=5 {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let summarizer = MockSummarizer::new();
            summarizer.set_failing(true);
            let c = compactor_with(
                Arc::clone(&store),
                summarizer,
                compaction(CompactionTrigger::Messages, 5),
            );

            let err = c.compact("s", 5).await.unwrap_err();
            assert!(matches!(err, MemoryError::Summarizer(_)));
            assert!(store.get_summary("s").await.unwrap().is_none());
            assert_eq!(store.query_recent("s", 10).await.unwrap().len(), 5);
            assert!(!c.is_in_flight("s"));
        }

        #[tokio::test]
        async fn test_compaction_is_single_flight() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            for i in 1..=5 {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let summarizer = MockSummarizer::new().with_delay(Duration::from_millis(200));
            let c = compactor_with(
                store,
                summarizer.clone(),
                compaction(CompactionTrigger::Messages, 5),
            );

            let (a, b) = tokio::join!(c.compact("s", 5), c.compact("s", 5));
            let outcomes = [a.unwrap(), b.unwrap()];
            let in_flight = outcomes
                .iter()
                .filter(|o| matches!(o, CompactionOutcome::InFlight))
                .count();
            assert_eq!(in_flight, 1);
            assert_eq!(summarizer.calls(), 1);
        }

        #[tokio::test]
        async fn test_empty_session() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let c = compactor_with(
                store,
                MockSummarizer::new(),
                compaction(CompactionTrigger::Messages, 5),
            );
            assert_eq!(c.compact("s", 5).await.unwrap(), CompactionOutcome::Empty);
        }

        #[tokio::test]
        async fn test_held_slot_defers_compaction() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            for i in 1..=5 {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let summarizer = MockSummarizer::new();
            let c = compactor_with(
                store,
                summarizer.clone(),
                compaction(CompactionTrigger::Messages, 5),
            );

            let slot = c.try_claim("s").unwrap();
            assert_eq!(slot.session_id(), "s");
            assert!(c.is_in_flight("s"));
            assert!(c.try_claim("s").is_none());
            assert_eq!(c.compact("s", 5).await.unwrap(), CompactionOutcome::InFlight);
            assert_eq!(summarizer.calls(), 0);

            drop(slot);
            assert!(!c.is_in_flight("s"));
            assert!(matches!(
                c.compact("s", 5).await.unwrap(),
                CompactionOutcome::Compacted(_)
            ));
        }

        #[tokio::test]
        async fn test_claim_exclusive_cancels_running_compaction() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            for i in 1..=5 {
                store.upsert(&msg("s", i)).await.unwrap();
            }
            let summarizer = MockSummarizer::new().with_delay(Duration::from_secs(5));
            let c = compactor_with(
                Arc::clone(&store),
                summarizer,
                compaction(CompactionTrigger::Messages, 5),
            );

            let running = {
                let c = c.clone();
                tokio::spawn(async move { c.compact("s", 5).await })
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(c.is_in_flight("s"));

            let started = std::time::Instant::now();
            let slot = c.claim_exclusive("s").await;
            assert!(started.elapsed() < Duration::from_secs(1));
            assert_eq!(running.await.unwrap().unwrap(), CompactionOutcome::Cancelled);
            assert!(store.get_summary("s").await.unwrap().is_none());

            // Held by the claimer until dropped
            assert_eq!(c.compact("s", 5).await.unwrap(), CompactionOutcome::InFlight);
            drop(slot);
            assert!(!c.is_in_flight("s"));
        }

        #[tokio::test]
        async fn test_claim_exclusive_on_idle_session() {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let c = compactor_with(
                store,
                MockSummarizer::new(),
                compaction(CompactionTrigger::Messages, 5),
            );
            let slot = c.claim_exclusive("s").await;
            assert!(c.is_in_flight("s"));
            drop(slot);
            assert!(c.try_claim("s").is_some());
        }
    }

    // ── Background tasks ───────────────────────────────────────

    mod background {
        use super::*;
        use recall_memory::BackgroundTasks;
        use std::sync::atomic::AtomicUsize;

        #[tokio::test]
        async fn test_spawn_and_drain() {
            let tasks = BackgroundTasks::new(4);
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..3 {
                let done = Arc::clone(&done);
                assert!(tasks.spawn("test", async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                }));
            }
            tasks.drain().await;
            assert_eq!(done.load(Ordering::SeqCst), 3);
            assert_eq!(tasks.in_flight(), 0);
            // Still accepting work after a drain
            assert!(tasks.spawn("after", async {}));
            tasks.drain().await;
        }

        #[tokio::test]
        async fn test_budget_exhausted_skips() {
            let tasks = BackgroundTasks::new(1);
            assert!(tasks.spawn("long", tokio::time::sleep(Duration::from_millis(100))));
            assert!(!tasks.spawn("second", async {}));
            tasks.drain().await;
            assert!(tasks.spawn("third", async {}));
            tasks.drain().await;
        }

        #[tokio::test]
        async fn test_zero_budget_never_runs() {
            let tasks = BackgroundTasks::new(0);
            assert!(!tasks.spawn("never", async {}));
        }

        #[tokio::test]
        async fn test_oversized_budget_is_clamped() {
            let tasks = BackgroundTasks::new(usize::MAX);
            let done = Arc::new(AtomicUsize::new(0));
            for _ in 0..8 {
                let done = Arc::clone(&done);
                assert!(tasks.spawn("many", async move {
                    done.fetch_add(1, Ordering::SeqCst);
                }));
            }
            tasks.drain().await;
            assert_eq!(done.load(Ordering::SeqCst), 8);
        }

        #[tokio::test]
        async fn test_shutdown_drains_within_grace() {
            let tasks = BackgroundTasks::new(4);
            tasks.spawn("quick", tokio::time::sleep(Duration::from_millis(10)));
            assert!(tasks.shutdown(Duration::from_secs(1)).await);
            assert!(!tasks.spawn("late", async {}));
        }

        #[tokio::test]
        async fn test_shutdown_cancels_stragglers() {
            let tasks = BackgroundTasks::new(4);
            let finished = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&finished);
            tasks.spawn("slow", async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flag.store(true, Ordering::SeqCst);
            });
            assert!(!tasks.shutdown(Duration::from_millis(20)).await);
            assert!(!finished.load(Ordering::SeqCst));
            assert_eq!(tasks.in_flight(), 0);
        }
    }

    // ── Coordinator ────────────────────────────────────────────

    mod coordinator {
        use super::*;
        use recall_llm::{MockEmbedding, MockSummarizer};

        async fn tiered(
            cap: usize,
        ) -> (MemoryCoordinator, Arc<FaultyCache>, Arc<FaultyDurable>) {
            let cache = FaultyCache::new();
            let durable = FaultyDurable::new();
            let memory = MemoryCoordinator::builder(config(cap))
                .with_cache(cache.clone())
                .with_durable(durable.clone())
                .build()
                .await
                .unwrap();
            (memory, cache, durable)
        }

        async fn add_range(memory: &MemoryCoordinator, session: &str, range: std::ops::RangeInclusive<usize>) {
            for i in range {
                memory.add_message(msg(session, i)).await.unwrap();
            }
        }

        #[tokio::test]
        async fn test_end_to_end_recent_and_clear() {
            let (memory, _, _) = tiered(50).await;
            assert_eq!(memory.mode(), MemoryMode::Tiered);
            add_range(&memory, "S", 1..=5).await;

            let recent = memory.get_recent("S", 3).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("S", 3..=5));

            memory.clear_session("S").await.unwrap();
            memory.background().drain().await;
            assert!(memory.get_recent("S", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_recent_len_is_min_of_limit_and_total() {
            let (memory, _, _) = tiered(5).await;
            add_range(&memory, "s", 1..=8).await;

            for limit in 0..=12 {
                let got = memory.get_recent("s", limit).await.unwrap();
                assert_eq!(got.len(), limit.min(8), "limit {limit}");
                let first = 8 - limit.min(8) + 1;
                if limit > 0 {
                    assert_eq!(ids(&got), expected_ids("s", first..=8));
                }
            }
        }

        #[tokio::test]
        async fn test_upsert_idempotence_through_coordinator() {
            let (memory, _, _) = tiered(10).await;
            memory.add_message(msg("s", 1)).await.unwrap();
            let mut edited = msg("s", 1);
            edited.content = "second version".into();
            memory.add_message(edited).await.unwrap();

            let recent = memory.get_recent("s", 10).await.unwrap();
            assert_eq!(recent.len(), 1);
            assert_eq!(recent[0].content, "second version");
            assert_eq!(memory.get_stats("s").await.unwrap().total_messages, 1);
        }

        #[tokio::test]
        async fn test_invalid_messages_rejected() {
            let (memory, _, _) = tiered(10).await;
            let err = memory
                .add_message(Message::new("", Role::User, "hi"))
                .await
                .unwrap_err();
            assert!(matches!(err, MemoryError::InvalidMessage(_)));
            assert!(memory.get_recent(" ", 5).await.is_err());
        }

        #[tokio::test]
        async fn test_cache_down_reads_fall_back_to_durable() {
            let (memory, cache, _) = tiered(5).await;
            cache.down.store(true, Ordering::SeqCst);

            // Writes still succeed on the durable tier
            add_range(&memory, "s", 1..=6).await;
            let recent = memory.get_recent("s", 4).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("s", 3..=6));

            let stats = memory.get_stats("s").await.unwrap();
            assert_eq!(stats.session_messages, 6);
            memory.background().drain().await;
        }

        #[tokio::test]
        async fn test_cache_miss_repopulates_in_background() {
            let (memory, _, durable) = tiered(5).await;
            add_range(&memory, "s", 1..=4).await;
            memory.clear_cache("s").await.unwrap();
            assert_eq!(memory.cache_stats().await.unwrap().messages, 0);

            let recent = memory.get_recent("s", 2).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("s", 3..=4));
            memory.background().drain().await;
            assert_eq!(memory.cache_stats().await.unwrap().messages, 4);

            // Served from cache now, even with durable reads failing
            durable.sw.fail_reads.store(true, Ordering::SeqCst);
            let recent = memory.get_recent("s", 10).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("s", 1..=4));
        }

        #[tokio::test]
        async fn test_expired_cache_is_rebuilt_not_served_partially() {
            let mut cfg = config(5);
            cfg.memory.session_ttl_secs = 1;
            let cache = FaultyCache::new();
            let memory = MemoryCoordinator::builder(cfg)
                .with_cache(cache.clone())
                .with_durable(FaultyDurable::new())
                .build()
                .await
                .unwrap();

            add_range(&memory, "s", 1..=3).await;
            tokio::time::sleep(Duration::from_millis(1_100)).await;
            // Lands in an empty (expired) buffer; the coordinator notices
            // the cache holds 1 of 4 and drops it.
            memory.add_message(msg("s", 4)).await.unwrap();

            let recent = memory.get_recent("s", 10).await.unwrap();
            assert_eq!(ids(&recent), expected_ids("s", 1..=4));
            memory.background().drain().await;
        }

        #[tokio::test]
        async fn test_durable_write_failure_is_surfaced() {
            let (memory, cache, durable) = tiered(5).await;
            durable.sw.fail_writes.store(true, Ordering::SeqCst);

            let err = memory.add_message(msg("s", 1)).await.unwrap_err();
            assert!(matches!(err, MemoryError::AuthoritativeWrite(_)));
            // Nothing reached the cache either
            assert_eq!(cache.inner.len("s"), 0);
        }

        #[tokio::test]
        async fn test_durable_timeout_is_surfaced() {
            let mut cfg = config(5);
            cfg.memory.operation_timeout_ms = 50;
            let durable = FaultyDurable::new();
            let memory = MemoryCoordinator::builder(cfg)
                .with_cache(FaultyCache::new())
                .with_durable(durable.clone())
                .build()
                .await
                .unwrap();

            durable.sw.write_delay_ms.store(300, Ordering::SeqCst);
            let err = memory.add_message(msg("s", 1)).await.unwrap_err();
            assert!(matches!(err, MemoryError::AuthoritativeWrite(_)));
            assert!(err.to_string().contains("timed out"));
        }

        #[tokio::test]
        async fn test_clear_session_durable_failure_is_partial() {
            let (memory, cache, durable) = tiered(5).await;
            add_range(&memory, "s", 1..=3).await;

            durable.sw.fail_writes.store(true, Ordering::SeqCst);
            assert!(memory.clear_session("s").await.is_err());
            assert_eq!(cache.inner.len("s"), 0);

            // Durable still has it; a read rebuilds from there
            durable.sw.fail_writes.store(false, Ordering::SeqCst);
            assert_eq!(memory.get_recent("s", 10).await.unwrap().len(), 3);
            // Let the refill land before clearing again
            memory.background().drain().await;
            memory.clear_session("s").await.unwrap();
            memory.background().drain().await;
            assert!(memory.get_recent("s", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_compaction_triggers_at_threshold() {
            let mut cfg = config(50);
            cfg.compaction.summarize_threshold = 10;
            let summarizer = MockSummarizer::new();
            let memory = MemoryCoordinator::builder(cfg)
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer.clone()))
                .build()
                .await
                .unwrap();

            add_range(&memory, "s", 1..=9).await;
            memory.background().drain().await;
            assert!(!memory.get_stats("s").await.unwrap().has_summary);

            memory.add_message(msg("s", 10)).await.unwrap();
            memory.background().drain().await;
            let stats = memory.get_stats("s").await.unwrap();
            assert!(stats.has_summary);
            assert_eq!(memory.get_summary("s").await.unwrap().unwrap().message_count, 10);

            add_range(&memory, "s", 11..=12).await;
            memory.background().drain().await;
            assert_eq!(memory.get_summary("s").await.unwrap().unwrap().message_count, 10);
            assert_eq!(summarizer.calls(), 1);
        }

        #[tokio::test]
        async fn test_failed_compaction_retries_on_next_write() {
            let mut cfg = config(50);
            cfg.compaction.summarize_threshold = 3;
            let summarizer = MockSummarizer::new();
            summarizer.set_failing(true);
            let memory = MemoryCoordinator::builder(cfg)
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer.clone()))
                .build()
                .await
                .unwrap();
            assert_eq!(memory.mode(), MemoryMode::DurableOnly);

            add_range(&memory, "s", 1..=3).await;
            memory.background().drain().await;
            assert!(memory.get_summary("s").await.unwrap().is_none());
            assert_eq!(memory.get_recent("s", 10).await.unwrap().len(), 3);

            summarizer.set_failing(false);
            memory.add_message(msg("s", 4)).await.unwrap();
            memory.background().drain().await;
            assert_eq!(memory.get_summary("s").await.unwrap().unwrap().message_count, 4);
            assert_eq!(summarizer.calls(), 2);
        }

        #[tokio::test]
        async fn test_writes_succeed_during_compaction() {
            let mut cfg = config(50);
            cfg.compaction.summarize_threshold = 2;
            let summarizer = MockSummarizer::new().with_delay(Duration::from_millis(300));
            let memory = MemoryCoordinator::builder(cfg)
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer.clone()))
                .build()
                .await
                .unwrap();

            add_range(&memory, "s", 1..=2).await;
            // Compaction of the first two is in flight; these must not wait
            add_range(&memory, "s", 3..=6).await;
            memory.background().drain().await;

            assert_eq!(memory.get_recent("s", 10).await.unwrap().len(), 6);
            assert_eq!(summarizer.calls(), 1);
            assert_eq!(memory.get_summary("s").await.unwrap().unwrap().message_count, 2);
        }

        async fn compacting(threshold: usize, summarizer: &MockSummarizer) -> MemoryCoordinator {
            let mut cfg = config(50);
            cfg.compaction.summarize_threshold = threshold;
            MemoryCoordinator::builder(cfg)
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer.clone()))
                .build()
                .await
                .unwrap()
        }

        async fn back_to_back_writes_compact_once() {
            for _ in 0..20 {
                let summarizer = MockSummarizer::new();
                let memory = compacting(10, &summarizer).await;

                // No drain between writes: the check on write 11 and 12 must
                // see the compaction scheduled by write 10.
                add_range(&memory, "s", 1..=12).await;
                memory.background().drain().await;

                let summary = memory.get_summary("s").await.unwrap().unwrap();
                assert_eq!(summary.message_count, 10);
                assert_eq!(summarizer.calls(), 1);
                memory.shutdown().await;
            }
        }

        #[tokio::test]
        async fn test_back_to_back_writes_compact_once() {
            back_to_back_writes_compact_once().await;
        }

        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn test_back_to_back_writes_compact_once_multi_thread() {
            back_to_back_writes_compact_once().await;
        }

        #[tokio::test]
        async fn test_clear_cancels_running_compaction() {
            let summarizer = MockSummarizer::new().with_delay(Duration::from_millis(500));
            let memory = compacting(2, &summarizer).await;

            add_range(&memory, "s", 1..=2).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            let started = std::time::Instant::now();
            memory.clear_session("s").await.unwrap();
            assert!(started.elapsed() < Duration::from_millis(400));
            memory.background().drain().await;

            assert!(memory.get_summary("s").await.unwrap().is_none());
            let stats = memory.get_stats("s").await.unwrap();
            assert_eq!(stats.session_messages, 0);
            assert!(!stats.has_summary);

            // The session compacts again from scratch
            add_range(&memory, "s", 3..=4).await;
            memory.background().drain().await;
            let summary = memory.get_summary("s").await.unwrap().unwrap();
            assert_eq!(summary.message_count, 2);
            assert_eq!(summary.covered_range.start, msg("s", 3).timestamp);
        }

        #[tokio::test]
        async fn test_summarize_on_demand() {
            let summarizer = MockSummarizer::new().with_response("recap");
            let memory = MemoryCoordinator::builder(config(10))
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer))
                .build()
                .await
                .unwrap();

            assert_eq!(memory.summarize("s", None).await.unwrap(), "");
            add_range(&memory, "s", 1..=4).await;
            assert_eq!(memory.summarize("s", Some(100)).await.unwrap(), "recap");
            let summary = memory.get_summary("s").await.unwrap().unwrap();
            assert_eq!(summary.message_count, 4);
        }

        #[tokio::test]
        async fn test_concurrent_summarize_reports_in_flight() {
            let summarizer = MockSummarizer::new().with_delay(Duration::from_millis(200));
            let memory = MemoryCoordinator::builder(config(10))
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer))
                .build()
                .await
                .unwrap();
            add_range(&memory, "s", 1..=4).await;

            let (a, b) = tokio::join!(memory.summarize("s", None), memory.summarize("s", None));
            let results = [a, b];
            assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
            assert!(results.iter().any(|r| matches!(
                r,
                Err(MemoryError::CompactionInProgress { .. })
            )));
        }

        #[tokio::test]
        async fn test_stats_prefer_durable_count() {
            let (memory, _, _) = tiered(3).await;
            for i in 1..=5 {
                memory
                    .add_message(msg("s", i).with_user(format!("u{}", i % 2)))
                    .await
                    .unwrap();
            }
            let stats = memory.get_stats("s").await.unwrap();
            assert_eq!(stats.cached_messages, 3);
            assert_eq!(stats.total_messages, 5);
            assert_eq!(stats.session_messages, 5);
            assert_eq!(stats.unique_users, 2);
            assert_eq!(stats.oldest_message, Some(msg("s", 1).timestamp));
            assert_eq!(stats.latest_message, Some(msg("s", 5).timestamp));
            assert!(!stats.has_summary);
            assert_eq!(stats.active_tokens, stats.total_tokens);
        }

        #[tokio::test]
        async fn test_active_tokens_use_summary() {
            let summarizer = MockSummarizer::new().with_response("short");
            let memory = MemoryCoordinator::builder(config(10))
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer))
                .build()
                .await
                .unwrap();
            add_range(&memory, "s", 1..=4).await;
            memory.summarize("s", None).await.unwrap();
            memory.add_message(msg("s", 5)).await.unwrap();

            let stats = memory.get_stats("s").await.unwrap();
            let summary = memory.get_summary("s").await.unwrap().unwrap();
            let newest = msg("s", 5).estimate_tokens();
            assert!(stats.has_summary);
            assert_eq!(stats.active_tokens, summary.token_count + newest);
        }

        #[tokio::test]
        async fn test_build_context_uses_summary_and_window() {
            let mut cfg = config(10);
            cfg.compaction.context_token_budget = 20;
            let summarizer = MockSummarizer::new().with_response("earlier stuff");
            let memory = MemoryCoordinator::builder(cfg)
                .with_durable(FaultyDurable::new())
                .with_summarizer(Arc::new(summarizer))
                .build()
                .await
                .unwrap();

            add_range(&memory, "s", 1..=4).await;
            memory.summarize("s", None).await.unwrap();
            add_range(&memory, "s", 5..=9).await;

            let window = memory.build_context("s").await.unwrap();
            let summary = window.summary.clone().unwrap();
            assert_eq!(summary.message_count, 4);
            assert!(window.token_count <= 20);
            // Newest messages kept, contiguous to the end
            assert!(!window.messages.is_empty());
            assert_eq!(window.messages.last().unwrap().id, "s-m9");
            assert_eq!(window.messages.len() + window.omitted, 5);

            let rendered = window.to_messages();
            assert_eq!(rendered[0].role, Role::System);
            assert!(rendered[0].content.contains("earlier stuff"));
            assert_eq!(rendered.len(), window.messages.len() + 1);
        }

        #[tokio::test]
        async fn test_search_with_gateway() {
            let gateway = MockEmbedding::new(4096);
            let memory = MemoryCoordinator::builder(config(10))
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_embedding(Arc::new(gateway.clone()))
                .build()
                .await
                .unwrap();

            for (i, text) in ["rust borrow checker", "sourdough bread", "rust lifetimes"]
                .iter()
                .enumerate()
            {
                let m = Message::new("s", Role::User, *text).with_id(format!("t{i}"));
                memory.add_message(m).await.unwrap();
            }

            let hits = memory.search("rust borrow checker", Some(5), Some(0.9)).await.unwrap();
            assert_eq!(hits.len(), 1);
            assert_eq!(hits[0].message.id, "t0");

            let loose = memory.search("rust borrow checker", Some(5), Some(0.1)).await.unwrap();
            assert!(loose.len() >= 2);
            assert!(loose.iter().all(|h| h.message.id != "t1"));
        }

        #[tokio::test]
        async fn test_embedding_failure_persists_without_vector() {
            let gateway = MockEmbedding::new(32);
            let memory = MemoryCoordinator::builder(config(10))
                .with_cache(FaultyCache::new())
                .with_durable(FaultyDurable::new())
                .with_embedding(Arc::new(gateway.clone()))
                .build()
                .await
                .unwrap();

            gateway.set_failing(true);
            memory
                .add_message(Message::new("s", Role::User, "alpha").with_id("a"))
                .await
                .unwrap();
            gateway.set_failing(false);
            memory
                .add_message(Message::new("s", Role::User, "alpha").with_id("b"))
                .await
                .unwrap();

            assert_eq!(memory.get_recent("s", 10).await.unwrap().len(), 2);
            let hits = memory.search("alpha", Some(10), Some(0.5)).await.unwrap();
            let got: Vec<&str> = hits.iter().map(|h| h.message.id.as_str()).collect();
            assert_eq!(got, vec!["b"]);
        }

        #[tokio::test]
        async fn test_search_unsupported_without_gateway_or_durable() {
            let (memory, _, _) = tiered(10).await;
            let err = memory.search("anything", None, None).await.unwrap_err();
            assert!(matches!(err, MemoryError::Unsupported { .. }));

            let cache_only = MemoryCoordinator::builder(config(10))
                .with_cache(FaultyCache::new())
                .build()
                .await
                .unwrap();
            let err = cache_only
                .search_with_embedding(&[1.0, 0.0], None, None)
                .await
                .unwrap_err();
            assert_eq!(
                err.to_string(),
                "semantic search is not supported in cache_only mode"
            );
            assert!(matches!(
                cache_only.summarize("s", None).await,
                Err(MemoryError::Unsupported { .. })
            ));
        }

        #[tokio::test]
        async fn test_search_with_embedding_checks_dimension() {
            let memory = MemoryCoordinator::builder(config(10))
                .with_durable(FaultyDurable::new())
                .with_embedding(Arc::new(MockEmbedding::new(8)))
                .build()
                .await
                .unwrap();
            let err = memory
                .search_with_embedding(&[1.0, 0.0], None, None)
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                MemoryError::DimensionMismatch {
                    expected: 8,
                    actual: 2
                }
            ));
        }

        #[tokio::test]
        async fn test_supplied_embedding_of_wrong_size_is_dropped() {
            let memory = MemoryCoordinator::builder(config(10))
                .with_durable(FaultyDurable::new())
                .with_embedding(Arc::new(MockEmbedding::new(4)))
                .build()
                .await
                .unwrap();
            memory
                .add_message(msg("s", 1).with_embedding(vec![1.0, 2.0]))
                .await
                .unwrap();
            let stored = memory.get_recent("s", 1).await.unwrap().remove(0);
            assert!(stored.embedding.is_none());
        }

        #[tokio::test]
        async fn test_store_skips_cache() {
            let (memory, cache, _) = tiered(10).await;
            memory.store(msg("s", 1)).await.unwrap();
            assert_eq!(cache.inner.len("s"), 0);
            assert_eq!(memory.get_recent("s", 5).await.unwrap().len(), 1);
            memory.background().drain().await;
        }

        #[tokio::test]
        async fn test_cache_only_mode() {
            let cache = FaultyCache::new();
            let memory = MemoryCoordinator::builder(config(3))
                .with_cache(cache.clone())
                .build()
                .await
                .unwrap();
            assert_eq!(memory.mode(), MemoryMode::CacheOnly);

            for i in 1..=5 {
                memory
                    .add_message(msg("s", i).with_user("u"))
                    .await
                    .unwrap();
            }
            assert_eq!(ids(&memory.get_recent("s", 10).await.unwrap()), expected_ids("s", 3..=5));
            assert!(memory.get_summary("s").await.unwrap().is_none());

            let stats = memory.get_stats("s").await.unwrap();
            assert_eq!(stats.session_messages, 3);
            assert_eq!(stats.unique_users, 1);
            assert_eq!(stats.total_messages, 0);

            // The cache is the only tier here, so its failures surface
            cache.down.store(true, Ordering::SeqCst);
            assert!(memory.add_message(msg("s", 6)).await.is_err());
            assert!(memory.get_recent("s", 1).await.is_err());
        }

        #[tokio::test]
        async fn test_explicit_tiered_without_cache_is_config_error() {
            let mut cfg = config(10);
            cfg.memory.mode = Some(MemoryMode::Tiered);
            let err = MemoryCoordinator::builder(cfg)
                .with_durable(FaultyDurable::new())
                .build()
                .await
                .err()
                .unwrap();
            assert!(matches!(err, MemoryError::Config(_)));
            assert!(err.is_fatal_at_construction());
        }

        #[tokio::test]
        async fn test_no_backends_is_config_error() {
            let err = MemoryCoordinator::builder(config(10)).build().await.err().unwrap();
            assert!(matches!(err, MemoryError::Config(_)));
        }

        #[tokio::test]
        async fn test_unreachable_durable_is_connection_error() {
            let durable = FaultyDurable::new();
            durable.sw.fail_ping.store(true, Ordering::SeqCst);
            let err = MemoryCoordinator::builder(config(10))
                .with_durable(durable)
                .build()
                .await
                .err()
                .unwrap();
            assert!(matches!(err, MemoryError::Connection { .. }));
            assert!(err.is_fatal_at_construction());
        }

        #[tokio::test]
        async fn test_shutdown_rejects_new_calls() {
            let (memory, _, _) = tiered(10).await;
            memory.add_message(msg("s", 1)).await.unwrap();
            assert!(memory.shutdown().await);
            assert!(matches!(
                memory.add_message(msg("s", 2)).await,
                Err(MemoryError::ShuttingDown)
            ));
        }
    }

    // ── Context window ─────────────────────────────────────────

    mod context {
        use super::*;
        use recall_memory::ContextWindow;

        #[test]
        fn test_assemble_without_summary_keeps_newest() {
            let messages: Vec<Message> = (1..=5)
                .map(|i| msg("s", i).with_token_count(10))
                .collect();
            let window = ContextWindow::assemble("s", None, messages, 25);
            assert_eq!(ids(&window.messages), expected_ids("s", 4..=5));
            assert_eq!(window.token_count, 20);
            assert_eq!(window.omitted, 3);
            assert_eq!(window.to_messages().len(), 2);
        }

        #[test]
        fn test_empty_window() {
            let window = ContextWindow::assemble("s", None, vec![], 100);
            assert!(window.is_empty());
            assert!(window.to_messages().is_empty());
        }
    }

    // ── Bootstrap ──────────────────────────────────────────────

    mod bootstrap {
        use super::*;

        #[tokio::test]
        async fn test_from_config_defaults_to_tiered() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = config(10);
            cfg.durable.db_path = dir.path().join("recall.db");

            let memory = recall_memory::from_config(&cfg).await.unwrap();
            assert_eq!(memory.mode(), MemoryMode::Tiered);
            memory.add_message(msg("s", 1)).await.unwrap();
            assert_eq!(memory.get_recent("s", 5).await.unwrap().len(), 1);
            assert!(dir.path().join("recall.db").exists());
        }

        #[tokio::test]
        async fn test_from_config_durable_only_when_cache_disabled() {
            let dir = tempfile::tempdir().unwrap();
            let mut cfg = config(10);
            cfg.cache.enabled = false;
            cfg.durable.db_path = dir.path().join("recall.db");

            let memory = recall_memory::from_config(&cfg).await.unwrap();
            assert_eq!(memory.mode(), MemoryMode::DurableOnly);
            assert_eq!(memory.cache_stats().await.unwrap(), CacheStats::default());
        }

        #[tokio::test]
        async fn test_from_config_cache_only() {
            let mut cfg = config(10);
            cfg.memory.mode = Some(MemoryMode::CacheOnly);
            cfg.durable.enabled = false;
            let memory = recall_memory::from_config(&cfg).await.unwrap();
            assert_eq!(memory.mode(), MemoryMode::CacheOnly);
        }
    }
}
