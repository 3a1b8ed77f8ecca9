use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use window_digest::db;
use window_digest::error::{PipelineError, ProviderError};
use window_digest::migrate;
use window_digest::models::{DigestContent, RawItem, Stage, Step, Summary, Window};
use window_digest::pipeline::{Collaborators, PipelineOrchestrator, PipelineSettings, StageOutcome};
use window_digest::retry::RetryPolicy;
use window_digest::stats;
use window_digest::store;
use window_digest::traits::{ContentSource, EmbeddingProvider, Publisher, SummarizationProvider};
use window_digest::window;

// ============ Fakes ============

struct FakeSource {
    items: Vec<RawItem>,
}

#[async_trait]
impl ContentSource for FakeSource {
    fn name(&self) -> &str {
        "fake-source"
    }

    async fn fetch(&self, _window: &Window) -> Result<Vec<RawItem>, ProviderError> {
        Ok(self.items.clone())
    }
}

#[derive(Default)]
struct FakeSummarizer {
    calls: AtomicU32,
    /// While set, summarizing this text fails transiently.
    failing_text: Mutex<Option<String>>,
}

#[async_trait]
impl SummarizationProvider for FakeSummarizer {
    fn model_name(&self) -> &str {
        "fake-summarizer"
    }

    async fn summarize(&self, text: &str) -> Result<Summary, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_text.lock().unwrap().as_deref() == Some(text) {
            return Err(ProviderError::Transient("503 service unavailable".into()));
        }
        Ok(Summary {
            summary: format!("Summary: {text}"),
            tags: vec!["news".to_string()],
            importance: 3,
        })
    }
}

struct FakeEmbedder {
    calls: AtomicU32,
    vectors: HashMap<String, Vec<f32>>,
}

impl FakeEmbedder {
    fn new(vectors: &[(&str, Vec<f32>)]) -> Self {
        Self {
            calls: AtomicU32::new(0),
            vectors: vectors.iter().map(|(t, v)| (t.to_string(), v.clone())).collect(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }

    fn dims(&self) -> usize {
        3
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vectors.get(text).cloned().unwrap_or_else(|| vec![0.0, 1.0, 0.0]))
    }
}

#[derive(Default)]
struct FakePublisher {
    published: Mutex<Vec<DigestContent>>,
    down: AtomicBool,
    /// Milliseconds each publish takes.
    delay_ms: AtomicU64,
}

impl FakePublisher {
    fn calls(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    fn name(&self) -> &str {
        "fake-publisher"
    }

    async fn publish(&self, _window: &Window, content: &DigestContent) -> Result<Vec<String>, ProviderError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("connection reset".into()));
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let mut published = self.published.lock().unwrap();
        published.push(content.clone());
        Ok(vec![format!("msg-{}", published.len())])
    }
}

/// Breaks the status table before failing, so recording the failure fails
/// as well.
struct SchemaBreakingPublisher {
    pool: SqlitePool,
}

#[async_trait]
impl Publisher for SchemaBreakingPublisher {
    fn name(&self) -> &str {
        "schema-breaking-publisher"
    }

    async fn publish(&self, _window: &Window, _content: &DigestContent) -> Result<Vec<String>, ProviderError> {
        sqlx::query("ALTER TABLE window_status RENAME TO window_status_gone")
            .execute(&self.pool)
            .await
            .map_err(|e| ProviderError::Permanent(e.to_string()))?;
        Err(ProviderError::Permanent("channel not found".into()))
    }
}

// ============ Helpers ============

fn test_window() -> Window {
    let tz = window::parse_timezone("Europe/Riga").unwrap();
    window::for_closing_date(NaiveDate::from_ymd_opt(2026, 2, 7).unwrap(), 13, 0, tz).unwrap()
}

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 7, hour, minute, 0).unwrap()
}

fn raw(id: &str, channel: &str, posted_at: DateTime<Utc>, text: &str) -> RawItem {
    RawItem {
        id: id.to_string(),
        text: text.to_string(),
        has_media: false,
        posted_at,
        permalink: Some(format!("https://t.me/{channel}/{id}")),
        channel: channel.to_string(),
    }
}

fn settings() -> PipelineSettings {
    PipelineSettings {
        timezone: window::parse_timezone("Europe/Riga").unwrap(),
        anchor_hour: 13,
        anchor_minute: 0,
        threshold: 0.88,
        top_k: 5,
        mark_exact_duplicates: true,
        retry: RetryPolicy::immediate(2),
        lock_retry: RetryPolicy::immediate(1),
        lease: Duration::minutes(5),
    }
}

async fn setup_pool() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("digest.sqlite")).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

const PORT: &str = "Port reopened after storm";
const PORT_REWORDED: &str = "Harbour reopens once the storm passed";
const ELECTION: &str = "Election results announced";

/// A, B exact duplicates; C near duplicate of A; D unrelated.
fn feed() -> Vec<RawItem> {
    vec![
        raw("a", "news", at(7, 0), PORT),
        raw("b", "wire", at(7, 5), PORT),
        raw("c", "local", at(8, 0), PORT_REWORDED),
        raw("d", "news", at(9, 0), ELECTION),
    ]
}

fn embedder() -> Arc<FakeEmbedder> {
    Arc::new(FakeEmbedder::new(&[
        (PORT, vec![1.0, 0.0, 0.0]),
        (PORT_REWORDED, vec![0.95, 0.31225, 0.0]),
        (ELECTION, vec![0.0, 0.0, 1.0]),
    ]))
}

struct Harness {
    _tmp: TempDir,
    pool: SqlitePool,
    summarizer: Arc<FakeSummarizer>,
    embedder: Arc<FakeEmbedder>,
    publisher: Arc<FakePublisher>,
    orchestrator: PipelineOrchestrator,
}

async fn harness(items: Vec<RawItem>) -> Harness {
    let (tmp, pool) = setup_pool().await;
    let summarizer = Arc::new(FakeSummarizer::default());
    let embedder = embedder();
    let publisher = Arc::new(FakePublisher::default());

    let collaborators = Collaborators {
        source: Arc::new(FakeSource { items }),
        summarizer: Some(summarizer.clone()),
        embedder: Some(embedder.clone()),
        publisher: publisher.clone(),
    };
    let orchestrator = PipelineOrchestrator::new(pool.clone(), collaborators, settings()).unwrap();

    Harness {
        _tmp: tmp,
        pool,
        summarizer,
        embedder,
        publisher,
        orchestrator,
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_full_run_then_rerun_is_noop() {
    let h = harness(feed()).await;
    let window = test_window();

    let first = h.orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    assert_eq!(first.completed, Stage::Published);
    assert!(!first.is_noop());

    // b reuses a's summary and embedding
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.publisher.calls(), 1);

    let digest = h.publisher.published.lock().unwrap()[0].clone();
    assert_eq!(digest.entries.len(), 2);
    assert_eq!(digest.entries[0].item_id, "a");
    assert_eq!(digest.entries[0].member_count, 3);
    assert_eq!(digest.entries[0].text, format!("Summary: {PORT}"));
    assert_eq!(digest.entries[1].item_id, "d");

    let second = h.orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    assert!(second.is_noop());
    assert!(matches!(
        second.outcome(Step::Publish),
        Some(StageOutcome::AlreadyPublished(_))
    ));
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.publisher.calls(), 1);
}

#[tokio::test]
async fn test_publish_twice_returns_original_receipt() {
    let h = harness(feed()).await;
    let window = test_window();
    h.orchestrator
        .run(&window, &[Step::Ingest, Step::Summarize, Step::Embed, Step::Dedup], false)
        .await
        .unwrap();

    let receipt = h.orchestrator.publish(&window, false).await.unwrap();
    assert_eq!(receipt.message_ids, vec!["msg-1".to_string()]);

    match h.orchestrator.publish(&window, false).await {
        Err(PipelineError::AlreadyPublished { receipt: again, .. }) => assert_eq!(again, receipt),
        other => panic!("expected AlreadyPublished, got {other:?}"),
    }
    assert_eq!(h.publisher.calls(), 1);

    let forced = h.orchestrator.publish(&window, true).await.unwrap();
    assert_eq!(forced.message_ids, vec!["msg-2".to_string()]);
    assert_eq!(h.publisher.calls(), 2);
}

#[tokio::test]
async fn test_failed_stage_resumes_with_remaining_items() {
    let items: Vec<RawItem> = (0..10)
        .map(|i| raw(&format!("item-{i}"), "news", at(6, i), &format!("story number {i}")))
        .collect();
    let h = harness(items).await;
    let window = test_window();
    *h.summarizer.failing_text.lock().unwrap() = Some("story number 4".to_string());

    let err = h.orchestrator.run(&window, &Step::ALL, false).await.unwrap_err();
    assert!(matches!(err, PipelineError::TransientProvider { attempts: 2, .. }));

    let status = h.orchestrator.state().status(&window.id).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.completed, Stage::Ingested);
    assert!(status.last_error.is_some());
    assert_eq!(stats::window_stats(&h.pool, &window.id).await.unwrap().summarized, 4);
    assert_eq!(h.publisher.calls(), 0);

    *h.summarizer.failing_text.lock().unwrap() = None;
    let before = h.summarizer.calls.load(Ordering::SeqCst);
    let report = h.orchestrator.run(&window, &Step::ALL, false).await.unwrap();

    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst) - before, 6);
    assert_eq!(report.completed, Stage::Published);
    assert_eq!(report.outcome(Step::Ingest), Some(&StageOutcome::Skipped));
    assert_eq!(stats::window_stats(&h.pool, &window.id).await.unwrap().summarized, 10);
}

#[tokio::test]
async fn test_forced_dedup_replaces_clusters() {
    let h = harness(feed()).await;
    let window = test_window();
    h.orchestrator.run(&window, &Step::ALL, false).await.unwrap();

    let before = store::clusters_for_window(&h.pool, &window.id).await.unwrap();
    h.orchestrator.run(&window, &[Step::Dedup], true).await.unwrap();
    let after = store::clusters_for_window(&h.pool, &window.id).await.unwrap();

    let old_ids: HashSet<String> = before.iter().map(|c| c.id.clone()).collect();
    assert!(after.iter().all(|c| !old_ids.contains(&c.id)));

    let membership = |clusters: &[window_digest::models::DedupCluster]| -> Vec<Vec<String>> {
        clusters
            .iter()
            .map(|c| c.members.iter().map(|m| m.item_id.clone()).collect())
            .collect()
    };
    assert_eq!(membership(&before), membership(&after));

    // Re-running an earlier stage keeps later progress.
    let status = h.orchestrator.state().status(&window.id).await.unwrap().unwrap();
    assert_eq!(status.completed, Stage::Published);
    assert_eq!(h.publisher.calls(), 1);
}

#[tokio::test]
async fn test_lock_contention_is_reported() {
    let h = harness(feed()).await;
    let window = test_window();
    h.orchestrator
        .state()
        .try_lock(&window.id, "another-run", Duration::minutes(5))
        .await
        .unwrap();

    match h.orchestrator.run(&window, &Step::ALL, false).await {
        Err(PipelineError::LockContention { holder, .. }) => assert_eq!(holder, "another-run"),
        other => panic!("expected lock contention, got {other:?}"),
    }
    assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stage_out_of_order_is_rejected() {
    let h = harness(feed()).await;
    let window = test_window();

    let err = h.orchestrator.run(&window, &[Step::Dedup], false).await.unwrap_err();
    assert!(matches!(err, PipelineError::StageOrder { .. }));

    let status = h.orchestrator.state().status(&window.id).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Pending);
}

#[tokio::test]
async fn test_publisher_outage_fails_window_and_retry_publishes_once() {
    let h = harness(feed()).await;
    let window = test_window();
    h.publisher.down.store(true, Ordering::SeqCst);

    assert!(h.orchestrator.run(&window, &Step::ALL, false).await.is_err());
    let status = h.orchestrator.state().status(&window.id).await.unwrap().unwrap();
    assert_eq!(status.stage, Stage::Failed);
    assert_eq!(status.completed, Stage::Deduped);
    assert!(h.orchestrator.state().publish_receipt(&window.id).await.unwrap().is_none());

    h.publisher.down.store(false, Ordering::SeqCst);
    let report = h.orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    assert_eq!(report.completed, Stage::Published);
    assert_eq!(h.publisher.calls(), 1);
}

#[tokio::test]
async fn test_bad_embedding_is_skipped() {
    let mut items = feed();
    items.push(raw("e", "news", at(10, 0), "broken vector"));

    let (_tmp, pool) = setup_pool().await;
    let embedder = Arc::new(FakeEmbedder::new(&[
        (PORT, vec![1.0, 0.0, 0.0]),
        (PORT_REWORDED, vec![0.95, 0.31225, 0.0]),
        (ELECTION, vec![0.0, 0.0, 1.0]),
        ("broken vector", vec![1.0, 0.0]),
    ]));
    let collaborators = Collaborators {
        source: Arc::new(FakeSource { items }),
        summarizer: None,
        embedder: Some(embedder),
        publisher: Arc::new(FakePublisher::default()),
    };
    let orchestrator = PipelineOrchestrator::new(pool.clone(), collaborators, settings()).unwrap();
    let window = test_window();

    let report = orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    match report.outcome(Step::Embed) {
        Some(StageOutcome::Completed(stats)) => assert_eq!(stats.skipped, 1),
        other => panic!("unexpected embed outcome {other:?}"),
    }
    match report.outcome(Step::Dedup) {
        Some(StageOutcome::Completed(stats)) => {
            assert_eq!(stats.dedup.as_ref().unwrap().skipped_no_embedding, 1)
        }
        other => panic!("unexpected dedup outcome {other:?}"),
    }
    assert_eq!(report.completed, Stage::Published);
}

#[tokio::test]
async fn test_disabled_providers_still_publish() {
    let (_tmp, pool) = setup_pool().await;
    let publisher = Arc::new(FakePublisher::default());
    let collaborators = Collaborators {
        source: Arc::new(FakeSource { items: feed() }),
        summarizer: None,
        embedder: None,
        publisher: publisher.clone(),
    };
    let orchestrator = PipelineOrchestrator::new(pool.clone(), collaborators, settings()).unwrap();
    let window = test_window();

    let report = orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    assert_eq!(report.completed, Stage::Published);
    match report.outcome(Step::Summarize) {
        Some(StageOutcome::Completed(stats)) => {
            assert!(stats.provider_disabled);
            assert_eq!(stats.duplicates_flagged, 1);
        }
        other => panic!("unexpected summarize outcome {other:?}"),
    }

    let digest = publisher.published.lock().unwrap()[0].clone();
    // b is an exact duplicate of a and only shows up through a's entry
    assert_eq!(digest.entries.len(), 1);
    assert_eq!(digest.entries[0].item_id, "a");
    assert_eq!(digest.entries[0].member_count, 2);
    let ids: Vec<&str> = digest.unclustered.iter().map(|e| e.item_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "d"]);
}

#[tokio::test]
async fn test_exact_duplicates_collapse_without_embeddings_or_flags() {
    let (_tmp, pool) = setup_pool().await;
    let publisher = Arc::new(FakePublisher::default());
    let collaborators = Collaborators {
        source: Arc::new(FakeSource { items: feed() }),
        summarizer: None,
        embedder: None,
        publisher: publisher.clone(),
    };
    let settings = PipelineSettings {
        mark_exact_duplicates: false,
        ..settings()
    };
    let orchestrator = PipelineOrchestrator::new(pool.clone(), collaborators, settings).unwrap();
    let window = test_window();

    let report = orchestrator.run(&window, &Step::ALL, false).await.unwrap();
    match report.outcome(Step::Dedup) {
        Some(StageOutcome::Completed(stats)) => {
            assert_eq!(stats.duplicates_flagged, 0);
            assert_eq!(stats.dedup.as_ref().unwrap().clusters_created, 1);
        }
        other => panic!("unexpected dedup outcome {other:?}"),
    }

    let digest = publisher.published.lock().unwrap()[0].clone();
    let port_entries = digest
        .entries
        .iter()
        .chain(digest.unclustered.iter())
        .filter(|e| e.text == PORT)
        .count();
    assert_eq!(port_entries, 1);
    assert_eq!(digest.entries[0].permalinks.len(), 2);

    // no flags were written
    let items = store::items_in_window(&pool, &window.id).await.unwrap();
    assert!(items.iter().all(|i| i.duplicate_of.is_none()));
}

#[tokio::test]
async fn test_concurrent_runs_publish_once_when_run_outlives_lease() {
    let (_tmp, pool) = setup_pool().await;
    let publisher = Arc::new(FakePublisher::default());
    publisher.delay_ms.store(300, Ordering::SeqCst);

    let orchestrator = || {
        let collaborators = Collaborators {
            source: Arc::new(FakeSource { items: feed() }),
            summarizer: Some(Arc::new(FakeSummarizer::default())),
            embedder: Some(embedder()),
            publisher: publisher.clone(),
        };
        let settings = PipelineSettings {
            lease: Duration::milliseconds(100),
            lock_retry: RetryPolicy::build(1, std::time::Duration::from_millis(50))
                .max_attempts(40)
                .provide(),
            ..settings()
        };
        PipelineOrchestrator::new(pool.clone(), collaborators, settings).unwrap()
    };
    let first = orchestrator();
    let second = orchestrator();
    let window = test_window();

    let (r1, r2) = tokio::join!(
        first.run(&window, &Step::ALL, false),
        second.run(&window, &Step::ALL, false)
    );

    assert_eq!(publisher.calls(), 1, "window published more than once");
    let published = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Ok(report) if matches!(report.outcome(Step::Publish), Some(StageOutcome::Completed(_)))))
        .count();
    assert_eq!(published, 1);
    for result in [&r1, &r2] {
        assert!(
            matches!(result, Ok(_) | Err(PipelineError::LockContention { .. })),
            "unexpected result {result:?}"
        );
    }
    let status = first.state().status(&window.id).await.unwrap().unwrap();
    assert_eq!(status.completed, Stage::Published);
}

#[tokio::test]
async fn test_stage_error_survives_failed_status_write() {
    let (_tmp, pool) = setup_pool().await;
    let collaborators = Collaborators {
        source: Arc::new(FakeSource { items: feed() }),
        summarizer: None,
        embedder: None,
        publisher: Arc::new(SchemaBreakingPublisher { pool: pool.clone() }),
    };
    let orchestrator = PipelineOrchestrator::new(pool.clone(), collaborators, settings()).unwrap();

    let err = orchestrator.run(&test_window(), &Step::ALL, false).await.unwrap_err();
    assert!(matches!(err, PipelineError::PermanentProvider(_)), "got {err:?}");
}

#[tokio::test]
async fn test_items_outside_window_are_dropped() {
    let mut items = feed();
    items.push(raw("late", "news", at(11, 0), "after the window closed"));
    items.push(raw("early", "news", at(11, 0) - Duration::days(1) - Duration::seconds(1), "too early"));
    let h = harness(items).await;
    let window = test_window();

    let report = h.orchestrator.run(&window, &[Step::Ingest], false).await.unwrap();
    match report.outcome(Step::Ingest) {
        Some(StageOutcome::Completed(stats)) => {
            assert_eq!(stats.processed, 4);
            assert_eq!(stats.skipped, 2);
        }
        other => panic!("unexpected ingest outcome {other:?}"),
    }
    assert_eq!(store::items_in_window(&h.pool, &window.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_run_once_targets_last_closed_window() {
    let h = harness(vec![]).await;
    // 14:00 in Riga: the window that closed at 13:00 today
    let window = h.orchestrator.last_closed_window(at(12, 0)).unwrap();
    assert_eq!(window, test_window());

    // 12:00 in Riga: today's window has not closed yet
    let earlier = h.orchestrator.last_closed_window(at(10, 0)).unwrap();
    assert_eq!(earlier.end, test_window().start);

    let report = h.orchestrator.run_once(at(12, 0)).await.unwrap();
    assert_eq!(report.window, test_window());
    assert_eq!(report.completed, Stage::Published);
}
