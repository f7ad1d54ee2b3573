// tests/worker_pipeline.rs
//
// Batch worker behavior against a recording store: one commit per cycle with
// mixed outcomes, idle backoff pacing, prompt shutdown, and the startup sweep
// that requeues rows stranded in processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use convo_insights::analyzer::{
    AnalysisClient, AnalysisProvider, AnalyzerConfig, AnalyzerError, MockProvider,
};
use convo_insights::gate::RateGate;
use convo_insights::model::{Conversation, ConversationOutcome, ConversationStatus};
use convo_insights::store::{ConversationStore, InsightPage, InsightQuery, MemoryStore};
use convo_insights::worker::{BatchWorker, WorkerConfig};

const GOOD_PAYLOAD: &str = r#"{
    "sentiment_score": 0.4,
    "clusters": ["customer_support"],
    "confidence": 0.9,
    "reasoning": "Routine support exchange"
}"#;

/// Store wrapper that counts calls and timestamps fetches, delegating the
/// actual bookkeeping to `MemoryStore`.
struct RecordingStore {
    inner: Arc<MemoryStore>,
    fetches: AtomicUsize,
    commits: AtomicUsize,
    fetch_instants: Mutex<Vec<Instant>>,
}

impl RecordingStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fetches: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            fetch_instants: Mutex::new(Vec::new()),
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn fetch_gaps(&self) -> Vec<Duration> {
        let instants = self.fetch_instants.lock().expect("instants mutex");
        instants.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl ConversationStore for RecordingStore {
    async fn insert(&self, conversation: Conversation) -> anyhow::Result<()> {
        self.inner.insert(conversation).await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Conversation>> {
        self.inner.get(id).await
    }

    async fn fetch_pending(&self, limit: usize) -> anyhow::Result<Vec<Conversation>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetch_instants
            .lock()
            .expect("instants mutex")
            .push(Instant::now());
        self.inner.fetch_pending(limit).await
    }

    async fn mark_processing(&self, ids: &[String]) -> anyhow::Result<()> {
        self.inner.mark_processing(ids).await
    }

    async fn commit_batch(&self, outcomes: Vec<ConversationOutcome>) -> anyhow::Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit_batch(outcomes).await
    }

    async fn reset_stale_processing(&self) -> anyhow::Result<usize> {
        self.inner.reset_stale_processing().await
    }

    async fn query_insights(&self, query: &InsightQuery) -> anyhow::Result<InsightPage> {
        self.inner.query_insights(query).await
    }
}

/// Succeeds unless the prompt carries the poison marker, which always fails
/// with a non-retryable-looking server error (exhausts all attempts).
struct FlakyProvider {
    calls: AtomicUsize,
}

#[async_trait]
impl AnalysisProvider for FlakyProvider {
    async fn complete(&self, prompt: &str) -> Result<String, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.contains("refund") {
            return Err(AnalyzerError::Api {
                status: 503,
                message: "upstream unavailable".to_string(),
            });
        }
        Ok(GOOD_PAYLOAD.to_string())
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}

/// Slow enough that shutdown can arrive mid-dispatch.
struct SlowProvider;

#[async_trait]
impl AnalysisProvider for SlowProvider {
    async fn complete(&self, _prompt: &str) -> Result<String, AnalyzerError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(GOOD_PAYLOAD.to_string())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn client(provider: Arc<dyn AnalysisProvider>) -> Arc<AnalysisClient> {
    Arc::new(AnalysisClient::new(
        provider,
        Arc::new(RateGate::per_second(10)),
        &AnalyzerConfig::default(),
    ))
}

async fn queue_text(store: &RecordingStore, text: &str) -> String {
    let conv = Conversation::new(text.to_string(), None, None, None);
    let id = conv.id.clone();
    store.insert(conv).await.expect("insert conversation");
    id
}

#[tokio::test(start_paused = true)]
async fn cycle_commits_mixed_outcomes_in_one_batch() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(Arc::clone(&memory)));

    let mut ok_ids = Vec::new();
    for n in 0..9 {
        ok_ids.push(queue_text(&store, &format!("support exchange {n}")).await);
    }
    let failing_id = queue_text(&store, "I demand a refund right now").await;

    let worker = BatchWorker::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        client(Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
        })),
        WorkerConfig::default(),
    );

    let claimed = worker.run_once().await.expect("cycle");
    assert_eq!(claimed, 10, "whole queue fits one default batch");

    assert_eq!(store.fetches(), 1);
    assert_eq!(store.commits(), 1, "mixed outcomes still land in one commit");
    assert_eq!(memory.insight_count(), 9, "only completed rows produce insights");

    for id in &ok_ids {
        assert_eq!(memory.status_of(id), Some(ConversationStatus::Completed));
    }
    assert_eq!(
        memory.status_of(&failing_id),
        Some(ConversationStatus::Failed),
        "exhausted analysis must park the row as failed"
    );
}

#[tokio::test(start_paused = true)]
async fn idle_polls_back_off_five_seconds() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(memory));

    let worker = BatchWorker::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        client(Arc::new(MockProvider::canned())),
        WorkerConfig::default(),
    );

    worker.start();
    tokio::time::sleep(Duration::from_secs(12)).await;
    worker.stop().await;

    let fetches = store.fetches();
    assert!(
        (2..=4).contains(&fetches),
        "12s of idling at a 5s backoff should poll ~3 times, saw {fetches}"
    );
    assert_eq!(store.commits(), 0, "an empty queue must not write anything");
    for gap in store.fetch_gaps() {
        assert!(
            gap >= Duration::from_secs(5),
            "idle polls should sit 5s apart, saw {gap:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_the_idle_sleep() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(memory));

    let worker = BatchWorker::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        client(Arc::new(MockProvider::canned())),
        WorkerConfig::default(),
    );

    worker.start();
    // Let the loop reach its first idle sleep.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.fetches(), 1);

    // A responsive shutdown resolves without waiting out the 5s backoff; the
    // 2s ceiling only trips if cancellation fails to interrupt the sleep.
    tokio::time::timeout(Duration::from_secs(2), worker.stop())
        .await
        .expect("stop should interrupt the idle sleep");
    assert_eq!(store.fetches(), 1, "no further polls after shutdown");
}

#[tokio::test(start_paused = true)]
async fn start_requeues_rows_stranded_in_processing() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(Arc::clone(&memory)));

    // Simulate a crash after claiming: two rows stuck in processing.
    let a = queue_text(&store, "first stranded exchange").await;
    let b = queue_text(&store, "second stranded exchange").await;
    store
        .mark_processing(&[a.clone(), b.clone()])
        .await
        .expect("strand rows");

    let worker = BatchWorker::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        client(Arc::new(MockProvider::canned())),
        WorkerConfig::default(),
    );

    worker.start();
    for _ in 0..50 {
        if memory.insight_count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    worker.stop().await;

    assert_eq!(memory.insight_count(), 2, "swept rows should be analyzed");
    assert_eq!(memory.status_of(&a), Some(ConversationStatus::Completed));
    assert_eq!(memory.status_of(&b), Some(ConversationStatus::Completed));
    assert!(store.commits() >= 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_dispatch_drains_the_batch() {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(RecordingStore::new(Arc::clone(&memory)));
    let id = queue_text(&store, "hangs in analysis while we shut down").await;

    let worker = BatchWorker::new(
        Arc::clone(&store) as Arc<dyn ConversationStore>,
        client(Arc::new(SlowProvider)),
        WorkerConfig::default(),
    );

    worker.start();
    // Let the loop claim the row; the slow analysis is now in flight.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.fetches(), 1);
    assert_eq!(memory.status_of(&id), Some(ConversationStatus::Processing));

    // Shutdown must not abandon a claimed row: the in-flight batch runs to
    // its commit before the loop exits.
    worker.stop().await;
    assert_eq!(store.commits(), 1);
    assert_eq!(memory.status_of(&id), Some(ConversationStatus::Completed));
    assert_eq!(memory.insight_count(), 1);
}
