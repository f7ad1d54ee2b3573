// src/worker.rs
//! # Batch worker
//! Long-lived claim -> dispatch -> commit loop that drains the pending queue
//! through the analysis client.
//!
//! Lifecycle is owned, not fire-and-forget: `start` retains the task handle,
//! `stop` cancels the token (waking any pacing sleep immediately) and then
//! joins the task. Cancellation is observed only between cycles, so an
//! in-flight batch always drains to its commit. The lifecycle is one-shot;
//! a replacement worker is constructed rather than restarted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::analyzer::AnalysisClient;
use crate::ingest::text_digest;
use crate::model::{Conversation, ConversationOutcome, Insight};
use crate::store::ConversationStore;

/// Pacing knobs. Serde defaults mirror production settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Max conversations claimed (and in flight) per cycle.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause after a cycle that processed work.
    #[serde(default = "default_cycle_pause_secs")]
    pub cycle_pause_secs: u64,
    /// Pause after a cycle that found nothing pending.
    #[serde(default = "default_idle_backoff_secs")]
    pub idle_backoff_secs: u64,
    /// Pause after a cycle-level error.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
}

fn default_batch_size() -> usize {
    10
}
fn default_cycle_pause_secs() -> u64 {
    1
}
fn default_idle_backoff_secs() -> u64 {
    5
}
fn default_error_backoff_secs() -> u64 {
    5
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            cycle_pause_secs: default_cycle_pause_secs(),
            idle_backoff_secs: default_idle_backoff_secs(),
            error_backoff_secs: default_error_backoff_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn sanitize(&mut self) {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
    }

    pub fn cycle_pause(&self) -> Duration {
        Duration::from_secs(self.cycle_pause_secs)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_secs(self.idle_backoff_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// The pieces a cycle needs; the loop task owns a clone.
#[derive(Clone)]
struct Pipeline {
    store: Arc<dyn ConversationStore>,
    client: Arc<AnalysisClient>,
    config: WorkerConfig,
}

pub struct BatchWorker {
    pipeline: Pipeline,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWorker {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<AnalysisClient>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pipeline: Pipeline {
                store,
                client,
                config,
            },
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop. Idempotent while running.
    pub fn start(&self) {
        let mut slot = self.handle.lock().expect("batch worker handle poisoned");
        if slot.is_some() {
            tracing::debug!(target: "pipeline", "batch worker already running");
            return;
        }
        let pipeline = self.pipeline.clone();
        let cancel = self.cancel.clone();
        *slot = Some(tokio::spawn(run_loop(pipeline, cancel)));
        tracing::info!(target: "pipeline", "batch worker started");
    }

    /// Cancel and join. Any pacing sleep wakes immediately; an in-flight
    /// batch finishes its commit first.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .handle
            .lock()
            .expect("batch worker handle poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(target: "pipeline", "batch worker join failed: {e:#}");
            }
        }
    }

    /// Run a single cycle outside the loop (tests, diagnostics).
    pub async fn run_once(&self) -> Result<usize> {
        self.pipeline.run_once().await
    }
}

async fn run_loop(pipeline: Pipeline, cancel: CancellationToken) {
    // Conversations stranded in processing by an unclean shutdown are
    // requeued before the first claim.
    match pipeline.store.reset_stale_processing().await {
        Ok(0) => {}
        Ok(n) => {
            tracing::warn!(target: "pipeline", reset = n, "requeued conversations stranded in processing")
        }
        Err(e) => tracing::error!(target: "pipeline", "stale-processing sweep failed: {e:#}"),
    }

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let pause = match pipeline.run_once().await {
            Ok(0) => pipeline.config.idle_backoff(),
            Ok(n) => {
                tracing::debug!(target: "pipeline", processed = n, "batch cycle done");
                pipeline.config.cycle_pause()
            }
            Err(e) => {
                counter!("batch_cycle_errors_total").increment(1);
                tracing::error!(target: "pipeline", "batch cycle failed: {e:#}");
                pipeline.config.error_backoff()
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    tracing::info!(target: "pipeline", "batch worker stopped");
}

impl Pipeline {
    /// One claim -> dispatch -> commit cycle. Returns the number of
    /// conversations dispatched (0 = nothing pending, caller idles).
    async fn run_once(&self) -> Result<usize> {
        counter!("batch_cycles_total").increment(1);

        let batch = self
            .store
            .fetch_pending(self.config.batch_size)
            .await
            .context("claim pending conversations")?;
        if batch.is_empty() {
            return Ok(0);
        }
        let claimed = batch.len();
        counter!("batch_claimed_total").increment(claimed as u64);

        // Flip the whole claim to processing before anything is dispatched,
        // so an overlapping cycle cannot pick the same rows.
        let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
        self.store
            .mark_processing(&ids)
            .await
            .context("mark claimed batch processing")?;

        // The whole batch goes in flight at once; the analyzer's slots cap
        // the actual outbound concurrency.
        let mut inflight = JoinSet::new();
        for conversation in batch {
            let client = Arc::clone(&self.client);
            inflight.spawn(analyze_one(client, conversation));
        }

        let mut outcomes = Vec::with_capacity(claimed);
        while let Some(joined) = inflight.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                // A panicked task leaves its row in processing; the sweep on
                // the next start requeues it.
                Err(e) => {
                    tracing::error!(target: "pipeline", "analysis task join failed: {e:#}")
                }
            }
        }

        let completed = outcomes
            .iter()
            .filter(|o| matches!(o, ConversationOutcome::Completed(_)))
            .count();
        let failed = outcomes.len() - completed;

        self.store
            .commit_batch(outcomes)
            .await
            .context("commit batch outcomes")?;

        counter!("batch_completed_total").increment(completed as u64);
        counter!("batch_failed_total").increment(failed as u64);
        gauge!("pipeline_last_cycle_ts").set(chrono::Utc::now().timestamp().max(0) as f64);
        Ok(claimed)
    }
}

/// Analyze one claimed conversation. Analyzer failures become failed
/// outcomes so one bad item cannot sink its batch.
async fn analyze_one(
    client: Arc<AnalysisClient>,
    conversation: Conversation,
) -> ConversationOutcome {
    let digest = text_digest(&conversation.text);
    match client.analyze(&conversation.text).await {
        Ok(analysis) => {
            tracing::info!(
                target: "pipeline",
                id = %conversation.id,
                %digest,
                sentiment = analysis.sentiment_score,
                clusters = analysis.clusters.len(),
                "conversation analyzed"
            );
            ConversationOutcome::Completed(Insight {
                conversation_id: conversation.id,
                timestamp: conversation.timestamp,
                text: conversation.text,
                analysis,
                created_at: chrono::Utc::now(),
            })
        }
        Err(e) => {
            tracing::error!(
                target: "pipeline",
                id = %conversation.id,
                %digest,
                error = %e,
                "conversation analysis failed"
            );
            ConversationOutcome::Failed {
                conversation_id: conversation.id,
                reason: e.to_string(),
            }
        }
    }
}
