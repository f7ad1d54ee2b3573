//! # Conversation store
//! Seam between the HTTP layer / batch worker and whatever persists the
//! queue. The bundled `MemoryStore` keeps both tables behind one mutex,
//! which doubles as the commit boundary: a batch either applies whole or
//! not at all.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    Conversation, ConversationOutcome, ConversationStatus, Insight, SentimentFilter,
};

/// Insight query parameters. The time range is inclusive on both ends.
#[derive(Debug, Clone)]
pub struct InsightQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub limit: usize,
    pub min_confidence: Option<f32>,
    pub sentiment: Option<SentimentFilter>,
}

/// Query result plus the pre-limit match count.
#[derive(Debug, Clone)]
pub struct InsightPage {
    pub insights: Vec<Insight>,
    pub total: usize,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Queue a new pending conversation.
    async fn insert(&self, conversation: Conversation) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Conversation>>;

    /// Up to `limit` pending conversations; order is unspecified.
    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Conversation>>;

    /// Flip a claimed batch to `Processing` so no overlapping cycle can
    /// re-claim it. All-or-nothing: an unknown or non-pending id rejects the
    /// whole call without touching any row.
    async fn mark_processing(&self, ids: &[String]) -> Result<()>;

    /// Apply one cycle's outcomes in a single unit: terminal status flips
    /// plus insight inserts. Validation failures apply nothing.
    async fn commit_batch(&self, outcomes: Vec<ConversationOutcome>) -> Result<()>;

    /// Requeue conversations stranded in `Processing` by an earlier crash.
    /// Returns how many were reset.
    async fn reset_stale_processing(&self) -> Result<usize>;

    async fn query_insights(&self, query: &InsightQuery) -> Result<InsightPage>;
}

/// In-memory store. The mutex is never held across an await.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    insights: Vec<Insight>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    /// Synchronous status peek (diagnostics and tests).
    pub fn status_of(&self, id: &str) -> Option<ConversationStatus> {
        self.lock().conversations.get(id).map(|c| c.status)
    }

    pub fn insight_count(&self) -> usize {
        self.lock().insights.len()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert(&self, conversation: Conversation) -> Result<()> {
        let mut inner = self.lock();
        if inner.conversations.contains_key(&conversation.id) {
            bail!("conversation {} already queued", conversation.id);
        }
        inner
            .conversations
            .insert(conversation.id.clone(), conversation);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.lock().conversations.get(id).cloned())
    }

    async fn fetch_pending(&self, limit: usize) -> Result<Vec<Conversation>> {
        let inner = self.lock();
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.status == ConversationStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, ids: &[String]) -> Result<()> {
        let mut inner = self.lock();
        // Validate first so a bad id leaves the batch untouched.
        for id in ids {
            match inner.conversations.get(id) {
                None => bail!("cannot mark unknown conversation {id} as processing"),
                Some(c) if !c.status.can_transition(ConversationStatus::Processing) => {
                    bail!(
                        "conversation {id} is {} and cannot move to processing",
                        c.status
                    )
                }
                Some(_) => {}
            }
        }
        for id in ids {
            if let Some(c) = inner.conversations.get_mut(id) {
                c.status = ConversationStatus::Processing;
            }
        }
        Ok(())
    }

    async fn commit_batch(&self, outcomes: Vec<ConversationOutcome>) -> Result<()> {
        let mut inner = self.lock();
        for outcome in &outcomes {
            let id = outcome.conversation_id();
            match inner.conversations.get(id) {
                None => bail!("cannot commit unknown conversation {id}"),
                Some(c) if c.status != ConversationStatus::Processing => {
                    bail!("conversation {id} is {}, expected processing", c.status)
                }
                Some(_) => {}
            }
        }
        for outcome in outcomes {
            match outcome {
                ConversationOutcome::Completed(insight) => {
                    if let Some(c) = inner.conversations.get_mut(&insight.conversation_id) {
                        c.status = ConversationStatus::Completed;
                    }
                    inner.insights.push(insight);
                }
                ConversationOutcome::Failed {
                    conversation_id, ..
                } => {
                    if let Some(c) = inner.conversations.get_mut(&conversation_id) {
                        c.status = ConversationStatus::Failed;
                    }
                }
            }
        }
        Ok(())
    }

    async fn reset_stale_processing(&self) -> Result<usize> {
        let mut inner = self.lock();
        let mut reset = 0usize;
        for c in inner.conversations.values_mut() {
            if c.status == ConversationStatus::Processing {
                c.status = ConversationStatus::Pending;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn query_insights(&self, query: &InsightQuery) -> Result<InsightPage> {
        let inner = self.lock();
        let mut matches: Vec<Insight> = inner
            .insights
            .iter()
            .filter(|i| i.timestamp >= query.start_time && i.timestamp <= query.end_time)
            .filter(|i| {
                query
                    .min_confidence
                    .is_none_or(|min| i.analysis.confidence >= min)
            })
            .filter(|i| {
                query
                    .sentiment
                    .is_none_or(|s| s.matches(i.analysis.sentiment_score))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = matches.len();
        matches.truncate(query.limit);
        Ok(InsightPage {
            insights: matches,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Analysis;
    use chrono::Duration;

    fn conv(text: &str) -> Conversation {
        Conversation::new(text.to_string(), None, None, None)
    }

    fn insight_at(id: &str, ts: DateTime<Utc>, score: f32, confidence: f32) -> Insight {
        Insight {
            conversation_id: id.to_string(),
            timestamp: ts,
            text: "t".to_string(),
            analysis: Analysis {
                sentiment_score: score,
                clusters: vec!["topic".to_string()],
                confidence,
                reasoning: "r".to_string(),
            },
            created_at: ts,
        }
    }

    #[tokio::test]
    async fn insert_then_get_roundtrips() {
        let store = MemoryStore::new();
        let c = conv("hello");
        let id = c.id.clone();
        store.insert(c).await.unwrap();
        let got = store.get(&id).await.unwrap().expect("stored conversation");
        assert_eq!(got.status, ConversationStatus::Pending);
        assert!(store.insert(got.clone()).await.is_err(), "duplicate id rejected");
    }

    #[tokio::test]
    async fn fetch_pending_respects_limit_and_status() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.insert(conv(&format!("c{i}"))).await.unwrap();
        }
        let claimed = store.fetch_pending(3).await.unwrap();
        assert_eq!(claimed.len(), 3);

        let ids: Vec<String> = claimed.iter().map(|c| c.id.clone()).collect();
        store.mark_processing(&ids).await.unwrap();
        let rest = store.fetch_pending(10).await.unwrap();
        assert_eq!(rest.len(), 2, "processing rows are no longer claimable");
    }

    #[tokio::test]
    async fn mark_processing_is_all_or_nothing() {
        let store = MemoryStore::new();
        let a = conv("a");
        let a_id = a.id.clone();
        store.insert(a).await.unwrap();

        let bad = vec![a_id.clone(), "conv_missing1".to_string()];
        assert!(store.mark_processing(&bad).await.is_err());
        assert_eq!(
            store.status_of(&a_id),
            Some(ConversationStatus::Pending),
            "failed batch must not touch valid rows"
        );
    }

    #[tokio::test]
    async fn commit_applies_terminal_flips_and_insights_together() {
        let store = MemoryStore::new();
        let a = conv("a");
        let b = conv("b");
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        store.insert(a).await.unwrap();
        store.insert(b).await.unwrap();
        store
            .mark_processing(&[a_id.clone(), b_id.clone()])
            .await
            .unwrap();

        let now = Utc::now();
        store
            .commit_batch(vec![
                ConversationOutcome::Completed(insight_at(&a_id, now, 0.5, 0.9)),
                ConversationOutcome::Failed {
                    conversation_id: b_id.clone(),
                    reason: "provider down".to_string(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(store.status_of(&a_id), Some(ConversationStatus::Completed));
        assert_eq!(store.status_of(&b_id), Some(ConversationStatus::Failed));
        assert_eq!(store.insight_count(), 1);
    }

    #[tokio::test]
    async fn commit_rejects_rows_that_never_entered_processing() {
        let store = MemoryStore::new();
        let a = conv("a");
        let a_id = a.id.clone();
        store.insert(a).await.unwrap();

        let res = store
            .commit_batch(vec![ConversationOutcome::Failed {
                conversation_id: a_id.clone(),
                reason: "x".to_string(),
            }])
            .await;
        assert!(res.is_err(), "pending rows cannot jump to terminal states");
        assert_eq!(store.status_of(&a_id), Some(ConversationStatus::Pending));
        assert_eq!(store.insight_count(), 0);
    }

    #[tokio::test]
    async fn stale_processing_rows_requeue() {
        let store = MemoryStore::new();
        let a = conv("a");
        let a_id = a.id.clone();
        store.insert(a).await.unwrap();
        store.mark_processing(&[a_id.clone()]).await.unwrap();

        let reset = store.reset_stale_processing().await.unwrap();
        assert_eq!(reset, 1);
        assert_eq!(store.status_of(&a_id), Some(ConversationStatus::Pending));
        assert_eq!(store.reset_stale_processing().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insight_query_filters_sorts_and_counts() {
        let store = MemoryStore::new();
        let base = Utc::now();
        {
            let mut inner = store.lock();
            inner.insights.push(insight_at("c1", base, 0.5, 0.9));
            inner
                .insights
                .push(insight_at("c2", base - Duration::hours(1), -0.5, 0.4));
            inner
                .insights
                .push(insight_at("c3", base - Duration::hours(2), 0.05, 0.8));
            inner
                .insights
                .push(insight_at("c4", base - Duration::days(2), 0.9, 0.9));
        }

        let q = InsightQuery {
            start_time: base - Duration::days(1),
            end_time: base,
            limit: 10,
            min_confidence: None,
            sentiment: None,
        };
        let page = store.query_insights(&q).await.unwrap();
        assert_eq!(page.total, 3, "two-day-old insight is outside the range");
        let ids: Vec<&str> = page
            .insights
            .iter()
            .map(|i| i.conversation_id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"], "newest first");

        let confident = store
            .query_insights(&InsightQuery {
                min_confidence: Some(0.8),
                ..q.clone()
            })
            .await
            .unwrap();
        assert_eq!(confident.total, 2);

        let negative = store
            .query_insights(&InsightQuery {
                sentiment: Some(SentimentFilter::Negative),
                ..q.clone()
            })
            .await
            .unwrap();
        assert_eq!(negative.total, 1);
        assert_eq!(negative.insights[0].conversation_id, "c2");

        let limited = store
            .query_insights(&InsightQuery { limit: 1, ..q })
            .await
            .unwrap();
        assert_eq!(limited.insights.len(), 1);
        assert_eq!(limited.total, 3, "total reports pre-limit matches");
    }
}
