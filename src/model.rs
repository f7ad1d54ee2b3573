//! # Domain model
//! Conversations queued for analysis, the insights produced from them, and
//! the status machine the batch pipeline drives items through.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a queued conversation.
///
/// Transitions only move forward: `Pending -> Processing -> {Completed | Failed}`.
/// Both `Completed` and `Failed` are terminal; failed conversations are not
/// retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` keeps the status machine monotonic.
    pub fn can_transition(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A short text record queued for enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// When the conversation happened (defaults to arrival time).
    pub timestamp: DateTime<Utc>,
    /// Arbitrary submitter metadata, stored verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<serde_json::Value>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    /// Build a pending conversation with a fresh `conv_`-prefixed id.
    pub fn new(
        text: String,
        author: Option<String>,
        timestamp: Option<DateTime<Utc>>,
        raw_data: Option<serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_conversation_id(),
            text,
            author,
            timestamp: timestamp.unwrap_or(now),
            raw_data,
            status: ConversationStatus::Pending,
            created_at: now,
        }
    }
}

/// Short random id, `conv_` + 8 hex chars.
fn new_conversation_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("conv_{}", &hex[..8])
}

/// Parsed output of one analysis call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Sentiment in `[-1.0, 1.0]` (negative .. positive).
    pub sentiment_score: f32,
    /// Topic labels; may be empty when the analyzer offered none.
    pub clusters: Vec<String>,
    /// Analyzer self-confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    pub reasoning: String,
}

impl Analysis {
    /// Degraded result used when the analyzer reply never parsed.
    ///
    /// Deliberately neutral: zero sentiment, zero confidence, an `unknown`
    /// cluster, and a reasoning string carrying the parse failure.
    pub fn parse_fallback(detail: &str) -> Self {
        Self {
            sentiment_score: 0.0,
            clusters: vec!["unknown".to_string()],
            confidence: 0.0,
            reasoning: format!("Failed to parse analyzer response: {detail}"),
        }
    }
}

/// A committed analysis outcome, keyed back to its conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub conversation_id: String,
    /// Copied from the conversation so insights sort by event time.
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub analysis: Analysis,
    pub created_at: DateTime<Utc>,
}

/// Per-item result of one batch cycle, applied in a single commit.
#[derive(Debug, Clone)]
pub enum ConversationOutcome {
    Completed(Insight),
    Failed { conversation_id: String, reason: String },
}

impl ConversationOutcome {
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Completed(insight) => &insight.conversation_id,
            Self::Failed {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Sentiment class filter for insight queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentFilter {
    Positive,
    Negative,
    Neutral,
}

impl SentimentFilter {
    /// Class boundaries: positive above 0.1, negative below -0.1,
    /// neutral is the closed band between them.
    pub fn matches(self, score: f32) -> bool {
        match self {
            Self::Positive => score > 0.1,
            Self::Negative => score < -0.1,
            Self::Neutral => (-0.1..=0.1).contains(&score),
        }
    }
}
