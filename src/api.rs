//! HTTP surface: conversation submission, status lookup, insight queries.
//!
//! Submission consults the inbound gate before anything else; refusals carry
//! the gate's advisory wait so clients can back off precisely.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics::counter;
use tower_http::cors::CorsLayer;

use crate::gate::RateGate;
use crate::ingest::{normalize_text, text_digest};
use crate::model::{Analysis, Conversation, ConversationStatus, SentimentFilter};
use crate::store::{ConversationStore, InsightQuery};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ConversationStore>,
    pub inbound_gate: Arc<RateGate>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/conversations", post(submit_conversation))
        .route("/api/v1/conversations/{id}", get(conversation_status))
        .route("/api/v1/insights", get(query_insights))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(serde::Deserialize)]
struct SubmitReq {
    text: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    raw_data: Option<serde_json::Value>,
}

#[derive(serde::Serialize)]
struct SubmitResp {
    status: &'static str,
    conversation_id: String,
    message: &'static str,
}

#[derive(serde::Serialize)]
struct StatusResp {
    conversation_id: String,
    status: ConversationStatus,
    timestamp: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

#[derive(serde::Serialize)]
struct ErrorBody {
    error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ErrorBody {
    fn plain(error: &'static str) -> Self {
        Self {
            error,
            details: None,
            retry_after: None,
        }
    }

    fn with_details(error: &'static str, details: impl Into<String>) -> Self {
        Self {
            error,
            details: Some(details.into()),
            retry_after: None,
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn submit_conversation(
    State(state): State<AppState>,
    Json(body): Json<SubmitReq>,
) -> Response {
    if !state.inbound_gate.admit() {
        counter!("submissions_rate_limited_total").increment(1);
        let body = ErrorBody {
            error: "rate_limit_exceeded",
            details: None,
            retry_after: Some(state.inbound_gate.retry_after_secs()),
        };
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    let text = normalize_text(&body.text);
    if text.is_empty() {
        counter!("submissions_invalid_total").increment(1);
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::with_details(
                "invalid_schema",
                "text must not be empty",
            )),
        )
            .into_response();
    }
    let author = body
        .author
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());

    let conversation = Conversation::new(text, author, body.timestamp, body.raw_data);
    let id = conversation.id.clone();
    let digest = text_digest(&conversation.text);

    if let Err(e) = state.store.insert(conversation).await {
        tracing::error!(target: "api", %id, "queueing conversation failed: {e:#}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody::plain("storage_failure")),
        )
            .into_response();
    }

    counter!("submissions_accepted_total").increment(1);
    tracing::info!(target: "api", %id, %digest, "conversation queued");
    (
        StatusCode::ACCEPTED,
        Json(SubmitResp {
            status: "accepted",
            conversation_id: id,
            message: "Conversation queued for analysis",
        }),
    )
        .into_response()
}

async fn conversation_status(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.store.get(&id).await {
        Ok(Some(c)) => (
            StatusCode::OK,
            Json(StatusResp {
                conversation_id: c.id,
                status: c.status,
                timestamp: c.timestamp,
                created_at: c.created_at,
            }),
        )
            .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::plain("not_found")),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(target: "api", %id, "status lookup failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::plain("storage_failure")),
            )
                .into_response()
        }
    }
}

#[derive(serde::Deserialize)]
struct InsightsParams {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    min_confidence: Option<f32>,
    #[serde(default)]
    sentiment: Option<SentimentFilter>,
}

fn default_limit() -> usize {
    100
}

#[derive(serde::Serialize)]
struct InsightItem {
    conversation_id: String,
    timestamp: DateTime<Utc>,
    text: String,
    analysis: Analysis,
}

#[derive(serde::Serialize)]
struct InsightsMetadata {
    total_count: usize,
    returned_count: usize,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(serde::Serialize)]
struct InsightsResp {
    insights: Vec<InsightItem>,
    metadata: InsightsMetadata,
}

async fn query_insights(
    State(state): State<AppState>,
    Query(params): Query<InsightsParams>,
) -> Response {
    if !(1..=1000).contains(&params.limit) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::with_details(
                "invalid_query",
                "limit must be between 1 and 1000",
            )),
        )
            .into_response();
    }
    if let Some(mc) = params.min_confidence {
        if !(0.0..=1.0).contains(&mc) {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody::with_details(
                    "invalid_query",
                    "min_confidence must be between 0.0 and 1.0",
                )),
            )
                .into_response();
        }
    }

    let query = InsightQuery {
        start_time: params.start_time,
        end_time: params.end_time,
        limit: params.limit,
        min_confidence: params.min_confidence,
        sentiment: params.sentiment,
    };
    match state.store.query_insights(&query).await {
        Ok(page) => {
            let insights: Vec<InsightItem> = page
                .insights
                .into_iter()
                .map(|i| InsightItem {
                    conversation_id: i.conversation_id,
                    timestamp: i.timestamp,
                    text: i.text,
                    analysis: i.analysis,
                })
                .collect();
            let body = InsightsResp {
                metadata: InsightsMetadata {
                    total_count: page.total,
                    returned_count: insights.len(),
                    start_time: params.start_time,
                    end_time: params.end_time,
                },
                insights,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!(target: "api", "insight query failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody::plain("storage_failure")),
            )
                .into_response()
        }
    }
}
