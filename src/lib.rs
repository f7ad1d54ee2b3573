// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod analyzer;
pub mod api;
pub mod config;
pub mod gate;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod store;
pub mod worker;

// ---- Re-exports for stable public API ----
pub use crate::analyzer::{AnalysisClient, AnalysisProvider, AnalyzerError, MockProvider};
pub use crate::api::{create_router, AppState};
pub use crate::gate::RateGate;
pub use crate::model::{Analysis, Conversation, ConversationStatus, Insight};
pub use crate::store::{ConversationStore, MemoryStore};
pub use crate::worker::BatchWorker;
