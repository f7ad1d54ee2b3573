//! Seeds a running service with support-style conversations for local testing.
//!
//! Reads JSONL records (`{"text": ..., "author": ...}`) from the path given as
//! the first argument, or falls back to a built-in sample set.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

#[derive(Deserialize)]
struct SeedRecord {
    text: String,
    #[serde(default)]
    author: Option<String>,
}

const SAMPLES: &[(&str, &str)] = &[
    (
        "Still waiting on my order after two weeks. Really disappointed with the service.",
        "customer123",
    ),
    (
        "Great product! Fast shipping and excellent quality. Highly recommend!",
        "happy_customer",
    ),
    (
        "Having trouble signing into my account. Can someone help?",
        "user456",
    ),
    (
        "The delivery was late but support sorted it out quickly. Thanks!",
        "satisfied_user",
    ),
    (
        "Package arrived damaged. I need a refund immediately.",
        "angry_customer",
    ),
    (
        "Love the new features! Keep up the great work!",
        "fan_user",
    ),
    (
        "Billing problem: I was charged twice for the same order.",
        "concerned_user",
    ),
    (
        "Best customer service experience I've had. Thank you!",
        "grateful_customer",
    ),
    (
        "The website keeps timing out and I can't reach my account.",
        "frustrated_user",
    ),
    (
        "Solid quality and a fast response from the team. Five stars!",
        "reviewer_123",
    ),
];

fn load_records() -> Result<Vec<SeedRecord>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading seed file {path}"))?;
            let mut records = Vec::new();
            for (n, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let rec: SeedRecord = serde_json::from_str(line)
                    .with_context(|| format!("parsing seed line {}", n + 1))?;
                records.push(rec);
            }
            Ok(records)
        }
        None => Ok(SAMPLES
            .iter()
            .map(|(text, author)| SeedRecord {
                text: (*text).to_string(),
                author: Some((*author).to_string()),
            })
            .collect()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let api_url =
        std::env::var("INSIGHTS_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let records = load_records()?;
    println!("Seeding {} conversations into {api_url}", records.len());

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("building HTTP client")?;

    // Backdate a day so seeded rows land inside typical insight query windows.
    let timestamp = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();

    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for rec in records {
        let payload = serde_json::json!({
            "text": rec.text,
            "author": rec.author,
            "timestamp": timestamp,
        });
        let sent = client
            .post(format!("{api_url}/api/v1/conversations"))
            .json(&payload)
            .send()
            .await;
        match sent {
            Ok(r) if r.status() == reqwest::StatusCode::ACCEPTED => accepted += 1,
            Ok(r) => {
                rejected += 1;
                tracing::warn!(status = %r.status(), "submission refused");
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!("submission failed: {e:#}");
            }
        }
    }

    println!("seed-conversations done: {accepted} accepted, {rejected} rejected");
    Ok(())
}
