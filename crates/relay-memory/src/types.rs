// Memory types
// Fact record and error types for the recall interface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A remembered fact - unit of storage and retrieval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: String,
    /// Where the fact came from, e.g. "turn_summary", "caller"
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl Fact {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            source: source.into(),
            created_at: Utc::now(),
            metadata: None,
        }
    }
}

/// Retrieval hit with relevance score in [0, 1]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MemoryResult<T> = Result<T, MemoryError>;
