// Recall backends
// Keyword-overlap store used as the default, plus a no-op store

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Fact, MemoryResult, ScoredFact};
use crate::MemoryRecall;

/// In-process store scoring facts by token overlap with the query. Not a
/// vector database; good enough to enrich a turn with recently learned
/// context and to exercise the recall seam in tests.
#[derive(Clone, Default)]
pub struct KeywordRecall {
    facts: Arc<RwLock<Vec<Fact>>>,
}

impl KeywordRecall {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.facts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facts.read().await.is_empty()
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_lowercase())
        .collect()
}

fn overlap_score(query: &HashSet<String>, content: &str) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let fact_tokens = tokenize(content);
    if fact_tokens.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(&fact_tokens).count() as f64;
    shared / (query.len() as f64 * fact_tokens.len() as f64).sqrt()
}

#[async_trait]
impl MemoryRecall for KeywordRecall {
    async fn query(&self, text: &str, k: usize) -> MemoryResult<Vec<ScoredFact>> {
        let query_tokens = tokenize(text);
        let facts = self.facts.read().await;
        let mut hits = facts
            .iter()
            .filter_map(|fact| {
                let score = overlap_score(&query_tokens, &fact.content);
                (score > 0.0).then(|| ScoredFact {
                    fact: fact.clone(),
                    score,
                })
            })
            .collect::<Vec<_>>();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn remember(&self, fact: Fact) -> MemoryResult<()> {
        self.facts.write().await.push(fact);
        Ok(())
    }
}

/// Recall backend that remembers nothing. Useful when a caller wants the
/// engine without any memory enrichment.
#[derive(Clone, Copy, Default)]
pub struct NullRecall;

#[async_trait]
impl MemoryRecall for NullRecall {
    async fn query(&self, _text: &str, _k: usize) -> MemoryResult<Vec<ScoredFact>> {
        Ok(Vec::new())
    }

    async fn remember(&self, _fact: Fact) -> MemoryResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_ranks_by_overlap() {
        let recall = KeywordRecall::new();
        recall
            .remember(Fact::new("the deploy pipeline uses blue green rollout", "caller"))
            .await
            .expect("remember");
        recall
            .remember(Fact::new("lunch is at noon", "caller"))
            .await
            .expect("remember");

        let hits = recall
            .query("how does the deploy rollout work", 5)
            .await
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].fact.content.contains("deploy"));
    }

    #[tokio::test]
    async fn query_truncates_to_k() {
        let recall = KeywordRecall::new();
        for i in 0..10 {
            recall
                .remember(Fact::new(format!("release note {i} about deploys"), "caller"))
                .await
                .expect("remember");
        }
        let hits = recall.query("deploys release", 3).await.expect("query");
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn null_recall_is_silent() {
        let recall = NullRecall;
        recall.remember(Fact::new("x", "caller")).await.expect("remember");
        assert!(recall.query("x", 5).await.expect("query").is_empty());
    }
}
