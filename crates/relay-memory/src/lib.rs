pub mod recall;
pub mod types;

pub use recall::*;
pub use types::*;

use async_trait::async_trait;

/// The narrow interface the orchestrator consumes: query relevant facts
/// before a turn, write back new ones after it. Writes are fire-and-forget
/// from the engine's perspective.
#[async_trait]
pub trait MemoryRecall: Send + Sync {
    async fn query(&self, text: &str, k: usize) -> MemoryResult<Vec<ScoredFact>>;
    async fn remember(&self, fact: Fact) -> MemoryResult<()>;
}
