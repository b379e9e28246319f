use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Tokens for in-flight runs, keyed by run id, so an external caller can
/// abort a run it did not start.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, run_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .write()
            .await
            .insert(run_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, run_id: &str) -> bool {
        match self.inner.read().await.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, run_id: &str) {
        self.inner.write().await.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_the_created_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("r1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("r1").await);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_run_is_a_noop() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("missing").await);
    }
}
