use std::pin::Pin;
use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use relay_types::ToolSchema;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart {
        id: String,
        name: String,
    },
    ToolCallDelta {
        id: String,
        args_delta: String,
    },
    ToolCallEnd {
        id: String,
    },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

/// Stream a fixed completion as a text delta followed by a done marker. Used
/// by the default `Provider::stream` impl and by test doubles.
pub fn text_stream(text: String) -> ChunkStream {
    Box::pin(stream! {
        yield Ok(StreamChunk::TextDelta(text));
        yield Ok(StreamChunk::Done {
            finish_reason: "stop".to_string(),
            usage: None,
        });
    })
}

/// The one capability the engine needs from a model backend: run a
/// conversation turn as a cancellable stream of chunks. Implementations that
/// only support blocking completion get streaming for free.
#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    async fn complete(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<String>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let prompt = messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let response = self.complete(&prompt, model_override).await?;
        Ok(text_stream(response))
    }
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    default_provider: Arc<RwLock<Option<String>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        {
            let mut default_provider = self.default_provider.write().await;
            if default_provider.is_none() {
                *default_provider = Some(id.clone());
            }
        }
        let mut providers = self.providers.write().await;
        providers.retain(|p| p.id() != id);
        providers.push(provider);
    }

    pub async fn set_default(&self, id: impl Into<String>) {
        *self.default_provider.write().await = Some(id.into());
    }

    pub async fn get(&self, hint: Option<&str>) -> Option<Arc<dyn Provider>> {
        let wanted = match hint {
            Some(id) => Some(id.to_string()),
            None => self.default_provider.read().await.clone(),
        };
        let providers = self.providers.read().await;
        match wanted {
            Some(id) => providers.iter().find(|p| p.id() == id).cloned(),
            None => providers.first().cloned(),
        }
    }

    pub async fn stream_for(
        &self,
        hint: Option<&str>,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self
            .get(hint)
            .await
            .ok_or_else(|| anyhow::anyhow!("no provider registered for `{}`", hint.unwrap_or("default")))?;
        provider.stream(messages, model_override, tools, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct FixedProvider {
        reply: String,
    }

    #[async_trait]
    impl Provider for FixedProvider {
        fn id(&self) -> &str {
            "fixed"
        }

        async fn complete(
            &self,
            _prompt: &str,
            _model_override: Option<&str>,
        ) -> anyhow::Result<String> {
            Ok(self.reply.clone())
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_complete() {
        let provider = FixedProvider {
            reply: "hello".to_string(),
        };
        let mut stream = provider
            .stream(
                vec![ChatMessage::new("user", "hi")],
                None,
                None,
                CancellationToken::new(),
            )
            .await
            .expect("stream");

        let first = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(first, StreamChunk::TextDelta(text) if text == "hello"));
        let second = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(second, StreamChunk::Done { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn registry_resolves_default_and_hint() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(FixedProvider {
                reply: "a".to_string(),
            }))
            .await;
        assert_eq!(registry.get(None).await.expect("default").id(), "fixed");
        assert_eq!(registry.get(Some("fixed")).await.expect("hinted").id(), "fixed");
        assert!(registry.get(Some("missing")).await.is_none());
    }
}
