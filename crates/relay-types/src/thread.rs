use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Message, MessageRole};

/// Append-only conversation log. The orchestrator is the sole writer while a
/// turn is in flight; `push_user_message` is the only externally-facing
/// mutation and is rejected while the thread is locked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub messages: Vec<Message>,
    #[serde(skip)]
    locked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadError {
    Locked { thread_id: String },
    OrphanToolResult { call_id: String },
}

impl std::fmt::Display for ThreadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked { thread_id } => {
                write!(f, "thread `{thread_id}` is locked by an in-flight turn")
            }
            Self::OrphanToolResult { call_id } => {
                write!(
                    f,
                    "tool result `{call_id}` does not follow its tool call in the thread"
                )
            }
        }
    }
}

impl std::error::Error for ThreadError {}

impl Thread {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            locked: false,
        }
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            locked: false,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn unlock(&mut self) {
        self.locked = false;
    }

    /// Add a user message from outside the engine. Rejected while a turn is
    /// in flight so external callers can never interleave mid-turn.
    pub fn push_user_message(&mut self, content: impl Into<String>) -> Result<&Message, ThreadError> {
        if self.locked {
            return Err(ThreadError::Locked {
                thread_id: self.id.clone(),
            });
        }
        self.messages.push(Message::user(content));
        Ok(self.messages.last().expect("message just pushed"))
    }

    /// Append a message produced by the engine. A tool-result must directly
    /// follow the tool-call it answers.
    pub fn append(&mut self, message: Message) -> Result<(), ThreadError> {
        if message.role == MessageRole::ToolResult {
            let call_id = message.call_id.clone().unwrap_or_default();
            let preceding_call = self.messages.last().and_then(|m| {
                (m.role == MessageRole::ToolCall).then_some(m.call_id.as_deref().unwrap_or(""))
            });
            if preceding_call != Some(call_id.as_str()) {
                return Err(ThreadError::OrphanToolResult { call_id });
            }
        }
        self.messages.push(message);
        Ok(())
    }

    /// Last `n` messages, for memory recall queries.
    pub fn tail(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn locked_thread_rejects_user_messages() {
        let mut thread = Thread::new();
        thread.push_user_message("hello").expect("unlocked push");
        thread.lock();
        let err = thread.push_user_message("mid-turn").unwrap_err();
        assert!(matches!(err, ThreadError::Locked { .. }));
        thread.unlock();
        thread.push_user_message("after turn").expect("push after unlock");
        assert_eq!(thread.messages.len(), 2);
    }

    #[test]
    fn tool_result_must_follow_its_call() {
        let mut thread = Thread::new();
        thread
            .append(Message::tool_call("a", "c1", "echo", json!({"text": "hi"})))
            .expect("tool call");
        thread
            .append(Message::tool_result("c1", "echo", json!("hi"), "hi"))
            .expect("adjacent result");

        let err = thread
            .append(Message::tool_result("c9", "echo", json!("x"), "x"))
            .unwrap_err();
        assert!(matches!(err, ThreadError::OrphanToolResult { .. }));
    }

    #[test]
    fn serde_round_trip_preserves_order_and_content() {
        let mut thread = Thread::with_id("t-1");
        thread.push_user_message("first").expect("push");
        thread
            .append(Message::actor("worker", "second"))
            .expect("append");
        thread
            .append(Message::tool_call("worker", "c1", "echo", json!({})))
            .expect("append");
        thread
            .append(Message::tool_result("c1", "echo", json!(null), "ok"))
            .expect("append");

        let raw = serde_json::to_string(&thread).expect("serialize");
        let restored: Thread = serde_json::from_str(&raw).expect("deserialize");
        let raw_again = serde_json::to_string(&restored).expect("reserialize");
        assert_eq!(raw, raw_again);
        assert_eq!(restored.messages.len(), 4);
        assert_eq!(restored.messages[0].content, "first");
        assert_eq!(restored.messages[3].call_id.as_deref(), Some("c1"));
    }

    #[test]
    fn tail_returns_most_recent_window() {
        let mut thread = Thread::new();
        for i in 0..10 {
            thread.push_user_message(format!("m{i}")).expect("push");
        }
        let tail = thread.tail(3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].content, "m7");
        assert_eq!(thread.tail(50).len(), 10);
    }
}
