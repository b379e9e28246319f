use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Actor,
    System,
    ToolCall,
    ToolResult,
}

/// One entry in a thread. Tool-call messages carry `tool_name`/`tool_args`
/// and a `call_id`; tool-result messages carry the same `call_id` plus
/// `tool_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn base(role: MessageRole, content: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            actor_id: None,
            tool_name: None,
            tool_args: None,
            call_id: None,
            tool_result: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(MessageRole::User, content.into())
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(MessageRole::System, content.into())
    }

    pub fn actor(actor_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::base(MessageRole::Actor, content.into());
        msg.actor_id = Some(actor_id.into());
        msg
    }

    pub fn tool_call(
        actor_id: impl Into<String>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_args: Value,
    ) -> Self {
        let tool_name = tool_name.into();
        let mut msg = Self::base(MessageRole::ToolCall, format!("[tool call: {tool_name}]"));
        msg.actor_id = Some(actor_id.into());
        msg.call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name);
        msg.tool_args = Some(tool_args);
        msg
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        result: Value,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(MessageRole::ToolResult, content.into());
        msg.call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg.tool_result = Some(result);
        msg
    }
}
