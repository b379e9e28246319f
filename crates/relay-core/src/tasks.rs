// Task model
// Typed-result unit of work driven to a terminal state by the orchestrator

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_tools::Tool;
use relay_types::{ResultSchema, SchemaViolation};

/// Status of a task. Readiness is computed by the scheduler from dependency
/// states, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for selection or dependencies
    Pending,
    /// Selected into the current turn's scope
    Running,
    /// Result accepted against the declared schema
    Successful,
    /// Failed by the actor, by budget policy, or by dependency propagation
    Failed,
    /// Explicitly skipped as no longer relevant
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed | Self::Skipped)
    }
}

/// A unit of work with a result-type contract
#[derive(Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: String,
    /// Natural-language objective given to the acting agent
    pub objective: String,
    /// Contract the result value must satisfy
    pub result_type: ResultSchema,
    /// Current task status
    pub status: TaskStatus,
    /// IDs of tasks that must be successful or skipped before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Agent responsible for this task; unset means the default actor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_actor: Option<String>,
    /// Key-value context surfaced in the turn prompt while this task is in scope
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Tools usable only while this task is active. Runtime-only.
    #[serde(skip)]
    pub tools: Vec<Arc<dyn Tool>>,
    /// Result value, set only on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason, set only on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("objective", &self.objective)
            .field("result_type", &self.result_type)
            .field("status", &self.status)
            .field("depends_on", &self.depends_on)
            .field("assigned_actor", &self.assigned_actor)
            .field("tools", &self.tools.len())
            .field("result", &self.result)
            .field("failure_reason", &self.failure_reason)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTransitionError {
    AlreadyTerminal { task_id: String, status: String },
    NotRunning { task_id: String },
    InvalidResult { task_id: String, violation: String },
}

impl std::fmt::Display for TaskTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyTerminal { task_id, status } => {
                write!(f, "task `{task_id}` is already terminal ({status})")
            }
            Self::NotRunning { task_id } => {
                write!(f, "task `{task_id}` is not running")
            }
            Self::InvalidResult { task_id, violation } => {
                write!(f, "result for task `{task_id}` rejected: {violation}")
            }
        }
    }
}

impl std::error::Error for TaskTransitionError {}

impl Task {
    pub fn new(
        id: impl Into<String>,
        objective: impl Into<String>,
        result_type: ResultSchema,
    ) -> Self {
        Self {
            id: id.into(),
            objective: objective.into(),
            result_type,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            assigned_actor: None,
            context: BTreeMap::new(),
            tools: Vec::new(),
            result: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.assigned_actor = Some(actor.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn status_label(&self) -> String {
        serde_json::to_value(self.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    fn guard_not_terminal(&self) -> Result<(), TaskTransitionError> {
        if self.is_terminal() {
            return Err(TaskTransitionError::AlreadyTerminal {
                task_id: self.id.clone(),
                status: self.status_label(),
            });
        }
        Ok(())
    }

    pub(crate) fn mark_running(&mut self) -> Result<(), TaskTransitionError> {
        self.guard_not_terminal()?;
        self.status = TaskStatus::Running;
        Ok(())
    }

    /// Accept a result. The value is validated against the declared schema
    /// first; a violation leaves the task untouched so the actor can retry.
    pub(crate) fn mark_successful(&mut self, result: Value) -> Result<(), TaskTransitionError> {
        self.guard_not_terminal()?;
        if self.status != TaskStatus::Running {
            return Err(TaskTransitionError::NotRunning {
                task_id: self.id.clone(),
            });
        }
        if let Err(violation) = self.result_type.validate(&result) {
            return Err(TaskTransitionError::InvalidResult {
                task_id: self.id.clone(),
                violation: violation.to_string(),
            });
        }
        self.status = TaskStatus::Successful;
        self.result = Some(result);
        Ok(())
    }

    pub(crate) fn mark_failed(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), TaskTransitionError> {
        self.guard_not_terminal()?;
        self.status = TaskStatus::Failed;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    pub(crate) fn mark_skipped(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), TaskTransitionError> {
        self.guard_not_terminal()?;
        self.status = TaskStatus::Skipped;
        self.failure_reason = Some(reason.into());
        Ok(())
    }

    /// Validate a candidate result without changing state.
    pub fn check_result(&self, result: &Value) -> Result<(), SchemaViolation> {
        self.result_type.validate(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_result_leaves_task_running() {
        let mut task = Task::new("t1", "reply ok", ResultSchema::Text);
        task.mark_running().expect("running");

        let err = task.mark_successful(json!(42)).unwrap_err();
        assert!(matches!(err, TaskTransitionError::InvalidResult { .. }));
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.result.is_none());

        // retry with a valid payload succeeds
        task.mark_successful(json!("42")).expect("valid retry");
        assert_eq!(task.status, TaskStatus::Successful);
        assert_eq!(task.result, Some(json!("42")));
    }

    #[test]
    fn terminal_tasks_are_immutable() {
        let mut task = Task::new("t1", "reply ok", ResultSchema::Text);
        task.mark_running().expect("running");
        task.mark_successful(json!("ok")).expect("success");

        assert!(task.mark_failed("too late").is_err());
        assert!(task.mark_skipped("too late").is_err());
        assert!(task.mark_running().is_err());
        assert_eq!(task.status, TaskStatus::Successful);
        assert_eq!(task.result, Some(json!("ok")));
    }

    #[test]
    fn success_requires_running() {
        let mut task = Task::new("t1", "reply ok", ResultSchema::Text);
        let err = task.mark_successful(json!("ok")).unwrap_err();
        assert!(matches!(err, TaskTransitionError::NotRunning { .. }));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn failure_keeps_reason_verbatim() {
        let mut task = Task::new("t1", "reply ok", ResultSchema::Text);
        task.mark_failed("boom: upstream 503").expect("failed");
        assert_eq!(task.failure_reason.as_deref(), Some("boom: upstream 503"));
        assert!(task.is_terminal());
    }

    #[test]
    fn serde_skips_runtime_tools() {
        let task = Task::new("t1", "reply ok", ResultSchema::Text)
            .with_context("ticket", json!("REL-42"));
        let raw = serde_json::to_string(&task).expect("serialize");
        let restored: Task = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(restored.id, "t1");
        assert_eq!(restored.context.get("ticket"), Some(&json!("REL-42")));
        assert!(restored.tools.is_empty());
    }
}
