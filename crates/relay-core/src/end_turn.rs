// End-turn tool set
// Reserved tools whose invocation mutates task state or hands off the turn

use serde_json::{json, Value};

use crate::tasks::Task;
use relay_types::ToolSchema;

pub const MARK_TASK_SUCCESSFUL: &str = "mark_task_successful";
pub const MARK_TASK_FAILED: &str = "mark_task_failed";
pub const MARK_TASK_SKIPPED: &str = "mark_task_skipped";
pub const DELEGATE_TO_ACTOR: &str = "delegate_to_actor";
pub const POST_MESSAGE: &str = "post_message";

/// Closed set of control-flow actions a model can take. The engine's
/// dispatch over this enum is exhaustive; a tool call that is not one of
/// these names is a regular tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    MarkSuccessful { task_id: String, result: Value },
    MarkFailed { task_id: String, reason: String },
    MarkSkipped { task_id: String, reason: String },
    Delegate { actor_id: String, note: Option<String> },
    Post { content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndTurnArgError {
    pub tool: String,
    pub reason: String,
}

impl std::fmt::Display for EndTurnArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid `{}` arguments: {}", self.tool, self.reason)
    }
}

impl std::error::Error for EndTurnArgError {}

fn arg_error(tool: &str, reason: impl Into<String>) -> EndTurnArgError {
    EndTurnArgError {
        tool: tool.to_string(),
        reason: reason.into(),
    }
}

pub fn is_end_turn_tool(name: &str) -> bool {
    matches!(
        name,
        MARK_TASK_SUCCESSFUL | MARK_TASK_FAILED | MARK_TASK_SKIPPED | DELEGATE_TO_ACTOR
            | POST_MESSAGE
    )
}

fn required_str(tool: &str, args: &Value, key: &str) -> Result<String, EndTurnArgError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| arg_error(tool, format!("missing `{key}`")))
}

/// Interpret a call to one of the reserved tools. Callers must check
/// `is_end_turn_tool` first; unknown names are a programming error here.
pub fn parse(name: &str, args: &Value) -> Result<TurnAction, EndTurnArgError> {
    match name {
        MARK_TASK_SUCCESSFUL => {
            let task_id = required_str(name, args, "task_id")?;
            let result = args
                .get("result")
                .cloned()
                .ok_or_else(|| arg_error(name, "missing `result`"))?;
            Ok(TurnAction::MarkSuccessful { task_id, result })
        }
        MARK_TASK_FAILED => Ok(TurnAction::MarkFailed {
            task_id: required_str(name, args, "task_id")?,
            reason: required_str(name, args, "reason")?,
        }),
        MARK_TASK_SKIPPED => Ok(TurnAction::MarkSkipped {
            task_id: required_str(name, args, "task_id")?,
            reason: required_str(name, args, "reason")?,
        }),
        DELEGATE_TO_ACTOR => Ok(TurnAction::Delegate {
            actor_id: required_str(name, args, "actor_id")?,
            note: args
                .get("note")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }),
        POST_MESSAGE => Ok(TurnAction::Post {
            content: required_str(name, args, "content")?,
        }),
        other => Err(arg_error(other, "not an end-turn tool")),
    }
}

/// Build the end-turn tool schemas offered for one turn, scoped to the tasks
/// in the acting agent's scope and to the delegation targets its team
/// membership allows.
pub fn schemas(in_scope: &[&Task], delegate_targets: &[String]) -> Vec<ToolSchema> {
    let mut schemas = Vec::new();
    if !in_scope.is_empty() {
        let task_ids: Vec<&str> = in_scope.iter().map(|t| t.id.as_str()).collect();
        let result_types = in_scope
            .iter()
            .map(|t| format!("{}: {}", t.id, t.result_type.describe()))
            .collect::<Vec<_>>()
            .join("; ");
        // With one task in scope the result parameter can carry its exact
        // schema; with several, the description names the type per task.
        let result_schema = match in_scope {
            [only] => only.result_type.input_schema_fragment(),
            _ => json!({}),
        };

        schemas.push(ToolSchema {
            name: MARK_TASK_SUCCESSFUL.to_string(),
            description: format!(
                "Mark a task successful with its result value. Result types - {result_types}."
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "enum": task_ids},
                    "result": result_schema
                },
                "required": ["task_id", "result"]
            }),
        });
        schemas.push(ToolSchema {
            name: MARK_TASK_FAILED.to_string(),
            description: "Mark a task failed with a reason.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "enum": task_ids},
                    "reason": {"type": "string"}
                },
                "required": ["task_id", "reason"]
            }),
        });
        schemas.push(ToolSchema {
            name: MARK_TASK_SKIPPED.to_string(),
            description: "Mark a task skipped when it is no longer relevant.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {"type": "string", "enum": task_ids},
                    "reason": {"type": "string"}
                },
                "required": ["task_id", "reason"]
            }),
        });
    }
    if !delegate_targets.is_empty() {
        schemas.push(ToolSchema {
            name: DELEGATE_TO_ACTOR.to_string(),
            description: "Hand the next turn to another team member.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "actor_id": {"type": "string", "enum": delegate_targets},
                    "note": {"type": "string"}
                },
                "required": ["actor_id"]
            }),
        });
    }
    schemas.push(ToolSchema {
        name: POST_MESSAGE.to_string(),
        description: "Post a plain message to the thread and end the turn.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "content": {"type": "string"}
            },
            "required": ["content"]
        }),
    });
    schemas
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ResultSchema;

    #[test]
    fn parses_each_reserved_tool() {
        let action = parse(
            MARK_TASK_SUCCESSFUL,
            &json!({"task_id": "t1", "result": "ok"}),
        )
        .expect("parse");
        assert_eq!(
            action,
            TurnAction::MarkSuccessful {
                task_id: "t1".to_string(),
                result: json!("ok")
            }
        );

        let action = parse(DELEGATE_TO_ACTOR, &json!({"actor_id": "y"})).expect("parse");
        assert_eq!(
            action,
            TurnAction::Delegate {
                actor_id: "y".to_string(),
                note: None
            }
        );

        let action = parse(POST_MESSAGE, &json!({"content": "done"})).expect("parse");
        assert_eq!(
            action,
            TurnAction::Post {
                content: "done".to_string()
            }
        );
    }

    #[test]
    fn missing_arguments_are_rejected() {
        let err = parse(MARK_TASK_SUCCESSFUL, &json!({"task_id": "t1"})).unwrap_err();
        assert!(err.reason.contains("result"));

        let err = parse(MARK_TASK_FAILED, &json!({"task_id": "t1"})).unwrap_err();
        assert!(err.reason.contains("reason"));
    }

    #[test]
    fn null_result_is_still_a_result() {
        let action = parse(
            MARK_TASK_SUCCESSFUL,
            &json!({"task_id": "t1", "result": null}),
        )
        .expect("parse");
        assert!(matches!(action, TurnAction::MarkSuccessful { result, .. } if result.is_null()));
    }

    #[test]
    fn schemas_are_scoped_to_tasks_and_members() {
        let t1 = Task::new("t1", "reply", ResultSchema::Text);
        let t2 = Task::new("t2", "confirm", ResultSchema::Boolean);
        let schemas = schemas(&[&t1, &t2], &["y".to_string()]);

        let mark = schemas
            .iter()
            .find(|s| s.name == MARK_TASK_SUCCESSFUL)
            .expect("mark schema");
        let ids = mark.input_schema["properties"]["task_id"]["enum"]
            .as_array()
            .expect("enum");
        assert_eq!(ids.len(), 2);
        assert!(mark.description.contains("t2: boolean"));

        let delegate = schemas
            .iter()
            .find(|s| s.name == DELEGATE_TO_ACTOR)
            .expect("delegate schema");
        assert_eq!(
            delegate.input_schema["properties"]["actor_id"]["enum"],
            json!(["y"])
        );
    }

    #[test]
    fn single_task_scope_constrains_the_result_parameter() {
        let t1 = Task::new(
            "t1",
            "pick a color",
            ResultSchema::Labels {
                labels: vec!["red".to_string(), "green".to_string()],
            },
        );
        let schemas = schemas(&[&t1], &[]);
        let mark = schemas
            .iter()
            .find(|s| s.name == MARK_TASK_SUCCESSFUL)
            .expect("mark schema");
        assert_eq!(
            mark.input_schema["properties"]["result"],
            json!({"type": "string", "enum": ["red", "green"]})
        );
    }

    #[test]
    fn no_tasks_means_no_mark_tools() {
        let schemas = schemas(&[], &[]);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, POST_MESSAGE);
    }
}
