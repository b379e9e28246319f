use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use relay_memory::{Fact, MemoryRecall, ScoredFact};
use relay_observability::{emit_event, ObservabilityEvent};
use relay_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use relay_tools::{validate_tool_schemas, Tool, ToolRegistry};
use relay_types::{Message, MessageRole, RunEvent, Thread, ToolSchema};

use crate::actors::{Actor, AgentProfile, Roster};
use crate::cancellation::CancellationRegistry;
use crate::config::OrchestratorConfig;
use crate::end_turn::{self, TurnAction};
use crate::event_bus::EventBus;
use crate::scheduler::{SchedulerError, TaskScheduler};
use crate::tasks::{Task, TaskStatus, TaskTransitionError};

#[derive(Default)]
struct StreamedToolCall {
    id: String,
    name: String,
    args: String,
}

/// Outcome of one end-turn tool call: the tool-result payload and output
/// text, whether the action was applied, and an optional message (posted
/// content or a delegation note) appended after the tool exchange.
struct EndTurnEffect {
    payload: Value,
    output: String,
    applied: bool,
    post: Option<Message>,
}

impl EndTurnEffect {
    fn rejected(reason: impl std::fmt::Display) -> Self {
        Self {
            payload: json!({"error": reason.to_string()}),
            output: format!("Rejected: {reason}"),
            applied: false,
            post: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEndReason {
    /// An end-turn tool was applied
    EndTurnAction,
    /// The model answered with plain text and the implicit-post policy is on
    ImplicitPost,
    /// The per-turn regular tool budget ran out
    ToolBudgetExhausted,
    /// The per-turn model invocation cap ran out
    IterationCap,
    Cancelled,
}

/// What one actor turn did to the run.
#[derive(Debug)]
pub struct TurnOutcome {
    pub actor: String,
    pub applied: Vec<TurnAction>,
    pub tool_calls: u32,
    pub delegated_to: Option<String>,
    pub ended_by: TurnEndReason,
}

/// Final state of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    /// Result value per successful task id
    pub results: HashMap<String, Value>,
    pub turns_used: u32,
    pub thread: Thread,
    pub tasks: Vec<Task>,
}

#[derive(Debug)]
pub enum RunError {
    Graph(SchedulerError),
    /// No ready tasks, no pending delegation, not all tasks terminal
    Stalled {
        non_terminal: Vec<String>,
        partial: HashMap<String, Value>,
    },
    MaxTurnsExceeded {
        non_terminal: Vec<String>,
        partial: HashMap<String, Value>,
    },
    Cancelled {
        non_terminal: Vec<String>,
        partial: HashMap<String, Value>,
    },
    /// A task ended failed and partial results were not requested
    TaskFailed {
        task_id: String,
        reason: String,
        partial: HashMap<String, Value>,
    },
    Engine(String),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Graph(err) => write!(f, "invalid task graph: {err}"),
            Self::Stalled { non_terminal, .. } => write!(
                f,
                "run stalled with no ready tasks and no pending delegation; non-terminal: {}",
                non_terminal.join(", ")
            ),
            Self::MaxTurnsExceeded { non_terminal, .. } => write!(
                f,
                "turn budget exhausted; non-terminal: {}",
                non_terminal.join(", ")
            ),
            Self::Cancelled { non_terminal, .. } => write!(
                f,
                "run cancelled; non-terminal: {}",
                non_terminal.join(", ")
            ),
            Self::TaskFailed {
                task_id, reason, ..
            } => write!(f, "task `{task_id}` failed: {reason}"),
            Self::Engine(detail) => write!(f, "engine error: {detail}"),
        }
    }
}

impl std::error::Error for RunError {}

/// The control loop: repeatedly selects the ready task scope and the
/// responsible actor, assembles one model invocation, applies the turn's
/// effects, and re-evaluates until every task is terminal.
#[derive(Clone)]
pub struct Orchestrator {
    providers: ProviderRegistry,
    tools: ToolRegistry,
    memory: Arc<dyn MemoryRecall>,
    event_bus: EventBus,
    cancellations: CancellationRegistry,
    roster: Roster,
    default_actor: Option<String>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        providers: ProviderRegistry,
        tools: ToolRegistry,
        memory: Arc<dyn MemoryRecall>,
        config: OrchestratorConfig,
    ) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);
        Self {
            providers,
            tools,
            memory,
            event_bus,
            cancellations: CancellationRegistry::new(),
            roster: Roster::default(),
            default_actor: None,
            config,
        }
    }

    pub fn with_actors(mut self, actors: Vec<Actor>) -> Self {
        self.roster = Roster::new(actors);
        self
    }

    pub fn with_default_actor(mut self, name: impl Into<String>) -> Self {
        self.default_actor = Some(name.into());
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    /// Drive every task to a terminal state. Returns the per-task results,
    /// or a `RunError` carrying whatever partial results exist.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        thread: Option<Thread>,
    ) -> Result<RunReport, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let cancel = self.cancellations.create(&run_id).await;
        let outcome = self.run_inner(&run_id, tasks, thread, cancel).await;
        self.cancellations.remove(&run_id).await;
        outcome
    }

    /// Blocking form of [`run`](Self::run) for synchronous callers.
    pub fn run_blocking(
        &self,
        tasks: Vec<Task>,
        thread: Option<Thread>,
    ) -> Result<RunReport, RunError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| RunError::Engine(err.to_string()))?;
        runtime.block_on(self.run(tasks, thread))
    }

    /// Blocking form of [`run_once`](Self::run_once).
    pub fn run_once_blocking(
        &self,
        tasks: &mut [Task],
        thread: &mut Thread,
        next_actor: Option<String>,
    ) -> Result<TurnOutcome, RunError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| RunError::Engine(err.to_string()))?;
        runtime.block_on(self.run_once(tasks, thread, next_actor))
    }

    async fn run_inner(
        &self,
        run_id: &str,
        mut tasks: Vec<Task>,
        thread: Option<Thread>,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunError> {
        TaskScheduler::validate(&tasks).map_err(RunError::Graph)?;
        let mut thread = thread.unwrap_or_default();
        self.event_bus.publish(RunEvent::new(
            "run.status",
            json!({"runID": run_id, "threadID": thread.id, "status": "running"}),
        ));

        let mut turns_used = 0u32;
        let mut next_actor: Option<String> = None;

        loop {
            self.apply_failure_propagation(run_id, &mut tasks);
            if TaskScheduler::all_terminal(&tasks) {
                break;
            }
            if cancel.is_cancelled() {
                self.event_bus.publish(RunEvent::new(
                    "run.status",
                    json!({"runID": run_id, "status": "cancelled"}),
                ));
                return Err(RunError::Cancelled {
                    non_terminal: non_terminal_ids(&tasks),
                    partial: collect_results(&tasks),
                });
            }
            if turns_used >= self.config.max_turns {
                self.event_bus.publish(RunEvent::new(
                    "run.status",
                    json!({"runID": run_id, "status": "failed", "reason": "max_turns"}),
                ));
                return Err(RunError::MaxTurnsExceeded {
                    non_terminal: non_terminal_ids(&tasks),
                    partial: collect_results(&tasks),
                });
            }
            let has_ready = TaskScheduler::next_ready(&tasks).is_some();
            let has_running = tasks.iter().any(|t| t.status == TaskStatus::Running);
            if !has_ready && !has_running && next_actor.is_none() {
                self.event_bus.publish(RunEvent::new(
                    "run.status",
                    json!({"runID": run_id, "status": "failed", "reason": "stalled"}),
                ));
                return Err(RunError::Stalled {
                    non_terminal: non_terminal_ids(&tasks),
                    partial: collect_results(&tasks),
                });
            }

            turns_used += 1;
            let outcome = match self
                .turn(
                    run_id,
                    turns_used,
                    &mut tasks,
                    &mut thread,
                    next_actor.take(),
                    cancel.clone(),
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.event_bus.publish(RunEvent::new(
                        "run.error",
                        json!({"runID": run_id, "turn": turns_used, "detail": err.to_string()}),
                    ));
                    return Err(err);
                }
            };
            next_actor = outcome.delegated_to;
        }

        let results = collect_results(&tasks);
        if !self.config.allow_partial_results {
            if let Some(failed) = tasks.iter().find(|t| t.status == TaskStatus::Failed) {
                return Err(RunError::TaskFailed {
                    task_id: failed.id.clone(),
                    reason: failed.failure_reason.clone().unwrap_or_default(),
                    partial: results,
                });
            }
        }
        self.event_bus.publish(RunEvent::new(
            "run.status",
            json!({"runID": run_id, "status": "completed", "turns": turns_used}),
        ));
        Ok(RunReport {
            run_id: run_id.to_string(),
            results,
            turns_used,
            thread,
            tasks,
        })
    }

    /// Execute exactly one actor turn against the given tasks and thread.
    /// `next_actor` is a pending delegation from a previous turn; the
    /// returned outcome's `delegated_to` must be threaded into the next call.
    pub async fn run_once(
        &self,
        tasks: &mut [Task],
        thread: &mut Thread,
        next_actor: Option<String>,
    ) -> Result<TurnOutcome, RunError> {
        let run_id = Uuid::new_v4().to_string();
        let cancel = self.cancellations.create(&run_id).await;
        self.apply_failure_propagation(&run_id, tasks);
        let outcome = self
            .turn(&run_id, 1, tasks, thread, next_actor, cancel)
            .await;
        self.cancellations.remove(&run_id).await;
        outcome
    }

    fn apply_failure_propagation(&self, run_id: &str, tasks: &mut [Task]) {
        if !self.config.fail_dependents {
            return;
        }
        for (task_id, reason) in TaskScheduler::propagate_failures(tasks) {
            self.event_bus.publish(RunEvent::new(
                "task.status",
                json!({
                    "runID": run_id,
                    "taskID": task_id,
                    "status": "failed",
                    "reason": reason
                }),
            ));
        }
    }

    /// Whether `task` belongs to the scope of the agent taking this turn.
    fn task_in_scope(&self, task: &Task, agent_name: &str) -> bool {
        match task.assigned_actor.as_deref() {
            None => true,
            Some(assigned) => {
                assigned == agent_name
                    || self
                        .roster
                        .actors
                        .iter()
                        .any(|a| a.name() == assigned && a.contains(agent_name))
            }
        }
    }

    fn select_agent(
        &self,
        tasks: &[Task],
        next_actor: Option<String>,
    ) -> Option<AgentProfile> {
        let name = next_actor.or_else(|| {
            TaskScheduler::next_ready(tasks)
                .and_then(|t| t.assigned_actor.clone())
                .or_else(|| {
                    tasks
                        .iter()
                        .find(|t| t.status == TaskStatus::Running)
                        .and_then(|t| t.assigned_actor.clone())
                })
                .or_else(|| self.default_actor.clone())
        })?;
        Some(
            self.roster
                .resolve_agent(&name)
                .cloned()
                .unwrap_or_else(|| AgentProfile::new(name)),
        )
    }

    async fn turn(
        &self,
        run_id: &str,
        turn_no: u32,
        tasks: &mut [Task],
        thread: &mut Thread,
        next_actor: Option<String>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, RunError> {
        let Some(agent) = self.select_agent(tasks, next_actor) else {
            return Err(RunError::Stalled {
                non_terminal: non_terminal_ids(tasks),
                partial: collect_results(tasks),
            });
        };

        // Pull ready tasks for this agent into the running scope.
        let ready_ids: Vec<String> = TaskScheduler::ready_set(tasks)
            .into_iter()
            .filter(|t| self.task_in_scope(t, &agent.name))
            .map(|t| t.id.clone())
            .collect();
        for task in tasks.iter_mut() {
            if ready_ids.contains(&task.id) && task.mark_running().is_ok() {
                self.event_bus.publish(RunEvent::new(
                    "task.status",
                    json!({"runID": run_id, "taskID": task.id, "status": "running"}),
                ));
            }
        }
        let scope_ids: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running && self.task_in_scope(t, &agent.name))
            .map(|t| t.id.clone())
            .collect();

        self.event_bus.publish(RunEvent::new(
            "turn.started",
            json!({
                "runID": run_id,
                "turn": turn_no,
                "actor": agent.name,
                "scope": scope_ids
            }),
        ));

        let memories = self.recall_for_turn(thread).await;
        let (system_prompt, tool_schemas, task_tools) = {
            let scope: Vec<&Task> = tasks
                .iter()
                .filter(|t| scope_ids.contains(&t.id))
                .collect();
            let system_prompt = compose_system_prompt(&agent, &scope, &memories, turn_no);
            let delegate_targets = self.roster.delegate_targets(&agent.name);

            let mut tool_schemas: Vec<ToolSchema> = self
                .tools
                .list()
                .await
                .into_iter()
                .filter(|s| agent.can_use_tool(&s.name))
                .collect();
            let mut task_tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
            for task in &scope {
                for tool in &task.tools {
                    let schema = tool.schema();
                    if !tool_schemas.iter().any(|s| s.name == schema.name) {
                        tool_schemas.push(schema.clone());
                    }
                    task_tools.insert(schema.name, tool.clone());
                }
            }
            tool_schemas.extend(end_turn::schemas(&scope, &delegate_targets));
            (system_prompt, tool_schemas, task_tools)
        };
        if let Err(validation_err) = validate_tool_schemas(&tool_schemas) {
            return Err(RunError::Engine(validation_err.to_string()));
        }

        thread.lock();
        let outcome = self
            .drive_turn(
                run_id,
                turn_no,
                &agent,
                tasks,
                thread,
                &scope_ids,
                system_prompt,
                tool_schemas,
                task_tools,
                cancel,
            )
            .await;
        thread.unlock();

        if let Ok(outcome) = &outcome {
            self.event_bus.publish(RunEvent::new(
                "turn.finished",
                json!({
                    "runID": run_id,
                    "turn": turn_no,
                    "actor": outcome.actor,
                    "toolCalls": outcome.tool_calls,
                    "delegatedTo": outcome.delegated_to,
                }),
            ));
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_turn(
        &self,
        run_id: &str,
        turn_no: u32,
        agent: &AgentProfile,
        tasks: &mut [Task],
        thread: &mut Thread,
        scope_ids: &[String],
        system_prompt: String,
        tool_schemas: Vec<ToolSchema>,
        task_tools: HashMap<String, Arc<dyn Tool>>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, RunError> {
        let mut applied: Vec<TurnAction> = Vec::new();
        let mut delegated_to: Option<String> = None;
        let mut tool_calls_used = 0u32;
        let mut ended_by: Option<TurnEndReason> = None;
        let mut followup: Option<String> = None;
        let mut signature_cache: HashMap<String, String> = HashMap::new();
        let mut last_completion = String::new();

        let mut iterations = 0u32;
        while iterations < self.config.max_turn_iterations {
            iterations += 1;
            if cancel.is_cancelled() {
                ended_by = Some(TurnEndReason::Cancelled);
                break;
            }

            let mut messages = vec![ChatMessage::new("system", system_prompt.clone())];
            messages.extend(chat_history(thread));
            if let Some(extra) = followup.take() {
                messages.push(ChatMessage::new("user", extra));
            }

            emit_event(
                Level::INFO,
                ObservabilityEvent {
                    event: "provider.call.start",
                    component: "engine.loop",
                    run_id: Some(run_id),
                    thread_id: Some(&thread.id),
                    turn: Some(turn_no),
                    task_id: None,
                    actor: Some(&agent.name),
                    status: Some("start"),
                    error_code: None,
                    detail: None,
                },
            );
            let mut stream = self
                .providers
                .stream_for(
                    None,
                    messages,
                    agent.model.as_deref(),
                    Some(tool_schemas.clone()),
                    cancel.clone(),
                )
                .await
                .map_err(|err| {
                    let detail = truncate_text(&err.to_string(), 500);
                    emit_event(
                        Level::ERROR,
                        ObservabilityEvent {
                            event: "provider.call.error",
                            component: "engine.loop",
                            run_id: Some(run_id),
                            thread_id: Some(&thread.id),
                            turn: Some(turn_no),
                            task_id: None,
                            actor: Some(&agent.name),
                            status: Some("failed"),
                            error_code: Some("PROVIDER_CALL"),
                            detail: Some(&detail),
                        },
                    );
                    RunError::Engine(detail)
                })?;

            let mut completion = String::new();
            let mut calls: Vec<StreamedToolCall> = Vec::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|err| {
                    RunError::Engine(format!("provider stream chunk error: {err}"))
                })?;
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        completion.push_str(&delta);
                        self.event_bus.publish(RunEvent::new(
                            "message.part.updated",
                            json!({
                                "runID": run_id,
                                "threadID": thread.id,
                                "actor": agent.name,
                                "delta": truncate_text(&delta, 4_000)
                            }),
                        ));
                    }
                    StreamChunk::ToolCallStart { id, name } => {
                        let entry = upsert_call(&mut calls, &id);
                        if entry.name.is_empty() {
                            entry.name = name;
                        }
                    }
                    StreamChunk::ToolCallDelta { id, args_delta } => {
                        upsert_call(&mut calls, &id).args.push_str(&args_delta);
                    }
                    StreamChunk::ToolCallEnd { id: _ } => {}
                    StreamChunk::Done { .. } => break,
                }
                if cancel.is_cancelled() {
                    break;
                }
            }

            if !completion.trim().is_empty() {
                last_completion = completion.clone();
                self.append_message(
                    run_id,
                    thread,
                    Message::actor(agent.name.as_str(), completion.as_str()),
                )?;
            }

            calls.retain(|c| !c.name.trim().is_empty());
            if calls.is_empty() {
                if completion.trim().is_empty() || self.config.implicit_post_ends_turn {
                    ended_by = Some(TurnEndReason::ImplicitPost);
                } else {
                    followup = Some(
                        "Finish the turn with an end-turn tool: mark_task_successful, \
mark_task_failed, mark_task_skipped, delegate_to_actor, or post_message."
                            .to_string(),
                    );
                    continue;
                }
                break;
            }

            let mut feedback: Vec<String> = Vec::new();
            let mut end_action_applied = false;
            for call in calls {
                if ended_by == Some(TurnEndReason::ToolBudgetExhausted) {
                    break;
                }
                if cancel.is_cancelled() {
                    ended_by = Some(TurnEndReason::Cancelled);
                    break;
                }
                let name = normalize_tool_name(&call.name);
                let args = parse_streamed_args(&call.args);
                let call_id = if call.id.trim().is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    call.id.clone()
                };

                if end_turn::is_end_turn_tool(&name) {
                    self.append_message(
                        run_id,
                        thread,
                        Message::tool_call(
                            agent.name.as_str(),
                            call_id.as_str(),
                            name.as_str(),
                            args.clone(),
                        ),
                    )?;
                    let effect = self.apply_end_turn(
                        run_id,
                        tasks,
                        scope_ids,
                        agent,
                        &name,
                        &args,
                        &mut applied,
                        &mut delegated_to,
                    );
                    if effect.applied {
                        end_action_applied = true;
                    } else {
                        feedback.push(effect.output.clone());
                    }
                    self.append_message(
                        run_id,
                        thread,
                        Message::tool_result(
                            call_id.as_str(),
                            name.as_str(),
                            effect.payload,
                            effect.output.as_str(),
                        ),
                    )?;
                    // A posted message or delegation note lands after the
                    // tool exchange so the result stays adjacent to its call.
                    if let Some(post) = effect.post {
                        self.append_message(run_id, thread, post)?;
                    }
                    continue;
                }

                if !task_tools.contains_key(&name) && !agent.can_use_tool(&name) {
                    feedback.push(format!(
                        "Tool `{name}` is not enabled for agent `{}`.",
                        agent.name
                    ));
                    continue;
                }

                if tool_calls_used >= self.config.max_tool_calls_per_turn {
                    ended_by = Some(TurnEndReason::ToolBudgetExhausted);
                    self.event_bus.publish(RunEvent::new(
                        "tool.budget.exhausted",
                        json!({
                            "runID": run_id,
                            "turn": turn_no,
                            "tool": name,
                            "budget": self.config.max_tool_calls_per_turn
                        }),
                    ));
                    continue;
                }
                tool_calls_used += 1;

                let signature = format!("{name}:{args}");
                let output = if let Some(cached) = signature_cache.get(&signature) {
                    cached.clone()
                } else {
                    self.event_bus.publish(RunEvent::new(
                        "tool.call.started",
                        json!({"runID": run_id, "tool": name, "actor": agent.name}),
                    ));
                    self.append_message(
                        run_id,
                        thread,
                        Message::tool_call(
                            agent.name.as_str(),
                            call_id.as_str(),
                            name.as_str(),
                            args.clone(),
                        ),
                    )?;
                    let executed = match task_tools.get(&name) {
                        Some(tool) => tool.execute_with_cancel(args.clone(), cancel.clone()).await,
                        None => {
                            self.tools
                                .execute_with_cancel(&name, args.clone(), cancel.clone())
                                .await
                        }
                    };
                    // Tool failures go back to the model, not up the stack.
                    let (payload, output) = match executed {
                        Ok(result) => (json!({"output": result.output}), result.output),
                        Err(err) => {
                            let detail = format!("Tool `{name}` failed: {err}");
                            (json!({"error": detail}), detail)
                        }
                    };
                    self.append_message(
                        run_id,
                        thread,
                        Message::tool_result(call_id.as_str(), name.as_str(), payload, output.as_str()),
                    )?;
                    self.event_bus.publish(RunEvent::new(
                        "tool.call.finished",
                        json!({"runID": run_id, "tool": name}),
                    ));
                    signature_cache.insert(signature, output.clone());
                    output
                };
                feedback.push(format!("`{name}` -> {}", truncate_text(&output, 2_000)));
            }

            if ended_by == Some(TurnEndReason::ToolBudgetExhausted)
                || ended_by == Some(TurnEndReason::Cancelled)
            {
                break;
            }
            if end_action_applied {
                ended_by = Some(TurnEndReason::EndTurnAction);
                break;
            }
            if !feedback.is_empty() {
                followup = Some(format!(
                    "Tool results:\n{}\nContinue, and close the turn with an end-turn tool.",
                    feedback.join("\n")
                ));
                continue;
            }
            ended_by = Some(TurnEndReason::ImplicitPost);
            break;
        }

        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "provider.call.finish",
                component: "engine.loop",
                run_id: Some(run_id),
                thread_id: Some(&thread.id),
                turn: Some(turn_no),
                task_id: None,
                actor: Some(&agent.name),
                status: Some("ok"),
                error_code: None,
                detail: None,
            },
        );

        // Write-back is fire-and-forget: a recall failure is logged, never
        // surfaced into the turn.
        if !last_completion.trim().is_empty() {
            let memory = self.memory.clone();
            let fact = Fact::new(
                format!(
                    "{} (turn {turn_no}): {}",
                    agent.name,
                    truncate_text(&last_completion, 500)
                ),
                "turn_summary",
            );
            tokio::spawn(async move {
                if let Err(err) = memory.remember(fact).await {
                    tracing::warn!(target: "relay.engine", "memory write-back failed: {err}");
                }
            });
        }

        Ok(TurnOutcome {
            actor: agent.name.clone(),
            applied,
            tool_calls: tool_calls_used,
            delegated_to,
            ended_by: ended_by.unwrap_or(TurnEndReason::IterationCap),
        })
    }

    /// Apply one end-turn tool call. A rejected action leaves every piece of
    /// run state untouched; the rejection text goes back to the model.
    #[allow(clippy::too_many_arguments)]
    fn apply_end_turn(
        &self,
        run_id: &str,
        tasks: &mut [Task],
        scope_ids: &[String],
        agent: &AgentProfile,
        name: &str,
        args: &Value,
        applied: &mut Vec<TurnAction>,
        delegated_to: &mut Option<String>,
    ) -> EndTurnEffect {
        let action = match end_turn::parse(name, args) {
            Ok(action) => action,
            Err(err) => return EndTurnEffect::rejected(err.to_string()),
        };

        let mut post = None;
        let outcome = match &action {
            TurnAction::MarkSuccessful { task_id, result } => {
                self.transition_task(run_id, tasks, scope_ids, task_id, |task| {
                    task.mark_successful(result.clone())
                })
            }
            TurnAction::MarkFailed { task_id, reason } => {
                self.transition_task(run_id, tasks, scope_ids, task_id, |task| {
                    task.mark_failed(reason.clone())
                })
            }
            TurnAction::MarkSkipped { task_id, reason } => {
                self.transition_task(run_id, tasks, scope_ids, task_id, |task| {
                    task.mark_skipped(reason.clone())
                })
            }
            TurnAction::Delegate { actor_id, note } => {
                if !self.roster.delegation_allowed(&agent.name, actor_id) {
                    Err(format!(
                        "`{actor_id}` is not a member of any team shared with `{}`",
                        agent.name
                    ))
                } else {
                    if let Some(note) = note {
                        post = Some(Message::actor(agent.name.as_str(), note.as_str()));
                    }
                    *delegated_to = Some(actor_id.clone());
                    self.event_bus.publish(RunEvent::new(
                        "delegation.requested",
                        json!({"runID": run_id, "from": agent.name, "to": actor_id}),
                    ));
                    Ok(format!("Next turn handed to `{actor_id}`."))
                }
            }
            TurnAction::Post { content } => {
                post = Some(Message::actor(agent.name.as_str(), content.as_str()));
                Ok("Message posted.".to_string())
            }
        };

        match outcome {
            Ok(output) => {
                applied.push(action);
                EndTurnEffect {
                    payload: json!({"status": "ok"}),
                    output,
                    applied: true,
                    post,
                }
            }
            Err(reason) => EndTurnEffect::rejected(reason),
        }
    }

    /// Run a state transition against a task in the acting agent's scope.
    fn transition_task(
        &self,
        run_id: &str,
        tasks: &mut [Task],
        scope_ids: &[String],
        task_id: &str,
        transition: impl FnOnce(&mut Task) -> Result<(), TaskTransitionError>,
    ) -> Result<String, String> {
        let Some(task) = tasks.iter_mut().find(|t| t.id == task_id) else {
            return Err(format!("unknown task `{task_id}`"));
        };
        if !scope_ids.contains(&task.id) {
            return Err(format!("task `{task_id}` is not in your scope"));
        }
        transition(task).map_err(|err| err.to_string())?;
        let status = serde_json::to_value(task.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.event_bus.publish(RunEvent::new(
            "task.status",
            json!({
                "runID": run_id,
                "taskID": task_id,
                "status": status,
                "result": task.result,
                "reason": task.failure_reason
            }),
        ));
        Ok(format!("Task `{task_id}` marked {status}."))
    }

    fn append_message(
        &self,
        run_id: &str,
        thread: &mut Thread,
        message: Message,
    ) -> Result<(), RunError> {
        let preview = json!({
            "runID": run_id,
            "threadID": thread.id,
            "messageID": message.id,
            "role": message.role,
            "actor": message.actor_id,
            "tool": message.tool_name,
        });
        thread
            .append(message)
            .map_err(|err| RunError::Engine(err.to_string()))?;
        self.event_bus.publish(RunEvent::new("message.appended", preview));
        Ok(())
    }

    async fn recall_for_turn(&self, thread: &Thread) -> Vec<ScoredFact> {
        let query = thread
            .tail(self.config.memory_tail_messages)
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if query.trim().is_empty() {
            return Vec::new();
        }
        match self.memory.query(&query, self.config.memory_recall_k).await {
            Ok(hits) => hits,
            Err(err) => {
                tracing::warn!(target: "relay.engine", "memory recall failed: {err}");
                Vec::new()
            }
        }
    }
}

fn upsert_call<'a>(calls: &'a mut Vec<StreamedToolCall>, id: &str) -> &'a mut StreamedToolCall {
    if let Some(pos) = calls.iter().position(|c| c.id == id) {
        &mut calls[pos]
    } else {
        calls.push(StreamedToolCall {
            id: id.to_string(),
            ..Default::default()
        });
        calls.last_mut().expect("call just pushed")
    }
}

fn normalize_tool_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn parse_streamed_args(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        let mut out: String = input.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

fn collect_results(tasks: &[Task]) -> HashMap<String, Value> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Successful)
        .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
        .collect()
}

fn non_terminal_ids(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|t| !t.is_terminal())
        .map(|t| t.id.clone())
        .collect()
}

fn chat_history(thread: &Thread) -> Vec<ChatMessage> {
    thread
        .messages
        .iter()
        .map(|m| match m.role {
            MessageRole::User => ChatMessage::new("user", m.content.as_str()),
            MessageRole::System => ChatMessage::new("system", m.content.as_str()),
            MessageRole::Actor => match &m.actor_id {
                Some(actor) => ChatMessage::new("assistant", format!("[{actor}] {}", m.content)),
                None => ChatMessage::new("assistant", m.content.as_str()),
            },
            MessageRole::ToolCall => ChatMessage::new(
                "assistant",
                format!(
                    "[tool call {} {}]",
                    m.tool_name.as_deref().unwrap_or("unknown"),
                    m.tool_args.clone().unwrap_or(Value::Null)
                ),
            ),
            MessageRole::ToolResult => ChatMessage::new(
                "tool",
                format!(
                    "[{}] {}",
                    m.tool_name.as_deref().unwrap_or("unknown"),
                    m.content
                ),
            ),
        })
        .collect()
}

fn compose_system_prompt(
    agent: &AgentProfile,
    scope: &[&Task],
    memories: &[ScoredFact],
    turn_no: u32,
) -> String {
    let mut sections = Vec::new();
    if let Some(instructions) = &agent.instructions {
        sections.push(instructions.clone());
    }
    sections.push(format!(
        "You are `{}`, taking turn {turn_no} of an orchestrated run at {}.",
        agent.name,
        chrono::Utc::now().to_rfc3339()
    ));
    if !scope.is_empty() {
        let mut block = String::from("## Tasks in your scope\n");
        for task in scope {
            block.push_str(&format!(
                "- `{}` (result: {}): {}\n",
                task.id,
                task.result_type.describe(),
                task.objective
            ));
            for (key, value) in &task.context {
                block.push_str(&format!("  - context `{key}`: {value}\n"));
            }
        }
        block.push_str(
            "Resolve tasks with the mark_task_* tools; a result must match the declared result type.",
        );
        sections.push(block);
    }
    if !memories.is_empty() {
        let mut block = String::from("## Relevant memory\n");
        for hit in memories {
            block.push_str(&format!("- {}\n", hit.fact.content));
        }
        sections.push(block);
    }
    sections.join("\n\n")
}
