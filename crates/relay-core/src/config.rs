// Orchestrator configuration
// Explicit config passed into the engine; no ambient globals

use serde::{Deserialize, Serialize};

/// Configuration for an orchestration run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum actor turns before the run gives up
    pub max_turns: u32,
    /// Maximum regular tool calls within a single turn
    pub max_tool_calls_per_turn: u32,
    /// Maximum model invocations within a single turn (tool feedback loops)
    pub max_turn_iterations: u32,
    /// Whether an assistant message with no end-turn tool call ends the turn
    pub implicit_post_ends_turn: bool,
    /// Whether dependents of a failed task are auto-failed. When off they
    /// stay pending and the run stalls instead.
    pub fail_dependents: bool,
    /// Return partial results instead of erroring when a task ends failed
    pub allow_partial_results: bool,
    /// How many facts to recall into each turn's prompt
    pub memory_recall_k: usize,
    /// How many trailing thread messages form the recall query
    pub memory_tail_messages: usize,
    /// Broadcast capacity of the run event bus
    pub event_bus_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // Generous cap; per-turn budgets bound the real cost and short
            // multi-task runs should not fail on turn count alone.
            max_turns: 32,
            max_tool_calls_per_turn: 50,
            max_turn_iterations: 25,
            implicit_post_ends_turn: true,
            fail_dependents: true,
            allow_partial_results: false,
            memory_recall_k: 6,
            memory_tail_messages: 8,
            event_bus_capacity: 2048,
        }
    }
}
