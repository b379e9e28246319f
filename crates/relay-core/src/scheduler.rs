// Task scheduler
// Ready-set computation with dependency resolution and failure propagation

use std::collections::{HashMap, HashSet};

use crate::tasks::{Task, TaskStatus};

pub struct TaskScheduler;

impl TaskScheduler {
    /// Tasks whose dependencies are all successful or skipped, in
    /// declaration order. Declaration order is the tie-break when several
    /// tasks are ready at once.
    pub fn ready_set(tasks: &[Task]) -> Vec<&Task> {
        let satisfied: HashSet<&str> = tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Successful | TaskStatus::Skipped))
            .map(|t| t.id.as_str())
            .collect();

        tasks
            .iter()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && task
                        .depends_on
                        .iter()
                        .all(|dep| satisfied.contains(dep.as_str()))
            })
            .collect()
    }

    /// First ready task, if any.
    pub fn next_ready(tasks: &[Task]) -> Option<&Task> {
        Self::ready_set(tasks).into_iter().next()
    }

    pub fn all_terminal(tasks: &[Task]) -> bool {
        tasks.iter().all(|t| t.is_terminal())
    }

    pub fn any_failed(tasks: &[Task]) -> bool {
        tasks.iter().any(|t| t.status == TaskStatus::Failed)
    }

    /// Fail every pending task that depends on a failed task, transitively.
    /// Returns the (task id, reason) pairs applied.
    pub fn propagate_failures(tasks: &mut [Task]) -> Vec<(String, String)> {
        let mut applied = Vec::new();
        loop {
            let failed: HashMap<String, String> = tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Failed)
                .map(|t| {
                    (
                        t.id.clone(),
                        t.failure_reason.clone().unwrap_or_default(),
                    )
                })
                .collect();

            let mut changed = false;
            for task in tasks.iter_mut() {
                if task.status != TaskStatus::Pending {
                    continue;
                }
                let Some(dep) = task.depends_on.iter().find(|d| failed.contains_key(*d)) else {
                    continue;
                };
                let reason = format!(
                    "dependency `{dep}` failed: {}",
                    failed.get(dep).map(String::as_str).unwrap_or("")
                );
                if task.mark_failed(reason.clone()).is_ok() {
                    applied.push((task.id.clone(), reason));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        applied
    }

    /// Detect cycles in task dependencies
    pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<String>> {
        let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        for task in tasks {
            let mut visited = HashSet::new();
            let mut path = Vec::new();

            if Self::dfs_cycle(&task.id, &task_map, &mut visited, &mut path) {
                return Some(path);
            }
        }

        None
    }

    fn dfs_cycle(
        task_id: &str,
        task_map: &HashMap<&str, &Task>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> bool {
        if path.contains(&task_id.to_string()) {
            path.push(task_id.to_string());
            return true;
        }

        if visited.contains(task_id) {
            return false;
        }

        visited.insert(task_id.to_string());
        path.push(task_id.to_string());

        if let Some(task) = task_map.get(task_id) {
            for dep in &task.depends_on {
                if Self::dfs_cycle(dep, task_map, visited, path) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Validate task graph structure
    pub fn validate(tasks: &[Task]) -> Result<(), SchedulerError> {
        if tasks.is_empty() {
            return Err(SchedulerError::EmptyTaskList);
        }

        let task_ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();

        if task_ids.len() != tasks.len() {
            return Err(SchedulerError::DuplicateTaskId);
        }

        for task in tasks {
            for dep in &task.depends_on {
                if !task_ids.contains(dep.as_str()) {
                    return Err(SchedulerError::InvalidDependency {
                        task_id: task.id.clone(),
                        dependency_id: dep.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = Self::detect_cycle(tasks) {
            return Err(SchedulerError::CycleDetected { path: cycle });
        }

        Ok(())
    }

    /// Get task progress summary
    pub fn progress(tasks: &[Task]) -> TaskProgress {
        let mut progress = TaskProgress::default();

        for task in tasks {
            match task.status {
                TaskStatus::Pending => progress.pending += 1,
                TaskStatus::Running => progress.running += 1,
                TaskStatus::Successful => progress.successful += 1,
                TaskStatus::Failed => progress.failed += 1,
                TaskStatus::Skipped => progress.skipped += 1,
            }
        }

        progress.total = tasks.len();
        progress
    }
}

/// Scheduler validation errors
#[derive(Debug, Clone)]
pub enum SchedulerError {
    EmptyTaskList,
    DuplicateTaskId,
    InvalidDependency {
        task_id: String,
        dependency_id: String,
    },
    CycleDetected {
        path: Vec<String>,
    },
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTaskList => write!(f, "Task list is empty"),
            Self::DuplicateTaskId => write!(f, "Duplicate task ID found"),
            Self::InvalidDependency {
                task_id,
                dependency_id,
            } => {
                write!(
                    f,
                    "Task '{}' has invalid dependency '{}'",
                    task_id, dependency_id
                )
            }
            Self::CycleDetected { path } => {
                write!(f, "Cycle detected in task graph: {}", path.join(" -> "))
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Task progress summary
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TaskProgress {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl TaskProgress {
    pub fn completion_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.successful + self.skipped) as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::ResultSchema;

    fn make_task(id: &str, deps: Vec<&str>, status: TaskStatus) -> Task {
        let mut task = Task::new(id, format!("Task {id}"), ResultSchema::Text)
            .with_dependencies(deps);
        task.status = status;
        if status == TaskStatus::Failed {
            task.failure_reason = Some("boom".to_string());
        }
        task
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Successful),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
        ];

        let ready = TaskScheduler::ready_set(&tasks);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "2");
    }

    #[test]
    fn skipped_dependency_counts_as_satisfied() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Skipped),
            make_task("2", vec!["1"], TaskStatus::Pending),
        ];
        assert_eq!(TaskScheduler::next_ready(&tasks).expect("ready").id, "2");
    }

    #[test]
    fn declaration_order_breaks_ties() {
        let tasks = vec![
            make_task("b", vec![], TaskStatus::Pending),
            make_task("a", vec![], TaskStatus::Pending),
        ];
        assert_eq!(TaskScheduler::next_ready(&tasks).expect("ready").id, "b");
    }

    #[test]
    fn propagation_fails_dependents_transitively() {
        let mut tasks = vec![
            make_task("1", vec![], TaskStatus::Failed),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
            make_task("4", vec![], TaskStatus::Pending),
        ];

        let applied = TaskScheduler::propagate_failures(&mut tasks);

        assert_eq!(applied.len(), 2);
        assert_eq!(tasks[1].status, TaskStatus::Failed);
        assert!(tasks[1]
            .failure_reason
            .as_deref()
            .expect("reason")
            .contains("dependency `1` failed: boom"));
        assert_eq!(tasks[2].status, TaskStatus::Failed);
        assert_eq!(tasks[3].status, TaskStatus::Pending);
    }

    #[test]
    fn detect_cycle_finds_loops() {
        let tasks_no_cycle = vec![
            make_task("1", vec![], TaskStatus::Pending),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
        ];
        assert!(TaskScheduler::detect_cycle(&tasks_no_cycle).is_none());

        // Cycle: 1 -> 2 -> 3 -> 1
        let tasks_cycle = vec![
            make_task("1", vec!["3"], TaskStatus::Pending),
            make_task("2", vec!["1"], TaskStatus::Pending),
            make_task("3", vec!["2"], TaskStatus::Pending),
        ];
        assert!(TaskScheduler::detect_cycle(&tasks_cycle).is_some());
    }

    #[test]
    fn validate_rejects_bad_graphs() {
        let valid_tasks = vec![
            make_task("1", vec![], TaskStatus::Pending),
            make_task("2", vec!["1"], TaskStatus::Pending),
        ];
        assert!(TaskScheduler::validate(&valid_tasks).is_ok());

        let empty_tasks: Vec<Task> = vec![];
        assert!(matches!(
            TaskScheduler::validate(&empty_tasks),
            Err(SchedulerError::EmptyTaskList)
        ));

        let invalid_dep = vec![make_task("1", vec!["nonexistent"], TaskStatus::Pending)];
        assert!(matches!(
            TaskScheduler::validate(&invalid_dep),
            Err(SchedulerError::InvalidDependency { .. })
        ));

        let duplicate = vec![
            make_task("1", vec![], TaskStatus::Pending),
            make_task("1", vec![], TaskStatus::Pending),
        ];
        assert!(matches!(
            TaskScheduler::validate(&duplicate),
            Err(SchedulerError::DuplicateTaskId)
        ));
    }

    #[test]
    fn progress_counts_states() {
        let tasks = vec![
            make_task("1", vec![], TaskStatus::Successful),
            make_task("2", vec![], TaskStatus::Skipped),
            make_task("3", vec![], TaskStatus::Pending),
            make_task("4", vec![], TaskStatus::Failed),
        ];
        let progress = TaskScheduler::progress(&tasks);
        assert_eq!(progress.total, 4);
        assert_eq!(progress.successful, 1);
        assert_eq!(progress.skipped, 1);
        assert_eq!(progress.failed, 1);
        assert!((progress.completion_fraction() - 0.5).abs() < f64::EPSILON);
    }
}
