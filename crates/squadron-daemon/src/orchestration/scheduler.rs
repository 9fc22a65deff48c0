//! Dependency-aware, priority-ordered subtask scheduler.
//!
//! A commander decomposes its work into [`SubTask`]s that may depend on one
//! another by index. [`TaskPriorityScheduler`] validates that the dependency
//! graph is acyclic (via Kahn's algorithm), infers a priority for each
//! subtask from keywords in its title and prompt, and hands out batches of
//! ready tasks, highest priority first. Completion unlocks dependents;
//! failure skips every transitive dependent.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::{debug, info, warn};

use squadron_core::config::{PriorityKeywords, SchedulerConfig};
use squadron_core::{CommanderId, TaskComplexity, TaskPriority};

/// A unit of work as submitted by a commander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTask {
    pub title: String,
    pub prompt: String,
    /// Indices of subtasks (in the same submission) that must complete first.
    pub dependencies: Vec<usize>,
    pub complexity: TaskComplexity,
    /// Explicit priority; inferred from keywords when `None`.
    pub priority: Option<TaskPriority>,
}

impl SubTask {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: prompt.into(),
            dependencies: Vec::new(),
            complexity: TaskComplexity::default(),
            priority: None,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.dependencies.extend(dependencies);
        self
    }

    #[must_use]
    pub const fn with_complexity(mut self, complexity: TaskComplexity) -> Self {
        self.complexity = complexity;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// State of a scheduled subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies completed.
    Ready,
    Started,
    Completed,
    Failed,
    /// A dependency failed.
    Skipped,
}

impl TaskState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// A subtask as tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub index: usize,
    pub title: String,
    pub prompt: String,
    pub dependencies: Vec<usize>,
    pub priority: TaskPriority,
    pub complexity: TaskComplexity,
    pub state: TaskState,
}

/// Lifetime totals across every orchestration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Reasons a subtask graph is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Subtask {task} depends on unknown subtask {dependency}")]
    UnknownDependency { task: usize, dependency: usize },

    #[error("Subtask {task} depends on itself")]
    SelfDependency { task: usize },

    #[error("Dependency graph contains a cycle")]
    Cycle,

    #[error("Orchestration still has {active} running subtasks")]
    Busy { active: usize },
}

#[derive(Debug)]
struct Orchestration {
    tasks: Vec<ScheduledTask>,
    /// Reverse dependencies: index -> indices that depend on it.
    dependents: Vec<Vec<usize>>,
}

#[derive(Debug)]
pub struct TaskPriorityScheduler {
    keywords: PriorityKeywords,
    default_batch_size: usize,
    orchestrations: HashMap<CommanderId, Orchestration>,
    stats: SchedulerStats,
}

impl TaskPriorityScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        info!(
            default_batch_size = config.default_batch_size,
            "TaskPriorityScheduler created"
        );
        Self {
            keywords: config.keywords,
            default_batch_size: config.default_batch_size,
            orchestrations: HashMap::new(),
            stats: SchedulerStats::default(),
        }
    }

    /// Replace the orchestration of `commander_id` with `subtasks`.
    ///
    /// Returns the number of scheduled tasks. An invalid graph schedules
    /// nothing and leaves any previous orchestration in place.
    pub fn schedule_sub_tasks(
        &mut self,
        commander_id: CommanderId,
        subtasks: Vec<SubTask>,
    ) -> Result<usize, SchedulerError> {
        let mut dependency_lists: Vec<Vec<usize>> = subtasks
            .iter()
            .map(|task| {
                let mut deps = task.dependencies.clone();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        if let Err(e) = validate_dag(&dependency_lists) {
            warn!(commander_id = %commander_id, error = %e, "Rejected subtask graph");
            return Err(e);
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); subtasks.len()];
        for (index, deps) in dependency_lists.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(index);
            }
        }

        let tasks: Vec<ScheduledTask> = subtasks
            .into_iter()
            .zip(dependency_lists.iter_mut())
            .enumerate()
            .map(|(index, (task, deps))| {
                let priority = task
                    .priority
                    .unwrap_or_else(|| infer_priority(&self.keywords, &task.title, &task.prompt));
                let state = if deps.is_empty() {
                    TaskState::Ready
                } else {
                    TaskState::Pending
                };
                ScheduledTask {
                    index,
                    title: task.title,
                    prompt: task.prompt,
                    dependencies: std::mem::take(deps),
                    priority,
                    complexity: task.complexity,
                    state,
                }
            })
            .collect();

        let count = tasks.len();
        if self
            .orchestrations
            .insert(commander_id, Orchestration { tasks, dependents })
            .is_some()
        {
            debug!(commander_id = %commander_id, "Replaced previous orchestration");
        }
        self.stats.total_scheduled += count as u64;
        info!(commander_id = %commander_id, tasks = count, "Subtasks scheduled");
        Ok(count)
    }

    /// Up to `max_size` ready tasks, highest priority first, then by index.
    pub fn next_batch(&self, commander_id: CommanderId, max_size: usize) -> Vec<ScheduledTask> {
        let Some(orch) = self.orchestrations.get(&commander_id) else {
            return Vec::new();
        };
        let mut ready: Vec<&ScheduledTask> = orch
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Ready)
            .collect();
        ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.index.cmp(&b.index)));
        ready.into_iter().take(max_size).cloned().collect()
    }

    /// Move `ready -> started`. Returns `false` for any other state.
    pub fn mark_started(&mut self, commander_id: CommanderId, index: usize) -> bool {
        let Some(task) = self.task_mut(commander_id, index) else {
            return false;
        };
        if task.state != TaskState::Ready {
            debug!(commander_id = %commander_id, task_index = index, state = ?task.state, "mark_started ignored");
            return false;
        }
        task.state = TaskState::Started;
        true
    }

    /// Move `started -> completed` and unlock dependents.
    ///
    /// Returns the indices that became ready, ascending.
    pub fn mark_completed(&mut self, commander_id: CommanderId, index: usize) -> Vec<usize> {
        let Some(orch) = self.orchestrations.get_mut(&commander_id) else {
            return Vec::new();
        };
        match orch.tasks.get_mut(index) {
            Some(task) if task.state == TaskState::Started => task.state = TaskState::Completed,
            _ => {
                debug!(commander_id = %commander_id, task_index = index, "mark_completed ignored");
                return Vec::new();
            }
        }
        self.stats.completed += 1;

        let mut newly_ready = Vec::new();
        for &dependent in &orch.dependents[index] {
            let unlocked = orch.tasks[dependent].state == TaskState::Pending
                && orch.tasks[dependent]
                    .dependencies
                    .iter()
                    .all(|&dep| orch.tasks[dep].state == TaskState::Completed);
            if unlocked {
                orch.tasks[dependent].state = TaskState::Ready;
                newly_ready.push(dependent);
            }
        }
        newly_ready.sort_unstable();
        debug!(
            commander_id = %commander_id,
            task_index = index,
            newly_ready = newly_ready.len(),
            "Subtask completed"
        );
        newly_ready
    }

    /// Move `started -> failed` and skip every transitive dependent that has
    /// not run.
    ///
    /// Returns the skipped indices, ascending.
    pub fn mark_failed(&mut self, commander_id: CommanderId, index: usize) -> Vec<usize> {
        let Some(orch) = self.orchestrations.get_mut(&commander_id) else {
            return Vec::new();
        };
        match orch.tasks.get_mut(index) {
            Some(task) if task.state == TaskState::Started => task.state = TaskState::Failed,
            _ => {
                debug!(commander_id = %commander_id, task_index = index, "mark_failed ignored");
                return Vec::new();
            }
        }
        self.stats.failed += 1;

        // Cascade: BFS through dependents
        let mut skipped = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut queue: VecDeque<usize> = orch.dependents[index].iter().copied().collect();
        while let Some(dependent) = queue.pop_front() {
            if !visited.insert(dependent) {
                continue;
            }
            let task = &mut orch.tasks[dependent];
            if matches!(task.state, TaskState::Pending | TaskState::Ready) {
                task.state = TaskState::Skipped;
                skipped.push(dependent);
            }
            queue.extend(orch.dependents[dependent].iter().copied());
        }
        skipped.sort_unstable();
        self.stats.skipped += skipped.len() as u64;

        info!(
            commander_id = %commander_id,
            task_index = index,
            skipped = skipped.len(),
            "Subtask failed"
        );
        skipped
    }

    /// Every task is completed, failed or skipped.
    ///
    /// Vacuously true for an unknown commander or an empty orchestration.
    pub fn is_orchestration_done(&self, commander_id: CommanderId) -> bool {
        self.orchestrations
            .get(&commander_id)
            .is_none_or(|orch| orch.tasks.iter().all(|t| t.state.is_terminal()))
    }

    /// Every task completed successfully. False for an unknown commander.
    pub fn all_completed(&self, commander_id: CommanderId) -> bool {
        self.orchestrations.get(&commander_id).is_some_and(|orch| {
            orch.tasks
                .iter()
                .all(|t| t.state == TaskState::Completed)
        })
    }

    /// Override the priority of one task. Returns `false` if it is unknown.
    pub fn adjust_priority(
        &mut self,
        commander_id: CommanderId,
        index: usize,
        priority: TaskPriority,
    ) -> bool {
        let Some(task) = self.task_mut(commander_id, index) else {
            return false;
        };
        task.priority = priority;
        true
    }

    pub fn state_distribution(&self, commander_id: CommanderId) -> BTreeMap<TaskState, usize> {
        let mut counts = BTreeMap::new();
        if let Some(orch) = self.orchestrations.get(&commander_id) {
            for task in &orch.tasks {
                *counts.entry(task.state).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Forget the orchestration of `commander_id`. Returns `false` if none.
    pub fn remove_orchestration(&mut self, commander_id: CommanderId) -> bool {
        let removed = self.orchestrations.remove(&commander_id).is_some();
        if removed {
            debug!(commander_id = %commander_id, "Orchestration removed");
        }
        removed
    }

    pub fn task(&self, commander_id: CommanderId, index: usize) -> Option<ScheduledTask> {
        self.orchestrations
            .get(&commander_id)
            .and_then(|orch| orch.tasks.get(index))
            .cloned()
    }

    pub const fn stats(&self) -> SchedulerStats {
        self.stats
    }

    pub fn orchestration_count(&self) -> usize {
        self.orchestrations.len()
    }

    pub const fn default_batch_size(&self) -> usize {
        self.default_batch_size
    }

    fn task_mut(&mut self, commander_id: CommanderId, index: usize) -> Option<&mut ScheduledTask> {
        self.orchestrations
            .get_mut(&commander_id)
            .and_then(|orch| orch.tasks.get_mut(index))
    }
}

/// Infer a priority from keyword tiers, checked critical first.
fn infer_priority(keywords: &PriorityKeywords, title: &str, prompt: &str) -> TaskPriority {
    let text = format!("{title} {prompt}").to_lowercase();
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let mentions = |tier: &[String]| {
        tier.iter().any(|keyword| {
            let keyword = keyword.to_lowercase();
            tokens.iter().any(|token| token.starts_with(keyword.as_str()))
        })
    };

    if mentions(&keywords.critical) {
        TaskPriority::Critical
    } else if mentions(&keywords.high) {
        TaskPriority::High
    } else if mentions(&keywords.low) {
        TaskPriority::Low
    } else {
        TaskPriority::Normal
    }
}

/// Validate that the dependency graph is a DAG using Kahn's algorithm.
///
/// `deps[i]` lists the indices task `i` depends on.
fn validate_dag(deps: &[Vec<usize>]) -> Result<(), SchedulerError> {
    for (task, dep_list) in deps.iter().enumerate() {
        for &dependency in dep_list {
            if dependency == task {
                return Err(SchedulerError::SelfDependency { task });
            }
            if dependency >= deps.len() {
                return Err(SchedulerError::UnknownDependency { task, dependency });
            }
        }
    }

    let mut in_degree: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); deps.len()];
    for (task, dep_list) in deps.iter().enumerate() {
        for &dep in dep_list {
            adj[dep].push(task);
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(task, _)| task)
        .collect();

    let mut processed = 0usize;
    while let Some(task) = queue.pop_front() {
        processed += 1;
        for &neighbor in &adj[task] {
            in_degree[neighbor] = in_degree[neighbor].saturating_sub(1);
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if processed != deps.len() {
        return Err(SchedulerError::Cycle);
    }
    Ok(())
}
