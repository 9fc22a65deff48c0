//! Priority-ordered admission control for running sub-agents.
//!
//! [`ConcurrencyController`] admits at most `effective_limit` concurrently
//! running tasks. Requests beyond the limit wait in a queue ordered by
//! priority and then by arrival, and are admitted as slots free up. The limit
//! shrinks under resource pressure.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use tracing::{debug, info};

use squadron_core::config::ConcurrencyConfig;
use squadron_core::{AgentModel, CommanderId, ResourcePressure, TaskPriority};

/// A request that was allowed to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartGrant {
    pub commander_id: CommanderId,
    pub task_index: usize,
    pub model: AgentModel,
}

/// Outcome of [`ConcurrencyController::request_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Admitted immediately; `on_start` has been invoked.
    Started,
    /// Waiting; `position` is the 1-based place in the queue at enqueue time.
    Queued { position: usize },
    /// The same task is already running or queued.
    Duplicate,
}

/// Invoked synchronously for every admitted request.
pub type StartCallback = Box<dyn Fn(&StartGrant) + Send + Sync>;

type SlotKey = (CommanderId, usize);

#[derive(Debug)]
struct PendingStart {
    grant: StartGrant,
    priority: TaskPriority,
    sequence: u64,
}

impl PartialEq for PendingStart {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingStart {}

impl PartialOrd for PendingStart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingStart {
    /// Higher priority first, then earlier arrival.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    effective_limit: usize,
    pressure: ResourcePressure,
    active: HashSet<SlotKey>,
    queue: BinaryHeap<PendingStart>,
    queued_keys: HashSet<SlotKey>,
    next_sequence: u64,
    /// Processes started outside this controller.
    external_running: usize,
    on_start: Option<StartCallback>,
}

impl std::fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("effective_limit", &self.effective_limit)
            .field("pressure", &self.pressure)
            .field("active", &self.active.len())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl ConcurrencyController {
    pub fn new(config: ConcurrencyConfig) -> Self {
        let base = config.max_concurrent.max(1);
        info!(max_concurrent = base, "ConcurrencyController created");
        Self {
            config,
            effective_limit: base,
            pressure: ResourcePressure::Normal,
            active: HashSet::new(),
            queue: BinaryHeap::new(),
            queued_keys: HashSet::new(),
            next_sequence: 0,
            external_running: 0,
            on_start: None,
        }
    }

    #[must_use]
    pub fn with_start_callback(mut self, callback: StartCallback) -> Self {
        self.on_start = Some(callback);
        self
    }

    /// Ask to start task `task_index` of `commander_id`.
    pub fn request_start(
        &mut self,
        commander_id: CommanderId,
        task_index: usize,
        model: AgentModel,
        priority: TaskPriority,
    ) -> Admission {
        let key = (commander_id, task_index);
        if self.active.contains(&key) || self.queued_keys.contains(&key) {
            debug!(commander_id = %commander_id, task_index, "Duplicate start request");
            return Admission::Duplicate;
        }

        let grant = StartGrant {
            commander_id,
            task_index,
            model,
        };
        if self.active.len() < self.effective_limit {
            self.admit(grant);
            return Admission::Started;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push(PendingStart {
            grant,
            priority,
            sequence,
        });
        self.queued_keys.insert(key);
        let position = self.queue_position(priority, sequence);
        debug!(
            commander_id = %commander_id,
            task_index,
            %priority,
            position,
            "Start request queued"
        );
        Admission::Queued { position }
    }

    /// Release the slot held by a finished task and admit waiting requests.
    pub fn task_completed(&mut self, commander_id: CommanderId, task_index: usize) {
        if !self.active.remove(&(commander_id, task_index)) {
            debug!(commander_id = %commander_id, task_index, "Completion for inactive task ignored");
            return;
        }
        debug!(commander_id = %commander_id, task_index, "Slot released");
        self.drain();
    }

    /// Recompute the effective limit for `pressure`.
    pub fn adjust_for_pressure(&mut self, pressure: ResourcePressure) {
        let base = self.base_limit();
        let floor = self.config.min_concurrent.clamp(1, base);
        let limit = match pressure {
            ResourcePressure::Normal => base,
            ResourcePressure::High => {
                #[allow(
                    clippy::cast_precision_loss,
                    clippy::cast_possible_truncation,
                    clippy::cast_sign_loss
                )]
                let scaled = (base as f64 * self.config.high_pressure_factor).ceil() as usize;
                scaled.clamp(floor, base)
            }
            ResourcePressure::Critical => floor,
        };

        let previous = self.effective_limit;
        self.pressure = pressure;
        self.effective_limit = limit;
        if limit != previous {
            info!(%pressure, from = previous, to = limit, "Concurrency limit adjusted");
        }
        if limit > previous {
            self.drain();
        }
    }

    /// Drop every active slot and queued request. Idempotent.
    pub fn reset(&mut self) {
        self.active.clear();
        self.queue.clear();
        self.queued_keys.clear();
        debug!("ConcurrencyController reset");
    }

    /// Drop every queued request for `commander_id`. Active slots are kept.
    pub fn cancel_commander(&mut self, commander_id: CommanderId) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|pending| pending.grant.commander_id != commander_id);
        self.queued_keys.retain(|(commander, _)| *commander != commander_id);
        let dropped = before - self.queue.len();
        if dropped > 0 {
            debug!(commander_id = %commander_id, dropped, "Queued starts cancelled");
        }
        dropped
    }

    pub const fn set_external_running(&mut self, count: usize) {
        self.external_running = count;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn current_active_count(&self) -> usize {
        self.active.len()
    }

    /// Active slots held by `commander_id`.
    pub fn active_count_for(&self, commander_id: CommanderId) -> usize {
        self.active
            .iter()
            .filter(|(commander, _)| *commander == commander_id)
            .count()
    }

    pub fn current_queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn total_running_count(&self) -> usize {
        self.active.len() + self.external_running
    }

    pub const fn effective_concurrency_limit(&self) -> usize {
        self.effective_limit
    }

    pub fn base_limit(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    pub const fn pressure(&self) -> ResourcePressure {
        self.pressure
    }

    pub fn is_active(&self, commander_id: CommanderId, task_index: usize) -> bool {
        self.active.contains(&(commander_id, task_index))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn admit(&mut self, grant: StartGrant) {
        self.active.insert((grant.commander_id, grant.task_index));
        debug!(
            commander_id = %grant.commander_id,
            task_index = grant.task_index,
            model = %grant.model,
            active = self.active.len(),
            "Task admitted"
        );
        if let Some(callback) = &self.on_start {
            callback(&grant);
        }
    }

    fn drain(&mut self) {
        while self.active.len() < self.effective_limit {
            let Some(next) = self.queue.pop() else {
                break;
            };
            self.queued_keys
                .remove(&(next.grant.commander_id, next.grant.task_index));
            self.admit(next.grant);
        }
    }

    /// 1-based position of a queued entry in admission order.
    fn queue_position(&self, priority: TaskPriority, sequence: u64) -> usize {
        1 + self
            .queue
            .iter()
            .filter(|p| p.priority > priority || (p.priority == priority && p.sequence < sequence))
            .count()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn controller(max: usize) -> ConcurrencyController {
        ConcurrencyController::new(ConcurrencyConfig {
            max_concurrent: max,
            ..ConcurrencyConfig::default()
        })
    }

    fn recording(max: usize) -> (ConcurrencyController, Arc<Mutex<Vec<StartGrant>>>) {
        let started = Arc::new(Mutex::new(Vec::new()));
        let sink = started.clone();
        let c = controller(max).with_start_callback(Box::new(move |grant| {
            sink.lock().unwrap().push(*grant);
        }));
        (c, started)
    }

    #[test]
    fn active_count_is_per_commander() {
        let mut c = controller(3);
        let (a, b) = (CommanderId::new(), CommanderId::new());
        c.request_start(a, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(a, 1, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(b, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(b, 1, AgentModel::Sonnet, TaskPriority::Normal);

        assert_eq!(c.active_count_for(a), 2);
        assert_eq!(c.active_count_for(b), 1);
        c.task_completed(a, 0);
        assert_eq!(c.active_count_for(a), 1);
        assert_eq!(c.active_count_for(b), 2);
    }

    #[test]
    fn admits_up_to_limit_then_queues() {
        let (mut c, started) = recording(2);
        let commander = CommanderId::new();

        let outcomes: Vec<_> = (0..5)
            .map(|i| c.request_start(commander, i, AgentModel::Sonnet, TaskPriority::Normal))
            .collect();

        assert_eq!(outcomes[0], Admission::Started);
        assert_eq!(outcomes[1], Admission::Started);
        assert_eq!(outcomes[2], Admission::Queued { position: 1 });
        assert_eq!(outcomes[4], Admission::Queued { position: 3 });
        assert_eq!(c.current_active_count(), 2);
        assert_eq!(c.current_queued_count(), 3);
        assert_eq!(started.lock().unwrap().len(), 2);
    }

    #[test]
    fn fifty_requests_drain_completely() {
        let (mut c, started) = recording(2);
        let commander = CommanderId::new();
        for i in 0..50 {
            c.request_start(commander, i, AgentModel::Haiku, TaskPriority::Normal);
        }
        assert_eq!(c.current_active_count(), 2);
        assert_eq!(c.current_queued_count(), 48);

        let mut next = 0;
        while next < started.lock().unwrap().len() {
            let grant = started.lock().unwrap()[next];
            c.task_completed(grant.commander_id, grant.task_index);
            next += 1;
        }

        let order: Vec<usize> = started.lock().unwrap().iter().map(|g| g.task_index).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
        assert_eq!(c.current_active_count(), 0);
        assert_eq!(c.current_queued_count(), 0);
    }

    #[test]
    fn higher_priority_jumps_the_queue() {
        let (mut c, started) = recording(1);
        let commander = CommanderId::new();
        c.request_start(commander, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(commander, 1, AgentModel::Sonnet, TaskPriority::Low);
        c.request_start(commander, 2, AgentModel::Sonnet, TaskPriority::Normal);
        assert_eq!(
            c.request_start(commander, 3, AgentModel::Sonnet, TaskPriority::Critical),
            Admission::Queued { position: 1 }
        );

        for i in [0, 3, 2] {
            c.task_completed(commander, i);
        }
        let order: Vec<usize> = started.lock().unwrap().iter().map(|g| g.task_index).collect();
        assert_eq!(order, vec![0, 3, 2, 1]);
    }

    #[test]
    fn duplicate_requests_change_nothing() {
        let (mut c, started) = recording(1);
        let commander = CommanderId::new();
        c.request_start(commander, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(commander, 1, AgentModel::Sonnet, TaskPriority::Normal);

        assert_eq!(
            c.request_start(commander, 0, AgentModel::Opus, TaskPriority::High),
            Admission::Duplicate
        );
        assert_eq!(
            c.request_start(commander, 1, AgentModel::Opus, TaskPriority::High),
            Admission::Duplicate
        );
        assert_eq!(c.current_active_count(), 1);
        assert_eq!(c.current_queued_count(), 1);
        assert_eq!(started.lock().unwrap().len(), 1);
    }

    #[test]
    fn completing_unknown_task_is_a_noop() {
        let mut c = controller(1);
        let commander = CommanderId::new();
        c.request_start(commander, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(commander, 1, AgentModel::Sonnet, TaskPriority::Normal);

        c.task_completed(commander, 7);
        c.task_completed(CommanderId::new(), 0);
        assert!(c.is_active(commander, 0));
        assert_eq!(c.current_queued_count(), 1);
    }

    #[test]
    fn pressure_adjusts_limit() {
        let mut c = controller(6);
        assert_eq!(c.effective_concurrency_limit(), 6);

        c.adjust_for_pressure(ResourcePressure::High);
        assert_eq!(c.effective_concurrency_limit(), 3);

        c.adjust_for_pressure(ResourcePressure::Critical);
        assert_eq!(c.effective_concurrency_limit(), 1);
        assert_eq!(c.pressure(), ResourcePressure::Critical);

        c.adjust_for_pressure(ResourcePressure::Normal);
        assert_eq!(c.effective_concurrency_limit(), 6);
    }

    #[test]
    fn high_pressure_rounds_up() {
        let mut c = controller(5);
        c.adjust_for_pressure(ResourcePressure::High);
        assert_eq!(c.effective_concurrency_limit(), 3);
    }

    #[test]
    fn raising_limit_drains_queue() {
        let (mut c, started) = recording(4);
        c.adjust_for_pressure(ResourcePressure::Critical);
        let commander = CommanderId::new();
        for i in 0..4 {
            c.request_start(commander, i, AgentModel::Sonnet, TaskPriority::Normal);
        }
        assert_eq!(c.current_active_count(), 1);

        c.adjust_for_pressure(ResourcePressure::Normal);
        assert_eq!(c.current_active_count(), 4);
        assert_eq!(c.current_queued_count(), 0);
        assert_eq!(started.lock().unwrap().len(), 4);
    }

    #[test]
    fn lowering_limit_keeps_running_tasks() {
        let mut c = controller(4);
        let commander = CommanderId::new();
        for i in 0..4 {
            c.request_start(commander, i, AgentModel::Sonnet, TaskPriority::Normal);
        }
        c.adjust_for_pressure(ResourcePressure::Critical);
        assert_eq!(c.current_active_count(), 4);

        c.request_start(commander, 4, AgentModel::Sonnet, TaskPriority::Normal);
        c.task_completed(commander, 0);
        // Still above the critical limit of 1.
        assert_eq!(c.current_active_count(), 3);
        assert_eq!(c.current_queued_count(), 1);
    }

    #[test]
    fn cancel_commander_only_drops_its_queue() {
        let mut c = controller(1);
        let a = CommanderId::new();
        let b = CommanderId::new();
        c.request_start(a, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(a, 1, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(b, 0, AgentModel::Sonnet, TaskPriority::Normal);

        assert_eq!(c.cancel_commander(a), 1);
        assert!(c.is_active(a, 0));
        assert_eq!(c.current_queued_count(), 1);

        // The cancelled key may be requested again.
        assert_eq!(
            c.request_start(a, 1, AgentModel::Sonnet, TaskPriority::Normal),
            Admission::Queued { position: 2 }
        );
    }

    #[test]
    fn reset_is_idempotent() {
        let mut c = controller(1);
        let commander = CommanderId::new();
        c.request_start(commander, 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.request_start(commander, 1, AgentModel::Sonnet, TaskPriority::Normal);
        c.reset();
        c.reset();
        assert_eq!(c.current_active_count(), 0);
        assert_eq!(c.current_queued_count(), 0);
        assert_eq!(
            c.request_start(commander, 0, AgentModel::Sonnet, TaskPriority::Normal),
            Admission::Started
        );
    }

    #[test]
    fn external_processes_count_towards_total() {
        let mut c = controller(2);
        c.request_start(CommanderId::new(), 0, AgentModel::Sonnet, TaskPriority::Normal);
        c.set_external_running(3);
        assert_eq!(c.total_running_count(), 4);
    }
}
