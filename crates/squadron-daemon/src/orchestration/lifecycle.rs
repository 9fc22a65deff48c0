//! Agent lifecycle manager.
//!
//! [`AgentLifecycleManager`] owns the current [`AgentLifecycleState`] of every
//! managed agent and applies [`TransitionEvent`]s through the transition
//! table in `squadron_core::lifecycle`. Idle entry/exit, suspension and
//! teardown are reported to an [`IdleTracker`] so that cleanup deadlines
//! follow the state machine.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use squadron_core::config::LifecycleConfig;
use squadron_core::{AgentId, AgentLifecycleState, TransitionEvent};

use super::cleanup::IdleTracker;

/// Invoked once per emergency cleanup with the destroyed ids.
pub type EmergencyCallback = Box<dyn Fn(&[AgentId]) + Send + Sync>;

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRecord {
    pub agent_id: AgentId,
    pub from: AgentLifecycleState,
    /// `None` for forced transitions.
    pub event: Option<TransitionEvent>,
    pub to: AgentLifecycleState,
    pub at: SystemTime,
}

impl TransitionRecord {
    pub const fn is_forced(&self) -> bool {
        self.event.is_none()
    }
}

/// Counters accumulated over the manager's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleMetrics {
    pub total_transitions: u64,
    pub invalid_transitions: u64,
    pub forced_transitions: u64,
    pub event_counts: BTreeMap<TransitionEvent, u64>,
}

/// Idle-like states arm the idle cleanup deadline.
const fn is_idle_like(state: AgentLifecycleState) -> bool {
    state.is_cleanup_candidate()
}

pub struct AgentLifecycleManager {
    states: HashMap<AgentId, AgentLifecycleState>,
    tracker: Arc<dyn IdleTracker>,
    log: VecDeque<TransitionRecord>,
    log_capacity: usize,
    metrics: LifecycleMetrics,
    on_emergency_cleanup: Option<EmergencyCallback>,
}

impl std::fmt::Debug for AgentLifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLifecycleManager")
            .field("managed", &self.states.len())
            .field("log_len", &self.log.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl AgentLifecycleManager {
    pub fn new(config: &LifecycleConfig, tracker: Arc<dyn IdleTracker>) -> Self {
        info!(
            log_capacity = config.transition_log_capacity,
            "AgentLifecycleManager created"
        );
        Self {
            states: HashMap::new(),
            tracker,
            log: VecDeque::with_capacity(config.transition_log_capacity.min(1024)),
            log_capacity: config.transition_log_capacity,
            metrics: LifecycleMetrics::default(),
            on_emergency_cleanup: None,
        }
    }

    #[must_use]
    pub fn with_emergency_callback(mut self, callback: EmergencyCallback) -> Self {
        self.on_emergency_cleanup = Some(callback);
        self
    }

    /// Start managing `id` in `initial_state`.
    ///
    /// Registering an id that is already managed overwrites its state and
    /// updates cleanup tracking as a transition between the two states would.
    pub fn register_agent(&mut self, id: AgentId, initial_state: AgentLifecycleState) {
        if let Some(previous) = self.states.insert(id, initial_state) {
            debug!(agent_id = %id, %previous, state = %initial_state, "Agent re-registered");
            self.apply_side_effects(id, previous, initial_state);
        } else {
            debug!(agent_id = %id, state = %initial_state, "Agent registered");
            if is_idle_like(initial_state) {
                self.tracker.agent_became_idle(id);
            }
        }
    }

    /// Stop managing `id` and drop its cleanup tracking. Idempotent.
    pub fn unregister_agent(&mut self, id: AgentId) {
        if self.states.remove(&id).is_some() {
            debug!(agent_id = %id, "Agent unregistered");
        }
        self.tracker.remove_agent(id);
    }

    pub fn current_state(&self, id: AgentId) -> Option<AgentLifecycleState> {
        self.states.get(&id).copied()
    }

    /// Apply `event` to agent `id`.
    ///
    /// Returns the new state, or `None` if the agent is unknown or the event
    /// is not legal in its current state. Illegal events on a known agent are
    /// counted and otherwise ignored.
    pub fn fire_event(
        &mut self,
        event: TransitionEvent,
        id: AgentId,
    ) -> Option<AgentLifecycleState> {
        let Some(from) = self.current_state(id) else {
            debug!(agent_id = %id, %event, "Event for unknown agent ignored");
            return None;
        };
        let Some(to) = from.on_event(event) else {
            self.metrics.invalid_transitions += 1;
            warn!(agent_id = %id, state = %from, %event, "Invalid lifecycle transition");
            return None;
        };

        self.states.insert(id, to);
        self.metrics.total_transitions += 1;
        *self.metrics.event_counts.entry(event).or_insert(0) += 1;
        self.push_record(TransitionRecord {
            agent_id: id,
            from,
            event: Some(event),
            to,
            at: SystemTime::now(),
        });
        debug!(agent_id = %id, %from, %event, %to, "Lifecycle transition");

        self.apply_side_effects(id, from, to);
        Some(to)
    }

    fn apply_side_effects(&self, id: AgentId, from: AgentLifecycleState, to: AgentLifecycleState) {
        if to == AgentLifecycleState::Destroyed {
            self.tracker.remove_agent(id);
            return;
        }

        let suspended = AgentLifecycleState::Suspended;
        if from == suspended && to != suspended {
            self.tracker.agent_resumed(id);
        }
        if to == suspended && from != suspended {
            self.tracker.agent_suspended(id);
        }

        if is_idle_like(from) && !is_idle_like(to) {
            self.tracker.agent_became_active(id);
        }
        if is_idle_like(to) && from != to {
            self.tracker.agent_became_idle(id);
        }

        if to.is_active() {
            self.tracker.record_activity(id);
        }
    }

    fn push_record(&mut self, record: TransitionRecord) {
        if self.log_capacity == 0 {
            return;
        }
        while self.log.len() >= self.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(record);
    }

    /// Destroy every idle, finished or pooled agent immediately.
    ///
    /// Active agents are left alone. Returns the destroyed ids in ascending
    /// order; the emergency callback is invoked once with the same list.
    pub fn emergency_cleanup(&mut self) -> Vec<AgentId> {
        let mut victims: Vec<AgentId> = self
            .states
            .iter()
            .filter(|(_, state)| {
                state.is_cleanup_candidate() || **state == AgentLifecycleState::Pooled
            })
            .map(|(id, _)| *id)
            .collect();
        victims.sort_unstable();

        let now = SystemTime::now();
        for id in &victims {
            let Some(from) = self.states.insert(*id, AgentLifecycleState::Destroyed) else {
                continue;
            };
            self.metrics.forced_transitions += 1;
            self.push_record(TransitionRecord {
                agent_id: *id,
                from,
                event: None,
                to: AgentLifecycleState::Destroyed,
                at: now,
            });
            self.tracker.remove_agent(*id);
        }

        info!(destroyed = victims.len(), "Emergency cleanup completed");
        if let Some(callback) = &self.on_emergency_cleanup {
            callback(&victims);
        }
        victims
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn total_managed(&self) -> usize {
        self.states.len()
    }

    pub fn active_count(&self) -> usize {
        self.count_where(AgentLifecycleState::is_active)
    }

    /// Agents that can take a task without being constructed.
    pub fn idle_count(&self) -> usize {
        self.count_where(AgentLifecycleState::is_available_for_task)
    }

    pub fn suspended_count(&self) -> usize {
        self.count_where(AgentLifecycleState::is_suspended)
    }

    pub fn running_process_count(&self) -> usize {
        self.count_where(AgentLifecycleState::holds_process)
    }

    fn count_where(&self, predicate: impl Fn(AgentLifecycleState) -> bool) -> usize {
        self.states.values().filter(|s| predicate(**s)).count()
    }

    /// Ids currently in `state`, ascending.
    pub fn agents_in_state(&self, state: AgentLifecycleState) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub const fn metrics(&self) -> &LifecycleMetrics {
        &self.metrics
    }

    /// Most recent transitions, oldest first.
    pub fn transition_log(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.log.iter()
    }
}
