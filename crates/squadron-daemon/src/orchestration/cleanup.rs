//! Idle, suspended and team cleanup bookkeeping.
//!
//! [`CleanupManager`] records when agents go idle, when they were last
//! active and their latest resource usage, and owns three deadline
//! namespaces:
//!
//! - idle deadlines per agent, armed when an agent enters an idle-like state
//! - suspended deadlines per agent, armed when an agent is parked
//! - team deadlines per commander, armed once an orchestration finishes
//!
//! Deadlines fire from [`CleanupManager::tick`]; the caller decides what
//! reclaiming an agent or a team means.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info};

use squadron_core::config::{CleanupConfig, CleanupPolicy};
use squadron_core::types::PressureThresholds;
use squadron_core::{AgentId, CommanderId, ResourcePressure, ResourceSnapshot};

use super::deadline::DeadlineQueue;

/// Shortest timeout pressure scaling may produce.
const MIN_ADJUSTED_TIMEOUT: Duration = Duration::from_secs(1);

/// A cleanup deadline that has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupNotice {
    /// The agent stayed idle past its idle timeout.
    IdleExpired(AgentId),
    /// The agent stayed suspended past the suspended timeout.
    SuspendedExpired(AgentId),
    /// The commander's team is due for teardown.
    TeamExpired(CommanderId),
}

/// Per-agent idle/activity/resource tracking with cancellable deadlines.
#[derive(Debug)]
pub struct CleanupManager {
    config: CleanupConfig,
    policy: CleanupPolicy,
    pressure: ResourcePressure,
    idle_since: HashMap<AgentId, Instant>,
    last_activity: HashMap<AgentId, Instant>,
    resource_usage: HashMap<AgentId, ResourceSnapshot>,
    idle_deadlines: DeadlineQueue<AgentId>,
    suspended_deadlines: DeadlineQueue<AgentId>,
    team_deadlines: DeadlineQueue<CommanderId>,
    /// Receives every fired notice, if configured.
    notice_tx: Option<mpsc::UnboundedSender<CleanupNotice>>,
}

impl CleanupManager {
    pub fn new(config: CleanupConfig) -> Self {
        info!(policy = ?config.policy, "CleanupManager created");
        Self {
            policy: config.policy,
            config,
            pressure: ResourcePressure::Normal,
            idle_since: HashMap::new(),
            last_activity: HashMap::new(),
            resource_usage: HashMap::new(),
            idle_deadlines: DeadlineQueue::new(),
            suspended_deadlines: DeadlineQueue::new(),
            team_deadlines: DeadlineQueue::new(),
            notice_tx: None,
        }
    }

    /// Forward every fired notice to `tx` as well as returning it from `tick`.
    #[must_use]
    pub fn with_notice_sender(mut self, tx: mpsc::UnboundedSender<CleanupNotice>) -> Self {
        self.notice_tx = Some(tx);
        self
    }

    // =========================================================================
    // Idle tracking
    // =========================================================================

    /// Record that `id` entered an idle-like state and arm its idle deadline.
    pub fn agent_became_idle(&mut self, id: AgentId) {
        let now = Instant::now();
        self.idle_since.insert(id, now);
        self.last_activity.insert(id, now);
        let timeout = self.adjusted_timeout(self.policy.idle_timeout());
        self.idle_deadlines.schedule(id, now + timeout);
        debug!(agent_id = %id, timeout_secs = timeout.as_secs(), "Idle deadline armed");
    }

    /// Record that `id` left its idle-like state and disarm its idle deadline.
    pub fn agent_became_active(&mut self, id: AgentId) {
        self.idle_since.remove(&id);
        if self.idle_deadlines.cancel(&id) {
            debug!(agent_id = %id, "Idle deadline cancelled");
        }
        self.last_activity.insert(id, Instant::now());
    }

    pub fn record_activity(&mut self, id: AgentId) {
        self.last_activity.insert(id, Instant::now());
    }

    /// How long `id` has been idle; zero if it is not idle.
    pub fn idle_duration(&self, id: AgentId) -> Duration {
        self.idle_since
            .get(&id)
            .map_or(Duration::ZERO, Instant::elapsed)
    }

    /// Time since `id` last did anything; zero if it was never seen.
    pub fn time_since_last_activity(&self, id: AgentId) -> Duration {
        self.last_activity
            .get(&id)
            .map_or(Duration::ZERO, Instant::elapsed)
    }

    pub fn is_idle(&self, id: AgentId) -> bool {
        self.idle_since.contains_key(&id)
    }

    // =========================================================================
    // Resource usage
    // =========================================================================

    /// Store the latest usage snapshot for `id`, replacing any earlier one.
    pub fn record_resource_usage(&mut self, id: AgentId, cpu_percent: f64, memory_mb: f64) {
        self.resource_usage
            .insert(id, ResourceSnapshot::new(cpu_percent, memory_mb));
    }

    pub fn resource_usage(&self, id: AgentId) -> Option<ResourceSnapshot> {
        self.resource_usage.get(&id).copied()
    }

    /// Sum of the latest snapshots of every tracked agent.
    pub fn aggregate_usage(&self) -> ResourceSnapshot {
        self.resource_usage
            .values()
            .fold(ResourceSnapshot::default(), |acc, s| acc + *s)
    }

    /// Pressure implied by the aggregate usage of tracked agents.
    pub fn observed_pressure(&self, thresholds: &PressureThresholds) -> ResourcePressure {
        ResourcePressure::classify(self.aggregate_usage(), thresholds)
    }

    // =========================================================================
    // Team and suspended deadlines
    // =========================================================================

    /// Arm the teardown deadline for a commander's team.
    ///
    /// Re-scheduling for the same commander replaces the earlier deadline.
    pub fn schedule_team_cleanup(&mut self, commander_id: CommanderId, all_completed: bool) {
        let base = if all_completed {
            self.config.team_cleanup_completed()
        } else {
            self.config.team_cleanup_incomplete()
        };
        let delay = self.adjusted_timeout(base);
        let replaced = self
            .team_deadlines
            .schedule(commander_id, Instant::now() + delay);
        debug!(
            commander_id = %commander_id,
            all_completed,
            delay_secs = delay.as_secs(),
            replaced,
            "Team cleanup scheduled"
        );
    }

    pub fn cancel_team_cleanup(&mut self, commander_id: CommanderId) {
        if self.team_deadlines.cancel(&commander_id) {
            debug!(commander_id = %commander_id, "Team cleanup cancelled");
        }
    }

    pub fn has_team_cleanup(&self, commander_id: CommanderId) -> bool {
        self.team_deadlines.contains(&commander_id)
    }

    /// Arm the deadline for an agent parked in a suspended state.
    pub fn schedule_suspended_timeout(&mut self, id: AgentId) {
        let timeout = self.adjusted_timeout(self.config.suspended_timeout());
        self.suspended_deadlines
            .schedule(id, Instant::now() + timeout);
        debug!(agent_id = %id, timeout_secs = timeout.as_secs(), "Suspended deadline armed");
    }

    pub fn cancel_suspended_timeout(&mut self, id: AgentId) {
        self.suspended_deadlines.cancel(&id);
    }

    pub fn has_suspended_timeout(&self, id: AgentId) -> bool {
        self.suspended_deadlines.contains(&id)
    }

    pub fn has_idle_timer(&self, id: AgentId) -> bool {
        self.idle_deadlines.contains(&id)
    }

    // =========================================================================
    // Firing and teardown
    // =========================================================================

    /// Fire every deadline due at or before `now`, earliest first.
    ///
    /// Each notice is also sent to the notice channel when one is configured.
    pub fn tick(&mut self, now: Instant) -> Vec<CleanupNotice> {
        let mut fired: Vec<(Instant, CleanupNotice)> = Vec::new();
        fired.extend(
            self.idle_deadlines
                .pop_due(now)
                .into_iter()
                .map(|(id, at)| (at, CleanupNotice::IdleExpired(id))),
        );
        fired.extend(
            self.suspended_deadlines
                .pop_due(now)
                .into_iter()
                .map(|(id, at)| (at, CleanupNotice::SuspendedExpired(id))),
        );
        fired.extend(
            self.team_deadlines
                .pop_due(now)
                .into_iter()
                .map(|(id, at)| (at, CleanupNotice::TeamExpired(id))),
        );
        fired.sort_by_key(|(at, _)| *at);

        let notices: Vec<CleanupNotice> = fired.into_iter().map(|(_, notice)| notice).collect();
        for notice in &notices {
            debug!(?notice, "Cleanup deadline fired");
            if let Some(tx) = &self.notice_tx {
                if tx.send(*notice).is_err() {
                    debug!("Cleanup notice receiver dropped");
                }
            }
        }
        notices
    }

    /// Delete every per-agent structure for `id`.
    pub fn remove_agent(&mut self, id: AgentId) {
        self.idle_since.remove(&id);
        self.last_activity.remove(&id);
        self.resource_usage.remove(&id);
        self.idle_deadlines.cancel(&id);
        self.suspended_deadlines.cancel(&id);
    }

    /// Cancel every outstanding deadline and clear all tracking. Idempotent.
    pub fn shutdown(&mut self) {
        let pending = self.pending_timer_count();
        self.idle_deadlines.clear();
        self.suspended_deadlines.clear();
        self.team_deadlines.clear();
        self.idle_since.clear();
        self.last_activity.clear();
        self.resource_usage.clear();
        info!(cancelled = pending, "CleanupManager shut down");
    }

    // =========================================================================
    // Policy and pressure
    // =========================================================================

    pub fn set_policy(&mut self, policy: CleanupPolicy) {
        if policy != self.policy {
            info!(from = ?self.policy, to = ?policy, "Cleanup policy changed");
            self.policy = policy;
        }
    }

    pub const fn policy(&self) -> CleanupPolicy {
        self.policy
    }

    pub fn set_resource_pressure(&mut self, pressure: ResourcePressure) {
        self.pressure = pressure;
    }

    pub const fn resource_pressure(&self) -> ResourcePressure {
        self.pressure
    }

    /// Scale `base` down according to the current resource pressure.
    pub fn adjusted_timeout(&self, base: Duration) -> Duration {
        let factor = match self.pressure {
            ResourcePressure::Normal => 1.0,
            ResourcePressure::High => self.config.high_pressure_factor,
            ResourcePressure::Critical => self.config.critical_pressure_factor,
        };
        base.mul_f64(factor.clamp(0.0, 1.0)).max(MIN_ADJUSTED_TIMEOUT)
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Outstanding deadlines across all namespaces.
    pub fn pending_timer_count(&self) -> usize {
        self.idle_deadlines.len() + self.suspended_deadlines.len() + self.team_deadlines.len()
    }

    pub fn tracked_idle_count(&self) -> usize {
        self.idle_since.len()
    }

    /// Agents with any per-agent structure still present.
    pub fn tracked_agent_count(&self) -> usize {
        let mut ids: HashSet<&AgentId> = self.idle_since.keys().collect();
        ids.extend(self.last_activity.keys());
        ids.extend(self.resource_usage.keys());
        ids.len()
    }
}

/// The idle-entry/idle-exit hooks the lifecycle manager drives.
pub trait IdleTracker: Send + Sync {
    fn agent_became_idle(&self, id: AgentId);
    fn agent_became_active(&self, id: AgentId);
    fn record_activity(&self, id: AgentId);
    fn agent_suspended(&self, id: AgentId);
    fn agent_resumed(&self, id: AgentId);
    /// Drop every per-agent structure for `id`.
    fn remove_agent(&self, id: AgentId);
}

/// A [`CleanupManager`] behind one mutex, shared between the lifecycle
/// manager and whoever drives `tick`.
#[derive(Debug, Clone)]
pub struct SharedCleanupManager(Arc<Mutex<CleanupManager>>);

impl SharedCleanupManager {
    pub fn new(manager: CleanupManager) -> Self {
        Self(Arc::new(Mutex::new(manager)))
    }

    /// Lock the manager. A poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, CleanupManager> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdleTracker for SharedCleanupManager {
    fn agent_became_idle(&self, id: AgentId) {
        self.lock().agent_became_idle(id);
    }

    fn agent_became_active(&self, id: AgentId) {
        self.lock().agent_became_active(id);
    }

    fn record_activity(&self, id: AgentId) {
        self.lock().record_activity(id);
    }

    fn agent_suspended(&self, id: AgentId) {
        self.lock().schedule_suspended_timeout(id);
    }

    fn agent_resumed(&self, id: AgentId) {
        self.lock().cancel_suspended_timeout(id);
    }

    fn remove_agent(&self, id: AgentId) {
        self.lock().remove_agent(id);
    }
}
