//! The orchestration loop.
//!
//! [`Orchestrator`] bundles the five components, each behind its own mutex,
//! and wires them together: ready subtasks go through admission control,
//! spawned agents are tracked by the lifecycle manager, released agents go
//! back to the pool, and fired cleanup deadlines disband idle agents and
//! finished teams.
//!
//! Lock order: the scheduler is taken before the concurrency controller when
//! both are held. The cleanup manager is only ever locked last. It is locked
//! from inside the lifecycle manager (through [`IdleTracker`]), so the
//! orchestrator never holds it while taking another component's lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use squadron_core::config::CleanupPolicy;
use squadron_core::types::PressureThresholds;
use squadron_core::{
    Agent, AgentId, AgentLifecycleState, AgentModel, AgentRole, CommanderId, ResourcePressure,
    SquadronConfig, TransitionEvent,
};

use super::cleanup::{CleanupManager, CleanupNotice, SharedCleanupManager};
use super::concurrency::{Admission, ConcurrencyController, StartGrant};
use super::lifecycle::{AgentLifecycleManager, LifecycleMetrics};
use super::pool::{AgentFactory, PoolStats, SubAgentPoolManager};
use super::scheduler::{SchedulerError, SchedulerStats, SubTask, TaskPriorityScheduler};

/// Deferred notifications for whoever runs the agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// A subtask may start now.
    Admitted(StartGrant),
    /// Agents destroyed by an emergency cleanup.
    EmergencyCleanup(Vec<AgentId>),
}

/// Point-in-time view of every component.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub total_agents: usize,
    pub active_agents: usize,
    pub idle_agents: usize,
    pub suspended_agents: usize,
    pub running_processes: usize,
    pub lifecycle: LifecycleMetrics,
    pub pool: PoolStats,
    pub pool_hit_rate: f64,
    pub concurrency_active: usize,
    pub concurrency_queued: usize,
    pub concurrency_limit: usize,
    pub total_running: usize,
    pub pressure: ResourcePressure,
    pub cleanup_policy: CleanupPolicy,
    pub scheduler: SchedulerStats,
    pub orchestrations: usize,
    pub cleanup_pending_timers: usize,
    pub cleanup_tracked_idle: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Orchestrator {
    thresholds: PressureThresholds,
    cleanup: SharedCleanupManager,
    lifecycle: Mutex<AgentLifecycleManager>,
    concurrency: Mutex<ConcurrencyController>,
    scheduler: Mutex<TaskPriorityScheduler>,
    pool: Mutex<SubAgentPoolManager>,
    /// Agents handed out and not yet pooled or disbanded.
    agents: Mutex<HashMap<AgentId, Agent>>,
}

impl Orchestrator {
    /// Build every component from `config`.
    ///
    /// Admissions and emergency cleanups are forwarded to `events` when given.
    pub fn new(
        config: SquadronConfig,
        factory: Arc<dyn AgentFactory>,
        events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    ) -> Self {
        let cleanup = SharedCleanupManager::new(CleanupManager::new(config.cleanup));

        let mut lifecycle =
            AgentLifecycleManager::new(&config.lifecycle, Arc::new(cleanup.clone()));
        let mut concurrency = ConcurrencyController::new(config.concurrency);
        if let Some(tx) = events {
            let emergency_tx = tx.clone();
            lifecycle = lifecycle.with_emergency_callback(Box::new(move |ids| {
                // Receiver gone means the daemon is shutting down.
                let _ = emergency_tx.send(OrchestratorEvent::EmergencyCleanup(ids.to_vec()));
            }));
            concurrency = concurrency.with_start_callback(Box::new(move |grant| {
                let _ = tx.send(OrchestratorEvent::Admitted(*grant));
            }));
        }

        info!("Orchestrator created");
        Self {
            thresholds: config.pressure,
            cleanup,
            lifecycle: Mutex::new(lifecycle),
            concurrency: Mutex::new(concurrency),
            scheduler: Mutex::new(TaskPriorityScheduler::new(config.scheduler)),
            pool: Mutex::new(SubAgentPoolManager::new(config.pool, factory)),
            agents: Mutex::new(HashMap::new()),
        }
    }

    pub const fn cleanup(&self) -> &SharedCleanupManager {
        &self.cleanup
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Replace the orchestration of `commander_id`.
    ///
    /// Refused with [`SchedulerError::Busy`] while a subtask of the previous
    /// orchestration still holds a running slot. Otherwise its queued starts
    /// and any pending team teardown are dropped.
    pub fn schedule(
        &self,
        commander_id: CommanderId,
        subtasks: Vec<SubTask>,
    ) -> Result<usize, SchedulerError> {
        let count = {
            let mut scheduler = lock(&self.scheduler);
            let mut concurrency = lock(&self.concurrency);
            let active = concurrency.active_count_for(commander_id);
            if active > 0 {
                warn!(commander_id = %commander_id, active, "Orchestration replacement refused");
                return Err(SchedulerError::Busy { active });
            }
            let count = scheduler.schedule_sub_tasks(commander_id, subtasks)?;
            concurrency.cancel_commander(commander_id);
            count
        };
        self.cleanup.lock().cancel_team_cleanup(commander_id);
        Ok(count)
    }

    /// Hand the next ready batch of `commander_id` to admission control.
    ///
    /// Returns each dispatched task index with its admission outcome. Started
    /// and queued tasks are both marked `started` in the scheduler, so a queued
    /// task reports as started until it finishes. A task rejected as
    /// [`Admission::Duplicate`] stays ready.
    pub fn dispatch_ready(&self, commander_id: CommanderId) -> Vec<(usize, Admission)> {
        // Scheduler before concurrency, as in `schedule`. Holding the scheduler
        // lock keeps `task_finished` from seeing a task admitted but not marked.
        let mut scheduler = lock(&self.scheduler);
        let batch = scheduler.next_batch(commander_id, scheduler.default_batch_size());

        let mut concurrency = lock(&self.concurrency);
        let mut dispatched = Vec::with_capacity(batch.len());
        for task in batch {
            let admission = concurrency.request_start(
                commander_id,
                task.index,
                task.complexity.preferred_model(),
                task.priority,
            );
            if admission == Admission::Duplicate {
                warn!(
                    commander_id = %commander_id,
                    task_index = task.index,
                    "Duplicate start left ready"
                );
            } else {
                scheduler.mark_started(commander_id, task.index);
            }
            dispatched.push((task.index, admission));
        }
        dispatched
    }

    /// Record the outcome of a started subtask.
    ///
    /// Returns the indices that became ready (on success) or were skipped
    /// (on failure). Once every task is terminal the team teardown is armed.
    pub fn task_finished(
        &self,
        commander_id: CommanderId,
        index: usize,
        success: bool,
    ) -> Vec<usize> {
        lock(&self.concurrency).task_completed(commander_id, index);

        let (affected, done, all_completed) = {
            let mut scheduler = lock(&self.scheduler);
            let affected = if success {
                scheduler.mark_completed(commander_id, index)
            } else {
                scheduler.mark_failed(commander_id, index)
            };
            let known = scheduler.task(commander_id, index).is_some();
            (
                affected,
                known && scheduler.is_orchestration_done(commander_id),
                scheduler.all_completed(commander_id),
            )
        };

        if done {
            info!(commander_id = %commander_id, all_completed, "Orchestration finished");
            self.cleanup
                .lock()
                .schedule_team_cleanup(commander_id, all_completed);
        }
        affected
    }

    // =========================================================================
    // Agents
    // =========================================================================

    /// Hand out an agent for `commander_id`, reusing a pooled one if possible.
    ///
    /// Reused agents come back `idle`; fresh ones start `initializing`. A
    /// pooled entry whose agent has left `pooled` in the meantime is skipped.
    pub fn spawn_agent(
        &self,
        commander_id: CommanderId,
        role: AgentRole,
        model: AgentModel,
    ) -> Agent {
        let (agent, reused) = loop {
            let acquired = lock(&self.pool).acquire(role, commander_id, model);
            let Some(mut agent) = acquired else {
                let agent = lock(&self.pool).create(role, commander_id, model);
                lock(&self.lifecycle).register_agent(agent.id, agent.state);
                break (agent, false);
            };

            let (claimed, live) = {
                let mut lifecycle = lock(&self.lifecycle);
                match lifecycle.current_state(agent.id) {
                    Some(AgentLifecycleState::Pooled) => (
                        lifecycle.fire_event(TransitionEvent::AcquiredFromPool, agent.id),
                        true,
                    ),
                    stale => {
                        debug!(agent_id = %agent.id, state = ?stale, "Stale pool entry skipped");
                        (None, stale.is_some())
                    }
                }
            };
            if let Some(state) = claimed {
                agent.state = state;
                break (agent, true);
            }
            if live {
                // Claimed through `fire` concurrently; keep its record.
                lock(&self.agents).entry(agent.id).or_insert(agent);
            }
        };

        debug!(agent_id = %agent.id, commander_id = %commander_id, %role, reused, "Agent spawned");
        lock(&self.agents).insert(agent.id, agent.clone());
        agent
    }

    /// Apply `event` to agent `id`.
    ///
    /// A pooled agent moved out of `pooled` this way is taken out of the pool
    /// so that it cannot be handed out a second time.
    pub fn fire(&self, id: AgentId, event: TransitionEvent) -> Option<AgentLifecycleState> {
        let (from, to) = {
            let mut lifecycle = lock(&self.lifecycle);
            let from = lifecycle.current_state(id);
            (from, lifecycle.fire_event(event, id)?)
        };

        if from == Some(AgentLifecycleState::Pooled) && to != AgentLifecycleState::Pooled {
            let taken = lock(&self.pool).take(id);
            if let Some(mut agent) = taken {
                debug!(agent_id = %id, %event, %to, "Pooled agent claimed directly");
                agent.state = to;
                lock(&self.agents).insert(id, agent);
            }
        }
        Some(to)
    }

    pub fn agent_state(&self, id: AgentId) -> Option<AgentLifecycleState> {
        lock(&self.lifecycle).current_state(id)
    }

    /// Return a finished agent to the pool, disbanding it if the pool is full.
    ///
    /// Returns `true` if the agent was pooled. Agents that are not in a
    /// releasable state are left alone.
    pub fn release_agent(&self, id: AgentId) -> bool {
        if lock(&self.lifecycle)
            .fire_event(TransitionEvent::ReturnToPool, id)
            .is_none()
        {
            return false;
        }
        let record = lock(&self.agents).remove(&id);
        let Some(agent) = record else {
            warn!(agent_id = %id, "Released agent has no record");
            self.disband_agent(id);
            return false;
        };

        let pooled = lock(&self.pool).release(agent);
        if !pooled {
            self.disband_agent(id);
        }
        pooled
    }

    /// Disband `id` and forget it. Returns `false` if it was not managed.
    pub fn disband_agent(&self, id: AgentId) -> bool {
        let known = {
            let mut lifecycle = lock(&self.lifecycle);
            let state = lifecycle.current_state(id);
            match state {
                Some(AgentLifecycleState::Destroyed) | None => {}
                Some(AgentLifecycleState::Destroying) => {
                    lifecycle.fire_event(TransitionEvent::AnimationComplete, id);
                }
                Some(_) => {
                    lifecycle.fire_event(TransitionEvent::DisbandScheduled, id);
                    lifecycle.fire_event(TransitionEvent::AnimationComplete, id);
                }
            }
            lifecycle.unregister_agent(id);
            state.is_some()
        };
        lock(&self.pool).take(id);
        lock(&self.agents).remove(&id);
        if known {
            debug!(agent_id = %id, "Agent disbanded");
        }
        known
    }

    /// Destroy every idle, finished or pooled agent at once.
    pub fn emergency_cleanup(&self) -> Vec<AgentId> {
        let destroyed = {
            let mut lifecycle = lock(&self.lifecycle);
            let destroyed = lifecycle.emergency_cleanup();
            for id in &destroyed {
                lifecycle.unregister_agent(*id);
            }
            destroyed
        };
        lock(&self.pool).drain_all();
        let mut agents = lock(&self.agents);
        for id in &destroyed {
            agents.remove(id);
        }
        destroyed
    }

    // =========================================================================
    // Pressure
    // =========================================================================

    /// Propagate a pressure level to cleanup, admission and the pool.
    pub fn apply_pressure(&self, pressure: ResourcePressure) {
        self.cleanup.lock().set_resource_pressure(pressure);
        lock(&self.concurrency).adjust_for_pressure(pressure);
        let evicted = lock(&self.pool).resize_for_pressure(pressure);

        let mut lifecycle = lock(&self.lifecycle);
        for agent in &evicted {
            lifecycle.unregister_agent(agent.id);
        }
        debug!(%pressure, evicted = evicted.len(), "Pressure applied");
    }

    pub fn record_resource_usage(&self, id: AgentId, cpu_percent: f64, memory_mb: f64) {
        self.cleanup
            .lock()
            .record_resource_usage(id, cpu_percent, memory_mb);
    }

    /// Classify aggregate agent usage and apply the result if it changed.
    pub fn refresh_pressure(&self) -> ResourcePressure {
        let (observed, current) = {
            let cleanup = self.cleanup.lock();
            (
                cleanup.observed_pressure(&self.thresholds),
                cleanup.resource_pressure(),
            )
        };
        if observed != current {
            info!(from = %current, to = %observed, "Resource pressure changed");
            self.apply_pressure(observed);
        }
        observed
    }

    pub fn set_cleanup_policy(&self, policy: CleanupPolicy) {
        self.cleanup.lock().set_policy(policy);
    }

    // =========================================================================
    // Deadlines
    // =========================================================================

    /// Fire due cleanup deadlines and act on them.
    ///
    /// Idle agents are disbanded; suspended agents time out into
    /// `suspendedIdle`; expired teams lose their orchestration, their queued
    /// starts and their agents.
    pub fn tick(&self, now: Instant) -> Vec<CleanupNotice> {
        let notices = self.cleanup.lock().tick(now);
        for notice in &notices {
            match *notice {
                CleanupNotice::IdleExpired(id) => {
                    self.disband_agent(id);
                }
                CleanupNotice::SuspendedExpired(id) => {
                    self.fire(id, TransitionEvent::IdleTimeout);
                }
                CleanupNotice::TeamExpired(commander_id) => self.teardown_team(commander_id),
            }
        }
        notices
    }

    fn teardown_team(&self, commander_id: CommanderId) {
        lock(&self.scheduler).remove_orchestration(commander_id);
        lock(&self.concurrency).cancel_commander(commander_id);

        let members: Vec<AgentId> = lock(&self.agents)
            .values()
            .filter(|agent| agent.parent_id == commander_id)
            .map(|agent| agent.id)
            .collect();
        for id in &members {
            self.disband_agent(*id);
        }
        info!(commander_id = %commander_id, disbanded = members.len(), "Team torn down");
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub fn health(&self) -> HealthSnapshot {
        let lifecycle = lock(&self.lifecycle);
        let total_agents = lifecycle.total_managed();
        let active_agents = lifecycle.active_count();
        let idle_agents = lifecycle.idle_count();
        let suspended_agents = lifecycle.suspended_count();
        let running_processes = lifecycle.running_process_count();
        let lifecycle_metrics = lifecycle.metrics().clone();
        drop(lifecycle);

        let pool = lock(&self.pool).stats();
        let (concurrency_active, concurrency_queued, concurrency_limit, total_running, pressure) = {
            let c = lock(&self.concurrency);
            (
                c.current_active_count(),
                c.current_queued_count(),
                c.effective_concurrency_limit(),
                c.total_running_count(),
                c.pressure(),
            )
        };
        let (scheduler, orchestrations) = {
            let s = lock(&self.scheduler);
            (s.stats(), s.orchestration_count())
        };
        let (cleanup_policy, cleanup_pending_timers, cleanup_tracked_idle) = {
            let cleanup = self.cleanup.lock();
            (
                cleanup.policy(),
                cleanup.pending_timer_count(),
                cleanup.tracked_idle_count(),
            )
        };

        HealthSnapshot {
            total_agents,
            active_agents,
            idle_agents,
            suspended_agents,
            running_processes,
            lifecycle: lifecycle_metrics,
            pool_hit_rate: pool.hit_rate(),
            pool,
            concurrency_active,
            concurrency_queued,
            concurrency_limit,
            total_running,
            pressure,
            cleanup_policy,
            scheduler,
            orchestrations,
            cleanup_pending_timers,
            cleanup_tracked_idle,
        }
    }

    /// Cancel every deadline, drop admissions and empty the pool. Idempotent.
    pub fn shutdown(&self) {
        self.cleanup.lock().shutdown();
        lock(&self.concurrency).reset();
        let evicted = lock(&self.pool).drain_all();
        let mut lifecycle = lock(&self.lifecycle);
        for agent in &evicted {
            lifecycle.unregister_agent(agent.id);
        }
        info!("Orchestrator shut down");
    }
}
