#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! Integration tests for the orchestration engine.
//!
//! Exercises the components together: scheduling → admission → agent
//! lifecycle → pooling → deadline-driven cleanup.

use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use squadron_core::config::{CleanupConfig, ConcurrencyConfig, LifecycleConfig, PoolConfig};
use squadron_core::{
    Agent, AgentId, AgentLifecycleState, AgentModel, AgentRole, CommanderId, SquadronConfig,
    TaskPriority, TransitionEvent,
};
use squadron_daemon::orchestration::{
    Admission, AgentLifecycleManager, CleanupManager, CleanupNotice, ConcurrencyController,
    Orchestrator, OrchestratorEvent, SharedCleanupManager, StartGrant, SubAgentPoolManager,
    SubTask, UuidAgentFactory,
};

fn lifecycle_with_cleanup() -> (AgentLifecycleManager, SharedCleanupManager) {
    let cleanup = SharedCleanupManager::new(CleanupManager::new(CleanupConfig::default()));
    let lifecycle =
        AgentLifecycleManager::new(&LifecycleConfig::default(), Arc::new(cleanup.clone()));
    (lifecycle, cleanup)
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(24 * 60 * 60)
}

#[test]
fn thousands_of_agents_leave_no_residue() {
    let (mut lifecycle, cleanup) = lifecycle_with_cleanup();
    let ids: Vec<AgentId> = (0..5_000).map(|_| AgentId::new()).collect();

    for (i, id) in ids.iter().enumerate() {
        let state = if i % 2 == 0 {
            AgentLifecycleState::Idle
        } else {
            AgentLifecycleState::Working
        };
        lifecycle.register_agent(*id, state);
        if i % 3 == 0 {
            lifecycle.fire_event(TransitionEvent::Suspend, *id);
        }
        cleanup.lock().record_resource_usage(*id, 1.0, 1.0);
    }
    assert_eq!(lifecycle.total_managed(), 5_000);

    for id in &ids {
        lifecycle.unregister_agent(*id);
        lifecycle.unregister_agent(*id);
    }

    assert_eq!(lifecycle.total_managed(), 0);
    let cleanup = cleanup.lock();
    assert_eq!(cleanup.tracked_agent_count(), 0);
    assert_eq!(cleanup.tracked_idle_count(), 0);
    assert_eq!(cleanup.pending_timer_count(), 0);
}

#[test]
fn concurrent_spawn_and_disband_through_orchestrator() {
    let orchestrator = Orchestrator::new(
        SquadronConfig::default(),
        Arc::new(UuidAgentFactory),
        None,
    );

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                let commander = CommanderId::new();
                for _ in 0..250 {
                    let agent =
                        orchestrator.spawn_agent(commander, AgentRole::Developer, AgentModel::Haiku);
                    orchestrator.fire(agent.id, TransitionEvent::ResourcesLoaded);
                    orchestrator.fire(agent.id, TransitionEvent::AssignTask);
                    orchestrator.fire(agent.id, TransitionEvent::TaskCompleted);
                    orchestrator.disband_agent(agent.id);
                }
            });
        }
    });

    let health = orchestrator.health();
    assert_eq!(health.total_agents, 0);
    assert_eq!(health.cleanup_pending_timers, 0);
    assert_eq!(health.cleanup_tracked_idle, 0);
    assert_eq!(orchestrator.cleanup().lock().tracked_agent_count(), 0);
}

#[test]
fn idle_agent_taking_a_task_stops_idle_tracking() {
    let (mut lifecycle, cleanup) = lifecycle_with_cleanup();
    let id = AgentId::new();
    lifecycle.register_agent(id, AgentLifecycleState::Idle);

    assert_eq!(
        lifecycle.fire_event(TransitionEvent::AssignTask, id),
        Some(AgentLifecycleState::Working)
    );
    let cleanup = cleanup.lock();
    assert!(!cleanup.is_idle(id));
    assert!(!cleanup.has_idle_timer(id));
    assert_eq!(cleanup.pending_timer_count(), 0);
}

#[test]
fn fifty_requests_under_a_limit_of_two() {
    let started: Arc<Mutex<VecDeque<StartGrant>>> = Arc::new(Mutex::new(VecDeque::new()));
    let sink = started.clone();
    let mut controller = ConcurrencyController::new(ConcurrencyConfig {
        max_concurrent: 2,
        ..ConcurrencyConfig::default()
    })
    .with_start_callback(Box::new(move |grant| {
        sink.lock().unwrap().push_back(*grant);
    }));

    let commander = CommanderId::new();
    let mut queued = 0;
    for i in 0..50 {
        match controller.request_start(commander, i, AgentModel::Sonnet, TaskPriority::Normal) {
            Admission::Started => {}
            Admission::Queued { .. } => queued += 1,
            Admission::Duplicate => panic!("unexpected duplicate"),
        }
    }
    assert_eq!(controller.current_active_count(), 2);
    assert_eq!(queued, 48);

    let mut completed = 0;
    loop {
        let next = started.lock().unwrap().pop_front();
        let Some(grant) = next else { break };
        controller.task_completed(grant.commander_id, grant.task_index);
        completed += 1;
    }

    assert_eq!(completed, 50);
    assert_eq!(controller.current_active_count(), 0);
    assert_eq!(controller.current_queued_count(), 0);
}

#[tokio::test]
async fn dependency_chain_runs_to_completion() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(
        SquadronConfig::default(),
        Arc::new(UuidAgentFactory),
        Some(tx),
    );
    let commander = CommanderId::new();
    orchestrator
        .schedule(
            commander,
            vec![
                SubTask::new("design schema", "sketch the tables"),
                SubTask::new("write migration", "").depends_on([0]),
                SubTask::new("write docs", "").depends_on([0, 1]),
            ],
        )
        .unwrap();

    let first = orchestrator.dispatch_ready(commander);
    assert_eq!(first, vec![(0, Admission::Started)]);

    // Drive every admission to completion until nothing is left.
    let mut order = Vec::new();
    while let Ok(event) = rx.try_recv() {
        let OrchestratorEvent::Admitted(grant) = event else {
            panic!("unexpected event {event:?}");
        };
        order.push(grant.task_index);
        orchestrator.task_finished(commander, grant.task_index, true);
        orchestrator.dispatch_ready(commander);
    }

    assert_eq!(order, vec![0, 1, 2]);
    assert!(orchestrator.cleanup().lock().has_team_cleanup(commander));
    assert_eq!(orchestrator.health().scheduler.completed, 3);
}

#[test]
fn failure_skips_dependents_but_not_independent_work() {
    let orchestrator = Orchestrator::new(
        SquadronConfig::default(),
        Arc::new(UuidAgentFactory),
        None,
    );
    let commander = CommanderId::new();
    orchestrator
        .schedule(
            commander,
            vec![
                SubTask::new("a", ""),
                SubTask::new("b", "").depends_on([0]),
                SubTask::new("c", "").depends_on([1]),
                SubTask::new("independent", ""),
            ],
        )
        .unwrap();

    let dispatched = orchestrator.dispatch_ready(commander);
    assert_eq!(dispatched.len(), 2);

    let skipped = orchestrator.task_finished(commander, 0, false);
    assert_eq!(skipped, vec![1, 2]);
    assert!(!orchestrator.cleanup().lock().has_team_cleanup(commander));

    orchestrator.task_finished(commander, 3, true);
    assert!(orchestrator.cleanup().lock().has_team_cleanup(commander));

    // A team with failures waits the longer, incomplete delay.
    let after_completed_delay = Instant::now() + Duration::from_secs(120);
    assert!(orchestrator.tick(after_completed_delay).is_empty());
    assert_eq!(
        orchestrator.tick(far_future()),
        vec![CleanupNotice::TeamExpired(commander)]
    );
}

#[test]
fn scheduler_state_is_visible_after_partial_progress() {
    let orchestrator = Orchestrator::new(
        SquadronConfig::default(),
        Arc::new(UuidAgentFactory),
        None,
    );
    let commander = CommanderId::new();
    orchestrator
        .schedule(
            commander,
            vec![
                SubTask::new("root", ""),
                SubTask::new("mid", "").depends_on([0]),
                SubTask::new("leaf", "").depends_on([0, 1]),
            ],
        )
        .unwrap();
    orchestrator.dispatch_ready(commander);
    assert_eq!(orchestrator.task_finished(commander, 0, true), vec![1]);

    // The leaf still waits for "mid".
    let dispatched = orchestrator.dispatch_ready(commander);
    assert_eq!(dispatched, vec![(1, Admission::Started)]);
    assert!(orchestrator.dispatch_ready(commander).is_empty());
}

#[test]
fn pool_caps_and_shrink() {
    let mut pool = SubAgentPoolManager::new(
        PoolConfig {
            max_pool_size: 10,
            max_per_role: 10,
            shrink_cooldown_secs: 0,
            ..PoolConfig::default()
        },
        Arc::new(UuidAgentFactory),
    );

    let admitted = (0..15)
        .filter(|_| {
            pool.release(Agent::new(
                CommanderId::new(),
                AgentRole::Researcher,
                AgentModel::Sonnet,
            ))
        })
        .count();
    assert_eq!(admitted, 10);
    assert_eq!(pool.stats().evictions, 5);

    assert_eq!(pool.shrink_pool(3), 7);
    assert_eq!(pool.pooled_count(), 3);
    assert_eq!(pool.stats().evictions, 12);
}

#[test]
fn aggressive_policy_from_config_file_reclaims_idle_agents() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"cleanup": {{"policy": "aggressive"}}}}"#).unwrap();
    let config = squadron_core::config::load_config(file.path()).unwrap();

    let orchestrator = Orchestrator::new(config, Arc::new(UuidAgentFactory), None);
    let agent = orchestrator.spawn_agent(CommanderId::new(), AgentRole::Tester, AgentModel::Haiku);
    orchestrator.fire(agent.id, TransitionEvent::ResourcesLoaded);

    // Aggressive: 60 s idle timeout.
    assert!(orchestrator.tick(Instant::now() + Duration::from_secs(30)).is_empty());
    assert_eq!(
        orchestrator.tick(Instant::now() + Duration::from_secs(61)),
        vec![CleanupNotice::IdleExpired(agent.id)]
    );
    assert_eq!(orchestrator.agent_state(agent.id), None);
    assert_eq!(orchestrator.health().total_agents, 0);
}

#[test]
fn full_pool_disbands_released_agents() {
    let mut config = SquadronConfig::default();
    config.pool.max_pool_size = 1;
    config.pool.max_per_role = 1;
    let orchestrator = Orchestrator::new(config, Arc::new(UuidAgentFactory), None);
    let commander = CommanderId::new();

    let first = orchestrator.spawn_agent(commander, AgentRole::Writer, AgentModel::Sonnet);
    let second = orchestrator.spawn_agent(commander, AgentRole::Writer, AgentModel::Sonnet);
    for id in [first.id, second.id] {
        orchestrator.fire(id, TransitionEvent::ResourcesLoaded);
    }

    assert!(orchestrator.release_agent(first.id));
    assert!(!orchestrator.release_agent(second.id));
    assert_eq!(
        orchestrator.agent_state(first.id),
        Some(AgentLifecycleState::Pooled)
    );
    assert_eq!(orchestrator.agent_state(second.id), None);
    assert_eq!(orchestrator.health().pool.evictions, 1);
}
