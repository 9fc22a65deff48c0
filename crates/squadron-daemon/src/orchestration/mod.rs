//! Sub-agent orchestration: lifecycle, cleanup, admission, scheduling, pooling.
//!
//! - [`AgentLifecycleManager`]: Per-agent state machine with a bounded
//!   transition log and emergency reclamation.
//! - [`CleanupManager`]: Idle, suspended and team teardown deadlines.
//! - [`ConcurrencyController`]: Priority-ordered admission under a
//!   pressure-adjusted limit.
//! - [`TaskPriorityScheduler`]: Dependency-aware subtask batching with
//!   failure cascades.
//! - [`SubAgentPoolManager`]: Per-role reuse of released agents.
//! - [`Orchestrator`]: Wires the above together for the daemon.

pub mod cleanup;
pub mod concurrency;
pub mod deadline;
pub mod lifecycle;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;

pub use cleanup::{CleanupManager, CleanupNotice, IdleTracker, SharedCleanupManager};
pub use concurrency::{Admission, ConcurrencyController, StartGrant};
pub use lifecycle::{AgentLifecycleManager, LifecycleMetrics, TransitionRecord};
pub use orchestrator::{HealthSnapshot, Orchestrator, OrchestratorEvent};
pub use pool::{AgentFactory, PoolStats, SubAgentPoolManager, UuidAgentFactory};
pub use scheduler::{SchedulerError, SubTask, TaskPriorityScheduler, TaskState};
