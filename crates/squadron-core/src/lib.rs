//! Squadron Core Library
//!
//! Shared vocabulary for the Squadron orchestration control plane:
//! - Opaque agent/commander identifiers, roles and models
//! - The agent lifecycle state set and its transition table
//! - Resource pressure classification
//! - Configuration loading and tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod tracing_init;
pub mod types;

pub use config::SquadronConfig;
pub use error::{Error, Result};
pub use lifecycle::{AgentLifecycleState, LegacyAgentStatus, TransitionEvent};
pub use types::{
    Agent, AgentId, AgentModel, AgentRole, CommanderId, ResourcePressure, ResourceSnapshot,
    TaskComplexity, TaskPriority,
};
