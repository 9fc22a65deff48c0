//! Identifiers, roles, models and resource-pressure vocabulary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::lifecycle::AgentLifecycleState;

/// Opaque identifier of a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(Uuid);

impl AgentId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AgentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|_| Error::UnknownVariant {
            kind: "agent id",
            value: s.to_string(),
        })
    }
}

/// Opaque identifier of a commander (the owner of an orchestration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommanderId(Uuid);

impl CommanderId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CommanderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommanderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CommanderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|_| Error::UnknownVariant {
            kind: "commander id",
            value: s.to_string(),
        })
    }
}

/// Specialisation of a sub-agent. Fixed for the lifetime of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentRole {
    Developer,
    Researcher,
    Tester,
    Reviewer,
    Designer,
    Writer,
    Analyst,
    Planner,
}

impl AgentRole {
    pub const ALL: [Self; 8] = [
        Self::Developer,
        Self::Researcher,
        Self::Tester,
        Self::Reviewer,
        Self::Designer,
        Self::Writer,
        Self::Analyst,
        Self::Planner,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Researcher => "researcher",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Designer => "designer",
            Self::Writer => "writer",
            Self::Analyst => "analyst",
            Self::Planner => "planner",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| Error::UnknownVariant {
                kind: "agent role",
                value: s.to_string(),
            })
    }
}

/// Execution model selected for a sub-agent.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum AgentModel {
    Opus,
    #[default]
    Sonnet,
    Haiku,
}

impl AgentModel {
    pub const ALL: [Self; 3] = [Self::Opus, Self::Sonnet, Self::Haiku];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::Sonnet => "sonnet",
            Self::Haiku => "haiku",
        }
    }
}

impl fmt::Display for AgentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|model| model.as_str() == s)
            .ok_or_else(|| Error::UnknownVariant {
                kind: "agent model",
                value: s.to_string(),
            })
    }
}

/// A worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub role: AgentRole,
    pub model: AgentModel,
    pub parent_id: CommanderId,
    pub state: AgentLifecycleState,
}

impl Agent {
    /// Build a new agent in the `initializing` state.
    pub fn new(parent_id: CommanderId, role: AgentRole, model: AgentModel) -> Self {
        Self {
            id: AgentId::new(),
            role,
            model,
            parent_id,
            state: AgentLifecycleState::Initializing,
        }
    }
}

/// Scheduling urgency of a subtask or start request.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    pub const ALL: [Self; 4] = [Self::Low, Self::Normal, Self::High, Self::Critical];
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Rough size of a subtask, supplied by whoever decomposed the work.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TaskComplexity {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskComplexity {
    /// Model best suited to a task of this size.
    pub const fn preferred_model(self) -> AgentModel {
        match self {
            Self::Low => AgentModel::Haiku,
            Self::Medium => AgentModel::Sonnet,
            Self::High => AgentModel::Opus,
        }
    }
}

/// Externally supplied system load level.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum ResourcePressure {
    #[default]
    Normal,
    High,
    Critical,
}

impl ResourcePressure {
    pub const ALL: [Self; 3] = [Self::Normal, Self::High, Self::Critical];

    /// Classify a resource snapshot against the given thresholds.
    pub fn classify(snapshot: ResourceSnapshot, thresholds: &PressureThresholds) -> Self {
        if snapshot.cpu_percent >= thresholds.critical_cpu_percent
            || snapshot.memory_mb >= thresholds.critical_memory_mb
        {
            Self::Critical
        } else if snapshot.cpu_percent >= thresholds.high_cpu_percent
            || snapshot.memory_mb >= thresholds.high_memory_mb
        {
            Self::High
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for ResourcePressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

/// Latest CPU/memory reading for one agent (or an aggregate of several).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl ResourceSnapshot {
    pub const fn new(cpu_percent: f64, memory_mb: f64) -> Self {
        Self {
            cpu_percent,
            memory_mb,
        }
    }
}

impl std::ops::Add for ResourceSnapshot {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu_percent: self.cpu_percent + rhs.cpu_percent,
            memory_mb: self.memory_mb + rhs.memory_mb,
        }
    }
}

/// CPU/memory boundaries between pressure levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    pub high_cpu_percent: f64,
    pub critical_cpu_percent: f64,
    pub high_memory_mb: f64,
    pub critical_memory_mb: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            high_cpu_percent: 70.0,
            critical_cpu_percent: 90.0,
            high_memory_mb: 4096.0,
            critical_memory_mb: 8192.0,
        }
    }
}
