//! Agent lifecycle states, transition events and the transition table.
//!
//! The table in [`AgentLifecycleState::on_event`] is the single source of
//! truth for legal state changes. Pairs absent from it are invalid and must
//! never mutate an agent's state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Canonical state of a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AgentLifecycleState {
    Initializing,
    Idle,
    Working,
    Thinking,
    RequestingPermission,
    WaitingForAnswer,
    ReviewingPlan,
    Completed,
    Error,
    Suspended,
    SuspendedIdle,
    Pooled,
    Destroying,
    Destroyed,
}

impl AgentLifecycleState {
    pub const ALL: [Self; 14] = [
        Self::Initializing,
        Self::Idle,
        Self::Working,
        Self::Thinking,
        Self::RequestingPermission,
        Self::WaitingForAnswer,
        Self::ReviewingPlan,
        Self::Completed,
        Self::Error,
        Self::Suspended,
        Self::SuspendedIdle,
        Self::Pooled,
        Self::Destroying,
        Self::Destroyed,
    ];

    /// No transition leaves a terminal state.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// The agent is executing (or blocked inside) a task.
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Working
                | Self::Thinking
                | Self::RequestingPermission
                | Self::WaitingForAnswer
                | Self::ReviewingPlan
        )
    }

    /// The agent can take a new task without being constructed.
    pub const fn is_available_for_task(self) -> bool {
        matches!(self, Self::Idle | Self::Pooled | Self::SuspendedIdle)
    }

    /// Idle or terminal reclamation may start from this state.
    ///
    /// These are also the states that arm the idle cleanup timer.
    pub const fn is_cleanup_candidate(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Error | Self::SuspendedIdle | Self::Idle
        )
    }

    pub const fn is_suspended(self) -> bool {
        matches!(self, Self::Suspended | Self::SuspendedIdle)
    }

    /// The agent still owns a live worker process.
    pub const fn holds_process(self) -> bool {
        self.is_active() || matches!(self, Self::Initializing | Self::Suspended)
    }

    /// Look up the transition table.
    ///
    /// Returns `None` when `(self, event)` is not a legal transition.
    pub const fn on_event(self, event: TransitionEvent) -> Option<Self> {
        use AgentLifecycleState as S;
        use TransitionEvent as E;

        let next = match (self, event) {
            (S::Initializing, E::ResourcesLoaded) => S::Idle,
            (S::Initializing, E::ErrorOccurred) => S::Error,

            (S::Idle, E::AssignTask) => S::Working,
            (S::Idle, E::IdleTimeout) => S::SuspendedIdle,
            (S::Idle, E::ReturnToPool) => S::Pooled,

            (S::Working, E::AiReasoning) => S::Thinking,
            (S::Working | S::Thinking, E::ToolInvoked) | (S::Thinking, E::ReasoningComplete) => {
                S::Working
            }
            (
                S::Working | S::Thinking | S::RequestingPermission | S::WaitingForAnswer
                | S::ReviewingPlan,
                E::Suspend,
            ) => S::Suspended,
            (S::Working | S::Thinking, E::PermissionRequested) => S::RequestingPermission,
            (S::Working | S::Thinking, E::QuestionAsked) => S::WaitingForAnswer,
            (S::Working | S::Thinking, E::PlanProposed) => S::ReviewingPlan,
            (S::Working | S::Thinking, E::TaskCompleted) => S::Completed,
            (
                S::Working
                | S::Thinking
                | S::RequestingPermission
                | S::WaitingForAnswer
                | S::ReviewingPlan
                | S::Suspended,
                E::ErrorOccurred,
            ) => S::Error,

            (S::RequestingPermission, E::PermissionGranted) => S::Working,
            (S::RequestingPermission, E::PermissionDenied) => S::Thinking,
            (S::WaitingForAnswer, E::AnswerReceived) => S::Thinking,
            (S::ReviewingPlan, E::PlanApproved) => S::Working,
            (S::ReviewingPlan, E::PlanRejected) => S::Thinking,

            (S::Completed | S::SuspendedIdle | S::Pooled, E::AssignTask) => S::Working,
            (S::Completed | S::Error, E::Reset) => S::Idle,
            (S::Completed | S::SuspendedIdle, E::ReturnToPool) => S::Pooled,
            (S::Error, E::Retry) => S::Working,

            (S::Suspended, E::Resume) => S::Working,
            (S::Suspended, E::IdleTimeout) => S::SuspendedIdle,
            (S::SuspendedIdle, E::Resume) | (S::Pooled, E::AcquiredFromPool) => S::Idle,

            (
                S::Initializing
                | S::Idle
                | S::Working
                | S::Thinking
                | S::RequestingPermission
                | S::WaitingForAnswer
                | S::ReviewingPlan
                | S::Completed
                | S::Error
                | S::Suspended
                | S::SuspendedIdle
                | S::Pooled,
                E::DisbandScheduled,
            ) => S::Destroying,
            (S::Destroying, E::AnimationComplete) => S::Destroyed,

            _ => return None,
        };
        Some(next)
    }

    /// Events with a defined transition out of this state.
    pub fn valid_events(self) -> Vec<TransitionEvent> {
        TransitionEvent::ALL
            .into_iter()
            .filter(|event| self.on_event(*event).is_some())
            .collect()
    }

    /// Coarse status reported to legacy consumers.
    pub const fn legacy_status(self) -> LegacyAgentStatus {
        match self {
            Self::Working => LegacyAgentStatus::Working,
            Self::Thinking => LegacyAgentStatus::Thinking,
            Self::RequestingPermission => LegacyAgentStatus::RequestingPermission,
            Self::WaitingForAnswer | Self::ReviewingPlan | Self::Suspended => {
                LegacyAgentStatus::WaitingForAnswer
            }
            Self::Completed => LegacyAgentStatus::Completed,
            Self::Error => LegacyAgentStatus::Error,
            Self::Initializing
            | Self::Idle
            | Self::SuspendedIdle
            | Self::Pooled
            | Self::Destroying
            | Self::Destroyed => LegacyAgentStatus::Idle,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Thinking => "thinking",
            Self::RequestingPermission => "requestingPermission",
            Self::WaitingForAnswer => "waitingForAnswer",
            Self::ReviewingPlan => "reviewingPlan",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Suspended => "suspended",
            Self::SuspendedIdle => "suspendedIdle",
            Self::Pooled => "pooled",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for AgentLifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentLifecycleState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| Error::UnknownVariant {
                kind: "lifecycle state",
                value: s.to_string(),
            })
    }
}

/// Signals that drive the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionEvent {
    ResourcesLoaded,
    AssignTask,
    AiReasoning,
    ReasoningComplete,
    ToolInvoked,
    PermissionRequested,
    PermissionGranted,
    PermissionDenied,
    QuestionAsked,
    AnswerReceived,
    PlanProposed,
    PlanApproved,
    PlanRejected,
    TaskCompleted,
    ErrorOccurred,
    Retry,
    Reset,
    Suspend,
    Resume,
    IdleTimeout,
    ReturnToPool,
    AcquiredFromPool,
    DisbandScheduled,
    AnimationComplete,
}

impl TransitionEvent {
    pub const ALL: [Self; 24] = [
        Self::ResourcesLoaded,
        Self::AssignTask,
        Self::AiReasoning,
        Self::ReasoningComplete,
        Self::ToolInvoked,
        Self::PermissionRequested,
        Self::PermissionGranted,
        Self::PermissionDenied,
        Self::QuestionAsked,
        Self::AnswerReceived,
        Self::PlanProposed,
        Self::PlanApproved,
        Self::PlanRejected,
        Self::TaskCompleted,
        Self::ErrorOccurred,
        Self::Retry,
        Self::Reset,
        Self::Suspend,
        Self::Resume,
        Self::IdleTimeout,
        Self::ReturnToPool,
        Self::AcquiredFromPool,
        Self::DisbandScheduled,
        Self::AnimationComplete,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourcesLoaded => "resourcesLoaded",
            Self::AssignTask => "assignTask",
            Self::AiReasoning => "aiReasoning",
            Self::ReasoningComplete => "reasoningComplete",
            Self::ToolInvoked => "toolInvoked",
            Self::PermissionRequested => "permissionRequested",
            Self::PermissionGranted => "permissionGranted",
            Self::PermissionDenied => "permissionDenied",
            Self::QuestionAsked => "questionAsked",
            Self::AnswerReceived => "answerReceived",
            Self::PlanProposed => "planProposed",
            Self::PlanApproved => "planApproved",
            Self::PlanRejected => "planRejected",
            Self::TaskCompleted => "taskCompleted",
            Self::ErrorOccurred => "errorOccurred",
            Self::Retry => "retry",
            Self::Reset => "reset",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::IdleTimeout => "idleTimeout",
            Self::ReturnToPool => "returnToPool",
            Self::AcquiredFromPool => "acquiredFromPool",
            Self::DisbandScheduled => "disbandScheduled",
            Self::AnimationComplete => "animationComplete",
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransitionEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| Error::UnknownVariant {
                kind: "transition event",
                value: s.to_string(),
            })
    }
}

/// Seven-value status kept for backward-compatible reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LegacyAgentStatus {
    Idle,
    Working,
    Thinking,
    RequestingPermission,
    WaitingForAnswer,
    Completed,
    Error,
}
