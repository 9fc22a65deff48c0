//! Squadron Daemon Library
//!
//! The orchestration engine behind the Squadron daemon:
//! - Agent lifecycle state tracking with a bounded transition log
//! - Idle/suspended/team cleanup deadlines
//! - Pressure-aware admission control for running agents
//! - Dependency-aware subtask scheduling with failure cascades
//! - Reuse of released agent instances

pub mod orchestration;
