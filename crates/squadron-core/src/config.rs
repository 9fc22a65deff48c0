//! Configuration for the Squadron control plane.
//!
//! Every section has documented defaults; a settings file only needs to
//! name the values it overrides. Durations are expressed in seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::PressureThresholds;

/// Complete Squadron configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SquadronConfig {
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pressure: PressureThresholds,
}

impl SquadronConfig {
    /// Reject values that would leave a component unable to make progress.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency.max_concurrent == 0 {
            return Err(Error::Config(
                "concurrency.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.concurrency.min_concurrent == 0 {
            return Err(Error::Config(
                "concurrency.min_concurrent must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.concurrency.high_pressure_factor) {
            return Err(Error::Config(
                "concurrency.high_pressure_factor must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.pool.max_per_role > self.pool.max_pool_size {
            return Err(Error::Config(format!(
                "pool.max_per_role ({}) exceeds pool.max_pool_size ({})",
                self.pool.max_per_role, self.pool.max_pool_size
            )));
        }
        if self.lifecycle.transition_log_capacity == 0 {
            return Err(Error::Config(
                "lifecycle.transition_log_capacity must be at least 1".to_string(),
            ));
        }
        if self.cleanup.tick_interval_ms == 0 {
            return Err(Error::Config(
                "cleanup.tick_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Maximum number of transition records retained in the log.
    pub transition_log_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            transition_log_capacity: 1000,
        }
    }
}

/// How eagerly idle agents are reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CleanupPolicy {
    Conservative,
    #[default]
    Default,
    Aggressive,
}

impl CleanupPolicy {
    pub const ALL: [Self; 3] = [Self::Conservative, Self::Default, Self::Aggressive];

    /// Base idle timeout before pressure adjustment.
    pub const fn idle_timeout(self) -> Duration {
        match self {
            Self::Conservative => Duration::from_secs(900),
            Self::Default => Duration::from_secs(300),
            Self::Aggressive => Duration::from_secs(60),
        }
    }
}

/// Cleanup manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub policy: CleanupPolicy,
    /// Delay before tearing down a team whose tasks all completed.
    pub team_cleanup_completed_secs: u64,
    /// Delay before tearing down a team with unfinished tasks.
    pub team_cleanup_incomplete_secs: u64,
    pub suspended_timeout_secs: u64,
    /// Timeout multiplier under high pressure.
    pub high_pressure_factor: f64,
    /// Timeout multiplier under critical pressure.
    pub critical_pressure_factor: f64,
    /// How often the daemon polls for due deadlines.
    pub tick_interval_ms: u64,
}

impl CleanupConfig {
    pub const fn team_cleanup_completed(&self) -> Duration {
        Duration::from_secs(self.team_cleanup_completed_secs)
    }

    pub const fn team_cleanup_incomplete(&self) -> Duration {
        Duration::from_secs(self.team_cleanup_incomplete_secs)
    }

    pub const fn suspended_timeout(&self) -> Duration {
        Duration::from_secs(self.suspended_timeout_secs)
    }

    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            policy: CleanupPolicy::Default,
            team_cleanup_completed_secs: 60,
            team_cleanup_incomplete_secs: 300,
            suspended_timeout_secs: 600,
            high_pressure_factor: 0.5,
            critical_pressure_factor: 0.25,
            tick_interval_ms: 1000,
        }
    }
}

/// Concurrency controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Base limit under normal pressure.
    pub max_concurrent: usize,
    /// Fraction of the base limit allowed under high pressure.
    pub high_pressure_factor: f64,
    /// Floor for the effective limit; also the limit under critical pressure.
    pub min_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            high_pressure_factor: 0.5,
            min_concurrent: 1,
        }
    }
}

/// Sub-agent pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_pool_size: usize,
    pub max_per_role: usize,
    /// Size the pool shrinks to under critical pressure.
    pub min_pool_size: usize,
    /// Minimum spacing between shrink operations; zero disables the cooldown.
    pub shrink_cooldown_secs: u64,
}

impl PoolConfig {
    pub const fn shrink_cooldown(&self) -> Duration {
        Duration::from_secs(self.shrink_cooldown_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 20,
            max_per_role: 5,
            min_pool_size: 2,
            shrink_cooldown_secs: 30,
        }
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub default_batch_size: usize,
    pub keywords: PriorityKeywords,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 6,
            keywords: PriorityKeywords::default(),
        }
    }
}

/// Lowercase keywords used to infer a subtask's priority from its text.
///
/// Tiers are checked from most to least urgent; the first tier with a
/// matching keyword wins and anything unmatched is normal priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityKeywords {
    pub critical: Vec<String>,
    pub high: Vec<String>,
    pub low: Vec<String>,
}

impl Default for PriorityKeywords {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| (*w).to_string()).collect();
        Self {
            critical: words(&[
                "security",
                "vulnerability",
                "exploit",
                "crash",
                "bug",
                "urgent",
                "hotfix",
            ]),
            high: words(&["fix", "error", "failing", "regression", "performance"]),
            low: words(&["documentation", "docs", "readme", "comment", "typo"]),
        }
    }
}

/// Load configuration from a JSON settings file.
///
/// A missing file yields the defaults; an unreadable or malformed one is an
/// error. The result is validated before it is returned.
pub fn load_config(path: &Path) -> Result<SquadronConfig> {
    let config = if path.exists() {
        load_config_file(path)?
    } else {
        SquadronConfig::default()
    };
    config.validate()?;
    Ok(config)
}

fn load_config_file(path: &Path) -> Result<SquadronConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}
