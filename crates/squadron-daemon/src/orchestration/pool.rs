//! Reuse pool for released sub-agents.
//!
//! [`SubAgentPoolManager`] keeps released agents per role so that a later
//! request for the same role can skip construction. Capacity is bounded
//! globally and per role; the pool shrinks on demand or under resource
//! pressure, evicting the oldest agents of the largest role bucket first.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use squadron_core::config::PoolConfig;
use squadron_core::{
    Agent, AgentId, AgentLifecycleState, AgentModel, AgentRole, CommanderId, ResourcePressure,
};

/// Builds fresh agents when the pool has none to hand out.
pub trait AgentFactory: Send + Sync {
    fn create(&self, parent_id: CommanderId, role: AgentRole, model: AgentModel) -> Agent;
}

/// Creates agents with random v4 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidAgentFactory;

impl AgentFactory for UuidAgentFactory {
    fn create(&self, parent_id: CommanderId, role: AgentRole, model: AgentModel) -> Agent {
        Agent::new(parent_id, role, model)
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub peak_size: usize,
    pub current_size: usize,
}

impl PoolStats {
    /// Fraction of lookups served from the pool; 0 when there were none.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub struct SubAgentPoolManager {
    config: PoolConfig,
    factory: Arc<dyn AgentFactory>,
    /// Oldest release at the front.
    pooled: BTreeMap<AgentRole, VecDeque<Agent>>,
    hits: u64,
    misses: u64,
    evictions: u64,
    peak_size: usize,
    last_shrink: Option<Instant>,
}

impl std::fmt::Debug for SubAgentPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentPoolManager")
            .field("config", &self.config)
            .field("pooled", &self.pooled_count())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubAgentPoolManager {
    pub fn new(config: PoolConfig, factory: Arc<dyn AgentFactory>) -> Self {
        info!(
            max_pool_size = config.max_pool_size,
            max_per_role = config.max_per_role,
            "SubAgentPoolManager created"
        );
        Self {
            config,
            factory,
            pooled: BTreeMap::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
            peak_size: 0,
            last_shrink: None,
        }
    }

    /// Take the oldest pooled agent of `role`, rebound to `parent_id` and
    /// `model` and set to idle.
    pub fn acquire(
        &mut self,
        role: AgentRole,
        parent_id: CommanderId,
        model: AgentModel,
    ) -> Option<Agent> {
        let Some(mut agent) = self.pooled.get_mut(&role).and_then(VecDeque::pop_front) else {
            self.misses += 1;
            debug!(%role, "Pool miss");
            return None;
        };
        self.hits += 1;
        agent.parent_id = parent_id;
        agent.model = model;
        agent.state = AgentLifecycleState::Idle;
        debug!(agent_id = %agent.id, %role, "Pool hit");
        Some(agent)
    }

    /// [`Self::acquire`], falling back to the factory on a miss.
    pub fn acquire_or_create(
        &mut self,
        role: AgentRole,
        parent_id: CommanderId,
        model: AgentModel,
    ) -> Agent {
        self.acquire(role, parent_id, model)
            .unwrap_or_else(|| self.factory.create(parent_id, role, model))
    }

    /// Construct a fresh agent without touching the pool counters.
    pub fn create(&self, role: AgentRole, parent_id: CommanderId, model: AgentModel) -> Agent {
        self.factory.create(parent_id, role, model)
    }

    /// Return `agent` to the pool.
    ///
    /// Returns `false` (counted as an eviction) when the pool or the role
    /// bucket is full.
    pub fn release(&mut self, mut agent: Agent) -> bool {
        let role_count = self.pooled_count_for(agent.role);
        if self.pooled_count() >= self.config.max_pool_size
            || role_count >= self.config.max_per_role
        {
            self.evictions += 1;
            debug!(agent_id = %agent.id, role = %agent.role, "Pool full, release rejected");
            return false;
        }

        agent.state = AgentLifecycleState::Pooled;
        debug!(agent_id = %agent.id, role = %agent.role, "Agent pooled");
        self.pooled.entry(agent.role).or_default().push_back(agent);
        self.peak_size = self.peak_size.max(self.pooled_count());
        true
    }

    /// Pull agent `id` out of the pool without counting a hit or an eviction.
    pub fn take(&mut self, id: AgentId) -> Option<Agent> {
        let (role, position) = self.pooled.iter().find_map(|(role, bucket)| {
            bucket
                .iter()
                .position(|agent| agent.id == id)
                .map(|position| (*role, position))
        })?;
        let bucket = self.pooled.get_mut(&role)?;
        let agent = bucket.remove(position)?;
        if bucket.is_empty() {
            self.pooled.remove(&role);
        }
        debug!(agent_id = %id, %role, "Agent taken out of pool");
        Some(agent)
    }

    pub fn has_available(&self, role: AgentRole) -> bool {
        self.pooled_count_for(role) > 0
    }

    pub fn pooled_count(&self) -> usize {
        self.pooled.values().map(VecDeque::len).sum()
    }

    pub fn pooled_count_for(&self, role: AgentRole) -> usize {
        self.pooled.get(&role).map_or(0, VecDeque::len)
    }

    /// Evict agents until at most `target` remain.
    ///
    /// Returns 0 without evicting while the shrink cooldown is running.
    pub fn shrink_pool(&mut self, target: usize) -> usize {
        self.shrink_at(target, Instant::now()).len()
    }

    fn shrink_at(&mut self, target: usize, now: Instant) -> Vec<Agent> {
        if self.pooled_count() <= target {
            return Vec::new();
        }
        let cooldown = self.config.shrink_cooldown();
        if let Some(last) = self.last_shrink
            && !cooldown.is_zero()
            && now.saturating_duration_since(last) < cooldown
        {
            debug!(target, "Pool shrink skipped during cooldown");
            return Vec::new();
        }

        let evicted = self.evict_down_to(target);
        if !evicted.is_empty() {
            self.last_shrink = Some(now);
            info!(
                evicted = evicted.len(),
                remaining = self.pooled_count(),
                "Pool shrunk"
            );
        }
        evicted
    }

    /// Shrink according to `pressure`. Returns the number evicted.
    pub fn evaluate_and_resize(&mut self, pressure: ResourcePressure) -> usize {
        self.resize_for_pressure(pressure).len()
    }

    /// Shrink according to `pressure` and hand back the evicted agents:
    /// critical keeps `min_pool_size`, high keeps half (not below the
    /// minimum), normal keeps everything.
    pub fn resize_for_pressure(&mut self, pressure: ResourcePressure) -> Vec<Agent> {
        let floor = self.config.min_pool_size;
        let target = match pressure {
            ResourcePressure::Normal => return Vec::new(),
            ResourcePressure::High => (self.pooled_count() / 2).max(floor),
            ResourcePressure::Critical => floor,
        };
        self.shrink_at(target, Instant::now())
    }

    /// Empty the pool, ignoring the cooldown. Returns the number evicted.
    pub fn remove_all(&mut self) -> usize {
        self.drain_all().len()
    }

    /// Empty the pool, ignoring the cooldown, and hand back the evicted agents.
    pub fn drain_all(&mut self) -> Vec<Agent> {
        let evicted = self.evict_down_to(0);
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Pool emptied");
        }
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            peak_size: self.peak_size,
            current_size: self.pooled_count(),
        }
    }

    /// Oldest first from the largest bucket; ties go to the earlier role.
    fn evict_down_to(&mut self, target: usize) -> Vec<Agent> {
        let mut evicted = Vec::new();
        while self.pooled_count() > target {
            let Some(role) = self.largest_bucket() else {
                break;
            };
            let Some(agent) = self.pooled.get_mut(&role).and_then(VecDeque::pop_front) else {
                break;
            };
            debug!(agent_id = %agent.id, %role, "Pooled agent evicted");
            evicted.push(agent);
        }
        self.pooled.retain(|_, bucket| !bucket.is_empty());
        self.evictions += evicted.len() as u64;
        evicted
    }

    fn largest_bucket(&self) -> Option<AgentRole> {
        let mut best: Option<(AgentRole, usize)> = None;
        for (role, bucket) in &self.pooled {
            if bucket.len() > best.map_or(0, |(_, len)| len) {
                best = Some((*role, bucket.len()));
            }
        }
        best.map(|(role, _)| role)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pool(max_pool_size: usize, max_per_role: usize) -> SubAgentPoolManager {
        SubAgentPoolManager::new(
            PoolConfig {
                max_pool_size,
                max_per_role,
                shrink_cooldown_secs: 0,
                ..PoolConfig::default()
            },
            Arc::new(UuidAgentFactory),
        )
    }

    fn agent(role: AgentRole) -> Agent {
        Agent::new(CommanderId::new(), role, AgentModel::Sonnet)
    }

    #[test]
    fn take_pulls_one_agent_without_counting() {
        let mut p = pool(20, 5);
        let first = agent(AgentRole::Writer);
        let second = agent(AgentRole::Writer);
        let second_id = second.id;
        p.release(first);
        p.release(second);

        assert_eq!(p.take(second_id).map(|a| a.id), Some(second_id));
        assert!(p.take(second_id).is_none());
        assert_eq!(p.pooled_count_for(AgentRole::Writer), 1);
        let stats = p.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions), (0, 0, 0));
    }

    #[test]
    fn release_then_acquire_rebinds_agent() {
        let mut p = pool(20, 5);
        let released = agent(AgentRole::Tester);
        let id = released.id;
        assert!(p.release(released));
        assert!(p.has_available(AgentRole::Tester));

        let parent = CommanderId::new();
        let reused = p
            .acquire(AgentRole::Tester, parent, AgentModel::Opus)
            .unwrap();
        assert_eq!(reused.id, id);
        assert_eq!(reused.parent_id, parent);
        assert_eq!(reused.model, AgentModel::Opus);
        assert_eq!(reused.state, AgentLifecycleState::Idle);
        assert_eq!(p.pooled_count(), 0);
    }

    #[test]
    fn acquire_is_fifo_per_role() {
        let mut p = pool(20, 5);
        let first = agent(AgentRole::Developer);
        let second = agent(AgentRole::Developer);
        let first_id = first.id;
        p.release(first);
        p.release(second);

        let got = p
            .acquire(AgentRole::Developer, CommanderId::new(), AgentModel::Sonnet)
            .unwrap();
        assert_eq!(got.id, first_id);
    }

    #[test]
    fn acquire_or_create_falls_back_to_factory() {
        let mut p = pool(20, 5);
        let parent = CommanderId::new();
        let fresh = p.acquire_or_create(AgentRole::Writer, parent, AgentModel::Haiku);
        assert_eq!(fresh.parent_id, parent);
        assert_eq!(fresh.role, AgentRole::Writer);
        assert_eq!(fresh.state, AgentLifecycleState::Initializing);

        let stats = p.stats();
        assert_eq!((stats.hits, stats.misses), (0, 1));
    }

    #[test]
    fn per_role_cap_rejects_and_counts_evictions() {
        let mut p = pool(10, 10);
        let mut admitted = 0;
        for _ in 0..15 {
            if p.release(agent(AgentRole::Reviewer)) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
        assert_eq!(p.stats().evictions, 5);
        assert_eq!(p.stats().peak_size, 10);

        assert_eq!(p.shrink_pool(3), 7);
        assert_eq!(p.pooled_count(), 3);
    }

    #[test]
    fn global_cap_applies_across_roles() {
        let mut p = pool(3, 2);
        assert!(p.release(agent(AgentRole::Developer)));
        assert!(p.release(agent(AgentRole::Developer)));
        assert!(!p.release(agent(AgentRole::Developer)));
        assert!(p.release(agent(AgentRole::Tester)));
        assert!(!p.release(agent(AgentRole::Planner)));
        assert_eq!(p.stats().evictions, 2);
    }

    #[test]
    fn shrink_evicts_from_largest_bucket_first() {
        let mut p = pool(20, 10);
        for _ in 0..4 {
            p.release(agent(AgentRole::Designer));
        }
        p.release(agent(AgentRole::Analyst));

        assert_eq!(p.shrink_pool(3), 2);
        assert_eq!(p.pooled_count_for(AgentRole::Designer), 2);
        assert_eq!(p.pooled_count_for(AgentRole::Analyst), 1);
    }

    #[test]
    fn shrink_respects_cooldown() {
        let mut p = SubAgentPoolManager::new(
            PoolConfig {
                shrink_cooldown_secs: 30,
                ..PoolConfig::default()
            },
            Arc::new(UuidAgentFactory),
        );
        for _ in 0..5 {
            p.release(agent(AgentRole::Developer));
        }

        let start = Instant::now();
        assert_eq!(p.shrink_at(4, start).len(), 1);
        assert!(p.shrink_at(2, start + Duration::from_secs(10)).is_empty());
        assert_eq!(p.shrink_at(2, start + Duration::from_secs(31)).len(), 2);
    }

    #[test]
    fn pressure_resizing() {
        let mut p = pool(20, 10);
        for _ in 0..10 {
            p.release(agent(AgentRole::Developer));
        }
        assert_eq!(p.evaluate_and_resize(ResourcePressure::Normal), 0);
        assert_eq!(p.evaluate_and_resize(ResourcePressure::High), 5);
        assert_eq!(p.pooled_count(), 5);
        assert_eq!(p.evaluate_and_resize(ResourcePressure::Critical), 3);
        assert_eq!(p.pooled_count(), 2);
        // Already at the floor.
        assert_eq!(p.evaluate_and_resize(ResourcePressure::High), 0);
    }

    #[test]
    fn resize_hands_back_evicted_agents() {
        let mut p = pool(20, 10);
        let mut ids: Vec<_> = (0..4)
            .map(|_| {
                let a = agent(AgentRole::Researcher);
                let id = a.id;
                p.release(a);
                id
            })
            .collect();
        ids.truncate(2);

        let evicted: Vec<_> = p
            .resize_for_pressure(ResourcePressure::Critical)
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(evicted, ids, "oldest agents go first");
        assert!(p.resize_for_pressure(ResourcePressure::Normal).is_empty());
    }

    #[test]
    fn remove_all_ignores_cooldown() {
        let mut p = SubAgentPoolManager::new(PoolConfig::default(), Arc::new(UuidAgentFactory));
        for role in AgentRole::ALL {
            p.release(agent(role));
        }
        p.shrink_pool(4);
        assert_eq!(p.remove_all(), 4);
        assert_eq!(p.pooled_count(), 0);
        assert_eq!(p.stats().evictions, AgentRole::ALL.len() as u64);
    }

    #[test]
    fn hit_rate() {
        assert!(PoolStats::default().hit_rate().abs() < f64::EPSILON);

        let mut p = pool(20, 5);
        p.release(agent(AgentRole::Tester));
        p.acquire(AgentRole::Tester, CommanderId::new(), AgentModel::Sonnet);
        p.acquire(AgentRole::Tester, CommanderId::new(), AgentModel::Sonnet);
        assert!((p.stats().hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
