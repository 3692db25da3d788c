//! C10: Per-agent rate limiting.
//!
//! Three independent sliding-window counters (join attempts, messages,
//! broadcasts), each keyed by agent id in a `DashMap`. Grounded on the
//! teacher's `ThroughputTracker` (`message_router/router.rs`): a
//! timestamp-bucketed `DashMap` that prunes samples outside the window on
//! every write, generalized from one crate-wide counter to one counter
//! per agent per category.

use crate::config::RateLimiterConfig;
use crate::domain_types::AgentId;
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Category {
    Join,
    Message,
    Broadcast,
}

struct Window {
    limit: u32,
    period: Duration,
    samples: Vec<Instant>,
}

impl Window {
    fn new(limit: u32, period_ms: u64) -> Self {
        Self { limit, period: Duration::from_millis(period_ms), samples: Vec::new() }
    }

    fn record(&mut self, now: Instant) -> bool {
        let cutoff = now.checked_sub(self.period).unwrap_or(now);
        self.samples.retain(|t| *t >= cutoff);
        if self.samples.len() as u32 >= self.limit {
            return false;
        }
        self.samples.push(now);
        true
    }
}

/// Tracks join/message/broadcast rates per [`AgentId`] and reports
/// whether the next action of a given category is still within bounds.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: DashMap<(AgentId, Category), Window>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self { config, windows: DashMap::new() }
    }

    fn check(&self, agent_id: &AgentId, category: Category, limit: u32, period_ms: u64) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry((agent_id.clone(), category)).or_insert_with(|| Window::new(limit, period_ms));
        entry.record(now)
    }

    /// Returns `true` if `agent_id` may attempt another join right now.
    #[must_use]
    pub fn allow_join(&self, agent_id: &AgentId) -> bool {
        self.check(agent_id, Category::Join, self.config.join_limit, self.config.join_window_ms)
    }

    /// Returns `true` if `agent_id` may send another message right now.
    #[must_use]
    pub fn allow_message(&self, agent_id: &AgentId) -> bool {
        self.check(agent_id, Category::Message, self.config.message_limit, self.config.message_window_ms)
    }

    /// Returns `true` if `agent_id` may send another broadcast right now.
    #[must_use]
    pub fn allow_broadcast(&self, agent_id: &AgentId) -> bool {
        self.check(agent_id, Category::Broadcast, self.config.broadcast_limit, self.config.broadcast_window_ms)
    }

    /// Drops all tracked windows for `agent_id`, called when a connection
    /// closes so the map doesn't accumulate entries for departed agents.
    pub fn purge(&self, agent_id: &AgentId) {
        self.windows.retain(|(id, _), _| id != agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentId {
        AgentId::try_new(name.to_string()).unwrap()
    }

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterConfig { join_limit: 2, ..RateLimiterConfig::default() });
        let agent_id = agent("agent-A");
        assert!(limiter.allow_join(&agent_id));
        assert!(limiter.allow_join(&agent_id));
        assert!(!limiter.allow_join(&agent_id));
    }

    #[test]
    fn categories_are_tracked_independently() {
        let limiter = RateLimiter::new(RateLimiterConfig { join_limit: 1, message_limit: 1, ..RateLimiterConfig::default() });
        let agent_id = agent("agent-A");
        assert!(limiter.allow_join(&agent_id));
        assert!(limiter.allow_message(&agent_id));
    }

    #[test]
    fn different_agents_are_tracked_independently() {
        let limiter = RateLimiter::new(RateLimiterConfig { join_limit: 1, ..RateLimiterConfig::default() });
        assert!(limiter.allow_join(&agent("agent-A")));
        assert!(limiter.allow_join(&agent("agent-B")));
    }

    #[test]
    fn purge_clears_all_categories_for_an_agent() {
        let limiter = RateLimiter::new(RateLimiterConfig { join_limit: 1, ..RateLimiterConfig::default() });
        let agent_id = agent("agent-A");
        assert!(limiter.allow_join(&agent_id));
        assert!(!limiter.allow_join(&agent_id));
        limiter.purge(&agent_id);
        assert!(limiter.allow_join(&agent_id));
    }
}
