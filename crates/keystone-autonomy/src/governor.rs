//! Governor — global safety limits on automated remediation.

use keystone_core::config::AutonomyConfig;
use keystone_core::NodeId;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const HOUR: Duration = Duration::from_secs(3600);

/// Caps automated action: a sliding-hour budget shared by all nodes, a per-node
/// cooldown, and a per-node breaker that trips after consecutive rejections.
/// Escalations are never limited.
pub struct Governor {
    max_per_hour: usize,
    cooldown: Duration,
    streak_trip: u32,
    recent: VecDeque<Instant>,
    last_action: HashMap<NodeId, Instant>,
    streaks: HashMap<NodeId, u32>,
}

impl Governor {
    pub fn new(config: &AutonomyConfig) -> Self {
        Self {
            max_per_hour: config.max_actions_per_hour,
            cooldown: Duration::from_secs(config.cooldown_secs),
            streak_trip: config.fail_streak_trip,
            recent: VecDeque::new(),
            last_action: HashMap::new(),
            streaks: HashMap::new(),
        }
    }

    /// Track the node's consecutive-rejection streak.
    pub fn observe(&mut self, node: &NodeId, certified: bool) {
        if certified {
            self.streaks.remove(node);
        } else {
            *self.streaks.entry(node.clone()).or_insert(0) += 1;
        }
    }

    pub fn streak(&self, node: &NodeId) -> u32 {
        self.streaks.get(node).copied().unwrap_or(0)
    }

    /// `Err` carries the reason the action must degrade to escalation.
    pub fn check(&mut self, node: &NodeId, now: Instant) -> std::result::Result<(), String> {
        while self
            .recent
            .front()
            .is_some_and(|t| now.duration_since(*t) >= HOUR)
        {
            self.recent.pop_front();
        }
        if self.streak_trip > 0 && self.streak(node) >= self.streak_trip {
            return Err(format!(
                "breaker tripped after {} consecutive rejections",
                self.streak(node)
            ));
        }
        if self.recent.len() >= self.max_per_hour {
            return Err(format!(
                "hourly action budget of {} exhausted",
                self.max_per_hour
            ));
        }
        if let Some(last) = self.last_action.get(node) {
            let since = now.duration_since(*last);
            if since < self.cooldown {
                return Err(format!(
                    "cooldown active for another {}s",
                    (self.cooldown - since).as_secs()
                ));
            }
        }
        Ok(())
    }

    pub fn record(&mut self, node: &NodeId, now: Instant) {
        self.recent.push_back(now);
        self.last_action.insert(node.clone(), now);
    }

    pub fn forget(&mut self, node: &NodeId) {
        self.last_action.remove(node);
        self.streaks.remove(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(max_per_hour: usize, cooldown_secs: u64, fail_streak_trip: u32) -> Governor {
        Governor::new(&AutonomyConfig {
            max_actions_per_hour: max_per_hour,
            cooldown_secs,
            fail_streak_trip,
            ..Default::default()
        })
    }

    #[test]
    fn hourly_budget_is_shared() {
        let mut g = governor(2, 0, 0);
        let now = Instant::now();
        let (a, b) = (NodeId::from("a"), NodeId::from("b"));
        assert!(g.check(&a, now).is_ok());
        g.record(&a, now);
        g.record(&b, now);
        assert!(g.check(&b, now).unwrap_err().contains("budget"));
        assert!(g.check(&a, now + HOUR).is_ok());
    }

    #[test]
    fn cooldown_is_per_node() {
        let mut g = governor(100, 60, 0);
        let now = Instant::now();
        let (a, b) = (NodeId::from("a"), NodeId::from("b"));
        g.record(&a, now);
        assert!(g.check(&a, now + Duration::from_secs(10)).unwrap_err().contains("cooldown"));
        assert!(g.check(&b, now).is_ok());
        assert!(g.check(&a, now + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn breaker_resets_on_certification() {
        let mut g = governor(100, 0, 2);
        let a = NodeId::from("a");
        let now = Instant::now();
        g.observe(&a, false);
        assert!(g.check(&a, now).is_ok());
        g.observe(&a, false);
        assert!(g.check(&a, now).unwrap_err().contains("breaker"));
        g.observe(&a, true);
        assert!(g.check(&a, now).is_ok());
    }
}
