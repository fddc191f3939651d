//! Weighted round-robin selection over eligible candidates.

use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::agent::AgentId;
use crate::eligibility::Candidate;

/// Upper bound on cycle slots a single agent can occupy.
pub const MAX_SLOTS_PER_AGENT: u32 = 1_000;

/// Number of cycle slots for a weight: `max(1, floor(w))`.
pub fn slot_count(weight: f64) -> u32 {
    if !weight.is_finite() || weight < 1.0 {
        return 1;
    }
    // `as` saturates for floats above u32::MAX.
    (weight.floor() as u32).min(MAX_SLOTS_PER_AGENT)
}

#[derive(Debug, Default)]
struct Cycle {
    /// Sorted `(agent, slots)` pairs the cycle was built from.
    key: Vec<(AgentId, u32)>,
    slots: Vec<AgentId>,
    cursor: usize,
}

impl Cycle {
    fn rebuild(&mut self, key: Vec<(AgentId, u32)>) {
        self.slots = key
            .iter()
            .flat_map(|(id, n)| std::iter::repeat_n(*id, *n as usize))
            .collect();
        self.key = key;
        self.cursor = 0;
    }
}

/// Shared round-robin cursor.
///
/// Each agent appears `slot_count(weight)` times in a row, agents ordered by
/// id. The cycle is rebuilt from scratch whenever the candidate set or any
/// weight changes; otherwise each call advances one position.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cycle: Mutex<Cycle>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next agent from `candidates`, or `None` when empty.
    pub fn next(&self, candidates: &[Candidate]) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }

        let mut key: Vec<(AgentId, u32)> = candidates
            .iter()
            .map(|c| (c.agent.agent_id, slot_count(c.weight)))
            .collect();
        key.sort();
        key.dedup_by_key(|(id, _)| *id);

        let mut cycle = self.cycle.lock().unwrap_or_else(PoisonError::into_inner);
        if cycle.key != key {
            debug!("Rebuilding round-robin cycle for {} agents", key.len());
            cycle.rebuild(key);
        }
        let chosen = cycle.slots[cycle.cursor % cycle.slots.len()];
        cycle.cursor = (cycle.cursor + 1) % cycle.slots.len();
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use std::collections::HashMap;

    fn candidate(name: &str, weight: f64) -> Candidate {
        Candidate {
            agent: Agent::new(name, &format!("{}@example.com", name), "0500000000"),
            active_count: 0,
            weight,
        }
    }

    #[test]
    fn test_slot_count() {
        assert_eq!(slot_count(3.9), 3);
        assert_eq!(slot_count(1.0), 1);
        assert_eq!(slot_count(0.4), 1);
        assert_eq!(slot_count(-2.0), 1);
        assert_eq!(slot_count(f64::NAN), 1);
        assert_eq!(slot_count(f64::INFINITY), 1);
        assert_eq!(slot_count(1e12), MAX_SLOTS_PER_AGENT);
    }

    #[test]
    fn test_weighted_distribution_without_starvation() {
        let rr = WeightedRoundRobin::new();
        let pool = vec![candidate("a", 3.0), candidate("b", 1.0)];
        let a = pool[0].agent.agent_id;
        let b = pool[1].agent.agent_id;

        let picks: Vec<AgentId> = (0..40).map(|_| rr.next(&pool).unwrap()).collect();
        let mut counts: HashMap<AgentId, usize> = HashMap::new();
        for id in &picks {
            *counts.entry(*id).or_default() += 1;
        }
        assert_eq!(counts[&a], 30);
        assert_eq!(counts[&b], 10);

        for id in [a, b] {
            let positions: Vec<usize> = picks
                .iter()
                .enumerate()
                .filter(|(_, p)| **p == id)
                .map(|(i, _)| i)
                .collect();
            assert!(positions[0] < 4);
            assert!(positions.windows(2).all(|w| w[1] - w[0] <= 4));
        }
    }

    #[test]
    fn test_order_does_not_depend_on_input_order() {
        let pool = vec![candidate("a", 2.0), candidate("b", 1.0), candidate("c", 1.0)];
        let mut reversed = pool.clone();
        reversed.reverse();

        let first = WeightedRoundRobin::new();
        let second = WeightedRoundRobin::new();
        let one: Vec<_> = (0..8).map(|_| first.next(&pool).unwrap()).collect();
        let two: Vec<_> = (0..8).map(|_| second.next(&reversed).unwrap()).collect();
        assert_eq!(one, two);
    }

    #[test]
    fn test_cycle_rebuilds_when_weights_change() {
        let rr = WeightedRoundRobin::new();
        let mut pool = vec![candidate("a", 1.0), candidate("b", 1.0)];
        rr.next(&pool);

        pool[0].weight = 5.0;
        let a = pool[0].agent.agent_id;
        let picks: Vec<_> = (0..6).map(|_| rr.next(&pool).unwrap()).collect();
        assert_eq!(picks.iter().filter(|id| **id == a).count(), 5);
    }

    #[test]
    fn test_concurrent_calls_take_distinct_positions() {
        let rr = WeightedRoundRobin::new();
        let pool = vec![candidate("a", 3.0), candidate("b", 1.0)];
        let a = pool[0].agent.agent_id;
        let b = pool[1].agent.agent_id;

        // 8 threads x 20 calls = 40 full cycles of length 4.
        let picks: Vec<AgentId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| (0..20).map(|_| rr.next(&pool).unwrap()).collect::<Vec<_>>())
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(picks.len(), 160);
        assert_eq!(picks.iter().filter(|id| **id == a).count(), 120);
        assert_eq!(picks.iter().filter(|id| **id == b).count(), 40);
    }

    #[test]
    fn test_empty_pool() {
        assert!(WeightedRoundRobin::new().next(&[]).is_none());
    }
}
