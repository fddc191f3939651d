//! Eligibility filter: which agents may receive a lead.
//!
//! Capacity is a hard cut. The preference steps (property type, areas,
//! language) only narrow the pool when at least one agent matches; otherwise
//! the pool from the previous step is kept.

use tracing::debug;

use crate::agent::Agent;
use crate::lead::LeadProfile;

/// Maximum active leads an agent may hold.
pub const CAPACITY_CEILING: u32 = 50;

/// An agent annotated for selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent: Agent,
    pub active_count: u32,
    /// Latest conversion rate, or 1.0 when none is recorded.
    pub weight: f64,
}

/// Keep the matching subset, or the whole pool when nothing matches.
pub fn narrow_or_keep<F>(pool: Vec<Candidate>, step: &str, matches: F) -> Vec<Candidate>
where
    F: Fn(&Candidate) -> bool,
{
    let narrowed: Vec<Candidate> = pool.iter().filter(|c| matches(c)).cloned().collect();
    if narrowed.is_empty() {
        debug!("{}: no agent matched, keeping {} candidates", step, pool.len());
        pool
    } else {
        debug!("{}: narrowed {} → {}", step, pool.len(), narrowed.len());
        narrowed
    }
}

/// Applies capacity and preference filtering to a candidate pool.
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    ceiling: u32,
}

impl EligibilityFilter {
    pub fn new() -> Self {
        Self {
            ceiling: CAPACITY_CEILING,
        }
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Eligible candidates for a lead with the given profile. May be empty.
    pub fn apply(&self, pool: Vec<Candidate>, profile: &LeadProfile) -> Vec<Candidate> {
        let ceiling = self.ceiling;
        let total = pool.len();
        let mut pool: Vec<Candidate> = pool
            .into_iter()
            .filter(|c| c.active_count < ceiling)
            .collect();
        debug!("capacity: {} of {} agents below {}", pool.len(), total, ceiling);
        if pool.is_empty() {
            return pool;
        }

        if let Some(property_type) = profile.property_type {
            pool = narrow_or_keep(pool, "property type", |c| {
                c.agent.specializes_in(property_type.as_str())
            });
        }

        if !profile.preferred_areas.is_empty() {
            pool = narrow_or_keep(pool, "preferred areas", |c| {
                profile
                    .preferred_areas
                    .iter()
                    .any(|area| c.agent.specializes_in(area))
            });
        }

        if let Some(language) = profile.language_preference.as_deref() {
            pool = narrow_or_keep(pool, "language", |c| c.agent.speaks(language));
        }

        pool
    }
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self::new()
    }
}
