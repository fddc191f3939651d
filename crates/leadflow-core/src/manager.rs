//! Assignment manager: assigns and reassigns leads to agents.
//!
//! Selection runs workload tracker → eligibility filter → round-robin. The
//! repository enforces the capacity ceiling inside the insert itself; when it
//! refuses an agent that filled up concurrently, selection is retried
//! without that agent.

use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::{AgentFilter, AgentId, AssignedAgent};
use crate::assignment::{AssignmentRequest, AssignmentState};
use crate::eligibility::{Candidate, EligibilityFilter};
use crate::error::{LeadFlowError, Result};
use crate::lead::{LeadId, LeadProfile};
use crate::repository::LeadRepository;
use crate::selector::WeightedRoundRobin;
use crate::workload::WorkloadTracker;

/// Score above which an update triggers automatic reassignment.
pub const REASSIGN_THRESHOLD: i32 = 90;

pub struct AssignmentManager {
    repo: Arc<dyn LeadRepository>,
    tracker: WorkloadTracker,
    filter: EligibilityFilter,
    selector: WeightedRoundRobin,
}

impl AssignmentManager {
    pub fn new(repo: Arc<dyn LeadRepository>) -> Self {
        Self {
            tracker: WorkloadTracker::new(repo.clone()),
            repo,
            filter: EligibilityFilter::new(),
            selector: WeightedRoundRobin::new(),
        }
    }

    pub fn tracker(&self) -> &WorkloadTracker {
        &self.tracker
    }

    /// Pick the next eligible candidate, skipping `excluded` agents.
    async fn select(
        &self,
        profile: &LeadProfile,
        excluded: &[AgentId],
    ) -> Result<Option<Candidate>> {
        let agents: Vec<_> = self
            .repo
            .list_agents(&AgentFilter::active())
            .await?
            .into_iter()
            .filter(|a| !excluded.contains(&a.agent_id))
            .collect();
        let pool = self.tracker.snapshot(agents).await?;
        let eligible = self.filter.apply(pool, profile);

        Ok(self
            .selector
            .next(&eligible)
            .and_then(|id| eligible.into_iter().find(|c| c.agent.agent_id == id)))
    }

    /// Assign a lead that has no active assignment yet.
    pub async fn assign(&self, lead_id: LeadId, profile: &LeadProfile) -> Result<AssignedAgent> {
        // Refuse before selecting so a duplicate call does not use up a turn.
        if self.repo.active_assignment(lead_id).await?.is_some() {
            return Err(LeadFlowError::AlreadyAssigned(lead_id));
        }

        let mut excluded = Vec::new();
        loop {
            let candidate = self
                .select(profile, &excluded)
                .await?
                .ok_or(LeadFlowError::NoEligibleAgent)?;

            let request = AssignmentRequest {
                lead_id,
                agent_id: candidate.agent.agent_id,
                reason: crate::assignment::INITIAL_ASSIGNMENT_REASON.to_string(),
                capacity_ceiling: Some(self.filter.ceiling()),
            };
            match self.repo.create_assignment(&request).await {
                Ok(_) => {
                    info!(
                        "Lead {} assigned to {} ({} active)",
                        lead_id, candidate.agent.full_name, candidate.active_count + 1
                    );
                    return Ok(candidate.agent.contact());
                }
                Err(LeadFlowError::CapacityExceeded { agent_id, .. }) => {
                    warn!("Agent {} reached capacity during assignment, retrying", agent_id);
                    excluded.push(agent_id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Move a lead to another agent.
    ///
    /// With a `target`, eligibility is bypassed. Without one, selection runs
    /// on the lead's stored profile. The old assignment is superseded and the
    /// new one created atomically; on any error nothing changes.
    pub async fn reassign(
        &self,
        lead_id: LeadId,
        reason: &str,
        target: Option<AgentId>,
    ) -> Result<AssignedAgent> {
        let lead = self
            .repo
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))?;

        if let Some(agent_id) = target {
            let agent = self
                .repo
                .get_agent(agent_id)
                .await?
                .ok_or_else(|| LeadFlowError::agent_not_found(agent_id))?;
            let request = AssignmentRequest {
                lead_id,
                agent_id,
                reason: reason.to_string(),
                capacity_ceiling: None,
            };
            self.repo.replace_active_assignment(&request).await?;
            info!("Lead {} manually reassigned to {}: {}", lead_id, agent.full_name, reason);
            return Ok(agent.contact());
        }

        let mut excluded = Vec::new();
        loop {
            let candidate = self
                .select(&lead.profile, &excluded)
                .await?
                .ok_or(LeadFlowError::NoEligibleAgent)?;

            let request = AssignmentRequest {
                lead_id,
                agent_id: candidate.agent.agent_id,
                reason: reason.to_string(),
                capacity_ceiling: Some(self.filter.ceiling()),
            };
            match self.repo.replace_active_assignment(&request).await {
                Ok(_) => {
                    info!(
                        "Lead {} reassigned to {}: {}",
                        lead_id, candidate.agent.full_name, reason
                    );
                    return Ok(candidate.agent.contact());
                }
                Err(LeadFlowError::CapacityExceeded { agent_id, .. }) => {
                    warn!("Agent {} reached capacity during reassignment, retrying", agent_id);
                    excluded.push(agent_id);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Where the lead sits in the assignment lifecycle.
    pub async fn state(&self, lead_id: LeadId) -> Result<AssignmentState> {
        let history = self.repo.assignment_history(lead_id).await?;
        Ok(AssignmentState::from_history(&history))
    }
}
