//! Workload tracker: active lead counts and selection weights per agent.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent::{Agent, AgentId};
use crate::eligibility::{CAPACITY_CEILING, Candidate};
use crate::error::{LeadFlowError, Result};
use crate::repository::LeadRepository;

/// Weight for agents without any recorded conversion rate.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Current load of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentWorkload {
    pub agent_id: AgentId,
    pub active_leads: u32,
    pub capacity: u32,
    pub remaining: u32,
    pub weight: f64,
}

/// Reads workload figures from the repository.
#[derive(Clone)]
pub struct WorkloadTracker {
    repo: Arc<dyn LeadRepository>,
}

impl WorkloadTracker {
    pub fn new(repo: Arc<dyn LeadRepository>) -> Self {
        Self { repo }
    }

    /// Non-superseded assignments of the agent whose lead is still open.
    pub async fn active_count(&self, agent_id: AgentId) -> Result<u32> {
        self.repo.count_active_assignments(agent_id).await
    }

    pub async fn weight(&self, agent_id: AgentId) -> Result<f64> {
        Ok(self
            .repo
            .latest_conversion_rate(agent_id)
            .await?
            .unwrap_or(DEFAULT_WEIGHT))
    }

    /// Workload summary for a single agent.
    pub async fn workload(&self, agent_id: AgentId) -> Result<AgentWorkload> {
        if self.repo.get_agent(agent_id).await?.is_none() {
            return Err(LeadFlowError::agent_not_found(agent_id));
        }
        let active_leads = self.active_count(agent_id).await?;
        Ok(AgentWorkload {
            agent_id,
            active_leads,
            capacity: CAPACITY_CEILING,
            remaining: CAPACITY_CEILING.saturating_sub(active_leads),
            weight: self.weight(agent_id).await?,
        })
    }

    /// Annotate agents with their active count and weight.
    pub async fn snapshot(&self, agents: Vec<Agent>) -> Result<Vec<Candidate>> {
        let mut pool = Vec::with_capacity(agents.len());
        for agent in agents {
            let active_count = self.active_count(agent.agent_id).await?;
            let weight = self.weight(agent.agent_id).await?;
            pool.push(Candidate {
                agent,
                active_count,
                weight,
            });
        }
        Ok(pool)
    }
}
