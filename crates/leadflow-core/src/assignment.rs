//! Lead → agent assignment records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::lead::LeadId;

pub type AssignmentId = Uuid;

/// Reason recorded on the first assignment of a lead.
pub const INITIAL_ASSIGNMENT_REASON: &str = "initial assignment";

/// Reason recorded when a score crosses the reassignment threshold.
pub const HIGH_POTENTIAL_REASON: &str = "high potential lead";

/// Links one lead to one agent at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub assignment_id: AssignmentId,
    pub lead_id: LeadId,
    pub agent_id: AgentId,
    pub assigned_at: DateTime<Utc>,
    pub superseded: bool,
    pub reason: Option<String>,
}

impl Assignment {
    pub fn from_request(request: &AssignmentRequest) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            lead_id: request.lead_id,
            agent_id: request.agent_id,
            assigned_at: Utc::now(),
            superseded: false,
            reason: Some(request.reason.clone()),
        }
    }
}

/// Write request for a new active assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentRequest {
    pub lead_id: LeadId,
    pub agent_id: AgentId,
    pub reason: String,
    /// When set, the store refuses the insert if the agent already holds this
    /// many active leads, checked inside the same critical section as the insert.
    pub capacity_ceiling: Option<u32>,
}

/// Where a lead sits in the assignment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Unassigned,
    Assigned,
    Reassigned,
}

impl AssignmentState {
    /// Derive the state from a lead's full assignment history.
    pub fn from_history(history: &[Assignment]) -> Self {
        let active = history.iter().any(|a| !a.superseded);
        let superseded = history.iter().any(|a| a.superseded);
        match (active, superseded) {
            (false, _) => AssignmentState::Unassigned,
            (true, false) => AssignmentState::Assigned,
            (true, true) => AssignmentState::Reassigned,
        }
    }
}
