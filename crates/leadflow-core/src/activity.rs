//! Lead activities and follow-up tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::lead::LeadId;

string_enum! {
    /// Kind of interaction an agent had with a lead.
    pub enum ActivityType {
        Call => "call",
        Email => "email",
        Whatsapp => "whatsapp",
        Viewing => "viewing",
        Meeting => "meeting",
        OfferMade => "offer_made",
    }
}

string_enum! {
    pub enum Outcome {
        Positive => "positive",
        Negative => "negative",
        Neutral => "neutral",
    }
}

string_enum! {
    pub enum TaskPriority {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

/// An activity reported against a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    #[serde(rename = "type")]
    pub activity_type: ActivityType,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
    #[serde(default)]
    pub next_follow_up: Option<DateTime<Utc>>,
    /// Overrides the last recorded activity time for the inactivity penalty.
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
}

impl Activity {
    pub fn new(activity_type: ActivityType) -> Self {
        Self {
            activity_type,
            notes: None,
            outcome: None,
            next_follow_up: None,
            last_activity_at: None,
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    pub fn with_last_activity(mut self, at: DateTime<Utc>) -> Self {
        self.last_activity_at = Some(at);
        self
    }
}

/// Stored activity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadActivity {
    pub activity_id: Uuid,
    pub lead_id: LeadId,
    /// Agent owning the lead when the activity was logged.
    pub agent_id: Option<AgentId>,
    pub activity_type: ActivityType,
    pub notes: Option<String>,
    pub outcome: Option<Outcome>,
    pub created_at: DateTime<Utc>,
    pub next_follow_up: Option<DateTime<Utc>>,
}

impl LeadActivity {
    pub fn record(lead_id: LeadId, agent_id: Option<AgentId>, activity: &Activity) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            lead_id,
            agent_id,
            activity_type: activity.activity_type,
            notes: activity.notes.clone(),
            outcome: activity.outcome,
            created_at: Utc::now(),
            next_follow_up: activity.next_follow_up,
        }
    }
}

/// A scheduled follow-up for the agent owning a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpTask {
    pub task_id: Uuid,
    pub lead_id: LeadId,
    pub agent_id: Option<AgentId>,
    pub task_type: ActivityType,
    pub due_date: DateTime<Utc>,
    pub priority: TaskPriority,
    pub notes: Option<String>,
}

impl FollowUpTask {
    pub fn new(
        lead_id: LeadId,
        agent_id: Option<AgentId>,
        task_type: ActivityType,
        due_date: DateTime<Utc>,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            lead_id,
            agent_id,
            task_type,
            due_date,
            priority: TaskPriority::High,
            notes: Some(notes.into()),
        }
    }
}
