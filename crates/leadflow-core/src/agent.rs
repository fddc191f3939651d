//! Sales agents and their performance metrics.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type AgentId = Uuid;

/// A sales agent who can own leads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: AgentId,
    pub full_name: String,
    pub email: String,
    pub phone: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Property types and areas the agent covers.
    #[serde(default)]
    pub specialization: Vec<String>,
    #[serde(default)]
    pub preferred_areas: Vec<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_active() -> bool {
    true
}

impl Agent {
    pub fn new(full_name: &str, email: &str, phone: &str) -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            phone: phone.to_string(),
            language: None,
            specialization: Vec::new(),
            preferred_areas: Vec::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_language(mut self, language: &str) -> Self {
        self.language = Some(language.to_string());
        self
    }

    pub fn with_specialization(mut self, tags: &[&str]) -> Self {
        self.specialization = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Case-insensitive membership test against the specialization set.
    pub fn specializes_in(&self, tag: &str) -> bool {
        self.specialization
            .iter()
            .any(|s| s.eq_ignore_ascii_case(tag))
    }

    pub fn speaks(&self, language: &str) -> bool {
        self.language
            .as_deref()
            .is_some_and(|l| l.eq_ignore_ascii_case(language))
    }

    pub fn contact(&self) -> AssignedAgent {
        AssignedAgent {
            agent_id: self.agent_id,
            name: self.full_name.clone(),
            phone: self.phone.clone(),
        }
    }
}

/// Agent contact returned to callers after an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedAgent {
    pub agent_id: AgentId,
    pub name: String,
    pub phone: String,
}

/// Filter for agent listings.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    /// Only agents with `is_active = true`.
    pub active_only: bool,
    pub language: Option<String>,
}

impl AgentFilter {
    pub fn active() -> Self {
        Self {
            active_only: true,
            language: None,
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        if self.active_only && !agent.is_active {
            return false;
        }
        match &self.language {
            Some(lang) => agent.speaks(lang),
            None => true,
        }
    }
}

/// Per-period performance snapshot for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub agent_id: AgentId,
    pub date: NaiveDate,
    #[serde(default)]
    pub total_active_leads: u32,
    #[serde(default)]
    pub conversions: u32,
    /// Used as the agent's round-robin weight.
    #[serde(default)]
    pub conversion_rate: Option<f64>,
}
