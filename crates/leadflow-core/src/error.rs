//! Error types for LeadFlow.

use thiserror::Error;
use uuid::Uuid;

/// Core error type for all LeadFlow operations.
#[derive(Error, Debug)]
pub enum LeadFlowError {
    #[error("No eligible agent available")]
    NoEligibleAgent,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate lead detected ({0})")]
    DuplicateLead(&'static str),

    #[error("Lead {0} already has an active assignment")]
    AlreadyAssigned(Uuid),

    #[error("Agent {agent_id} is at capacity ({ceiling} active leads)")]
    CapacityExceeded { agent_id: Uuid, ceiling: u32 },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl LeadFlowError {
    pub fn lead_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "Lead", id }
    }

    pub fn agent_not_found(id: Uuid) -> Self {
        Self::NotFound { entity: "Agent", id }
    }
}

pub type Result<T> = std::result::Result<T, LeadFlowError>;
