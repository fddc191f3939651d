//! Lead records: profile, source details, status and property interests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::AgentId;
use crate::error::{LeadFlowError, Result};

pub type LeadId = Uuid;

string_enum! {
    /// Sales pipeline status of a lead.
    pub enum LeadStatus {
        New => "new",
        Contacted => "contacted",
        Qualified => "qualified",
        ViewingScheduled => "viewing_scheduled",
        Negotiation => "negotiation",
        Converted => "converted",
        Lost => "lost",
    }
}

impl LeadStatus {
    /// Terminal leads no longer count against an agent's workload.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LeadStatus::Converted | LeadStatus::Lost)
    }
}

impl Default for LeadStatus {
    fn default() -> Self {
        LeadStatus::New
    }
}

string_enum! {
    /// Property category a lead is looking for.
    pub enum PropertyType {
        Apartment => "apartment",
        Villa => "villa",
        Townhouse => "townhouse",
        Commercial => "commercial",
    }
}

string_enum! {
    /// Channel the lead arrived through.
    pub enum SourceType {
        Bayut => "bayut",
        PropertyFinder => "propertyFinder",
        Dubizzle => "dubizzle",
        Website => "website",
        WalkIn => "walk_in",
        Referral => "referral",
    }
}

string_enum! {
    /// How strongly a lead is interested in a specific property.
    pub enum InterestLevel {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

/// Languages a lead may ask to be served in.
pub const SUPPORTED_LANGUAGES: &[&str] = &["arabic", "english"];

/// Profile attributes captured with a lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadProfile {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub phone: String,
    #[serde(default)]
    pub nationality: Option<String>,
    #[serde(default)]
    pub language_preference: Option<String>,
    #[serde(default)]
    pub budget_min: Option<i64>,
    #[serde(default)]
    pub budget_max: Option<i64>,
    #[serde(default)]
    pub property_type: Option<PropertyType>,
    #[serde(default)]
    pub preferred_areas: Vec<String>,
}

impl LeadProfile {
    /// Check the shape of a profile before anything is written.
    pub fn validate(&self) -> Result<()> {
        if self.first_name.trim().is_empty() || self.last_name.trim().is_empty() {
            return Err(LeadFlowError::Validation(
                "first_name and last_name are required".to_string(),
            ));
        }

        let phone_len = self.phone.trim().chars().count();
        if !(7..=20).contains(&phone_len) {
            return Err(LeadFlowError::Validation(format!(
                "phone must be 7-20 characters, got {}",
                phone_len
            )));
        }

        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(LeadFlowError::Validation(format!(
                    "invalid email address: {}",
                    email
                )));
            }
        }

        if let (Some(min), Some(max)) = (self.budget_min, self.budget_max) {
            if min > max {
                return Err(LeadFlowError::Validation(format!(
                    "budget_min ({}) exceeds budget_max ({})",
                    min, max
                )));
            }
        }
        if self.budget_min.is_some_and(|b| b < 0) || self.budget_max.is_some_and(|b| b < 0) {
            return Err(LeadFlowError::Validation(
                "budget cannot be negative".to_string(),
            ));
        }

        if let Some(lang) = &self.language_preference {
            if !SUPPORTED_LANGUAGES.contains(&lang.as_str()) {
                return Err(LeadFlowError::Validation(format!(
                    "unsupported language preference: {}",
                    lang
                )));
            }
        }

        Ok(())
    }
}

/// Source details supplied at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceDetails {
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub referrer_agent_id: Option<AgentId>,
    #[serde(default)]
    pub property_id: Option<Uuid>,
    #[serde(default)]
    pub utm_source: Option<String>,
    #[serde(default)]
    pub utm_medium: Option<String>,
    #[serde(default)]
    pub utm_campaign: Option<String>,
    /// Minutes between the inquiry and the first contact, when known.
    #[serde(default)]
    pub response_time_minutes: Option<u32>,
}

/// A persisted lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub lead_id: LeadId,
    pub source_type: SourceType,
    #[serde(flatten)]
    pub profile: LeadProfile,
    pub status: LeadStatus,
    pub score: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(source_type: SourceType, profile: LeadProfile, score: i32) -> Self {
        let now = Utc::now();
        Self {
            lead_id: Uuid::new_v4(),
            source_type,
            profile,
            status: LeadStatus::New,
            score: crate::scoring::clamp_score(score as i64),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Source row stored alongside a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadSource {
    pub source_id: Uuid,
    pub lead_id: LeadId,
    pub source_type: SourceType,
    pub campaign_id: Option<String>,
    pub referrer_agent_id: Option<AgentId>,
    pub property_id: Option<Uuid>,
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl LeadSource {
    pub fn from_details(lead_id: LeadId, source_type: SourceType, details: &SourceDetails) -> Self {
        Self {
            source_id: Uuid::new_v4(),
            lead_id,
            source_type,
            campaign_id: details.campaign_id.clone(),
            referrer_agent_id: details.referrer_agent_id,
            property_id: details.property_id,
            utm_source: details.utm_source.clone(),
            utm_medium: details.utm_medium.clone(),
            utm_campaign: details.utm_campaign.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Status transition history row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub lead_id: LeadId,
    pub previous_status: LeadStatus,
    pub new_status: LeadStatus,
    pub notes: Option<String>,
    pub changed_at: DateTime<Utc>,
}

/// Interest of a lead in a particular property listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInterest {
    pub property_id: Uuid,
    pub interest_level: InterestLevel,
}
