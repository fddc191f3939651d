//! Lead service: the capture and update flows tying scoring, assignment,
//! duplicate detection and follow-up scheduling together.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityType, FollowUpTask, LeadActivity};
use crate::agent::{AgentId, AssignedAgent};
use crate::assignment::{AssignmentState, HIGH_POTENTIAL_REASON};
use crate::cache::{self, InMemoryCache, ResponseCache};
use crate::config::{CaptureSettings, LeadFlowConfig};
use crate::error::{LeadFlowError, Result};
use crate::events::{EventBus, LeadEvent};
use crate::lead::{
    Lead, LeadId, LeadProfile, LeadSource, LeadStatus, PropertyInterest, SourceDetails,
    SourceType,
};
use crate::manager::{AssignmentManager, REASSIGN_THRESHOLD};
use crate::repository::{LeadChange, LeadRepository};
use crate::scoring::{ScoreBreakdown, ScoringEngine};

const INITIAL_FOLLOW_UP_NOTES: &str = "Initial follow-up";
const AUTO_FOLLOW_UP_NOTES: &str = "Auto-generated follow-up";
const STATUS_CHANGE_NOTES: &str = "Updated via API";

// ─── Request / response types ──────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub source_type: SourceType,
    pub lead_data: LeadProfile,
    #[serde(default)]
    pub source_details: Option<SourceDetails>,
}

impl CaptureRequest {
    /// Source details as seen by the scoring engine.
    pub fn scoring_source(&self) -> SourceDetails {
        SourceDetails {
            source_type: Some(self.source_type),
            ..self.source_details.clone().unwrap_or_default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureResponse {
    pub lead_id: LeadId,
    pub assigned_agent: Option<AssignedAgent>,
    pub source_type: SourceType,
    pub lead_score: i32,
    pub next_follow_up: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub status: Option<LeadStatus>,
    #[serde(default)]
    pub activity: Option<Activity>,
    #[serde(default)]
    pub property_interests: Vec<PropertyInterest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub lead_id: LeadId,
    pub status: LeadStatus,
    pub lead_score: i32,
    pub last_activity: Option<DateTime<Utc>>,
    pub next_follow_up: Option<DateTime<Utc>>,
    pub updated_interests: Vec<PropertyInterest>,
    /// Set when the new score triggered a reassignment.
    pub reassigned_to: Option<AssignedAgent>,
}

/// A lead with its assignment and pipeline context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadDetails {
    #[serde(flatten)]
    pub lead: Lead,
    pub assignment_state: AssignmentState,
    pub assigned_agent: Option<AssignedAgent>,
    pub follow_ups: Vec<FollowUpTask>,
    pub property_interests: Vec<PropertyInterest>,
}

// ─── Service ───────────────────────────────────────────────

/// Entry point for everything that changes a lead.
pub struct LeadService {
    repo: Arc<dyn LeadRepository>,
    manager: AssignmentManager,
    cache: Option<Arc<dyn ResponseCache>>,
    duplicate_ttl: StdDuration,
    settings: CaptureSettings,
    events: EventBus,
}

impl LeadService {
    /// Service without a duplicate cache and with default capture settings.
    pub fn new(repo: Arc<dyn LeadRepository>) -> Self {
        Self {
            manager: AssignmentManager::new(repo.clone()),
            repo,
            cache: None,
            duplicate_ttl: StdDuration::from_secs(3600),
            settings: CaptureSettings::default(),
            events: EventBus::default(),
        }
    }

    /// Service configured from a [`LeadFlowConfig`].
    pub fn from_config(repo: Arc<dyn LeadRepository>, config: &LeadFlowConfig) -> Self {
        let service = Self::new(repo).with_settings(config.capture.clone());
        if config.cache.enabled {
            service.with_cache(
                Arc::new(InMemoryCache::new()),
                StdDuration::from_secs(config.cache.duplicate_ttl_secs),
            )
        } else {
            service
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ResponseCache>, ttl: StdDuration) -> Self {
        self.cache = Some(cache);
        self.duplicate_ttl = ttl;
        self
    }

    pub fn with_settings(mut self, settings: CaptureSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn manager(&self) -> &AssignmentManager {
        &self.manager
    }

    pub fn repository(&self) -> &Arc<dyn LeadRepository> {
        &self.repo
    }

    /// Scoring engine with the currently active stored rules.
    pub async fn scoring_engine(&self) -> Result<ScoringEngine> {
        ScoringEngine::from_repository(self.repo.as_ref()).await
    }

    /// Explain the initial score a capture request would get.
    pub async fn preview_score(&self, request: &CaptureRequest) -> Result<ScoreBreakdown> {
        let engine = self.scoring_engine().await?;
        Ok(engine.explain_new_lead(&request.lead_data, &request.scoring_source()))
    }

    // ─── Capture ───────────────────────────────────────────

    /// Capture, score and assign a new lead.
    pub async fn capture(&self, request: CaptureRequest) -> Result<CaptureResponse> {
        request.lead_data.validate()?;

        let profile = &request.lead_data;
        let cache_keys = cache_keys(profile);
        self.check_duplicates(profile, &cache_keys).await?;

        let engine = self.scoring_engine().await?;
        let score = engine.score_new_lead(profile, &request.scoring_source());

        let lead = Lead::new(request.source_type, profile.clone(), score);
        let lead_id = lead.lead_id;
        let source = LeadSource::from_details(
            lead_id,
            request.source_type,
            &request.source_details.clone().unwrap_or_default(),
        );
        self.repo.insert_lead(&lead, &source).await?;

        let assigned_agent = match self.manager.assign(lead_id, profile).await {
            Ok(agent) => {
                self.events.publish(LeadEvent::Assigned {
                    lead_id,
                    agent_id: agent.agent_id,
                });
                Some(agent)
            }
            Err(LeadFlowError::NoEligibleAgent) if self.settings.allow_unassigned => {
                warn!("No eligible agent for lead {}, keeping it unassigned", lead_id);
                self.events.publish(LeadEvent::Unassigned { lead_id });
                None
            }
            Err(e) => {
                // Roll back the insert so a rejected capture leaves nothing behind.
                if let Err(cleanup) = self.repo.delete_lead(lead_id).await {
                    warn!("Failed to remove lead {} after assignment error: {}", lead_id, cleanup);
                }
                return Err(e);
            }
        };

        let due = Utc::now() + Duration::hours(self.settings.follow_up_delay_hours);
        let follow_up = FollowUpTask::new(
            lead_id,
            assigned_agent.as_ref().map(|a| a.agent_id),
            ActivityType::Call,
            due,
            INITIAL_FOLLOW_UP_NOTES,
        );
        self.repo.add_follow_up(&follow_up).await?;

        self.remember_keys(lead_id, &cache_keys).await;
        self.events.publish(LeadEvent::Captured {
            lead_id,
            score: lead.score,
        });
        info!("Captured lead {} from {} (score {})", lead_id, request.source_type, lead.score);

        Ok(CaptureResponse {
            lead_id,
            assigned_agent,
            source_type: request.source_type,
            lead_score: lead.score,
            next_follow_up: follow_up.due_date,
        })
    }

    async fn check_duplicates(&self, profile: &LeadProfile, keys: &[String]) -> Result<()> {
        if let Some(cache) = &self.cache {
            for key in keys {
                match cache.exists(key).await {
                    Ok(true) => return Err(LeadFlowError::DuplicateLead("cache")),
                    Ok(false) => {}
                    Err(e) => warn!("Duplicate cache lookup failed for {}: {}", key, e),
                }
            }
        }

        let since = Utc::now() - Duration::hours(self.settings.duplicate_window_hours);
        let existing = self
            .repo
            .find_recent_duplicate(&profile.phone, profile.email.as_deref(), since)
            .await?;
        if let Some(id) = existing {
            debug!("Lead {} matches an incoming capture", id);
            return Err(LeadFlowError::DuplicateLead("repository"));
        }
        Ok(())
    }

    async fn remember_keys(&self, lead_id: LeadId, keys: &[String]) {
        let Some(cache) = &self.cache else {
            return;
        };
        let value = serde_json::json!({ "lead_id": lead_id }).to_string();
        for key in keys {
            if let Err(e) = cache.set(key, &value, self.duplicate_ttl).await {
                warn!("Failed to cache {}: {}", key, e);
            }
        }
    }

    // ─── Update ────────────────────────────────────────────

    /// Apply status, activity and interest changes to a lead.
    pub async fn update(&self, lead_id: LeadId, request: UpdateRequest) -> Result<UpdateResponse> {
        let lead = self
            .repo
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))?;

        let mut change = LeadChange {
            new_status: request.status,
            status_notes: Some(STATUS_CHANGE_NOTES.to_string()),
            interests: request.property_interests.clone(),
            ..LeadChange::new(lead_id)
        };

        let mut last_activity = None;
        let mut next_follow_up = None;
        if let Some(activity) = &request.activity {
            let engine = self.scoring_engine().await?;
            let previous_activity = match activity.last_activity_at {
                Some(at) => Some(at),
                None => self.repo.last_activity_at(lead_id).await?,
            };
            let breakdown =
                engine.explain_activity(lead.score, activity, previous_activity, Utc::now());
            change.score_delta = breakdown.delta();

            let owner = self.repo.active_assignment(lead_id).await?.map(|a| a.agent_id);
            let record = LeadActivity::record(lead_id, owner, activity);
            last_activity = Some(record.created_at);
            next_follow_up = activity.next_follow_up;

            if let Some(due) = activity.next_follow_up {
                let notes = activity
                    .notes
                    .clone()
                    .unwrap_or_else(|| AUTO_FOLLOW_UP_NOTES.to_string());
                change.follow_up = Some(FollowUpTask::new(
                    lead_id,
                    owner,
                    activity.activity_type,
                    due,
                    notes,
                ));
            }
            change.activity = Some(record);
        }

        let outcome = self.repo.apply_lead_update(change).await?;
        if outcome.score != outcome.previous_score {
            self.events.publish(LeadEvent::ScoreUpdated {
                lead_id,
                previous: outcome.previous_score,
                score: outcome.score,
            });
        }

        let mut reassigned_to = None;
        if outcome.score > REASSIGN_THRESHOLD {
            match self.reassign(lead_id, HIGH_POTENTIAL_REASON, None).await {
                Ok(agent) => reassigned_to = Some(agent),
                Err(LeadFlowError::NoEligibleAgent) => {
                    warn!("Lead {} scored {} but no agent is eligible for reassignment", lead_id, outcome.score);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(UpdateResponse {
            lead_id,
            status: outcome.status,
            lead_score: outcome.score,
            last_activity,
            next_follow_up,
            updated_interests: request.property_interests,
            reassigned_to,
        })
    }

    // ─── Assignment & lookup ───────────────────────────────

    /// Reassign a lead, manually to `target` or automatically.
    pub async fn reassign(
        &self,
        lead_id: LeadId,
        reason: &str,
        target: Option<AgentId>,
    ) -> Result<AssignedAgent> {
        let agent = self.manager.reassign(lead_id, reason, target).await?;
        self.events.publish(LeadEvent::Reassigned {
            lead_id,
            agent_id: agent.agent_id,
            reason: reason.to_string(),
        });
        Ok(agent)
    }

    /// Record an activity and rescore, without any other lead changes.
    pub async fn record_activity(&self, lead_id: LeadId, activity: &Activity) -> Result<i32> {
        let engine = self.scoring_engine().await?;
        engine
            .update_lead_score(self.repo.as_ref(), lead_id, activity)
            .await
    }

    pub async fn lead_details(&self, lead_id: LeadId) -> Result<LeadDetails> {
        let lead = self
            .repo
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))?;

        let assigned_agent = match self.repo.active_assignment(lead_id).await? {
            Some(a) => self.repo.get_agent(a.agent_id).await?.map(|agent| agent.contact()),
            None => None,
        };

        Ok(LeadDetails {
            assignment_state: self.manager.state(lead_id).await?,
            assigned_agent,
            follow_ups: self.repo.follow_ups(lead_id).await?,
            property_interests: self.repo.property_interests(lead_id).await?,
            lead,
        })
    }
}

fn cache_keys(profile: &LeadProfile) -> Vec<String> {
    let mut keys = vec![cache::phone_key(&profile.phone)];
    if let Some(email) = &profile.email {
        keys.push(cache::email_key(email));
    }
    keys
}
