//! Repository trait: durable storage of leads, agents and assignments.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::activity::{FollowUpTask, LeadActivity};
use crate::agent::{Agent, AgentFilter, AgentId, PerformanceMetric};
use crate::assignment::{Assignment, AssignmentId, AssignmentRequest};
use crate::error::{LeadFlowError, Result};
use crate::lead::{Lead, LeadId, LeadSource, LeadStatus, PropertyInterest, StatusChange};
use crate::scoring::{self, ScoringRule};

/// Everything one lead update writes, applied as a single transaction.
#[derive(Debug, Clone, Default)]
pub struct LeadChange {
    pub lead_id: LeadId,
    /// New status; a history row is written only if it differs.
    pub new_status: Option<LeadStatus>,
    pub status_notes: Option<String>,
    pub activity: Option<LeadActivity>,
    pub follow_up: Option<FollowUpTask>,
    /// Upserted per property id.
    pub interests: Vec<PropertyInterest>,
    /// Added to the stored score, then clamped.
    pub score_delta: i32,
}

impl LeadChange {
    pub fn new(lead_id: LeadId) -> Self {
        Self {
            lead_id,
            ..Default::default()
        }
    }
}

/// Lead state after a [`LeadChange`] was applied.
#[derive(Debug, Clone, PartialEq)]
pub struct LeadUpdateOutcome {
    pub status: LeadStatus,
    pub previous_score: i32,
    pub score: i32,
    pub status_change: Option<StatusChange>,
}

/// Storage contract for the engine: implement for different backends.
///
/// Each method is atomic on its own. Methods that write several rows
/// (`apply_lead_update`, `replace_active_assignment`) commit all or nothing.
#[async_trait]
pub trait LeadRepository: Send + Sync {
    // ─── Leads ─────────────────────────────────────────────

    /// Insert a lead together with its source row.
    async fn insert_lead(&self, lead: &Lead, source: &LeadSource) -> Result<()>;

    async fn get_lead(&self, lead_id: LeadId) -> Result<Option<Lead>>;

    /// Remove a lead and everything hanging off it.
    async fn delete_lead(&self, lead_id: LeadId) -> Result<bool>;

    /// A lead with the same phone or email created at or after `since`.
    async fn find_recent_duplicate(
        &self,
        phone: &str,
        email: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LeadId>>;

    async fn get_lead_score(&self, lead_id: LeadId) -> Result<i32>;

    /// Store a score, clamped into range. Returns the stored value.
    async fn set_lead_score(&self, lead_id: LeadId, score: i32) -> Result<i32>;

    async fn apply_lead_update(&self, change: LeadChange) -> Result<LeadUpdateOutcome>;

    /// Timestamp of the most recent recorded activity.
    async fn last_activity_at(&self, lead_id: LeadId) -> Result<Option<DateTime<Utc>>>;

    async fn add_follow_up(&self, task: &FollowUpTask) -> Result<()>;

    async fn follow_ups(&self, lead_id: LeadId) -> Result<Vec<FollowUpTask>>;

    async fn property_interests(&self, lead_id: LeadId) -> Result<Vec<PropertyInterest>>;

    async fn status_history(&self, lead_id: LeadId) -> Result<Vec<StatusChange>>;

    // ─── Agents ────────────────────────────────────────────

    async fn upsert_agent(&self, agent: &Agent) -> Result<()>;

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>>;

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>>;

    /// Insert or replace the metric for `(agent_id, date)`.
    async fn record_performance(&self, metric: &PerformanceMetric) -> Result<()>;

    /// Conversion rate of the most recent metric; `None` when that metric
    /// has no rate or the agent has no metrics.
    async fn latest_conversion_rate(&self, agent_id: AgentId) -> Result<Option<f64>>;

    // ─── Assignments ───────────────────────────────────────

    /// Non-superseded assignments of an agent whose lead is not converted/lost.
    async fn count_active_assignments(&self, agent_id: AgentId) -> Result<u32>;

    async fn active_assignment(&self, lead_id: LeadId) -> Result<Option<Assignment>>;

    /// All assignments of a lead, oldest first.
    async fn assignment_history(&self, lead_id: LeadId) -> Result<Vec<Assignment>>;

    /// Create the first active assignment of a lead.
    ///
    /// Fails with `AlreadyAssigned` when the lead already has one and with
    /// `CapacityExceeded` when the request carries a ceiling the agent reached.
    async fn create_assignment(&self, request: &AssignmentRequest) -> Result<AssignmentId>;

    /// Mark the lead's active assignment superseded. Returns rows changed.
    async fn supersede_active_assignment(&self, lead_id: LeadId) -> Result<u64>;

    /// Supersede the active assignment and create a new one in one transaction.
    async fn replace_active_assignment(&self, request: &AssignmentRequest)
        -> Result<AssignmentId>;

    // ─── Scoring rules ─────────────────────────────────────

    async fn create_scoring_rule(&self, rule: &ScoringRule) -> Result<()>;

    async fn get_scoring_rule(&self, rule_id: Uuid) -> Result<Option<ScoringRule>>;

    async fn list_scoring_rules(&self, active_only: bool) -> Result<Vec<ScoringRule>>;

    /// Replace a stored rule. Returns false when it does not exist.
    async fn update_scoring_rule(&self, rule: &ScoringRule) -> Result<bool>;

    async fn delete_scoring_rule(&self, rule_id: Uuid) -> Result<bool>;
}

// ─── In-memory implementation ──────────────────────────────

#[derive(Default)]
struct State {
    leads: HashMap<LeadId, Lead>,
    sources: HashMap<LeadId, LeadSource>,
    activities: Vec<LeadActivity>,
    follow_ups: Vec<FollowUpTask>,
    interests: HashMap<LeadId, Vec<PropertyInterest>>,
    history: Vec<StatusChange>,
    agents: HashMap<AgentId, Agent>,
    metrics: Vec<PerformanceMetric>,
    assignments: Vec<Assignment>,
    rules: Vec<ScoringRule>,
}

impl State {
    fn active_count(&self, agent_id: AgentId) -> u32 {
        self.assignments
            .iter()
            .filter(|a| a.agent_id == agent_id && !a.superseded)
            .filter(|a| {
                self.leads
                    .get(&a.lead_id)
                    .is_some_and(|lead| !lead.status.is_terminal())
            })
            .count() as u32
    }

    fn check_capacity(&self, request: &AssignmentRequest) -> Result<()> {
        if let Some(ceiling) = request.capacity_ceiling {
            if self.active_count(request.agent_id) >= ceiling {
                return Err(LeadFlowError::CapacityExceeded {
                    agent_id: request.agent_id,
                    ceiling,
                });
            }
        }
        Ok(())
    }

    fn has_active(&self, lead_id: LeadId) -> bool {
        self.assignments
            .iter()
            .any(|a| a.lead_id == lead_id && !a.superseded)
    }
}

/// In-memory repository for tests and lightweight usage.
///
/// A single lock guards all tables, so every method is trivially atomic.
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| LeadFlowError::Repository("in-memory store lock poisoned".to_string()))
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeadRepository for InMemoryRepository {
    async fn insert_lead(&self, lead: &Lead, source: &LeadSource) -> Result<()> {
        let mut state = self.lock()?;
        if state.leads.contains_key(&lead.lead_id) {
            return Err(LeadFlowError::Repository(format!(
                "lead {} already exists",
                lead.lead_id
            )));
        }
        state.leads.insert(lead.lead_id, lead.clone());
        state.sources.insert(lead.lead_id, source.clone());
        Ok(())
    }

    async fn get_lead(&self, lead_id: LeadId) -> Result<Option<Lead>> {
        Ok(self.lock()?.leads.get(&lead_id).cloned())
    }

    async fn delete_lead(&self, lead_id: LeadId) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state.leads.remove(&lead_id).is_some();
        state.sources.remove(&lead_id);
        state.interests.remove(&lead_id);
        state.activities.retain(|a| a.lead_id != lead_id);
        state.follow_ups.retain(|t| t.lead_id != lead_id);
        state.history.retain(|h| h.lead_id != lead_id);
        state.assignments.retain(|a| a.lead_id != lead_id);
        Ok(removed)
    }

    async fn find_recent_duplicate(
        &self,
        phone: &str,
        email: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<LeadId>> {
        let state = self.lock()?;
        Ok(state
            .leads
            .values()
            .filter(|l| l.created_at >= since)
            .find(|l| {
                l.profile.phone == phone
                    || (email.is_some() && l.profile.email.as_deref() == email)
            })
            .map(|l| l.lead_id))
    }

    async fn get_lead_score(&self, lead_id: LeadId) -> Result<i32> {
        self.lock()?
            .leads
            .get(&lead_id)
            .map(|l| l.score)
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))
    }

    async fn set_lead_score(&self, lead_id: LeadId, score: i32) -> Result<i32> {
        let mut state = self.lock()?;
        let lead = state
            .leads
            .get_mut(&lead_id)
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))?;
        lead.score = scoring::clamp_score(score as i64);
        lead.updated_at = Utc::now();
        Ok(lead.score)
    }

    async fn apply_lead_update(&self, change: LeadChange) -> Result<LeadUpdateOutcome> {
        let mut state = self.lock()?;
        let now = Utc::now();

        // Validate before touching anything so a failure leaves no partial write.
        let lead = state
            .leads
            .get(&change.lead_id)
            .ok_or_else(|| LeadFlowError::lead_not_found(change.lead_id))?;
        let previous_status = lead.status;
        let previous_score = lead.score;

        let status_change = match change.new_status {
            Some(new_status) if new_status != previous_status => Some(StatusChange {
                lead_id: change.lead_id,
                previous_status,
                new_status,
                notes: change.status_notes.clone(),
                changed_at: now,
            }),
            _ => None,
        };

        let score = scoring::apply_delta(previous_score, change.score_delta);
        let status = status_change
            .as_ref()
            .map_or(previous_status, |sc| sc.new_status);
        if let Some(lead) = state.leads.get_mut(&change.lead_id) {
            lead.status = status;
            lead.score = score;
            lead.updated_at = now;
        }

        if let Some(sc) = &status_change {
            state.history.push(sc.clone());
        }
        if let Some(activity) = change.activity {
            state.activities.push(activity);
        }
        if let Some(task) = change.follow_up {
            state.follow_ups.push(task);
        }
        if !change.interests.is_empty() {
            let stored = state.interests.entry(change.lead_id).or_default();
            for interest in change.interests {
                match stored.iter_mut().find(|i| i.property_id == interest.property_id) {
                    Some(existing) => existing.interest_level = interest.interest_level,
                    None => stored.push(interest),
                }
            }
        }

        Ok(LeadUpdateOutcome {
            status,
            previous_score,
            score,
            status_change,
        })
    }

    async fn last_activity_at(&self, lead_id: LeadId) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .lock()?
            .activities
            .iter()
            .filter(|a| a.lead_id == lead_id)
            .map(|a| a.created_at)
            .max())
    }

    async fn add_follow_up(&self, task: &FollowUpTask) -> Result<()> {
        self.lock()?.follow_ups.push(task.clone());
        Ok(())
    }

    async fn follow_ups(&self, lead_id: LeadId) -> Result<Vec<FollowUpTask>> {
        let state = self.lock()?;
        let mut tasks: Vec<_> = state
            .follow_ups
            .iter()
            .filter(|t| t.lead_id == lead_id)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.due_date);
        Ok(tasks)
    }

    async fn property_interests(&self, lead_id: LeadId) -> Result<Vec<PropertyInterest>> {
        Ok(self
            .lock()?
            .interests
            .get(&lead_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn status_history(&self, lead_id: LeadId) -> Result<Vec<StatusChange>> {
        Ok(self
            .lock()?
            .history
            .iter()
            .filter(|h| h.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        self.lock()?.agents.insert(agent.agent_id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, agent_id: AgentId) -> Result<Option<Agent>> {
        Ok(self.lock()?.agents.get(&agent_id).cloned())
    }

    async fn list_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        let state = self.lock()?;
        let mut agents: Vec<_> = state
            .agents
            .values()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect();
        agents.sort_by_key(|a| a.created_at);
        Ok(agents)
    }

    async fn record_performance(&self, metric: &PerformanceMetric) -> Result<()> {
        let mut state = self.lock()?;
        state
            .metrics
            .retain(|m| !(m.agent_id == metric.agent_id && m.date == metric.date));
        state.metrics.push(metric.clone());
        Ok(())
    }

    async fn latest_conversion_rate(&self, agent_id: AgentId) -> Result<Option<f64>> {
        let state = self.lock()?;
        Ok(state
            .metrics
            .iter()
            .filter(|m| m.agent_id == agent_id)
            .max_by_key(|m| m.date)
            .and_then(|m| m.conversion_rate))
    }

    async fn count_active_assignments(&self, agent_id: AgentId) -> Result<u32> {
        Ok(self.lock()?.active_count(agent_id))
    }

    async fn active_assignment(&self, lead_id: LeadId) -> Result<Option<Assignment>> {
        Ok(self
            .lock()?
            .assignments
            .iter()
            .find(|a| a.lead_id == lead_id && !a.superseded)
            .cloned())
    }

    async fn assignment_history(&self, lead_id: LeadId) -> Result<Vec<Assignment>> {
        Ok(self
            .lock()?
            .assignments
            .iter()
            .filter(|a| a.lead_id == lead_id)
            .cloned()
            .collect())
    }

    async fn create_assignment(&self, request: &AssignmentRequest) -> Result<AssignmentId> {
        let mut state = self.lock()?;
        if state.has_active(request.lead_id) {
            return Err(LeadFlowError::AlreadyAssigned(request.lead_id));
        }
        state.check_capacity(request)?;

        let assignment = Assignment::from_request(request);
        let id = assignment.assignment_id;
        state.assignments.push(assignment);
        Ok(id)
    }

    async fn supersede_active_assignment(&self, lead_id: LeadId) -> Result<u64> {
        let mut state = self.lock()?;
        let mut changed = 0;
        for a in state
            .assignments
            .iter_mut()
            .filter(|a| a.lead_id == lead_id && !a.superseded)
        {
            a.superseded = true;
            changed += 1;
        }
        Ok(changed)
    }

    async fn replace_active_assignment(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssignmentId> {
        let mut state = self.lock()?;
        // Capacity is checked before superseding so a refusal changes nothing.
        state.check_capacity(request)?;

        for a in state
            .assignments
            .iter_mut()
            .filter(|a| a.lead_id == request.lead_id && !a.superseded)
        {
            a.superseded = true;
        }
        let assignment = Assignment::from_request(request);
        let id = assignment.assignment_id;
        state.assignments.push(assignment);
        Ok(id)
    }

    async fn create_scoring_rule(&self, rule: &ScoringRule) -> Result<()> {
        rule.validate()?;
        self.lock()?.rules.push(rule.clone());
        Ok(())
    }

    async fn get_scoring_rule(&self, rule_id: Uuid) -> Result<Option<ScoringRule>> {
        Ok(self
            .lock()?
            .rules
            .iter()
            .find(|r| r.rule_id == rule_id)
            .cloned())
    }

    async fn list_scoring_rules(&self, active_only: bool) -> Result<Vec<ScoringRule>> {
        Ok(self
            .lock()?
            .rules
            .iter()
            .filter(|r| !active_only || r.is_active)
            .cloned()
            .collect())
    }

    async fn update_scoring_rule(&self, rule: &ScoringRule) -> Result<bool> {
        rule.validate()?;
        let mut state = self.lock()?;
        match state.rules.iter_mut().find(|r| r.rule_id == rule.rule_id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_scoring_rule(&self, rule_id: Uuid) -> Result<bool> {
        let mut state = self.lock()?;
        let before = state.rules.len();
        state.rules.retain(|r| r.rule_id != rule_id);
        Ok(state.rules.len() != before)
    }
}
