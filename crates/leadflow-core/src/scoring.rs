//! Lead scoring: initial score from profile + source, deltas from activities.
//!
//! Every score is a sum of independent contributions clamped to `[0, 100]`.
//! The built-in rules are fixed; stored [`ScoringRule`]s add on top of them.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::activity::{Activity, ActivityType, LeadActivity, Outcome};
use crate::error::{LeadFlowError, Result};
use crate::lead::{LeadId, LeadProfile, PropertyType, SourceDetails, SourceType};
use crate::repository::{LeadChange, LeadRepository};

pub const MIN_SCORE: i32 = 0;
pub const MAX_SCORE: i32 = 100;

/// Days without activity before the inactivity penalty applies.
pub const INACTIVITY_DAYS: i64 = 7;

/// Largest magnitude a stored rule may move a score by.
pub const MAX_RULE_DELTA: i32 = MAX_SCORE - MIN_SCORE;

/// Source weight used when the channel is unknown.
pub const DEFAULT_SOURCE_WEIGHT: i32 = 50;

const GCC_NATIONALITIES: &[&str] = &["KSA", "Kuwait", "Oman", "Bahrain", "Qatar"];

/// Clamp any intermediate value into the valid score range.
pub fn clamp_score(raw: i64) -> i32 {
    raw.clamp(MIN_SCORE as i64, MAX_SCORE as i64) as i32
}

/// Apply a delta to a stored score.
pub fn apply_delta(current: i32, delta: i32) -> i32 {
    clamp_score(current as i64 + delta as i64)
}

/// Quality weight of a lead channel (0–100).
pub fn source_quality_weight(source: Option<SourceType>) -> i32 {
    match source {
        Some(SourceType::Bayut) => 90,
        Some(SourceType::PropertyFinder) => 85,
        Some(SourceType::Referral) => 82,
        Some(SourceType::Website) => 80,
        Some(SourceType::WalkIn) => 75,
        Some(SourceType::Dubizzle) => 70,
        None => DEFAULT_SOURCE_WEIGHT,
    }
}

/// One line of a score explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreContribution {
    pub factor: String,
    pub delta: i32,
}

impl ScoreContribution {
    fn new(factor: impl Into<String>, delta: i32) -> Self {
        Self {
            factor: factor.into(),
            delta,
        }
    }
}

/// Full explanation of a computed score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub contributions: Vec<ScoreContribution>,
    /// Sum of all contributions before clamping.
    pub raw: i64,
    pub score: i32,
}

impl ScoreBreakdown {
    fn from_contributions(base: i32, contributions: Vec<ScoreContribution>) -> Self {
        let raw = base as i64 + contributions.iter().map(|c| c.delta as i64).sum::<i64>();
        Self {
            contributions,
            raw,
            score: clamp_score(raw),
        }
    }

    /// Net change, bounded to the widest move a score can make.
    pub fn delta(&self) -> i32 {
        let total: i64 = self.contributions.iter().map(|c| c.delta as i64).sum();
        let bound = (MAX_SCORE - MIN_SCORE) as i64;
        total.clamp(-bound, bound) as i32
    }
}

// ─── Custom rules ──────────────────────────────────────────

/// Condition a stored scoring rule tests for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCriterion {
    BudgetAbove { amount: i64 },
    BudgetBelow { amount: i64 },
    Source { source: SourceType },
    Nationality { values: Vec<String> },
    PropertyType { property_type: PropertyType },
    Referral,
    RespondedWithin { minutes: u32 },
    ActivityType { activity_type: ActivityType },
    Outcome { outcome: Outcome },
    InactiveForDays { days: i64 },
}

impl RuleCriterion {
    /// Whether the criterion is evaluated on score updates rather than capture.
    pub fn is_activity_rule(&self) -> bool {
        matches!(
            self,
            RuleCriterion::ActivityType { .. }
                | RuleCriterion::Outcome { .. }
                | RuleCriterion::InactiveForDays { .. }
        )
    }

    fn matches_profile(&self, profile: &LeadProfile, source: &SourceDetails) -> bool {
        match self {
            RuleCriterion::BudgetAbove { amount } => profile.budget_max.unwrap_or(0) > *amount,
            RuleCriterion::BudgetBelow { amount } => profile.budget_max.unwrap_or(0) < *amount,
            RuleCriterion::Source { source: wanted } => source.source_type == Some(*wanted),
            RuleCriterion::Nationality { values } => profile
                .nationality
                .as_deref()
                .is_some_and(|n| values.iter().any(|v| v == n)),
            RuleCriterion::PropertyType { property_type } => {
                profile.property_type == Some(*property_type)
            }
            RuleCriterion::Referral => source.referrer_agent_id.is_some(),
            RuleCriterion::RespondedWithin { minutes } => source
                .response_time_minutes
                .is_some_and(|m| m < *minutes),
            _ => false,
        }
    }

    fn matches_activity(
        &self,
        activity: &Activity,
        last_activity_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        match self {
            RuleCriterion::ActivityType { activity_type } => activity.activity_type == *activity_type,
            RuleCriterion::Outcome { outcome } => activity.outcome == Some(*outcome),
            RuleCriterion::InactiveForDays { days } => {
                last_activity_at.is_some_and(|at| at < now - Duration::days(*days))
            }
            _ => false,
        }
    }
}

/// A named, togglable criterion → score delta rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringRule {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub criterion: RuleCriterion,
    pub score_delta: i32,
    #[serde(default = "default_rule_active")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_rule_active() -> bool {
    true
}

impl ScoringRule {
    pub fn new(rule_name: &str, criterion: RuleCriterion, score_delta: i32) -> Self {
        Self {
            rule_id: Uuid::new_v4(),
            rule_name: rule_name.to_string(),
            criterion,
            score_delta,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Reject rules that could not be stored or evaluated sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.rule_name.trim().is_empty() {
            return Err(LeadFlowError::Validation(
                "rule_name is required".to_string(),
            ));
        }
        if self.score_delta.unsigned_abs() > MAX_RULE_DELTA as u32 {
            return Err(LeadFlowError::Validation(format!(
                "score_delta must be within ±{}, got {}",
                MAX_RULE_DELTA, self.score_delta
            )));
        }
        Ok(())
    }
}

// ─── Engine ────────────────────────────────────────────────

/// Computes initial scores and activity-driven updates.
#[derive(Debug, Clone, Default)]
pub struct ScoringEngine {
    rules: Vec<ScoringRule>,
}

impl ScoringEngine {
    /// Engine with only the built-in rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with extra stored rules; inactive rules are dropped.
    pub fn with_rules(rules: Vec<ScoringRule>) -> Self {
        Self {
            rules: rules.into_iter().filter(|r| r.is_active).collect(),
        }
    }

    /// Load active rules from the repository.
    pub async fn from_repository(repo: &dyn LeadRepository) -> Result<Self> {
        Ok(Self::with_rules(repo.list_scoring_rules(true).await?))
    }

    pub fn rules(&self) -> &[ScoringRule] {
        &self.rules
    }

    /// Score a freshly captured lead.
    pub fn score_new_lead(&self, profile: &LeadProfile, source: &SourceDetails) -> i32 {
        self.explain_new_lead(profile, source).score
    }

    /// Score a freshly captured lead, keeping every contribution.
    pub fn explain_new_lead(&self, profile: &LeadProfile, source: &SourceDetails) -> ScoreBreakdown {
        let mut contributions = Vec::new();

        let budget_max = profile.budget_max.unwrap_or(0);
        if budget_max > 1_500_000 {
            contributions.push(ScoreContribution::new("budget above 1.5M", 15));
        } else if budget_max > 1_000_000 {
            contributions.push(ScoreContribution::new("budget above 1M", 8));
        } else if budget_max < 500_000 {
            contributions.push(ScoreContribution::new("budget below 500k", -5));
        }

        let weight = source_quality_weight(source.source_type);
        let source_name = source
            .source_type
            .map(|s| s.as_str())
            .unwrap_or("unknown");
        contributions.push(ScoreContribution::new(
            format!("source quality ({})", source_name),
            weight / 10,
        ));

        match profile.nationality.as_deref() {
            Some("UAE") => contributions.push(ScoreContribution::new("nationality UAE", 10)),
            Some(n) if GCC_NATIONALITIES.contains(&n) => {
                contributions.push(ScoreContribution::new("nationality GCC", 5))
            }
            _ => {}
        }

        match profile.property_type {
            Some(PropertyType::Villa) => contributions.push(ScoreContribution::new("villa", 5)),
            Some(PropertyType::Apartment) => {
                contributions.push(ScoreContribution::new("apartment", 3))
            }
            Some(PropertyType::Commercial) => {
                contributions.push(ScoreContribution::new("commercial", -3))
            }
            Some(PropertyType::Townhouse) | None => {}
        }

        match source.response_time_minutes {
            Some(m) if m < 60 => {
                contributions.push(ScoreContribution::new("responded within 1 hour", 10))
            }
            Some(m) if m < 1440 => {
                contributions.push(ScoreContribution::new("responded within 1 day", 5))
            }
            _ => {}
        }

        if source.referrer_agent_id.is_some() {
            contributions.push(ScoreContribution::new("referral bonus", 5));
        }

        for rule in self.rules.iter().filter(|r| !r.criterion.is_activity_rule()) {
            if rule.criterion.matches_profile(profile, source) {
                contributions.push(ScoreContribution::new(&rule.rule_name, rule.score_delta));
            }
        }

        ScoreBreakdown::from_contributions(0, contributions)
    }

    /// Score change caused by one activity.
    pub fn explain_activity(
        &self,
        current: i32,
        activity: &Activity,
        last_activity_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        let mut contributions = Vec::new();

        match activity.outcome {
            Some(Outcome::Positive) => {
                contributions.push(ScoreContribution::new("positive outcome", 5))
            }
            Some(Outcome::Negative) => {
                contributions.push(ScoreContribution::new("negative outcome", -5))
            }
            Some(Outcome::Neutral) | None => {}
        }

        // Independent checks, not an else-chain.
        if activity.activity_type == ActivityType::Viewing {
            contributions.push(ScoreContribution::new("viewing", 10));
        }
        if activity.activity_type == ActivityType::OfferMade {
            contributions.push(ScoreContribution::new("offer made", 20));
        }

        if let Some(at) = last_activity_at {
            if at < now - Duration::days(INACTIVITY_DAYS) {
                contributions.push(ScoreContribution::new("inactive for over 7 days", -10));
            }
        }

        for rule in self.rules.iter().filter(|r| r.criterion.is_activity_rule()) {
            if rule
                .criterion
                .matches_activity(activity, last_activity_at, now)
            {
                contributions.push(ScoreContribution::new(&rule.rule_name, rule.score_delta));
            }
        }

        ScoreBreakdown::from_contributions(current, contributions)
    }

    /// New score after one activity.
    pub fn score_after_activity(
        &self,
        current: i32,
        activity: &Activity,
        last_activity_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> i32 {
        self.explain_activity(current, activity, last_activity_at, now)
            .score
    }

    /// Record an activity against a lead and persist the rescored value.
    ///
    /// The activity row and the new score are written in one repository
    /// transaction. The inactivity penalty uses `activity.last_activity_at`
    /// when given, otherwise the most recent activity already on record.
    pub async fn update_lead_score(
        &self,
        repo: &dyn LeadRepository,
        lead_id: LeadId,
        activity: &Activity,
    ) -> Result<i32> {
        let lead = repo
            .get_lead(lead_id)
            .await?
            .ok_or_else(|| LeadFlowError::lead_not_found(lead_id))?;

        let last_activity_at = match activity.last_activity_at {
            Some(at) => Some(at),
            None => repo.last_activity_at(lead_id).await?,
        };
        let breakdown = self.explain_activity(lead.score, activity, last_activity_at, Utc::now());
        let owner = repo.active_assignment(lead_id).await?.map(|a| a.agent_id);

        let change = LeadChange {
            activity: Some(LeadActivity::record(lead_id, owner, activity)),
            score_delta: breakdown.delta(),
            ..LeadChange::new(lead_id)
        };
        let outcome = repo.apply_lead_update(change).await?;

        debug!(
            "Lead {} rescored {} → {} ({} contributions)",
            lead_id,
            lead.score,
            outcome.score,
            breakdown.contributions.len()
        );
        Ok(outcome.score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::{Lead, LeadSource};
    use crate::repository::InMemoryRepository;

    fn premium_profile() -> LeadProfile {
        LeadProfile {
            first_name: "Omar".into(),
            last_name: "Saeed".into(),
            phone: "+971500000001".into(),
            nationality: Some("UAE".into()),
            budget_max: Some(2_000_000),
            property_type: Some(PropertyType::Villa),
            ..Default::default()
        }
    }

    fn premium_source() -> SourceDetails {
        SourceDetails {
            source_type: Some(SourceType::Bayut),
            referrer_agent_id: Some(Uuid::new_v4()),
            response_time_minutes: Some(30),
            ..Default::default()
        }
    }

    #[test]
    fn test_end_to_end_initial_score() {
        let engine = ScoringEngine::new();
        let breakdown = engine.explain_new_lead(&premium_profile(), &premium_source());
        // 15 budget + 9 bayut + 10 UAE + 5 villa + 10 response + 5 referral
        assert_eq!(breakdown.raw, 54);
        assert_eq!(breakdown.score, 54);
    }

    #[test]
    fn test_budget_tiers() {
        let engine = ScoringEngine::new();
        let source = SourceDetails::default();
        let score_for = |budget: Option<i64>| {
            let profile = LeadProfile {
                budget_max: budget,
                ..Default::default()
            };
            engine.score_new_lead(&profile, &source)
        };
        // unknown source contributes 50 / 10 = 5
        assert_eq!(score_for(Some(1_600_000)), 20);
        assert_eq!(score_for(Some(1_500_000)), 13);
        assert_eq!(score_for(Some(1_000_000)), 5);
        assert_eq!(score_for(Some(499_999)), 0);
        assert_eq!(score_for(None), 0);
    }

    #[test]
    fn test_source_weights_scale_down() {
        let engine = ScoringEngine::new();
        let profile = LeadProfile {
            budget_max: Some(700_000),
            ..Default::default()
        };
        let expected = [
            (SourceType::Bayut, 9),
            (SourceType::PropertyFinder, 8),
            (SourceType::Referral, 8),
            (SourceType::Website, 8),
            (SourceType::WalkIn, 7),
            (SourceType::Dubizzle, 7),
        ];
        for (source_type, bonus) in expected {
            let source = SourceDetails {
                source_type: Some(source_type),
                ..Default::default()
            };
            assert_eq!(engine.score_new_lead(&profile, &source), bonus, "{}", source_type);
        }
    }

    #[test]
    fn test_nationality_and_property_type() {
        let engine = ScoringEngine::new();
        let source = SourceDetails::default();
        let base = LeadProfile {
            budget_max: Some(700_000),
            ..Default::default()
        };

        let gcc = LeadProfile {
            nationality: Some("Oman".into()),
            ..base.clone()
        };
        assert_eq!(engine.score_new_lead(&gcc, &source), 10);

        let other = LeadProfile {
            nationality: Some("India".into()),
            ..base.clone()
        };
        assert_eq!(engine.score_new_lead(&other, &source), 5);

        let commercial = LeadProfile {
            property_type: Some(PropertyType::Commercial),
            ..base.clone()
        };
        assert_eq!(engine.score_new_lead(&commercial, &source), 2);

        let townhouse = LeadProfile {
            property_type: Some(PropertyType::Townhouse),
            ..base
        };
        assert_eq!(engine.score_new_lead(&townhouse, &source), 5);
    }

    #[test]
    fn test_initial_score_always_in_range() {
        let engine = ScoringEngine::new();
        let budgets = [None, Some(0), Some(499_999), Some(1_200_000), Some(i64::MAX)];
        let nationalities = [None, Some("UAE"), Some("KSA"), Some("UK")];
        let property_types = [
            None,
            Some(PropertyType::Villa),
            Some(PropertyType::Apartment),
            Some(PropertyType::Townhouse),
            Some(PropertyType::Commercial),
        ];
        let response_times = [None, Some(0), Some(59), Some(60), Some(1439), Some(u32::MAX)];

        for budget in budgets {
            for nationality in nationalities {
                for property_type in property_types {
                    for response in response_times {
                        for referral in [false, true] {
                            let profile = LeadProfile {
                                budget_max: budget,
                                nationality: nationality.map(String::from),
                                property_type,
                                ..Default::default()
                            };
                            let source = SourceDetails {
                                source_type: Some(SourceType::Dubizzle),
                                referrer_agent_id: referral.then(Uuid::new_v4),
                                response_time_minutes: response,
                                ..Default::default()
                            };
                            let score = engine.score_new_lead(&profile, &source);
                            assert!((MIN_SCORE..=MAX_SCORE).contains(&score));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_activity_clamps_at_upper_bound() {
        let engine = ScoringEngine::new();
        let now = Utc::now();
        let offer = Activity::new(ActivityType::OfferMade);
        assert_eq!(engine.score_after_activity(98, &offer, None, now), 100);
    }

    #[test]
    fn test_activity_clamps_at_lower_bound() {
        let engine = ScoringEngine::new();
        let now = Utc::now();
        let stale_call = Activity::new(ActivityType::Call).with_outcome(Outcome::Negative);
        let last = Some(now - Duration::days(8));
        let breakdown = engine.explain_activity(3, &stale_call, last, now);
        assert_eq!(breakdown.delta(), -15);
        assert_eq!(breakdown.score, 0);
    }

    #[test]
    fn test_activity_deltas_are_additive() {
        let engine = ScoringEngine::new();
        let now = Utc::now();

        let viewing = Activity::new(ActivityType::Viewing).with_outcome(Outcome::Positive);
        assert_eq!(engine.score_after_activity(40, &viewing, None, now), 55);

        let neutral_email = Activity::new(ActivityType::Email).with_outcome(Outcome::Neutral);
        assert_eq!(engine.score_after_activity(40, &neutral_email, None, now), 40);

        // Exactly seven days is not yet inactive.
        let recent = Some(now - Duration::days(7) + Duration::minutes(1));
        assert_eq!(engine.score_after_activity(40, &neutral_email, recent, now), 40);
    }

    #[test]
    fn test_custom_rules_add_to_builtin_score() {
        let rules = vec![
            ScoringRule::new(
                "marina focus",
                RuleCriterion::Nationality {
                    values: vec!["UK".into()],
                },
                7,
            ),
            ScoringRule {
                is_active: false,
                ..ScoringRule::new("disabled", RuleCriterion::Referral, 50)
            },
            ScoringRule::new(
                "meeting bonus",
                RuleCriterion::ActivityType {
                    activity_type: ActivityType::Meeting,
                },
                4,
            ),
        ];
        let engine = ScoringEngine::with_rules(rules);
        assert_eq!(engine.rules().len(), 2);

        let profile = LeadProfile {
            budget_max: Some(700_000),
            nationality: Some("UK".into()),
            ..Default::default()
        };
        let source = SourceDetails {
            referrer_agent_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        // 5 unknown source + 5 referral + 7 custom
        assert_eq!(engine.score_new_lead(&profile, &source), 17);

        let meeting = Activity::new(ActivityType::Meeting);
        assert_eq!(engine.score_after_activity(10, &meeting, None, Utc::now()), 14);
    }

    #[test]
    fn test_rule_delta_bounds() {
        let offer = RuleCriterion::ActivityType {
            activity_type: ActivityType::OfferMade,
        };
        assert!(ScoringRule::new("max boost", offer.clone(), 100).validate().is_ok());
        assert!(ScoringRule::new("max drop", offer.clone(), -100).validate().is_ok());
        assert!(matches!(
            ScoringRule::new("too much", offer.clone(), 101).validate(),
            Err(LeadFlowError::Validation(_))
        ));
        assert!(matches!(
            ScoringRule::new("way too much", offer, i32::MIN).validate(),
            Err(LeadFlowError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_rule_delta_saturates() {
        let repo = InMemoryRepository::new();
        let lead = Lead::new(SourceType::Website, premium_profile(), 40);
        let source =
            LeadSource::from_details(lead.lead_id, SourceType::Website, &SourceDetails::default());
        repo.insert_lead(&lead, &source).await.unwrap();

        // Rows written before validation existed can still carry huge deltas.
        let engine = ScoringEngine::with_rules(vec![ScoringRule::new(
            "legacy offer boost",
            RuleCriterion::ActivityType {
                activity_type: ActivityType::OfferMade,
            },
            i32::MAX,
        )]);
        let offer = Activity::new(ActivityType::OfferMade);

        let breakdown = engine.explain_activity(40, &offer, None, Utc::now());
        assert_eq!(breakdown.delta(), 100);
        assert_eq!(breakdown.score, 100);

        let score = engine.update_lead_score(&repo, lead.lead_id, &offer).await.unwrap();
        assert_eq!(score, 100);
        assert_eq!(repo.get_lead_score(lead.lead_id).await.unwrap(), 100);
    }

    #[test]
    fn test_rule_criterion_json_shape() {
        let criterion: RuleCriterion =
            serde_json::from_str(r#"{"kind": "budget_above", "amount": 3000000}"#).unwrap();
        assert_eq!(criterion, RuleCriterion::BudgetAbove { amount: 3_000_000 });
        assert!(!criterion.is_activity_rule());
    }

    #[tokio::test]
    async fn test_update_lead_score_persists_clamped_value() {
        let repo = InMemoryRepository::new();
        let lead = Lead::new(SourceType::Website, premium_profile(), 98);
        let source =
            LeadSource::from_details(lead.lead_id, SourceType::Website, &SourceDetails::default());
        repo.insert_lead(&lead, &source).await.unwrap();

        let engine = ScoringEngine::new();
        let offer = Activity::new(ActivityType::OfferMade).with_outcome(Outcome::Positive);
        let score = engine.update_lead_score(&repo, lead.lead_id, &offer).await.unwrap();

        assert_eq!(score, 100);
        assert_eq!(repo.get_lead_score(lead.lead_id).await.unwrap(), 100);
        assert!(repo.last_activity_at(lead.lead_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_lead_score_unknown_lead() {
        let repo = InMemoryRepository::new();
        let engine = ScoringEngine::new();
        let result = engine
            .update_lead_score(&repo, Uuid::new_v4(), &Activity::new(ActivityType::Call))
            .await;
        assert!(matches!(result, Err(LeadFlowError::NotFound { .. })));
    }
}
