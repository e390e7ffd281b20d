use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::shadow::{self, extract_trigger, DEFAULT_SAMPLE_LIMIT, MAX_FALSE_POSITIVE_RATE};
use crate::config::EvolutionConfig;
use crate::drafts::candidate_draft;
use crate::error::MemoryError;
use crate::models::*;
use crate::store::{CandidateWrite, DecisionRecord, MemoryStore};

/// Confidence bars applied after a candidate passes the false-positive gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PromotionThresholds {
    pub auto_apply: f64,
    pub draft: f64,
}

impl Default for PromotionThresholds {
    fn default() -> Self {
        Self::from(&EvolutionConfig::default())
    }
}

impl From<&EvolutionConfig> for PromotionThresholds {
    fn from(config: &EvolutionConfig) -> Self {
        Self {
            auto_apply: config.auto_apply_threshold,
            draft: config.draft_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    AutoApplied,
    Drafted,
    Rejected,
}

impl PromotionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApplied => "auto_applied",
            Self::Drafted => "drafted",
            Self::Rejected => "rejected",
        }
    }

    fn log_action(self) -> EvolutionAction {
        match self {
            Self::AutoApplied => EvolutionAction::AutoApplied,
            Self::Drafted => EvolutionAction::Drafted,
            Self::Rejected => EvolutionAction::Rejected,
        }
    }
}

/// What happened to a submitted candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionResult {
    pub action: PromotionAction,
    /// The candidate as evaluated, shadow result attached when it could be tested.
    /// For a successful merge this is the updated existing candidate.
    pub candidate: EvolutionCandidate,
    /// The submission was evaluated as an update to an existing candidate.
    pub merged_existing: bool,
    /// Draft created for a newly drafted candidate.
    pub draft_id: Option<String>,
    pub reason: Option<String>,
}

/// Outcome of a direct human review of a candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateReview {
    pub candidate: EvolutionCandidate,
    /// Pending drafts of the candidate that the review closed as rejected.
    pub closed_drafts: Vec<String>,
}

/// Decides the fate of proposed candidates: shadow test, thresholds, dedup, audit log.
pub struct Promoter {
    store: Arc<dyn MemoryStore>,
    sample_limit: usize,
    // Held from the dedup lookup until the decision is persisted.
    decision_lock: Mutex<()>,
}

struct Decision {
    action: PromotionAction,
    reason: Option<String>,
}

impl Promoter {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self {
            store,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            decision_lock: Mutex::new(()),
        }
    }

    pub fn from_config(store: Arc<dyn MemoryStore>, config: &EvolutionConfig) -> Self {
        Self::new(store).with_sample_limit(config.shadow_sample_limit)
    }

    /// Cap on sessions replayed per shadow test; `0` replays all of them.
    pub fn with_sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit;
        self
    }

    /// Evaluate `candidate` and persist the outcome.
    ///
    /// A candidate whose title is contained in an existing candidate's title is treated
    /// as an update to that one: it passes through the same gate, never creates a
    /// second row, and a rejection leaves the existing row untouched. Every call appends
    /// exactly one log entry. Calls on the same `Promoter` are serialized.
    pub async fn promote_candidate(
        &self,
        mut candidate: EvolutionCandidate,
        thresholds: &PromotionThresholds,
    ) -> Result<PromotionResult, MemoryError> {
        let _guard = self.decision_lock.lock().await;

        let existing = self
            .store
            .list_evolution_candidates(&CandidateFilter::title_contains(candidate.title.as_str()))
            .await?
            .into_iter()
            .next();

        if let Some(existing) = &existing {
            if existing.status.is_terminal() {
                let reason = format!("already {}", existing.status.as_str());
                return self.reject_merge(existing, candidate, reason).await;
            }
        }

        let Some(trigger) = extract_trigger(&candidate.title).map(str::to_owned) else {
            let reason = "no quoted trigger phrase in title".to_string();
            return match &existing {
                Some(existing) => self.reject_merge(existing, candidate, reason).await,
                None => {
                    let decision = Decision {
                        action: PromotionAction::Rejected,
                        reason: Some(reason),
                    };
                    self.record_new(candidate, decision).await
                }
            };
        };

        let result = shadow::shadow_test(self.store.as_ref(), &trigger, self.sample_limit).await?;
        candidate.shadow = Some(result);
        let decision = decide(&result, candidate.confidence, thresholds);

        match existing {
            Some(existing) if decision.action == PromotionAction::Rejected => {
                let reason = decision.reason.unwrap_or_default();
                self.reject_merge(&existing, candidate, reason).await
            }
            Some(existing) => self.merge(existing, candidate, decision).await,
            None => self.record_new(candidate, decision).await,
        }
    }

    async fn record_new(
        &self,
        mut candidate: EvolutionCandidate,
        decision: Decision,
    ) -> Result<PromotionResult, MemoryError> {
        candidate.status = match decision.action {
            PromotionAction::AutoApplied => CandidateStatus::AutoApplied,
            PromotionAction::Drafted => CandidateStatus::Drafted,
            PromotionAction::Rejected => CandidateStatus::Rejected,
        };
        candidate.updated_at = Utc::now();

        let draft = (decision.action == PromotionAction::Drafted)
            .then(|| DraftEntry::new(candidate_draft(&candidate)));
        let draft_id = draft.as_ref().map(|d| d.id.clone());

        let mut record = DecisionRecord::new(
            CandidateWrite::Insert(candidate.clone()),
            decision.log_entry(&candidate),
        );
        record.draft = draft;
        self.store.record_decision(&record).await?;
        decision.trace(&candidate);

        Ok(PromotionResult {
            action: decision.action,
            candidate,
            merged_existing: false,
            draft_id,
            reason: decision.reason,
        })
    }

    async fn merge(
        &self,
        existing: EvolutionCandidate,
        incoming: EvolutionCandidate,
        decision: Decision,
    ) -> Result<PromotionResult, MemoryError> {
        let mut merged = existing;
        merged.confidence = incoming.confidence;
        merged.session_count = merged.session_count.saturating_add(incoming.session_count);
        merged.discovery_tokens = merged
            .discovery_tokens
            .saturating_add(incoming.discovery_tokens);
        merged.evidence.extend(incoming.evidence);
        if !incoming.description.trim().is_empty() {
            merged.description = incoming.description;
        }
        if let Some(action) = incoming.suggested_action.filter(|a| !a.trim().is_empty()) {
            merged.suggested_action = Some(action);
        }
        merged.shadow = incoming.shadow;

        // A drafted candidate already has a draft awaiting review; it stays on that path.
        let decision = if merged.status == CandidateStatus::Drafted
            && decision.action == PromotionAction::AutoApplied
        {
            Decision {
                action: PromotionAction::Drafted,
                reason: Some("draft awaiting review".to_string()),
            }
        } else {
            decision
        };
        if decision.action == PromotionAction::AutoApplied {
            merged.status = CandidateStatus::AutoApplied;
        }
        merged.updated_at = Utc::now();

        let record = DecisionRecord::new(
            CandidateWrite::Update(merged.clone()),
            decision.log_entry(&merged),
        );
        self.store.record_decision(&record).await?;
        decision.trace(&merged);

        Ok(PromotionResult {
            action: decision.action,
            candidate: merged,
            merged_existing: true,
            draft_id: None,
            reason: decision.reason,
        })
    }

    /// Reject a submission that matched `existing` without touching the stored row.
    async fn reject_merge(
        &self,
        existing: &EvolutionCandidate,
        mut incoming: EvolutionCandidate,
        reason: String,
    ) -> Result<PromotionResult, MemoryError> {
        incoming.status = CandidateStatus::Rejected;
        let decision = Decision {
            action: PromotionAction::Rejected,
            reason: Some(reason),
        };

        let mut entry =
            EvolutionLogEntry::record(&incoming, EvolutionAction::Rejected, decision.reason.clone());
        entry.candidate_id = existing.id.clone();
        self.store.append_evolution_log(&entry).await?;

        tracing::info!(
            "Rejected update to candidate {} ({:?}): {}",
            existing.id,
            existing.title,
            decision.reason.as_deref().unwrap_or_default()
        );

        Ok(PromotionResult {
            action: decision.action,
            candidate: incoming,
            merged_existing: true,
            draft_id: None,
            reason: decision.reason,
        })
    }

    /// Approve a pending or drafted candidate without going through its draft.
    ///
    /// Pending drafts linked to the candidate are closed as rejected in the same write.
    pub async fn approve_candidate(&self, id: &str) -> Result<CandidateReview, MemoryError> {
        let superseded = format!("superseded by direct approval of candidate {id}");
        self.review(id, CandidateStatus::Approved, None, superseded)
            .await
    }

    /// Reject a pending or drafted candidate, closing its pending drafts with the same reason.
    pub async fn reject_candidate(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<CandidateReview, MemoryError> {
        let closing = reason
            .clone()
            .unwrap_or_else(|| format!("candidate {id} rejected"));
        self.review(id, CandidateStatus::Rejected, reason, closing)
            .await
    }

    async fn review(
        &self,
        id: &str,
        status: CandidateStatus,
        reason: Option<String>,
        draft_reason: String,
    ) -> Result<CandidateReview, MemoryError> {
        let _guard = self.decision_lock.lock().await;

        let mut candidate = self
            .store
            .get_evolution_candidate(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound {
                entity: "evolution candidate",
                id: id.to_string(),
            })?;
        if candidate.status.is_terminal() {
            return Err(MemoryError::InvalidState {
                entity: "evolution candidate",
                id: candidate.id,
                status: candidate.status.as_str().to_string(),
                expected: "pending or drafted",
            });
        }

        let now = Utc::now();
        candidate.status = status;
        candidate.updated_at = now;

        let pending = DraftFilter {
            status: Some(DraftStatus::Pending),
            evolution_candidate_id: Some(candidate.id.clone()),
            limit: usize::MAX,
            ..DraftFilter::default()
        };
        let resolved_drafts: Vec<DraftEntry> = self
            .store
            .list_drafts(&pending)
            .await?
            .into_iter()
            .map(|mut draft| {
                draft.status = DraftStatus::Rejected;
                draft.rejected_reason = Some(draft_reason.clone());
                draft.updated_at = now;
                draft
            })
            .collect();

        let action = match status {
            CandidateStatus::Approved => EvolutionAction::Approved,
            _ => EvolutionAction::Rejected,
        };
        let mut record = DecisionRecord::new(
            CandidateWrite::Update(candidate.clone()),
            EvolutionLogEntry::record(&candidate, action, reason),
        );
        record.resolved_drafts = resolved_drafts;
        self.store.record_decision(&record).await?;

        let closed_drafts: Vec<String> = record.resolved_drafts.into_iter().map(|d| d.id).collect();
        tracing::info!(
            "Candidate {} ({:?}) {} by review, {} draft(s) closed",
            candidate.id,
            candidate.title,
            status.as_str(),
            closed_drafts.len()
        );
        Ok(CandidateReview {
            candidate,
            closed_drafts,
        })
    }
}

impl Decision {
    fn log_entry(&self, candidate: &EvolutionCandidate) -> EvolutionLogEntry {
        EvolutionLogEntry::record(candidate, self.action.log_action(), self.reason.clone())
    }

    fn trace(&self, candidate: &EvolutionCandidate) {
        match &self.reason {
            Some(reason) => tracing::info!(
                "Candidate {} ({:?}) {}: {}",
                candidate.id,
                candidate.title,
                self.action.as_str(),
                reason
            ),
            None => tracing::info!(
                "Candidate {} ({:?}) {}",
                candidate.id,
                candidate.title,
                self.action.as_str()
            ),
        }
    }
}

fn decide(result: &ShadowTestResult, confidence: f64, thresholds: &PromotionThresholds) -> Decision {
    if !shadow::passes_gate(result) {
        return Decision {
            action: PromotionAction::Rejected,
            reason: Some(format!(
                "false positive rate {:.2} exceeds {:.2} ({}/{} sessions)",
                result.false_positive_rate,
                MAX_FALSE_POSITIVE_RATE,
                result.triggering_sessions,
                result.sample_size
            )),
        };
    }

    if confidence >= thresholds.auto_apply {
        Decision {
            action: PromotionAction::AutoApplied,
            reason: None,
        }
    } else if confidence >= thresholds.draft {
        Decision {
            action: PromotionAction::Drafted,
            reason: None,
        }
    } else {
        Decision {
            action: PromotionAction::Rejected,
            reason: Some(format!(
                "confidence {} below draft threshold {}",
                confidence, thresholds.draft
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadow(triggering: usize, sample: usize) -> ShadowTestResult {
        ShadowTestResult {
            false_positive_rate: triggering as f64 / sample as f64,
            sample_size: sample,
            triggering_sessions: triggering,
        }
    }

    #[test]
    fn broad_rules_are_rejected_regardless_of_confidence() {
        let decision = decide(&shadow(5, 25), 100.0, &PromotionThresholds::default());
        assert_eq!(decision.action, PromotionAction::Rejected);
        assert!(decision.reason.unwrap().contains("5/25"));
    }

    #[test]
    fn thresholds_route_confident_rules() {
        let thresholds = PromotionThresholds::default();
        assert_eq!(decide(&shadow(1, 25), 90.0, &thresholds).action, PromotionAction::AutoApplied);
        assert_eq!(decide(&shadow(1, 25), 89.9, &thresholds).action, PromotionAction::Drafted);
        assert_eq!(decide(&shadow(1, 25), 70.0, &thresholds).action, PromotionAction::Drafted);
        assert_eq!(decide(&shadow(1, 25), 69.0, &thresholds).action, PromotionAction::Rejected);
    }

    #[test]
    fn thresholds_follow_config() {
        let config = EvolutionConfig {
            auto_apply_threshold: 80.0,
            draft_threshold: 50.0,
            shadow_sample_limit: 10,
        };
        let thresholds = PromotionThresholds::from(&config);
        assert_eq!(decide(&shadow(0, 10), 85.0, &thresholds).action, PromotionAction::AutoApplied);
        assert_eq!(decide(&shadow(0, 10), 55.0, &thresholds).action, PromotionAction::Drafted);
    }
}
