use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A proposed governance rule distilled from recurring behavior across sessions.
///
/// Candidates are authored with the literal trigger phrase quoted inside the title
/// (e.g. `Ban "as any" casts`), which is what lets the shadow tester replay them
/// mechanically against history.
///
/// # Lifecycle
/// `Pending` → `AutoApplied` | `Rejected` directly through the shadow-test gate, or
/// `Pending` → `Drafted` → `Approved` | `Rejected` through human review of the linked
/// draft. Candidates are never deleted; rejected ones stay for audit and dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionCandidate {
    #[serde(default = "new_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub candidate_type: EvolutionType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Confidence in `[0, 100]` as asserted by the proposer.
    pub confidence: f64,
    /// Number of sessions supporting the proposal.
    #[serde(default)]
    pub session_count: u32,
    /// Opaque evidence items.
    #[serde(default)]
    pub evidence: Vec<serde_json::Value>,
    #[serde(default)]
    pub discovery_tokens: u64,
    #[serde(default)]
    pub suggested_action: Option<String>,
    #[serde(default = "CandidateStatus::initial")]
    pub status: CandidateStatus,
    /// Present once the candidate has been shadow tested.
    #[serde(default)]
    pub shadow: Option<ShadowTestResult>,
    #[serde(default = "chrono::Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "chrono::Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl EvolutionCandidate {
    pub fn new(candidate_type: EvolutionType, title: impl Into<String>, confidence: f64) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            candidate_type,
            title: title.into(),
            description: String::new(),
            confidence,
            session_count: 0,
            evidence: Vec::new(),
            discovery_tokens: 0,
            suggested_action: None,
            status: CandidateStatus::Pending,
            shadow: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn shadow_tested(&self) -> bool {
        self.shadow.is_some()
    }

    pub fn false_positive_rate(&self) -> Option<f64> {
        self.shadow.as_ref().map(|s| s.false_positive_rate)
    }

    pub fn sample_size(&self) -> Option<usize> {
        self.shadow.as_ref().map(|s| s.sample_size)
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outcome of replaying a candidate's trigger against historical sessions.
///
/// The rate and sample size travel together so a candidate can never be marked
/// tested without them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowTestResult {
    pub false_positive_rate: f64,
    pub sample_size: usize,
    pub triggering_sessions: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EvolutionType {
    PatternBan,
    NewConvention,
    RuleElevation,
    SkillCombo,
    WorkflowOptimization,
}

impl EvolutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatternBan => "pattern-ban",
            Self::NewConvention => "new-convention",
            Self::RuleElevation => "rule-elevation",
            Self::SkillCombo => "skill-combo",
            Self::WorkflowOptimization => "workflow-optimization",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pattern-ban" => Some(Self::PatternBan),
            "new-convention" => Some(Self::NewConvention),
            "rule-elevation" => Some(Self::RuleElevation),
            "skill-combo" => Some(Self::SkillCombo),
            "workflow-optimization" => Some(Self::WorkflowOptimization),
            _ => None,
        }
    }
}

/// Lifecycle status of a candidate.
///
/// - `Pending`: proposed, not yet evaluated or awaiting a re-evaluation
/// - `Drafted`: passed the gate below the auto-apply bar; a draft awaits review
/// - `AutoApplied`: passed the gate with high confidence (terminal)
/// - `Approved`: its draft was approved by a human (terminal)
/// - `Rejected`: failed the gate or its draft was rejected (terminal)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Drafted,
    AutoApplied,
    Approved,
    Rejected,
}

impl CandidateStatus {
    fn initial() -> Self {
        Self::Pending
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Drafted => "drafted",
            Self::AutoApplied => "auto_applied",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "drafted" => Some(Self::Drafted),
            "auto_applied" => Some(Self::AutoApplied),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AutoApplied | Self::Approved | Self::Rejected)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateFilter {
    /// Case-sensitive substring of the title.
    pub title: Option<String>,
    pub status: Option<CandidateStatus>,
}

impl CandidateFilter {
    pub fn title_contains(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            status: None,
        }
    }
}

/// Append-only audit record of a decision about a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionLogEntry {
    pub id: String,
    pub candidate_id: String,
    pub action: EvolutionAction,
    pub title: String,
    /// Candidate confidence at the time of the decision.
    pub confidence: f64,
    #[serde(default)]
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EvolutionLogEntry {
    pub fn record(
        candidate: &EvolutionCandidate,
        action: EvolutionAction,
        reason: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            candidate_id: candidate.id.clone(),
            action,
            title: candidate.title.clone(),
            confidence: candidate.confidence,
            reason,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionAction {
    AutoApplied,
    Drafted,
    Approved,
    Rejected,
}

impl EvolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApplied => "auto_applied",
            Self::Drafted => "drafted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auto_applied" => Some(Self::AutoApplied),
            "drafted" => Some(Self::Drafted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Candidate counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvolutionStatus {
    pub pending: usize,
    pub drafted: usize,
    pub approved: usize,
    pub rejected: usize,
    pub auto_applied: usize,
}

/// Aggregate view over `pattern-ban` candidates.
///
/// A pattern is active once it was auto-applied or approved. Detections are the
/// supporting sessions reported by proposers; false positives are the sessions the
/// shadow test found already using the banned pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternStats {
    pub total_patterns: usize,
    pub active_patterns: usize,
    pub total_detections: u64,
    pub false_positives: u64,
}
