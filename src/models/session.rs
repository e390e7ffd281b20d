use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One development session.
///
/// A session is created when work starts and archived, never deleted, when it ends.
/// Only the owning session mutates it; once `ended_at` is set the record is treated as
/// immutable apart from append-only analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub branch: String,
    pub started_at: DateTime<Utc>,
    /// `None` while the session is still open.
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub classification: SessionClassification,
    /// Filled in when the session ends.
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

/// Free-form classification attached at session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionClassification {
    pub domain: Option<String>,
    pub nature: Option<String>,
    pub complexity: Option<String>,
    #[serde(default)]
    pub fast_track: bool,
}

/// Outcome summary recorded when a session ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub tests_passing: bool,
    pub compliance_score: f64,
    #[serde(default)]
    pub reverts: u32,
    #[serde(default)]
    pub reworks: u32,
}

/// Derived from `ended_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

impl Session {
    /// Open a new session on `branch`.
    pub fn start(branch: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            branch: branch.into(),
            started_at: Utc::now(),
            ended_at: None,
            classification: SessionClassification::default(),
            outcome: None,
            decisions: Vec::new(),
            tools_used: Vec::new(),
            files_touched: Vec::new(),
        }
    }

    /// Archive the session with its outcome.
    pub fn end(mut self, outcome: SessionOutcome) -> Self {
        self.ended_at = Some(Utc::now());
        self.outcome = Some(outcome);
        self
    }

    pub fn status(&self) -> SessionStatus {
        if self.ended_at.is_some() {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        }
    }
}

/// Counts and the most recent sessions, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub recent: Vec<Session>,
}
