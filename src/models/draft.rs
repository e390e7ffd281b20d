use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content staged for human review.
///
/// A draft is resolved exactly once: `Pending` → `Approved` or `Pending` → `Rejected`.
/// Drafts produced by the promotion gate link back to their candidate through
/// `evolution_candidate_id`; manual drafts have no link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftEntry {
    pub id: String,
    pub category: DraftCategory,
    pub title: String,
    /// File name the content is written to on approval.
    pub filename: String,
    pub content: String,
    pub confidence: f64,
    pub source: DraftSource,
    #[serde(default)]
    pub evolution_candidate_id: Option<String>,
    pub status: DraftStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rejected_reason: Option<String>,
}

impl DraftEntry {
    pub fn new(input: CreateDraftInput) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            category: input.category,
            title: input.title,
            filename: input.filename,
            content: input.content,
            confidence: input.confidence,
            source: input.source,
            evolution_candidate_id: input.evolution_candidate_id,
            status: DraftStatus::Pending,
            created_at: now,
            updated_at: now,
            approved_at: None,
            rejected_reason: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDraftInput {
    pub category: DraftCategory,
    pub title: String,
    pub filename: String,
    pub content: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default = "DraftSource::manual")]
    pub source: DraftSource,
    #[serde(default)]
    pub evolution_candidate_id: Option<String>,
}

/// Edits to a pending draft. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateDraftInput {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<DraftCategory>,
    pub confidence: Option<f64>,
    pub filename: Option<String>,
}

impl UpdateDraftInput {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.category.is_none()
            && self.confidence.is_none()
            && self.filename.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DraftCategory {
    Rule,
    Knowledge,
    Skill,
    Workflow,
}

impl DraftCategory {
    pub const ALL: [DraftCategory; 4] = [Self::Rule, Self::Knowledge, Self::Skill, Self::Workflow];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rule => "rule",
            Self::Knowledge => "knowledge",
            Self::Skill => "skill",
            Self::Workflow => "workflow",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "rule" => Some(Self::Rule),
            "knowledge" => Some(Self::Knowledge),
            "skill" => Some(Self::Skill),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftSource {
    Evolution,
    Manual,
}

impl DraftSource {
    fn manual() -> Self {
        Self::Manual
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evolution => "evolution",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "evolution" => Some(Self::Evolution),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Pending,
    Approved,
    Rejected,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// Filter for listing drafts. `limit` bounds the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftFilter {
    pub category: Option<DraftCategory>,
    pub status: Option<DraftStatus>,
    /// Only drafts linked to this candidate.
    #[serde(default)]
    pub evolution_candidate_id: Option<String>,
    pub limit: usize,
}

impl Default for DraftFilter {
    fn default() -> Self {
        Self {
            category: None,
            status: None,
            evolution_candidate_id: None,
            limit: 50,
        }
    }
}
