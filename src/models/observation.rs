use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A narrative fact recorded during a session.
///
/// Observations are write-once. The `narrative` is what the shadow tester scans when
/// replaying a candidate rule against history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    /// Owning session. A session owns many observations.
    pub session_id: String,
    /// Type tag, e.g. `discovery`, `bugfix`, `decision`.
    #[serde(rename = "type")]
    pub observation_type: String,
    pub title: String,
    pub narrative: String,
    #[serde(default)]
    pub facts: Option<Vec<String>>,
    #[serde(default)]
    pub concepts: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        session_id: impl Into<String>,
        observation_type: impl Into<String>,
        title: impl Into<String>,
        narrative: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            observation_type: observation_type.into(),
            title: title.into(),
            narrative: narrative.into(),
            facts: None,
            concepts: None,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservationFilter {
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl ObservationFilter {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            limit: None,
        }
    }
}
