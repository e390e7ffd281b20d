//! Pluggable persistence for sessions, observations, evolution candidates, the
//! evolution log, drafts and permanent memory.
//!
//! Two interchangeable backends implement [`MemoryStore`]:
//!
//! - [`SqliteStore`]: normalized tables, an FTS5 index over observation and
//!   permanent-memory text kept in sync by triggers, WAL journal, versioned schema.
//! - [`JsonStore`]: one JSON document per collection, replaced atomically on write.
//!   Used when the indexed backend cannot be opened. Same logical results, but search
//!   is a substring scan instead of a full-text index.
//!
//! [`open_store`] picks the backend once per process and hands it out behind
//! `Arc<dyn MemoryStore>`; callers never branch on the variant afterwards.

mod json;
mod schema;
mod sqlite;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub use json::JsonStore;
pub use schema::CURRENT_SCHEMA_VERSION;
pub use sqlite::SqliteStore;

use crate::config::{BackendPreference, StorageConfig};
use crate::error::StoreError;
use crate::models::*;

/// File name of the indexed database inside the data directory.
pub const SQLITE_FILE: &str = "memory.db";
/// Directory holding the flat-file collections inside the data directory.
pub const JSON_DIR: &str = "memory";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Sqlite,
    Json,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Json => "json",
        }
    }
}

/// Candidate half of a [`DecisionRecord`].
#[derive(Debug, Clone)]
pub enum CandidateWrite {
    /// A new candidate; fails with [`StoreError::Duplicate`] if the id is taken.
    Insert(EvolutionCandidate),
    /// An existing candidate; fails with [`StoreError::NotFound`] if the id is unknown.
    Update(EvolutionCandidate),
}

impl CandidateWrite {
    pub fn candidate(&self) -> &EvolutionCandidate {
        match self {
            Self::Insert(candidate) | Self::Update(candidate) => candidate,
        }
    }
}

/// Everything a single evolution decision persists.
///
/// Applied with [`MemoryStore::record_decision`]: either every write lands or none
/// does, so a candidate can never be left in a decided status without its log entry
/// or its draft.
#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub candidate: CandidateWrite,
    /// New draft staged for the candidate.
    pub draft: Option<DraftEntry>,
    /// Existing drafts resolved by the same decision. Each must exist.
    pub resolved_drafts: Vec<DraftEntry>,
    pub entry: EvolutionLogEntry,
}

impl DecisionRecord {
    pub fn new(candidate: CandidateWrite, entry: EvolutionLogEntry) -> Self {
        Self {
            candidate,
            draft: None,
            resolved_drafts: Vec::new(),
            entry,
        }
    }
}

/// Backend-agnostic storage contract.
///
/// Every write is all-or-nothing per entity. Errors raised after [`initialize`]
/// succeeded are returned to the caller as-is; retrying is the caller's decision.
///
/// [`initialize`]: MemoryStore::initialize
#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    /// Prepare the backend (schema, files). Safe to call more than once.
    async fn initialize(&self) -> Result<(), StoreError>;

    async fn schema_version(&self) -> Result<u32, StoreError>;

    // Sessions

    /// Insert or replace a session.
    async fn save_session(&self, session: &Session) -> Result<(), StoreError>;
    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError>;
    /// Most recently started first.
    async fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<Session>, StoreError>;

    // Observations

    async fn save_observation(&self, observation: &Observation) -> Result<(), StoreError>;
    /// Oldest first.
    async fn list_observations(
        &self,
        filter: &ObservationFilter,
    ) -> Result<Vec<Observation>, StoreError>;
    async fn search_observations(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError>;

    // Evolution candidates and log

    async fn save_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<(), StoreError>;
    async fn get_evolution_candidate(
        &self,
        id: &str,
    ) -> Result<Option<EvolutionCandidate>, StoreError>;
    /// Oldest first.
    async fn list_evolution_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<EvolutionCandidate>, StoreError>;
    /// Returns `false` when no candidate has that id.
    async fn update_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<bool, StoreError>;
    async fn append_evolution_log(&self, entry: &EvolutionLogEntry) -> Result<(), StoreError>;
    /// Persist a candidate decision and its draft and log writes as one unit.
    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), StoreError>;
    /// Most recent first.
    async fn list_evolution_log(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<EvolutionLogEntry>, StoreError>;

    // Drafts

    async fn save_draft(&self, draft: &DraftEntry) -> Result<(), StoreError>;
    async fn get_draft(&self, id: &str) -> Result<Option<DraftEntry>, StoreError>;
    /// Most recently created first.
    async fn list_drafts(&self, filter: &DraftFilter) -> Result<Vec<DraftEntry>, StoreError>;
    /// Returns `false` when no draft has that id.
    async fn update_draft(&self, draft: &DraftEntry) -> Result<bool, StoreError>;

    // Permanent memory

    /// Insert or replace.
    async fn save_permanent_memory(&self, memory: &PermanentMemory) -> Result<(), StoreError>;
    async fn list_permanent_memory(
        &self,
        memory_type: MemoryType,
    ) -> Result<Vec<PermanentMemory>, StoreError>;
    async fn delete_permanent_memory(&self, id: &str) -> Result<bool, StoreError>;
    async fn search_permanent_memory(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PermanentMemory>, StoreError>;

    // Derived views

    async fn session_summary(&self) -> Result<SessionSummary, StoreError> {
        let sessions = self.list_sessions(None).await?;
        let active = sessions
            .iter()
            .filter(|s| s.status() == SessionStatus::Active)
            .count();
        Ok(SessionSummary {
            total: sessions.len(),
            active,
            completed: sessions.len() - active,
            recent: sessions.into_iter().take(5).collect(),
        })
    }

    async fn evolution_status(&self) -> Result<EvolutionStatus, StoreError> {
        let candidates = self
            .list_evolution_candidates(&CandidateFilter::default())
            .await?;
        let mut status = EvolutionStatus::default();
        for candidate in &candidates {
            match candidate.status {
                CandidateStatus::Pending => status.pending += 1,
                CandidateStatus::Drafted => status.drafted += 1,
                CandidateStatus::AutoApplied => status.auto_applied += 1,
                CandidateStatus::Approved => status.approved += 1,
                CandidateStatus::Rejected => status.rejected += 1,
            }
        }
        Ok(status)
    }

    async fn pattern_stats(&self) -> Result<PatternStats, StoreError> {
        let candidates = self
            .list_evolution_candidates(&CandidateFilter::default())
            .await?;
        let mut stats = PatternStats::default();
        for candidate in candidates
            .iter()
            .filter(|c| c.candidate_type == EvolutionType::PatternBan)
        {
            stats.total_patterns += 1;
            if matches!(
                candidate.status,
                CandidateStatus::AutoApplied | CandidateStatus::Approved
            ) {
                stats.active_patterns += 1;
            }
            stats.total_detections += u64::from(candidate.session_count);
            if let Some(shadow) = &candidate.shadow {
                stats.false_positives += shadow.triggering_sessions as u64;
            }
        }
        Ok(stats)
    }
}

/// Open the configured backend rooted at `data_dir`.
///
/// With [`BackendPreference::Auto`] the indexed backend is tried first; any failure
/// while constructing or initializing it is logged and the flat-file backend is used
/// for the rest of the process. The choice is never revisited.
pub async fn open_store(
    config: &StorageConfig,
    data_dir: &Path,
) -> Result<Arc<dyn MemoryStore>, StoreError> {
    let sqlite_path = data_dir.join(SQLITE_FILE);
    let json_dir = data_dir.join(JSON_DIR);

    match config.backend {
        BackendPreference::Sqlite => Ok(Arc::new(open_sqlite(sqlite_path).await?)),
        BackendPreference::Json => Ok(Arc::new(open_json(json_dir).await?)),
        BackendPreference::Auto => match open_sqlite(sqlite_path).await {
            Ok(store) => Ok(Arc::new(store)),
            Err(e) => {
                tracing::warn!(
                    "Indexed storage unavailable ({}), falling back to flat files in {}",
                    e,
                    json_dir.display()
                );
                Ok(Arc::new(open_json(json_dir).await?))
            }
        },
    }
}

async fn open_sqlite(path: PathBuf) -> Result<SqliteStore, StoreError> {
    let store = SqliteStore::open(&path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
    store
        .initialize()
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    tracing::info!("Using indexed storage at {}", path.display());
    Ok(store)
}

async fn open_json(dir: PathBuf) -> Result<JsonStore, StoreError> {
    let store = JsonStore::new(&dir);
    store.initialize().await?;
    tracing::info!("Using flat-file storage at {}", dir.display());
    Ok(store)
}

/// Fixed-width RFC 3339 so lexical and chronological order agree.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Terms of a free-text query, empty terms dropped.
pub(crate) fn query_terms(query: &str) -> Vec<&str> {
    query.split_whitespace().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamps_sort_lexically() {
        let whole = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = whole + chrono::Duration::microseconds(1);

        let a = format_timestamp(&whole);
        let b = format_timestamp(&later);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn query_terms_skip_blank_runs() {
        assert_eq!(query_terms("  foo   bar "), vec!["foo", "bar"]);
        assert!(query_terms("   ").is_empty());
    }
}
