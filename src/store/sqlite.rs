use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{
    format_timestamp, query_terms, schema, CandidateWrite, DecisionRecord, MemoryStore, StoreKind,
};
use crate::error::StoreError;
use crate::models::*;

/// Indexed relational backend on a single SQLite connection.
///
/// Writers are serialized through the connection mutex inside the process, and by
/// SQLite's WAL journal plus busy timeout across processes.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::Unavailable("database path has no parent directory".to_string())
        })?;
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn)
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Sqlite
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        schema::run_migrations(&conn)?;
        Ok(())
    }

    async fn schema_version(&self) -> Result<u32, StoreError> {
        let conn = self.conn.lock().await;
        Ok(schema::read_version(&conn)?.unwrap_or(0))
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        upsert_session(&conn, session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"),
            [id],
            session_from_row,
        )
        .optional()
        .map_err(decode_error("session"))
    }

    async fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<Session>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC, id LIMIT ?"
        ))?;
        let sessions = stmt
            .query_map([sql_limit(limit)], session_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error("session"))?;
        Ok(sessions)
    }

    async fn save_observation(&self, observation: &Observation) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_observation(&conn, observation)
    }

    async fn list_observations(
        &self,
        filter: &ObservationFilter,
    ) -> Result<Vec<Observation>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations o
             WHERE (?1 IS NULL OR o.session_id = ?1)
             ORDER BY o.created_at, o.id LIMIT ?2"
        ))?;
        let observations = stmt
            .query_map(
                params![filter.session_id, sql_limit(filter.limit)],
                observation_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error("observation"))?;
        Ok(observations)
    }

    async fn search_observations(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM observations_fts
             JOIN observations o ON o.rowid = observations_fts.rowid
             WHERE observations_fts MATCH ?1
             ORDER BY rank LIMIT ?2"
        ))?;
        let observations = stmt
            .query_map(params![fts_query, sql_limit(Some(limit))], observation_from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error("observation"))?;
        Ok(observations)
    }

    async fn save_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_candidate(&conn, candidate)
    }

    async fn get_evolution_candidate(
        &self,
        id: &str,
    ) -> Result<Option<EvolutionCandidate>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {CANDIDATE_COLUMNS} FROM evolution_candidates WHERE id = ?"),
            [id],
            candidate_from_row,
        )
        .optional()
        .map_err(decode_error("evolution candidate"))
    }

    async fn list_evolution_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<EvolutionCandidate>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM evolution_candidates
             WHERE (?1 IS NULL OR instr(title, ?1) > 0)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at, id"
        ))?;
        let candidates = stmt
            .query_map(
                params![filter.title, filter.status.map(|s| s.as_str())],
                candidate_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()
            .map_err(decode_error("evolution candidate"))?;
        Ok(candidates)
    }

    async fn update_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        update_candidate(&conn, candidate)
    }

    async fn append_evolution_log(&self, entry: &EvolutionLogEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_log_entry(&conn, entry)
    }

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        // Dropping the transaction on an early return rolls every write back.
        let tx = conn.transaction()?;

        match &record.candidate {
            CandidateWrite::Insert(candidate) => insert_candidate(&tx, candidate)?,
            CandidateWrite::Update(candidate) => {
                if !update_candidate(&tx, candidate)? {
                    return Err(StoreError::NotFound {
                        entity: "evolution candidate",
                        id: candidate.id.clone(),
                    });
                }
            }
        }
        if let Some(draft) = &record.draft {
            insert_draft(&tx, draft)?;
        }
        for draft in &record.resolved_drafts {
            if !update_draft_row(&tx, draft)? {
                return Err(StoreError::NotFound {
                    entity: "draft",
                    id: draft.id.clone(),
                });
            }
        }
        insert_log_entry(&tx, &record.entry)?;

        tx.commit()?;
        Ok(())
    }

    async fn list_evolution_log(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<EvolutionLogEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, candidate_id, action, title, confidence, reason, created_at
             FROM evolution_log ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )?;
        let entries = stmt
            .query_map([sql_limit(limit)], |row| {
                Ok(EvolutionLogEntry {
                    id: row.get(0)?,
                    candidate_id: row.get(1)?,
                    action: enum_column(row, 2, EvolutionAction::from_str)?,
                    title: row.get(3)?,
                    confidence: row.get(4)?,
                    reason: row.get(5)?,
                    created_at: timestamp(row, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    async fn save_draft(&self, draft: &DraftEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        insert_draft(&conn, draft)
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let draft = conn
            .query_row(
                &format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?"),
                [id],
                draft_from_row,
            )
            .optional()?;
        Ok(draft)
    }

    async fn list_drafts(&self, filter: &DraftFilter) -> Result<Vec<DraftEntry>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DRAFT_COLUMNS} FROM drafts
             WHERE (?1 IS NULL OR category = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR evolution_candidate_id = ?3)
             ORDER BY created_at DESC, id LIMIT ?4"
        ))?;
        let drafts = stmt
            .query_map(
                params![
                    filter.category.map(|c| c.as_str()),
                    filter.status.map(|s| s.as_str()),
                    filter.evolution_candidate_id,
                    sql_limit(Some(filter.limit)),
                ],
                draft_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(drafts)
    }

    async fn update_draft(&self, draft: &DraftEntry) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        update_draft_row(&conn, draft)
    }

    async fn save_permanent_memory(&self, memory: &PermanentMemory) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO permanent_memory (id, memory_type, title, content, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                memory_type = excluded.memory_type,
                title = excluded.title,
                content = excluded.content,
                updated_at = excluded.updated_at",
            params![
                memory.id,
                memory.memory_type.as_str(),
                memory.title,
                memory.content,
                format_timestamp(&memory.created_at),
                format_timestamp(&memory.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn list_permanent_memory(
        &self,
        memory_type: MemoryType,
    ) -> Result<Vec<PermanentMemory>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM permanent_memory m
             WHERE m.memory_type = ? ORDER BY m.created_at, m.id"
        ))?;
        let memories = stmt
            .query_map([memory_type.as_str()], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    async fn delete_permanent_memory(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM permanent_memory WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    async fn search_permanent_memory(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PermanentMemory>, StoreError> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM permanent_memory_fts
             JOIN permanent_memory m ON m.rowid = permanent_memory_fts.rowid
             WHERE permanent_memory_fts MATCH ?1
             ORDER BY rank LIMIT ?2"
        ))?;
        let memories = stmt
            .query_map(params![fts_query, sql_limit(Some(limit))], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }
}

// ============================================================
// Sessions
// ============================================================

const SESSION_COLUMNS: &str = "id, branch, started_at, ended_at, data";

/// Everything about a session that lives in the `data` JSON column.
#[derive(Serialize, Deserialize)]
struct SessionData {
    #[serde(default)]
    classification: SessionClassification,
    #[serde(default)]
    outcome: Option<SessionOutcome>,
    #[serde(default)]
    decisions: Vec<String>,
    #[serde(default)]
    tools_used: Vec<String>,
    #[serde(default)]
    files_touched: Vec<String>,
}

fn upsert_session(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let data = SessionData {
        classification: session.classification.clone(),
        outcome: session.outcome.clone(),
        decisions: session.decisions.clone(),
        tools_used: session.tools_used.clone(),
        files_touched: session.files_touched.clone(),
    };
    let data_json =
        serde_json::to_string(&data).map_err(|e| StoreError::parse("session data", e))?;

    conn.execute(
        "INSERT INTO sessions (id, branch, started_at, ended_at, status, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(id) DO UPDATE SET
            branch = excluded.branch,
            started_at = excluded.started_at,
            ended_at = excluded.ended_at,
            status = excluded.status,
            data = excluded.data",
        params![
            session.id,
            session.branch,
            format_timestamp(&session.started_at),
            session.ended_at.as_ref().map(format_timestamp),
            session.status().as_str(),
            data_json,
        ],
    )?;
    Ok(())
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let data: SessionData = json_column(row, 4)?;
    Ok(Session {
        id: row.get(0)?,
        branch: row.get(1)?,
        started_at: timestamp(row, 2)?,
        ended_at: optional_timestamp(row, 3)?,
        classification: data.classification,
        outcome: data.outcome,
        decisions: data.decisions,
        tools_used: data.tools_used,
        files_touched: data.files_touched,
    })
}

// ============================================================
// Observations
// ============================================================

const OBSERVATION_COLUMNS: &str =
    "o.id, o.session_id, o.type, o.title, o.narrative, o.facts, o.concepts, o.created_at";

fn insert_observation(conn: &Connection, observation: &Observation) -> Result<(), StoreError> {
    if !exists(conn, "sessions", &observation.session_id)? {
        return Err(StoreError::MissingReference {
            entity: "observation",
            id: observation.id.clone(),
            target: "session",
            target_id: observation.session_id.clone(),
        });
    }
    if exists(conn, "observations", &observation.id)? {
        return Err(StoreError::Duplicate {
            entity: "observation",
            id: observation.id.clone(),
        });
    }

    conn.execute(
        "INSERT INTO observations (id, session_id, type, title, narrative, facts, concepts, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            observation.id,
            observation.session_id,
            observation.observation_type,
            observation.title,
            observation.narrative,
            to_optional_json(&observation.facts, "observation facts")?,
            to_optional_json(&observation.concepts, "observation concepts")?,
            format_timestamp(&observation.created_at),
        ],
    )?;
    Ok(())
}

fn observation_from_row(row: &Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        observation_type: row.get(2)?,
        title: row.get(3)?,
        narrative: row.get(4)?,
        facts: optional_json_column(row, 5)?,
        concepts: optional_json_column(row, 6)?,
        created_at: timestamp(row, 7)?,
    })
}

// ============================================================
// Evolution candidates
// ============================================================

const CANDIDATE_COLUMNS: &str = "id, type, title, description, confidence, session_count, \
     evidence, discovery_tokens, suggested_action, status, shadow_tested, false_positive_rate, \
     sample_size, triggering_sessions, created_at, updated_at";

fn insert_candidate(conn: &Connection, candidate: &EvolutionCandidate) -> Result<(), StoreError> {
    if exists(conn, "evolution_candidates", &candidate.id)? {
        return Err(StoreError::Duplicate {
            entity: "evolution candidate",
            id: candidate.id.clone(),
        });
    }

    let shadow = candidate.shadow.as_ref();
    conn.execute(
        &format!(
            "INSERT INTO evolution_candidates ({CANDIDATE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
        ),
        params![
            candidate.id,
            candidate.candidate_type.as_str(),
            candidate.title,
            candidate.description,
            candidate.confidence,
            candidate.session_count,
            to_json(&candidate.evidence, "candidate evidence")?,
            candidate.discovery_tokens as i64,
            candidate.suggested_action,
            candidate.status.as_str(),
            shadow.is_some(),
            shadow.map(|s| s.false_positive_rate),
            shadow.map(|s| s.sample_size as i64),
            shadow.map(|s| s.triggering_sessions as i64),
            format_timestamp(&candidate.created_at),
            format_timestamp(&candidate.updated_at),
        ],
    )?;
    Ok(())
}

fn update_candidate(conn: &Connection, candidate: &EvolutionCandidate) -> Result<bool, StoreError> {
    let shadow = candidate.shadow.as_ref();
    let rows = conn.execute(
        "UPDATE evolution_candidates SET
            type = ?2, title = ?3, description = ?4, confidence = ?5, session_count = ?6,
            evidence = ?7, discovery_tokens = ?8, suggested_action = ?9, status = ?10,
            shadow_tested = ?11, false_positive_rate = ?12, sample_size = ?13,
            triggering_sessions = ?14, created_at = ?15, updated_at = ?16
         WHERE id = ?1",
        params![
            candidate.id,
            candidate.candidate_type.as_str(),
            candidate.title,
            candidate.description,
            candidate.confidence,
            candidate.session_count,
            to_json(&candidate.evidence, "candidate evidence")?,
            candidate.discovery_tokens as i64,
            candidate.suggested_action,
            candidate.status.as_str(),
            shadow.is_some(),
            shadow.map(|s| s.false_positive_rate),
            shadow.map(|s| s.sample_size as i64),
            shadow.map(|s| s.triggering_sessions as i64),
            format_timestamp(&candidate.created_at),
            format_timestamp(&candidate.updated_at),
        ],
    )?;
    Ok(rows > 0)
}

fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<EvolutionCandidate> {
    let shadow = match (
        row.get::<_, bool>(10)?,
        row.get::<_, Option<f64>>(11)?,
        row.get::<_, Option<i64>>(12)?,
    ) {
        (true, Some(rate), Some(sample)) => Some(ShadowTestResult {
            false_positive_rate: rate,
            sample_size: sample as usize,
            triggering_sessions: row.get::<_, Option<i64>>(13)?.unwrap_or(0) as usize,
        }),
        _ => None,
    };

    Ok(EvolutionCandidate {
        id: row.get(0)?,
        candidate_type: enum_column(row, 1, EvolutionType::from_str)?,
        title: row.get(2)?,
        description: row.get(3)?,
        confidence: row.get(4)?,
        session_count: row.get(5)?,
        evidence: json_column(row, 6)?,
        discovery_tokens: row.get::<_, i64>(7)? as u64,
        suggested_action: row.get(8)?,
        status: enum_column(row, 9, CandidateStatus::from_str)?,
        shadow,
        created_at: timestamp(row, 14)?,
        updated_at: timestamp(row, 15)?,
    })
}

// ============================================================
// Evolution log
// ============================================================

fn insert_log_entry(conn: &Connection, entry: &EvolutionLogEntry) -> Result<(), StoreError> {
    if exists(conn, "evolution_log", &entry.id)? {
        return Err(StoreError::Duplicate {
            entity: "evolution log entry",
            id: entry.id.clone(),
        });
    }
    conn.execute(
        "INSERT INTO evolution_log (id, candidate_id, action, title, confidence, reason, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        params![
            entry.id,
            entry.candidate_id,
            entry.action.as_str(),
            entry.title,
            entry.confidence,
            entry.reason,
            format_timestamp(&entry.created_at),
        ],
    )?;
    Ok(())
}

// ============================================================
// Drafts
// ============================================================

const DRAFT_COLUMNS: &str = "id, category, title, filename, content, confidence, source, \
     evolution_candidate_id, status, created_at, updated_at, approved_at, rejected_reason";

fn check_draft_candidate(conn: &Connection, draft: &DraftEntry) -> Result<(), StoreError> {
    if let Some(candidate_id) = &draft.evolution_candidate_id {
        if !exists(conn, "evolution_candidates", candidate_id)? {
            return Err(StoreError::MissingReference {
                entity: "draft",
                id: draft.id.clone(),
                target: "evolution candidate",
                target_id: candidate_id.clone(),
            });
        }
    }
    Ok(())
}

fn insert_draft(conn: &Connection, draft: &DraftEntry) -> Result<(), StoreError> {
    check_draft_candidate(conn, draft)?;
    if exists(conn, "drafts", &draft.id)? {
        return Err(StoreError::Duplicate {
            entity: "draft",
            id: draft.id.clone(),
        });
    }

    conn.execute(
        &format!(
            "INSERT INTO drafts ({DRAFT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            draft.id,
            draft.category.as_str(),
            draft.title,
            draft.filename,
            draft.content,
            draft.confidence,
            draft.source.as_str(),
            draft.evolution_candidate_id,
            draft.status.as_str(),
            format_timestamp(&draft.created_at),
            format_timestamp(&draft.updated_at),
            draft.approved_at.as_ref().map(format_timestamp),
            draft.rejected_reason,
        ],
    )?;
    Ok(())
}

fn update_draft_row(conn: &Connection, draft: &DraftEntry) -> Result<bool, StoreError> {
    check_draft_candidate(conn, draft)?;
    let rows = conn.execute(
        "UPDATE drafts SET
            category = ?2, title = ?3, filename = ?4, content = ?5, confidence = ?6,
            source = ?7, evolution_candidate_id = ?8, status = ?9, created_at = ?10,
            updated_at = ?11, approved_at = ?12, rejected_reason = ?13
         WHERE id = ?1",
        params![
            draft.id,
            draft.category.as_str(),
            draft.title,
            draft.filename,
            draft.content,
            draft.confidence,
            draft.source.as_str(),
            draft.evolution_candidate_id,
            draft.status.as_str(),
            format_timestamp(&draft.created_at),
            format_timestamp(&draft.updated_at),
            draft.approved_at.as_ref().map(format_timestamp),
            draft.rejected_reason,
        ],
    )?;
    Ok(rows > 0)
}

fn draft_from_row(row: &Row<'_>) -> rusqlite::Result<DraftEntry> {
    Ok(DraftEntry {
        id: row.get(0)?,
        category: enum_column(row, 1, DraftCategory::from_str)?,
        title: row.get(2)?,
        filename: row.get(3)?,
        content: row.get(4)?,
        confidence: row.get(5)?,
        source: enum_column(row, 6, DraftSource::from_str)?,
        evolution_candidate_id: row.get(7)?,
        status: enum_column(row, 8, DraftStatus::from_str)?,
        created_at: timestamp(row, 9)?,
        updated_at: timestamp(row, 10)?,
        approved_at: optional_timestamp(row, 11)?,
        rejected_reason: row.get(12)?,
    })
}

// ============================================================
// Permanent memory
// ============================================================

const MEMORY_COLUMNS: &str = "m.id, m.memory_type, m.title, m.content, m.created_at, m.updated_at";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<PermanentMemory> {
    Ok(PermanentMemory {
        id: row.get(0)?,
        memory_type: enum_column(row, 1, MemoryType::from_str)?,
        title: row.get(2)?,
        content: row.get(3)?,
        created_at: timestamp(row, 4)?,
        updated_at: timestamp(row, 5)?,
    })
}

// ============================================================
// Helpers
// ============================================================

#[derive(Debug, thiserror::Error)]
#[error("unrecognized value '{0}'")]
struct UnknownValue(String);

/// `table` is always one of this module's own table names.
fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, StoreError> {
    let found = conn
        .query_row(&format!("SELECT 1 FROM {table} WHERE id = ?"), [id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// SQLite treats a negative limit as "no limit".
fn sql_limit(limit: Option<usize>) -> i64 {
    limit.and_then(|l| i64::try_from(l).ok()).unwrap_or(-1)
}

/// Quote every term so user input can never be read as FTS5 query syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms = query_terms(query);
    if terms.is_empty() {
        return None;
    }
    Some(
        terms
            .iter()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" "),
    )
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::parse(what, e))
}

fn to_optional_json<T: Serialize>(
    value: &Option<T>,
    what: &str,
) -> Result<Option<String>, StoreError> {
    value.as_ref().map(|v| to_json(v, what)).transpose()
}

fn conversion_failure(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_failure(idx, e))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conversion_failure(idx, e)),
        None => Ok(None),
    }
}

fn enum_column<T>(row: &Row<'_>, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_failure(idx, UnknownValue(raw)))
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_failure(idx, e))
}

fn optional_json_column<T: DeserializeOwned>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<T>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| conversion_failure(idx, e)),
        None => Ok(None),
    }
}

/// Surface malformed JSON payloads as [`StoreError::Parse`] rather than a driver error.
fn decode_error(what: &'static str) -> impl Fn(rusqlite::Error) -> StoreError {
    move |err| match err {
        rusqlite::Error::FromSqlConversionFailure(idx, ty, source) => {
            match source.downcast::<serde_json::Error>() {
                Ok(json) => StoreError::parse(what, *json),
                Err(other) => {
                    StoreError::Sqlite(rusqlite::Error::FromSqlConversionFailure(idx, ty, other))
                }
            }
        }
        other => StoreError::Sqlite(other),
    }
}
