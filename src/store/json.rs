use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{
    query_terms, schema::CURRENT_SCHEMA_VERSION, CandidateWrite, DecisionRecord, MemoryStore,
    StoreKind,
};
use crate::error::StoreError;
use crate::models::*;

/// Flat-file backend: one JSON array per collection under a single directory.
///
/// Every write rewrites the whole collection to a temporary file and renames it into
/// place, so readers see either the old or the new document. Read-modify-write cycles
/// are serialized inside the process; there is no locking across processes, so only
/// one process should write through a given directory.
pub struct JsonStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
enum Collection {
    Sessions,
    Observations,
    Candidates,
    EvolutionLog,
    Drafts,
    PermanentMemory,
}

impl Collection {
    const ALL: [Collection; 6] = [
        Self::Sessions,
        Self::Observations,
        Self::Candidates,
        Self::EvolutionLog,
        Self::Drafts,
        Self::PermanentMemory,
    ];

    fn file_name(&self) -> &'static str {
        match self {
            Self::Sessions => "sessions.json",
            Self::Observations => "observations.json",
            Self::Candidates => "evolution_candidates.json",
            Self::EvolutionLog => "evolution_log.json",
            Self::Drafts => "drafts.json",
            Self::PermanentMemory => "permanent_memory.json",
        }
    }
}

/// New and previous content of one collection in a multi-collection write.
struct StagedWrite {
    collection: Collection,
    content: String,
    previous: String,
}

/// Entities addressable by id inside a collection.
trait Keyed {
    fn key(&self) -> &str;
}

macro_rules! keyed {
    ($($ty:ty),*) => {
        $(impl Keyed for $ty {
            fn key(&self) -> &str {
                &self.id
            }
        })*
    };
}

keyed!(
    Session,
    Observation,
    EvolutionCandidate,
    EvolutionLogEntry,
    DraftEntry,
    PermanentMemory
);

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, collection: Collection) -> PathBuf {
        self.dir.join(collection.file_name())
    }

    async fn load<T: DeserializeOwned>(&self, collection: Collection) -> Result<Vec<T>, StoreError> {
        let path = self.path(collection);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| StoreError::parse(collection.file_name(), e))
    }

    async fn persist<T: Serialize>(
        &self,
        collection: Collection,
        items: &[T],
    ) -> Result<(), StoreError> {
        let content = encode(collection, items)?;
        self.write_file(collection, &content).await
    }

    /// Replace a collection file. The temporary file is flushed to disk before the
    /// rename, so the collection is either the old or the new document after a crash.
    async fn write_file(&self, collection: Collection, content: &str) -> Result<(), StoreError> {
        let path = self.path(collection);
        let tmp = path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().await.map_err(|e| StoreError::io(&tmp, e))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    /// Write several collections in order. If one write fails, the collections
    /// already written are put back to their previous content. Caller holds the
    /// write lock.
    async fn write_together(&self, writes: &[StagedWrite]) -> Result<(), StoreError> {
        for (done, write) in writes.iter().enumerate() {
            if let Err(err) = self.write_file(write.collection, &write.content).await {
                for written in writes[..done].iter().rev() {
                    if let Err(restore) = self.write_file(written.collection, &written.previous).await {
                        tracing::error!(
                            "Failed to restore {} after a partial write: {}",
                            written.collection.file_name(),
                            restore
                        );
                    }
                }
                return Err(err);
            }
        }
        Ok(())
    }

    async fn find<T: DeserializeOwned + Keyed>(
        &self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<T>, StoreError> {
        let items: Vec<T> = self.load(collection).await?;
        Ok(items.into_iter().find(|item| item.key() == id))
    }

    async fn contains(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        // Decode as loose JSON so the check does not depend on the entity type.
        let items: Vec<serde_json::Value> = self.load(collection).await?;
        Ok(items
            .iter()
            .any(|item| item.get("id").and_then(|v| v.as_str()) == Some(id)))
    }

    /// Append a write-once entity. Caller holds the write lock.
    async fn insert<T>(
        &self,
        collection: Collection,
        entity: &'static str,
        item: &T,
    ) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Keyed + Clone,
    {
        let mut items: Vec<T> = self.load(collection).await?;
        if items.iter().any(|existing| existing.key() == item.key()) {
            return Err(StoreError::Duplicate {
                entity,
                id: item.key().to_string(),
            });
        }
        items.push(item.clone());
        self.persist(collection, &items).await
    }

    /// Replace an existing entity. Caller holds the write lock.
    async fn replace<T>(&self, collection: Collection, item: &T) -> Result<bool, StoreError>
    where
        T: Serialize + DeserializeOwned + Keyed + Clone,
    {
        let mut items: Vec<T> = self.load(collection).await?;
        let Some(slot) = items.iter_mut().find(|existing| existing.key() == item.key()) else {
            return Ok(false);
        };
        *slot = item.clone();
        self.persist(collection, &items).await?;
        Ok(true)
    }

    /// Insert or replace. Caller holds the write lock.
    async fn upsert<T>(&self, collection: Collection, item: &T) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Keyed + Clone,
    {
        let mut items: Vec<T> = self.load(collection).await?;
        match items.iter_mut().find(|existing| existing.key() == item.key()) {
            Some(slot) => *slot = item.clone(),
            None => items.push(item.clone()),
        }
        self.persist(collection, &items).await
    }

    async fn check_draft_candidate(&self, draft: &DraftEntry) -> Result<(), StoreError> {
        if let Some(candidate_id) = &draft.evolution_candidate_id {
            if !self.contains(Collection::Candidates, candidate_id).await? {
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
}

#[async_trait]
impl MemoryStore for JsonStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Json
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        for collection in Collection::ALL {
            let path = self.path(collection);
            if tokio::fs::try_exists(&path)
                .await
                .map_err(|e| StoreError::io(&path, e))?
            {
                // Fail early on a corrupt collection instead of on first use.
                self.load::<serde_json::Value>(collection).await?;
            } else {
                self.persist::<serde_json::Value>(collection, &[]).await?;
            }
        }
        Ok(())
    }

    /// Flat files carry no schema; they are always current.
    async fn schema_version(&self) -> Result<u32, StoreError> {
        Ok(CURRENT_SCHEMA_VERSION)
    }

    async fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.upsert(Collection::Sessions, session).await
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, StoreError> {
        self.find(Collection::Sessions, id).await
    }

    async fn list_sessions(&self, limit: Option<usize>) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self.load(Collection::Sessions).await?;
        sessions.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(truncate(sessions, limit))
    }

    async fn save_observation(&self, observation: &Observation) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        if !self
            .contains(Collection::Sessions, &observation.session_id)
            .await?
        {
            return Err(StoreError::MissingReference {
                entity: "observation",
                id: observation.id.clone(),
                target: "session",
                target_id: observation.session_id.clone(),
            });
        }
        self.insert(Collection::Observations, "observation", observation)
            .await
    }

    async fn list_observations(
        &self,
        filter: &ObservationFilter,
    ) -> Result<Vec<Observation>, StoreError> {
        let mut observations: Vec<Observation> = self.load(Collection::Observations).await?;
        if let Some(session_id) = &filter.session_id {
            observations.retain(|o| &o.session_id == session_id);
        }
        observations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(truncate(observations, filter.limit))
    }

    async fn search_observations(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Observation>, StoreError> {
        let terms = lowercase_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut observations: Vec<Observation> = self.load(Collection::Observations).await?;
        observations.retain(|o| {
            let mut haystack = format!("{} {}", o.title, o.narrative);
            for extra in [&o.facts, &o.concepts].into_iter().flatten() {
                haystack.push(' ');
                haystack.push_str(&extra.join(" "));
            }
            matches_all(&haystack, &terms)
        });
        observations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(truncate(observations, Some(limit)))
    }

    async fn save_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.insert(Collection::Candidates, "evolution candidate", candidate)
            .await
    }

    async fn get_evolution_candidate(
        &self,
        id: &str,
    ) -> Result<Option<EvolutionCandidate>, StoreError> {
        self.find(Collection::Candidates, id).await
    }

    async fn list_evolution_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<EvolutionCandidate>, StoreError> {
        let mut candidates: Vec<EvolutionCandidate> = self.load(Collection::Candidates).await?;
        candidates.retain(|c| {
            filter.title.as_ref().map_or(true, |t| c.title.contains(t.as_str()))
                && filter.status.map_or(true, |s| c.status == s)
        });
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(candidates)
    }

    async fn update_evolution_candidate(
        &self,
        candidate: &EvolutionCandidate,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.replace(Collection::Candidates, candidate).await
    }

    async fn append_evolution_log(&self, entry: &EvolutionLogEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.insert(Collection::EvolutionLog, "evolution log entry", entry)
            .await
    }

    async fn record_decision(&self, record: &DecisionRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let mut candidates: Vec<EvolutionCandidate> = self.load(Collection::Candidates).await?;
        let mut drafts: Vec<DraftEntry> = self.load(Collection::Drafts).await?;
        let mut log: Vec<EvolutionLogEntry> = self.load(Collection::EvolutionLog).await?;
        let previous = [
            encode(Collection::Candidates, &candidates)?,
            encode(Collection::Drafts, &drafts)?,
            encode(Collection::EvolutionLog, &log)?,
        ];

        // Apply in memory with the same checks, in the same order, as the indexed
        // backend. Nothing touches disk until every check has passed.
        match &record.candidate {
            CandidateWrite::Insert(candidate) => {
                if candidates.iter().any(|c| c.id == candidate.id) {
                    return Err(StoreError::Duplicate {
                        entity: "evolution candidate",
                        id: candidate.id.clone(),
                    });
                }
                candidates.push(candidate.clone());
            }
            CandidateWrite::Update(candidate) => {
                let Some(slot) = candidates.iter_mut().find(|c| c.id == candidate.id) else {
                    return Err(StoreError::NotFound {
                        entity: "evolution candidate",
                        id: candidate.id.clone(),
                    });
                };
                *slot = candidate.clone();
            }
        }

        let linked = |draft: &DraftEntry| -> Result<(), StoreError> {
            match &draft.evolution_candidate_id {
                Some(candidate_id) if !candidates.iter().any(|c| &c.id == candidate_id) => {
                    Err(StoreError::MissingReference {
                        entity: "draft",
                        id: draft.id.clone(),
                        target: "evolution candidate",
                        target_id: candidate_id.clone(),
                    })
                }
                _ => Ok(()),
            }
        };
        if let Some(draft) = &record.draft {
            linked(draft)?;
            if drafts.iter().any(|d| d.id == draft.id) {
                return Err(StoreError::Duplicate {
                    entity: "draft",
                    id: draft.id.clone(),
                });
            }
            drafts.push(draft.clone());
        }
        for draft in &record.resolved_drafts {
            linked(draft)?;
            let Some(slot) = drafts.iter_mut().find(|d| d.id == draft.id) else {
                return Err(StoreError::NotFound {
                    entity: "draft",
                    id: draft.id.clone(),
                });
            };
            *slot = draft.clone();
        }

        if log.iter().any(|e| e.id == record.entry.id) {
            return Err(StoreError::Duplicate {
                entity: "evolution log entry",
                id: record.entry.id.clone(),
            });
        }
        log.push(record.entry.clone());

        let [previous_candidates, previous_drafts, previous_log] = previous;
        let mut writes = vec![StagedWrite {
            collection: Collection::Candidates,
            content: encode(Collection::Candidates, &candidates)?,
            previous: previous_candidates,
        }];
        if record.draft.is_some() || !record.resolved_drafts.is_empty() {
            writes.push(StagedWrite {
                collection: Collection::Drafts,
                content: encode(Collection::Drafts, &drafts)?,
                previous: previous_drafts,
            });
        }
        writes.push(StagedWrite {
            collection: Collection::EvolutionLog,
            content: encode(Collection::EvolutionLog, &log)?,
            previous: previous_log,
        });
        self.write_together(&writes).await
    }

    async fn list_evolution_log(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<EvolutionLogEntry>, StoreError> {
        let mut entries: Vec<EvolutionLogEntry> = self.load(Collection::EvolutionLog).await?;
        // Newest appended first, then a stable sort keeps that order among equal timestamps.
        entries.reverse();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(truncate(entries, limit))
    }

    async fn save_draft(&self, draft: &DraftEntry) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.check_draft_candidate(draft).await?;
        self.insert(Collection::Drafts, "draft", draft).await
    }

    async fn get_draft(&self, id: &str) -> Result<Option<DraftEntry>, StoreError> {
        self.find(Collection::Drafts, id).await
    }

    async fn list_drafts(&self, filter: &DraftFilter) -> Result<Vec<DraftEntry>, StoreError> {
        let mut drafts: Vec<DraftEntry> = self.load(Collection::Drafts).await?;
        drafts.retain(|d| {
            filter.category.map_or(true, |c| d.category == c)
                && filter.status.map_or(true, |s| d.status == s)
                && filter
                    .evolution_candidate_id
                    .as_ref()
                    .map_or(true, |id| d.evolution_candidate_id.as_ref() == Some(id))
        });
        drafts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(truncate(drafts, Some(filter.limit)))
    }

    async fn update_draft(&self, draft: &DraftEntry) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.check_draft_candidate(draft).await?;
        self.replace(Collection::Drafts, draft).await
    }

    async fn save_permanent_memory(&self, memory: &PermanentMemory) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let existing: Option<PermanentMemory> =
            self.find(Collection::PermanentMemory, &memory.id).await?;
        // An upsert keeps the original creation time, as the indexed backend does.
        let mut memory = memory.clone();
        if let Some(existing) = existing {
            memory.created_at = existing.created_at;
        }
        self.upsert(Collection::PermanentMemory, &memory).await
    }

    async fn list_permanent_memory(
        &self,
        memory_type: MemoryType,
    ) -> Result<Vec<PermanentMemory>, StoreError> {
        let mut memories: Vec<PermanentMemory> = self.load(Collection::PermanentMemory).await?;
        memories.retain(|m| m.memory_type == memory_type);
        memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(memories)
    }

    async fn delete_permanent_memory(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut memories: Vec<PermanentMemory> = self.load(Collection::PermanentMemory).await?;
        let before = memories.len();
        memories.retain(|m| m.id != id);
        if memories.len() == before {
            return Ok(false);
        }
        self.persist(Collection::PermanentMemory, &memories).await?;
        Ok(true)
    }

    async fn search_permanent_memory(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PermanentMemory>, StoreError> {
        let terms = lowercase_terms(query);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut memories: Vec<PermanentMemory> = self.load(Collection::PermanentMemory).await?;
        memories.retain(|m| matches_all(&format!("{} {}", m.title, m.content), &terms));
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(truncate(memories, Some(limit)))
    }
}

fn encode<T: Serialize>(collection: Collection, items: &[T]) -> Result<String, StoreError> {
    serde_json::to_string_pretty(items).map_err(|e| StoreError::parse(collection.file_name(), e))
}

fn truncate<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        items.truncate(limit);
    }
    items
}

fn lowercase_terms(query: &str) -> Vec<String> {
    query_terms(query)
        .into_iter()
        .map(|t| t.to_lowercase())
        .collect()
}

fn matches_all(haystack: &str, terms: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    terms.iter().all(|t| haystack.contains(t.as_str()))
}
