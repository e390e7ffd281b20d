//! Human review of staged content.
//!
//! [`DraftManager`] owns the one-shot draft lifecycle. Pending drafts can be edited
//! until they are resolved. Approving writes the content into the project tree, and
//! either resolution cascades to a linked evolution candidate. The cascade is best
//! effort: its failures are reported in [`DraftResolution::cascade_warning`] and never
//! fail the draft operation itself.

mod layout;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

pub use layout::{category_dir_name, ContentIndex, ContentLayout, IndexedFile, ProjectLayout};

use crate::error::{MemoryError, StoreError};
use crate::models::*;
use crate::store::{CandidateWrite, DecisionRecord, MemoryStore};

/// Outcome of approving or rejecting a draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftResolution {
    pub draft: DraftEntry,
    /// Where the content was written. Only set on approval.
    pub written_path: Option<PathBuf>,
    /// Why the linked candidate could not be updated, if it could not.
    pub cascade_warning: Option<String>,
}

pub struct DraftManager {
    store: Arc<dyn MemoryStore>,
    layout: Arc<dyn ContentLayout>,
    index: ContentIndex,
    // Held for the whole read-check-write of a resolution.
    resolve_lock: Mutex<()>,
}

impl DraftManager {
    pub fn new(store: Arc<dyn MemoryStore>, layout: Arc<dyn ContentLayout>) -> Self {
        Self {
            store,
            index: ContentIndex::new(Arc::clone(&layout)),
            layout,
            resolve_lock: Mutex::new(()),
        }
    }

    /// Files already present in the content tree.
    pub fn index(&self) -> &ContentIndex {
        &self.index
    }

    pub async fn create(&self, input: CreateDraftInput) -> Result<DraftEntry, MemoryError> {
        if let Some(candidate_id) = &input.evolution_candidate_id {
            if self.store.get_evolution_candidate(candidate_id).await?.is_none() {
                return Err(MemoryError::NotFound {
                    entity: "evolution candidate",
                    id: candidate_id.clone(),
                });
            }
        }

        let draft = DraftEntry::new(input);
        self.store.save_draft(&draft).await?;
        tracing::info!(
            "Created {} draft {} ({:?})",
            draft.category.as_str(),
            draft.id,
            draft.title
        );
        Ok(draft)
    }

    pub async fn list(&self, filter: &DraftFilter) -> Result<Vec<DraftEntry>, MemoryError> {
        Ok(self.store.list_drafts(filter).await?)
    }

    pub async fn get(&self, id: &str) -> Result<DraftEntry, MemoryError> {
        self.store
            .get_draft(id)
            .await?
            .ok_or_else(|| MemoryError::NotFound {
                entity: "draft",
                id: id.to_string(),
            })
    }

    /// Write the draft's content into the project tree and mark it approved.
    ///
    /// `target` overrides the path derived from the draft's category and filename.
    pub async fn approve(
        &self,
        id: &str,
        target: Option<&Path>,
    ) -> Result<DraftResolution, MemoryError> {
        let _guard = self.resolve_lock.lock().await;

        let mut draft = self.pending(id).await?;
        if draft.content.trim().is_empty() {
            return Err(MemoryError::EmptyContent(draft.id));
        }

        let path = match target {
            Some(path) => path.to_path_buf(),
            None => self.default_target(&draft),
        };
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tracing::warn!("Overwriting existing content at {}", path.display());
        }
        write_content(&path, &draft.content).await?;
        self.index.invalidate();

        let now = Utc::now();
        draft.status = DraftStatus::Approved;
        draft.approved_at = Some(now);
        draft.updated_at = now;
        self.write_back(&draft).await?;
        tracing::info!("Approved draft {} into {}", draft.id, path.display());

        let cascade_warning = self
            .cascade(&draft, CandidateStatus::Approved, EvolutionAction::Approved, None)
            .await;

        Ok(DraftResolution {
            draft,
            written_path: Some(path),
            cascade_warning,
        })
    }

    /// Edit a draft before it is resolved.
    pub async fn update(
        &self,
        id: &str,
        input: UpdateDraftInput,
    ) -> Result<DraftEntry, MemoryError> {
        let _guard = self.resolve_lock.lock().await;

        let mut draft = self.pending(id).await?;
        if input.is_empty() {
            return Ok(draft);
        }
        if let Some(title) = input.title {
            draft.title = title;
        }
        if let Some(content) = input.content {
            draft.content = content;
        }
        if let Some(category) = input.category {
            draft.category = category;
        }
        if let Some(confidence) = input.confidence {
            draft.confidence = confidence;
        }
        if let Some(filename) = input.filename {
            draft.filename = filename;
        }
        draft.updated_at = Utc::now();
        self.write_back(&draft).await?;

        tracing::info!("Updated draft {} ({:?})", draft.id, draft.title);
        Ok(draft)
    }

    /// Mark the draft rejected. Nothing is written to the project tree.
    pub async fn reject(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<DraftResolution, MemoryError> {
        let _guard = self.resolve_lock.lock().await;

        let mut draft = self.pending(id).await?;
        draft.status = DraftStatus::Rejected;
        draft.rejected_reason = reason;
        draft.updated_at = Utc::now();
        self.write_back(&draft).await?;
        tracing::info!("Rejected draft {}", draft.id);

        let reason = draft.rejected_reason.clone();
        let cascade_warning = self
            .cascade(&draft, CandidateStatus::Rejected, EvolutionAction::Rejected, reason)
            .await;

        Ok(DraftResolution {
            draft,
            written_path: None,
            cascade_warning,
        })
    }

    async fn pending(&self, id: &str) -> Result<DraftEntry, MemoryError> {
        let draft = self.get(id).await?;
        if draft.status != DraftStatus::Pending {
            return Err(MemoryError::InvalidState {
                entity: "draft",
                id: draft.id,
                status: draft.status.as_str().to_string(),
                expected: "pending",
            });
        }
        Ok(draft)
    }

    async fn write_back(&self, draft: &DraftEntry) -> Result<(), MemoryError> {
        if !self.store.update_draft(draft).await? {
            return Err(MemoryError::NotFound {
                entity: "draft",
                id: draft.id.clone(),
            });
        }
        Ok(())
    }

    fn default_target(&self, draft: &DraftEntry) -> PathBuf {
        let file_name = Path::new(&draft.filename)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("{}.md", slugify(&draft.title))));
        self.layout.category_dir(draft.category).join(file_name)
    }

    /// Returns a warning instead of failing; the draft is already resolved.
    async fn cascade(
        &self,
        draft: &DraftEntry,
        status: CandidateStatus,
        action: EvolutionAction,
        reason: Option<String>,
    ) -> Option<String> {
        let candidate_id = draft.evolution_candidate_id.as_deref()?;
        let warning = self
            .try_cascade(candidate_id, status, action, reason)
            .await
            .err()?;
        tracing::warn!("Draft {}: {}", draft.id, warning);
        Some(warning)
    }

    async fn try_cascade(
        &self,
        candidate_id: &str,
        status: CandidateStatus,
        action: EvolutionAction,
        reason: Option<String>,
    ) -> Result<(), String> {
        let mut candidate = match self.store.get_evolution_candidate(candidate_id).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return Err(format!("evolution candidate {candidate_id} not found")),
            Err(e) => return Err(format!("failed to load evolution candidate {candidate_id}: {e}")),
        };
        if candidate.status.is_terminal() {
            return Err(format!(
                "evolution candidate {candidate_id} is already {}",
                candidate.status.as_str()
            ));
        }

        candidate.status = status;
        candidate.updated_at = Utc::now();
        let entry = EvolutionLogEntry::record(&candidate, action, reason);
        let record = DecisionRecord::new(CandidateWrite::Update(candidate), entry);
        match self.store.record_decision(&record).await {
            Ok(()) => {}
            Err(StoreError::NotFound { .. }) => {
                return Err(format!("evolution candidate {candidate_id} not found"))
            }
            Err(e) => {
                return Err(format!(
                    "failed to record {} of evolution candidate {candidate_id}: {e}",
                    action.as_str()
                ))
            }
        }

        tracing::info!(
            "Evolution candidate {} marked {}",
            candidate_id,
            status.as_str()
        );
        Ok(())
    }
}

async fn write_content(path: &Path, content: &str) -> Result<(), MemoryError> {
    let write_err = |source: std::io::Error| MemoryError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    tokio::fs::write(path, content).await.map_err(write_err)
}

/// Draft staged for a candidate that passed the gate below the auto-apply bar.
pub fn candidate_draft(candidate: &EvolutionCandidate) -> CreateDraftInput {
    let category = match candidate.candidate_type {
        EvolutionType::PatternBan | EvolutionType::NewConvention | EvolutionType::RuleElevation => {
            DraftCategory::Rule
        }
        EvolutionType::SkillCombo => DraftCategory::Skill,
        EvolutionType::WorkflowOptimization => DraftCategory::Workflow,
    };

    CreateDraftInput {
        category,
        title: candidate.title.clone(),
        filename: format!("{}.md", slugify(&candidate.title)),
        content: render_candidate(candidate),
        confidence: candidate.confidence,
        source: DraftSource::Evolution,
        evolution_candidate_id: Some(candidate.id.clone()),
    }
}

fn render_candidate(candidate: &EvolutionCandidate) -> String {
    let mut out = format!("# {}\n\n", candidate.title);
    if !candidate.description.trim().is_empty() {
        let _ = write!(out, "{}\n\n", candidate.description.trim());
    }
    if let Some(action) = candidate.suggested_action.as_deref().filter(|a| !a.trim().is_empty()) {
        let _ = write!(out, "## Suggested action\n\n{}\n\n", action.trim());
    }

    let _ = write!(
        out,
        "---\n\nEvolution candidate `{}` ({}), confidence {}, seen in {} sessions.\n",
        candidate.id,
        candidate.candidate_type.as_str(),
        candidate.confidence,
        candidate.session_count
    );
    if let Some(shadow) = &candidate.shadow {
        let _ = writeln!(
            out,
            "Shadow test: {}/{} sessions triggered (false positive rate {:.2}).",
            shadow.triggering_sessions, shadow.sample_size, shadow.false_positive_rate
        );
    }
    out
}

/// Lowercase ASCII slug; runs of anything else collapse to a single `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("draft");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_collapse_punctuation() {
        assert_eq!(slugify(r#"Ban "as any" casts!"#), "ban-as-any-casts");
        assert_eq!(slugify("  Prefer   Result<T> "), "prefer-result-t");
        assert_eq!(slugify("“”"), "draft");
    }

    #[test]
    fn candidate_drafts_map_type_to_category() {
        let mut candidate =
            EvolutionCandidate::new(EvolutionType::WorkflowOptimization, r#"Run "cargo fmt" first"#, 75.0);
        candidate.suggested_action = Some("Format before committing.".into());
        candidate.shadow = Some(ShadowTestResult {
            false_positive_rate: 0.04,
            sample_size: 25,
            triggering_sessions: 1,
        });

        let input = candidate_draft(&candidate);
        assert_eq!(input.category, DraftCategory::Workflow);
        assert_eq!(input.filename, "run-cargo-fmt-first.md");
        assert_eq!(input.source, DraftSource::Evolution);
        assert_eq!(input.evolution_candidate_id.as_deref(), Some(candidate.id.as_str()));
        assert!(input.content.starts_with("# Run \"cargo fmt\" first"));
        assert!(input.content.contains("## Suggested action"));
        assert!(input.content.contains("1/25 sessions"));
    }

    #[test]
    fn rule_types_share_a_category() {
        for ty in [
            EvolutionType::PatternBan,
            EvolutionType::NewConvention,
            EvolutionType::RuleElevation,
        ] {
            let candidate = EvolutionCandidate::new(ty, "x", 80.0);
            assert_eq!(candidate_draft(&candidate).category, DraftCategory::Rule);
        }
    }
}
