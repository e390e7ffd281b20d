//! Promotion pipeline integration tests.
//!
//! Tests are organized into four sections:
//! - New candidates: gate and threshold routing
//! - Merges: submissions matching an existing candidate, including concurrent ones
//! - Review: direct human approval or rejection of a candidate
//! - Sampling: what the shadow test looks at

use std::sync::Arc;

use aidd_memory::error::MemoryError;
use aidd_memory::evolution::{PromotionAction, PromotionThresholds, Promoter};
use aidd_memory::models::*;
use aidd_memory::store::{JsonStore, MemoryStore, SqliteStore};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use tempfile::TempDir;

const TRIGGER: &str = "as any";

/// Helper to create an initialized in-memory store.
async fn setup() -> Arc<dyn MemoryStore> {
    let store = SqliteStore::open_memory().expect("Failed to open database");
    store.initialize().await.expect("Failed to migrate");
    Arc::new(store)
}

/// Helper to record `total` sessions, the oldest `triggering` of which mention the trigger.
async fn seed_history(store: &dyn MemoryStore, total: usize, triggering: usize) {
    let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    for i in 0..total {
        let mut session = Session::start("main");
        session.started_at = base + Duration::minutes(i as i64);
        store.save_session(&session).await.expect("Failed to save session");

        let narrative = if i < triggering {
            format!("Silenced the checker with `{}` in handler {}", TRIGGER, i)
        } else {
            format!("Refactored handler {} without incident", i)
        };
        let observation = Observation::new(&session.id, "discovery", "Handler work", narrative);
        store
            .save_observation(&observation)
            .await
            .expect("Failed to save observation");
    }
}

fn candidate(title: &str, confidence: f64) -> EvolutionCandidate {
    EvolutionCandidate::new(EvolutionType::PatternBan, title, confidence)
}

async fn all_candidates(store: &dyn MemoryStore) -> Vec<EvolutionCandidate> {
    store
        .list_evolution_candidates(&CandidateFilter::default())
        .await
        .expect("Failed to list candidates")
}

async fn all_drafts(store: &dyn MemoryStore) -> Vec<DraftEntry> {
    store
        .list_drafts(&DraftFilter::default())
        .await
        .expect("Failed to list drafts")
}

async fn log(store: &dyn MemoryStore) -> Vec<EvolutionLogEntry> {
    store
        .list_evolution_log(None)
        .await
        .expect("Failed to list log")
}

// ============================================================
// New candidates
// ============================================================

mod new_candidates {
    use super::*;

    #[tokio::test]
    async fn rejects_broad_rule_regardless_of_confidence() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 5).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 95.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Rejected);
        assert!(!result.merged_existing);
        let shadow = result.candidate.shadow.expect("Missing shadow result");
        assert_eq!(shadow.false_positive_rate, 5.0 / 25.0);
        assert_eq!(shadow.sample_size, 25);
        assert_eq!(shadow.triggering_sessions, 5);

        // Kept for audit and future dedup.
        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, CandidateStatus::Rejected);
        assert!(all_drafts(store.as_ref()).await.is_empty());

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::Rejected);
        assert_eq!(entries[0].confidence, 95.0);
    }

    #[tokio::test]
    async fn auto_applies_confident_narrow_rule() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 1).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 95.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::AutoApplied);
        assert!(result.candidate.shadow_tested());
        assert!(result.candidate.sample_size().unwrap() >= 20);
        assert_eq!(result.candidate.false_positive_rate(), Some(1.0 / 25.0));
        assert!(result.draft_id.is_none());

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored, vec![result.candidate.clone()]);
        assert_eq!(stored[0].status, CandidateStatus::AutoApplied);
        assert!(all_drafts(store.as_ref()).await.is_empty());

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::AutoApplied);
        assert_eq!(entries[0].candidate_id, result.candidate.id);
    }

    #[tokio::test]
    async fn drafts_moderately_confident_rule() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 1).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 75.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Drafted);

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, CandidateStatus::Drafted);
        assert!(stored[0].shadow_tested());

        let drafts = all_drafts(store.as_ref()).await;
        assert_eq!(drafts.len(), 1);
        assert_eq!(Some(drafts[0].id.clone()), result.draft_id);
        assert_eq!(drafts[0].evolution_candidate_id.as_deref(), Some(stored[0].id.as_str()));
        assert_eq!(drafts[0].status, DraftStatus::Pending);
        assert_eq!(drafts[0].category, DraftCategory::Rule);
        assert_eq!(drafts[0].source, DraftSource::Evolution);
        assert_eq!(drafts[0].filename, "ban-as-any-casts.md");

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::Drafted);
    }

    #[tokio::test]
    async fn rejects_low_confidence_rule() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 0).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 50.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Rejected);
        assert!(result.reason.unwrap().contains("below draft threshold"));
        assert_eq!(log(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn rejects_title_without_trigger() {
        let store = setup().await;
        seed_history(store.as_ref(), 5, 0).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate("Prefer early returns", 99.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Rejected);
        assert_eq!(result.reason.as_deref(), Some("no quoted trigger phrase in title"));
        assert!(!result.candidate.shadow_tested());

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, CandidateStatus::Rejected);
        assert!(stored[0].shadow.is_none());
        assert_eq!(log(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn custom_thresholds_are_honored() {
        let store = setup().await;
        seed_history(store.as_ref(), 10, 0).await;
        let promoter = Promoter::new(Arc::clone(&store));
        let thresholds = PromotionThresholds {
            auto_apply: 80.0,
            draft: 40.0,
        };

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 85.0), &thresholds)
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::AutoApplied);
    }

    #[tokio::test]
    async fn flat_file_backend_reaches_the_same_decision() {
        let dir = TempDir::new().unwrap();
        let json_store = JsonStore::new(dir.path());
        json_store.initialize().await.unwrap();
        let json_store: Arc<dyn MemoryStore> = Arc::new(json_store);
        let sqlite_store = setup().await;

        for store in [json_store, sqlite_store] {
            seed_history(store.as_ref(), 25, 1).await;
            let result = Promoter::new(Arc::clone(&store))
                .promote_candidate(candidate(r#"Ban "as any" casts"#, 75.0), &PromotionThresholds::default())
                .await
                .expect("Promotion failed");

            assert_eq!(result.action, PromotionAction::Drafted, "{:?}", store.kind());
            assert_eq!(all_candidates(store.as_ref()).await, vec![result.candidate]);
            assert_eq!(all_drafts(store.as_ref()).await.len(), 1);
        }
    }
}

// ============================================================
// Merges
// ============================================================

mod merges {
    use super::*;

    async fn save_existing(store: &dyn MemoryStore, confidence: f64) -> EvolutionCandidate {
        let mut existing = candidate(r#"Ban "as any" casts in handlers"#, confidence);
        existing.session_count = 2;
        existing.discovery_tokens = 1_000;
        existing.evidence = vec![json!({ "session": "a" })];
        existing.description = "Casts hide type errors.".to_string();
        store
            .save_evolution_candidate(&existing)
            .await
            .expect("Failed to save candidate");
        existing
    }

    #[tokio::test]
    async fn rejected_merge_leaves_existing_untouched() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 4).await;
        let existing = save_existing(store.as_ref(), 65.0).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any""#, 95.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Rejected);
        assert!(result.merged_existing);
        assert_eq!(result.candidate.false_positive_rate(), Some(4.0 / 25.0));

        assert_eq!(all_candidates(store.as_ref()).await, vec![existing.clone()]);
        assert!(all_drafts(store.as_ref()).await.is_empty());

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::Rejected);
        assert_eq!(entries[0].candidate_id, existing.id);
    }

    #[tokio::test]
    async fn successful_merge_updates_existing_in_place() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 1).await;
        let existing = save_existing(store.as_ref(), 65.0).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let mut incoming = candidate(r#"Ban "as any""#, 95.0);
        incoming.session_count = 3;
        incoming.discovery_tokens = 500;
        incoming.evidence = vec![json!({ "session": "b" })];
        incoming.suggested_action = Some("Use a type guard.".to_string());

        let result = promoter
            .promote_candidate(incoming, &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::AutoApplied);
        assert!(result.merged_existing);

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        let merged = &stored[0];
        assert_eq!(merged.id, existing.id);
        assert_eq!(merged.title, existing.title);
        assert_eq!(merged.confidence, 95.0);
        assert_eq!(merged.session_count, 5);
        assert_eq!(merged.discovery_tokens, 1_500);
        assert_eq!(merged.evidence.len(), 2);
        assert_eq!(merged.description, existing.description);
        assert_eq!(merged.suggested_action.as_deref(), Some("Use a type guard."));
        assert_eq!(merged.status, CandidateStatus::AutoApplied);
        assert!(merged.shadow_tested());
        assert_eq!(merged, &result.candidate);

        assert_eq!(log(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn drafted_merge_creates_no_draft() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 0).await;
        save_existing(store.as_ref(), 60.0).await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any""#, 75.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Drafted);
        assert!(result.merged_existing);
        assert!(result.draft_id.is_none());
        assert!(all_drafts(store.as_ref()).await.is_empty());

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, CandidateStatus::Pending);
        assert_eq!(stored[0].confidence, 75.0);
    }

    #[tokio::test]
    async fn resolved_candidates_are_never_revived() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 0).await;
        let mut existing = candidate(r#"Ban "as any" casts in handlers"#, 40.0);
        existing.status = CandidateStatus::Rejected;
        store.save_evolution_candidate(&existing).await.unwrap();
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any""#, 99.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::Rejected);
        assert!(result.merged_existing);
        assert_eq!(result.reason.as_deref(), Some("already rejected"));
        assert_eq!(all_candidates(store.as_ref()).await, vec![existing]);
        assert_eq!(log(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn drafted_candidate_stays_in_review_when_resubmitted_confidently() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 0).await;
        let promoter = Promoter::new(Arc::clone(&store));
        let thresholds = PromotionThresholds::default();

        let first = promoter
            .promote_candidate(candidate(r#"Ban "as any""#, 75.0), &thresholds)
            .await
            .expect("Promotion failed");
        assert_eq!(first.action, PromotionAction::Drafted);

        let second = promoter
            .promote_candidate(candidate(r#"Ban "as any""#, 95.0), &thresholds)
            .await
            .expect("Promotion failed");

        assert_eq!(second.action, PromotionAction::Drafted);
        assert!(second.merged_existing);
        assert_eq!(second.reason.as_deref(), Some("draft awaiting review"));
        assert_eq!(second.candidate.id, first.candidate.id);
        assert_eq!(second.candidate.status, CandidateStatus::Drafted);
        assert_eq!(second.candidate.confidence, 95.0);

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored, vec![second.candidate.clone()]);

        let drafts = all_drafts(store.as_ref()).await;
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].status, DraftStatus::Pending);
        assert_eq!(Some(drafts[0].id.clone()), first.draft_id);

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, EvolutionAction::Drafted);
        assert_eq!(entries[0].confidence, 95.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submissions_store_a_single_candidate() {
        let store = setup().await;
        seed_history(store.as_ref(), 25, 0).await;
        let promoter = Arc::new(Promoter::new(Arc::clone(&store)));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let promoter = Arc::clone(&promoter);
                tokio::spawn(async move {
                    promoter
                        .promote_candidate(candidate(r#"Ban "as any""#, 95.0), &PromotionThresholds::default())
                        .await
                })
            })
            .collect();

        let mut actions = Vec::new();
        for handle in handles {
            let result = handle.await.expect("Task panicked").expect("Promotion failed");
            actions.push(result.action);
        }

        let stored = all_candidates(store.as_ref()).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, CandidateStatus::AutoApplied);
        assert_eq!(
            actions.iter().filter(|a| **a == PromotionAction::AutoApplied).count(),
            1
        );
        assert_eq!(
            actions.iter().filter(|a| **a == PromotionAction::Rejected).count(),
            3
        );
        assert_eq!(log(store.as_ref()).await.len(), 4);
    }
}

// ============================================================
// Review
// ============================================================

mod review {
    use super::*;

    async fn drafted(store: &Arc<dyn MemoryStore>, promoter: &Promoter) -> (EvolutionCandidate, String) {
        seed_history(store.as_ref(), 25, 0).await;
        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 75.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");
        let draft_id = result.draft_id.expect("Expected a draft");
        (result.candidate, draft_id)
    }

    #[tokio::test]
    async fn approves_a_pending_candidate() {
        let store = setup().await;
        let pending = candidate(r#"Ban "as any""#, 60.0);
        store.save_evolution_candidate(&pending).await.unwrap();
        let promoter = Promoter::new(Arc::clone(&store));

        let review = promoter.approve_candidate(&pending.id).await.expect("Review failed");

        assert_eq!(review.candidate.status, CandidateStatus::Approved);
        assert!(review.closed_drafts.is_empty());
        let stored = store.get_evolution_candidate(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored, review.candidate);

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, EvolutionAction::Approved);
        assert_eq!(entries[0].candidate_id, pending.id);
    }

    #[tokio::test]
    async fn approving_a_drafted_candidate_closes_its_draft() {
        let store = setup().await;
        let promoter = Promoter::new(Arc::clone(&store));
        let (candidate, draft_id) = drafted(&store, &promoter).await;

        let review = promoter.approve_candidate(&candidate.id).await.expect("Review failed");

        assert_eq!(review.candidate.status, CandidateStatus::Approved);
        assert_eq!(review.closed_drafts, vec![draft_id.clone()]);

        let draft = store.get_draft(&draft_id).await.unwrap().unwrap();
        assert_eq!(draft.status, DraftStatus::Rejected);
        assert!(draft.rejected_reason.unwrap().contains("superseded"));

        let entries = log(store.as_ref()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, EvolutionAction::Approved);
    }

    #[tokio::test]
    async fn rejection_records_the_reason() {
        let store = setup().await;
        let promoter = Promoter::new(Arc::clone(&store));
        let (candidate, draft_id) = drafted(&store, &promoter).await;

        let review = promoter
            .reject_candidate(&candidate.id, Some("too broad".to_string()))
            .await
            .expect("Review failed");

        assert_eq!(review.candidate.status, CandidateStatus::Rejected);
        let draft = store.get_draft(&draft_id).await.unwrap().unwrap();
        assert_eq!(draft.status, DraftStatus::Rejected);
        assert_eq!(draft.rejected_reason.as_deref(), Some("too broad"));

        let entries = log(store.as_ref()).await;
        assert_eq!(entries[0].action, EvolutionAction::Rejected);
        assert_eq!(entries[0].reason.as_deref(), Some("too broad"));
    }

    #[tokio::test]
    async fn resolved_candidates_cannot_be_reviewed_again() {
        let store = setup().await;
        let pending = candidate(r#"Ban "as any""#, 60.0);
        store.save_evolution_candidate(&pending).await.unwrap();
        let promoter = Promoter::new(Arc::clone(&store));
        promoter.approve_candidate(&pending.id).await.unwrap();

        let again = promoter.approve_candidate(&pending.id).await.unwrap_err();
        assert!(again.is_invalid_state());
        let reject = promoter.reject_candidate(&pending.id, None).await.unwrap_err();
        assert!(reject.is_invalid_state());

        let stored = store.get_evolution_candidate(&pending.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CandidateStatus::Approved);
        assert_eq!(log(store.as_ref()).await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_candidate_is_not_found() {
        let store = setup().await;
        let promoter = Promoter::new(Arc::clone(&store));

        let err = promoter.reject_candidate("missing", None).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { entity: "evolution candidate", .. }));
        assert!(log(store.as_ref()).await.is_empty());
    }
}

// ============================================================
// Sampling
// ============================================================

mod sampling {
    use super::*;

    #[tokio::test]
    async fn empty_history_has_zero_rate() {
        let store = setup().await;
        let promoter = Promoter::new(Arc::clone(&store));

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 95.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::AutoApplied);
        assert_eq!(result.candidate.sample_size(), Some(0));
        assert_eq!(result.candidate.false_positive_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn sample_limit_takes_most_recent_sessions() {
        let store = setup().await;
        // The five triggering sessions are the oldest ones.
        seed_history(store.as_ref(), 25, 5).await;
        let promoter = Promoter::new(Arc::clone(&store)).with_sample_limit(10);

        let result = promoter
            .promote_candidate(candidate(r#"Ban "as any" casts"#, 95.0), &PromotionThresholds::default())
            .await
            .expect("Promotion failed");

        assert_eq!(result.action, PromotionAction::AutoApplied);
        assert_eq!(result.candidate.sample_size(), Some(10));
        assert_eq!(result.candidate.false_positive_rate(), Some(0.0));
    }

    #[tokio::test]
    async fn trigger_match_is_case_sensitive() {
        let store = setup().await;
        let session = Session::start("main");
        store.save_session(&session).await.unwrap();
        store
            .save_observation(&Observation::new(&session.id, "bugfix", "Cast", "Used AS ANY once"))
            .await
            .unwrap();

        let result = aidd_memory::evolution::shadow_test(store.as_ref(), TRIGGER, 0)
            .await
            .unwrap();
        assert_eq!(result.triggering_sessions, 0);
        assert_eq!(result.sample_size, 1);
    }
}
