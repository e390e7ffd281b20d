use crate::error::StoreError;
use crate::models::{ObservationFilter, ShadowTestResult};
use crate::store::MemoryStore;

/// Sampled sessions whose narratives may contain the trigger before a candidate is
/// considered too broad.
pub const MAX_FALSE_POSITIVE_RATE: f64 = 0.10;

/// Sessions sampled when no limit is configured.
pub const DEFAULT_SAMPLE_LIMIT: usize = 100;

/// First non-blank span enclosed in double quotes, straight (`"…"`) or curly (`“…”`).
///
/// ```
/// use aidd_memory::evolution::extract_trigger;
///
/// assert_eq!(extract_trigger(r#"Ban "as any" casts"#), Some("as any"));
/// assert_eq!(extract_trigger("Prefer early returns"), None);
/// ```
pub fn extract_trigger(title: &str) -> Option<&str> {
    let mut rest = title;
    loop {
        let (open_at, open) = rest.char_indices().find(|(_, c)| matches!(c, '"' | '“'))?;
        let close = if open == '“' { '”' } else { '"' };

        let body = &rest[open_at + open.len_utf8()..];
        let close_at = body.find(close)?;
        let span = &body[..close_at];
        if !span.trim().is_empty() {
            return Some(span);
        }
        rest = &body[close_at + close.len_utf8()..];
    }
}

/// Replay `trigger` against the most recent `sample_limit` sessions (`0` samples all).
///
/// A session counts as triggering when any of its observation narratives contains the
/// trigger verbatim. Session outcomes are not considered. Read-only.
pub async fn shadow_test(
    store: &dyn MemoryStore,
    trigger: &str,
    sample_limit: usize,
) -> Result<ShadowTestResult, StoreError> {
    let limit = (sample_limit > 0).then_some(sample_limit);
    let sessions = store.list_sessions(limit).await?;

    let mut triggering_sessions = 0;
    for session in &sessions {
        let observations = store
            .list_observations(&ObservationFilter::for_session(&session.id))
            .await?;
        if observations.iter().any(|o| o.narrative.contains(trigger)) {
            triggering_sessions += 1;
        }
    }

    let sample_size = sessions.len();
    let false_positive_rate = if sample_size == 0 {
        0.0
    } else {
        triggering_sessions as f64 / sample_size as f64
    };

    tracing::debug!(
        "Shadow test for {:?}: {}/{} sessions triggered",
        trigger,
        triggering_sessions,
        sample_size
    );

    Ok(ShadowTestResult {
        false_positive_rate,
        sample_size,
        triggering_sessions,
    })
}

/// Whether the measured rate is low enough to trust the rule at all.
pub fn passes_gate(result: &ShadowTestResult) -> bool {
    result.false_positive_rate <= MAX_FALSE_POSITIVE_RATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_quoted_span_wins() {
        assert_eq!(
            extract_trigger(r#"Ban "unwrap()" and "expect(" in handlers"#),
            Some("unwrap()")
        );
    }

    #[test]
    fn curly_quotes_are_accepted() {
        assert_eq!(extract_trigger("Avoid “console.log” in commits"), Some("console.log"));
    }

    #[test]
    fn blank_spans_are_skipped() {
        assert_eq!(extract_trigger(r#"Odd "" title with "TODO" marker"#), Some("TODO"));
        assert_eq!(extract_trigger(r#"Only "  " here"#), None);
    }

    #[test]
    fn unterminated_quote_has_no_trigger() {
        assert_eq!(extract_trigger(r#"Ban "as any"#), None);
    }

    #[test]
    fn gate_boundary_is_inclusive() {
        let at_limit = ShadowTestResult {
            false_positive_rate: 10.0 / 100.0,
            sample_size: 100,
            triggering_sessions: 10,
        };
        let above = ShadowTestResult {
            false_positive_rate: 3.0 / 25.0,
            sample_size: 25,
            triggering_sessions: 3,
        };
        assert!(passes_gate(&at_limit));
        assert!(!passes_gate(&above));
    }
}
