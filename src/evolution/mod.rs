//! The evolution gate: shadow testing proposed rules against session history and
//! routing them to auto-apply, draft review, or rejection.

mod promotion;
mod shadow;

pub use promotion::{
    CandidateReview, PromotionAction, PromotionResult, PromotionThresholds, Promoter,
};
pub use shadow::{
    extract_trigger, passes_gate, shadow_test, DEFAULT_SAMPLE_LIMIT, MAX_FALSE_POSITIVE_RATE,
};
