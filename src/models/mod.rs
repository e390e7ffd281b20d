//! Domain models for the memory layer.
//!
//! # Core Concepts
//!
//! ## History
//!
//! - [`Session`]: one development session, archived (never deleted) when it ends.
//! - [`Observation`]: write-once narrative fact owned by a session. Narratives are the
//!   corpus the shadow tester replays candidate rules against.
//! - [`PermanentMemory`]: decisions, mistakes and conventions kept across sessions.
//!
//! ## Governance
//!
//! - [`EvolutionCandidate`]: a proposed rule, gated by shadow testing before it is
//!   auto-applied, drafted for review, or rejected.
//! - [`EvolutionLogEntry`]: append-only audit trail, one entry per decision.
//! - [`DraftEntry`]: content awaiting human approval, optionally linked to a candidate.

mod draft;
mod evolution;
mod memory;
mod observation;
mod session;

pub use draft::*;
pub use evolution::*;
pub use memory::*;
pub use observation::*;
pub use session::*;
