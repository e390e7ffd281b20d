//! Session memory and the evolution gate for AI-assisted development.
//!
//! Sessions and observations are recorded through a [`store::MemoryStore`]. Proposed
//! governance rules are shadow tested against that history by
//! [`evolution::Promoter`] and either applied, staged as drafts for
//! [`drafts::DraftManager`], or rejected.

pub mod config;
pub mod drafts;
pub mod error;
pub mod evolution;
pub mod models;
pub mod store;

pub use error::{MemoryError, StoreError};
