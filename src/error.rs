//! Error taxonomy.
//!
//! [`StoreError`] is what a storage backend can fail with. [`MemoryError`] is the
//! boundary type returned by the promotion pipeline and the draft manager.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a [`MemoryStore`](crate::store::MemoryStore) backend.
///
/// Once a backend has initialized, these propagate to the caller unchanged. Only
/// [`StoreError::Unavailable`] raised while opening the indexed backend is recovered
/// locally, by falling back to the flat-file backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The indexed backend could not be constructed or initialized.
    #[error("indexed storage unavailable: {0}")]
    Unavailable(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted JSON payload could not be decoded (or encoded).
    #[error("malformed {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    /// Write-once entities (observations, log entries, new candidates and drafts)
    /// cannot be saved twice under the same id.
    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    /// An update addressed an entity that does not exist.
    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: String },

    /// An entity points at a parent that does not exist.
    #[error("{entity} {id} references missing {target} {target_id}")]
    MissingReference {
        entity: &'static str,
        id: String,
        target: &'static str,
        target_id: String,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Parse {
            what: what.into(),
            source,
        }
    }
}

/// Errors surfaced by [`Promoter`](crate::evolution::Promoter) and
/// [`DraftManager`](crate::drafts::DraftManager).
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The operation is illegal for the entity's current status.
    #[error("{entity} {id} is {status}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: String,
        status: String,
        expected: &'static str,
    },

    #[error("draft {0} has no content to write")]
    EmptyContent(String),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for MemoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Storage(other),
        }
    }
}

impl MemoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}
