//! Error types for the gridsync core library.

/// Top-level error enum for the gridsync core library.
///
/// Variants mirror how a reconciliation run treats a failure: upstream,
/// store, commit and config errors abort the run, the rest are contained at
/// the boundary of the resource that produced them.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Normalization error: {0}")]
    Normalization(String),

    #[error("Naming error: {0}")]
    Naming(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Commit error: {0}")]
    Commit(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("LDAP filter error: {0}")]
    Filter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Whether this error must abort the whole run rather than skip a single
    /// resource.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Upstream(_)
            | SyncError::Store(_)
            | SyncError::Commit(_)
            | SyncError::Config(_)
            | SyncError::Filter(_)
            | SyncError::Io(_)
            | SyncError::Sqlite(_)
            | SyncError::Json(_) => true,
            SyncError::Normalization(_) | SyncError::Naming(_) => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
