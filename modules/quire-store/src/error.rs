use quire_common::QuireError;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflicting write: {0}")]
    Conflict(String),

    /// A persisted row could not be mapped back to a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("In-memory store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for QuireError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => QuireError::NotFound { entity, id },
            StoreError::Conflict(msg) => QuireError::Validation(msg),
            StoreError::Corrupt(msg) => QuireError::Fatal(format!("corrupt store row: {msg}")),
            other => QuireError::Store(other.to_string()),
        }
    }
}
