use thiserror::Error;

/// Failures reported by persistence backends
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("{entity} '{id}' does not exist in the store")]
    NotFound { entity: String, id: String },

    /// Backend unreachable or the write did not complete; safe to retry
    #[error("Storage unavailable: {message}")]
    Storage { message: String },

    /// A stored record could not be decoded
    #[error("Corrupt record: {message}")]
    Corrupt { message: String },
}

impl DomainError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        Self::corrupt(err.to_string())
    }
}
