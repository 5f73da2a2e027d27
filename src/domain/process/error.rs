//! Process engine error types

use thiserror::Error;

use crate::domain::DomainError;

/// Errors surfaced by the process engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Work not found: {0}")]
    WorkNotFound(String),

    #[error("Callback not found: {0}")]
    CallbackNotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: '{actor}' may not {action}")]
    Permission { actor: String, action: String },

    #[error("State conflict on {entity}: expected {expected}, found {current}")]
    StateConflict {
        entity: String,
        expected: String,
        current: String,
    },

    #[error("Work is not revocable: {0}")]
    NotRevocable(String),

    #[error("Instance is not running (status {status})")]
    InstanceNotRunning { status: String },

    #[error("Script execution failed: {0}")]
    Script(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Message handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Storage(#[from] DomainError),
}

impl EngineError {
    pub fn instance_not_found(id: impl Into<String>) -> Self {
        Self::InstanceNotFound(id.into())
    }

    pub fn template_not_found(id: impl Into<String>) -> Self {
        Self::TemplateNotFound(id.into())
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::TaskNotFound(id.into())
    }

    pub fn work_not_found(id: impl Into<String>) -> Self {
        Self::WorkNotFound(id.into())
    }

    pub fn callback_not_found(id: impl Into<String>) -> Self {
        Self::CallbackNotFound(id.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn permission(actor: impl Into<String>, action: impl Into<String>) -> Self {
        Self::Permission {
            actor: actor.into(),
            action: action.into(),
        }
    }

    pub fn state_conflict(
        entity: impl Into<String>,
        expected: impl ToString,
        current: impl ToString,
    ) -> Self {
        Self::StateConflict {
            entity: entity.into(),
            expected: expected.to_string(),
            current: current.to_string(),
        }
    }

    pub fn not_revocable(reason: impl Into<String>) -> Self {
        Self::NotRevocable(reason.into())
    }

    pub fn not_running(status: impl ToString) -> Self {
        Self::InstanceNotRunning {
            status: status.to_string(),
        }
    }

    pub fn script(message: impl Into<String>) -> Self {
        Self::Script(message.into())
    }

    pub fn notification(message: impl Into<String>) -> Self {
        Self::Notification(message.into())
    }

    /// Whether the failure is infrastructural and the message should be re-delivered
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(DomainError::Storage { .. }))
    }
}
