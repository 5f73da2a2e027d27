//! Domain layer - Core business logic and entities

pub mod error;
pub mod process;

pub use error::DomainError;
pub use process::{
    EngineError, EngineMessage, InstanceId, InstanceStatus, ProcessDocument, ProcessRepository,
    ProcessTemplate, TemplateId, TemplateRepository, WorkStatus,
};
