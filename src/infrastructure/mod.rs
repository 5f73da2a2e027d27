//! Infrastructure layer - Runtime, storage adapters and collaborator implementations

pub mod logging;
pub mod mutex;
pub mod observability;
pub mod process;
pub mod services;
