//! Infrastructure services

mod process_service;

pub use process_service::{OpenTask, ProcessService};
