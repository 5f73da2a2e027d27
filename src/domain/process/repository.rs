//! Persistence port for instance documents, variables and re-entry entries

use std::fmt::Debug;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::document::{Instance, ProcessDocument};
use super::ids::{CallbackId, DelayId, InstanceId, TemplateId, WorkId};
use super::message::{CallbackEntry, DelayEntry};
use super::template::ProcessTemplate;
use super::variable::VariableRecord;
use crate::domain::DomainError;

/// Which entries of an instance a bulk delete applies to
#[derive(Debug, Clone, Copy)]
pub enum EntryScope<'a> {
    /// Every entry of the instance
    Instance,
    /// Only entries attached to these works
    Works(&'a [WorkId]),
}

impl EntryScope<'_> {
    pub fn covers(&self, work_id: &WorkId) -> bool {
        match self {
            Self::Instance => true,
            Self::Works(ids) => ids.contains(work_id),
        }
    }
}

/// Template catalogue
#[async_trait]
pub trait TemplateRepository: Send + Sync + Debug {
    async fn get(&self, id: &TemplateId) -> Result<Option<ProcessTemplate>, DomainError>;

    async fn list(&self) -> Result<Vec<ProcessTemplate>, DomainError>;

    /// Insert or replace a template
    async fn save(&self, template: ProcessTemplate) -> Result<ProcessTemplate, DomainError>;

    async fn delete(&self, id: &TemplateId) -> Result<bool, DomainError>;
}

/// Storage for everything an instance persists
#[async_trait]
pub trait ProcessRepository: Send + Sync + Debug {
    /// Load an instance document
    async fn get_document(&self, id: &InstanceId) -> Result<Option<ProcessDocument>, DomainError>;

    /// Persist a document, replacing any previous version
    async fn save_document(&self, document: ProcessDocument) -> Result<(), DomainError>;

    /// Headers of all known instances
    async fn list_instances(&self) -> Result<Vec<Instance>, DomainError>;

    /// Replace the record of (instance, object, writer); the store assigns the write sequence
    async fn write_variables(&self, record: VariableRecord) -> Result<VariableRecord, DomainError>;

    /// Records of an instance, optionally limited to one object
    async fn read_variables(
        &self,
        instance_id: &InstanceId,
        object_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>, DomainError>;

    /// Drop non-durable variables written on the given objects
    async fn purge_variables(
        &self,
        instance_id: &InstanceId,
        object_ids: &[String],
    ) -> Result<usize, DomainError>;

    async fn save_delay(&self, entry: DelayEntry) -> Result<(), DomainError>;

    /// Delay entries whose wake time has passed
    async fn due_delays(&self, now: DateTime<Utc>) -> Result<Vec<DelayEntry>, DomainError>;

    async fn delete_delay(&self, id: &DelayId) -> Result<bool, DomainError>;

    async fn delete_delays(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError>;

    async fn save_callback(&self, entry: CallbackEntry) -> Result<(), DomainError>;

    async fn get_callback(&self, id: &CallbackId) -> Result<Option<CallbackEntry>, DomainError>;

    async fn list_callbacks(&self, instance_id: &InstanceId) -> Result<Vec<CallbackEntry>, DomainError>;

    async fn delete_callback(&self, id: &CallbackId) -> Result<bool, DomainError>;

    async fn delete_callbacks(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError>;
}
