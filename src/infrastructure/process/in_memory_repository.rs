//! In-memory process and template repositories

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::process::{
    CallbackEntry, CallbackId, DelayEntry, DelayId, EntryScope, Instance, InstanceId,
    ProcessDocument, ProcessRepository, ProcessTemplate, TemplateId, TemplateRepository,
    VariableRecord,
};
use crate::domain::DomainError;

/// In-memory implementation of ProcessRepository
#[derive(Debug, Default)]
pub struct InMemoryProcessRepository {
    documents: Arc<RwLock<HashMap<InstanceId, ProcessDocument>>>,
    variables: Arc<RwLock<Vec<VariableRecord>>>,
    delays: Arc<RwLock<HashMap<DelayId, DelayEntry>>>,
    callbacks: Arc<RwLock<HashMap<CallbackId, CallbackEntry>>>,
    write_seq: AtomicU64,
}

impl InMemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRepository for InMemoryProcessRepository {
    async fn get_document(&self, id: &InstanceId) -> Result<Option<ProcessDocument>, DomainError> {
        let documents = self.documents.read().await;
        Ok(documents.get(id).cloned())
    }

    async fn save_document(&self, document: ProcessDocument) -> Result<(), DomainError> {
        let mut documents = self.documents.write().await;
        documents.insert(document.id().clone(), document);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DomainError> {
        let documents = self.documents.read().await;
        let mut instances: Vec<Instance> =
            documents.values().map(|d| d.instance().clone()).collect();
        instances.sort_by_key(|i| i.started_at);
        Ok(instances)
    }

    async fn write_variables(&self, mut record: VariableRecord) -> Result<VariableRecord, DomainError> {
        record.seq = self.write_seq.fetch_add(1, Ordering::SeqCst) + 1;

        let mut variables = self.variables.write().await;
        variables.retain(|r| !r.matches(&record.instance_id, &record.object_id, &record.writer));
        variables.push(record.clone());
        Ok(record)
    }

    async fn read_variables(
        &self,
        instance_id: &InstanceId,
        object_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>, DomainError> {
        let variables = self.variables.read().await;
        Ok(variables
            .iter()
            .filter(|r| &r.instance_id == instance_id)
            .filter(|r| object_id.is_none_or(|o| r.object_id == o))
            .cloned()
            .collect())
    }

    async fn purge_variables(
        &self,
        instance_id: &InstanceId,
        object_ids: &[String],
    ) -> Result<usize, DomainError> {
        let mut variables = self.variables.write().await;
        let mut purged = 0;

        for record in variables
            .iter_mut()
            .filter(|r| &r.instance_id == instance_id && object_ids.contains(&r.object_id))
        {
            let before = record.variables.len();
            record.variables.retain(|v| v.durable);
            purged += before - record.variables.len();
        }
        variables.retain(|r| !r.variables.is_empty());

        Ok(purged)
    }

    async fn save_delay(&self, entry: DelayEntry) -> Result<(), DomainError> {
        let mut delays = self.delays.write().await;
        delays.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn due_delays(&self, now: DateTime<Utc>) -> Result<Vec<DelayEntry>, DomainError> {
        let delays = self.delays.read().await;
        let mut due: Vec<DelayEntry> = delays.values().filter(|d| d.is_due(now)).cloned().collect();
        due.sort_by_key(|d| d.wake_at);
        Ok(due)
    }

    async fn delete_delay(&self, id: &DelayId) -> Result<bool, DomainError> {
        let mut delays = self.delays.write().await;
        Ok(delays.remove(id).is_some())
    }

    async fn delete_delays(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError> {
        let mut delays = self.delays.write().await;
        let before = delays.len();
        delays.retain(|_, d| !(&d.instance_id == instance_id && scope.covers(&d.work_id)));
        Ok(before - delays.len())
    }

    async fn save_callback(&self, entry: CallbackEntry) -> Result<(), DomainError> {
        let mut callbacks = self.callbacks.write().await;
        callbacks.insert(entry.id.clone(), entry);
        Ok(())
    }

    async fn get_callback(&self, id: &CallbackId) -> Result<Option<CallbackEntry>, DomainError> {
        let callbacks = self.callbacks.read().await;
        Ok(callbacks.get(id).cloned())
    }

    async fn list_callbacks(&self, instance_id: &InstanceId) -> Result<Vec<CallbackEntry>, DomainError> {
        let callbacks = self.callbacks.read().await;
        let mut entries: Vec<CallbackEntry> = callbacks
            .values()
            .filter(|c| &c.instance_id == instance_id)
            .cloned()
            .collect();
        entries.sort_by_key(|c| c.created_at);
        Ok(entries)
    }

    async fn delete_callback(&self, id: &CallbackId) -> Result<bool, DomainError> {
        let mut callbacks = self.callbacks.write().await;
        Ok(callbacks.remove(id).is_some())
    }

    async fn delete_callbacks(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError> {
        let mut callbacks = self.callbacks.write().await;
        let before = callbacks.len();
        callbacks.retain(|_, c| !(&c.instance_id == instance_id && scope.covers(&c.work_id)));
        Ok(before - callbacks.len())
    }
}

/// In-memory implementation of TemplateRepository
#[derive(Debug, Default)]
pub struct InMemoryTemplateRepository {
    templates: Arc<RwLock<HashMap<TemplateId, ProcessTemplate>>>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository pre-populated with templates
    pub fn with_templates(templates: Vec<ProcessTemplate>) -> Self {
        let map: HashMap<TemplateId, ProcessTemplate> = templates
            .into_iter()
            .map(|t| (t.id().clone(), t))
            .collect();

        Self {
            templates: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn get(&self, id: &TemplateId) -> Result<Option<ProcessTemplate>, DomainError> {
        let templates = self.templates.read().await;
        Ok(templates.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<ProcessTemplate>, DomainError> {
        let templates = self.templates.read().await;
        let mut list: Vec<ProcessTemplate> = templates.values().cloned().collect();
        list.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(list)
    }

    async fn save(&self, template: ProcessTemplate) -> Result<ProcessTemplate, DomainError> {
        let mut templates = self.templates.write().await;
        templates.insert(template.id().clone(), template.clone());
        Ok(template)
    }

    async fn delete(&self, id: &TemplateId) -> Result<bool, DomainError> {
        let mut templates = self.templates.write().await;
        Ok(templates.remove(id).is_some())
    }
}
