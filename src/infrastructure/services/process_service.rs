//! Process service - caller-facing operations on templates and instances

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::domain::process::{
    CallbackResult, EngineError, EngineMessage, Instance, InstanceId, InstanceStatus,
    ProcessDocument, ProcessRepository, ProcessStart, ProcessTemplate, Task, TaskCompletion,
    TaskId, TemplateId, TemplateRepository, Variable, WorkId, WorkStatus,
};
use crate::infrastructure::process::{DeadLetter, ProcessRuntime, VariableStore};

/// An open task together with the instance it belongs to
#[derive(Debug, Clone, Serialize)]
pub struct OpenTask {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,
    pub task: Task,
}

/// Façade over the runtime; every command waits for its own outcome
pub struct ProcessService {
    runtime: Arc<ProcessRuntime>,
    repository: Arc<dyn ProcessRepository>,
    templates: Arc<dyn TemplateRepository>,
    variables: VariableStore,
}

impl std::fmt::Debug for ProcessService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessService").finish()
    }
}

impl ProcessService {
    pub fn new(
        runtime: Arc<ProcessRuntime>,
        repository: Arc<dyn ProcessRepository>,
        templates: Arc<dyn TemplateRepository>,
    ) -> Self {
        let variables = VariableStore::new(repository.clone());
        Self {
            runtime,
            repository,
            templates,
            variables,
        }
    }

    /// Register or replace a template
    pub async fn register_template(
        &self,
        template: ProcessTemplate,
    ) -> Result<ProcessTemplate, EngineError> {
        if template.start_node().is_none() {
            return Err(EngineError::validation(format!(
                "Template '{}' has no START node",
                template.id()
            )));
        }
        if template.end_node().is_none() {
            return Err(EngineError::validation(format!(
                "Template '{}' has no END node",
                template.id()
            )));
        }
        info!(template_id = %template.id(), nodes = template.nodes().len(), "Registering template");
        Ok(self.templates.save(template).await?)
    }

    pub async fn template(&self, id: &TemplateId) -> Result<ProcessTemplate, EngineError> {
        self.templates
            .get(id)
            .await?
            .ok_or_else(|| EngineError::template_not_found(id.as_str()))
    }

    pub async fn list_templates(&self) -> Result<Vec<ProcessTemplate>, EngineError> {
        Ok(self.templates.list().await?)
    }

    /// Start a new instance and return its id once the start has been handled
    pub async fn start(&self, start: ProcessStart) -> Result<InstanceId, EngineError> {
        self.template(&start.template_id).await?;

        let instance_id = InstanceId::generate();
        self.runtime
            .submit(EngineMessage::ProcessStart {
                instance_id: instance_id.clone(),
                start,
                parent: None,
            })
            .await?;
        Ok(instance_id)
    }

    pub async fn complete_task(
        &self,
        instance_id: &InstanceId,
        completion: TaskCompletion,
    ) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::CompleteTask {
                instance_id: instance_id.clone(),
                completion,
            })
            .await
    }

    pub async fn transfer_task(
        &self,
        instance_id: &InstanceId,
        task_id: &TaskId,
        actor: &str,
        to: &str,
    ) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::TransferTask {
                instance_id: instance_id.clone(),
                task_id: task_id.clone(),
                actor: actor.to_string(),
                to: to.to_string(),
            })
            .await
    }

    pub async fn revoke(
        &self,
        instance_id: &InstanceId,
        work_id: &WorkId,
        actor: &str,
    ) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::Revoke {
                instance_id: instance_id.clone(),
                work_id: work_id.clone(),
                actor: actor.to_string(),
            })
            .await
    }

    pub async fn sendback(
        &self,
        instance_id: &InstanceId,
        task_id: &TaskId,
        actor: &str,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::Sendback {
                instance_id: instance_id.clone(),
                task_id: task_id.clone(),
                actor: actor.to_string(),
                comment,
            })
            .await
    }

    /// Resume an asynchronous SCRIPT; the owning instance is looked up from the entry
    pub async fn callback(&self, result: CallbackResult) -> Result<(), EngineError> {
        let entry = self
            .repository
            .get_callback(&result.callback_id)
            .await?
            .ok_or_else(|| EngineError::callback_not_found(result.callback_id.as_str()))?;

        self.runtime
            .submit(EngineMessage::Callback {
                instance_id: entry.instance_id,
                result,
            })
            .await
    }

    pub async fn pause(&self, instance_id: &InstanceId, actor: &str) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::Pause {
                instance_id: instance_id.clone(),
                actor: actor.to_string(),
            })
            .await
    }

    pub async fn resume(&self, instance_id: &InstanceId, actor: &str) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::Resume {
                instance_id: instance_id.clone(),
                actor: actor.to_string(),
            })
            .await
    }

    pub async fn destroy(&self, instance_id: &InstanceId, actor: &str) -> Result<(), EngineError> {
        self.runtime
            .submit(EngineMessage::Destroy {
                instance_id: instance_id.clone(),
                actor: actor.to_string(),
            })
            .await
    }

    pub async fn document(&self, instance_id: &InstanceId) -> Result<ProcessDocument, EngineError> {
        self.repository
            .get_document(instance_id)
            .await?
            .ok_or_else(|| EngineError::instance_not_found(instance_id.as_str()))
    }

    /// Instance headers, optionally filtered by status, newest first
    pub async fn list_instances(
        &self,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<Instance>, EngineError> {
        let mut instances: Vec<Instance> = self
            .repository
            .list_instances()
            .await?
            .into_iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .collect();
        instances.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(instances)
    }

    /// RUN tasks assigned to a participant on running instances
    pub async fn tasks_for(&self, participant: &str) -> Result<Vec<OpenTask>, EngineError> {
        let mut open = Vec::new();
        for instance in self.list_instances(Some(InstanceStatus::Run)).await? {
            let Some(doc) = self.repository.get_document(&instance.id).await? else {
                continue;
            };
            open.extend(
                doc.tasks()
                    .iter()
                    .filter(|t| t.participant == participant && t.status == WorkStatus::Run)
                    .map(|t| OpenTask {
                        instance_id: instance.id.clone(),
                        template_id: instance.template_id.clone(),
                        task: t.clone(),
                    }),
            );
        }
        Ok(open)
    }

    /// Merged variables of an instance or one of its objects, as `viewer` may see them
    pub async fn variables(
        &self,
        instance_id: &InstanceId,
        object_id: Option<&str>,
        viewer: Option<&str>,
    ) -> Result<BTreeMap<String, Variable>, EngineError> {
        self.document(instance_id).await?;
        self.variables.read(instance_id, object_id, viewer).await
    }

    pub async fn wait_idle(&self) {
        self.runtime.wait_idle().await
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.runtime.dead_letters().await
    }
}
