//! Process engine - the node-type state machine
//!
//! Every [`EngineMessage`] is handled against a freshly loaded
//! [`ProcessDocument`]; the handler mutates the document, persists it and
//! returns the follow-on messages for the bus. Callers guarantee that at most
//! one message per instance is in flight (see the runtime).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use tracing::{debug, info, warn};

use crate::domain::process::{
    decision_labels, route_next, ActionNode, AndNode, CallbackEntry, CallbackResult,
    DelayEntry, DelayId, EngineError, EngineMessage, EntryScope, InformNode, Instance, InstanceId,
    InstanceStatus, MessageHandler, NodeActivation, NodeDef, NodeKind, Notification,
    NotificationKind, Notifier, ParentLink, ParticipantResolver, ProcessDocument, ProcessRepository,
    ProcessStart, ProcessTemplate, ResolveContext, ScriptExecutor, ScriptNode, ScriptRequest,
    SubNode, Task, TaskCompletion, TaskId, TemplateId, TemplateRepository, TimerNode, TraceStatus,
    VoteOutcome, VoteRule, Work, WorkId, WorkStatus, DEFAULT_ROUTE, PROCESS_OBJECT,
};

use super::notifier::TracingNotifier;
use super::resolver::ExpressionParticipantResolver;
use super::script::CommandScriptExecutor;
use super::variable_store::VariableStore;

const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(5);
const SCRIPT_WRITER: &str = "script";
const CALLBACK_WRITER: &str = "callback";

/// What a handler produced besides document changes
#[derive(Debug, Default)]
struct Step {
    activations: Vec<NodeActivation>,
    messages: Vec<EngineMessage>,
    /// Written only after the document is saved
    entries: Vec<EntryChange>,
}

impl Step {
    fn activations(activations: Vec<NodeActivation>) -> Self {
        Self {
            activations,
            ..Self::default()
        }
    }

    fn entry(change: EntryChange) -> Self {
        Self {
            entries: vec![change],
            ..Self::default()
        }
    }
}

/// Re-entry and variable bookkeeping that follows a document change
#[derive(Debug)]
enum EntryChange {
    SaveDelay(DelayEntry),
    SaveCallback(CallbackEntry),
    /// Delays and callbacks of these works
    DropWorks(Vec<WorkId>),
    /// Every delay and callback of the instance
    DropInstance,
    PurgeVariables(Vec<WorkId>),
}

#[derive(Debug)]
pub struct ProcessEngine {
    repository: Arc<dyn ProcessRepository>,
    templates: Arc<dyn TemplateRepository>,
    variables: VariableStore,
    resolver: Arc<dyn ParticipantResolver>,
    notifier: Arc<dyn Notifier>,
    scripts: Arc<dyn ScriptExecutor>,
    script_timeout: Duration,
}

impl ProcessEngine {
    pub fn new(
        repository: Arc<dyn ProcessRepository>,
        templates: Arc<dyn TemplateRepository>,
    ) -> Self {
        Self {
            variables: VariableStore::new(repository.clone()),
            repository,
            templates,
            resolver: Arc::new(ExpressionParticipantResolver::default()),
            notifier: Arc::new(TracingNotifier),
            scripts: Arc::new(CommandScriptExecutor::default()),
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ParticipantResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_script_executor(mut self, scripts: Arc<dyn ScriptExecutor>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = timeout;
        self
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    async fn load(&self, id: &InstanceId) -> Result<ProcessDocument, EngineError> {
        self.repository
            .get_document(id)
            .await?
            .ok_or_else(|| EngineError::instance_not_found(id.as_str()))
    }

    async fn template(&self, id: &TemplateId) -> Result<ProcessTemplate, EngineError> {
        self.templates
            .get(id)
            .await?
            .ok_or_else(|| EngineError::template_not_found(id.as_str()))
    }

    async fn template_of(&self, doc: &ProcessDocument) -> Result<ProcessTemplate, EngineError> {
        self.template(&doc.instance().template_id).await
    }

    /// Persist the document and collect the messages to publish
    async fn finish(
        &self,
        mut doc: ProcessDocument,
        step: Step,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut messages = step.messages;
        messages.extend(dispatch(&mut doc, step.activations));
        doc.touch();
        let instance_id = doc.id().clone();
        self.repository.save_document(doc).await?;
        self.apply_entries(&instance_id, step.entries).await?;
        Ok(messages)
    }

    async fn apply_entries(
        &self,
        instance_id: &InstanceId,
        entries: Vec<EntryChange>,
    ) -> Result<(), EngineError> {
        for change in entries {
            match change {
                EntryChange::SaveDelay(entry) => self.repository.save_delay(entry).await?,
                EntryChange::SaveCallback(entry) => self.repository.save_callback(entry).await?,
                EntryChange::DropWorks(works) => {
                    self.repository
                        .delete_delays(instance_id, EntryScope::Works(&works))
                        .await?;
                    self.repository
                        .delete_callbacks(instance_id, EntryScope::Works(&works))
                        .await?;
                }
                EntryChange::DropInstance => {
                    self.repository
                        .delete_delays(instance_id, EntryScope::Instance)
                        .await?;
                    self.repository
                        .delete_callbacks(instance_id, EntryScope::Instance)
                        .await?;
                }
                EntryChange::PurgeVariables(works) => {
                    self.variables.purge_works(instance_id, &works).await?;
                }
            }
        }
        Ok(())
    }

    async fn participants(
        &self,
        doc: &ProcessDocument,
        node_id: &str,
        role: &str,
    ) -> Result<Vec<String>, EngineError> {
        let instance = doc.instance();
        let context = ResolveContext {
            instance_id: instance.id.clone(),
            starter: instance.starter.clone(),
            tenant: instance.tenant.clone(),
            variables: self.variables.values(&instance.id).await?,
        };

        match self.resolver.resolve(role, &context).await {
            Ok(participants) => Ok(participants),
            Err(e) => {
                warn!(
                    instance_id = %instance.id,
                    node_id = %node_id,
                    role = %role,
                    error = %e,
                    "Participant resolution failed"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Notifications never fail the step that triggered them
    async fn notify(&self, notification: Notification) {
        if notification.recipients.is_empty() {
            return;
        }
        let instance_id = notification.instance_id.clone();
        let node_id = notification.node_id.clone();
        if let Err(e) = self.notifier.notify(notification).await {
            warn!(
                instance_id = %instance_id,
                node_id = %node_id,
                error = %e,
                "Notification delivery failed"
            );
        }
    }

    // Instance lifecycle

    async fn start(
        &self,
        instance_id: InstanceId,
        start: ProcessStart,
        parent: Option<ParentLink>,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        if self.repository.get_document(&instance_id).await?.is_some() {
            debug!(instance_id = %instance_id, "Instance already started, ignoring duplicate");
            return Ok(Vec::new());
        }

        let template = self.template(&start.template_id).await?;
        let start_node = template.start_node().ok_or_else(|| {
            EngineError::validation(format!("Template '{}' has no START node", template.id()))
        })?;

        let mut instance = Instance::new(
            instance_id.clone(),
            template.id().clone(),
            &start.starter,
            &start.tenant,
        );
        if let Some(parent) = parent {
            instance = instance.with_parent(parent);
        }

        self.variables
            .write_values(&instance_id, PROCESS_OBJECT, &start.starter, &start.variables)
            .await?;

        info!(
            instance_id = %instance_id,
            template_id = %template.id(),
            starter = %start.starter,
            "Process instance started"
        );
        counter!("flow_instances_started_total").increment(1);

        let entry = NodeActivation::entry(instance_id, template.id().clone(), &start_node.id);
        self.finish(ProcessDocument::new(instance), Step::activations(vec![entry]))
            .await
    }

    async fn pause(
        &self,
        instance_id: &InstanceId,
        actor: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_starter(&doc, actor, "pause")?;
        if doc.status() != InstanceStatus::Run {
            return Err(EngineError::state_conflict(
                format!("instance {}", instance_id),
                InstanceStatus::Run,
                doc.status(),
            ));
        }

        doc.set_status(InstanceStatus::Pause);
        info!(instance_id = %instance_id, actor = %actor, "Process instance paused");
        self.finish(doc, Step::default()).await
    }

    async fn resume(
        &self,
        instance_id: &InstanceId,
        actor: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_starter(&doc, actor, "resume")?;
        if doc.status() != InstanceStatus::Pause {
            return Err(EngineError::state_conflict(
                format!("instance {}", instance_id),
                InstanceStatus::Pause,
                doc.status(),
            ));
        }

        doc.set_status(InstanceStatus::Run);
        let parked = doc.take_parked();
        info!(
            instance_id = %instance_id,
            actor = %actor,
            released = parked.len(),
            "Process instance resumed"
        );
        self.finish(doc, Step::activations(parked)).await
    }

    async fn destroy(
        &self,
        instance_id: &InstanceId,
        actor: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_starter(&doc, actor, "destroy")?;
        if doc.status().is_terminal() {
            return Err(EngineError::state_conflict(
                format!("instance {}", instance_id),
                "RUN or PAUSE",
                doc.status(),
            ));
        }

        let open: Vec<WorkId> = doc.open_works().map(|w| w.id.clone()).collect();
        let children = attached_children(&doc, &open);
        for id in &open {
            doc.close_work(id, WorkStatus::Stop);
        }
        doc.take_parked();
        doc.set_status(InstanceStatus::Stop);

        info!(
            instance_id = %instance_id,
            actor = %actor,
            stopped = open.len(),
            "Process instance destroyed"
        );

        let step = Step {
            activations: Vec::new(),
            messages: destroy_messages(children, &doc.instance().starter),
            entries: vec![EntryChange::DropInstance],
        };
        self.finish(doc, step).await
    }

    // Node activation

    async fn activate(
        &self,
        mut activation: NodeActivation,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(&activation.instance_id).await?;

        match doc.status() {
            InstanceStatus::Run => {}
            InstanceStatus::Pause => {
                debug!(
                    instance_id = %activation.instance_id,
                    node_id = %activation.selector,
                    "Instance paused, parking activation"
                );
                doc.park(activation);
                return self.finish(doc, Step::default()).await;
            }
            status => {
                debug!(
                    instance_id = %activation.instance_id,
                    node_id = %activation.selector,
                    status = %status,
                    "Discarding activation for finished instance"
                );
                return Ok(Vec::new());
            }
        }

        let template = self.template_of(&doc).await?;

        if let Some(group) = &activation.parallel_id {
            let settled = doc
                .closing_joins(group)
                .any(|join| template.reaches(&activation.selector, join));
            if settled {
                debug!(
                    instance_id = %activation.instance_id,
                    node_id = %activation.selector,
                    parallel_id = %group,
                    "Branch already settled by an OR join, discarding activation"
                );
                if let Some(from_work) = &activation.from_work {
                    doc.discard_pending_trace(from_work, &activation.selector, activation.round);
                }
                return self.finish(doc, Step::default()).await;
            }
        }
        let node = match template.node(&activation.selector) {
            Some(node) => node.clone(),
            None => {
                let end = template.end_node().ok_or_else(|| {
                    EngineError::validation(format!(
                        "Unknown node '{}' and template '{}' has no END node",
                        activation.selector,
                        template.id()
                    ))
                })?;
                warn!(
                    instance_id = %activation.instance_id,
                    selector = %activation.selector,
                    end = %end.id,
                    "Unknown node, redirecting to END"
                );
                activation.selector = end.id.clone();
                end.clone()
            }
        };

        let node_type = node.kind.type_name();
        counter!("flow_activations_total", "node_type" => node_type).increment(1);
        debug!(
            instance_id = %activation.instance_id,
            node_id = %node.id,
            node_type = node_type,
            round = activation.round,
            "Activating node"
        );

        let step = match &node.kind {
            NodeKind::Start | NodeKind::Through => {
                let work_id = open_work(&mut doc, &activation, node_type, WorkStatus::Run);
                Step::activations(advance(&template, &mut doc, &work_id, DEFAULT_ROUTE)?)
            }
            NodeKind::Ground => {
                let work_id = open_work(&mut doc, &activation, node_type, WorkStatus::Run);
                doc.complete_work(&work_id, DEFAULT_ROUTE);
                debug!(instance_id = %activation.instance_id, node_id = %node.id, "Branch grounded");
                Step::default()
            }
            NodeKind::Action(action) => {
                self.activate_action(&mut doc, &activation, &node, action)
                    .await?
            }
            NodeKind::Inform(inform) => {
                self.activate_inform(&template, &mut doc, &activation, inform)
                    .await?
            }
            NodeKind::Script(script) => {
                self.activate_script(&template, &mut doc, &activation, script)
                    .await?
            }
            NodeKind::And(and) => activate_and(&template, &mut doc, &activation, and)?,
            NodeKind::Or => self.activate_or(&template, &mut doc, &activation).await?,
            NodeKind::Timer(timer) => self.activate_timer(&mut doc, &activation, timer).await?,
            NodeKind::Sub(sub) => {
                self.activate_sub(&template, &mut doc, &activation, sub)
                    .await?
            }
            NodeKind::End => self.activate_end(&mut doc, &activation).await?,
        };

        self.finish(doc, step).await
    }

    async fn activate_action(
        &self,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
        node: &NodeDef,
        action: &ActionNode,
    ) -> Result<Step, EngineError> {
        let mut participants = self.participants(doc, &node.id, &action.role).await?;
        if participants.is_empty() {
            warn!(
                instance_id = %activation.instance_id,
                node_id = %node.id,
                role = %action.role,
                "No participants resolved, assigning to starter"
            );
            participants.push(doc.instance().starter.clone());
        }

        let work_id = open_work(doc, activation, "ACTION", WorkStatus::Run);
        let work = doc
            .work(&work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(work_id.as_str()))?;
        for participant in &participants {
            doc.push_task(Task::new(&work, participant, action.transferable));
        }

        info!(
            instance_id = %activation.instance_id,
            node_id = %node.id,
            work_id = %work_id,
            participants = participants.len(),
            "Tasks assigned"
        );

        self.notify(Notification {
            kind: NotificationKind::Assigned,
            instance_id: activation.instance_id.clone(),
            work_id,
            node_id: node.id.clone(),
            recipients: participants,
            subject: format!("New task: {}", node.name),
            body: String::new(),
        })
        .await;

        Ok(Step::default())
    }

    async fn activate_inform(
        &self,
        template: &ProcessTemplate,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
        inform: &InformNode,
    ) -> Result<Step, EngineError> {
        let work_id = open_work(doc, activation, "INFORM", WorkStatus::Run);
        let recipients = self
            .participants(doc, &activation.selector, &inform.role)
            .await?;

        self.notify(Notification {
            kind: NotificationKind::Inform,
            instance_id: activation.instance_id.clone(),
            work_id: work_id.clone(),
            node_id: activation.selector.clone(),
            recipients,
            subject: inform.subject.clone(),
            body: inform.body.clone(),
        })
        .await;

        Ok(Step::activations(advance(
            template,
            doc,
            &work_id,
            DEFAULT_ROUTE,
        )?))
    }

    async fn activate_script(
        &self,
        template: &ProcessTemplate,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
        script: &ScriptNode,
    ) -> Result<Step, EngineError> {
        if script.asynchronous {
            let work_id = open_work(doc, activation, "SCRIPT", WorkStatus::Wait);
            let entry = CallbackEntry::new(doc.id().clone(), work_id, activation.round);
            info!(
                instance_id = %activation.instance_id,
                node_id = %activation.selector,
                callback_id = %entry.id,
                "Script waiting for callback"
            );
            return Ok(Step::entry(EntryChange::SaveCallback(entry)));
        }

        let work_id = open_work(doc, activation, "SCRIPT", WorkStatus::Run);
        let request = ScriptRequest {
            instance_id: doc.id().clone(),
            work_id: work_id.clone(),
            node_id: activation.selector.clone(),
            code: script.code.clone(),
            variables: self.variables.values(doc.id()).await?,
            timeout: script
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.script_timeout),
        };

        let decision = match self.scripts.execute(request).await {
            Ok(output) => {
                self.variables
                    .write_values(doc.id(), work_id.as_str(), SCRIPT_WRITER, &output.variables)
                    .await?;
                output
                    .decision
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ROUTE.to_string())
            }
            Err(e) => {
                warn!(
                    instance_id = %activation.instance_id,
                    node_id = %activation.selector,
                    error = %e,
                    fallback = %script.fallback,
                    "Script failed, using fallback decision"
                );
                counter!("flow_script_fallbacks_total").increment(1);
                script.fallback.clone()
            }
        };

        Ok(Step::activations(advance(template, doc, &work_id, &decision)?))
    }

    async fn activate_or(
        &self,
        template: &ProcessTemplate,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
    ) -> Result<Step, EngineError> {
        let node_id = activation.selector.as_str();

        if doc.done_at_or_after(node_id, activation.round) {
            if let Some(from_work) = &activation.from_work {
                doc.discard_pending_trace(from_work, node_id, activation.round);
            }
            debug!(
                instance_id = %activation.instance_id,
                node_id = %node_id,
                round = activation.round,
                "OR join already fired, discarding late arrival"
            );
            return Ok(Step::default());
        }

        let losers: Vec<WorkId> = match &activation.parallel_id {
            Some(group) => doc
                .open_works_in_group(group)
                .filter(|w| template.reaches(&w.node_id, node_id))
                .map(|w| w.id.clone())
                .collect(),
            None => template
                .inbound_sources(node_id)
                .into_iter()
                .filter(|source| Some(*source) != activation.from_node.as_deref())
                .flat_map(|source| {
                    doc.works_for_node(source)
                        .filter(|w| w.is_open())
                        .map(|w| w.id.clone())
                        .collect::<Vec<_>>()
                })
                .collect(),
        };

        let children = attached_children(doc, &losers);
        for id in &losers {
            doc.close_work(id, WorkStatus::Ignore);
        }
        if let Some(group) = &activation.parallel_id {
            doc.close_group(group.clone(), node_id);
        }

        info!(
            instance_id = %activation.instance_id,
            node_id = %node_id,
            winner = ?activation.from_node,
            ignored = losers.len(),
            "OR join fired"
        );

        let mut work = Work::from_activation(activation, "OR", WorkStatus::Run);
        work.parallel_id = None;
        let work_id = doc.push_work(work);
        link_arrival(doc, activation, &work_id);

        let mut entries = Vec::new();
        if !losers.is_empty() {
            entries.push(EntryChange::DropWorks(losers));
        }
        Ok(Step {
            activations: advance(template, doc, &work_id, DEFAULT_ROUTE)?,
            messages: destroy_messages(children, &doc.instance().starter),
            entries,
        })
    }

    async fn activate_timer(
        &self,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
        timer: &TimerNode,
    ) -> Result<Step, EngineError> {
        let work_id = open_work(doc, activation, "TIMER", WorkStatus::Run);
        let now = Utc::now();
        let wake_at = match timer.delay.wake_time(doc.instance().started_at, now) {
            Ok(at) => at,
            Err(e) => {
                warn!(
                    instance_id = %activation.instance_id,
                    node_id = %activation.selector,
                    error = %e,
                    "Invalid timer delay, firing immediately"
                );
                now
            }
        };

        info!(
            instance_id = %activation.instance_id,
            node_id = %activation.selector,
            wake_at = %wake_at,
            "Timer scheduled"
        );
        Ok(Step::entry(EntryChange::SaveDelay(DelayEntry::new(
            doc.id().clone(),
            work_id,
            wake_at,
        ))))
    }

    async fn activate_sub(
        &self,
        template: &ProcessTemplate,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
        sub: &SubNode,
    ) -> Result<Step, EngineError> {
        let work_id = open_work(doc, activation, "SUB", WorkStatus::Run);
        let child_id = InstanceId::generate();
        let variables = if sub.inherit_variables {
            self.variables.values(doc.id()).await?
        } else {
            BTreeMap::new()
        };

        let instance = doc.instance();
        let start = ProcessStart {
            template_id: sub.template_id.clone(),
            starter: instance.starter.clone(),
            tenant: instance.tenant.clone(),
            variables,
        };
        let parent = ParentLink {
            instance_id: instance.id.clone(),
            work_id: work_id.clone(),
        };
        if let Some(work) = doc.work_mut(&work_id) {
            work.child_instance = Some(child_id.clone());
        }

        info!(
            instance_id = %activation.instance_id,
            node_id = %activation.selector,
            child_id = %child_id,
            child_template = %sub.template_id,
            detached = sub.detached,
            "Sub-process started"
        );

        if sub.detached {
            Ok(Step {
                activations: advance(template, doc, &work_id, DEFAULT_ROUTE)?,
                messages: vec![EngineMessage::ProcessStart {
                    instance_id: child_id,
                    start,
                    parent: None,
                }],
                entries: Vec::new(),
            })
        } else {
            Ok(Step {
                activations: Vec::new(),
                messages: vec![EngineMessage::ProcessStart {
                    instance_id: child_id,
                    start,
                    parent: Some(parent),
                }],
                entries: Vec::new(),
            })
        }
    }

    async fn activate_end(
        &self,
        doc: &mut ProcessDocument,
        activation: &NodeActivation,
    ) -> Result<Step, EngineError> {
        let mut work = Work::from_activation(activation, "END", WorkStatus::End);
        work.decision = Some(activation.route.clone());
        work.done_at = Some(Utc::now());
        let work_id = doc.push_work(work);
        link_arrival(doc, activation, &work_id);

        let open: Vec<WorkId> = doc
            .open_works()
            .filter(|w| w.id != work_id)
            .map(|w| w.id.clone())
            .collect();
        let children = attached_children(doc, &open);
        for id in &open {
            doc.close_work(id, WorkStatus::Ignore);
        }
        doc.take_parked();
        doc.set_status(InstanceStatus::Done);

        info!(
            instance_id = %activation.instance_id,
            route = %activation.route,
            closed = open.len(),
            "Process instance completed"
        );
        counter!("flow_instances_completed_total").increment(1);

        let mut messages = destroy_messages(children, &doc.instance().starter);
        if let Some(parent) = doc.instance().parent.clone() {
            messages.push(EngineMessage::ChildEnded {
                instance_id: parent.instance_id,
                work_id: parent.work_id,
                child_id: doc.id().clone(),
                decision: activation.route.clone(),
            });
        }

        Ok(Step {
            activations: Vec::new(),
            messages,
            entries: vec![EntryChange::DropInstance],
        })
    }

    // Participant operations

    async fn complete_task(
        &self,
        instance_id: &InstanceId,
        completion: TaskCompletion,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_running(&doc)?;

        let task = owned_running_task(&doc, &completion.task_id, &completion.actor, "complete")?;
        let work = doc
            .work(&task.work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(task.work_id.as_str()))?;

        if work.status != WorkStatus::Run {
            if let Some(stale) = doc.task_mut(&task.id) {
                stale.status = work.status;
                stale.done_at = Some(Utc::now());
            }
            warn!(
                instance_id = %instance_id,
                task_id = %task.id,
                work_status = %work.status,
                "Task was still open on a closed work, corrected"
            );
            self.finish(doc, Step::default()).await?;
            return Err(EngineError::state_conflict(
                format!("work {}", work.id),
                WorkStatus::Run,
                work.status,
            ));
        }

        let template = self.template_of(&doc).await?;
        let action = match template.node(&work.node_id).map(|n| &n.kind) {
            Some(NodeKind::Action(action)) => action.clone(),
            _ => {
                return Err(EngineError::validation(format!(
                    "Node '{}' does not accept task completions",
                    work.node_id
                )))
            }
        };

        if let Some(done) = doc.task_mut(&task.id) {
            done.status = WorkStatus::Done;
            done.decision = Some(completion.decision.clone());
            done.comment = completion.comment.clone();
            done.done_at = Some(Utc::now());
        }
        self.variables
            .write_values(
                instance_id,
                work.id.as_str(),
                &completion.actor,
                &completion.variables,
            )
            .await?;

        info!(
            instance_id = %instance_id,
            task_id = %task.id,
            actor = %completion.actor,
            decision = %completion.decision,
            "Task completed"
        );

        let step = match completion_outcome(&doc, &work.id, &action, &completion.decision) {
            VoteOutcome::Decided(decision) => {
                doc.close_sibling_tasks(&work.id, &task.id, WorkStatus::Ignore);
                info!(
                    instance_id = %instance_id,
                    work_id = %work.id,
                    decision = %decision,
                    "Work completed"
                );
                Step::activations(advance(&template, &mut doc, &work.id, &decision)?)
            }
            VoteOutcome::Waiting => {
                debug!(
                    instance_id = %instance_id,
                    work_id = %work.id,
                    "Waiting for remaining participants"
                );
                Step::default()
            }
        };

        self.finish(doc, step).await
    }

    async fn transfer_task(
        &self,
        instance_id: &InstanceId,
        task_id: &TaskId,
        actor: &str,
        to: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_running(&doc)?;

        let task = owned_running_task(&doc, task_id, actor, "transfer")?;
        if !task.transferable {
            return Err(EngineError::validation(format!(
                "Task {} is not transferable",
                task_id
            )));
        }
        let to = to.trim();
        if to.is_empty() {
            return Err(EngineError::validation("Transfer target must not be empty"));
        }

        if let Some(moved) = doc.task_mut(task_id) {
            moved.participant = to.to_string();
        }
        info!(
            instance_id = %instance_id,
            task_id = %task_id,
            from = %actor,
            to = %to,
            "Task transferred"
        );

        self.notify(Notification {
            kind: NotificationKind::Assigned,
            instance_id: instance_id.clone(),
            work_id: task.work_id.clone(),
            node_id: task.node_id.clone(),
            recipients: vec![to.to_string()],
            subject: format!("Task transferred by {}", actor),
            body: String::new(),
        })
        .await;

        self.finish(doc, Step::default()).await
    }

    async fn revoke(
        &self,
        instance_id: &InstanceId,
        work_id: &WorkId,
        actor: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_running(&doc)?;
        let template = self.template_of(&doc).await?;

        let work = doc
            .work(work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(work_id.as_str()))?;
        let is_action = |node_id: &str| template.node(node_id).is_some_and(|n| n.kind.is_action());
        let is_and = |node_id: &str| template.node(node_id).is_some_and(|n| n.kind.is_and());

        if !is_action(&work.node_id) {
            return Err(EngineError::not_revocable(format!(
                "node '{}' is not an ACTION",
                work.node_id
            )));
        }
        if work.status != WorkStatus::Done {
            return Err(EngineError::state_conflict(
                format!("work {}", work_id),
                WorkStatus::Done,
                work.status,
            ));
        }
        if !doc
            .tasks_for_work(work_id)
            .any(|t| t.participant == actor && t.status == WorkStatus::Done)
        {
            return Err(EngineError::permission(actor, format!("revoke work {}", work_id)));
        }

        let followers: Vec<Work> = doc.followers(work_id).cloned().collect();
        for follower in &followers {
            if is_and(&follower.node_id) {
                return Err(EngineError::not_revocable(format!(
                    "follower '{}' is an AND join",
                    follower.node_id
                )));
            }
            if follower.status != WorkStatus::Run {
                return Err(EngineError::not_revocable(format!(
                    "follower '{}' is already {}",
                    follower.node_id, follower.status
                )));
            }
            if follower.child_instance.is_some() {
                return Err(EngineError::not_revocable(format!(
                    "follower '{}' started a sub-process",
                    follower.node_id
                )));
            }
        }

        let follower_ids: Vec<WorkId> = followers.iter().map(|w| w.id.clone()).collect();
        for trace in doc
            .traces_from_work(work_id)
            .filter(|t| t.status == TraceStatus::Pass)
        {
            if is_and(&trace.to_node) {
                return Err(EngineError::not_revocable(format!(
                    "route into AND join '{}'",
                    trace.to_node
                )));
            }
            match &trace.to_work {
                None => {
                    return Err(EngineError::not_revocable(format!(
                        "activation of '{}' still in flight",
                        trace.to_node
                    )))
                }
                Some(to_work) if !follower_ids.contains(to_work) => {
                    return Err(EngineError::not_revocable(format!(
                        "'{}' was merged into another branch",
                        trace.to_node
                    )))
                }
                Some(_) => {}
            }
        }

        let mut purged = follower_ids.clone();
        purged.push(work_id.clone());

        doc.remove_works(&follower_ids);
        doc.remove_traces_from(std::slice::from_ref(work_id));
        doc.close_work(work_id, WorkStatus::Revoked);

        info!(
            instance_id = %instance_id,
            work_id = %work_id,
            actor = %actor,
            removed = follower_ids.len(),
            "Work revoked"
        );
        counter!("flow_revokes_total").increment(1);

        let reopened = work.to_activation(instance_id, &doc.instance().template_id);
        let step = Step {
            activations: vec![reopened],
            messages: Vec::new(),
            entries: vec![
                EntryChange::DropWorks(follower_ids),
                EntryChange::PurgeVariables(purged),
            ],
        };
        self.finish(doc, step).await
    }

    async fn sendback(
        &self,
        instance_id: &InstanceId,
        task_id: &TaskId,
        actor: &str,
        comment: Option<String>,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        require_running(&doc)?;
        let template = self.template_of(&doc).await?;

        let task = owned_running_task(&doc, task_id, actor, "send back")?;
        let work = doc
            .work(&task.work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(task.work_id.as_str()))?;
        if work.status != WorkStatus::Run {
            return Err(EngineError::state_conflict(
                format!("work {}", work.id),
                WorkStatus::Run,
                work.status,
            ));
        }

        let mut walk = BackWalk::default();
        let mut visited = HashSet::new();
        walk_back(&template, &doc, &work.id, &mut visited, &mut walk);
        if walk.actions.is_empty() {
            return Err(EngineError::validation(format!(
                "No ACTION node precedes '{}'",
                work.node_id
            )));
        }

        doc.close_work(&work.id, WorkStatus::Returned);
        if let Some(returned) = doc.task_mut(task_id) {
            returned.comment = comment;
        }
        for id in &walk.dead_ends {
            doc.close_work(id, WorkStatus::Returned);
        }
        doc.remove_traces(&walk.traces);
        self.variables
            .purge_works(instance_id, std::slice::from_ref(&work.id))
            .await?;

        let template_id = doc.instance().template_id.clone();
        let activations: Vec<NodeActivation> = walk
            .actions
            .iter()
            .filter_map(|id| doc.work(id))
            .map(|w| w.to_activation(instance_id, &template_id))
            .collect();

        info!(
            instance_id = %instance_id,
            work_id = %work.id,
            actor = %actor,
            targets = ?activations.iter().map(|a| a.selector.as_str()).collect::<Vec<_>>(),
            "Work sent back"
        );

        self.finish(doc, Step::activations(activations)).await
    }

    // Re-entry

    async fn timer_fired(
        &self,
        instance_id: &InstanceId,
        delay_id: &DelayId,
        work_id: &WorkId,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = match self.repository.get_document(instance_id).await? {
            Some(doc) if !doc.status().is_terminal() => doc,
            _ => {
                debug!(instance_id = %instance_id, delay_id = %delay_id, "Dropping timer of finished instance");
                self.repository.delete_delay(delay_id).await?;
                return Ok(Vec::new());
            }
        };

        let running = doc
            .work(work_id)
            .is_some_and(|w| w.status == WorkStatus::Run);
        let step = if running {
            let template = self.template_of(&doc).await?;
            info!(instance_id = %instance_id, work_id = %work_id, "Timer fired");
            Step::activations(advance(&template, &mut doc, work_id, DEFAULT_ROUTE)?)
        } else {
            debug!(
                instance_id = %instance_id,
                work_id = %work_id,
                "Timer fired for a work that is no longer running"
            );
            Step::default()
        };

        let messages = self.finish(doc, step).await?;
        self.repository.delete_delay(delay_id).await?;
        Ok(messages)
    }

    async fn callback(
        &self,
        instance_id: &InstanceId,
        result: CallbackResult,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let entry = self
            .repository
            .get_callback(&result.callback_id)
            .await?
            .ok_or_else(|| EngineError::callback_not_found(result.callback_id.as_str()))?;
        if &entry.instance_id != instance_id {
            return Err(EngineError::validation(format!(
                "Callback {} does not belong to instance {}",
                entry.id, instance_id
            )));
        }

        let mut doc = self.load(instance_id).await?;
        if doc.status().is_terminal() {
            self.repository.delete_callback(&entry.id).await?;
            return Err(EngineError::not_running(doc.status()));
        }

        let work = doc
            .work(&entry.work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(entry.work_id.as_str()))?;
        if work.status != WorkStatus::Wait {
            return Err(EngineError::state_conflict(
                format!("work {}", work.id),
                WorkStatus::Wait,
                work.status,
            ));
        }

        let template = self.template_of(&doc).await?;
        self.variables
            .write_values(instance_id, work.id.as_str(), CALLBACK_WRITER, &result.variables)
            .await?;

        info!(
            instance_id = %instance_id,
            work_id = %work.id,
            callback_id = %entry.id,
            decision = %result.decision,
            "Callback received"
        );

        let step = Step::activations(advance(&template, &mut doc, &work.id, &result.decision)?);
        let messages = self.finish(doc, step).await?;
        self.repository.delete_callback(&entry.id).await?;
        Ok(messages)
    }

    async fn child_ended(
        &self,
        instance_id: &InstanceId,
        work_id: &WorkId,
        child_id: &InstanceId,
        decision: &str,
    ) -> Result<Vec<EngineMessage>, EngineError> {
        let mut doc = self.load(instance_id).await?;
        if doc.status().is_terminal() {
            debug!(
                instance_id = %instance_id,
                child_id = %child_id,
                "Parent already finished, ignoring child completion"
            );
            return Ok(Vec::new());
        }

        let work = doc
            .work(work_id)
            .cloned()
            .ok_or_else(|| EngineError::work_not_found(work_id.as_str()))?;
        if work.status != WorkStatus::Run || work.child_instance.as_ref() != Some(child_id) {
            return Err(EngineError::state_conflict(
                format!("work {}", work_id),
                format!("RUN waiting on {}", child_id),
                work.status,
            ));
        }

        let template = self.template_of(&doc).await?;
        let values = self.variables.values(child_id).await?;
        self.variables
            .write_values(
                instance_id,
                work_id.as_str(),
                &format!("sub:{}", child_id),
                &values,
            )
            .await?;

        info!(
            instance_id = %instance_id,
            work_id = %work_id,
            child_id = %child_id,
            decision = %decision,
            "Sub-process finished"
        );

        let step = Step::activations(advance(&template, &mut doc, work_id, decision)?);
        self.finish(doc, step).await
    }
}

#[async_trait]
impl MessageHandler for ProcessEngine {
    async fn handle(&self, message: EngineMessage) -> Result<Vec<EngineMessage>, EngineError> {
        match message {
            EngineMessage::ProcessStart {
                instance_id,
                start,
                parent,
            } => self.start(instance_id, start, parent).await,
            EngineMessage::NodeActivate(activation) => self.activate(activation).await,
            EngineMessage::CompleteTask {
                instance_id,
                completion,
            } => self.complete_task(&instance_id, completion).await,
            EngineMessage::TransferTask {
                instance_id,
                task_id,
                actor,
                to,
            } => self.transfer_task(&instance_id, &task_id, &actor, &to).await,
            EngineMessage::Revoke {
                instance_id,
                work_id,
                actor,
            } => self.revoke(&instance_id, &work_id, &actor).await,
            EngineMessage::Sendback {
                instance_id,
                task_id,
                actor,
                comment,
            } => self.sendback(&instance_id, &task_id, &actor, comment).await,
            EngineMessage::TimerFired {
                instance_id,
                delay_id,
                work_id,
            } => self.timer_fired(&instance_id, &delay_id, &work_id).await,
            EngineMessage::Callback {
                instance_id,
                result,
            } => self.callback(&instance_id, result).await,
            EngineMessage::ChildEnded {
                instance_id,
                work_id,
                child_id,
                decision,
            } => {
                self.child_ended(&instance_id, &work_id, &child_id, &decision)
                    .await
            }
            EngineMessage::Pause { instance_id, actor } => self.pause(&instance_id, &actor).await,
            EngineMessage::Resume { instance_id, actor } => self.resume(&instance_id, &actor).await,
            EngineMessage::Destroy { instance_id, actor } => {
                self.destroy(&instance_id, &actor).await
            }
        }
    }
}

fn require_running(doc: &ProcessDocument) -> Result<(), EngineError> {
    match doc.status() {
        InstanceStatus::Run => Ok(()),
        status => Err(EngineError::not_running(status)),
    }
}

fn require_starter(doc: &ProcessDocument, actor: &str, action: &str) -> Result<(), EngineError> {
    if doc.instance().starter == actor {
        Ok(())
    } else {
        Err(EngineError::permission(
            actor,
            format!("{} instance {}", action, doc.id()),
        ))
    }
}

/// A RUN task owned by `actor`
fn owned_running_task(
    doc: &ProcessDocument,
    task_id: &TaskId,
    actor: &str,
    action: &str,
) -> Result<Task, EngineError> {
    let task = doc
        .task(task_id)
        .cloned()
        .ok_or_else(|| EngineError::task_not_found(task_id.as_str()))?;
    if task.participant != actor {
        return Err(EngineError::permission(
            actor,
            format!("{} task {}", action, task_id),
        ));
    }
    if task.status != WorkStatus::Run {
        return Err(EngineError::state_conflict(
            format!("task {}", task_id),
            WorkStatus::Run,
            task.status,
        ));
    }
    Ok(task)
}

/// Route the activations out; held while paused, dropped once finished
fn dispatch(doc: &mut ProcessDocument, activations: Vec<NodeActivation>) -> Vec<EngineMessage> {
    match doc.status() {
        InstanceStatus::Run => activations
            .into_iter()
            .map(EngineMessage::NodeActivate)
            .collect(),
        InstanceStatus::Pause => {
            for activation in activations {
                doc.park(activation);
            }
            Vec::new()
        }
        InstanceStatus::Stop | InstanceStatus::Done => Vec::new(),
    }
}

/// Complete a work and route out of it
fn advance(
    template: &ProcessTemplate,
    doc: &mut ProcessDocument,
    work_id: &WorkId,
    decision: &str,
) -> Result<Vec<NodeActivation>, EngineError> {
    if !doc.complete_work(work_id, decision) {
        return Err(EngineError::work_not_found(work_id.as_str()));
    }
    let plan = route_next(template, doc, work_id, &decision_labels(decision))?;
    if plan.pruned > 0 {
        debug!(
            instance_id = %doc.id(),
            work_id = %work_id,
            pruned = plan.pruned,
            "Pruned traces of earlier rounds"
        );
    }
    Ok(plan.activations)
}

fn open_work(
    doc: &mut ProcessDocument,
    activation: &NodeActivation,
    node_type: &str,
    status: WorkStatus,
) -> WorkId {
    let work_id = doc.push_work(Work::from_activation(activation, node_type, status));
    link_arrival(doc, activation, &work_id);
    work_id
}

/// Bind the arrival's trace to the work it reached
fn link_arrival(doc: &mut ProcessDocument, activation: &NodeActivation, work_id: &WorkId) {
    let (Some(from_node), Some(from_work)) = (&activation.from_node, &activation.from_work) else {
        return;
    };
    if doc.attach_trace(from_work, &activation.selector, activation.round, work_id) {
        return;
    }
    // Redirected or re-dispatched activations carry no pending trace
    doc.push_trace(
        from_node,
        from_work,
        &activation.selector,
        &activation.route,
        TraceStatus::Pass,
        activation.round,
    );
    doc.attach_trace(from_work, &activation.selector, activation.round, work_id);
}

fn activate_and(
    template: &ProcessTemplate,
    doc: &mut ProcessDocument,
    activation: &NodeActivation,
    and: &AndNode,
) -> Result<Step, EngineError> {
    let node_id = activation.selector.as_str();

    let work_id = match doc.running_work_for_node(node_id).map(|w| w.id.clone()) {
        Some(existing) => {
            link_arrival(doc, activation, &existing);
            existing
        }
        None => {
            let mut work = Work::from_activation(activation, "AND", WorkStatus::Run);
            work.parallel_id = None;
            let id = doc.push_work(work);
            link_arrival(doc, activation, &id);
            id
        }
    };

    // Loops in one branch must not let extra arrivals of another round count
    let ceiling = and
        .counterpart
        .as_deref()
        .and_then(|counterpart| doc.max_round(counterpart))
        .unwrap_or(activation.round);
    let expected = template.inbound_sources(node_id).len();
    let arrived = doc
        .traces_into_work(&work_id)
        .filter(|t| t.status == TraceStatus::Pass && t.round <= ceiling)
        .map(|t| t.from_node.as_str())
        .collect::<HashSet<_>>()
        .len();

    debug!(
        instance_id = %activation.instance_id,
        node_id = %node_id,
        arrived = arrived,
        expected = expected,
        ceiling = ceiling,
        "AND join evaluated"
    );

    if arrived < expected {
        return Ok(Step::default());
    }
    Ok(Step::activations(advance(
        template,
        doc,
        &work_id,
        DEFAULT_ROUTE,
    )?))
}

/// Decide a work from its tasks, per the node's completion policy
fn completion_outcome(
    doc: &ProcessDocument,
    work_id: &WorkId,
    action: &ActionNode,
    decision: &str,
) -> VoteOutcome {
    let mut tasks: Vec<&Task> = doc
        .tasks_for_work(work_id)
        .filter(|t| matches!(t.status, WorkStatus::Run | WorkStatus::Done))
        .collect();
    if tasks.len() <= 1 || !action.require_all {
        return VoteOutcome::Decided(decision.to_string());
    }

    tasks.sort_by_key(|t| (t.status != WorkStatus::Done, t.done_at));
    let ballots: Vec<Option<&str>> = tasks
        .iter()
        .map(|t| match t.status {
            WorkStatus::Done => t.decision.as_deref(),
            _ => None,
        })
        .collect();

    let everyone = || {
        if ballots.iter().all(Option::is_some) {
            VoteOutcome::Decided(decision.to_string())
        } else {
            VoteOutcome::Waiting
        }
    };

    match action.vote.as_deref().map(str::parse::<VoteRule>) {
        Some(Ok(rule)) => rule.evaluate(&ballots),
        Some(Err(e)) => {
            warn!(work_id = %work_id, error = %e, "Invalid vote function, waiting for everyone");
            everyone()
        }
        None => everyone(),
    }
}

/// Child instances still attached to the given works
fn attached_children(doc: &ProcessDocument, works: &[WorkId]) -> Vec<InstanceId> {
    works
        .iter()
        .filter_map(|id| doc.work(id))
        .filter(|w| w.node_type == "SUB")
        .filter_map(|w| w.child_instance.clone())
        .collect()
}

fn destroy_messages(children: Vec<InstanceId>, starter: &str) -> Vec<EngineMessage> {
    children
        .into_iter()
        .map(|instance_id| EngineMessage::Destroy {
            instance_id,
            actor: starter.to_string(),
        })
        .collect()
}

#[derive(Debug, Default)]
struct BackWalk {
    /// Nearest ACTION predecessors to re-activate
    actions: Vec<WorkId>,
    /// Non-action predecessors with no ACTION behind them
    dead_ends: Vec<WorkId>,
    traces: Vec<u64>,
}

fn walk_back(
    template: &ProcessTemplate,
    doc: &ProcessDocument,
    work_id: &WorkId,
    visited: &mut HashSet<WorkId>,
    walk: &mut BackWalk,
) -> bool {
    let incoming: Vec<(u64, WorkId)> = doc
        .traces_into_work(work_id)
        .filter(|t| t.status == TraceStatus::Pass)
        .map(|t| (t.seq, t.from_work.clone()))
        .collect();

    let mut found = false;
    for (seq, from_work) in incoming {
        walk.traces.push(seq);
        if !visited.insert(from_work.clone()) {
            continue;
        }
        let Some(predecessor) = doc.work(&from_work) else {
            continue;
        };

        if template
            .node(&predecessor.node_id)
            .is_some_and(|n| n.kind.is_action())
        {
            walk.actions.push(from_work);
            found = true;
        } else if walk_back(template, doc, &from_work, visited, walk) {
            found = true;
        } else {
            walk.dead_ends.push(from_work);
        }
    }
    found
}
