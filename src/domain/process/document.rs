//! Document model of one running instance
//!
//! A [`ProcessDocument`] holds the instance header plus the growing record of
//! Work items, per-participant Tasks and Route-Trace rows. Rows are appended
//! as the instance advances; only revoke and sendback remove rows.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{InstanceId, ParallelGroupId, TaskId, TemplateId, WorkId};
use super::message::NodeActivation;

/// Lifecycle status of an instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Run,
    Pause,
    Stop,
    Done,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Pause => "PAUSE",
            Self::Stop => "STOP",
            Self::Done => "DONE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::Done)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a Work item or Task; exactly one at any time
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkStatus {
    Run,
    Done,
    Pause,
    Stop,
    Ignore,
    Returned,
    Revoked,
    End,
    Wait,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Done => "DONE",
            Self::Pause => "PAUSE",
            Self::Stop => "STOP",
            Self::Ignore => "IGNORE",
            Self::Returned => "RETURNED",
            Self::Revoked => "REVOKED",
            Self::End => "END",
            Self::Wait => "WAIT",
        }
    }

    /// Still awaiting progress (RUN or WAIT)
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Run | Self::Wait)
    }
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a Route-Trace row
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceStatus {
    Pass,
    Ignore,
}

/// Link from a child instance back to the SUB work that spawned it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: InstanceId,
    pub work_id: WorkId,
}

/// Instance header
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    pub status: InstanceStatus,
    pub starter: String,
    pub tenant: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,

    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(
        id: InstanceId,
        template_id: TemplateId,
        starter: impl Into<String>,
        tenant: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            template_id,
            status: InstanceStatus::Run,
            starter: starter.into(),
            tenant: tenant.into(),
            parent: None,
            started_at: now,
            updated_at: now,
            ended_at: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// One occurrence of a template node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub id: WorkId,
    pub node_id: String,
    pub node_type: String,
    pub status: WorkStatus,
    pub round: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_work: Option<WorkId>,

    /// Route label this work was reached by
    pub route: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<ParallelGroupId>,

    /// Decision the work completed with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_instance: Option<InstanceId>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
}

impl Work {
    /// Create a work from the activation that produced it
    pub fn from_activation(
        activation: &NodeActivation,
        node_type: &str,
        status: WorkStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkId::generate(),
            node_id: activation.selector.clone(),
            node_type: node_type.to_string(),
            status,
            round: activation.round,
            from_node: activation.from_node.clone(),
            from_work: activation.from_work.clone(),
            route: activation.route.clone(),
            parallel_id: activation.parallel_id.clone(),
            decision: None,
            child_instance: None,
            created_at: now,
            done_at: if status == WorkStatus::Done { Some(now) } else { None },
        }
    }

    /// Rebuild the activation that produced this work
    pub fn to_activation(&self, instance_id: &InstanceId, template_id: &TemplateId) -> NodeActivation {
        NodeActivation {
            instance_id: instance_id.clone(),
            template_id: template_id.clone(),
            selector: self.node_id.clone(),
            from_node: self.from_node.clone(),
            from_work: self.from_work.clone(),
            route: self.route.clone(),
            round: self.round,
            parallel_id: self.parallel_id.clone(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }
}

/// One participant's obligation against a work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub work_id: WorkId,
    pub node_id: String,
    pub participant: String,
    pub status: WorkStatus,
    pub round: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default)]
    pub transferable: bool,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(work: &Work, participant: impl Into<String>, transferable: bool) -> Self {
        Self {
            id: TaskId::generate(),
            work_id: work.id.clone(),
            node_id: work.node_id.clone(),
            participant: participant.into(),
            status: WorkStatus::Run,
            round: work.round,
            decision: None,
            comment: None,
            transferable,
            created_at: Utc::now(),
            done_at: None,
        }
    }
}

/// Append-only record of an edge traversal or explicit ignore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTrace {
    pub seq: u64,
    pub from_node: String,
    pub from_work: WorkId,
    pub to_node: String,

    /// Set once the target work exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_work: Option<WorkId>,

    pub route: String,
    pub status: TraceStatus,
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

/// Serialized shape of a document; indices are derived on load
/// A parallel group some OR join already fired for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedGroup {
    pub group: ParallelGroupId,
    pub join: String,
}

#[derive(Serialize, Deserialize)]
struct StoredDocument {
    instance: Instance,
    #[serde(default)]
    works: Vec<Work>,
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    traces: Vec<RouteTrace>,
    #[serde(default)]
    parked: Vec<NodeActivation>,
    #[serde(default)]
    closed_groups: Vec<ClosedGroup>,
    #[serde(default)]
    next_trace_seq: u64,
}

/// In-memory document of one running instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredDocument", into = "StoredDocument")]
pub struct ProcessDocument {
    instance: Instance,
    works: Vec<Work>,
    tasks: Vec<Task>,
    traces: Vec<RouteTrace>,
    parked: Vec<NodeActivation>,
    closed_groups: Vec<ClosedGroup>,
    next_trace_seq: u64,
    by_node: HashMap<String, Vec<usize>>,
    by_from_work: HashMap<WorkId, Vec<usize>>,
}

impl From<StoredDocument> for ProcessDocument {
    fn from(stored: StoredDocument) -> Self {
        let mut doc = Self {
            instance: stored.instance,
            works: stored.works,
            tasks: stored.tasks,
            traces: stored.traces,
            parked: stored.parked,
            closed_groups: stored.closed_groups,
            next_trace_seq: stored.next_trace_seq,
            by_node: HashMap::new(),
            by_from_work: HashMap::new(),
        };
        doc.reindex();
        doc
    }
}

impl From<ProcessDocument> for StoredDocument {
    fn from(doc: ProcessDocument) -> Self {
        Self {
            instance: doc.instance,
            works: doc.works,
            tasks: doc.tasks,
            traces: doc.traces,
            parked: doc.parked,
            closed_groups: doc.closed_groups,
            next_trace_seq: doc.next_trace_seq,
        }
    }
}

impl ProcessDocument {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            works: Vec::new(),
            tasks: Vec::new(),
            traces: Vec::new(),
            parked: Vec::new(),
            closed_groups: Vec::new(),
            next_trace_seq: 1,
            by_node: HashMap::new(),
            by_from_work: HashMap::new(),
        }
    }

    fn reindex(&mut self) {
        self.by_node.clear();
        self.by_from_work.clear();
        for (idx, work) in self.works.iter().enumerate() {
            self.by_node.entry(work.node_id.clone()).or_default().push(idx);
            if let Some(from) = &work.from_work {
                self.by_from_work.entry(from.clone()).or_default().push(idx);
            }
        }
        let max_seq = self.traces.iter().map(|t| t.seq).max().unwrap_or(0);
        self.next_trace_seq = self.next_trace_seq.max(max_seq + 1);
    }

    // Instance header

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }

    pub fn status(&self) -> InstanceStatus {
        self.instance.status
    }

    pub fn set_status(&mut self, status: InstanceStatus) {
        let now = Utc::now();
        self.instance.status = status;
        self.instance.updated_at = now;
        if status.is_terminal() {
            self.instance.ended_at = Some(now);
        }
    }

    pub fn touch(&mut self) {
        self.instance.updated_at = Utc::now();
    }

    // Works

    pub fn works(&self) -> &[Work] {
        &self.works
    }

    pub fn work(&self, id: &WorkId) -> Option<&Work> {
        self.works.iter().find(|w| &w.id == id)
    }

    pub fn work_mut(&mut self, id: &WorkId) -> Option<&mut Work> {
        self.works.iter_mut().find(|w| &w.id == id)
    }

    pub fn push_work(&mut self, work: Work) -> WorkId {
        let idx = self.works.len();
        let id = work.id.clone();
        self.by_node.entry(work.node_id.clone()).or_default().push(idx);
        if let Some(from) = &work.from_work {
            self.by_from_work.entry(from.clone()).or_default().push(idx);
        }
        self.works.push(work);
        id
    }

    /// Works of a node in creation order
    pub fn works_for_node<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Work> + 'a {
        self.by_node
            .get(node_id)
            .map(|idx| idx.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&i| &self.works[i])
    }

    /// Latest round any occurrence of the node reached
    pub fn max_round(&self, node_id: &str) -> Option<u32> {
        self.works_for_node(node_id).map(|w| w.round).max()
    }

    /// Whether the node already completed at or after `round`
    pub fn done_at_or_after(&self, node_id: &str, round: u32) -> bool {
        self.works_for_node(node_id)
            .any(|w| w.status == WorkStatus::Done && w.round >= round)
    }

    /// Whether the node completed in any round
    pub fn ever_done(&self, node_id: &str) -> bool {
        self.works_for_node(node_id)
            .any(|w| w.status == WorkStatus::Done)
    }

    /// Whether the node completed before `round`
    pub fn done_before(&self, node_id: &str, round: u32) -> bool {
        self.works_for_node(node_id)
            .any(|w| w.status == WorkStatus::Done && w.round < round)
    }

    /// Open (RUN) occurrence of a node, if any
    pub fn running_work_for_node(&self, node_id: &str) -> Option<&Work> {
        self.works_for_node(node_id)
            .find(|w| w.status == WorkStatus::Run)
    }

    /// Works created directly after the given work
    pub fn followers<'a>(&'a self, work_id: &WorkId) -> impl Iterator<Item = &'a Work> + 'a {
        self.by_from_work
            .get(work_id)
            .map(|idx| idx.as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&i| &self.works[i])
    }

    pub fn open_works(&self) -> impl Iterator<Item = &Work> {
        self.works.iter().filter(|w| w.is_open())
    }

    /// Open works sharing a parallel group
    pub fn open_works_in_group<'a>(
        &'a self,
        group: &'a ParallelGroupId,
    ) -> impl Iterator<Item = &'a Work> + 'a {
        self.works
            .iter()
            .filter(move |w| w.is_open() && w.parallel_id.as_ref() == Some(group))
    }

    /// Set a work's status and cascade it onto its still-RUN tasks
    pub fn close_work(&mut self, work_id: &WorkId, status: WorkStatus) -> bool {
        let now = Utc::now();
        let Some(work) = self.work_mut(work_id) else {
            return false;
        };
        work.status = status;
        work.done_at = Some(now);

        for task in self.tasks.iter_mut().filter(|t| &t.work_id == work_id) {
            if task.status == WorkStatus::Run {
                task.status = status;
                task.done_at = Some(now);
            }
        }
        true
    }

    /// Mark a work DONE with the decision it completed with
    pub fn complete_work(&mut self, work_id: &WorkId, decision: &str) -> bool {
        let now = Utc::now();
        match self.work_mut(work_id) {
            Some(work) => {
                work.status = WorkStatus::Done;
                work.decision = Some(decision.to_string());
                work.done_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// Remove works together with their tasks and outbound traces
    pub fn remove_works(&mut self, ids: &[WorkId]) {
        if ids.is_empty() {
            return;
        }
        self.works.retain(|w| !ids.contains(&w.id));
        self.tasks.retain(|t| !ids.contains(&t.work_id));
        self.traces.retain(|t| !ids.contains(&t.from_work));
        self.reindex();
    }

    // Tasks

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn push_task(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    pub fn tasks_for_work<'a>(&'a self, work_id: &'a WorkId) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks.iter().filter(move |t| &t.work_id == work_id)
    }

    /// Set every still-RUN task of a work (except one) to `status`
    pub fn close_sibling_tasks(&mut self, work_id: &WorkId, except: &TaskId, status: WorkStatus) {
        let now = Utc::now();
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| &t.work_id == work_id && &t.id != except && t.status == WorkStatus::Run)
        {
            task.status = status;
            task.done_at = Some(now);
        }
    }

    // Route traces

    pub fn traces(&self) -> &[RouteTrace] {
        &self.traces
    }

    /// Append a trace row and return its sequence number
    pub fn push_trace(
        &mut self,
        from_node: &str,
        from_work: &WorkId,
        to_node: &str,
        route: &str,
        status: TraceStatus,
        round: u32,
    ) -> u64 {
        let seq = self.next_trace_seq;
        self.next_trace_seq += 1;
        self.traces.push(RouteTrace {
            seq,
            from_node: from_node.to_string(),
            from_work: from_work.clone(),
            to_node: to_node.to_string(),
            to_work: None,
            route: route.to_string(),
            status,
            round,
            created_at: Utc::now(),
        });
        seq
    }

    /// Bind the pending PASS trace of an activation to the work it created
    pub fn attach_trace(&mut self, from_work: &WorkId, to_node: &str, round: u32, to_work: &WorkId) -> bool {
        match self.traces.iter_mut().rev().find(|t| {
            &t.from_work == from_work
                && t.to_node == to_node
                && t.round == round
                && t.status == TraceStatus::Pass
                && t.to_work.is_none()
        }) {
            Some(trace) => {
                trace.to_work = Some(to_work.clone());
                true
            }
            None => false,
        }
    }

    pub fn traces_to<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a RouteTrace> + 'a {
        self.traces.iter().filter(move |t| t.to_node == node_id)
    }

    pub fn traces_into_work<'a>(&'a self, work_id: &'a WorkId) -> impl Iterator<Item = &'a RouteTrace> + 'a {
        self.traces
            .iter()
            .filter(move |t| t.to_work.as_ref() == Some(work_id))
    }

    pub fn traces_from_work<'a>(&'a self, work_id: &'a WorkId) -> impl Iterator<Item = &'a RouteTrace> + 'a {
        self.traces.iter().filter(move |t| &t.from_work == work_id)
    }

    /// Drop traces into `node_id` from rounds before `round` that can no
    /// longer count towards a join: IGNORE rows and rows already consumed by
    /// a closed work. Pending and open-work rows are kept.
    pub fn prune_stale_traces(&mut self, node_id: &str, round: u32) -> usize {
        let open: HashSet<WorkId> = self
            .works
            .iter()
            .filter(|w| w.is_open())
            .map(|w| w.id.clone())
            .collect();

        let before = self.traces.len();
        self.traces.retain(|t| {
            let stale = t.to_node == node_id
                && t.round < round
                && (t.status == TraceStatus::Ignore
                    || t.to_work.as_ref().is_some_and(|w| !open.contains(w)));
            !stale
        });
        before - self.traces.len()
    }

    /// Turn the pending PASS trace of a discarded activation into IGNORE
    pub fn discard_pending_trace(&mut self, from_work: &WorkId, to_node: &str, round: u32) -> bool {
        match self.traces.iter_mut().rev().find(|t| {
            &t.from_work == from_work
                && t.to_node == to_node
                && t.round == round
                && t.status == TraceStatus::Pass
                && t.to_work.is_none()
        }) {
            Some(trace) => {
                trace.status = TraceStatus::Ignore;
                true
            }
            None => false,
        }
    }

    pub fn remove_traces_from(&mut self, work_ids: &[WorkId]) {
        self.traces.retain(|t| !work_ids.contains(&t.from_work));
    }

    pub fn remove_traces(&mut self, seqs: &[u64]) {
        self.traces.retain(|t| !seqs.contains(&t.seq));
    }

    // Parallel groups settled by an OR join

    pub fn close_group(&mut self, group: ParallelGroupId, join: &str) {
        if !self
            .closed_groups
            .iter()
            .any(|c| c.group == group && c.join == join)
        {
            self.closed_groups.push(ClosedGroup {
                group,
                join: join.to_string(),
            });
        }
    }

    /// OR joins that already fired for the group
    pub fn closing_joins<'a>(&'a self, group: &'a ParallelGroupId) -> impl Iterator<Item = &'a str> + 'a {
        self.closed_groups
            .iter()
            .filter(move |c| &c.group == group)
            .map(|c| c.join.as_str())
    }

    // Activations held while the instance is paused

    pub fn park(&mut self, activation: NodeActivation) {
        self.parked.push(activation);
    }

    pub fn parked(&self) -> &[NodeActivation] {
        &self.parked
    }

    pub fn take_parked(&mut self) -> Vec<NodeActivation> {
        std::mem::take(&mut self.parked)
    }
}
