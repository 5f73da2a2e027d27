//! Messages carried on the engine bus and the durable re-entry entries

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{CallbackId, DelayId, InstanceId, ParallelGroupId, TaskId, TemplateId, WorkId};
use super::template::DEFAULT_ROUTE;

/// Request to activate one node of one instance (topic `node-activate`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeActivation {
    pub instance_id: InstanceId,
    pub template_id: TemplateId,

    /// Node to activate
    pub selector: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_node: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_work: Option<WorkId>,

    /// Route label the activation arrived by
    pub route: String,

    pub round: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_id: Option<ParallelGroupId>,
}

impl NodeActivation {
    /// Activation of a template's entry node
    pub fn entry(instance_id: InstanceId, template_id: TemplateId, selector: impl Into<String>) -> Self {
        Self {
            instance_id,
            template_id,
            selector: selector.into(),
            from_node: None,
            from_work: None,
            route: DEFAULT_ROUTE.to_string(),
            round: 0,
            parallel_id: None,
        }
    }
}

/// Initial parameters for a new instance (topic `process-start`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStart {
    pub template_id: TemplateId,

    /// Principal starting the instance
    pub starter: String,

    #[serde(default = "default_tenant")]
    pub tenant: String,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

pub fn default_tenant() -> String {
    "default".to_string()
}

impl ProcessStart {
    pub fn new(template_id: TemplateId, starter: impl Into<String>) -> Self {
        Self {
            template_id,
            starter: starter.into(),
            tenant: default_tenant(),
            variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }
}

/// One participant finishing a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub actor: String,
    pub decision: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl TaskCompletion {
    pub fn new(task_id: TaskId, actor: impl Into<String>, decision: impl Into<String>) -> Self {
        Self {
            task_id,
            actor: actor.into(),
            decision: decision.into(),
            comment: None,
            variables: BTreeMap::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// External event resuming an asynchronous SCRIPT node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackResult {
    pub callback_id: CallbackId,
    pub decision: String,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

/// Work item of the engine; every variant is handled under the instance's lock
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "kebab-case")]
pub enum EngineMessage {
    /// Create a fresh instance and activate its START node
    ProcessStart {
        instance_id: InstanceId,
        start: ProcessStart,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<super::document::ParentLink>,
    },
    NodeActivate(NodeActivation),
    CompleteTask {
        instance_id: InstanceId,
        completion: TaskCompletion,
    },
    TransferTask {
        instance_id: InstanceId,
        task_id: TaskId,
        actor: String,
        to: String,
    },
    Revoke {
        instance_id: InstanceId,
        work_id: WorkId,
        actor: String,
    },
    Sendback {
        instance_id: InstanceId,
        task_id: TaskId,
        actor: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
    TimerFired {
        instance_id: InstanceId,
        delay_id: DelayId,
        work_id: WorkId,
    },
    Callback {
        instance_id: InstanceId,
        result: CallbackResult,
    },
    /// A child instance reached END; resume the waiting SUB work
    ChildEnded {
        instance_id: InstanceId,
        work_id: WorkId,
        child_id: InstanceId,
        decision: String,
    },
    Pause {
        instance_id: InstanceId,
        actor: String,
    },
    Resume {
        instance_id: InstanceId,
        actor: String,
    },
    Destroy {
        instance_id: InstanceId,
        actor: String,
    },
}

impl EngineMessage {
    /// Serialization key
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Self::ProcessStart { instance_id, .. }
            | Self::CompleteTask { instance_id, .. }
            | Self::TransferTask { instance_id, .. }
            | Self::Revoke { instance_id, .. }
            | Self::Sendback { instance_id, .. }
            | Self::TimerFired { instance_id, .. }
            | Self::Callback { instance_id, .. }
            | Self::ChildEnded { instance_id, .. }
            | Self::Pause { instance_id, .. }
            | Self::Resume { instance_id, .. }
            | Self::Destroy { instance_id, .. } => instance_id,
            Self::NodeActivate(activation) => &activation.instance_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ProcessStart { .. } => "process-start",
            Self::NodeActivate(_) => "node-activate",
            Self::CompleteTask { .. } => "complete-task",
            Self::TransferTask { .. } => "transfer-task",
            Self::Revoke { .. } => "revoke",
            Self::Sendback { .. } => "sendback",
            Self::TimerFired { .. } => "timer-fired",
            Self::Callback { .. } => "callback",
            Self::ChildEnded { .. } => "child-ended",
            Self::Pause { .. } => "pause",
            Self::Resume { .. } => "resume",
            Self::Destroy { .. } => "destroy",
        }
    }
}

/// Pending timed re-entry for a TIMER work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelayEntry {
    pub id: DelayId,
    pub instance_id: InstanceId,
    pub work_id: WorkId,
    pub wake_at: DateTime<Utc>,
}

impl DelayEntry {
    pub fn new(instance_id: InstanceId, work_id: WorkId, wake_at: DateTime<Utc>) -> Self {
        Self {
            id: DelayId::generate(),
            instance_id,
            work_id,
            wake_at,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.wake_at <= now
    }
}

/// Pending external-event re-entry for an asynchronous SCRIPT work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackEntry {
    pub id: CallbackId,
    pub instance_id: InstanceId,
    pub work_id: WorkId,
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

impl CallbackEntry {
    pub fn new(instance_id: InstanceId, work_id: WorkId, round: u32) -> Self {
        Self {
            id: CallbackId::generate(),
            instance_id,
            work_id,
            round,
            created_at: Utc::now(),
        }
    }
}
