//! Ports to the world outside the engine: participant resolution,
//! notification delivery, script execution and message handling

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use super::error::EngineError;
use super::ids::{InstanceId, WorkId};
use super::message::EngineMessage;

/// What a participant expression is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveContext {
    pub instance_id: InstanceId,
    pub starter: String,
    pub tenant: String,
    pub variables: BTreeMap<String, Value>,
}

/// Turns a role expression into concrete participant ids
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParticipantResolver: Send + Sync + Debug {
    async fn resolve(
        &self,
        expression: &str,
        context: &ResolveContext,
    ) -> Result<Vec<String>, EngineError>;
}

/// Why a notification is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// New task assigned
    Assigned,
    /// INFORM node reached
    Inform,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Inform => "inform",
        }
    }
}

/// A message for one or more participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub instance_id: InstanceId,
    pub work_id: WorkId,
    pub node_id: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn notify(&self, notification: Notification) -> Result<(), EngineError>;
}

/// Input handed to a script executor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptRequest {
    pub instance_id: InstanceId,
    pub work_id: WorkId,
    pub node_id: String,
    pub code: String,
    pub variables: BTreeMap<String, Value>,

    #[serde(skip)]
    pub timeout: Duration,
}

/// What a script returns: a decision plus variables to store
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ScriptOutput {
    #[serde(default)]
    pub decision: Option<String>,

    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScriptExecutor: Send + Sync + Debug {
    async fn execute(&self, request: ScriptRequest) -> Result<ScriptOutput, EngineError>;
}

/// Handles one bus message and returns the follow-on messages to publish
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync + Debug {
    async fn handle(&self, message: EngineMessage) -> Result<Vec<EngineMessage>, EngineError>;
}
