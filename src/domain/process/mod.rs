//! Process domain - templates, instance documents and the pure engine rules

pub mod collaborator;
pub mod document;
pub mod error;
pub mod ids;
pub mod message;
pub mod repository;
pub mod routing;
pub mod template;
pub mod variable;
pub mod vote;

pub use collaborator::{
    MessageHandler, Notification, NotificationKind, Notifier, ParticipantResolver, ResolveContext,
    ScriptExecutor, ScriptOutput, ScriptRequest,
};
#[cfg(test)]
pub use collaborator::{MockMessageHandler, MockScriptExecutor};
pub use document::{
    ClosedGroup, Instance, InstanceStatus, ParentLink, ProcessDocument, RouteTrace, Task, TraceStatus, Work,
    WorkStatus,
};
pub use error::EngineError;
pub use ids::{CallbackId, DelayId, InstanceId, ParallelGroupId, TaskId, TemplateId, WorkId};
pub use message::{
    CallbackEntry, CallbackResult, DelayEntry, EngineMessage, NodeActivation, ProcessStart,
    TaskCompletion,
};
pub use repository::{EntryScope, ProcessRepository, TemplateRepository};
pub use routing::{decision_labels, route_next, RoutePlan};
pub use template::{
    ActionNode, AndNode, DelayAnchor, DelaySpec, InformNode, LinkDef, NodeDef, NodeKind,
    ProcessTemplate, ScriptNode, SubNode, TimerNode, DEFAULT_ROUTE,
};
pub use variable::{Variable, VariableRecord, PROCESS_OBJECT};
pub use vote::{VoteOutcome, VoteRule};
