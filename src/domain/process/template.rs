//! Process template: the static node/link declaration an instance executes

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::ids::TemplateId;

/// Route label used for unlabeled links and as the unconditional decision
pub const DEFAULT_ROUTE: &str = "DEFAULT";

/// Relative delay: 1d2h30m15s (each part optional, at least one required)
static OFFSET_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d+)d)?(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

/// Node type with its type-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Action(ActionNode),
    Inform(InformNode),
    Script(ScriptNode),
    And(AndNode),
    Or,
    Through,
    Timer(TimerNode),
    Ground,
    Sub(SubNode),
    End,
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Action(_) => "ACTION",
            Self::Inform(_) => "INFORM",
            Self::Script(_) => "SCRIPT",
            Self::And(_) => "AND",
            Self::Or => "OR",
            Self::Through => "THROUGH",
            Self::Timer(_) => "TIMER",
            Self::Ground => "GROUND",
            Self::Sub(_) => "SUB",
            Self::End => "END",
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self, Self::Action(_))
    }

    pub fn is_and(&self) -> bool {
        matches!(self, Self::And(_))
    }
}

/// Human task node: one task per resolved participant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionNode {
    /// Role expression handed to the participant resolver
    pub role: String,

    /// Wait for every participant instead of first completion
    #[serde(default)]
    pub require_all: bool,

    /// Optional vote function, e.g. `percentOrFailto(APPROVE, 60, REJECT)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vote: Option<String>,

    /// Whether tasks may be handed to another participant
    #[serde(default)]
    pub transferable: bool,
}

impl ActionNode {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            require_all: false,
            vote: None,
            transferable: false,
        }
    }

    pub fn with_require_all(mut self, require_all: bool) -> Self {
        self.require_all = require_all;
        self
    }

    pub fn with_vote(mut self, vote: impl Into<String>) -> Self {
        self.vote = Some(vote.into());
        self.require_all = true;
        self
    }

    pub fn with_transferable(mut self, transferable: bool) -> Self {
        self.transferable = transferable;
        self
    }
}

/// Notification-only node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InformNode {
    pub role: String,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub body: String,
}

impl InformNode {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            subject: String::new(),
            body: String::new(),
        }
    }

    pub fn with_message(mut self, subject: impl Into<String>, body: impl Into<String>) -> Self {
        self.subject = subject.into();
        self.body = body.into();
        self
    }
}

/// Sandboxed script node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScriptNode {
    pub code: String,

    /// Halt in WAIT until an external callback resumes the node
    #[serde(default)]
    pub asynchronous: bool,

    /// Decision used when the executor fails or times out
    #[serde(default = "default_route")]
    pub fallback: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn default_route() -> String {
    DEFAULT_ROUTE.to_string()
}

impl ScriptNode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            asynchronous: false,
            fallback: default_route(),
            timeout_ms: None,
        }
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Synchronizing join node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AndNode {
    /// Predecessor whose latest round anchors the completeness check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counterpart: Option<String>,
}

impl AndNode {
    pub fn with_counterpart(counterpart: impl Into<String>) -> Self {
        Self {
            counterpart: Some(counterpart.into()),
        }
    }
}

/// Delayed re-entry node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerNode {
    pub delay: DelaySpec,
}

/// Point the relative offset of a timer is measured from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelayAnchor {
    /// Instance start time
    Start,
    #[default]
    Now,
}

/// Wake time declaration: either absolute, or an offset from an anchor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelaySpec {
    #[serde(default)]
    pub anchor: DelayAnchor,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
}

impl DelaySpec {
    pub fn after(offset: impl Into<String>) -> Self {
        Self {
            anchor: DelayAnchor::Now,
            offset: Some(offset.into()),
            at: None,
        }
    }

    pub fn after_start(offset: impl Into<String>) -> Self {
        Self {
            anchor: DelayAnchor::Start,
            offset: Some(offset.into()),
            at: None,
        }
    }

    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            anchor: DelayAnchor::Now,
            offset: None,
            at: Some(at),
        }
    }

    /// Resolve the absolute wake time
    pub fn wake_time(
        &self,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, EngineError> {
        if let Some(at) = self.at {
            return Ok(at);
        }

        let offset = self
            .offset
            .as_deref()
            .ok_or_else(|| EngineError::validation("Timer needs either 'at' or 'offset'"))?;

        let base = match self.anchor {
            DelayAnchor::Start => started_at,
            DelayAnchor::Now => now,
        };

        base.checked_add_signed(parse_offset(offset)?).ok_or_else(|| {
            EngineError::validation(format!("Delay offset '{}' is out of range", offset))
        })
    }
}

/// Parse `1d2h30m15s` style offsets
pub fn parse_offset(offset: &str) -> Result<Duration, EngineError> {
    let invalid = || EngineError::validation(format!("Invalid delay offset '{}'", offset));

    if offset.is_empty() {
        return Err(invalid());
    }

    let caps = OFFSET_PATTERN.captures(offset).ok_or_else(invalid)?;
    let part = |i: usize| -> Result<i64, EngineError> {
        caps.get(i)
            .map(|m| m.as_str().parse::<i64>().map_err(|_| invalid()))
            .unwrap_or(Ok(0))
    };

    let units: [fn(i64) -> Option<Duration>; 4] = [
        Duration::try_days,
        Duration::try_hours,
        Duration::try_minutes,
        Duration::try_seconds,
    ];
    let mut total = Duration::zero();
    for (i, unit) in units.into_iter().enumerate() {
        let amount = unit(part(i + 1)?).ok_or_else(invalid)?;
        total = total.checked_add(&amount).ok_or_else(invalid)?;
    }
    Ok(total)
}

/// Sub-process node
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubNode {
    pub template_id: TemplateId,

    /// Fire and forget: proceed without waiting for the child
    #[serde(default)]
    pub detached: bool,

    /// Seed the child with the parent's current variables
    #[serde(default)]
    pub inherit_variables: bool,
}

impl SubNode {
    pub fn new(template_id: TemplateId) -> Self {
        Self {
            template_id,
            detached: false,
            inherit_variables: false,
        }
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn inheriting(mut self) -> Self {
        self.inherit_variables = true;
        self
    }
}

/// A node declaration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeDef {
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(flatten)]
    pub kind: NodeKind,
}

impl NodeDef {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
        }
    }
}

/// A directed link with an optional route case label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkDef {
    pub from: String,
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
}

impl LinkDef {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            case: None,
        }
    }

    pub fn when(mut self, case: impl Into<String>) -> Self {
        self.case = Some(case.into());
        self
    }

    /// Route label, `DEFAULT` when unlabeled
    pub fn route(&self) -> &str {
        match self.case.as_deref() {
            Some(case) if !case.is_empty() => case,
            _ => DEFAULT_ROUTE,
        }
    }
}

/// A process template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTemplate {
    id: TemplateId,

    name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,

    nodes: Vec<NodeDef>,

    #[serde(default)]
    links: Vec<LinkDef>,

    #[serde(default = "default_version")]
    version: u32,

    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ProcessTemplate {
    pub fn new(id: TemplateId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            nodes: Vec::new(),
            links: Vec::new(),
            version: 1,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push(NodeDef::new(id, kind));
        self
    }

    pub fn with_link(mut self, link: LinkDef) -> Self {
        self.links.push(link);
        self
    }

    /// Shorthand for an unlabeled link
    pub fn link(self, from: &str, to: &str) -> Self {
        self.with_link(LinkDef::new(from, to))
    }

    /// Shorthand for a labeled link
    pub fn link_when(self, from: &str, to: &str, case: &str) -> Self {
        self.with_link(LinkDef::new(from, to).when(case))
    }

    pub fn id(&self) -> &TemplateId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    pub fn links(&self) -> &[LinkDef] {
        &self.links
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn end_node(&self) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::End))
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a LinkDef> + 'a {
        self.links.iter().filter(move |l| l.from == node_id)
    }

    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a LinkDef> + 'a {
        self.links.iter().filter(move |l| l.to == node_id)
    }

    /// Distinct predecessor node ids, in declaration order
    pub fn inbound_sources(&self, node_id: &str) -> Vec<&str> {
        let mut sources: Vec<&str> = Vec::new();
        for link in self.links.iter().filter(|l| l.to == node_id) {
            if !sources.contains(&link.from.as_str()) {
                sources.push(&link.from);
            }
        }
        sources
    }

    /// Whether a path of links leads from `from` to `to`; a node reaches itself
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            queue.extend(
                self.links
                    .iter()
                    .filter(|l| l.from == current)
                    .map(|l| l.to.as_str()),
            );
        }
        false
    }
}
