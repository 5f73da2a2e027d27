//! Next-node routing
//!
//! Given a finished work and the decision label(s) it produced, [`route_next`]
//! selects the outgoing links to follow, records PASS traces for them, marks
//! the branches that will not run with IGNORE traces and returns one
//! activation per followed link.

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};

use super::document::{ProcessDocument, TraceStatus};
use super::error::EngineError;
use super::ids::{ParallelGroupId, WorkId};
use super::message::NodeActivation;
use super::template::{LinkDef, NodeKind, ProcessTemplate, DEFAULT_ROUTE};

/// A link that was not followed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredEdge {
    pub from_node: String,
    pub to_node: String,
    pub route: String,
    pub round: u32,
}

/// Outcome of one routing decision
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    pub activations: Vec<NodeActivation>,
    pub ignored: Vec<IgnoredEdge>,

    /// Route labels actually followed
    pub matched: Vec<String>,

    /// The requested decision matched nothing and DEFAULT was used instead
    pub fell_back: bool,

    /// Stale-round trace rows removed on loop re-entry
    pub pruned: usize,
}

/// Split a decision string into labels (`"A, B"` -> `["A", "B"]`)
pub fn decision_labels(decision: &str) -> Vec<String> {
    let labels: Vec<String> = decision
        .split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect();

    if labels.is_empty() {
        vec![DEFAULT_ROUTE.to_string()]
    } else {
        labels
    }
}

/// Round a target node runs in when reached from a work at `round`
pub fn target_round(doc: &ProcessDocument, target: &str, round: u32) -> u32 {
    if doc.done_at_or_after(target, round) {
        doc.max_round(target).unwrap_or(round).max(round) + 1
    } else {
        round
    }
}

/// Compute and record the next activations for a finished work
pub fn route_next(
    template: &ProcessTemplate,
    doc: &mut ProcessDocument,
    work_id: &WorkId,
    decisions: &[String],
) -> Result<RoutePlan, EngineError> {
    let work = doc
        .work(work_id)
        .ok_or_else(|| EngineError::work_not_found(work_id.as_str()))?;
    let node_id = work.node_id.clone();
    let round = work.round;
    let inherited_group = work.parallel_id.clone();

    let links: Vec<&LinkDef> = template.outgoing(&node_id).collect();
    let mut plan = RoutePlan::default();

    if links.is_empty() {
        debug!(node_id = %node_id, "No outgoing links, branch grounded");
        return Ok(plan);
    }

    let mut declared: Vec<&str> = Vec::new();
    for link in &links {
        if !declared.contains(&link.route()) {
            declared.push(link.route());
        }
    }

    let mut matched: Vec<String> = Vec::new();
    for decision in decisions {
        if declared.contains(&decision.as_str()) && !matched.contains(decision) {
            matched.push(decision.clone());
        }
    }

    if matched.is_empty() {
        warn!(
            instance_id = %doc.id(),
            node_id = %node_id,
            requested = ?decisions,
            declared = ?declared,
            "Decision matches no declared route, falling back to DEFAULT"
        );
        plan.fell_back = true;
    }

    if declared.contains(&DEFAULT_ROUTE) && !matched.iter().any(|m| m == DEFAULT_ROUTE) {
        matched.push(DEFAULT_ROUTE.to_string());
    }

    // Sibling links sharing one label form a parallel group
    let mut per_label: BTreeMap<&str, usize> = BTreeMap::new();
    for link in &links {
        *per_label.entry(link.route()).or_default() += 1;
    }
    let mut groups: BTreeMap<&str, ParallelGroupId> = BTreeMap::new();

    for link in &links {
        let route = link.route();

        if !matched.iter().any(|m| m == route) {
            doc.push_trace(&node_id, work_id, &link.to, route, TraceStatus::Ignore, round);
            plan.ignored.push(IgnoredEdge {
                from_node: node_id.clone(),
                to_node: link.to.clone(),
                route: route.to_string(),
                round,
            });
            let mut visited = HashSet::new();
            ignore_subtree(template, doc, work_id, &link.to, round, &mut visited, &mut plan);
            continue;
        }

        let parallel_id = if per_label.get(route).copied().unwrap_or(0) > 1 {
            Some(
                groups
                    .entry(route)
                    .or_insert_with(ParallelGroupId::generate)
                    .clone(),
            )
        } else {
            inherited_group.clone()
        };

        let next_round = target_round(doc, &link.to, round);
        if doc.done_before(&link.to, next_round) {
            plan.pruned += doc.prune_stale_traces(&link.to, next_round);
        }

        doc.push_trace(&node_id, work_id, &link.to, route, TraceStatus::Pass, next_round);

        plan.activations.push(NodeActivation {
            instance_id: doc.id().clone(),
            template_id: template.id().clone(),
            selector: link.to.clone(),
            from_node: Some(node_id.clone()),
            from_work: Some(work_id.clone()),
            route: route.to_string(),
            round: next_round,
            parallel_id,
        });
    }

    plan.matched = matched;
    Ok(plan)
}

/// Mark everything below an unfollowed link as IGNORE, up to the first
/// node that other branches may still reach
fn ignore_subtree(
    template: &ProcessTemplate,
    doc: &mut ProcessDocument,
    origin: &WorkId,
    node_id: &str,
    round: u32,
    visited: &mut HashSet<String>,
    plan: &mut RoutePlan,
) {
    if !visited.insert(node_id.to_string()) {
        return;
    }

    let Some(node) = template.node(node_id) else {
        return;
    };

    let inbound = template.inbound_sources(node_id).len();
    let stop = match &node.kind {
        NodeKind::End => inbound > 1,
        NodeKind::And(_) | NodeKind::Or => inbound > 1,
        _ => false,
    };
    if stop || doc.ever_done(node_id) {
        return;
    }

    let outgoing: Vec<LinkDef> = template.outgoing(node_id).cloned().collect();
    for link in outgoing {
        let route = link.route().to_string();
        doc.push_trace(node_id, origin, &link.to, &route, TraceStatus::Ignore, round);
        plan.ignored.push(IgnoredEdge {
            from_node: node_id.to_string(),
            to_node: link.to.clone(),
            route,
            round,
        });
        ignore_subtree(template, doc, origin, &link.to, round, visited, plan);
    }
}
