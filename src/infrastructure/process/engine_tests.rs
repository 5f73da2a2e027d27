//! Scenario tests driving the engine through whole process instances

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use super::{
    InMemoryProcessRepository, InMemoryTemplateRepository, ProcessEngine, ProcessRuntime,
    RuntimeConfig,
};
use crate::domain::process::{
    ActionNode, AndNode, CallbackEntry, CallbackId, CallbackResult, DelayEntry, DelayId,
    DelaySpec, EngineError, EngineMessage, EntryScope, Instance, InstanceId, InstanceStatus,
    MessageHandler, MockScriptExecutor, NodeActivation, NodeKind, ProcessDocument,
    ProcessRepository, ProcessStart, ProcessTemplate, ScriptNode, ScriptOutput, SubNode, Task,
    TaskCompletion, TemplateId, TimerNode, TraceStatus, VariableRecord, WorkStatus,
};
use crate::domain::DomainError;

fn tid(id: &str) -> TemplateId {
    TemplateId::new(id).unwrap()
}

fn action(role: &str) -> NodeKind {
    NodeKind::Action(ActionNode::new(role))
}

struct Harness {
    engine: ProcessEngine,
    repository: Arc<InMemoryProcessRepository>,
}

impl Harness {
    fn new(templates: Vec<ProcessTemplate>) -> Self {
        Self::build(templates, |engine| engine)
    }

    fn build(
        templates: Vec<ProcessTemplate>,
        configure: impl FnOnce(ProcessEngine) -> ProcessEngine,
    ) -> Self {
        let repository = Arc::new(InMemoryProcessRepository::new());
        let templates = Arc::new(InMemoryTemplateRepository::with_templates(templates));
        let engine = configure(ProcessEngine::new(repository.clone(), templates));
        Self { engine, repository }
    }

    /// Handle one message and return its follow-ons unprocessed
    async fn step(&self, message: EngineMessage) -> Vec<EngineMessage> {
        self.engine.handle(message).await.unwrap()
    }

    async fn drain(&self, messages: Vec<EngineMessage>) {
        let mut queue = VecDeque::from(messages);
        while let Some(message) = queue.pop_front() {
            queue.extend(self.engine.handle(message).await.unwrap());
        }
    }

    /// Handle a message and everything it leads to
    async fn run(&self, message: EngineMessage) -> Result<(), EngineError> {
        let follow_ons = self.engine.handle(message).await?;
        self.drain(follow_ons).await;
        Ok(())
    }

    async fn start(&self, template: &str, starter: &str) -> InstanceId {
        self.start_with(ProcessStart::new(tid(template), starter)).await
    }

    async fn start_with(&self, start: ProcessStart) -> InstanceId {
        let instance_id = InstanceId::generate();
        self.run(EngineMessage::ProcessStart {
            instance_id: instance_id.clone(),
            start,
            parent: None,
        })
        .await
        .unwrap();
        instance_id
    }

    async fn doc(&self, id: &InstanceId) -> ProcessDocument {
        self.repository.get_document(id).await.unwrap().unwrap()
    }

    async fn task(&self, id: &InstanceId, node: &str, participant: &str) -> Task {
        self.doc(id)
            .await
            .tasks()
            .iter()
            .find(|t| t.node_id == node && t.participant == participant && t.status == WorkStatus::Run)
            .cloned()
            .unwrap_or_else(|| panic!("no open task on {} for {}", node, participant))
    }

    fn completion(id: &InstanceId, task: &Task, decision: &str) -> EngineMessage {
        EngineMessage::CompleteTask {
            instance_id: id.clone(),
            completion: TaskCompletion::new(task.id.clone(), &task.participant, decision),
        }
    }

    async fn complete(&self, id: &InstanceId, node: &str, participant: &str, decision: &str) {
        let task = self.task(id, node, participant).await;
        self.run(Self::completion(id, &task, decision)).await.unwrap();
    }
}

fn approval() -> ProcessTemplate {
    ProcessTemplate::new(tid("approval"), "Approval")
        .with_node("start", NodeKind::Start)
        .with_node("review", action("alice"))
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link_when("review", "end", "APPROVE")
}

#[tokio::test]
async fn test_approval_runs_to_completion() {
    let harness = Harness::new(vec![approval()]);
    let id = harness.start("approval", "sam").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert_eq!(doc.running_work_for_node("review").map(|w| w.round), Some(0));

    harness.complete(&id, "review", "alice", "APPROVE").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(doc.open_works().count(), 0);
    let end = doc.works_for_node("end").next().unwrap();
    assert_eq!(end.status, WorkStatus::End);
    assert_eq!(end.decision.as_deref(), Some("APPROVE"));
}

#[tokio::test]
async fn test_duplicate_start_is_ignored() {
    let harness = Harness::new(vec![approval()]);
    let id = harness.start("approval", "sam").await;

    let follow_ons = harness
        .step(EngineMessage::ProcessStart {
            instance_id: id.clone(),
            start: ProcessStart::new(tid("approval"), "sam"),
            parent: None,
        })
        .await;

    assert!(follow_ons.is_empty());
    assert_eq!(harness.doc(&id).await.works_for_node("review").count(), 1);
}

#[tokio::test]
async fn test_completion_rules() {
    let harness = Harness::new(vec![approval()]);
    let id = harness.start("approval", "sam").await;
    let task = harness.task(&id, "review", "alice").await;

    let stranger = EngineMessage::CompleteTask {
        instance_id: id.clone(),
        completion: TaskCompletion::new(task.id.clone(), "mallory", "APPROVE"),
    };
    assert!(matches!(
        harness.run(stranger).await,
        Err(EngineError::Permission { .. })
    ));

    harness
        .run(Harness::completion(&id, &task, "APPROVE"))
        .await
        .unwrap();
    let again = harness.run(Harness::completion(&id, &task, "APPROVE")).await;
    assert!(matches!(again, Err(EngineError::InstanceNotRunning { .. })));
}

#[tokio::test]
async fn test_action_without_participants_goes_to_starter() {
    let template = ProcessTemplate::new(tid("nobody"), "Nobody")
        .with_node("start", NodeKind::Start)
        .with_node("review", action("$approver"))
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link("review", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("nobody", "sam").await;

    harness.complete(&id, "review", "sam", "DEFAULT").await;
    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
}

#[tokio::test]
async fn test_start_variables_drive_participants() {
    let template = ProcessTemplate::new(tid("routed"), "Routed")
        .with_node("start", NodeKind::Start)
        .with_node("review", action("$approver"))
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link("review", "end");
    let harness = Harness::new(vec![template]);
    let id = harness
        .start_with(ProcessStart::new(tid("routed"), "sam").with_variable("approver", json!("dora")))
        .await;

    harness.complete(&id, "review", "dora", "DEFAULT").await;
    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
}

fn parallel_review() -> ProcessTemplate {
    ProcessTemplate::new(tid("parallel"), "Parallel review")
        .with_node("start", NodeKind::Start)
        .with_node("split", NodeKind::Through)
        .with_node("legal", action("lena"))
        .with_node("finance", action("fred"))
        .with_node("join", NodeKind::And(AndNode::default()))
        .with_node("end", NodeKind::End)
        .link("start", "split")
        .link("split", "legal")
        .link("split", "finance")
        .link("legal", "join")
        .link("finance", "join")
        .link("join", "end")
}

#[tokio::test]
async fn test_and_join_waits_for_every_branch() {
    let harness = Harness::new(vec![parallel_review()]);
    let id = harness.start("parallel", "sam").await;

    harness.complete(&id, "legal", "lena", "DEFAULT").await;
    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert_eq!(doc.works_for_node("join").count(), 1);
    assert_eq!(
        doc.works_for_node("join").next().map(|w| w.status),
        Some(WorkStatus::Run)
    );

    harness.complete(&id, "finance", "fred", "DEFAULT").await;
    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(doc.works_for_node("join").count(), 1);
    assert_eq!(doc.works_for_node("end").count(), 1);
}

#[tokio::test]
async fn test_and_join_with_looping_branch() {
    let template = ProcessTemplate::new(tid("looping"), "Looping join")
        .with_node("start", NodeKind::Start)
        .with_node("split", NodeKind::Through)
        .with_node("a", action("ann"))
        .with_node("b", action("ben"))
        .with_node("c", action("cat"))
        .with_node("fix", action("cat"))
        .with_node("join", NodeKind::And(AndNode::with_counterpart("c")))
        .with_node("end", NodeKind::End)
        .link("start", "split")
        .link("split", "a")
        .link("split", "b")
        .link("split", "c")
        .link("a", "join")
        .link("b", "join")
        .link_when("c", "join", "DONE")
        .link_when("c", "fix", "RETRY")
        .link("fix", "c")
        .link("join", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("looping", "sam").await;

    harness.complete(&id, "a", "ann", "DEFAULT").await;
    harness.complete(&id, "b", "ben", "DEFAULT").await;
    for _ in 0..2 {
        harness.complete(&id, "c", "cat", "RETRY").await;
        harness.complete(&id, "fix", "cat", "DEFAULT").await;
    }

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert_eq!(doc.running_work_for_node("c").map(|w| w.round), Some(2));

    harness.complete(&id, "c", "cat", "DONE").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(doc.works_for_node("c").count(), 3);
    assert_eq!(doc.works_for_node("join").count(), 1);
    assert_eq!(
        doc.works_for_node("join").next().map(|w| w.status),
        Some(WorkStatus::Done)
    );
}

#[tokio::test]
async fn test_and_join_ignores_arrivals_above_counterpart_round() {
    let template = ProcessTemplate::new(tid("ceiling"), "Ceiling join")
        .with_node("start", NodeKind::Start)
        .with_node("split", NodeKind::Through)
        .with_node("a", action("ann"))
        .with_node("b", action("ben"))
        .with_node("c", action("cat"))
        .with_node("fix", action("cat"))
        .with_node("join", NodeKind::And(AndNode::with_counterpart("a")))
        .with_node("end", NodeKind::End)
        .link("start", "split")
        .link("split", "a")
        .link("split", "b")
        .link("split", "c")
        .link("a", "join")
        .link("b", "join")
        .link_when("c", "join", "DONE")
        .link_when("c", "fix", "RETRY")
        .link("fix", "c")
        .link("join", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("ceiling", "sam").await;

    for _ in 0..2 {
        harness.complete(&id, "c", "cat", "RETRY").await;
        harness.complete(&id, "fix", "cat", "DEFAULT").await;
    }
    harness.complete(&id, "c", "cat", "DONE").await;
    harness.complete(&id, "a", "ann", "DEFAULT").await;
    harness.complete(&id, "b", "ben", "DEFAULT").await;

    let doc = harness.doc(&id).await;
    let join = doc.works_for_node("join").next().unwrap();
    assert_eq!(join.status, WorkStatus::Run);
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert_eq!(doc.works_for_node("end").count(), 0);
    assert!(doc
        .traces_into_work(&join.id)
        .any(|t| t.from_node == "c" && t.round == 2));
}

fn racing() -> ProcessTemplate {
    ProcessTemplate::new(tid("race"), "Race")
        .with_node("start", NodeKind::Start)
        .with_node("split", NodeKind::Through)
        .with_node("a", action("ann"))
        .with_node("b", action("ben"))
        .with_node("c", action("cat"))
        .with_node("first", NodeKind::Or)
        .with_node("after", action("dan"))
        .with_node("end", NodeKind::End)
        .link("start", "split")
        .link("split", "a")
        .link("split", "b")
        .link("split", "c")
        .link("a", "first")
        .link("b", "first")
        .link("c", "first")
        .link("first", "after")
        .link("after", "end")
}

#[tokio::test]
async fn test_or_join_first_branch_wins() {
    let harness = Harness::new(vec![racing()]);
    let id = harness.start("race", "sam").await;

    harness.complete(&id, "b", "ben", "DEFAULT").await;

    let doc = harness.doc(&id).await;
    for loser in ["a", "c"] {
        let work = doc.works_for_node(loser).next().unwrap();
        assert_eq!(work.status, WorkStatus::Ignore);
    }
    assert_eq!(doc.works_for_node("first").count(), 1);
    assert!(doc.running_work_for_node("after").is_some());

    let late = doc
        .tasks()
        .iter()
        .find(|t| t.node_id == "a")
        .cloned()
        .unwrap();
    assert_eq!(late.status, WorkStatus::Ignore);
    assert!(matches!(
        harness.run(Harness::completion(&id, &late, "DEFAULT")).await,
        Err(EngineError::StateConflict { .. })
    ));
}

#[tokio::test]
async fn test_or_join_discards_arrivals_already_in_flight() {
    let harness = Harness::new(vec![racing()]);
    let id = harness.start("race", "sam").await;

    let a = harness.task(&id, "a", "ann").await;
    let b = harness.task(&id, "b", "ben").await;
    let from_a = harness.step(Harness::completion(&id, &a, "DEFAULT")).await;
    let from_b = harness.step(Harness::completion(&id, &b, "DEFAULT")).await;
    assert_eq!(from_a.len(), 1);
    assert_eq!(from_b.len(), 1);

    harness.drain(from_a).await;
    harness.drain(from_b).await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.works_for_node("first").count(), 1);
    assert_eq!(doc.works_for_node("after").count(), 1);
    assert_eq!(
        doc.works_for_node("c").next().map(|w| w.status),
        Some(WorkStatus::Ignore)
    );
    assert!(doc
        .traces_to("first")
        .any(|t| t.from_node == "b" && t.status == TraceStatus::Ignore));
}

#[tokio::test]
async fn test_or_join_spares_branches_that_bypass_it() {
    let template = ProcessTemplate::new(tid("bypass"), "Bypass")
        .with_node("start", NodeKind::Start)
        .with_node("split", NodeKind::Through)
        .with_node("a", action("ann"))
        .with_node("b", action("ben"))
        .with_node("watch", action("wes"))
        .with_node("first", NodeKind::Or)
        .with_node("archive", NodeKind::Ground)
        .with_node("after", action("dan"))
        .with_node("end", NodeKind::End)
        .link("start", "split")
        .link("split", "a")
        .link("split", "b")
        .link("split", "watch")
        .link("a", "first")
        .link("b", "first")
        .link("watch", "archive")
        .link("first", "after")
        .link("after", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("bypass", "sam").await;

    harness.complete(&id, "b", "ben", "DEFAULT").await;

    let doc = harness.doc(&id).await;
    assert_eq!(
        doc.works_for_node("a").next().map(|w| w.status),
        Some(WorkStatus::Ignore)
    );
    assert_eq!(
        doc.works_for_node("watch").next().map(|w| w.status),
        Some(WorkStatus::Run)
    );
    assert!(doc.running_work_for_node("after").is_some());

    harness.complete(&id, "watch", "wes", "DEFAULT").await;
    let doc = harness.doc(&id).await;
    assert_eq!(
        doc.works_for_node("archive").next().map(|w| w.status),
        Some(WorkStatus::Done)
    );

    harness.complete(&id, "after", "dan", "DEFAULT").await;
    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
}

fn rework_loop() -> ProcessTemplate {
    ProcessTemplate::new(tid("rework"), "Rework")
        .with_node("start", NodeKind::Start)
        .with_node("review", action("alice"))
        .with_node("fix", action("bob"))
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link_when("review", "fix", "REJECT")
        .link_when("review", "end", "APPROVE")
        .link("fix", "review")
}

#[tokio::test]
async fn test_loop_reentry_opens_new_round() {
    let harness = Harness::new(vec![rework_loop()]);
    let id = harness.start("rework", "sam").await;

    harness.complete(&id, "review", "alice", "REJECT").await;
    harness.complete(&id, "fix", "bob", "DEFAULT").await;

    let doc = harness.doc(&id).await;
    let rounds: Vec<u32> = doc.works_for_node("review").map(|w| w.round).collect();
    assert_eq!(rounds, vec![0, 1]);
    assert!(doc.traces_to("review").all(|t| t.round >= 1));

    harness.complete(&id, "review", "alice", "APPROVE").await;
    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(doc.open_works().count(), 0);
}

fn chain() -> ProcessTemplate {
    ProcessTemplate::new(tid("chain"), "Chain")
        .with_node("start", NodeKind::Start)
        .with_node("draft", action("alice"))
        .with_node("review", action("bob"))
        .with_node("sign", action("carol"))
        .with_node("end", NodeKind::End)
        .link("start", "draft")
        .link("draft", "review")
        .link("review", "sign")
        .link("sign", "end")
}

#[tokio::test]
async fn test_revoke_reopens_completed_action() {
    let harness = Harness::new(vec![chain()]);
    let id = harness.start("chain", "sam").await;
    harness.complete(&id, "draft", "alice", "DEFAULT").await;

    let draft = harness
        .doc(&id)
        .await
        .works_for_node("draft")
        .next()
        .cloned()
        .unwrap();
    harness
        .run(EngineMessage::Revoke {
            instance_id: id.clone(),
            work_id: draft.id.clone(),
            actor: "alice".into(),
        })
        .await
        .unwrap();

    let doc = harness.doc(&id).await;
    assert_eq!(doc.works_for_node("review").count(), 0);
    assert_eq!(doc.work(&draft.id).map(|w| w.status), Some(WorkStatus::Revoked));
    let reopened = doc.running_work_for_node("draft").unwrap();
    assert_eq!(reopened.round, 0);
    assert!(doc.tasks_for_work(&reopened.id).any(|t| t.participant == "alice"));
}

#[tokio::test]
async fn test_revoke_refused_once_follower_progressed() {
    let harness = Harness::new(vec![chain()]);
    let id = harness.start("chain", "sam").await;
    harness.complete(&id, "draft", "alice", "DEFAULT").await;
    harness.complete(&id, "review", "bob", "DEFAULT").await;

    let before = harness.doc(&id).await;
    let draft = before.works_for_node("draft").next().cloned().unwrap();

    let result = harness
        .run(EngineMessage::Revoke {
            instance_id: id.clone(),
            work_id: draft.id.clone(),
            actor: "alice".into(),
        })
        .await;

    assert!(matches!(result, Err(EngineError::NotRevocable(_))));
    assert_eq!(harness.doc(&id).await, before);
}

#[tokio::test]
async fn test_revoke_requires_the_completing_participant() {
    let harness = Harness::new(vec![chain()]);
    let id = harness.start("chain", "sam").await;
    harness.complete(&id, "draft", "alice", "DEFAULT").await;
    let draft = harness
        .doc(&id)
        .await
        .works_for_node("draft")
        .next()
        .cloned()
        .unwrap();

    let result = harness
        .run(EngineMessage::Revoke {
            instance_id: id.clone(),
            work_id: draft.id,
            actor: "bob".into(),
        })
        .await;
    assert!(matches!(result, Err(EngineError::Permission { .. })));
}

#[tokio::test]
async fn test_sendback_returns_to_previous_action() {
    let harness = Harness::new(vec![chain()]);
    let id = harness.start("chain", "sam").await;
    harness.complete(&id, "draft", "alice", "DEFAULT").await;

    let review = harness.task(&id, "review", "bob").await;
    harness
        .run(EngineMessage::Sendback {
            instance_id: id.clone(),
            task_id: review.id.clone(),
            actor: "bob".into(),
            comment: Some("needs numbers".into()),
        })
        .await
        .unwrap();

    let doc = harness.doc(&id).await;
    assert_eq!(
        doc.work(&review.work_id).map(|w| w.status),
        Some(WorkStatus::Returned)
    );
    assert_eq!(
        doc.task(&review.id).and_then(|t| t.comment.as_deref()),
        Some("needs numbers")
    );
    assert_eq!(doc.works_for_node("draft").count(), 2);
    assert!(doc.running_work_for_node("draft").is_some());

    let draft = harness.task(&id, "draft", "alice").await;
    let result = harness
        .run(EngineMessage::Sendback {
            instance_id: id.clone(),
            task_id: draft.id,
            actor: "alice".into(),
            comment: None,
        })
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn test_percent_vote_decides_route() {
    let template = ProcessTemplate::new(tid("board"), "Board vote")
        .with_node("start", NodeKind::Start)
        .with_node(
            "vote",
            NodeKind::Action(
                ActionNode::new("ann,ben,cat,dan,eve")
                    .with_require_all(true)
                    .with_vote("percentOrFailto(A, 60, B)"),
            ),
        )
        .with_node("redo", action("sam"))
        .with_node("end", NodeKind::End)
        .link("start", "vote")
        .link_when("vote", "end", "A")
        .link_when("vote", "redo", "B");
    let harness = Harness::new(vec![template]);
    let id = harness.start("board", "sam").await;

    for (voter, ballot) in [("ann", "A"), ("ben", "B"), ("cat", "A"), ("dan", "B")] {
        harness.complete(&id, "vote", voter, ballot).await;
        assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Run);
    }
    harness.complete(&id, "vote", "eve", "A").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(doc.works_for_node("redo").count(), 0);
    assert_eq!(
        doc.works_for_node("vote").next().and_then(|w| w.decision.clone()),
        Some("A".to_string())
    );
}

#[tokio::test]
async fn test_first_participant_decides_without_require_all() {
    let template = ProcessTemplate::new(tid("anyone"), "Anyone")
        .with_node("start", NodeKind::Start)
        .with_node("review", action("ann,ben"))
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link("review", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("anyone", "sam").await;

    harness.complete(&id, "review", "ben", "DEFAULT").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    let ann = doc.tasks().iter().find(|t| t.participant == "ann").unwrap();
    assert_eq!(ann.status, WorkStatus::Ignore);
}

#[tokio::test]
async fn test_transfer_moves_task() {
    let template = ProcessTemplate::new(tid("handover"), "Handover")
        .with_node("start", NodeKind::Start)
        .with_node(
            "review",
            NodeKind::Action(ActionNode::new("alice").with_transferable(true)),
        )
        .with_node("end", NodeKind::End)
        .link("start", "review")
        .link("review", "end");
    let harness = Harness::new(vec![template, approval()]);
    let id = harness.start("handover", "sam").await;
    let task = harness.task(&id, "review", "alice").await;

    harness
        .run(EngineMessage::TransferTask {
            instance_id: id.clone(),
            task_id: task.id.clone(),
            actor: "alice".into(),
            to: "bob".into(),
        })
        .await
        .unwrap();
    harness.complete(&id, "review", "bob", "DEFAULT").await;
    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);

    let fixed = harness.start("approval", "sam").await;
    let task = harness.task(&fixed, "review", "alice").await;
    let result = harness
        .run(EngineMessage::TransferTask {
            instance_id: fixed.clone(),
            task_id: task.id,
            actor: "alice".into(),
            to: "bob".into(),
        })
        .await;
    assert!(matches!(result, Err(EngineError::Validation(_))));
}

fn scripted() -> ProcessTemplate {
    ProcessTemplate::new(tid("scripted"), "Scripted")
        .with_node("start", NodeKind::Start)
        .with_node(
            "check",
            NodeKind::Script(ScriptNode::new("score.sh").with_fallback("FAIL")),
        )
        .with_node("manual", action("alice"))
        .with_node("end", NodeKind::End)
        .link("start", "check")
        .link_when("check", "end", "OK")
        .link_when("check", "manual", "FAIL")
}

#[tokio::test]
async fn test_script_failure_takes_fallback_route() {
    let mut scripts = MockScriptExecutor::new();
    scripts
        .expect_execute()
        .times(1)
        .returning(|_| Err(EngineError::script("exit status 2")));

    let harness = Harness::build(vec![scripted()], |engine| {
        engine.with_script_executor(Arc::new(scripts))
    });
    let id = harness.start("scripted", "sam").await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert!(doc.running_work_for_node("manual").is_some());
}

#[tokio::test]
async fn test_script_output_sets_decision_and_variables() {
    let mut scripts = MockScriptExecutor::new();
    scripts.expect_execute().times(1).returning(|request| {
        assert_eq!(request.code, "score.sh");
        let mut output = ScriptOutput {
            decision: Some("OK".into()),
            ..Default::default()
        };
        output.variables.insert("score".into(), json!(7));
        Ok(output)
    });

    let harness = Harness::build(vec![scripted()], |engine| {
        engine.with_script_executor(Arc::new(scripts))
    });
    let id = harness.start("scripted", "sam").await;

    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
    let values = harness.engine.variables().values(&id).await.unwrap();
    assert_eq!(values.get("score"), Some(&json!(7)));
}

#[tokio::test]
async fn test_async_script_waits_for_callback() {
    let template = ProcessTemplate::new(tid("external"), "External")
        .with_node("start", NodeKind::Start)
        .with_node(
            "call",
            NodeKind::Script(ScriptNode::new("https://example.test/hook").asynchronous()),
        )
        .with_node("end", NodeKind::End)
        .link("start", "call")
        .link("call", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("external", "sam").await;

    let doc = harness.doc(&id).await;
    assert_eq!(
        doc.works_for_node("call").next().map(|w| w.status),
        Some(WorkStatus::Wait)
    );
    let callbacks = harness.repository.list_callbacks(&id).await.unwrap();
    assert_eq!(callbacks.len(), 1);

    let result = CallbackResult {
        callback_id: callbacks[0].id.clone(),
        decision: "DEFAULT".into(),
        variables: [("ticket".to_string(), json!("T-42"))].into_iter().collect(),
    };
    harness
        .run(EngineMessage::Callback {
            instance_id: id.clone(),
            result: result.clone(),
        })
        .await
        .unwrap();

    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
    assert!(harness.repository.list_callbacks(&id).await.unwrap().is_empty());

    let replay = harness
        .run(EngineMessage::Callback {
            instance_id: id.clone(),
            result,
        })
        .await;
    assert!(matches!(replay, Err(EngineError::CallbackNotFound(_))));
}

fn timed() -> ProcessTemplate {
    ProcessTemplate::new(tid("timed"), "Timed")
        .with_node("start", NodeKind::Start)
        .with_node(
            "wait",
            NodeKind::Timer(TimerNode {
                delay: DelaySpec::after("0s"),
            }),
        )
        .with_node("end", NodeKind::End)
        .link("start", "wait")
        .link("wait", "end")
}

#[tokio::test]
async fn test_timer_resumes_when_due() {
    let harness = Harness::new(vec![timed()]);
    let id = harness.start("timed", "sam").await;
    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Run);

    let due = harness.repository.due_delays(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
    for entry in due {
        harness
            .run(EngineMessage::TimerFired {
                instance_id: entry.instance_id,
                delay_id: entry.id,
                work_id: entry.work_id,
            })
            .await
            .unwrap();
    }

    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
    assert!(harness
        .repository
        .due_delays(Utc::now())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_out_of_range_timer_fires_immediately() {
    let template = ProcessTemplate::new(tid("forever"), "Forever")
        .with_node("start", NodeKind::Start)
        .with_node(
            "wait",
            NodeKind::Timer(TimerNode {
                delay: DelaySpec::after("9999999999999d"),
            }),
        )
        .with_node("end", NodeKind::End)
        .link("start", "wait")
        .link("wait", "end");
    let harness = Harness::new(vec![template]);
    let id = harness.start("forever", "sam").await;

    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Run);
    let due = harness.repository.due_delays(Utc::now()).await.unwrap();
    assert_eq!(due.len(), 1);
}

#[tokio::test]
async fn test_pause_parks_activations_until_resume() {
    let harness = Harness::new(vec![chain()]);
    let id = harness.start("chain", "sam").await;

    let draft = harness.task(&id, "draft", "alice").await;
    let follow_ons = harness.step(Harness::completion(&id, &draft, "DEFAULT")).await;
    harness
        .run(EngineMessage::Pause {
            instance_id: id.clone(),
            actor: "sam".into(),
        })
        .await
        .unwrap();
    harness.drain(follow_ons).await;

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Pause);
    assert_eq!(doc.parked().len(), 1);
    assert_eq!(doc.works_for_node("review").count(), 0);

    let intruder = harness
        .run(EngineMessage::Resume {
            instance_id: id.clone(),
            actor: "alice".into(),
        })
        .await;
    assert!(matches!(intruder, Err(EngineError::Permission { .. })));

    harness
        .run(EngineMessage::Resume {
            instance_id: id.clone(),
            actor: "sam".into(),
        })
        .await
        .unwrap();

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert!(doc.parked().is_empty());
    assert!(doc.running_work_for_node("review").is_some());
}

#[tokio::test]
async fn test_destroy_stops_instance_and_timers() {
    let harness = Harness::new(vec![timed()]);
    let id = harness.start("timed", "sam").await;

    harness
        .run(EngineMessage::Destroy {
            instance_id: id.clone(),
            actor: "sam".into(),
        })
        .await
        .unwrap();

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Stop);
    assert_eq!(doc.open_works().count(), 0);
    assert!(harness
        .repository
        .due_delays(Utc::now())
        .await
        .unwrap()
        .is_empty());

    let again = harness
        .run(EngineMessage::Destroy {
            instance_id: id.clone(),
            actor: "sam".into(),
        })
        .await;
    assert!(matches!(again, Err(EngineError::StateConflict { .. })));
}

fn parent(detached: bool) -> ProcessTemplate {
    let sub = SubNode::new(tid("approval")).inheriting();
    let sub = if detached { sub.detached() } else { sub };
    let template = ProcessTemplate::new(tid("parent"), "Parent")
        .with_node("start", NodeKind::Start)
        .with_node("child", NodeKind::Sub(sub))
        .with_node("end", NodeKind::End)
        .link("start", "child");
    // A detached child hands back no decision
    if detached {
        template.link("child", "end")
    } else {
        template.link_when("child", "end", "APPROVE")
    }
}

async fn child_of(harness: &Harness, parent_id: &InstanceId) -> InstanceId {
    harness
        .repository
        .list_instances()
        .await
        .unwrap()
        .into_iter()
        .find(|i| &i.id != parent_id)
        .map(|i| i.id)
        .unwrap()
}

#[tokio::test]
async fn test_attached_sub_process_resumes_parent() {
    let harness = Harness::new(vec![parent(false), approval()]);
    let id = harness
        .start_with(ProcessStart::new(tid("parent"), "sam").with_variable("budget", json!(10)))
        .await;

    let child = child_of(&harness, &id).await;
    let doc = harness.doc(&id).await;
    let sub = doc.running_work_for_node("child").unwrap();
    assert_eq!(sub.child_instance.as_ref(), Some(&child));

    let child_values = harness.engine.variables().values(&child).await.unwrap();
    assert_eq!(child_values.get("budget"), Some(&json!(10)));

    harness.complete(&child, "review", "alice", "APPROVE").await;

    assert_eq!(harness.doc(&child).await.status(), InstanceStatus::Done);
    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(
        doc.works_for_node("child").next().and_then(|w| w.decision.clone()),
        Some("APPROVE".to_string())
    );
}

#[tokio::test]
async fn test_detached_sub_process_does_not_block_parent() {
    let harness = Harness::new(vec![parent(true), approval()]);
    let id = harness.start("parent", "sam").await;

    assert_eq!(harness.doc(&id).await.status(), InstanceStatus::Done);
    let child = child_of(&harness, &id).await;
    let child_doc = harness.doc(&child).await;
    assert_eq!(child_doc.status(), InstanceStatus::Run);
    assert!(child_doc.instance().parent.is_none());
}

#[tokio::test]
async fn test_unknown_node_is_redirected_to_end() {
    let harness = Harness::new(vec![approval()]);
    let id = harness.start("approval", "sam").await;

    harness
        .run(EngineMessage::NodeActivate(NodeActivation::entry(
            id.clone(),
            tid("approval"),
            "ghost",
        )))
        .await
        .unwrap();

    let doc = harness.doc(&id).await;
    assert_eq!(doc.status(), InstanceStatus::Done);
    assert_eq!(
        doc.works_for_node("review").next().map(|w| w.status),
        Some(WorkStatus::Ignore)
    );
}

#[tokio::test]
async fn test_runtime_drives_instance_to_completion() {
    let repository = Arc::new(InMemoryProcessRepository::new());
    let templates = Arc::new(InMemoryTemplateRepository::with_templates(vec![approval()]));
    let engine = Arc::new(ProcessEngine::new(repository.clone(), templates));
    let runtime = ProcessRuntime::start(engine, RuntimeConfig::default());

    let id = InstanceId::generate();
    runtime
        .submit(EngineMessage::ProcessStart {
            instance_id: id.clone(),
            start: ProcessStart::new(tid("approval"), "sam"),
            parent: None,
        })
        .await
        .unwrap();
    runtime.wait_idle().await;

    let doc = repository.get_document(&id).await.unwrap().unwrap();
    let task = doc.tasks().first().cloned().unwrap();
    runtime
        .submit(Harness::completion(&id, &task, "APPROVE"))
        .await
        .unwrap();
    runtime.wait_idle().await;

    let doc = repository.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status(), InstanceStatus::Done);
    runtime.shutdown().await;
}

/// Delegates to the in-memory store but can refuse document saves
#[derive(Debug, Default)]
struct FlakyDocuments {
    inner: InMemoryProcessRepository,
    refuse_saves: std::sync::atomic::AtomicBool,
}

impl FlakyDocuments {
    fn refuse(&self, refuse: bool) {
        self.refuse_saves
            .store(refuse, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl ProcessRepository for FlakyDocuments {
    async fn get_document(&self, id: &InstanceId) -> Result<Option<ProcessDocument>, DomainError> {
        self.inner.get_document(id).await
    }

    async fn save_document(&self, document: ProcessDocument) -> Result<(), DomainError> {
        if self.refuse_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(DomainError::storage("document store unavailable"));
        }
        self.inner.save_document(document).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, DomainError> {
        self.inner.list_instances().await
    }

    async fn write_variables(&self, record: VariableRecord) -> Result<VariableRecord, DomainError> {
        self.inner.write_variables(record).await
    }

    async fn read_variables(
        &self,
        instance_id: &InstanceId,
        object_id: Option<&str>,
    ) -> Result<Vec<VariableRecord>, DomainError> {
        self.inner.read_variables(instance_id, object_id).await
    }

    async fn purge_variables(
        &self,
        instance_id: &InstanceId,
        object_ids: &[String],
    ) -> Result<usize, DomainError> {
        self.inner.purge_variables(instance_id, object_ids).await
    }

    async fn save_delay(&self, entry: DelayEntry) -> Result<(), DomainError> {
        self.inner.save_delay(entry).await
    }

    async fn due_delays(&self, now: DateTime<Utc>) -> Result<Vec<DelayEntry>, DomainError> {
        self.inner.due_delays(now).await
    }

    async fn delete_delay(&self, id: &DelayId) -> Result<bool, DomainError> {
        self.inner.delete_delay(id).await
    }

    async fn delete_delays(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError> {
        self.inner.delete_delays(instance_id, scope).await
    }

    async fn save_callback(&self, entry: CallbackEntry) -> Result<(), DomainError> {
        self.inner.save_callback(entry).await
    }

    async fn get_callback(&self, id: &CallbackId) -> Result<Option<CallbackEntry>, DomainError> {
        self.inner.get_callback(id).await
    }

    async fn list_callbacks(&self, instance_id: &InstanceId) -> Result<Vec<CallbackEntry>, DomainError> {
        self.inner.list_callbacks(instance_id).await
    }

    async fn delete_callback(&self, id: &CallbackId) -> Result<bool, DomainError> {
        self.inner.delete_callback(id).await
    }

    async fn delete_callbacks(
        &self,
        instance_id: &InstanceId,
        scope: EntryScope<'_>,
    ) -> Result<usize, DomainError> {
        self.inner.delete_callbacks(instance_id, scope).await
    }
}

#[tokio::test]
async fn test_failed_document_save_writes_no_entries() {
    let repository = Arc::new(FlakyDocuments::default());
    let templates = Arc::new(InMemoryTemplateRepository::with_templates(vec![timed()]));
    let engine = ProcessEngine::new(repository.clone(), templates);

    let id = InstanceId::generate();
    let mut queue: VecDeque<EngineMessage> = VecDeque::from(vec![EngineMessage::ProcessStart {
        instance_id: id.clone(),
        start: ProcessStart::new(tid("timed"), "sam"),
        parent: None,
    }]);
    let timer = loop {
        let message = queue.pop_front().expect("timer activation");
        if matches!(&message, EngineMessage::NodeActivate(a) if a.selector == "wait") {
            break message;
        }
        queue.extend(engine.handle(message).await.unwrap());
    };

    repository.refuse(true);
    let failed = engine.handle(timer.clone()).await;
    assert!(matches!(&failed, Err(e) if e.is_retryable()));
    assert!(repository.due_delays(Utc::now()).await.unwrap().is_empty());

    repository.refuse(false);
    engine.handle(timer).await.unwrap();
    assert_eq!(repository.due_delays(Utc::now()).await.unwrap().len(), 1);

    repository.refuse(true);
    let destroy = EngineMessage::Destroy {
        instance_id: id.clone(),
        actor: "sam".into(),
    };
    assert!(engine.handle(destroy).await.is_err());
    let doc = repository.get_document(&id).await.unwrap().unwrap();
    assert_eq!(doc.status(), InstanceStatus::Run);
    assert_eq!(repository.due_delays(Utc::now()).await.unwrap().len(), 1);
}
