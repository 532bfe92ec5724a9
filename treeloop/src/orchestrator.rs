//! Session loop that drives a node tree to completion.
//!
//! One [`Orchestrator`] owns one tree and is its only writer. Readers get
//! snapshots through a [`SessionHandle`], which also carries the approval
//! broker, the event emitter and the cancellation token for the session.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::ApprovalBroker;
use crate::collab::{Executor, Planner};
use crate::core::path::node_path;
use crate::core::selector::{find_next_pending, is_complete};
use crate::core::status::NodeStatus;
use crate::core::types::{NodeId, SessionId};
use crate::error::EngineError;
use crate::events::{Event, EventEmitter, EventKind};
use crate::io::config::EngineConfig;
use crate::session::SessionHandle;
use crate::tree::{NodeTree, TreeSnapshot};

/// Reason why `handle_message` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Every node is settled.
    Complete,
    /// The tree is incomplete but nothing can be selected.
    NoEligibleNode,
    /// The message used up its `max_iterations` budget.
    MaxIterationsExceeded { max_iterations: u32 },
    Cancelled,
}

/// Summary of one `handle_message` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub steps_executed: u32,
    pub stop: LoopStop,
}

pub struct Orchestrator {
    pub(crate) session_id: SessionId,
    pub(crate) tree: NodeTree,
    pub(crate) planner: Arc<dyn Planner>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) broker: Arc<ApprovalBroker>,
    pub(crate) emitter: EventEmitter,
    pub(crate) config: EngineConfig,
    pub(crate) cancel: CancellationToken,
    snapshots: watch::Sender<TreeSnapshot>,
}

impl Orchestrator {
    pub fn new(
        session_id: SessionId,
        planner: Arc<dyn Planner>,
        executor: Arc<dyn Executor>,
        config: EngineConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(TreeSnapshot::empty());
        Self {
            session_id,
            tree: NodeTree::new(),
            planner,
            executor,
            broker: Arc::new(ApprovalBroker::new()),
            emitter: EventEmitter::new(),
            config,
            cancel: CancellationToken::new(),
            snapshots,
        }
    }

    /// Continue from an existing tree, e.g. one rebuilt from a snapshot.
    pub fn with_tree(mut self, tree: NodeTree) -> Self {
        self.tree = tree;
        self.publish();
        self
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    pub fn snapshot(&self) -> TreeSnapshot {
        self.tree.export_snapshot()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle::new(
            self.session_id.clone(),
            Arc::clone(&self.broker),
            self.emitter.clone(),
            self.cancel.clone(),
            self.snapshots.subscribe(),
        )
    }

    /// Process one user message: plan a root if there is none, then expand
    /// and execute nodes until the tree is complete or the loop has to stop.
    ///
    /// Collaborator failures fail the affected node and the loop goes on.
    /// Tree contract violations end the loop with `Err`.
    pub async fn handle_message(&mut self, message: &str) -> Result<SessionOutcome, EngineError> {
        info!(session_id = %self.session_id, "handling message");
        if self.tree.is_empty() {
            self.create_root(message).await?;
        }

        let max_iterations = self.config.max_iterations;
        let mut steps_executed = 0u32;
        let stop = loop {
            if self.cancel.is_cancelled() {
                self.emit_error(None, "cancelled", "session cancelled");
                break LoopStop::Cancelled;
            }
            if is_complete(&self.tree) {
                self.emit(EventKind::Completion, None, json!("all tasks completed"));
                break LoopStop::Complete;
            }
            if steps_executed >= max_iterations {
                self.emit_error(
                    None,
                    "max_iterations",
                    &format!("stopped after {max_iterations} iterations with work remaining"),
                );
                break LoopStop::MaxIterationsExceeded { max_iterations };
            }
            let Some(node) = find_next_pending(&self.tree) else {
                self.emit_error(
                    None,
                    "no_eligible_node",
                    "no eligible node but tree is incomplete",
                );
                break LoopStop::NoEligibleNode;
            };
            let (id, status) = (node.id.clone(), node.status);
            let thinking = format!("[depth {}] preparing: {}", node.depth, node.intent);
            self.emit(EventKind::Thinking, Some(&id), Value::String(thinking));

            let result = match status {
                NodeStatus::Stub => self.expand_node(&id).await,
                _ => self.execute_node(&id).await,
            };
            steps_executed += 1;

            if let Err(err) = result {
                self.recover(&id, err)?;
            }
        };

        info!(session_id = %self.session_id, steps_executed, stop = ?stop, "message handled");
        Ok(SessionOutcome {
            steps_executed,
            stop,
        })
    }

    async fn create_root(&mut self, message: &str) -> Result<(), EngineError> {
        let plan = match self.planner.create_plan(message).await {
            Ok(plan) => plan,
            Err(err) => {
                self.emit_error(None, err.error_kind(), &err.to_string());
                return Err(err.into());
            }
        };
        self.emit(EventKind::Explanation, None, Value::String(plan.summary));
        let root = self.tree.create_root(plan.payload, message)?.clone();
        debug!(session_id = %self.session_id, node_id = %root.id, "root created");
        self.publish();
        self.emit(
            EventKind::NodeUpdate,
            Some(&root.id),
            json!({ "action": "created", "node": root }),
        );
        Ok(())
    }

    /// Fail a node after a non-fatal error, or give up on a fatal one.
    fn recover(&mut self, id: &NodeId, err: EngineError) -> Result<(), EngineError> {
        let kind = match &err {
            EngineError::Collaborator(inner) => inner.error_kind(),
            EngineError::Approval(_) => "approval",
            _ if err.is_fatal() => {
                error!(
                    session_id = %self.session_id,
                    node_id = %id,
                    error = %err,
                    "session aborted"
                );
                self.emit_error(Some(id), "fatal", &err.to_string());
                return Err(err);
            }
            _ => "engine",
        };
        let path = node_path(&self.tree, id).unwrap_or_else(|| id.to_string());
        warn!(session_id = %self.session_id, %path, kind, error = %err, "node failed");
        self.fail_node(id, kind, &err.to_string())
    }

    /// Move `id` to its failure state, record the error and report it.
    pub(crate) fn fail_node(
        &mut self,
        id: &NodeId,
        kind: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        let status = self.tree.node(id)?.status;
        match status {
            NodeStatus::WaitingApproval => self.transition(id, NodeStatus::Rejected)?,
            NodeStatus::Pending | NodeStatus::Approved => {
                self.transition(id, NodeStatus::Executing)?;
                self.transition(id, NodeStatus::Failed)?;
            }
            _ => self.transition(id, NodeStatus::Failed)?,
        }
        self.tree.set_error(id, message)?;
        if self.tree.node(id)?.execution_result.is_none() && status != NodeStatus::Planning {
            self.tree
                .set_execution_result(id, json!({ "error": message }))?;
        }
        self.publish();
        self.emit_error(Some(id), kind, message);
        Ok(())
    }

    /// Apply a status change and report it.
    pub(crate) fn transition(&mut self, id: &NodeId, to: NodeStatus) -> Result<(), EngineError> {
        let from = self.tree.update_status(id, to)?;
        debug!(session_id = %self.session_id, node_id = %id, %from, %to, "status changed");
        self.publish();
        self.emit(
            EventKind::NodeUpdate,
            Some(id),
            json!({ "action": "status_changed", "from": from, "to": to }),
        );
        Ok(())
    }

    pub(crate) fn publish(&self) {
        self.snapshots.send_replace(self.tree.export_snapshot());
    }

    pub(crate) fn emit(&self, kind: EventKind, node_id: Option<&NodeId>, content: Value) {
        self.emitter.emit(Event::new(
            kind,
            self.session_id.clone(),
            node_id.cloned(),
            content,
        ));
    }

    pub(crate) fn emit_error(&self, node_id: Option<&NodeId>, kind: &str, message: &str) {
        self.emit(
            EventKind::Error,
            node_id,
            json!({ "kind": kind, "message": message }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Expansion;
    use crate::error::{CollaboratorError, TreeError};
    use crate::test_support::{ScriptedExecutor, ScriptedPlanner, drain, drive_to, tool_call};

    fn child(intent: &str) -> Expansion {
        Expansion {
            payload: format!("{intent}()"),
            intent: intent.to_string(),
        }
    }

    fn orchestrator(planner: ScriptedPlanner, executor: ScriptedExecutor) -> Orchestrator {
        Orchestrator::new(
            SessionId::from("session_test"),
            Arc::new(planner),
            Arc::new(executor),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn single_concrete_root_completes() {
        let mut orch = orchestrator(
            ScriptedPlanner::new("print()", "just print"),
            ScriptedExecutor::default(),
        );
        let (_, mut rx) = orch.emitter.subscribe_channel();

        let outcome = orch.handle_message("say hi").await.expect("outcome");
        assert_eq!(outcome.stop, LoopStop::Complete);
        assert_eq!(outcome.steps_executed, 2);

        let root = orch.tree().root().expect("root");
        assert_eq!(root.status, NodeStatus::Completed);
        assert_eq!(root.intent, "say hi");

        let kinds: Vec<_> = drain(&mut rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::Explanation));
        assert_eq!(kinds.last(), Some(&EventKind::Completion));
        assert_eq!(kinds.iter().filter(|k| **k == EventKind::Thinking).count(), 2);
    }

    #[tokio::test]
    async fn create_plan_failure_is_reported_and_returned() {
        let planner = ScriptedPlanner::failing_plan("planner offline");
        let mut orch = orchestrator(planner, ScriptedExecutor::default());
        let (_, mut rx) = orch.emitter.subscribe_channel();

        let err = orch.handle_message("anything").await.unwrap_err();
        assert!(matches!(err, EngineError::Collaborator(CollaboratorError::Planning(_))));
        assert!(orch.tree().is_empty());
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
    }

    #[tokio::test]
    async fn planning_failure_fails_only_that_node() {
        let planner = ScriptedPlanner::new("root()", "two parts")
            .expand("root", vec![child("a"), child("b")])
            .fail("a", "cannot split a");
        let mut orch = orchestrator(planner, ScriptedExecutor::default());

        let outcome = orch.handle_message("root").await.expect("outcome");
        assert_eq!(outcome.stop, LoopStop::Complete);

        let statuses: Vec<_> = orch
            .tree()
            .nodes()
            .map(|n| (n.intent.clone(), n.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("root".to_string(), NodeStatus::Planned),
                ("a".to_string(), NodeStatus::Failed),
                ("b".to_string(), NodeStatus::Completed),
            ]
        );
        let a = orch.tree().nodes().nth(1).expect("a");
        assert_eq!(a.error.as_deref(), Some("planning failed: cannot split a"));
    }

    #[tokio::test]
    async fn max_iterations_leaves_tree_incomplete() {
        let planner = ScriptedPlanner::new("root()", "deep").expand("root", vec![child("a")]);
        let mut orch = orchestrator(planner, ScriptedExecutor::default());
        orch.config.max_iterations = 1;

        let outcome = orch.handle_message("root").await.expect("outcome");
        assert_eq!(
            outcome.stop,
            LoopStop::MaxIterationsExceeded { max_iterations: 1 }
        );
        assert!(!is_complete(orch.tree()));

        orch.config.max_iterations = 10;
        let resumed = orch.handle_message("continue").await.expect("outcome");
        assert_eq!(resumed.stop, LoopStop::Complete);
    }

    #[tokio::test]
    async fn stubs_at_max_depth_are_executed_directly() {
        let planner = ScriptedPlanner::new("root()", "deep")
            .expand("root", vec![child("a")])
            .expand("a", vec![child("a1")]);
        let mut orch = orchestrator(planner.clone(), ScriptedExecutor::default());
        orch.config.max_depth = 1;

        orch.handle_message("root").await.expect("outcome");
        assert_eq!(orch.tree().len(), 2);
        assert_eq!(planner.expand_calls(), 1);
        let a = orch.tree().nodes().nth(1).expect("a");
        assert_eq!(a.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn cancelled_session_stops_before_work() {
        let mut orch = orchestrator(
            ScriptedPlanner::new("print()", "p"),
            ScriptedExecutor::default(),
        );
        orch.handle().cancel();
        let outcome = orch.handle_message("x").await.expect("outcome");
        assert_eq!(outcome.stop, LoopStop::Cancelled);
        assert_eq!(outcome.steps_executed, 0);
        assert_eq!(orch.tree().root().expect("root").status, NodeStatus::Stub);
    }

    #[tokio::test]
    async fn snapshots_are_published_to_handles() {
        let mut orch = orchestrator(
            ScriptedPlanner::new("print()", "p"),
            ScriptedExecutor::default(),
        );
        let handle = orch.handle();
        assert!(handle.snapshot().nodes.is_empty());
        orch.handle_message("x").await.expect("outcome");
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.nodes.len(), 1);
        assert_eq!(snapshot.nodes[0].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn resumed_tree_skips_planning() {
        let mut tree = NodeTree::new();
        tree.create_root("print()", "existing").expect("root");
        let planner = ScriptedPlanner::new("ignored()", "ignored");
        let mut orch =
            orchestrator(planner.clone(), ScriptedExecutor::default()).with_tree(tree);

        orch.handle_message("again").await.expect("outcome");
        assert_eq!(planner.plan_calls(), 0);
        assert_eq!(orch.tree().root().expect("root").intent, "existing");
    }

    #[tokio::test]
    async fn waiting_tree_without_listener_has_no_eligible_node() {
        let mut tree = NodeTree::new();
        let root = tree.create_root("publish()", "ship").expect("root").id.clone();
        drive_to(&mut tree, &root, NodeStatus::Pending);
        tree.attach_tool_call(&root, tool_call("publish", true))
            .expect("attach");
        tree.mark_approval_required(&root).expect("mark");
        tree.update_status(&root, NodeStatus::WaitingApproval)
            .expect("wait");
        let rebuilt = NodeTree::from_snapshot(&tree.export_snapshot()).expect("rebuild");

        let mut orch = orchestrator(ScriptedPlanner::default(), ScriptedExecutor::default())
            .with_tree(rebuilt);
        let (_, mut rx) = orch.emitter.subscribe_channel();

        let outcome = orch.handle_message("resume").await.expect("outcome");
        assert_eq!(outcome.stop, LoopStop::NoEligibleNode);
        assert_eq!(outcome.steps_executed, 0);

        let events = drain(&mut rx);
        let errors: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content["kind"], "no_eligible_node");
        assert!(events.iter().all(|e| e.kind != EventKind::Completion));
    }

    #[tokio::test]
    async fn illegal_transition_aborts_with_fatal_event() {
        let mut orch = orchestrator(
            ScriptedPlanner::new("print()", "p"),
            ScriptedExecutor::default(),
        );
        let root = orch.tree.create_root("print()", "root").expect("root").id.clone();
        let (_, mut rx) = orch.emitter.subscribe_channel();

        let err = orch.transition(&root, NodeStatus::Completed).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Tree(TreeError::IllegalTransition {
                from: NodeStatus::Stub,
                to: NodeStatus::Completed,
                ..
            })
        ));
        assert!(drain(&mut rx).is_empty());

        let returned = orch.recover(&root, err).unwrap_err();
        assert!(matches!(
            returned,
            EngineError::Tree(TreeError::IllegalTransition { .. })
        ));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(events[0].content["kind"], "fatal");
        assert_eq!(events[0].node_id.as_ref(), Some(&root));

        // The node is left as it was and the tree can still be exported.
        assert_eq!(orch.tree().get(&root).expect("root").status, NodeStatus::Stub);
        assert_eq!(orch.snapshot().nodes.len(), 1);
    }
}
