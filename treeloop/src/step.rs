//! Per-node steps of the session loop: expansion and execution.

use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::approval::Decision;
use crate::collab::AncestorContext;
use crate::core::status::NodeStatus;
use crate::core::types::{NodeId, ToolCall, ToolResult};
use crate::error::{CollaboratorError, EngineError};
use crate::events::EventKind;
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Expand a stub into children, or promote it to `pending` when it is
    /// concrete or too deep to expand.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub(crate) async fn expand_node(&mut self, id: &NodeId) -> Result<(), EngineError> {
        let node = self.tree.node(id)?.clone();
        self.transition(id, NodeStatus::Planning)?;

        if node.depth >= self.config.max_depth {
            debug!(depth = node.depth, "max depth reached; promoting");
            self.transition(id, NodeStatus::Planned)?;
            self.transition(id, NodeStatus::Pending)?;
            self.emit(
                EventKind::Explanation,
                Some(id),
                Value::String(format!(
                    "'{}' is at depth {}; executing it directly",
                    node.intent, node.depth
                )),
            );
            return Ok(());
        }

        let context = AncestorContext::for_node(&self.tree, id)?;
        let expansions = self.planner.expand(&node, &context).await?;

        let mut children = Vec::with_capacity(expansions.len());
        for expansion in expansions {
            let child = self
                .tree
                .add_node(id, expansion.payload, expansion.intent)?
                .clone();
            children.push(child);
        }
        self.transition(id, NodeStatus::Planned)?;

        if children.is_empty() {
            self.emit(
                EventKind::Explanation,
                Some(id),
                Value::String(format!("'{}' is concrete; queued for execution", node.intent)),
            );
            self.transition(id, NodeStatus::Pending)?;
            return Ok(());
        }

        let mut lines = vec![format!("split '{}' into:", node.intent)];
        lines.extend(
            children
                .iter()
                .enumerate()
                .map(|(idx, child)| format!("{}. {}", idx + 1, child.intent)),
        );
        self.emit(EventKind::Explanation, Some(id), Value::String(lines.join("\n")));
        for child in children {
            self.emit(
                EventKind::NodeUpdate,
                Some(&child.id),
                json!({ "action": "created", "node": child }),
            );
        }
        info!("node expanded");
        Ok(())
    }

    /// Run a pending node's tool calls in order, gating each one that needs
    /// approval.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub(crate) async fn execute_node(&mut self, id: &NodeId) -> Result<(), EngineError> {
        let payload = self.tree.node(id)?.payload.clone();
        let calls = self.executor.extract_tool_calls(&payload).await?;

        if calls.is_empty() {
            self.transition(id, NodeStatus::Executing)?;
            self.transition(id, NodeStatus::Completed)?;
            return Ok(());
        }

        for call in &calls {
            self.tree.attach_tool_call(id, call.clone())?;
        }
        self.publish();

        let mut last_output = Value::Null;
        for call in &calls {
            if call.requires_approval {
                match self.request_approval(id, call).await? {
                    Decision::Approved => {
                        self.tree.mark_approved(id, &call.id)?;
                        self.transition(id, NodeStatus::Approved)?;
                        self.transition(id, NodeStatus::Executing)?;
                    }
                    Decision::Rejected { reason } => {
                        info!(tool_call_id = %call.id, ?reason, "tool call rejected");
                        self.transition(id, NodeStatus::Rejected)?;
                        self.tree.set_error(id, reason.describe())?;
                        self.publish();
                        self.emit(
                            EventKind::Explanation,
                            Some(id),
                            Value::String(format!(
                                "rejected: {} ({})",
                                call.description,
                                reason.describe()
                            )),
                        );
                        return Ok(());
                    }
                }
            } else if self.tree.node(id)?.status != NodeStatus::Executing {
                self.transition(id, NodeStatus::Executing)?;
            }

            let result = self.run_tool(id, call).await?;
            if !result.success {
                let reason = result
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string());
                let message = format!("{}: {reason}", call.name);
                return Err(CollaboratorError::ToolExecution(message).into());
            }
            last_output = result.output;
        }

        self.tree.set_execution_result(id, last_output)?;
        self.transition(id, NodeStatus::Completed)?;
        Ok(())
    }

    /// Put the node in `waiting_approval`, announce the request and wait for
    /// the decision.
    async fn request_approval(
        &mut self,
        id: &NodeId,
        call: &ToolCall,
    ) -> Result<Decision, EngineError> {
        self.tree.mark_approval_required(id)?;
        self.transition(id, NodeStatus::WaitingApproval)?;
        self.broker
            .register(id, &call.id, self.config.approval_timeout())?;

        self.emit(
            EventKind::ApprovalRequest,
            Some(id),
            json!({
                "node_id": id,
                "tool_call": call,
                "explanation": format!("approval needed: {}", call.description),
            }),
        );
        let decision = self.broker.await_resolution(&call.id, &self.cancel).await?;
        Ok(decision)
    }

    async fn run_tool(&mut self, id: &NodeId, call: &ToolCall) -> Result<ToolResult, EngineError> {
        self.emit(
            EventKind::Explanation,
            Some(id),
            Value::String(format!("running: {}", call.description)),
        );
        let result = match self.executor.execute_tool(call).await {
            Ok(result) => result,
            Err(err) => {
                let failure = ToolResult::failure(err.to_string());
                self.tree.record_tool_result(id, &call.id, failure)?;
                self.publish();
                return Err(err.into());
            }
        };
        self.tree.record_tool_result(id, &call.id, result.clone())?;
        self.publish();
        if let Some(task_id) = &result.task_id {
            self.emit(
                EventKind::TaskCreated,
                Some(id),
                json!({
                    "task_id": task_id,
                    "tool_call_id": call.id,
                    "description": call.description,
                }),
            );
        }
        Ok(result)
    }
}
