//! Test-only helpers: tree builders, scripted collaborators and a recording
//! event sink.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use crate::collab::{AncestorContext, Executor, Expansion, Plan, Planner};
use crate::core::status::{NodeStatus, TRANSITIONS};
use crate::core::types::{NodeId, ToolCall, ToolCallId, ToolResult};
use crate::error::CollaboratorError;
use crate::events::{Event, EventSink};
use crate::tree::{Node, NodeTree};

/// A tool call with a fresh id and empty arguments.
pub fn tool_call(name: &str, requires_approval: bool) -> ToolCall {
    ToolCall {
        id: ToolCallId::generate(),
        name: name.to_string(),
        args: json!({}),
        requires_approval,
        description: format!("run {name}"),
    }
}

/// Walk `id` to `target` along the shortest chain of legal transitions.
///
/// Panics if `target` is unreachable from the node's current status.
pub fn drive_to(tree: &mut NodeTree, id: &NodeId, target: NodeStatus) {
    let start = tree.get(id).expect("node exists").status;
    let mut previous: HashMap<NodeStatus, NodeStatus> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(status) = queue.pop_front() {
        if status == target {
            break;
        }
        for &(from, to) in TRANSITIONS {
            if from == status && to != start && !previous.contains_key(&to) {
                previous.insert(to, from);
                queue.push_back(to);
            }
        }
    }

    let mut route = vec![target];
    while let Some(&prev) = route.last().and_then(|status| previous.get(status)) {
        route.push(prev);
    }
    route.reverse();
    assert_eq!(route[0], start, "no legal route from {start} to {target}");
    for status in route.into_iter().skip(1) {
        tree.update_status(id, status).expect("legal transition");
    }
}

/// Everything currently queued on an event channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
    notify: Notify,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Wait until at least `count` events arrived; panics after 5 seconds.
    pub async fn wait_for(&self, count: usize) -> Vec<Event> {
        let wait = async {
            loop {
                {
                    let events = self.events.lock();
                    if events.len() >= count {
                        return events.clone();
                    }
                }
                self.notify.notified().await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("events arrived in time")
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn receive(&self, event: &Event) -> anyhow::Result<()> {
        self.events.lock().push(event.clone());
        self.notify.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct PlannerScript {
    plan: Option<Plan>,
    plan_error: Option<String>,
    children: HashMap<String, Vec<Expansion>>,
    failures: HashMap<String, String>,
}

/// Planner whose answers are keyed by node intent. Clones share call counts.
#[derive(Clone, Default)]
pub struct ScriptedPlanner {
    script: Arc<Mutex<PlannerScript>>,
    plan_calls: Arc<AtomicUsize>,
    expand_calls: Arc<AtomicUsize>,
}

impl ScriptedPlanner {
    pub fn new(payload: &str, summary: &str) -> Self {
        let planner = Self::default();
        planner.script.lock().plan = Some(Plan {
            payload: payload.to_string(),
            summary: summary.to_string(),
        });
        planner
    }

    pub fn failing_plan(message: &str) -> Self {
        let planner = Self::default();
        planner.script.lock().plan_error = Some(message.to_string());
        planner
    }

    pub fn expand(self, intent: &str, children: Vec<Expansion>) -> Self {
        self.script
            .lock()
            .children
            .insert(intent.to_string(), children);
        self
    }

    pub fn fail(self, intent: &str, message: &str) -> Self {
        self.script
            .lock()
            .failures
            .insert(intent.to_string(), message.to_string());
        self
    }

    pub fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    pub fn expand_calls(&self) -> usize {
        self.expand_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn create_plan(&self, _intent: &str) -> Result<Plan, CollaboratorError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if let Some(message) = &script.plan_error {
            return Err(CollaboratorError::Planning(message.clone()));
        }
        script
            .plan
            .clone()
            .ok_or_else(|| CollaboratorError::Planning("no plan scripted".to_string()))
    }

    async fn expand(
        &self,
        node: &Node,
        _context: &AncestorContext,
    ) -> Result<Vec<Expansion>, CollaboratorError> {
        self.expand_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock();
        if let Some(message) = script.failures.get(&node.intent) {
            return Err(CollaboratorError::Planning(message.clone()));
        }
        Ok(script.children.get(&node.intent).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
struct ExecutorScript {
    calls: HashMap<String, Vec<ToolCall>>,
    extraction_failures: HashMap<String, String>,
    results: HashMap<String, Result<ToolResult, CollaboratorError>>,
    executed: Vec<ToolCallId>,
}

/// Executor keyed by payload (for extraction) and tool name (for results).
///
/// Unscripted payloads have no tool calls; unscripted tools succeed with a
/// `null` output. Clones share the script and the execution log.
#[derive(Clone, Default)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<ExecutorScript>>,
}

impl ScriptedExecutor {
    pub fn with_calls(self, payload: &str, calls: Vec<ToolCall>) -> Self {
        self.script.lock().calls.insert(payload.to_string(), calls);
        self
    }

    pub fn with_result(self, tool: &str, result: Result<ToolResult, CollaboratorError>) -> Self {
        self.script.lock().results.insert(tool.to_string(), result);
        self
    }

    pub fn failing_extraction(self, payload: &str, message: &str) -> Self {
        self.script
            .lock()
            .extraction_failures
            .insert(payload.to_string(), message.to_string());
        self
    }

    /// Ids of executed tool calls, in execution order.
    pub fn executed(&self) -> Vec<ToolCallId> {
        self.script.lock().executed.clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn extract_tool_calls(&self, payload: &str) -> Result<Vec<ToolCall>, CollaboratorError> {
        let script = self.script.lock();
        if let Some(message) = script.extraction_failures.get(payload) {
            return Err(CollaboratorError::ToolExtraction(message.clone()));
        }
        Ok(script.calls.get(payload).cloned().unwrap_or_default())
    }

    async fn execute_tool(&self, call: &ToolCall) -> Result<ToolResult, CollaboratorError> {
        let mut script = self.script.lock();
        script.executed.push(call.id.clone());
        script
            .results
            .get(&call.name)
            .cloned()
            .unwrap_or_else(|| Ok(ToolResult::ok(Value::Null)))
    }
}
