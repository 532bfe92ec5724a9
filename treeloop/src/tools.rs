//! Tool table and the call-syntax executor.
//!
//! Tools are looked up by name in an immutable [`ToolTable`] built once at
//! startup. [`CallSyntaxExecutor`] finds `name(key=value, ...)` calls in a
//! payload and keeps the ones whose name is in the table.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::collab::Executor;
use crate::core::types::{ToolCall, ToolCallId, ToolResult};
use crate::error::CollaboratorError;

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)(\w+)\s*\((.*?)\)").unwrap());
static ARG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w+)\s*=\s*([^,]+)").unwrap());

/// Longest prompt excerpt shown in a tool-call description.
const DESCRIPTION_EXCERPT_CHARS: usize = 50;

pub type ToolArgs = Map<String, Value>;

/// A named side-effecting operation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn describe(&self, _args: &ToolArgs) -> String {
        format!("run {}", self.name())
    }

    fn requires_approval(&self, _args: &ToolArgs) -> bool {
        false
    }

    /// Reject malformed arguments before the tool runs.
    fn validate(&self, _args: &ToolArgs) -> Result<(), String> {
        Ok(())
    }

    async fn call(&self, args: &ToolArgs) -> Result<ToolResult, CollaboratorError>;
}

/// Immutable name-to-tool mapping.
#[derive(Clone, Default)]
pub struct ToolTable {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolTable {
    pub fn builder() -> ToolTableBuilder {
        ToolTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Default)]
pub struct ToolTableBuilder {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolTableBuilder {
    /// Add a tool. A later tool with the same name replaces the earlier one.
    pub fn register(mut self, tool: Arc<dyn Tool>) -> Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "tool registered twice; keeping the later one");
        }
        self
    }

    /// The stock media and conversation tools.
    pub fn with_standard_tools(self) -> Self {
        self.register(Arc::new(MediaTool::image()))
            .register(Arc::new(MediaTool::video()))
            .register(Arc::new(AskTool))
    }

    pub fn build(self) -> ToolTable {
        ToolTable { tools: self.tools }
    }
}

/// Parse `key=value` pairs the way call sites write them.
///
/// Quotes are stripped, `true`/`false` become booleans and digit-only values
/// become integers. Everything else stays a string.
pub fn parse_args(raw: &str) -> ToolArgs {
    let mut args = ToolArgs::new();
    for caps in ARG_RE.captures_iter(raw) {
        let key = caps[1].to_string();
        let value = coerce_value(caps[2].trim());
        args.insert(key, value);
    }
    args
}

fn coerce_value(raw: &str) -> Value {
    let unquoted = strip_quotes(raw);
    if unquoted.len() != raw.len() {
        return Value::String(unquoted.to_string());
    }
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse::<u64>()
            .map_or_else(|_| Value::String(raw.to_string()), Value::from);
    }
    Value::String(raw.to_string())
}

fn strip_quotes(raw: &str) -> &str {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return &raw[1..raw.len() - 1];
        }
    }
    raw
}

fn excerpt(args: &ToolArgs, key: &str) -> String {
    let text = args.get(key).and_then(Value::as_str).unwrap_or_default();
    let mut out: String = text.chars().take(DESCRIPTION_EXCERPT_CHARS).collect();
    if text.chars().count() > DESCRIPTION_EXCERPT_CHARS {
        out.push_str("...");
    }
    out
}

fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

/// Executor that reads call syntax from payloads and dispatches through a
/// [`ToolTable`].
pub struct CallSyntaxExecutor {
    tools: ToolTable,
}

impl CallSyntaxExecutor {
    pub fn new(tools: ToolTable) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }
}

#[async_trait]
impl Executor for CallSyntaxExecutor {
    async fn extract_tool_calls(&self, payload: &str) -> Result<Vec<ToolCall>, CollaboratorError> {
        let mut calls = Vec::new();
        for caps in CALL_RE.captures_iter(payload) {
            let name = &caps[1];
            let Some(tool) = self.tools.get(name) else {
                continue;
            };
            let args = parse_args(&caps[2]);
            calls.push(ToolCall {
                id: ToolCallId::generate(),
                name: name.to_string(),
                description: tool.describe(&args),
                requires_approval: tool.requires_approval(&args),
                args: Value::Object(args),
            });
        }
        debug!(count = calls.len(), "extracted tool calls");
        Ok(calls)
    }

    async fn execute_tool(&self, call: &ToolCall) -> Result<ToolResult, CollaboratorError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| {
                CollaboratorError::ToolValidation(format!("unknown tool '{}'", call.name))
            })?;
        let args = match &call.args {
            Value::Object(map) => map.clone(),
            Value::Null => ToolArgs::new(),
            other => {
                return Err(CollaboratorError::ToolValidation(format!(
                    "arguments for '{}' must be an object, got {other}",
                    call.name
                )));
            }
        };
        tool.validate(&args).map_err(|reason| {
            CollaboratorError::ToolValidation(format!("{}: {reason}", call.name))
        })?;
        tool.call(&args).await
    }
}

/// Submits an external media generation task and returns its task id.
///
/// Approval is required when the call sets `request_review=true`.
pub struct MediaTool {
    name: &'static str,
    label: &'static str,
    task_prefix: &'static str,
}

impl MediaTool {
    pub fn image() -> Self {
        Self {
            name: "generate_image",
            label: "generate image",
            task_prefix: "img",
        }
    }

    pub fn video() -> Self {
        Self {
            name: "generate_video",
            label: "generate video",
            task_prefix: "vid",
        }
    }
}

#[async_trait]
impl Tool for MediaTool {
    fn name(&self) -> &str {
        self.name
    }

    fn describe(&self, args: &ToolArgs) -> String {
        format!("{}: {}", self.label, excerpt(args, "prompt"))
    }

    fn requires_approval(&self, args: &ToolArgs) -> bool {
        args.get("request_review")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn validate(&self, args: &ToolArgs) -> Result<(), String> {
        match args.get("prompt") {
            Some(Value::String(prompt)) if !prompt.trim().is_empty() => Ok(()),
            Some(_) => Err("prompt must be a non-empty string".to_string()),
            None => Err("missing required argument 'prompt'".to_string()),
        }
    }

    async fn call(&self, args: &ToolArgs) -> Result<ToolResult, CollaboratorError> {
        let task_id = short_id(self.task_prefix);
        Ok(ToolResult::submitted(
            task_id,
            json!({ "prompt": args.get("prompt").cloned().unwrap_or(Value::Null) }),
        ))
    }
}

/// Answers a question without side effects.
pub struct AskTool;

#[async_trait]
impl Tool for AskTool {
    fn name(&self) -> &str {
        "ask"
    }

    fn describe(&self, args: &ToolArgs) -> String {
        format!("ask: {}", excerpt(args, "question"))
    }

    async fn call(&self, args: &ToolArgs) -> Result<ToolResult, CollaboratorError> {
        let question = args.get("question").and_then(Value::as_str).unwrap_or_default();
        Ok(ToolResult::ok(json!({ "answer": format!("noted: {question}") })))
    }
}
