//! Scripted sessions loaded from TOML.
//!
//! A scenario fixes the root plan, the children each intent expands into and
//! any extra tools, so a session can run end to end without a model:
//!
//! ```toml
//! [plan]
//! payload = "make_poster()"
//! summary = "Draft and render a poster"
//!
//! [[expand]]
//! intent = "Make a poster"
//! children = [
//!   { intent = "render", payload = 'generate_image(prompt="poster", request_review=true)' },
//! ]
//!
//! [[tools]]
//! name = "publish"
//! approval = "always"
//! required_args = ["channel"]
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::collab::{AncestorContext, Expansion, Plan, Planner};
use crate::core::types::ToolResult;
use crate::error::CollaboratorError;
use crate::tools::{Tool, ToolArgs, ToolTable};
use crate::tree::Node;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub plan: Plan,
    #[serde(default)]
    pub expand: Vec<ExpandRule>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

/// Children produced for nodes whose intent matches `intent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExpandRule {
    pub intent: String,
    #[serde(default)]
    pub children: Vec<Expansion>,
    /// Fail planning for this intent with the given message.
    #[serde(default)]
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalRule {
    Always,
    #[default]
    Never,
    /// Only when the call sets `request_review=true`.
    OnRequest,
}

/// A declarative tool with a canned result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub approval: ApprovalRule,
    #[serde(default)]
    pub required_args: Vec<String>,
    #[serde(default)]
    pub output: Option<Value>,
    /// Report a submitted external task with this id prefix.
    #[serde(default)]
    pub task_prefix: Option<String>,
    /// Report failure with this message instead of succeeding.
    #[serde(default)]
    pub fail: Option<String>,
}

impl Scenario {
    pub fn validate(&self) -> Result<()> {
        if self.plan.payload.trim().is_empty() {
            return Err(anyhow!("plan.payload must be non-empty"));
        }
        let mut seen = HashMap::new();
        for (idx, rule) in self.expand.iter().enumerate() {
            if let Some(prev) = seen.insert(rule.intent.as_str(), idx) {
                return Err(anyhow!(
                    "expand[{idx}] repeats intent '{}' from expand[{prev}]",
                    rule.intent
                ));
            }
        }
        for (idx, tool) in self.tools.iter().enumerate() {
            if tool.name.trim().is_empty() {
                return Err(anyhow!("tools[{idx}].name must be non-empty"));
            }
            if !tool.name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return Err(anyhow!(
                    "tools[{idx}].name '{}' must be a plain identifier",
                    tool.name
                ));
            }
        }
        Ok(())
    }

    pub fn planner(&self) -> ScriptedPlanner {
        ScriptedPlanner {
            plan: self.plan.clone(),
            rules: self
                .expand
                .iter()
                .map(|rule| (rule.intent.clone(), rule.clone()))
                .collect(),
        }
    }

    /// Stock tools plus the scenario's own; scenario tools win on name clashes.
    pub fn tool_table(&self) -> ToolTable {
        self.tools
            .iter()
            .fold(ToolTable::builder().with_standard_tools(), |builder, spec| {
                builder.register(Arc::new(ScenarioTool { spec: spec.clone() }))
            })
            .build()
    }
}

pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let scenario: Scenario =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    scenario
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(scenario)
}

/// Planner that replays a scenario's expansions by intent.
///
/// The root intent passed to `create_plan` becomes the root node's intent,
/// so an `[[expand]]` rule keyed on the user message expands the root.
#[derive(Debug, Clone)]
pub struct ScriptedPlanner {
    plan: Plan,
    rules: HashMap<String, ExpandRule>,
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn create_plan(&self, _intent: &str) -> Result<Plan, CollaboratorError> {
        Ok(self.plan.clone())
    }

    async fn expand(
        &self,
        node: &Node,
        _context: &AncestorContext,
    ) -> Result<Vec<Expansion>, CollaboratorError> {
        match self.rules.get(&node.intent) {
            Some(ExpandRule {
                fail: Some(message), ..
            }) => Err(CollaboratorError::Planning(message.clone())),
            Some(rule) => Ok(rule.children.clone()),
            None => Ok(Vec::new()),
        }
    }
}

struct ScenarioTool {
    spec: ToolSpec,
}

#[async_trait]
impl Tool for ScenarioTool {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn requires_approval(&self, args: &ToolArgs) -> bool {
        match self.spec.approval {
            ApprovalRule::Always => true,
            ApprovalRule::Never => false,
            ApprovalRule::OnRequest => args
                .get("request_review")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }

    fn validate(&self, args: &ToolArgs) -> Result<(), String> {
        let missing: Vec<_> = self
            .spec
            .required_args
            .iter()
            .filter(|arg| !args.contains_key(arg.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required arguments: {}", missing.join(", ")))
        }
    }

    async fn call(&self, args: &ToolArgs) -> Result<ToolResult, CollaboratorError> {
        if let Some(message) = &self.spec.fail {
            return Ok(ToolResult::failure(message.clone()));
        }
        let output = self
            .spec
            .output
            .clone()
            .unwrap_or_else(|| json!({ "tool": self.spec.name, "args": args }));
        Ok(match &self.spec.task_prefix {
            Some(prefix) => {
                let hex = Uuid::new_v4().simple().to_string();
                ToolResult::submitted(format!("{prefix}_{}", &hex[..8]), output)
            }
            None => ToolResult::ok(output),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Executor;
    use crate::tools::CallSyntaxExecutor;

    const POSTER: &str = r#"
[plan]
payload = "make_poster()"
summary = "Draft and render a poster"

[[expand]]
intent = "Make a poster"
children = [
  { intent = "render", payload = 'generate_image(prompt="poster")' },
  { intent = "ship", payload = 'publish(channel="web")' },
]

[[expand]]
intent = "broken"
fail = "no idea"

[[tools]]
name = "publish"
approval = "always"
required_args = ["channel"]
task_prefix = "pub"
"#;

    fn scenario() -> Scenario {
        let scenario: Scenario = toml::from_str(POSTER).expect("parse");
        scenario.validate().expect("valid");
        scenario
    }

    fn node_with_intent(intent: &str) -> Node {
        let mut tree = crate::tree::NodeTree::new();
        tree.create_root("x", intent).expect("root").clone()
    }

    #[tokio::test]
    async fn planner_replays_expansions_by_intent() {
        let planner = scenario().planner();
        let plan = planner.create_plan("Make a poster").await.expect("plan");
        assert_eq!(plan.payload, "make_poster()");

        let context = AncestorContext::default();
        let children = planner
            .expand(&node_with_intent("Make a poster"), &context)
            .await
            .expect("expand");
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].intent, "ship");

        let leaf = planner
            .expand(&node_with_intent("render"), &context)
            .await
            .expect("expand");
        assert!(leaf.is_empty());

        let err = planner
            .expand(&node_with_intent("broken"), &context)
            .await
            .unwrap_err();
        assert_eq!(err, CollaboratorError::Planning("no idea".to_string()));
    }

    #[tokio::test]
    async fn scenario_tools_join_the_standard_table() {
        let executor = CallSyntaxExecutor::new(scenario().tool_table());
        let calls = executor
            .extract_tool_calls(r#"publish(channel="web")"#)
            .await
            .expect("extract");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].requires_approval);

        let result = executor.execute_tool(&calls[0]).await.expect("execute");
        assert!(result.task_id.as_deref().is_some_and(|id| id.starts_with("pub_")));
        assert!(executor.tools().contains("generate_image"));
    }

    #[tokio::test]
    async fn missing_required_args_fail_validation() {
        let executor = CallSyntaxExecutor::new(scenario().tool_table());
        let calls = executor
            .extract_tool_calls("publish()")
            .await
            .expect("extract");
        let err = executor.execute_tool(&calls[0]).await.unwrap_err();
        assert!(matches!(
            err,
            CollaboratorError::ToolValidation(ref msg) if msg.contains("channel")
        ));
    }

    #[test]
    fn duplicate_intents_are_rejected() {
        let mut scenario = scenario();
        scenario.expand.push(scenario.expand[0].clone());
        let err = scenario.validate().unwrap_err();
        assert!(err.to_string().contains("repeats intent"));
    }

    #[test]
    fn load_scenario_reports_path_on_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("bad.toml");
        fs::write(&path, "[plan]\npayload = 1\n").expect("write");
        let err = load_scenario(&path).unwrap_err();
        assert!(format!("{err:#}").contains("bad.toml"));
    }
}
