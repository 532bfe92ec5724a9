//! Snapshot load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde_json::Value;

use crate::core::invariants::validate_snapshot;
use crate::tree::TreeSnapshot;

pub const SNAPSHOT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/snapshot/v1.schema.json"
));

/// Write a snapshot as pretty JSON with a trailing newline.
pub fn write_snapshot(path: &Path, snapshot: &TreeSnapshot) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(snapshot).context("serialize snapshot")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

/// Load and validate a snapshot from disk (schema + invariants).
pub fn load_snapshot(path: &Path) -> Result<TreeSnapshot> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read snapshot {}", path.display()))?;
    parse_snapshot(&contents).with_context(|| format!("load snapshot {}", path.display()))
}

/// Parse and validate snapshot JSON.
pub fn parse_snapshot(raw: &str) -> Result<TreeSnapshot> {
    let value: Value = serde_json::from_str(raw).context("parse snapshot json")?;
    validate_schema(&value)?;
    let snapshot: TreeSnapshot =
        serde_json::from_value(value).context("deserialize snapshot")?;
    let errors = validate_snapshot(&snapshot);
    if !errors.is_empty() {
        return Err(anyhow!(
            "invariant violations:\n- {}",
            errors.join("\n- ")
        ));
    }
    Ok(snapshot)
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value =
        serde_json::from_str(SNAPSHOT_SCHEMA).context("parse snapshot schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile snapshot schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(
            "schema validation failed:\n- {}",
            messages.join("\n- ")
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::status::NodeStatus;
    use crate::test_support::{drive_to, tool_call};
    use crate::tree::NodeTree;

    fn sample_snapshot() -> TreeSnapshot {
        let mut tree = NodeTree::new();
        let root = tree.create_root("main()", "root").expect("root").id.clone();
        drive_to(&mut tree, &root, NodeStatus::Planned);
        let child = tree
            .add_node(&root, "generate_image(prompt=\"x\")", "draw")
            .expect("child")
            .id
            .clone();
        drive_to(&mut tree, &child, NodeStatus::Pending);
        tree.attach_tool_call(&child, tool_call("generate_image", true))
            .expect("attach");
        tree.export_snapshot()
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("snapshot.json");
        let snapshot = sample_snapshot();
        write_snapshot(&path, &snapshot).expect("write");
        let loaded = load_snapshot(&path).expect("load");
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn empty_snapshot_is_valid() {
        let raw = serde_json::to_string(&TreeSnapshot::empty()).expect("serialize");
        parse_snapshot(&raw).expect("valid");
    }

    #[test]
    fn unknown_status_fails_schema() {
        let mut value = serde_json::to_value(sample_snapshot()).expect("value");
        value["nodes"][0]["status"] = Value::String("done".to_string());
        let err = parse_snapshot(&value.to_string()).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn broken_parent_link_fails_invariants() {
        let mut snapshot = sample_snapshot();
        snapshot.nodes[1].parent = Some("node_elsewhere".into());
        let raw = serde_json::to_string(&snapshot).expect("serialize");
        let err = parse_snapshot(&raw).unwrap_err();
        assert!(format!("{err:#}").contains("invariant violations"));
    }
}
