//! Pure tree logic: the status table, traversal and structural checks.
//!
//! Nothing in here awaits, locks or touches the filesystem; the orchestrator
//! and the CLI build on these functions.

pub mod invariants;
pub mod path;
pub mod selector;
pub mod status;
pub mod types;
