//! Node-tree execution engine.
//!
//! A session expands a task into a tree of work items, executes the leaves
//! and gates side-effecting tool calls behind human approval, streaming every
//! state change to observers. The crate is split into:
//!
//! - **[`core`]**: Pure, deterministic logic (status table, selection,
//!   invariants). No I/O, fully testable in isolation.
//! - **[`tree`]**, **[`approval`]**, **[`events`]**: The session's state and
//!   synchronization primitives.
//! - **[`orchestrator`]** and [`step`]: The session loop that drives the
//!   [`collab`] planner and executor.
//! - **[`io`]**: Config, snapshot and scenario files used by the CLI.

pub mod approval;
pub mod collab;
pub mod core;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
pub mod tree;
pub mod validate;
