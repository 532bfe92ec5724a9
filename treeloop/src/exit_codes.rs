//! Stable exit codes for treeloop CLI commands.

/// The session completed, or the snapshot is valid.
pub const OK: i32 = 0;
/// Invalid scenario/config/snapshot or an engine error.
pub const INVALID: i32 = 1;
/// The session stopped with work remaining.
pub const INCOMPLETE: i32 = 2;
/// The session was cancelled.
pub const CANCELLED: i32 = 3;
