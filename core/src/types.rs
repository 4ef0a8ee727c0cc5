//! Shared primitive types used across the entire engine.

/// A simulation tick. Every branch counts ticks on the same scale.
pub type Tick = u64;

/// Stable branch identifier, e.g. `branch_100_4821`. The main timeline is `main`.
pub type BranchId = String;

/// Stable identity of an entity across every branch it was forked into.
/// Allocated once, never reused, never arena-local.
pub type OriginId = u64;

/// The canonical run identifier.
pub type RunId = String;

/// Id of the main timeline inside every registry.
pub const MAIN_BRANCH_ID: &str = "main";
