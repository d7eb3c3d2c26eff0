//! Shared domain types for the forge-grid coordinator.
//!
//! Everything here is plain data: issues and comments mirrored from the
//! tracker, the label vocabulary, executions and their checkpoints, and the
//! local per-issue state the coordinator keeps between cycles.

pub mod classification;
pub mod execution;
pub mod issue;
pub mod label;

pub use classification::{Category, Classification};
pub use execution::{Checkpoint, Execution, ExecutionMode, ExecutionStatus};
pub use issue::{Comment, Issue, IssueState, IssueStatus};
pub use label::Label;
