//! forge-grid: turns GitHub issues into agent executions.
//!
//! The [`coordinator`] runs a periodic management cycle against an
//! [`tracker::IssueTracker`], launches work on an [`grid::ExecutionGrid`] and
//! applies completion callbacks received by the [`server`].

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod grid;
pub mod llm;
pub mod logging;
pub mod server;
pub mod tracker;
