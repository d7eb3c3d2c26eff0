//! The coordinator: one management cycle reconciling the tracker, the
//! execution grid and the local store.
//!
//! | Module            | Responsibility                                  |
//! |-------------------|-------------------------------------------------|
//! | `scanner`         | find issues not yet in the pipeline             |
//! | `classifier`      | SIMPLE / COMPLEX / BLOCKED / SKIP               |
//! | `planner`         | decompose COMPLEX issues into sub-issues        |
//! | `prompt`          | build execution prompts per mode                |
//! | `pr_monitor`      | review feedback and rejected pull requests      |
//! | `blocker`         | human replies on blocked issues                 |
//! | `dependency`      | release waiting sub-issues, close epics         |
//! | `budget`          | concurrency, daily cost and retry ceilings      |
//! | `checkpoint`      | per-issue context handed between executions     |
//! | `watermark`       | last-run timestamps per phase                   |
//! | `engine`          | phase sequencing and per-issue actions          |
//! | `completion`      | terminal transitions from callbacks             |
//! | `actor`           | serialises cycles and callbacks                 |
//! | `management_loop` | timer driving the actor                         |

pub mod actor;
pub mod blocker;
pub mod budget;
pub mod checkpoint;
pub mod classifier;
pub mod completion;
pub mod db;
pub mod dependency;
pub mod engine;
pub mod management_loop;
pub mod planner;
pub mod pr_monitor;
pub mod prompt;
pub mod scanner;
pub mod watermark;

use std::sync::Arc;

use crate::config::{BudgetSection, GridConfig};
use crate::grid::ExecutionGrid;
use crate::llm::CompletionService;
use crate::tracker::{CodeHost, IssueTracker};

pub use actor::{CoordinatorCommand, CoordinatorHandle, coordinator_channel, spawn_coordinator};
pub use completion::{CompletionOutcome, CompletionReport};
pub use db::{DbHandle, GridDb};
pub use engine::{Coordinator, CyclePhase, CycleReport};

/// External collaborators, built once at startup and shared.
#[derive(Clone)]
pub struct Services {
    pub tracker: Arc<dyn IssueTracker>,
    pub code_host: Arc<dyn CodeHost>,
    pub grid: Arc<dyn ExecutionGrid>,
    pub completion: Arc<dyn CompletionService>,
    pub db: DbHandle,
}

/// The slice of configuration the coordinator reads every cycle.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub repo: String,
    pub repo_url: String,
    pub agent_branch_prefix: String,
    pub execution_timeout: chrono::Duration,
    /// Window the pull request phases scan when no watermark is stored yet.
    pub initial_lookback: chrono::Duration,
    pub budget: BudgetSection,
}

impl CoordinatorSettings {
    pub fn from_config(config: &GridConfig) -> Self {
        Self {
            repo: config.coordinator.target_repo.clone(),
            repo_url: config.coordinator.repo_url(),
            agent_branch_prefix: config.coordinator.agent_branch_prefix.clone(),
            execution_timeout: config.coordinator.execution_timeout(),
            initial_lookback: config.coordinator.initial_lookback(),
            budget: config.budget.clone(),
        }
    }
}
