use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The label vocabulary used to encode pipeline state on the tracker.
///
/// Status labels are mutually exclusive; structural labels (`SubIssue`, `Epic`)
/// describe an issue's place in a decomposition and coexist with a status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Label {
    #[serde(rename = "ai-in-progress")]
    InProgress,
    #[serde(rename = "ai-blocked")]
    Blocked,
    #[serde(rename = "ai-waiting")]
    Waiting,
    #[serde(rename = "ai-planning")]
    Planning,
    #[serde(rename = "ai-review-pending")]
    ReviewPending,
    #[serde(rename = "ai-done")]
    Done,
    #[serde(rename = "ai-failed")]
    Failed,
    #[serde(rename = "ai-skipped")]
    Skipped,
    #[serde(rename = "ai-sub-issue")]
    SubIssue,
    #[serde(rename = "ai-epic")]
    Epic,
}

impl Label {
    pub const STATUS: [Label; 8] = [
        Label::InProgress,
        Label::Blocked,
        Label::Waiting,
        Label::Planning,
        Label::ReviewPending,
        Label::Done,
        Label::Failed,
        Label::Skipped,
    ];

    pub const ALL: [Label; 10] = [
        Label::InProgress,
        Label::Blocked,
        Label::Waiting,
        Label::Planning,
        Label::ReviewPending,
        Label::Done,
        Label::Failed,
        Label::Skipped,
        Label::SubIssue,
        Label::Epic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "ai-in-progress",
            Self::Blocked => "ai-blocked",
            Self::Waiting => "ai-waiting",
            Self::Planning => "ai-planning",
            Self::ReviewPending => "ai-review-pending",
            Self::Done => "ai-done",
            Self::Failed => "ai-failed",
            Self::Skipped => "ai-skipped",
            Self::SubIssue => "ai-sub-issue",
            Self::Epic => "ai-epic",
        }
    }

    pub fn is_status(&self) -> bool {
        !matches!(self, Self::SubIssue | Self::Epic)
    }

    /// Hex colour (without `#`) used when creating the label in a repository.
    pub fn color(&self) -> &'static str {
        match self {
            Self::InProgress => "1d76db",
            Self::Blocked => "e4e669",
            Self::Waiting => "c5def5",
            Self::Planning => "d4c5f9",
            Self::ReviewPending => "fbca04",
            Self::Done => "0e8a16",
            Self::Failed => "d93f0b",
            Self::Skipped => "cccccc",
            Self::SubIssue => "bfdadc",
            Self::Epic => "3e4b9e",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::InProgress => "An agent execution is working on this issue",
            Self::Blocked => "Waiting for a human answer to a clarifying question",
            Self::Waiting => "Waiting for blocking issues to close",
            Self::Planning => "Being decomposed into sub-issues",
            Self::ReviewPending => "Pull request opened, awaiting review",
            Self::Done => "Completed by the coordinator",
            Self::Failed => "Needs human attention",
            Self::Skipped => "Not suitable for automated work",
            Self::SubIssue => "Created by decomposing a larger issue",
            Self::Epic => "Decomposed into sub-issues",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Label::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| format!("Invalid label: {}", s))
    }
}
