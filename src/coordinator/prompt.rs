//! Execution prompts. Pure functions of their inputs.

use grid_common::{Checkpoint, ExecutionMode, Issue};
use serde::{Deserialize, Serialize};

/// Default prefix for agent branches.
pub const BRANCH_PREFIX: &str = "agent/";

/// Mode plus the data only that mode needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModeContext {
    Implement,
    AddressReview {
        pr_number: u64,
        existing_branch: String,
        review_comments: String,
    },
    RetryWithFeedback {
        closed_pr_number: u64,
        attempt: u32,
        human_feedback: String,
        what_not_to_do: String,
    },
}

impl ModeContext {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Implement => ExecutionMode::Implement,
            Self::AddressReview { .. } => ExecutionMode::AddressReview,
            Self::RetryWithFeedback { .. } => ExecutionMode::RetryWithFeedback,
        }
    }

    /// PR the execution is expected to update, if any.
    pub fn pr_number(&self) -> Option<u64> {
        match self {
            Self::AddressReview { pr_number, .. } => Some(*pr_number),
            _ => None,
        }
    }
}

/// Branch an execution should push to.
pub fn branch_name(prefix: &str, issue_number: u64, context: &ModeContext) -> String {
    match context {
        ModeContext::Implement => format!("{}{}", prefix, issue_number),
        ModeContext::AddressReview { existing_branch, .. } => existing_branch.clone(),
        ModeContext::RetryWithFeedback { attempt, .. } => {
            format!("{}{}-retry-{}", prefix, issue_number, attempt)
        }
    }
}

fn base_prompt(issue: &Issue, repo: &str) -> String {
    let body = if issue.body.trim().is_empty() {
        "(no description)"
    } else {
        issue.body.as_str()
    };
    let n = issue.number;
    format!(
        r#"You are a senior software engineer working on a GitHub issue.

## Repository
- Repo: {repo}

## Your Task
Issue #{n}: {title}

{body}

## Rules
1. Work only on what the issue asks for. Do not refactor unrelated code.
2. Write tests for your changes.
3. Run the existing tests and make sure they pass.
4. Follow the existing code style in the repository.
5. Make small commits with clear messages.
6. If you are blocked and need human input:
   - Comment on the issue: gh issue comment {n} --repo {repo} --body "..."
   - State exactly what you need answered
   - Then exit
7. When done:
   - Push your branch
   - Open a pull request: gh pr create --title "..." --body "..."
   - Include "Closes #{n}" in the pull request body
"#,
        repo = repo,
        n = n,
        title = issue.title,
        body = body,
    )
}

pub fn build_prompt(
    issue: &Issue,
    repo: &str,
    branch_prefix: &str,
    context: &ModeContext,
    checkpoint: Option<&Checkpoint>,
) -> String {
    let mut prompt = base_prompt(issue, repo);
    let branch = branch_name(branch_prefix, issue.number, context);

    match context {
        ModeContext::Implement => {
            prompt.push_str(&format!(
                r#"
## Setup
Create a working branch:
```bash
git checkout -b {branch}
```

After implementation:
```bash
git push -u origin {branch}
```
"#
            ));
        }
        ModeContext::AddressReview {
            pr_number,
            review_comments,
            ..
        } => {
            prompt.push_str(&format!(
                r#"
## You are addressing review feedback on PR #{pr_number}

The previous work is on branch `{branch}`. Check it out; do not create a new branch:
```bash
git checkout {branch}
git pull origin {branch}
```

Review feedback to address:

{review_comments}

Address every comment and push new commits on top of the branch.
Do not force push and do not squash.
```bash
git push origin {branch}
```
"#
            ));
            if let Some(cp) = checkpoint {
                let decisions = cp.get_str(Checkpoint::DECISIONS_MADE);
                let summary = cp.get_str(Checkpoint::CONTEXT_SUMMARY);
                if decisions.is_some() || summary.is_some() {
                    prompt.push_str("\n## Previous Context\nWhat the previous run did, for reference:\n");
                    if let Some(d) = decisions {
                        prompt.push_str(&format!("\nDecisions made:\n{}\n", d));
                    }
                    if let Some(s) = summary {
                        prompt.push_str(&format!("\nContext:\n{}\n", s));
                    }
                }
            }
        }
        ModeContext::RetryWithFeedback {
            closed_pr_number,
            human_feedback,
            what_not_to_do,
            ..
        } => {
            let feedback = if human_feedback.trim().is_empty() {
                "(no comment was left)"
            } else {
                human_feedback.as_str()
            };
            let avoid = if what_not_to_do.trim().is_empty() {
                "(no record of the previous attempt)"
            } else {
                what_not_to_do.as_str()
            };
            prompt.push_str(&format!(
                r#"
## A previous attempt was rejected

PR #{closed_pr_number} was closed without merging. The reviewer said:

{feedback}

What the previous attempt did (do not repeat it):

{avoid}

Take a different approach based on the feedback. Start from a fresh branch:
```bash
git checkout -b {branch}
```

After implementation:
```bash
git push -u origin {branch}
```
"#
            ));
        }
    }

    prompt
}
