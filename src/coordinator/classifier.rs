use std::str::FromStr;
use std::sync::Arc;

use grid_common::{Category, Classification, Issue};
use serde_json::Value;

use crate::errors::GridError;
use crate::llm::{CompletionRequest, CompletionService, ModelTier, extract_json_object};

const CLASSIFY_MAX_TOKENS: u32 = 500;

const CLASSIFY_PROMPT: &str = r#"You are the technical lead triaging a GitHub issue for an autonomous coding agent.

Issue #{number}: {title}

{body}

Labels: {labels}

Choose exactly one category:
- SIMPLE: one agent can finish it in a single pull request (one concern, clear scope, small diff).
- COMPLEX: several concerns or files; it needs a plan and sub-tasks first.
- BLOCKED: requirements are missing or ambiguous; a human must answer a question before work starts.
- SKIP: not suitable for an agent (design taste, high risk, or domain knowledge beyond the code).

Reply with a single JSON object and nothing else:
{"category": "SIMPLE|COMPLEX|BLOCKED|SKIP", "reason": "one sentence", "blocking_question": "only when BLOCKED", "estimated_complexity": 1-10, "dependencies": [issue numbers this depends on]}"#;

/// Phase 2: categorise an issue with the completion service.
#[derive(Clone)]
pub struct Classifier {
    completion: Arc<dyn CompletionService>,
}

impl Classifier {
    pub fn new(completion: Arc<dyn CompletionService>) -> Self {
        Self { completion }
    }

    /// Always yields a classification: bad output falls back to SIMPLE and a
    /// failed call to SKIP.
    pub async fn classify(&self, issue: &Issue) -> Classification {
        let request = CompletionRequest {
            tier: ModelTier::Fast,
            system: None,
            prompt: render_prompt(issue),
            max_tokens: CLASSIFY_MAX_TOKENS,
        };

        let text = match self.completion.complete(request).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(issue = issue.number, error = %e, "classification call failed");
                return Classification::new(Category::Skip, format!("Classification error: {}", e));
            }
        };

        match parse_classification(&text) {
            Ok(c) => {
                tracing::info!(
                    issue = issue.number,
                    category = c.category.as_str(),
                    complexity = c.estimated_complexity,
                    "issue classified"
                );
                c
            }
            Err(e) => {
                tracing::warn!(issue = issue.number, error = %e, "unparseable classification");
                Classification::new(
                    Category::Simple,
                    "Classification parse error, defaulting to SIMPLE",
                )
            }
        }
    }
}

fn render_prompt(issue: &Issue) -> String {
    let body = if issue.body.trim().is_empty() {
        "(no description)"
    } else {
        issue.body.as_str()
    };
    let labels = if issue.labels.is_empty() {
        "(none)".to_string()
    } else {
        issue.labels.join(", ")
    };
    CLASSIFY_PROMPT
        .replace("{number}", &issue.number.to_string())
        .replace("{title}", &issue.title)
        .replace("{body}", body)
        .replace("{labels}", &labels)
}

fn parse_err(message: impl Into<String>) -> GridError {
    GridError::Parse {
        what: "classification".into(),
        message: message.into(),
    }
}

/// Parse model output. Dependencies accept `12`, `"12"` or `"#12"`.
pub fn parse_classification(text: &str) -> Result<Classification, GridError> {
    let json = extract_json_object(text).ok_or_else(|| parse_err("no JSON object in output"))?;
    let value: Value = serde_json::from_str(json).map_err(|e| parse_err(e.to_string()))?;

    let category = value
        .get("category")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_err("missing category"))
        .and_then(|s| Category::from_str(s).map_err(parse_err))?;

    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let blocking_question = value
        .get("blocking_question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(String::from);

    let estimated_complexity = value
        .get("estimated_complexity")
        .and_then(Value::as_u64)
        .map(|n| n.clamp(1, 10) as u8)
        .unwrap_or(Classification::DEFAULT_COMPLEXITY);

    let dependencies = value
        .get("dependencies")
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(|d| match d {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().trim_start_matches('#').parse().ok(),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Classification {
        category,
        reason,
        blocking_question,
        estimated_complexity,
        dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let c = parse_classification(
            r##"{"category": "BLOCKED", "reason": "Which DB?", "blocking_question": "Postgres or SQLite?",
                "estimated_complexity": 4, "dependencies": [12, "#13", "x"]}"##,
        )
        .unwrap();
        assert_eq!(c.category, Category::Blocked);
        assert_eq!(c.blocking_question.as_deref(), Some("Postgres or SQLite?"));
        assert_eq!(c.estimated_complexity, 4);
        assert_eq!(c.dependencies, vec![12, 13]);
    }

    #[test]
    fn test_parse_fenced_and_lowercase() {
        let c = parse_classification("```json\n{\"category\": \"complex\", \"reason\": \"big\"}\n```")
            .unwrap();
        assert_eq!(c.category, Category::Complex);
        assert_eq!(c.estimated_complexity, 5);
        assert!(c.dependencies.is_empty());
    }

    #[test]
    fn test_parse_clamps_complexity() {
        let c = parse_classification(r#"{"category":"SIMPLE","estimated_complexity":42}"#).unwrap();
        assert_eq!(c.estimated_complexity, 10);
    }

    #[test]
    fn test_parse_rejects_unknown_category() {
        let err = parse_classification(r#"{"category": "MAYBE"}"#).unwrap_err();
        assert!(matches!(err, GridError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_prose() {
        assert!(parse_classification("I think this is simple.").is_err());
    }

    #[test]
    fn test_prompt_handles_empty_body() {
        let issue = Issue {
            number: 9,
            repo: "acme/widgets".into(),
            title: "Fix typo".into(),
            body: "  ".into(),
            comments: vec![],
            labels: vec![],
            status: grid_common::IssueStatus::Open,
            parent: None,
            blocked_by: vec![],
            sub_issues: vec![],
        };
        let prompt = render_prompt(&issue);
        assert!(prompt.contains("Issue #9: Fix typo"));
        assert!(prompt.contains("(no description)"));
        assert!(prompt.contains("Labels: (none)"));
    }
}
