//! Hidden metadata embedded in comments the coordinator posts.
//!
//! The marker lets later cycles tell agent comments from human replies even
//! when the bot account is the same user that owns the token.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const MARKER: &str = "FORGE_GRID_META";

static META_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--\s*FORGE_GRID_META\s+(\{.*?\})\s*-->").unwrap());

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommentKind {
    BlockingQuestion,
    PlanSummary,
    EpicComplete,
    Failure,
    Escalation,
    Timeout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentMeta {
    pub kind: CommentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
}

impl CommentMeta {
    pub fn new(kind: CommentKind) -> Self {
        Self {
            kind,
            execution_id: None,
        }
    }

    pub fn for_execution(kind: CommentKind, execution_id: &str) -> Self {
        Self {
            kind,
            execution_id: Some(execution_id.to_string()),
        }
    }
}

/// Append the hidden marker to a human-readable comment body.
pub fn embed_metadata(body: &str, meta: &CommentMeta) -> String {
    let json = serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string());
    format!("{}\n\n<!-- {} {} -->", body.trim_end(), MARKER, json)
}

pub fn extract_metadata(body: &str) -> Option<CommentMeta> {
    let caps = META_REGEX.captures(body)?;
    serde_json::from_str(&caps[1]).ok()
}

/// Whether the comment was written by the coordinator.
pub fn is_agent_comment(body: &str) -> bool {
    body.contains(MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embed_then_extract() {
        let meta = CommentMeta::for_execution(CommentKind::Failure, "exec-1");
        let body = embed_metadata("Execution failed.\n", &meta);
        assert!(body.starts_with("Execution failed."));
        assert_eq!(extract_metadata(&body), Some(meta));
        assert!(is_agent_comment(&body));
    }

    #[test]
    fn test_plain_comment_has_no_metadata() {
        assert_eq!(extract_metadata("Sounds good, use Postgres."), None);
        assert!(!is_agent_comment("Sounds good, use Postgres."));
    }

    #[test]
    fn test_malformed_marker_is_agent_but_unparsed() {
        let body = "hi <!-- FORGE_GRID_META {not json} -->";
        assert!(is_agent_comment(body));
        assert_eq!(extract_metadata(body), None);
    }
}
