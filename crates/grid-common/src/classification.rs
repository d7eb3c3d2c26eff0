use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Small enough for a single execution.
    Simple,
    /// Needs decomposition into sub-issues first.
    Complex,
    /// Missing information only a human can supply.
    Blocked,
    /// Not suitable for automated work.
    Skip,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "SIMPLE",
            Self::Complex => "COMPLEX",
            Self::Blocked => "BLOCKED",
            Self::Skip => "SKIP",
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SIMPLE" => Ok(Self::Simple),
            "COMPLEX" => Ok(Self::Complex),
            "BLOCKED" => Ok(Self::Blocked),
            "SKIP" => Ok(Self::Skip),
            other => Err(format!("Invalid category: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub category: Category,
    pub reason: String,
    pub blocking_question: Option<String>,
    /// 1 (trivial) to 10 (very large).
    pub estimated_complexity: u8,
    #[serde(default)]
    pub dependencies: Vec<u64>,
}

impl Classification {
    pub const DEFAULT_COMPLEXITY: u8 = 5;

    pub fn new(category: Category, reason: impl Into<String>) -> Self {
        Self {
            category,
            reason: reason.into(),
            blocking_question: None,
            estimated_complexity: Self::DEFAULT_COMPLEXITY,
            dependencies: Vec::new(),
        }
    }
}
