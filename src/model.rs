//! Test files and run results.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A test as authored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Tags for filtering and grouping tests.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Variables merged into the scope before the first step.
    #[serde(default)]
    pub variables: IndexMap<String, serde_json::Value>,
    /// Raw steps, in full or shorthand form.
    pub steps: Vec<serde_json::Value>,
}

impl TestDefinition {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Whether the test carries `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Result of running a single test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub success: bool,
    /// One message per failed step, or the fatal error.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Every step that reached the post-step callbacks, nested steps
    /// included, in completion order.
    pub steps: Vec<StepRecord>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Passed,
    Failed,
    /// Failed with `ignoreError` set.
    Ignored,
    Skipped,
}

/// What happened to one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: String,
    pub name: String,
    pub step_type: String,
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub duration_ms: u64,
}
