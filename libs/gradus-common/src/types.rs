use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a test case is shown to students or held back for grading.
/// Open tests are always evaluated before closed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub input_path: PathBuf,
    pub expected_output_path: PathBuf,
    pub visibility: Visibility,
}

impl TestCase {
    pub fn is_open(&self) -> bool {
        self.visibility == Visibility::Open
    }
}

/// Attempt metadata supplied by the administrative layer. The engine
/// echoes it back untouched on the aggregate result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionMetadata {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// One graded attempt. Read-only once pipeline execution starts; the
/// language is derived from the source file's extension, never declared
/// on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub tests: Vec<TestCase>,
    /// Per-test wall-clock budget in milliseconds; the engine-wide
    /// default applies when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub metadata: SubmissionMetadata,
}

/// Verdict for a single test case.
///
/// `diagnostic` is present exactly when the test failed and holds one
/// of: a unified diff, an execution-error message, or the fixed
/// `"Timeout."` literal. Use the constructors so the pairing cannot
/// drift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_case_id: String,
    pub success: bool,
    pub diagnostic: Option<String>,
}

impl TestResult {
    pub fn passed(test_case_id: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            success: true,
            diagnostic: None,
        }
    }

    pub fn failed(test_case_id: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            success: false,
            diagnostic: Some(diagnostic.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Completed,
    /// No backend recognizes the source file extension.
    InvalidSource,
    /// Staging or coordination failure; no trustworthy results exist.
    Error,
}

/// Aggregate outcome of one submission: caller-supplied attempt
/// metadata plus the per-test verdicts in evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionResult {
    pub submission_id: Uuid,
    pub language: String,
    pub status: SubmissionStatus,
    pub metadata: SubmissionMetadata,
    pub results: Vec<TestResult>,
    pub finished_at: DateTime<Utc>,
}
