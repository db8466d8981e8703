use std::path::PathBuf;

use thiserror::Error;

/// Byte budget for tool diagnostics carried into test results.
pub const MAX_DIAGNOSTIC_BYTES: usize = 16 * 1024; // 16KB

/// Fixed diagnostic recorded when a test exceeds its time budget.
pub const TIMEOUT_DIAGNOSTIC: &str = "Timeout.";

/// Fixed diagnostic recorded when neither the expected output nor the
/// captured stdout decodes under any configured encoding.
pub const ENCODING_DIAGNOSTIC: &str =
    "Output could not be decoded with any supported text encoding.";

/// Errors the pipeline returns to its caller. Everything per-test is
/// absorbed into `TestResult.diagnostic` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No backend recognizes the source file extension. Raised before
    /// any admission call, maps to a client-facing "invalid source".
    #[error("no language backend matches source file {}", .0.display())]
    UnsupportedLanguage(PathBuf),

    /// Staging I/O failed. Fatal to the submission; the admission slot
    /// has already been released when this reaches the caller.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The coordination store is unreachable, so admission state cannot
    /// be trusted. Fatal, no partial results are attempted.
    #[error("coordination store unavailable: {0}")]
    Infrastructure(#[from] StoreError),
}

/// Failure talking to the shared coordination store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("malformed store payload: {0}")]
    Payload(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unreachable(err.to_string())
    }
}

/// Staging I/O failure while building a sandbox. The context names the
/// operation and every path involved, since a copy can fail on either
/// end.
#[derive(Debug, Error)]
#[error("sandbox staging failed: {context}: {source}")]
pub struct SandboxError {
    pub context: String,
    #[source]
    pub source: std::io::Error,
}

impl SandboxError {
    pub fn new(context: impl Into<String>, source: std::io::Error) -> Self {
        Self { context: context.into(), source }
    }
}

/// Build-step failure. The message is the tool's captured diagnostic
/// output and doubles as the uniform per-test diagnostic.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct CompilationError {
    pub message: String,
}

impl CompilationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: truncate_diagnostic(&message.into()) }
    }
}

/// Per-test execution failure, absorbed into the test's diagnostic.
#[derive(Debug, Error)]
pub enum ExecutionFailure {
    /// Non-zero exit, stderr output, or a failed program start.
    #[error("{message}")]
    Runtime { message: String },
    /// Wall-clock budget exceeded; the process was forcibly terminated.
    #[error("Timeout.")]
    Timeout,
}

impl ExecutionFailure {
    pub fn runtime(message: impl Into<String>) -> Self {
        ExecutionFailure::Runtime { message: truncate_diagnostic(&message.into()) }
    }
}

/// Cap a diagnostic at the display budget, cutting on a char boundary.
pub fn truncate_diagnostic(text: &str) -> String {
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }
    let mut end = MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n... [diagnostic truncated]", &text[..end])
}
