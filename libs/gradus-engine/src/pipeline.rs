//! Submission execution pipeline.
//!
//! One `run` call takes a submission end to end: backend selection,
//! admission to the language's sandbox slot, staging, compilation, one
//! execution per test case and teardown. Per-test problems are absorbed
//! into failed [`TestResult`]s so a broken test never aborts its
//! siblings; only an unsupported language, a staging failure or an
//! unreachable coordination store surface as errors. Whatever happens
//! after admission, the slot is released exactly once.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use encoding_rs::Encoding;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use gradus_common::config::EngineConfig;
use gradus_common::types::{Submission, TestCase, TestResult};

use crate::admission::{AdmissionController, ReleaseGuard};
use crate::backend::{BackendRegistry, Executable, LanguageBackend};
use crate::diff;
use crate::encoding::{decode_with_fallback, resolve_encodings};
use crate::error::{EngineError, ENCODING_DIAGNOSTIC};
use crate::store::CoordinationStore;

/// Consumer of per-test results as they are produced, ahead of the
/// aggregate vector. Sink failures are logged and never fail the test
/// they were recording.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, submission_id: Uuid, result: &TestResult) -> anyhow::Result<()>;
}

/// Sink for callers that only want the aggregate result vector.
pub struct NoopSink;

#[async_trait]
impl ResultSink for NoopSink {
    async fn record(&self, _submission_id: Uuid, _result: &TestResult) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Everything a pipeline needs that outlives individual submissions.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn CoordinationStore>,
    pub registry: BackendRegistry,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CoordinationStore>,
        registry: BackendRegistry,
    ) -> Self {
        Self { config, store, registry }
    }
}

pub struct ExecutionPipeline {
    context: Arc<EngineContext>,
    admission: AdmissionController,
    encodings: Vec<&'static Encoding>,
}

impl ExecutionPipeline {
    pub fn new(context: Arc<EngineContext>) -> Self {
        let admission =
            AdmissionController::new(context.store.clone(), context.config.admission_poll());
        let encodings = resolve_encodings(&context.config.output_encodings);
        Self { context, admission, encodings }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Language the registry would run this source as, if any.
    pub fn resolve_language(&self, source: &Path) -> Option<String> {
        self.context
            .registry
            .select(source)
            .map(|backend| backend.language().to_string())
    }

    pub async fn run(&self, submission: &Submission) -> Result<Vec<TestResult>, EngineError> {
        self.run_with_sink(submission, &NoopSink).await
    }

    #[instrument(skip(self, submission, sink), fields(submission_id = %submission.id))]
    pub async fn run_with_sink(
        &self,
        submission: &Submission,
        sink: &dyn ResultSink,
    ) -> Result<Vec<TestResult>, EngineError> {
        // Backend selection happens before any admission traffic so an
        // unsupported submission never touches the slot.
        let backend = self
            .context
            .registry
            .select(&submission.source_path)
            .ok_or_else(|| EngineError::UnsupportedLanguage(submission.source_path.clone()))?;
        let language = backend.language().to_string();

        let sequence = self.admission.acquire(&language).await?;
        debug!(language = %language, sequence, "sandbox admission granted");
        let guard = ReleaseGuard::new(self.admission.clone(), &language, sequence);

        let outcome = self.execute_submission(backend.as_ref(), submission, sink).await;

        match self.admission.release(&language, sequence).await {
            Ok(()) => guard.disarm(),
            // The guard stays armed and retries the release on drop; a
            // retry frees this hold only, never a later one.
            Err(e) => warn!(language = %language, error = %e, "failed to release sandbox slot"),
        }

        outcome
    }

    async fn execute_submission(
        &self,
        backend: &dyn LanguageBackend,
        submission: &Submission,
        sink: &dyn ResultSink,
    ) -> Result<Vec<TestResult>, EngineError> {
        let tests = order_tests(&submission.tests);

        let sandbox = backend.prepare(&submission.source_path).await?;

        let executable = match backend.compile(&sandbox).await {
            Ok(executable) => executable,
            Err(compile_error) => {
                info!(sandbox_id = %sandbox.id(), "compilation failed");
                let results = self
                    .record_all_failed(submission, &tests, &compile_error.message, sink)
                    .await;
                backend.cleanup(sandbox).await;
                return Ok(results);
            }
        };

        let timeout = submission
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.context.config.test_timeout());

        let mut results = Vec::with_capacity(tests.len());
        for test in &tests {
            let result = self.run_test(backend, &executable, test, timeout).await;
            record(sink, submission.id, &result).await;
            results.push(result);
        }

        backend.cleanup(sandbox).await;
        Ok(results)
    }

    /// Every test fails with the same diagnostic. Used for compile
    /// failures, where no test ever ran.
    async fn record_all_failed(
        &self,
        submission: &Submission,
        tests: &[&TestCase],
        diagnostic: &str,
        sink: &dyn ResultSink,
    ) -> Vec<TestResult> {
        let mut results = Vec::with_capacity(tests.len());
        for test in tests {
            let result = TestResult::failed(&test.id, diagnostic);
            record(sink, submission.id, &result).await;
            results.push(result);
        }
        results
    }

    async fn run_test(
        &self,
        backend: &dyn LanguageBackend,
        executable: &Executable,
        test: &TestCase,
        timeout: Duration,
    ) -> TestResult {
        let input = match tokio::fs::read(&test.input_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return TestResult::failed(
                    &test.id,
                    format!("failed to read test input {}: {}", test.input_path.display(), e),
                )
            }
        };

        let stdout = match backend.execute(executable, &input, timeout).await {
            Ok(stdout) => stdout,
            Err(failure) => return TestResult::failed(&test.id, failure.to_string()),
        };

        let expected_bytes = match tokio::fs::read(&test.expected_output_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return TestResult::failed(
                    &test.id,
                    format!(
                        "failed to read expected output {}: {}",
                        test.expected_output_path.display(),
                        e
                    ),
                )
            }
        };

        let (Some(expected), Some(actual)) = (
            decode_with_fallback(&expected_bytes, &self.encodings),
            decode_with_fallback(&stdout, &self.encodings),
        ) else {
            return TestResult::failed(&test.id, ENCODING_DIAGNOSTIC);
        };

        match diff::unified_diff(&expected, &actual) {
            None => TestResult::passed(&test.id),
            Some(diff_text) => TestResult::failed(&test.id, diff_text),
        }
    }
}

async fn record(sink: &dyn ResultSink, submission_id: Uuid, result: &TestResult) {
    if let Err(e) = sink.record(submission_id, result).await {
        warn!(
            test_case_id = %result.test_case_id,
            error = %e,
            "failed to record test result"
        );
    }
}

/// Open tests first, then closed, preserving submission order within
/// each group.
pub(crate) fn order_tests(tests: &[TestCase]) -> Vec<&TestCase> {
    let mut ordered: Vec<&TestCase> = tests.iter().filter(|t| t.is_open()).collect();
    ordered.extend(tests.iter().filter(|t| !t.is_open()));
    ordered
}
