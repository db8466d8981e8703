//! Language backends.
//!
//! A backend owns everything language-specific about running a
//! submission: claiming source files by extension, staging them, turning
//! them into something runnable and executing that against test input.
//! The pipeline only ever talks to the [`LanguageBackend`] trait, so
//! adding a language is a matter of implementing it and registering the
//! backend.

pub mod c;
pub mod java;
pub mod python;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

use gradus_common::config::EngineConfig;

use crate::error::{CompilationError, ExecutionFailure, SandboxError};
use crate::sandbox::Sandbox;

/// A runnable artifact produced by [`LanguageBackend::compile`]. For
/// interpreted languages the program is the interpreter itself.
#[derive(Debug, Clone)]
pub struct Executable {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workdir: PathBuf,
}

#[async_trait]
pub trait LanguageBackend: Send + Sync {
    /// Stable lowercase identifier, e.g. `"c"`.
    fn language(&self) -> &str;

    /// Whether this backend claims the given source file.
    fn matches(&self, source: &Path) -> bool;

    /// Stage the source into a fresh sandbox.
    async fn prepare(&self, source: &Path) -> Result<Sandbox, SandboxError>;

    /// Produce a runnable artifact, surfacing compiler diagnostics on
    /// failure.
    async fn compile(&self, sandbox: &Sandbox) -> Result<Executable, CompilationError>;

    /// Run the artifact against one test's input and return its raw
    /// standard output. A run fails on non-zero exit, on any standard
    /// error output, or by exceeding `timeout` (the process is killed).
    async fn execute(
        &self,
        executable: &Executable,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ExecutionFailure>;

    /// Tear the sandbox down. Must never fail the submission it served.
    async fn cleanup(&self, sandbox: Sandbox) {
        sandbox.remove().await;
    }
}

pub struct BackendRegistry {
    backends: Vec<Arc<dyn LanguageBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self { backends: Vec::new() }
    }

    /// Registry with the built-in C, Python and Java backends.
    pub fn with_defaults(config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(c::CBackend::new(config)));
        registry.register(Arc::new(python::PythonBackend::new(config)));
        registry.register(Arc::new(java::JavaBackend::new(config)));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn LanguageBackend>) {
        self.backends.push(backend);
    }

    /// First registered backend that claims the source file.
    pub fn select(&self, source: &Path) -> Option<Arc<dyn LanguageBackend>> {
        self.backends.iter().find(|b| b.matches(source)).cloned()
    }

    pub fn languages(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.language()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn extension_matches(source: &Path, extension: &str) -> bool {
    source
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Run a compile-phase command to completion, mapping every way it can
/// go wrong into a [`CompilationError`] with the most useful diagnostic
/// available.
pub(crate) async fn run_build_step(
    program: &str,
    args: &[&str],
    workdir: &Path,
    timeout: Duration,
) -> Result<(), CompilationError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return Err(CompilationError::new(format!(
                "failed to invoke {}: {}",
                program, e
            )))
        }
    };

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CompilationError::new(format!(
                "failed to collect {} output: {}",
                program, e
            )))
        }
        Err(_) => {
            return Err(CompilationError::new(format!(
                "{} exceeded the {}s compile budget",
                program,
                timeout.as_secs()
            )))
        }
    };

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let message = if !stderr.trim().is_empty() {
        stderr.into_owned()
    } else if !stdout.trim().is_empty() {
        stdout.into_owned()
    } else {
        format!("{} exited with {}", program, output.status)
    };
    Err(CompilationError::new(message))
}

/// Run an executable against one test's input. The child is spawned
/// with `kill_on_drop`, so abandoning the wait on timeout also kills
/// the process.
pub(crate) async fn run_with_timeout(
    executable: &Executable,
    stdin: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, ExecutionFailure> {
    let mut command = Command::new(&executable.program);
    command
        .args(&executable.args)
        .current_dir(&executable.workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| {
        ExecutionFailure::runtime(format!(
            "failed to spawn {}: {}",
            executable.program.display(),
            e
        ))
    })?;

    if let Some(mut handle) = child.stdin.take() {
        let payload = stdin.to_vec();
        tokio::spawn(async move {
            // A process that exits without reading its input closes the
            // pipe early; that is not an error of ours.
            if let Err(e) = handle.write_all(&payload).await {
                debug!(error = %e, "test input not fully consumed");
            }
        });
    }

    let output = match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ExecutionFailure::runtime(format!(
                "failed to collect process output: {}",
                e
            )))
        }
        Err(_) => return Err(ExecutionFailure::Timeout),
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut message = format!("process exited with {}", output.status);
        if !stderr.trim().is_empty() {
            message.push_str(": ");
            message.push_str(stderr.trim());
        }
        return Err(ExecutionFailure::runtime(message));
    }
    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecutionFailure::runtime(format!(
            "process wrote to stderr: {}",
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}
