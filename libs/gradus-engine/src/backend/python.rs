//! Python backend: byte-compiles the source up front so syntax errors
//! surface as compile failures, then runs it under the interpreter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use gradus_common::config::EngineConfig;

use crate::error::{CompilationError, ExecutionFailure, SandboxError};
use crate::sandbox::Sandbox;

use super::{extension_matches, run_build_step, run_with_timeout, Executable, LanguageBackend};

pub struct PythonBackend {
    staging_root: PathBuf,
    interpreter: String,
    compile_timeout: Duration,
}

impl PythonBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            interpreter: config.runtime_for("python", "python3"),
            compile_timeout: config.compile_timeout(),
        }
    }
}

#[async_trait]
impl LanguageBackend for PythonBackend {
    fn language(&self) -> &str {
        "python"
    }

    fn matches(&self, source: &Path) -> bool {
        extension_matches(source, "py")
    }

    async fn prepare(&self, source: &Path) -> Result<Sandbox, SandboxError> {
        Sandbox::stage(&self.staging_root, source, "main.py").await
    }

    async fn compile(&self, sandbox: &Sandbox) -> Result<Executable, CompilationError> {
        run_build_step(
            &self.interpreter,
            &["-m", "py_compile", "main.py"],
            sandbox.root(),
            self.compile_timeout,
        )
        .await?;
        Ok(Executable {
            program: PathBuf::from(&self.interpreter),
            args: vec!["main.py".to_string()],
            workdir: sandbox.root().to_path_buf(),
        })
    }

    async fn execute(
        &self,
        executable: &Executable,
        stdin: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, ExecutionFailure> {
        run_with_timeout(executable, stdin, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::fs;

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_compile_and_run_echo() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("solution.py");
        fs::write(&source, "print(input())\n").await.unwrap();

        let mut config = EngineConfig::default();
        config.staging_root = dir.path().to_path_buf();
        let backend = PythonBackend::new(&config);

        let sandbox = backend.prepare(&source).await.unwrap();
        let executable = backend.compile(&sandbox).await.unwrap();
        let stdout = backend
            .execute(&executable, b"ping\n", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, b"ping\n");
        backend.cleanup(sandbox).await;
    }

    #[tokio::test]
    #[ignore] // Requires python3
    async fn test_syntax_error_is_a_compile_failure() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("solution.py");
        fs::write(&source, "def broken(:\n").await.unwrap();

        let mut config = EngineConfig::default();
        config.staging_root = dir.path().to_path_buf();
        let backend = PythonBackend::new(&config);

        let sandbox = backend.prepare(&source).await.unwrap();
        let err = backend.compile(&sandbox).await.unwrap_err();
        assert!(err.message.contains("SyntaxError"));
        backend.cleanup(sandbox).await;
    }
}
