//! C backend: gcc-compiled, runs the produced binary directly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use gradus_common::config::EngineConfig;

use crate::error::{CompilationError, ExecutionFailure, SandboxError};
use crate::sandbox::Sandbox;

use super::{extension_matches, run_build_step, run_with_timeout, Executable, LanguageBackend};

pub struct CBackend {
    staging_root: PathBuf,
    compiler: String,
    compile_timeout: Duration,
}

impl CBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            compiler: config.compiler_for("c", "gcc"),
            compile_timeout: config.compile_timeout(),
        }
    }
}

#[async_trait]
impl LanguageBackend for CBackend {
    fn language(&self) -> &str {
        "c"
    }

    fn matches(&self, source: &Path) -> bool {
        extension_matches(source, "c")
    }

    async fn prepare(&self, source: &Path) -> Result<Sandbox, SandboxError> {
        Sandbox::stage(&self.staging_root, source, "main.c").await
    }

    async fn compile(&self, sandbox: &Sandbox) -> Result<Executable, CompilationError> {
        run_build_step(
            &self.compiler,
            &["-O2", "-o", "main", "main.c", "-lm"],
            sandbox.root(),
            self.compile_timeout,
        )
        .await?;
        Ok(Executable {
            program: sandbox.path("main"),
            args: Vec::new(),
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
    #[ignore] // Requires gcc
    async fn test_compile_and_run_hello() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("solution.c");
        fs::write(
            &source,
            "#include <stdio.h>\nint main(void) { printf(\"hello\\n\"); return 0; }\n",
        )
        .await
        .unwrap();

        let mut config = EngineConfig::default();
        config.staging_root = dir.path().to_path_buf();
        let backend = CBackend::new(&config);

        let sandbox = backend.prepare(&source).await.unwrap();
        let executable = backend.compile(&sandbox).await.unwrap();
        let stdout = backend
            .execute(&executable, b"", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(stdout, b"hello\n");
        backend.cleanup(sandbox).await;
    }

    #[tokio::test]
    #[ignore] // Requires gcc
    async fn test_compile_error_carries_diagnostic() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("solution.c");
        fs::write(&source, "int main(void) { return 0 }\n").await.unwrap();

        let mut config = EngineConfig::default();
        config.staging_root = dir.path().to_path_buf();
        let backend = CBackend::new(&config);

        let sandbox = backend.prepare(&source).await.unwrap();
        let err = backend.compile(&sandbox).await.unwrap_err();
        assert!(err.message.contains("error"));
        backend.cleanup(sandbox).await;
    }
}
