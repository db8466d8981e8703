//! Java backend. Submissions must declare their entry point as a
//! top-level `Main` class; the source is staged as `Main.java` so javac
//! accepts it under that contract.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use gradus_common::config::EngineConfig;

use crate::error::{CompilationError, ExecutionFailure, SandboxError};
use crate::sandbox::Sandbox;

use super::{extension_matches, run_build_step, run_with_timeout, Executable, LanguageBackend};

pub struct JavaBackend {
    staging_root: PathBuf,
    compiler: String,
    runtime: String,
    compile_timeout: Duration,
}

impl JavaBackend {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            staging_root: config.staging_root.clone(),
            compiler: config.compiler_for("java", "javac"),
            runtime: config.runtime_for("java", "java"),
            compile_timeout: config.compile_timeout(),
        }
    }
}

#[async_trait]
impl LanguageBackend for JavaBackend {
    fn language(&self) -> &str {
        "java"
    }

    fn matches(&self, source: &Path) -> bool {
        extension_matches(source, "java")
    }

    async fn prepare(&self, source: &Path) -> Result<Sandbox, SandboxError> {
        Sandbox::stage(&self.staging_root, source, "Main.java").await
    }

    async fn compile(&self, sandbox: &Sandbox) -> Result<Executable, CompilationError> {
        run_build_step(
            &self.compiler,
            &["Main.java"],
            sandbox.root(),
            self.compile_timeout,
        )
        .await?;
        Ok(Executable {
            program: PathBuf::from(&self.runtime),
            args: vec![
                "-cp".to_string(),
                sandbox.root().display().to_string(),
                "Main".to_string(),
            ],
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
