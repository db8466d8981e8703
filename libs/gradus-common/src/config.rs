use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("gradus")
}

fn default_test_timeout_ms() -> u64 {
    5_000
}

fn default_compile_timeout_ms() -> u64 {
    30_000
}

fn default_admission_poll_ms() -> u64 {
    50
}

fn default_output_encodings() -> Vec<String> {
    vec!["utf-8".to_string(), "windows-1252".to_string()]
}

/// Per-language tool substitutions, keyed by language identity in
/// `EngineConfig::toolchains`. Backends fall back to their built-in
/// program names when a field is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolchainOverride {
    #[serde(default)]
    pub compiler: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
}

/// Engine-wide settings, normally loaded from a JSON file by the worker
/// and threaded through the engine context. Every field has a default,
/// so a partial (or absent) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory under which per-submission sandboxes are created.
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    /// Wall-clock budget per test execution, unless the submission
    /// carries its own override.
    #[serde(default = "default_test_timeout_ms")]
    pub test_timeout_ms: u64,
    /// Wall-clock budget for build steps.
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    /// Fallback polling interval for admission waiters.
    #[serde(default = "default_admission_poll_ms")]
    pub admission_poll_ms: u64,
    /// Text encodings tried in order when decoding expected outputs and
    /// captured stdout.
    #[serde(default = "default_output_encodings")]
    pub output_encodings: Vec<String>,
    #[serde(default)]
    pub toolchains: HashMap<String, ToolchainOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_root: default_staging_root(),
            test_timeout_ms: default_test_timeout_ms(),
            compile_timeout_ms: default_compile_timeout_ms(),
            admission_poll_ms: default_admission_poll_ms(),
            output_encodings: default_output_encodings(),
            toolchains: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn admission_poll(&self) -> Duration {
        Duration::from_millis(self.admission_poll_ms)
    }

    pub fn toolchain(&self, language: &str) -> Option<&ToolchainOverride> {
        self.toolchains.get(language)
    }

    /// Compiler program for `language`, or `default` when not overridden.
    pub fn compiler_for(&self, language: &str, default: &str) -> String {
        self.toolchain(language)
            .and_then(|t| t.compiler.clone())
            .unwrap_or_else(|| default.to_string())
    }

    /// Runtime program for `language`, or `default` when not overridden.
    pub fn runtime_for(&self, language: &str, default: &str) -> String {
        self.toolchain(language)
            .and_then(|t| t.runtime.clone())
            .unwrap_or_else(|| default.to_string())
    }
}
