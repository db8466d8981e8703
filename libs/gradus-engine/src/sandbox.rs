//! Staging directories for submission builds.
//!
//! Every submission gets a fresh directory under the configured staging
//! root, named after a random id so concurrent submissions for
//! different languages never collide. The source file is copied in
//! under the backend's canonical name and all compile and run steps use
//! the directory as their working directory.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SandboxError;

#[derive(Debug)]
pub struct Sandbox {
    id: Uuid,
    root: PathBuf,
    source_path: PathBuf,
}

impl Sandbox {
    /// Create the staging directory and copy the submission source into
    /// it under `staged_name`.
    pub async fn stage(
        staging_root: &Path,
        source: &Path,
        staged_name: &str,
    ) -> Result<Sandbox, SandboxError> {
        let id = Uuid::new_v4();
        let root = staging_root.join(format!("gradus-{}", id));
        fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::new(format!("creating {}", root.display()), e))?;

        let source_path = root.join(staged_name);
        fs::copy(source, &source_path).await.map_err(|e| {
            SandboxError::new(
                format!("copying {} to {}", source.display(), source_path.display()),
                e,
            )
        })?;

        debug!(sandbox_id = %id, path = %root.display(), "staged submission");
        Ok(Sandbox { id, root, source_path })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// Absolute path of a file inside the staging directory.
    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Remove the staging directory. Failures are logged and swallowed;
    /// a leftover directory must never fail the submission it served.
    pub async fn remove(&self) {
        if let Err(e) = fs::remove_dir_all(&self.root).await {
            warn!(
                sandbox_id = %self.id,
                path = %self.root.display(),
                error = %e,
                "failed to remove staging directory"
            );
        }
    }
}
