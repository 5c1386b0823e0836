/// Run-scoped temporary root directory
///
/// The directory only ever serves as a mount point inside the child's mount
/// namespace, so on the host it stays empty and is removed with `rmdir`.
use crate::config::types::{Result, SandboxError};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Private root for one run, removed on drop.
#[derive(Debug)]
pub struct TempRoot {
    /// Unique run ID
    run_id: String,
    path: PathBuf,
    removed: AtomicBool,
}

impl TempRoot {
    /// Create `<base>/runbox-<uuid>`.
    pub fn create_in(base: &Path) -> Result<Self> {
        let run_id = Uuid::new_v4().to_string();
        let path = base.join(format!("runbox-{}", run_id));

        fs::DirBuilder::new().mode(0o755).create(&path).map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create sandbox root {}: {}", path.display(), e),
            ))
        })?;
        log::debug!("Created sandbox root {}", path.display());

        Ok(Self {
            run_id,
            path,
            removed: AtomicBool::new(false),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory (idempotent).
    pub fn cleanup(&self) -> Result<()> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to remove sandbox root {}: {}", self.path.display(), e),
            ))),
        }
    }
}

impl Drop for TempRoot {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roots_are_unique_and_removed_on_drop() {
        let base = tempfile::tempdir().unwrap();
        let a = TempRoot::create_in(base.path()).unwrap();
        let b = TempRoot::create_in(base.path()).unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());

        let path = a.path().to_path_buf();
        drop(a);
        assert!(!path.exists());
        assert!(b.path().exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let root = TempRoot::create_in(base.path()).unwrap();
        root.cleanup().unwrap();
        root.cleanup().unwrap();
        assert!(!root.path().exists());
    }

    #[test]
    fn root_lives_in_base_with_run_id() {
        let base = tempfile::tempdir().unwrap();
        let root = TempRoot::create_in(base.path()).unwrap();
        assert!(root.path().starts_with(base.path()));
        assert!(root
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(root.run_id()));
    }
}
