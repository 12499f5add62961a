//! Backup-before-write for files touched by a repair loop
//!
//! The first write to an existing file within one ticket's loop copies its
//! bytes to `<file>.bak`; later writes in the same loop leave that backup
//! alone so it always holds the pre-loop content. New files get no backup.

use crate::error::RepairError;
use crate::paths::PathResolver;
use crate::util::write_atomic;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BACKUP_SUFFIX: &str = ".bak";

/// Deterministic backup location for `path`: the same directory, with
/// `.bak` appended to the full file name.
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(BACKUP_SUFFIX);
    path.with_file_name(name)
}

/// What a write did (or, in dry-run, would have done).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub path: PathBuf,
    /// Backup holding the pre-loop content, if the file existed.
    pub backup: Option<PathBuf>,
    /// Content that was (or would have been) written.
    pub content: String,
    pub dry_run: bool,
}

/// Per-ticket writer. Create a fresh one for every ticket loop.
pub struct BackupWriter {
    resolver: PathResolver,
    dry_run: bool,
    snapshotted: HashSet<PathBuf>,
}

impl BackupWriter {
    pub fn new(resolver: PathResolver, dry_run: bool) -> Self {
        Self {
            resolver,
            dry_run,
            snapshotted: HashSet::new(),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Snapshot `path` (first time only) and replace its content.
    pub fn snapshot_and_write(
        &mut self,
        path: &Path,
        content: &str,
    ) -> Result<WriteOutcome, RepairError> {
        if !self.resolver.contains(path) {
            return Err(RepairError::OutOfScopePath {
                candidate: path.display().to_string(),
                root: self.resolver.root().to_path_buf(),
            });
        }

        let exists = path.is_file();
        let backup = exists.then(|| backup_path_for(path));

        if self.dry_run {
            info!(path = %path.display(), bytes = content.len(), "dry run: skipping write");
            return Ok(WriteOutcome {
                path: path.to_path_buf(),
                backup,
                content: content.to_string(),
                dry_run: true,
            });
        }

        if let Some(backup_path) = &backup {
            if !self.snapshotted.contains(path) {
                fs::copy(path, backup_path).map_err(|e| RepairError::write(backup_path, e))?;
                self.snapshotted.insert(path.to_path_buf());
                info!(path = %path.display(), backup = %backup_path.display(), "created backup");
            } else {
                debug!(path = %path.display(), "backup already taken in this loop");
            }
        } else if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RepairError::write(parent, e))?;
            // Newly created file: later writes in this loop must not back up
            // the agent's own content as if it were the original.
            self.snapshotted.insert(path.to_path_buf());
        }

        write_atomic(path, content.as_bytes()).map_err(|e| RepairError::write(path, e))?;

        Ok(WriteOutcome {
            path: path.to_path_buf(),
            backup: if self.has_backup(path) {
                Some(backup_path_for(path))
            } else {
                None
            },
            content: content.to_string(),
            dry_run: false,
        })
    }

    fn has_backup(&self, path: &Path) -> bool {
        self.snapshotted.contains(path) && backup_path_for(path).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn writer(root: &Path, dry_run: bool) -> BackupWriter {
        BackupWriter::new(PathResolver::new(root).unwrap(), dry_run)
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(
            backup_path_for(Path::new("/r/src/f.ext")),
            PathBuf::from("/r/src/f.ext.bak")
        );
    }

    #[test]
    fn test_backup_keeps_pre_loop_content_across_writes() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("f.ext");
        fs::write(&file, "original").unwrap();

        let mut w = writer(&root, false);
        let first = w.snapshot_and_write(&file, "A").unwrap();
        let second = w.snapshot_and_write(&file, "B").unwrap();

        let backup = backup_path_for(&file);
        assert_eq!(first.backup.as_deref(), Some(backup.as_path()));
        assert_eq!(second.backup.as_deref(), Some(backup.as_path()));
        assert_eq!(fs::read_to_string(&file).unwrap(), "B");
        assert_eq!(fs::read_to_string(&backup).unwrap(), "original");
    }

    #[test]
    fn test_fresh_writer_snapshots_again() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("f.ext");
        fs::write(&file, "A").unwrap();

        writer(&root, false).snapshot_and_write(&file, "B").unwrap();
        writer(&root, false).snapshot_and_write(&file, "C").unwrap();

        assert_eq!(fs::read_to_string(backup_path_for(&file)).unwrap(), "B");
    }

    #[test]
    fn test_new_file_gets_no_backup() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("pkg/new_mod.py");

        let mut w = writer(&root, false);
        let first = w.snapshot_and_write(&file, "x = 1\n").unwrap();
        let second = w.snapshot_and_write(&file, "x = 2\n").unwrap();

        assert!(first.backup.is_none());
        assert!(second.backup.is_none());
        assert!(!backup_path_for(&file).exists());
        assert_eq!(fs::read_to_string(&file).unwrap(), "x = 2\n");
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let file = root.join("app.py");
        fs::write(&file, "old\n").unwrap();

        let outcome = writer(&root, true)
            .snapshot_and_write(&file, "new\n")
            .unwrap();

        assert!(outcome.dry_run);
        assert_eq!(outcome.content, "new\n");
        assert_eq!(fs::read_to_string(&file).unwrap(), "old\n");
        assert!(!backup_path_for(&file).exists());
    }

    #[test]
    fn test_refuses_paths_outside_root() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let target = outside.path().join("evil.py");

        let err = writer(dir.path(), false)
            .snapshot_and_write(&target, "boom")
            .unwrap_err();

        assert!(matches!(err, RepairError::OutOfScopePath { .. }));
        assert!(!target.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_error_is_reported_per_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let locked = root.join("locked");
        fs::create_dir_all(&locked).unwrap();
        let file = locked.join("a.py");
        fs::write(&file, "a = 1\n").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        let result = writer(&root, false).snapshot_and_write(&file, "a = 2\n");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();

        // Root ignores directory permissions; only assert when the write failed.
        if let Err(err) = result {
            assert!(matches!(err, RepairError::WriteError { .. }));
            assert_eq!(fs::read_to_string(&file).unwrap(), "a = 1\n");
        }
    }
}
