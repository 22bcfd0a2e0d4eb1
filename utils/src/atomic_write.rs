//! Crash-safe file persistence for user-owned state (settings, caches).
//!
//! Content is written to a temp file in the destination directory and renamed
//! over the target. Where rename-over-existing fails (Windows), the old file
//! is moved to `<name>.bak` first and restored if the second rename fails;
//! [`recover_bak_file`] repairs the state left by a crash inside that window.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// `fsync` the temp file before renaming and the directory after (best-effort).
    #[default]
    Durable,
    /// Skip all syncs. For caches that can be regenerated.
    Relaxed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicWriteOptions {
    pub sync: SyncPolicy,
    /// Unix permission bits for the persisted file. `None` keeps the umask default.
    pub unix_mode: Option<u32>,
    /// Create missing parent directories.
    pub create_parents: bool,
}

impl AtomicWriteOptions {
    #[must_use]
    pub fn relaxed() -> Self {
        Self {
            sync: SyncPolicy::Relaxed,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn create_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

/// Restore `path` from `path.bak` if a previous write was interrupted.
pub fn recover_bak_file(path: &Path) {
    let backup = backup_path(path);
    if path.exists() || !backup.exists() {
        return;
    }
    match fs::rename(&backup, path) {
        Ok(()) => tracing::warn!(path = %path.display(), "Recovered .bak file from interrupted write"),
        Err(e) => tracing::warn!(path = %path.display(), "Failed to recover .bak file: {e}"),
    }
}

pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    atomic_write_with_options(path, bytes, AtomicWriteOptions::default())
}

pub fn atomic_write_with_options(
    path: impl AsRef<Path>,
    bytes: &[u8],
    options: AtomicWriteOptions,
) -> io::Result<()> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if options.create_parents {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    if options.sync == SyncPolicy::Durable {
        tmp.as_file().sync_all()?;
    }
    #[cfg(unix)]
    if let Some(mode) = options.unix_mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))?;
    }

    if let Err(err) = tmp.persist(path) {
        if !path.exists() {
            return Err(err.error);
        }
        let backup = backup_path(path);
        let _ = fs::remove_file(&backup);
        fs::rename(path, &backup)?;
        if let Err(retry) = err.file.persist(path) {
            let _ = fs::rename(&backup, path);
            return Err(retry.error);
        }
        if let Err(e) = fs::remove_file(&backup) {
            tracing::warn!(path = %backup.display(), "Failed to remove .bak after write: {e}");
        }
    }

    if options.sync == SyncPolicy::Durable {
        sync_dir_best_effort(parent);
    }
    Ok(())
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_dir_best_effort(dir: &Path) {
    if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), "Directory sync failed (best-effort): {e}");
    }
}

// Directory handles cannot be synced portably here.
#[cfg(not(unix))]
fn sync_dir_best_effort(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{AtomicWriteOptions, atomic_write_with_options, backup_path, recover_bak_file};

    #[test]
    fn overwrites_existing_without_leaving_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        atomic_write_with_options(&path, b"{}", AtomicWriteOptions::relaxed()).expect("first");
        atomic_write_with_options(&path, b"{\"a\":1}", AtomicWriteOptions::relaxed())
            .expect("second");

        assert_eq!(fs::read_to_string(&path).expect("read"), "{\"a\":1}");
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn creates_missing_parents_when_asked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/deeper/settings.json");

        let err = atomic_write_with_options(&path, b"x", AtomicWriteOptions::relaxed());
        assert!(err.is_err());

        atomic_write_with_options(&path, b"x", AtomicWriteOptions::relaxed().create_parents())
            .expect("write");
        assert_eq!(fs::read(&path).expect("read"), b"x");
    }

    #[test]
    fn recovers_interrupted_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        fs::write(backup_path(&path), b"old").expect("seed backup");

        recover_bak_file(&path);

        assert_eq!(fs::read(&path).expect("read"), b"old");
        assert!(!backup_path(&path).exists());
    }

    #[cfg(unix)]
    #[test]
    fn applies_unix_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("private.json");
        let opts = AtomicWriteOptions {
            unix_mode: Some(0o600),
            ..AtomicWriteOptions::relaxed()
        };
        atomic_write_with_options(&path, b"{}", opts).expect("write");

        let mode = fs::metadata(&path).expect("metadata").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
