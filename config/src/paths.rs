use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DATA_DIR_NAME: &str = ".easy-dotnet";

/// `~/.easy-dotnet`, or `./.easy-dotnet` when there is no home directory.
#[must_use]
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DATA_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DATA_DIR_NAME))
}

#[must_use]
pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

#[must_use]
pub fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

#[must_use]
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create `dir` and restrict it to the current user if we own it.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};
        let metadata = fs::metadata(dir)?;
        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() == our_uid {
            let mode = metadata.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
    }
    Ok(())
}
