//! Default-project selections per solution, persisted as JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use easy_dotnet_utils::{AtomicWriteOptions, atomic_write_with_options, recover_bak_file};
use serde::{Deserialize, Serialize};

use crate::paths::ensure_private_dir;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write settings at {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProjectKind {
    Startup,
    Test,
    Build,
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Startup => "startup",
            Self::Test => "test",
            Self::Build => "build",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct SolutionDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    startup: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    test: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    build: Option<PathBuf>,
}

impl SolutionDefaults {
    fn slot(&mut self, kind: ProjectKind) -> &mut Option<PathBuf> {
        match kind {
            ProjectKind::Startup => &mut self.startup,
            ProjectKind::Test => &mut self.test,
            ProjectKind::Build => &mut self.build,
        }
    }

    fn get(&self, kind: ProjectKind) -> Option<&PathBuf> {
        match kind {
            ProjectKind::Startup => self.startup.as_ref(),
            ProjectKind::Test => self.test.as_ref(),
            ProjectKind::Build => self.build.as_ref(),
        }
    }
}

/// Key-value store of solution path → default projects.
///
/// Every change is written through with an atomic replace.
pub struct SettingsStore {
    path: PathBuf,
    solutions: Mutex<BTreeMap<String, SolutionDefaults>>,
}

impl fmt::Debug for SettingsStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SettingsStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        recover_bak_file(&path);
        let solutions = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|source| SettingsError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            solutions: Mutex::new(solutions),
        })
    }

    /// [`SettingsStore::open`], starting empty when the file is unreadable.
    /// The broken file is overwritten by the next change.
    pub fn open_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(path.clone()) {
            Ok(store) => store,
            Err(e) => {
                tracing::warn!("{e}; starting with empty settings");
                Self {
                    path,
                    solutions: Mutex::new(BTreeMap::new()),
                }
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn default_project(&self, solution: &str, kind: ProjectKind) -> Option<PathBuf> {
        self.solutions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(solution)
            .and_then(|defaults| defaults.get(kind).cloned())
    }

    /// Set (or with `None`, clear) the default project and persist.
    pub fn set_default_project(
        &self,
        solution: &str,
        kind: ProjectKind,
        project: Option<PathBuf>,
    ) -> Result<(), SettingsError> {
        let mut solutions = self.solutions.lock().unwrap_or_else(PoisonError::into_inner);
        let defaults = solutions.entry(solution.to_string()).or_default();
        *defaults.slot(kind) = project;
        if *defaults == SolutionDefaults::default() {
            solutions.remove(solution);
        }
        self.persist(&solutions)
    }

    fn persist(&self, solutions: &BTreeMap<String, SolutionDefaults>) -> Result<(), SettingsError> {
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(solutions)
            .map_err(|e| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_private_dir(parent).map_err(write_err)?;
        }
        let options = AtomicWriteOptions {
            unix_mode: Some(0o600),
            ..AtomicWriteOptions::default()
        };
        atomic_write_with_options(&self.path, &json, options).map_err(write_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/settings.json");

        let store = SettingsStore::open(&path).unwrap();
        assert_eq!(store.default_project("/repo/App.sln", ProjectKind::Test), None);
        store
            .set_default_project(
                "/repo/App.sln",
                ProjectKind::Test,
                Some(PathBuf::from("/repo/tests/App.Tests.csproj")),
            )
            .unwrap();

        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(
            reopened.default_project("/repo/App.sln", ProjectKind::Test),
            Some(PathBuf::from("/repo/tests/App.Tests.csproj"))
        );
        assert_eq!(reopened.default_project("/repo/App.sln", ProjectKind::Startup), None);
    }

    #[test]
    fn clearing_last_default_removes_solution_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = SettingsStore::open(&path).unwrap();

        store
            .set_default_project("a.sln", ProjectKind::Build, Some("a.csproj".into()))
            .unwrap();
        store.set_default_project("a.sln", ProjectKind::Build, None).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), "{}");
    }

    #[test]
    fn corrupt_file_is_reported_or_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            SettingsStore::open(&path),
            Err(SettingsError::Parse { .. })
        ));

        let store = SettingsStore::open_or_default(&path);
        store
            .set_default_project("a.sln", ProjectKind::Startup, Some("app.csproj".into()))
            .unwrap();
        let reopened = SettingsStore::open(&path).unwrap();
        assert_eq!(
            reopened.default_project("a.sln", ProjectKind::Startup),
            Some(PathBuf::from("app.csproj"))
        );
    }

    #[test]
    fn kind_uses_camel_case_on_the_wire() {
        let kind: ProjectKind = serde_json::from_str("\"startup\"").unwrap();
        assert_eq!(kind, ProjectKind::Startup);
        assert_eq!(kind.to_string(), "startup");
    }
}
