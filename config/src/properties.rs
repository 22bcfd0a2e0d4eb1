//! MSBuild project properties and their cache.
//!
//! Evaluating a project is slow (a full `dotnet msbuild` run), so results are
//! kept per project path until the TTL expires or the project file changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PropertiesError {
    #[error("failed to evaluate {}: {message}", project.display())]
    Evaluate { project: PathBuf, message: String },
    #[error("unexpected msbuild output for {}: {message}", project.display())]
    Parse { project: PathBuf, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectProperties {
    pub target_path: Option<PathBuf>,
    pub target_framework: Option<String>,
    pub testing_platform_dotnet_test_support: bool,
    pub is_test_project: bool,
}

impl ProjectProperties {
    /// Test through the Testing Platform protocol rather than VSTest.
    #[must_use]
    pub fn uses_testing_platform(&self) -> bool {
        self.testing_platform_dotnet_test_support
    }
}

/// Evaluates MSBuild properties of a project file.
pub trait ProjectPropertiesProvider: Send + Sync {
    fn properties<'a>(
        &'a self,
        project: &'a Path,
    ) -> BoxFuture<'a, Result<ProjectProperties, PropertiesError>>;
}

struct CachedRecord {
    properties: ProjectProperties,
    fetched_at: Instant,
    project_mtime: Option<SystemTime>,
}

impl CachedRecord {
    fn is_fresh(&self, ttl: Duration, current_mtime: Option<SystemTime>) -> bool {
        if self.fetched_at.elapsed() >= ttl {
            return false;
        }
        match (self.project_mtime, current_mtime) {
            (Some(cached), Some(current)) => current <= cached,
            (None, None) => true,
            _ => false,
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Per-project cache in front of a [`ProjectPropertiesProvider`].
pub struct PropertiesCache {
    provider: Arc<dyn ProjectPropertiesProvider>,
    ttl: Duration,
    records: Mutex<HashMap<PathBuf, CachedRecord>>,
}

impl std::fmt::Debug for PropertiesCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertiesCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl PropertiesCache {
    #[must_use]
    pub fn new(provider: Arc<dyn ProjectPropertiesProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, project: &Path) -> Result<ProjectProperties, PropertiesError> {
        let mtime = modified_time(project);
        if let Some(record) = self.records.lock().await.get(project)
            && record.is_fresh(self.ttl, mtime)
        {
            return Ok(record.properties.clone());
        }

        tracing::debug!(project = %project.display(), "Evaluating project properties");
        let properties = self.provider.properties(project).await?;
        self.records.lock().await.insert(
            project.to_path_buf(),
            CachedRecord {
                properties: properties.clone(),
                fetched_at: Instant::now(),
                project_mtime: mtime,
            },
        );
        Ok(properties)
    }

    pub async fn invalidate(&self, project: &Path) {
        self.records.lock().await.remove(project);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl ProjectPropertiesProvider for CountingProvider {
        fn properties<'a>(
            &'a self,
            project: &'a Path,
        ) -> BoxFuture<'a, Result<ProjectProperties, PropertiesError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if project.ends_with("Broken.csproj") {
                    return Err(PropertiesError::Evaluate {
                        project: project.to_path_buf(),
                        message: "exit code 1".into(),
                    });
                }
                Ok(ProjectProperties {
                    target_framework: Some(format!("net{call}.0")),
                    ..ProjectProperties::default()
                })
            })
        }
    }

    fn cache(ttl: Duration) -> (Arc<CountingProvider>, PropertiesCache) {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let cache = PropertiesCache::new(provider.clone(), ttl);
        (provider, cache)
    }

    #[tokio::test]
    async fn fresh_record_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("App.csproj");
        std::fs::write(&project, "<Project />").unwrap();
        let (provider, cache) = cache(Duration::from_secs(60));

        let first = cache.get(&project).await.unwrap();
        let second = cache.get(&project).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_or_touched_project_is_reevaluated() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("App.csproj");
        std::fs::write(&project, "<Project />").unwrap();

        let (provider, expired) = cache(Duration::ZERO);
        expired.get(&project).await.unwrap();
        expired.get(&project).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let (provider, cache) = cache(Duration::from_secs(60));
        cache.get(&project).await.unwrap();
        let later = SystemTime::now() + Duration::from_secs(10);
        std::fs::File::options()
            .write(true)
            .open(&project)
            .unwrap()
            .set_modified(later)
            .unwrap();
        let refreshed = cache.get(&project).await.unwrap();
        assert_eq!(refreshed.target_framework.as_deref(), Some("net1.0"));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let (provider, cache) = cache(Duration::from_secs(60));
        let project = Path::new("/nowhere/Broken.csproj");

        assert!(cache.get(project).await.is_err());
        assert!(cache.get(project).await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reevaluation() {
        let (provider, cache) = cache(Duration::from_secs(60));
        let project = Path::new("/nowhere/App.csproj");
        cache.get(project).await.unwrap();
        cache.invalidate(project).await;
        cache.get(project).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }
}
