//! Owner of the live DAP proxy sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use easy_dotnet_config::DebuggerConfig;
use easy_dotnet_dap::{
    AttachRequestInterceptor, ConverterPipeline, DapError, DapInterceptor, DebugSession,
    DebugSessionConfig, SessionHooks, SessionState, VariablesInterceptor,
};
use easy_dotnet_types::SessionId;
use easy_dotnet_utils::{ProcessLauncher, ProcessSpec};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// What an editor needs to connect to a freshly started session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugStart {
    pub session_id: SessionId,
    pub port: u16,
}

impl From<&DebugSession> for DebugStart {
    fn from(session: &DebugSession) -> Self {
        Self {
            session_id: session.id(),
            port: session.port(),
        }
    }
}

type SessionMap = DashMap<SessionId, DebugSession>;

/// Map of session id to coordinator. Sessions remove themselves once disposed.
pub struct DebugSessionManager {
    launcher: Arc<dyn ProcessLauncher>,
    config: DebuggerConfig,
    sessions: Arc<SessionMap>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for DebugSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugSessionManager")
            .field("debugger", &self.config.binary)
            .field("active", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl DebugSessionManager {
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, config: DebuggerConfig) -> Self {
        Self {
            launcher,
            config,
            sessions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    fn session_config(&self) -> DebugSessionConfig {
        let debugger = ProcessSpec::new(&self.config.binary)
            .args(self.config.args.iter().cloned())
            .label("netcoredbg");
        let mut config = DebugSessionConfig::new(debugger);
        config.accept_timeout = self.config.accept_timeout();
        config.shutdown_grace = self.config.shutdown_grace();
        config.nested_request_timeout = self.config.nested_request_timeout();
        config
    }

    /// Spawn a debugger behind a new proxy whose `attach` requests are
    /// rewritten by `attach`. Returns once the editor can connect.
    pub async fn start(&self, attach: AttachRequestInterceptor) -> Result<DebugSession, DapError> {
        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let interceptors: Vec<Arc<dyn DapInterceptor>> = vec![
            Arc::new(attach),
            Arc::new(VariablesInterceptor::new(ConverterPipeline::with_defaults())),
        ];
        let registry: Weak<SessionMap> = Arc::downgrade(&self.sessions);
        let hooks = SessionHooks::new()
            .on_failure(move |error| {
                tracing::warn!(session = %id, "Debug session failed: {error}");
            })
            .on_dispose(move || {
                if let Some(sessions) = registry.upgrade() {
                    sessions.remove(&id);
                }
            });

        let session = DebugSession::start(
            id,
            self.session_config(),
            self.launcher.as_ref(),
            interceptors,
            hooks,
            self.shutdown.child_token(),
        )
        .await?;
        self.sessions.insert(id, session.clone());
        // The dispose hook may have fired before the insert.
        if session.state() == SessionState::Disposed {
            self.sessions.remove(&id);
        }
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<DebugSession> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn active(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort_by_key(|id| id.value());
        ids
    }

    /// Dispose one session and wait for teardown. `false` when unknown.
    pub async fn stop(&self, id: SessionId, force: bool) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if force {
            session.force_dispose().await;
        } else {
            session.dispose().await;
        }
        true
    }

    /// Force-dispose every session. Later `start` calls still work but their
    /// sessions are torn down immediately.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sessions: Vec<DebugSession> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "Disposing debug sessions");
        }
        futures_util::future::join_all(sessions.iter().map(DebugSession::force_dispose)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use easy_dotnet_utils::LaunchError;
    use easy_dotnet_utils::process::memory::{self, InMemoryProcess};
    use easy_dotnet_utils::ProcessHandle;
    use tokio::net::TcpStream;

    use super::*;

    /// Every launch yields a fresh in-memory debugger.
    #[derive(Default)]
    struct DebuggerLauncher {
        children: Mutex<Vec<InMemoryProcess>>,
        programs: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ProcessLauncher for DebuggerLauncher {
        fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, LaunchError> {
            if self.fail {
                return Err(LaunchError::NotFound {
                    program: spec.program.clone(),
                });
            }
            self.programs.lock().unwrap().push(spec.display());
            let (handle, child) = memory::pair("netcoredbg", Some(7));
            self.children.lock().unwrap().push(child);
            Ok(handle)
        }
    }

    fn manager(launcher: Arc<DebuggerLauncher>) -> DebugSessionManager {
        let config = DebuggerConfig {
            shutdown_grace_secs: 0,
            ..DebuggerConfig::default()
        };
        DebugSessionManager::new(launcher, config)
    }

    #[tokio::test]
    async fn sessions_get_distinct_ids_and_leave_when_stopped() {
        let launcher = Arc::new(DebuggerLauncher::default());
        let manager = manager(launcher.clone());

        let first = manager.start(AttachRequestInterceptor::process_id(10)).await.unwrap();
        let second = manager.start(AttachRequestInterceptor::process_id(11)).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(manager.active(), vec![first.id(), second.id()]);
        assert_eq!(
            launcher.programs.lock().unwrap()[0],
            "netcoredbg --interpreter=vscode"
        );

        assert!(manager.stop(first.id(), true).await);
        assert!(manager.get(first.id()).is_none());
        assert!(!manager.stop(first.id(), true).await);
        assert_eq!(manager.active(), vec![second.id()]);
    }

    #[tokio::test]
    async fn debugger_exit_removes_the_session() {
        let launcher = Arc::new(DebuggerLauncher::default());
        let manager = manager(launcher.clone());
        let session = manager.start(AttachRequestInterceptor::process_id(10)).await.unwrap();
        let _client = TcpStream::connect(("127.0.0.1", session.port())).await.unwrap();

        launcher.children.lock().unwrap()[0].exit(0);
        tokio::time::timeout(Duration::from_secs(5), session.disposed())
            .await
            .unwrap();
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn shutdown_force_disposes_everything() {
        let launcher = Arc::new(DebuggerLauncher::default());
        let manager = manager(launcher.clone());
        let a = manager.start(AttachRequestInterceptor::process_id(1)).await.unwrap();
        let b = manager.start(AttachRequestInterceptor::process_id(2)).await.unwrap();

        manager.shutdown().await;

        assert_eq!(a.state(), SessionState::Disposed);
        assert_eq!(b.state(), SessionState::Disposed);
        assert!(manager.active().is_empty());
        let kills: usize = launcher
            .children
            .lock()
            .unwrap()
            .iter()
            .map(InMemoryProcess::kill_count)
            .sum();
        assert_eq!(kills, 2);
    }

    #[tokio::test]
    async fn launch_failure_is_returned_and_not_registered() {
        let launcher = Arc::new(DebuggerLauncher {
            fail: true,
            ..DebuggerLauncher::default()
        });
        let manager = manager(launcher);
        let err = manager
            .start(AttachRequestInterceptor::process_id(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DapError::Launch(_)));
        assert!(manager.active().is_empty());
    }

    #[test]
    fn debug_start_wire_shape() {
        let start = DebugStart {
            session_id: SessionId::new(3),
            port: 4711,
        };
        assert_eq!(
            serde_json::to_value(start).unwrap(),
            serde_json::json!({ "sessionId": 3, "port": 4711 })
        );
    }
}
