use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use easy_dotnet_types::{VsTestDisplayPolicies, VsTestDisplayPolicy};
use serde::Deserialize;

use crate::paths::config_path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// `~/.easy-dotnet/config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub debugger: DebuggerConfig,
    pub test_client: TestHostConfig,
    pub msbuild: MsBuildConfig,
    pub vstest: VsTestConfig,
}

/// ```toml
/// [server]
/// host = "127.0.0.1"
/// port = 0
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

/// Native debugger launched behind the DAP proxy.
///
/// ```toml
/// [debugger]
/// binary = "netcoredbg"
/// args = ["--interpreter=vscode"]
/// accept_timeout_secs = 30
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub accept_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub nested_request_timeout_ms: u64,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            binary: "netcoredbg".into(),
            args: vec!["--interpreter=vscode".into()],
            accept_timeout_secs: 30,
            shutdown_grace_secs: 5,
            nested_request_timeout_ms: 5000,
        }
    }
}

impl DebuggerConfig {
    #[must_use]
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    #[must_use]
    pub fn nested_request_timeout(&self) -> Duration {
        Duration::from_millis(self.nested_request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestHostConfig {
    pub connect_timeout_secs: u64,
    /// Hard ceiling for one discover or run call.
    pub run_timeout_secs: u64,
    pub exit_grace_secs: u64,
}

impl Default for TestHostConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            run_timeout_secs: 180,
            exit_grace_secs: 5,
        }
    }
}

impl TestHostConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    #[must_use]
    pub fn exit_grace(&self) -> Duration {
        Duration::from_secs(self.exit_grace_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MsBuildConfig {
    pub dotnet: String,
    pub properties_ttl_secs: u64,
}

impl Default for MsBuildConfig {
    fn default() -> Self {
        Self {
            dotnet: "dotnet".into(),
            properties_ttl_secs: 300,
        }
    }
}

impl MsBuildConfig {
    #[must_use]
    pub fn properties_ttl(&self) -> Duration {
        Duration::from_secs(self.properties_ttl_secs)
    }
}

/// ```toml
/// [vstest.display_policies]
/// "executor://mstestadapter/v2" = "pass_through"
/// "executor://xunit/" = "trailing_segment"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VsTestConfig {
    pub display_policies: HashMap<String, VsTestDisplayPolicy>,
}

impl VsTestConfig {
    /// Built-in policies with the configured entries layered on top.
    #[must_use]
    pub fn policies(&self) -> VsTestDisplayPolicies {
        VsTestDisplayPolicies::with_overrides(
            self.display_policies
                .iter()
                .map(|(uri, policy)| (uri.clone(), *policy)),
        )
    }
}

/// Replace `${VAR}` with the variable's value (empty when unset).
/// An unterminated `${` is kept verbatim.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &tail[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

impl ServiceConfig {
    /// Load `~/.easy-dotnet/config.toml`. `Ok(None)` when there is no file.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match Self::parse(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Parse TOML text and expand `${VAR}` references in string values.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_env();
        Ok(config)
    }

    fn expand_env(&mut self) {
        self.server.host = expand_env_vars(&self.server.host);
        if let Some(level) = &mut self.logging.level {
            *level = expand_env_vars(level);
        }
        self.debugger.binary = expand_env_vars(&self.debugger.binary);
        for arg in &mut self.debugger.args {
            *arg = expand_env_vars(arg);
        }
        self.msbuild.dotnet = expand_env_vars(&self.msbuild.dotnet);
    }
}
