//! Configuration, settings persistence and project-properties caching.

mod paths;
mod properties;
mod service;
mod settings;

pub use paths::{config_path, data_dir, ensure_private_dir, log_dir, settings_path};
pub use properties::{
    ProjectProperties, ProjectPropertiesProvider, PropertiesCache, PropertiesError,
};
pub use service::{
    ConfigError, DebuggerConfig, LoggingConfig, MsBuildConfig, ServerConfig, ServiceConfig,
    TestHostConfig, VsTestConfig, expand_env_vars,
};
pub use settings::{ProjectKind, SettingsError, SettingsStore};
