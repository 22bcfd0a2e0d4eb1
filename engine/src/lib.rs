//! Service glue for easy-dotnet.
//!
//! Wires the test registry, test controller, debug session manager and
//! settings store together behind the JSON-RPC [`EndpointServer`].

#![allow(clippy::missing_errors_doc)]

mod controller;
mod msbuild;
mod server;
mod sessions;
mod vstest;

use std::sync::Arc;

use easy_dotnet_config::{ProjectPropertiesProvider, PropertiesCache, ServiceConfig, SettingsStore};
use easy_dotnet_hierarchy::TestRegistry;
use easy_dotnet_mtp::TestClientConfig;
use easy_dotnet_utils::ProcessLauncher;

pub use controller::{TestController, project_node_id};
pub use msbuild::{MsBuildPropertiesProvider, parse_properties};
pub use server::EndpointServer;
pub use sessions::{DebugSessionManager, DebugStart};
pub use vstest::vstest_case_id;

/// Everything one endpoint server shares between its connections.
#[derive(Debug)]
pub struct Services {
    pub registry: Arc<TestRegistry>,
    pub controller: TestController,
    pub sessions: Arc<DebugSessionManager>,
    pub settings: SettingsStore,
}

impl Services {
    #[must_use]
    pub fn new(
        config: &ServiceConfig,
        launcher: Arc<dyn ProcessLauncher>,
        properties: Arc<dyn ProjectPropertiesProvider>,
        settings: SettingsStore,
    ) -> Self {
        let registry = Arc::new(TestRegistry::new());
        let sessions = Arc::new(DebugSessionManager::new(
            launcher.clone(),
            config.debugger.clone(),
        ));
        let client_config = TestClientConfig {
            connect_timeout: config.test_client.connect_timeout(),
            run_timeout: config.test_client.run_timeout(),
            exit_grace: config.test_client.exit_grace(),
            ..TestClientConfig::default()
        };
        let controller = TestController::new(
            registry.clone(),
            launcher,
            PropertiesCache::new(properties, config.msbuild.properties_ttl()),
            sessions.clone(),
            config.msbuild.dotnet.clone(),
            client_config,
            config.vstest.policies(),
        );
        Self {
            registry,
            controller,
            sessions,
            settings,
        }
    }

    /// Force-dispose every debug session.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}
