//! `dotnet` SDK invocations: property evaluation and builds.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use easy_dotnet_config::{ProjectProperties, ProjectPropertiesProvider, PropertiesError};
use easy_dotnet_utils::{CompletedProcess, ProcessLauncher, ProcessSpec, run_to_completion};
use futures_util::future::BoxFuture;
use serde::Deserialize;

const EVALUATE_TIMEOUT: Duration = Duration::from_secs(120);
const BUILD_TIMEOUT: Duration = Duration::from_secs(600);
/// Trailing output lines quoted in build failures.
const FAILURE_CONTEXT_LINES: usize = 20;

const PROPERTIES: [&str; 4] = [
    "TargetPath",
    "TargetFramework",
    "TestingPlatformDotnetTestSupport",
    "IsTestProject",
];

/// `dotnet <args>` with the SDK's first-run noise switched off.
pub(crate) fn dotnet_spec(dotnet: &str) -> ProcessSpec {
    ProcessSpec::new(dotnet)
        .env("DOTNET_NOLOGO", "1")
        .env("DOTNET_CLI_TELEMETRY_OPTOUT", "1")
        .label("dotnet")
}

/// Reads project properties with `dotnet msbuild -getProperty`.
pub struct MsBuildPropertiesProvider {
    launcher: Arc<dyn ProcessLauncher>,
    dotnet: String,
}

impl MsBuildPropertiesProvider {
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>, dotnet: impl Into<String>) -> Self {
        Self {
            launcher,
            dotnet: dotnet.into(),
        }
    }

    async fn evaluate(&self, project: &Path) -> Result<ProjectProperties, PropertiesError> {
        let mut spec = dotnet_spec(&self.dotnet).arg("msbuild").arg(project.to_string_lossy());
        for property in PROPERTIES {
            spec = spec.arg(format!("-getProperty:{property}"));
        }
        let evaluate_err = |message: String| PropertiesError::Evaluate {
            project: project.to_path_buf(),
            message,
        };
        let completed = run_to_completion(self.launcher.as_ref(), &spec, EVALUATE_TIMEOUT)
            .await
            .map_err(|e| evaluate_err(e.to_string()))?;
        if !completed.exit.success() {
            return Err(evaluate_err(failure_summary(&completed)));
        }
        parse_properties(project, &completed.stdout.join("\n"))
    }
}

impl ProjectPropertiesProvider for MsBuildPropertiesProvider {
    fn properties<'a>(
        &'a self,
        project: &'a Path,
    ) -> BoxFuture<'a, Result<ProjectProperties, PropertiesError>> {
        Box::pin(self.evaluate(project))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MsBuildOutput {
    properties: MsBuildProperties,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MsBuildProperties {
    #[serde(default)]
    target_path: String,
    #[serde(default)]
    target_framework: String,
    #[serde(default)]
    testing_platform_dotnet_test_support: String,
    #[serde(default)]
    is_test_project: String,
}

fn msbuild_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Parse the JSON document printed by `-getProperty` with several properties.
pub fn parse_properties(project: &Path, stdout: &str) -> Result<ProjectProperties, PropertiesError> {
    // The SDK may print banner lines before the document.
    let json = stdout.find('{').map_or("", |start| &stdout[start..]);
    let output: MsBuildOutput =
        serde_json::from_str(json).map_err(|e| PropertiesError::Parse {
            project: project.to_path_buf(),
            message: e.to_string(),
        })?;
    let props = output.properties;
    Ok(ProjectProperties {
        target_path: non_empty(props.target_path).map(PathBuf::from),
        target_framework: non_empty(props.target_framework),
        testing_platform_dotnet_test_support: msbuild_bool(
            &props.testing_platform_dotnet_test_support,
        ),
        is_test_project: msbuild_bool(&props.is_test_project),
    })
}

/// `dotnet build <project>`; fails with the tail of the build output.
pub(crate) async fn build_project(
    launcher: &dyn ProcessLauncher,
    dotnet: &str,
    project: &Path,
) -> anyhow::Result<()> {
    let spec = dotnet_spec(dotnet)
        .args(["build", "--nologo"])
        .arg(project.to_string_lossy());
    tracing::info!(project = %project.display(), "Building project");
    let completed = run_to_completion(launcher, &spec, BUILD_TIMEOUT)
        .await
        .with_context(|| format!("failed to build {}", project.display()))?;
    if !completed.exit.success() {
        bail!(
            "build of {} failed: {}",
            project.display(),
            failure_summary(&completed)
        );
    }
    Ok(())
}

pub(crate) fn failure_summary(completed: &CompletedProcess) -> String {
    let lines: Vec<&str> = completed
        .stderr
        .iter()
        .chain(completed.stdout.iter())
        .map(String::as_str)
        .filter(|line| !line.trim().is_empty())
        .collect();
    let tail = &lines[lines.len().saturating_sub(FAILURE_CONTEXT_LINES)..];
    match completed.exit.code {
        Some(code) => format!("exit code {code}\n{}", tail.join("\n")),
        None => format!("terminated by signal\n{}", tail.join("\n")),
    }
}
