//! Legacy VSTest path through `dotnet test`.
//!
//! Discovery uses `--list-tests`; runs parse the console logger's per-test
//! result lines. Test names double as ids, scoped by project path.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use easy_dotnet_types::{TestFailure, TestNodeStatus, VsTestCase};
use easy_dotnet_utils::{ProcessLauncher, run_to_completion};

use crate::msbuild::{dotnet_spec, failure_summary};

const LIST_HEADER: &str = "The following Tests are available:";
const VSTEST_TIMEOUT: Duration = Duration::from_secs(1800);

/// Id of a VSTest case discovered from `project`.
#[must_use]
pub fn vstest_case_id(project: &Path, name: &str) -> String {
    format!("{}|{name}", project.display())
}

pub(crate) async fn list_tests(
    launcher: &dyn ProcessLauncher,
    dotnet: &str,
    project: &Path,
) -> anyhow::Result<Vec<VsTestCase>> {
    let spec = dotnet_spec(dotnet)
        .args(["test", "--no-build", "--list-tests"])
        .arg(project.to_string_lossy());
    let completed = run_to_completion(launcher, &spec, VSTEST_TIMEOUT)
        .await
        .with_context(|| format!("failed to list tests of {}", project.display()))?;
    if !completed.exit.success() {
        bail!("test discovery failed: {}", failure_summary(&completed));
    }
    Ok(parse_test_list(project, &completed.stdout))
}

/// Names listed after the `--list-tests` header.
pub(crate) fn parse_test_list(project: &Path, stdout: &[String]) -> Vec<VsTestCase> {
    stdout
        .iter()
        .skip_while(|line| line.trim() != LIST_HEADER)
        .skip(1)
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .map(|name| VsTestCase {
            id: vstest_case_id(project, name),
            fully_qualified_name: name.to_string(),
            display_name: name.to_string(),
            executor_uri: None,
            code_file_path: None,
            line_number: None,
        })
        .collect()
}

/// Outcome of one test as reported by the console logger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VsTestOutcome {
    pub name: String,
    pub status: TestNodeStatus,
}

pub(crate) async fn run_tests(
    launcher: &dyn ProcessLauncher,
    dotnet: &str,
    project: &Path,
    names: Option<&[String]>,
) -> anyhow::Result<Vec<VsTestOutcome>> {
    let mut spec = dotnet_spec(dotnet)
        .args(["test", "--no-build", "--logger", "console;verbosity=normal"])
        .arg(project.to_string_lossy());
    if let Some(names) = names {
        spec = spec.arg("--filter").arg(test_filter(names));
    }
    let completed = run_to_completion(launcher, &spec, VSTEST_TIMEOUT)
        .await
        .with_context(|| format!("failed to run tests of {}", project.display()))?;
    let outcomes = parse_results(&completed.stdout);
    // `dotnet test` exits non-zero when any test failed; only no results at all is an error.
    if outcomes.is_empty() && !completed.exit.success() {
        bail!("test run failed: {}", failure_summary(&completed));
    }
    Ok(outcomes)
}

/// `FullyQualifiedName=A|FullyQualifiedName=B`, with filter metacharacters escaped.
pub(crate) fn test_filter(names: &[String]) -> String {
    names
        .iter()
        .map(|name| {
            let base = easy_dotnet_types::split_arguments(name).0;
            let mut escaped = String::with_capacity(base.len());
            for ch in base.chars() {
                if matches!(ch, '\\' | '(' | ')' | '&' | '|' | '=' | '!' | '~') {
                    escaped.push('\\');
                }
                escaped.push(ch);
            }
            format!("FullyQualifiedName={escaped}")
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Parse `  Passed Name [12 ms]` style lines plus the failure details that follow.
pub(crate) fn parse_results(stdout: &[String]) -> Vec<VsTestOutcome> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Message,
        Stack,
    }

    let mut outcomes: Vec<VsTestOutcome> = Vec::new();
    let mut section = Section::None;
    let mut message: Vec<&str> = Vec::new();
    let mut stack: Vec<&str> = Vec::new();

    let flush = |outcomes: &mut Vec<VsTestOutcome>, message: &mut Vec<&str>, stack: &mut Vec<&str>| {
        if let Some(VsTestOutcome {
            status: TestNodeStatus::Failed { error, .. },
            ..
        }) = outcomes.last_mut()
        {
            if !message.is_empty() {
                error.message = Some(message.join("\n"));
            }
            if !stack.is_empty() {
                error.stack_trace = Some(stack.join("\n"));
            }
        }
        message.clear();
        stack.clear();
    };

    for line in stdout {
        let trimmed = line.trim();
        if let Some(outcome) = parse_result_line(trimmed) {
            flush(&mut outcomes, &mut message, &mut stack);
            section = Section::None;
            outcomes.push(outcome);
            continue;
        }
        match trimmed {
            "Error Message:" => section = Section::Message,
            "Stack Trace:" => section = Section::Stack,
            "" => {}
            _ if trimmed.starts_with("Standard Output Messages:") => section = Section::None,
            _ if section == Section::Message => message.push(trimmed),
            _ if section == Section::Stack => stack.push(trimmed),
            _ => {}
        }
    }
    flush(&mut outcomes, &mut message, &mut stack);
    outcomes
}

fn parse_result_line(line: &str) -> Option<VsTestOutcome> {
    let (verdict, rest) = line.split_once(' ')?;
    let rest = rest.trim();
    let (name, duration_ms) = match rest.rfind(" [") {
        Some(open) if rest.ends_with(']') => (
            rest[..open].trim(),
            parse_duration_ms(&rest[open + 2..rest.len() - 1]),
        ),
        _ => (rest, None),
    };
    if name.is_empty() {
        return None;
    }
    let status = match verdict {
        "Passed" => TestNodeStatus::Passed { duration_ms },
        "Failed" => TestNodeStatus::Failed {
            duration_ms,
            error: TestFailure {
                message: None,
                stack_trace: None,
            },
        },
        "Skipped" => TestNodeStatus::Skipped { reason: None },
        _ => return None,
    };
    Some(VsTestOutcome {
        name: name.to_string(),
        status,
    })
}

/// `12 ms`, `< 1 ms`, `2 s`, `1 m 3 s`.
fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim().trim_start_matches('<').trim();
    let mut total = 0u64;
    let mut parts = raw.split_whitespace();
    let mut matched = false;
    while let (Some(value), Some(unit)) = (parts.next(), parts.next()) {
        let value: u64 = value.parse().ok()?;
        total += match unit {
            "ms" => value,
            "s" => value * 1000,
            "m" => value * 60_000,
            "h" => value * 3_600_000,
            _ => return None,
        };
        matched = true;
    }
    matched.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(String::from).collect()
    }

    #[test]
    fn list_output_yields_cases_after_header() {
        let stdout = lines(
            "  Determining projects to restore...\nThe following Tests are available:\n    MyNamespace.MyClass.MyTest\n    MyNamespace.MyClass.Other(x: 1)\n",
        );
        let cases = parse_test_list(Path::new("/repo/App.Tests.csproj"), &stdout);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].id, "/repo/App.Tests.csproj|MyNamespace.MyClass.MyTest");
        assert_eq!(cases[1].display_name, "MyNamespace.MyClass.Other(x: 1)");
    }

    #[test]
    fn console_results_with_failure_details() {
        let stdout = lines(
            "  Passed MyNamespace.MyClass.Works [12 ms]
  Failed MyNamespace.MyClass.Breaks [1 s]
  Error Message:
   Assert.Equal() Failure
   Expected: 1
  Stack Trace:
     at MyNamespace.MyClass.Breaks() in /src/MyClass.cs:line 20
  Skipped MyNamespace.MyClass.Later [< 1 ms]

Failed!  - Failed:     1, Passed:     1, Skipped:     1",
        );
        let outcomes = parse_results(&stdout);
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].status, TestNodeStatus::Passed { duration_ms: Some(12) });
        match &outcomes[1].status {
            TestNodeStatus::Failed { duration_ms, error } => {
                assert_eq!(*duration_ms, Some(1000));
                assert_eq!(error.message.as_deref(), Some("Assert.Equal() Failure\nExpected: 1"));
                assert!(error.stack_trace.as_deref().unwrap().contains("line 20"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(outcomes[2].name, "MyNamespace.MyClass.Later");
        assert_eq!(outcomes[2].status, TestNodeStatus::Skipped { reason: None });
    }

    #[test]
    fn filter_escapes_and_drops_arguments() {
        let filter = test_filter(&["A.B.C(1)".to_string(), "A.B!D".to_string()]);
        assert_eq!(filter, "FullyQualifiedName=A.B.C|FullyQualifiedName=A.B\\!D");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration_ms("12 ms"), Some(12));
        assert_eq!(parse_duration_ms("< 1 ms"), Some(1));
        assert_eq!(parse_duration_ms("1 m 3 s"), Some(63_000));
        assert_eq!(parse_duration_ms("soon"), None);
    }
}
