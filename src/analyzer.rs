//! Client for the external static analyzer.
//!
//! The analyzer is a separate program that inspects a function package and
//! prints a JSON report on stdout. It is invoked as
//! `<program> <args...> <absolute package path>` and must exit 0 on success.
//!
//! # Report Format
//!
//! ```json
//! {
//!   "handler": {"file": "index.js", "export": "handler", "type": "async",
//!               "confidence": "high", "source": "package.json"},
//!   "environment": [{"name": "TABLE", "hasDefault": true, "defaultValue": "orders"}],
//!   "awsServices": [{"service": "s3", "operations": ["GetObject"], "sdkVersion": "v3"}],
//!   "tests": [{"name": "smoke", "fixture": "events/smoke.json"}],
//!   "warnings": []
//! }
//! ```
//!
//! `handler` may be missing or null and every list may be omitted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;

/// Errors from running the analyzer.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("failed to start analyzer '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("analyzer exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("analyzer output is not a valid report: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    #[error("analyzer timed out after {0:?}")]
    TimedOut(Duration),

    #[error("invalid package path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },
}

/// Where and how the function handler is exported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandlerInfo {
    pub file: String,
    pub export: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub confidence: String,
    pub source: String,
}

impl HandlerInfo {
    /// Lambda-style handler string, e.g. `index.handler`.
    pub fn entry_point(&self) -> String {
        let module = Path::new(&self.file).with_extension("");
        format!("{}.{}", module.to_string_lossy(), self.export)
    }
}

/// An environment variable read by the function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvVarUsage {
    pub name: String,
    pub has_default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

/// Calls made to one AWS SDK service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsServiceUsage {
    pub service: String,
    pub operations: Vec<String>,
    pub sdk_version: String,
}

/// A test found next to the function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveredTest {
    pub name: String,
    pub fixture: String,
}

/// Everything the analyzer reports about a package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyzerReport {
    pub handler: Option<HandlerInfo>,
    pub environment: Vec<EnvVarUsage>,
    pub aws_services: Vec<AwsServiceUsage>,
    pub tests: Vec<DiscoveredTest>,
    pub warnings: Vec<String>,
}

impl AnalyzerReport {
    /// Parses a report from analyzer stdout.
    ///
    /// Tries the whole output first, then the last line that looks like a
    /// JSON object, so log lines printed before the report are tolerated.
    pub fn parse(stdout: &str) -> Result<Self, AnalyzerError> {
        match serde_json::from_str(stdout.trim()) {
            Ok(report) => Ok(report),
            Err(e) => {
                let Some(line) = stdout
                    .lines()
                    .rev()
                    .find(|line| line.trim_start().starts_with('{'))
                else {
                    return Err(e.into());
                };
                Ok(serde_json::from_str(line.trim())?)
            }
        }
    }

    /// Variables with a known default, as container environment entries.
    pub fn env_defaults(&self) -> Vec<(String, String)> {
        self.environment
            .iter()
            .filter(|v| v.has_default)
            .filter_map(|v| Some((v.name.clone(), v.default_value.clone()?)))
            .collect()
    }

    /// Variables the function reads that have no default.
    pub fn required_env(&self) -> impl Iterator<Item = &str> {
        self.environment
            .iter()
            .filter(|v| !v.has_default)
            .map(|v| v.name.as_str())
    }

    /// Required variables that `provided` does not supply.
    pub fn missing_env<'a>(
        &'a self,
        provided: &'a HashMap<String, String>,
    ) -> impl Iterator<Item = &'a str> {
        self.required_env()
            .filter(move |name| !provided.contains_key(*name))
    }
}

/// Runs the analyzer program.
#[derive(Debug, Clone)]
pub struct Analyzer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Analyzer {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Analyzes the package at `path`.
    pub async fn analyze(&self, path: &Path) -> Result<AnalyzerReport, AnalyzerError> {
        let path = std::fs::canonicalize(path).map_err(|e| AnalyzerError::InvalidPath {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !path.is_dir() {
            return Err(AnalyzerError::InvalidPath {
                path,
                reason: "not a directory".to_string(),
            });
        }

        debug!("Running analyzer: {} {:?} {}", self.program, self.args, path.display());

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.arg(&path);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| AnalyzerError::TimedOut(self.timeout))?
            .map_err(|source| AnalyzerError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(AnalyzerError::Exited {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let report = AnalyzerReport::parse(&String::from_utf8_lossy(&output.stdout))?;
        for warning in &report.warnings {
            warn!("analyzer: {}", warning);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "handler": {"file": "src/index.js", "export": "handler", "type": "async",
                    "confidence": "high", "source": "package.json"},
        "environment": [{"name": "TABLE_NAME", "hasDefault": true, "defaultValue": "orders"}],
        "awsServices": [{"service": "dynamodb", "operations": ["PutItem"], "sdkVersion": "v3"}],
        "tests": [],
        "warnings": []
    }"#;

    fn script_analyzer(script: &str) -> Analyzer {
        Analyzer::new(&AnalyzerConfig {
            enabled: true,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "analyzer".to_string()],
            timeout_secs: 10,
        })
    }

    #[test]
    fn test_fixture_deserializes_exactly() {
        let report = AnalyzerReport::parse(FIXTURE).unwrap();
        assert_eq!(
            report,
            AnalyzerReport {
                handler: Some(HandlerInfo {
                    file: "src/index.js".into(),
                    export: "handler".into(),
                    kind: "async".into(),
                    confidence: "high".into(),
                    source: "package.json".into(),
                }),
                environment: vec![EnvVarUsage {
                    name: "TABLE_NAME".into(),
                    has_default: true,
                    default_value: Some("orders".into()),
                }],
                aws_services: vec![AwsServiceUsage {
                    service: "dynamodb".into(),
                    operations: vec!["PutItem".into()],
                    sdk_version: "v3".into(),
                }],
                tests: vec![],
                warnings: vec![],
            }
        );
        assert_eq!(report.handler.unwrap().entry_point(), "src/index.handler");
    }

    #[test]
    fn test_missing_fields_default() {
        let report = AnalyzerReport::parse(r#"{"handler": null}"#).unwrap();
        assert_eq!(report, AnalyzerReport::default());
    }

    #[test]
    fn test_log_lines_before_report_are_skipped() {
        let out = "scanning /work/fn\n{\"warnings\": [\"no tests\"]}\n";
        let report = AnalyzerReport::parse(out).unwrap();
        assert_eq!(report.warnings, vec!["no tests"]);
    }

    #[test]
    fn test_env_defaults_and_required() {
        let report = AnalyzerReport {
            environment: vec![
                EnvVarUsage {
                    name: "A".into(),
                    has_default: true,
                    default_value: Some("1".into()),
                },
                EnvVarUsage {
                    name: "B".into(),
                    has_default: false,
                    default_value: None,
                },
            ],
            ..Default::default()
        };
        assert_eq!(report.env_defaults(), vec![("A".to_string(), "1".to_string())]);
        assert_eq!(report.required_env().collect::<Vec<_>>(), vec!["B"]);

        let mut provided = HashMap::new();
        assert_eq!(report.missing_env(&provided).collect::<Vec<_>>(), vec!["B"]);
        provided.insert("B".to_string(), "2".to_string());
        assert_eq!(report.missing_env(&provided).count(), 0);
    }

    #[tokio::test]
    async fn test_analyze_reads_report_from_subprocess() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.json"), FIXTURE).unwrap();

        let report = script_analyzer(r#"cat "$1/report.json""#)
            .analyze(dir.path())
            .await
            .unwrap();

        assert_eq!(report.aws_services[0].service, "dynamodb");
        assert_eq!(report.env_defaults(), vec![("TABLE_NAME".into(), "orders".into())]);
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let err = script_analyzer("echo 'No path passed into Analyzer' >&2; exit 1")
            .analyze(dir.path())
            .await
            .unwrap_err();

        match err {
            AnalyzerError::Exited { stderr, .. } => {
                assert_eq!(stderr, "No path passed into Analyzer")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let dir = tempfile::tempdir().unwrap();
        let err = script_analyzer("echo not-json")
            .analyze(dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = script_analyzer("sleep 5");
        analyzer.timeout = Duration::from_millis(100);

        let err = analyzer.analyze(dir.path()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_invalid_path_and_missing_program() {
        let err = script_analyzer("true")
            .analyze(Path::new("/definitely/not/here"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::InvalidPath { .. }));

        let dir = tempfile::tempdir().unwrap();
        let missing = Analyzer::new(&AnalyzerConfig {
            program: "lth-no-such-analyzer".into(),
            ..AnalyzerConfig::default()
        });
        let err = missing.analyze(dir.path()).await.unwrap_err();
        assert!(matches!(err, AnalyzerError::Spawn { .. }));
    }
}
