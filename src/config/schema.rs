//! Configuration schema definitions for lth.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) is a valid configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── HarnessConfig     - Parallelism, per-run deadline, cleanup, ledger
//! ├── RuntimeConfig     - Docker connection and container settings
//! ├── AnalyzerConfig    - External static analyzer invocation
//! ├── TestConfig        - Command executed inside each container
//! ├── [VariantConfig]   - Known runtime variants
//! └── ReportConfig      - JUnit output
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [harness]
/// max_parallel = 4
/// run_timeout_secs = 600
///
/// [runtime]
/// code_mount = "/var/task"
///
/// [analyzer]
/// program = "bun"
/// args = ["run", "analyzer/src/index.ts"]
///
/// [test]
/// command = "npm test"
///
/// [[variants]]
/// id = "nodejs:20"
/// image = "public.ecr.aws/lambda/nodejs:20"
/// ```
///
/// # Example
///
/// ```
/// use lambda_harness::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [harness]
///     max_parallel = 2
/// "#).unwrap();
/// assert_eq!(config.harness.max_parallel, 2);
/// assert_eq!(config.variants.len(), 3);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Orchestration settings.
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Container runtime settings.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Static analyzer settings.
    #[serde(default)]
    pub analyzer: AnalyzerConfig,

    /// Test command settings.
    #[serde(default)]
    pub test: TestConfig,

    /// Runtime variants that can be selected by id.
    ///
    /// Default: Node.js 20, 22 and 24 Lambda base images.
    #[serde(default = "default_variants")]
    pub variants: Vec<VariantConfig>,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default(),
            runtime: RuntimeConfig::default(),
            analyzer: AnalyzerConfig::default(),
            test: TestConfig::default(),
            variants: default_variants(),
            report: ReportConfig::default(),
        }
    }
}

/// Orchestration settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_parallel` | 4 |
/// | `run_timeout_secs` | 600 (10 minutes) |
/// | `cleanup_timeout_secs` | 60 |
/// | `ledger_path` | `.lth/ledger.json` |
/// | `persist_ledger` | true |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HarnessConfig {
    /// Maximum number of runs in flight at once.
    ///
    /// Runs beyond this wait for a free slot. Values below 1 are treated
    /// as 1.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Wall-clock ceiling for a single run, from slot acquisition to the end
    /// of Execute. Independent of batch size.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Ceiling for tearing down a single container.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout_secs: u64,

    /// File recording containers that were created and not yet removed.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Whether the ledger is written to `ledger_path`.
    ///
    /// When disabled the ledger lives in memory only and a crash between
    /// Create and cleanup can only be recovered by label (`lth sweep`).
    #[serde(default = "default_true")]
    pub persist_ledger: bool,
}

impl HarnessConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            run_timeout_secs: default_run_timeout(),
            cleanup_timeout_secs: default_cleanup_timeout(),
            ledger_path: default_ledger_path(),
            persist_ledger: true,
        }
    }
}

fn default_max_parallel() -> usize {
    4
}

fn default_run_timeout() -> u64 {
    600 // 10 minutes
}

fn default_cleanup_timeout() -> u64 {
    60
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".lth").join("ledger.json")
}

fn default_true() -> bool {
    true
}

/// Container runtime settings.
///
/// # Example
///
/// ```toml
/// [runtime]
/// docker_host = "tcp://192.168.1.100:2375"
/// code_mount = "/var/task"
/// network_mode = "bridge"
/// keep_alive = ["sleep", "infinity"]
///
/// [runtime.env]
/// AWS_REGION = "us-east-1"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Docker daemon URL. Uses the local socket when unset.
    pub docker_host: Option<String>,

    /// Where the function package is mounted inside the container.
    /// Also the working directory of the test command.
    ///
    /// Default: `/var/task` (the Lambda task root)
    #[serde(default = "default_code_mount")]
    pub code_mount: String,

    /// Docker network mode.
    ///
    /// Default: `bridge`
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Entrypoint that keeps the container alive while tests are executed
    /// in it.
    ///
    /// Default: `["sleep", "infinity"]`
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Vec<String>,

    /// Environment variables set in every container.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            code_mount: default_code_mount(),
            network_mode: default_network_mode(),
            keep_alive: default_keep_alive(),
            env: HashMap::new(),
        }
    }
}

fn default_code_mount() -> String {
    "/var/task".to_string()
}

fn default_network_mode() -> String {
    "bridge".to_string()
}

fn default_keep_alive() -> Vec<String> {
    vec!["sleep".to_string(), "infinity".to_string()]
}

/// Static analyzer settings.
///
/// The analyzer is invoked as `{program} {args...} {absolute target path}`
/// and must print a single JSON report on stdout.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerConfig {
    /// Whether `lth test` runs the analyzer before provisioning.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Analyzer executable.
    ///
    /// Default: `bun`
    #[serde(default = "default_analyzer_program")]
    pub program: String,

    /// Arguments placed before the target path.
    ///
    /// Default: `["run", "analyzer/src/index.ts"]`
    #[serde(default = "default_analyzer_args")]
    pub args: Vec<String>,

    /// Maximum analyzer run time in seconds.
    ///
    /// Default: 60
    #[serde(default = "default_analyzer_timeout")]
    pub timeout_secs: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: default_analyzer_program(),
            args: default_analyzer_args(),
            timeout_secs: default_analyzer_timeout(),
        }
    }
}

fn default_analyzer_program() -> String {
    "bun".to_string()
}

fn default_analyzer_args() -> Vec<String> {
    vec!["run".to_string(), "analyzer/src/index.ts".to_string()]
}

fn default_analyzer_timeout() -> u64 {
    60
}

/// Test command settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestConfig {
    /// Shell-style command line run inside each container.
    ///
    /// Split into arguments with shell quoting rules, not run through a
    /// shell. An empty string skips the Execute stage.
    ///
    /// Default: `npm test`
    #[serde(default = "default_test_command")]
    pub command: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            command: default_test_command(),
        }
    }
}

fn default_test_command() -> String {
    "npm test".to_string()
}

/// A selectable runtime variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VariantConfig {
    /// Identifier used on the command line, e.g. `nodejs:20`.
    pub id: String,

    /// Image reference provisioned for this variant.
    pub image: String,
}

fn default_variants() -> Vec<VariantConfig> {
    ["20", "22", "24"]
        .iter()
        .map(|v| VariantConfig {
            id: format!("nodejs:{}", v),
            image: format!("public.ecr.aws/lambda/nodejs:{}", v),
        })
        .collect()
}

/// Report settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `false` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML report.
    #[serde(default)]
    pub junit: bool,

    /// Filename for the JUnit XML report, inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: false,
            junit_file: default_junit_file(),
        }
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}
