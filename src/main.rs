//! lth CLI - test a Lambda function package against several runtimes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use lambda_harness::analyzer::{Analyzer, AnalyzerReport};
use lambda_harness::cleanup::{self, CleanupSettings, ResourceLedger};
use lambda_harness::config::{self, Config};
use lambda_harness::orchestrator::{Orchestrator, OrchestratorSettings};
use lambda_harness::report::{ConsoleReporter, JUnitReporter, MultiReporter};
use lambda_harness::runtime::docker::DockerRuntime;
use lambda_harness::variant::{build_specifications, parse_test_command, resolve_variants};

#[derive(Parser)]
#[command(name = "lth")]
#[command(about = "Run Lambda function tests across Node.js runtimes", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "lth.toml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the package's tests in one container per runtime variant
    Test {
        /// Function package directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Node.js versions or variant ids (e.g. 20, nodejs:22)
        #[arg(short, long, value_delimiter = ',', default_value = "20")]
        node: Vec<String>,

        /// Test against every configured variant
        #[arg(short, long)]
        matrix: bool,

        /// Override maximum parallel runs
        #[arg(short, long)]
        parallel: Option<usize>,

        /// Override the per-run timeout, in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Do not run the static analyzer first
        #[arg(long)]
        skip_analysis: bool,
    },

    /// Run the static analyzer on a function package
    Analyze {
        /// Function package directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List the configured runtime variants
    Variants,

    /// Remove containers left behind by earlier runs
    Sweep,

    /// Write a default configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Test {
            path,
            node,
            matrix,
            parallel,
            timeout,
            junit,
            format,
            skip_analysis,
        } => {
            let mut config = config::load_config_or_default(&cli.config)?;
            if let Some(parallel) = parallel {
                config.harness.max_parallel = parallel;
            }
            if let Some(timeout) = timeout {
                config.harness.run_timeout_secs = timeout;
            }
            let options = TestOptions {
                path,
                node,
                matrix,
                junit,
                format,
                skip_analysis,
                verbose: cli.verbose,
            };
            let code = run_tests(config, options).await?;
            std::process::exit(code);
        }
        Commands::Analyze { path, format } => {
            let config = config::load_config_or_default(&cli.config)?;
            analyze(&config, &path, format).await
        }
        Commands::Variants => {
            let config = config::load_config_or_default(&cli.config)?;
            list_variants(&config);
            Ok(())
        }
        Commands::Sweep => {
            let config = config::load_config_or_default(&cli.config)?;
            let code = sweep(config).await?;
            std::process::exit(code);
        }
        Commands::Init => init_config(&cli.config),
    }
}

struct TestOptions {
    path: PathBuf,
    node: Vec<String>,
    matrix: bool,
    junit: Option<PathBuf>,
    format: OutputFormat,
    skip_analysis: bool,
    verbose: bool,
}

async fn run_tests(config: Config, options: TestOptions) -> Result<i32> {
    let path = std::fs::canonicalize(&options.path)
        .with_context(|| format!("Function package not found: {}", options.path.display()))?;
    let variants = resolve_variants(&options.node, &config.variants, options.matrix)?;
    let command = parse_test_command(&config.test.command)
        .with_context(|| format!("Invalid test command: {}", config.test.command))?;

    let mut env = Vec::new();
    if config.analyzer.enabled && !options.skip_analysis {
        match Analyzer::new(&config.analyzer).analyze(&path).await {
            Ok(report) => {
                if let Some(handler) = &report.handler {
                    info!(
                        "Handler: {} ({} confidence)",
                        handler.entry_point(),
                        handler.confidence
                    );
                }
                for name in report.missing_env(&config.runtime.env) {
                    warn!(
                        "Environment variable {} has no default and is not set in [runtime.env]",
                        name
                    );
                }
                env = report.env_defaults();
            }
            Err(e) => warn!("Static analysis skipped: {}", e),
        }
    }

    let specs = build_specifications(&variants, &path, &command, &env);

    let ledger = if config.harness.persist_ledger {
        ResourceLedger::persistent(&config.harness.ledger_path)?
    } else {
        ResourceLedger::in_memory()
    };
    let runtime = DockerRuntime::new(config.runtime.clone())?;
    let reporter = create_reporter(&config, options.junit, options.format, options.verbose);
    let orchestrator = Orchestrator::new(
        runtime,
        ledger,
        OrchestratorSettings::from_config(&config.harness),
    )
    .with_reporter(reporter);

    let token = CancellationToken::new();
    let interrupt = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling runs");
            interrupt.cancel();
        }
    });

    let results = orchestrator.run_all(&token, &specs).await?;

    // The batch token may be cancelled; teardown gets its own.
    let cleanup_errors = orchestrator
        .cleanup(&CancellationToken::new(), &results)
        .await;
    let summary = orchestrator.finish(&results, &cleanup_errors).await;

    if options.format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Ok(summary.exit_code())
}

fn create_reporter(
    config: &Config,
    junit_override: Option<PathBuf>,
    format: OutputFormat,
    verbose: bool,
) -> MultiReporter {
    let mut multi = MultiReporter::new();

    if format == OutputFormat::Text {
        multi = multi.with_reporter(ConsoleReporter::new(verbose));
    }

    if config.report.junit || junit_override.is_some() {
        let junit_path = junit_override
            .unwrap_or_else(|| config.report.output_dir.join(&config.report.junit_file));
        multi = multi.with_reporter(JUnitReporter::new(junit_path));
    }

    multi
}

async fn analyze(config: &Config, path: &Path, format: OutputFormat) -> Result<()> {
    let report = Analyzer::new(&config.analyzer).analyze(path).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_analysis(&report),
    }
    Ok(())
}

fn print_analysis(report: &AnalyzerReport) {
    match &report.handler {
        Some(handler) => println!(
            "Handler: {} ({}, {} confidence, from {})",
            handler.entry_point(),
            handler.kind,
            handler.confidence,
            handler.source
        ),
        None => println!("Handler: {}", console::style("not found").yellow()),
    }

    if !report.environment.is_empty() {
        println!();
        println!("Environment:");
        for var in &report.environment {
            match &var.default_value {
                Some(value) => println!("  {} = {}", var.name, value),
                None => println!("  {} {}", var.name, console::style("(required)").dim()),
            }
        }
    }

    if !report.aws_services.is_empty() {
        println!();
        println!("AWS services:");
        for service in &report.aws_services {
            println!(
                "  {} [{}] {}",
                service.service,
                service.sdk_version,
                service.operations.join(", ")
            );
        }
    }

    if !report.tests.is_empty() {
        println!();
        println!("Tests:");
        for test in &report.tests {
            println!("  {} ({})", test.name, test.fixture);
        }
    }

    for warning in &report.warnings {
        println!("{} {}", console::style("warning:").yellow(), warning);
    }
}

fn list_variants(config: &Config) {
    for variant in &config.variants {
        println!("{:<12} {}", variant.id, variant.image);
    }
}

async fn sweep(config: Config) -> Result<i32> {
    let ledger = ResourceLedger::persistent(&config.harness.ledger_path)?;
    let runtime = DockerRuntime::new(config.runtime.clone())?;
    let settings = CleanupSettings {
        max_parallel: config.harness.max_parallel,
        timeout: config.harness.cleanup_timeout(),
    };

    let report = cleanup::sweep(&runtime, &ledger, &CancellationToken::new(), &settings).await;

    println!("Removed {} container(s)", report.removed.len());
    if report.errors.is_empty() {
        return Ok(0);
    }
    for err in &report.errors {
        eprintln!("  {}", err);
    }
    Ok(1)
}

const CONFIG_TEMPLATE: &str = r#"# lth configuration file

[harness]
max_parallel = 4
run_timeout_secs = 600
cleanup_timeout_secs = 60
ledger_path = ".lth/ledger.json"

[runtime]
code_mount = "/var/task"
network_mode = "bridge"
keep_alive = ["sleep", "infinity"]

[analyzer]
enabled = true
program = "bun"
args = ["run", "analyzer/src/index.ts"]
timeout_secs = 60

[test]
command = "npm test"

[[variants]]
id = "nodejs:20"
image = "public.ecr.aws/lambda/nodejs:20"

[[variants]]
id = "nodejs:22"
image = "public.ecr.aws/lambda/nodejs:22"

[[variants]]
id = "nodejs:24"
image = "public.ecr.aws/lambda/nodejs:24"

[report]
output_dir = "test-results"
junit = false
junit_file = "junit.xml"
"#;

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!(
            "{} already exists. Remove it first or edit manually.",
            path.display()
        );
    }

    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  lth test");

    Ok(())
}
