#![warn(missing_docs)]
//! servebench CLI Library
//!
//! Command-line front-end of the `servebench` binary: configuration,
//! HTTP collaborators for a TorchServe-style server, the built-in
//! directory strategy, and environment diagnostics.
//!
//! The same binary doubles as the resource-sampler sidecar when started
//! with the hidden `--sampler-worker` flag.

mod client;
mod config;
mod environment;
mod strategy;

pub use client::{FilePart, InferenceClient, ManagementClient, Prediction};
pub use config::*;
pub use environment::{
    Check, CheckStatus, check_endpoints, check_tools, find_on_path, format_checks, has_errors,
};
pub use strategy::{DirectoryStrategy, HitFiles, ThresholdPolicy};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use servebench_core::{
    AcceleratorQuery, BenchmarkController, Monitor, NvidiaSmi, Phase, ProcessLauncher, QueryFormat,
    RecordFilter, SidecarMain, ThreadLauncher, filter_records,
};
use servebench_report::{
    CsvReportSink, ReportMeta, RunReport, default_report_filename, format_human_output,
    write_json_report,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// servebench CLI arguments
#[derive(Parser, Debug)]
#[command(name = "servebench")]
#[command(author, version, about = "servebench - load and resource benchmarks for model servers")]
pub struct Cli {
    /// Optional subcommand; defaults to Run
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file (default: discover servebench.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only warnings and errors; no progress spinner or result table
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Overrides for the benchmark run
    #[command(flatten)]
    pub run: RunArgs,

    /// Internal: run as the resource-sampler sidecar
    #[arg(long, hide = true)]
    pub sampler_worker: bool,
}

/// Flags overriding `servebench.toml` for a run
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Model to register and benchmark
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Base URL of the inference API
    #[arg(long, global = true)]
    pub inference_url: Option<String>,

    /// Base URL of the management API
    #[arg(long, global = true)]
    pub management_url: Option<String>,

    /// Directory of input files sent with each hit
    #[arg(long, global = true)]
    pub input_dir: Option<PathBuf>,

    /// Model server process to monitor
    #[arg(long, global = true)]
    pub target_pid: Option<u32>,

    /// Concurrent hits per iteration
    #[arg(long, global = true)]
    pub hit_size: Option<u32>,

    /// Batch size of the first iteration
    #[arg(long, global = true)]
    pub starting_batch_size: Option<u32>,

    /// Batch size growth per iteration
    #[arg(long, global = true)]
    pub batch_size_increment: Option<u32>,

    /// Safety cap on iterations
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Sampler isolation
    #[arg(long, value_enum, global = true)]
    pub isolation: Option<IsolationMode>,

    /// Directory for reports
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Also write a JSON run summary
    #[arg(long, global = true)]
    pub json: bool,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the benchmark (default)
    Run,
    /// Check tools on PATH and reachability of the configured server
    Check,
    /// Print accelerator processes as reported by the query tool
    Gpu {
        /// Only this process
        #[arg(long)]
        pid: Option<u32>,
        /// Only processes whose name contains this
        #[arg(long)]
        name: Option<String>,
        /// Query format
        #[arg(long, value_parser = parse_query_format)]
        format: Option<QueryFormat>,
    },
    /// List registered models, or describe one
    Models {
        /// Describe this model instead of listing
        name: Option<String>,
    },
    /// Print a default servebench.toml
    Init {
        /// Write it to this path instead of stdout
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn parse_query_format(s: &str) -> Result<QueryFormat, String> {
    match s.to_ascii_lowercase().as_str() {
        "csv" => Ok(QueryFormat::Csv),
        "xml" => Ok(QueryFormat::Xml),
        other => Err(format!("unknown format '{}', expected csv or xml", other)),
    }
}

/// Run the servebench CLI with the process arguments.
pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run_with_cli(cli)
}

/// Run the servebench CLI with pre-parsed arguments.
pub fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    // The sidecar must not touch stdout or install a subscriber
    if cli.sampler_worker {
        return run_sampler_worker();
    }

    let default_filter = if cli.verbose {
        "servebench=debug"
    } else if cli.quiet {
        "servebench=warn"
    } else {
        "servebench=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => ServebenchConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ServebenchConfig::discover().unwrap_or_default(),
    };
    apply_overrides(&mut config, &cli.run);

    match cli.command {
        Some(Commands::Run) | None => run_benchmark(&cli, &config),
        Some(Commands::Check) => check_environment(&config),
        Some(Commands::Gpu {
            pid,
            ref name,
            format,
        }) => print_accelerator(&config, pid, name.as_deref(), format),
        Some(Commands::Models { ref name }) => print_models(&config, name.as_deref()),
        Some(Commands::Init { ref write }) => init_config(write.as_ref()),
    }
}

/// Run as the sampler sidecar (IPC mode)
fn run_sampler_worker() -> anyhow::Result<()> {
    let mut sidecar = SidecarMain::new();
    sidecar
        .run()
        .map_err(|e| anyhow::anyhow!("Sampler sidecar error: {}", e))
}

/// Layer CLI flags over file values
pub fn apply_overrides(config: &mut ServebenchConfig, args: &RunArgs) {
    if let Some(model) = &args.model {
        config.service.model_name = model.clone();
    }
    if let Some(url) = &args.inference_url {
        config.service.inference_url = url.clone();
    }
    if let Some(url) = &args.management_url {
        config.service.management_url = url.clone();
    }
    if let Some(dir) = &args.input_dir {
        config.benchmark.input_dir = dir.display().to_string();
    }
    if let Some(pid) = args.target_pid {
        config.monitor.target_pid = Some(pid);
    }
    if let Some(n) = args.hit_size {
        config.benchmark.hit_size = n;
    }
    if let Some(n) = args.starting_batch_size {
        config.benchmark.starting_batch_size = n;
    }
    if let Some(n) = args.batch_size_increment {
        config.benchmark.batch_size_increment = n;
    }
    if let Some(n) = args.max_iterations {
        config.benchmark.max_iterations = Some(n);
    }
    if let Some(mode) = args.isolation {
        config.monitor.isolation = mode;
    }
    if let Some(dir) = &args.output_dir {
        config.output.directory = dir.display().to_string();
    }
    if args.json {
        config.output.json = true;
    }
}

fn build_monitor(config: &ServebenchConfig) -> anyhow::Result<Monitor> {
    let options = config.monitor_options()?;
    let accelerator = NvidiaSmi::new(
        config.monitor.accelerator_program.clone(),
        config.monitor.accelerator_format,
    );
    let monitor = match config.monitor.isolation {
        IsolationMode::Process => {
            let launcher = ProcessLauncher::current_exe(options.ready_timeout)?;
            Monitor::new(options).with_launcher(launcher)
        }
        IsolationMode::Thread => Monitor::new(options).with_launcher(ThreadLauncher),
    };
    Ok(monitor.with_accelerator(accelerator))
}

fn run_benchmark(cli: &Cli, config: &ServebenchConfig) -> anyhow::Result<()> {
    config.validate()?;
    let plan = config.plan()?;
    let timeout = config.request_timeout()?;

    let monitor = build_monitor(config)?;
    let manager = ManagementClient::new(
        &config.service.inference_url,
        &config.service.management_url,
        timeout,
    )?;
    let endpoint = InferenceClient::new(&config.service.inference_url, &plan.model_name, timeout)?;

    let policy = ThresholdPolicy::from_config(&config.policy)?;
    if policy.is_unbounded() && plan.max_iterations.is_none() {
        warn!("no policy limit and no max_iterations set; the run ends only on an error");
    }
    let strategy = DirectoryStrategy::new(&config.benchmark.input_dir, policy)
        .with_context(|| format!("cannot use input directory {}", config.benchmark.input_dir))?;

    let filename = config
        .output
        .filename
        .clone()
        .unwrap_or_else(|| default_report_filename(&plan.model_name, chrono::Utc::now()));
    let csv_path = PathBuf::from(&config.output.directory).join(filename);
    let mut sink = CsvReportSink::open(&csv_path)
        .with_context(|| format!("cannot open report {}", csv_path.display()))?;

    if !cli.quiet {
        println!(
            "Benchmarking {} ({} input files, hit_size {}, isolation {:?})\n",
            plan.model_name,
            strategy.files().len(),
            plan.hit_size,
            config.monitor.isolation
        );
    }

    let show_progress = !cli.quiet && std::io::stderr().is_terminal();
    let outcome = BenchmarkController::new(plan.clone(), &manager, &endpoint, &strategy, &monitor)
        .with_sink(&mut sink)
        .with_progress(show_progress)
        .run()?;
    info!(
        iterations = outcome.iterations.len(),
        hits = outcome.total_hits(),
        rows = sink.rows_written(),
        "run finished"
    );

    let report = RunReport::new(
        ReportMeta::now(plan.model_name.clone()),
        plan,
        monitor.options().clone(),
        outcome,
    );

    if !cli.quiet {
        print!("{}", format_human_output(&report));
        println!("CSV report: {}", csv_path.display());
    }
    if config.output.json {
        let json_path = csv_path.with_extension("json");
        write_json_report(&report, &json_path)?;
        if !cli.quiet {
            println!("JSON report: {}", json_path.display());
        }
    }

    if report.final_phase == Phase::Failed {
        eprintln!("\nBenchmark ended with an error");
        std::process::exit(1);
    }
    Ok(())
}

fn check_environment(config: &ServebenchConfig) -> anyhow::Result<()> {
    let mut checks = check_tools(std::env::var_os("PATH").as_deref());
    let client = ManagementClient::new(
        &config.service.inference_url,
        &config.service.management_url,
        config.request_timeout()?,
    )?;
    checks.extend(check_endpoints(
        &client,
        &config.service.inference_url,
        &config.service.management_url,
    ));
    print!("{}", format_checks(&checks));

    if has_errors(&checks) {
        std::process::exit(1);
    }
    Ok(())
}

fn print_accelerator(
    config: &ServebenchConfig,
    pid: Option<u32>,
    name: Option<&str>,
    format: Option<QueryFormat>,
) -> anyhow::Result<()> {
    let query = NvidiaSmi::new(
        config.monitor.accelerator_program.clone(),
        format.unwrap_or(config.monitor.accelerator_format),
    );
    let mut records = query.records()?;
    if let Some(pid) = pid {
        records = filter_records(&records, &RecordFilter::Pid(pid));
    }
    if let Some(name) = name {
        records = filter_records(&records, &RecordFilter::NameContains(name.to_string()));
    }

    if records.is_empty() {
        println!("No accelerator processes found.");
        return Ok(());
    }

    println!(
        "{:<14} {:<24} {:>8} {:>10}  {}",
        "device", "name", "pid", "mem MiB", "process"
    );
    for r in &records {
        println!(
            "{:<14} {:<24} {:>8} {:>10}  {}",
            r.device_id, r.device_name, r.pid, r.used_memory_mib, r.process_name
        );
    }
    println!("{} process(es).", records.len());
    Ok(())
}

fn print_models(config: &ServebenchConfig, name: Option<&str>) -> anyhow::Result<()> {
    let client = ManagementClient::new(
        &config.service.inference_url,
        &config.service.management_url,
        config.request_timeout()?,
    )?;
    let value = match name {
        Some(name) => client.describe_model(name)?,
        None => client.list_models()?,
    };
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn init_config(write: Option<&PathBuf>) -> anyhow::Result<()> {
    let content = ServebenchConfig::default_toml();
    match write {
        Some(path) => {
            if path.exists() {
                anyhow::bail!("{} already exists", path.display());
            }
            std::fs::write(path, content)?;
            println!("Configuration written to: {}", path.display());
        }
        None => print!("{}", content),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_flag_matches_cli() {
        let cli = Cli::try_parse_from(["servebench", servebench_ipc::SIDECAR_FLAG]).unwrap();
        assert!(cli.sampler_worker);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["servebench", "--model", "bert", "--hit-size", "4"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.run.model.as_deref(), Some("bert"));
        assert_eq!(cli.run.hit_size, Some(4));
    }

    #[test]
    fn test_subcommands_parse() {
        let cli = Cli::try_parse_from(["servebench", "gpu", "--pid", "7", "--format", "xml"]).unwrap();
        match cli.command {
            Some(Commands::Gpu { pid, format, .. }) => {
                assert_eq!(pid, Some(7));
                assert_eq!(format, Some(QueryFormat::Xml));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let cli = Cli::try_parse_from(["servebench", "models", "resnet-18", "--quiet"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Some(Commands::Models { name: Some(_) })));

        assert!(Cli::try_parse_from(["servebench", "gpu", "--format", "json"]).is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config: ServebenchConfig = toml::from_str(
            r#"
            [service]
            model_name = "from-file"
            [benchmark]
            hit_size = 2
            "#,
        )
        .unwrap();
        let cli = Cli::try_parse_from([
            "servebench",
            "run",
            "--model",
            "from-cli",
            "--isolation",
            "thread",
            "--json",
        ])
        .unwrap();
        apply_overrides(&mut config, &cli.run);

        assert_eq!(config.service.model_name, "from-cli");
        assert_eq!(config.benchmark.hit_size, 2);
        assert_eq!(config.monitor.isolation, IsolationMode::Thread);
        assert!(config.output.json);
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        init_config(Some(&path)).unwrap();
        assert!(ServebenchConfig::load(&path).is_ok());
        assert!(init_config(Some(&path)).is_err());
    }
}
