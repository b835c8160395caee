//! Configuration loading from servebench.toml
//!
//! The file is discovered by walking up from the current directory. Every
//! section is optional; command-line flags override file values.

use serde::{Deserialize, Serialize};
use servebench_core::{BenchmarkPlan, MonitorOptions, QueryFormat};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file looked up by [`ServebenchConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "servebench.toml";

/// servebench configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServebenchConfig {
    /// Model server endpoints and registration parameters
    #[serde(default)]
    pub service: ServiceConfig,
    /// Batch-size schedule
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    /// What to observe while hits run
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Limits of the built-in stopping policy
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Where reports go
    #[serde(default)]
    pub output: OutputConfig,
}

/// How the resource sampler is isolated from the benchmark process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Re-executed binary talking over pipes (default)
    #[default]
    Process,
    /// Dedicated thread in this process
    Thread,
}

/// Model server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the inference API
    #[serde(default = "default_inference_url")]
    pub inference_url: String,
    /// Base URL of the management API
    #[serde(default = "default_management_url")]
    pub management_url: String,
    /// Name the model is registered and addressed under
    #[serde(default)]
    pub model_name: String,
    /// Archive passed at registration; `<model_name>.mar` when unset
    #[serde(default)]
    pub archive: Option<String>,
    /// Workers the server starts for the model
    #[serde(default = "default_initial_workers")]
    pub initial_workers: u32,
    /// Server-side batching delay
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,
    /// Pause after registering and unregistering (e.g., "5s")
    #[serde(default = "default_settle_time")]
    pub settle_time: String,
    /// Timeout of a single HTTP request (e.g., "60s")
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            inference_url: default_inference_url(),
            management_url: default_management_url(),
            model_name: String::new(),
            archive: None,
            initial_workers: default_initial_workers(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            settle_time: default_settle_time(),
            request_timeout: default_request_timeout(),
        }
    }
}

fn default_inference_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_management_url() -> String {
    "http://localhost:8081".to_string()
}
fn default_initial_workers() -> u32 {
    1
}
fn default_max_batch_delay_ms() -> u64 {
    100
}
fn default_settle_time() -> String {
    "5s".to_string()
}
fn default_request_timeout() -> String {
    "60s".to_string()
}

/// Batch-size schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Directory the built-in strategy draws input files from
    #[serde(default = "default_input_dir")]
    pub input_dir: String,
    /// Concurrent hits per iteration
    #[serde(default = "default_hit_size")]
    pub hit_size: u32,
    /// Files per hit in the first iteration
    #[serde(default = "default_one")]
    pub starting_batch_size: u32,
    /// Growth of the batch size per iteration
    #[serde(default = "default_one")]
    pub batch_size_increment: u32,
    /// Safety cap on the number of iterations
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Bound on concurrently running hits
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            hit_size: default_hit_size(),
            starting_batch_size: default_one(),
            batch_size_increment: default_one(),
            max_iterations: None,
            max_concurrency: None,
        }
    }
}

fn default_input_dir() -> String {
    "inputs".to_string()
}
fn default_hit_size() -> u32 {
    8
}
fn default_one() -> u32 {
    1
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Model server process to observe
    #[serde(default)]
    pub target_pid: Option<u32>,
    /// Measure wall-clock time
    #[serde(default = "default_true")]
    pub timer: bool,
    /// Sample unique set size of the target
    #[serde(default = "default_true")]
    pub ram: bool,
    /// Sample CPU percent of the target
    #[serde(default = "default_true")]
    pub cpu: bool,
    /// Query accelerator memory after each iteration
    #[serde(default)]
    pub accelerator: bool,
    /// Pause between two samples (e.g., "20ms")
    #[serde(default = "default_sample_interval")]
    pub sample_interval: String,
    /// How long to wait for the first sample (e.g., "10s")
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: String,
    /// Sampler isolation: "process" or "thread"
    #[serde(default)]
    pub isolation: IsolationMode,
    /// Accelerator query format: "csv" or "xml"
    #[serde(default)]
    pub accelerator_format: QueryFormat,
    /// Accelerator query tool
    #[serde(default = "default_accelerator_program")]
    pub accelerator_program: String,
    /// Keep raw ram/cpu series in the JSON report
    #[serde(default)]
    pub keep_samples: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            target_pid: None,
            timer: true,
            ram: true,
            cpu: true,
            accelerator: false,
            sample_interval: default_sample_interval(),
            ready_timeout: default_ready_timeout(),
            isolation: IsolationMode::default(),
            accelerator_format: QueryFormat::default(),
            accelerator_program: default_accelerator_program(),
            keep_samples: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_sample_interval() -> String {
    "20ms".to_string()
}
fn default_ready_timeout() -> String {
    "10s".to_string()
}
fn default_accelerator_program() -> String {
    "nvidia-smi".to_string()
}

/// Limits of the built-in stopping policy. Unset limits are not checked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Stop once the mean wait of successful hits exceeds this (e.g., "2s")
    #[serde(default)]
    pub max_mean_wait: Option<String>,
    /// Stop once the p95 wait exceeds this
    #[serde(default)]
    pub max_p95_wait: Option<String>,
    /// Stop once this fraction of hits failed
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: Option<f64>,
    /// Stop after the iteration that reached this batch size
    #[serde(default)]
    pub max_batch_size: Option<u32>,
    /// Stop once peak USS of the target exceeds this many MiB
    #[serde(default)]
    pub max_ram_uss_mib: Option<u64>,
    /// Stop once accelerator memory of the target exceeds this many MiB
    #[serde(default)]
    pub max_accelerator_mib: Option<u64>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_mean_wait: None,
            max_p95_wait: None,
            max_failure_ratio: default_max_failure_ratio(),
            max_batch_size: None,
            max_ram_uss_mib: None,
            max_accelerator_mib: None,
        }
    }
}

fn default_max_failure_ratio() -> Option<f64> {
    Some(0.0)
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for CSV and JSON reports
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// CSV file name; `<model>_report_<UTC timestamp>.csv` when unset
    #[serde(default)]
    pub filename: Option<String>,
    /// Also write a JSON run summary next to the CSV
    #[serde(default)]
    pub json: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            filename: None,
            json: false,
        }
    }
}

fn default_output_dir() -> String {
    "servebench-reports".to_string()
}

impl ServebenchConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Walk up from `start` looking for `servebench.toml`
    pub fn find_from(start: impl Into<PathBuf>) -> Option<PathBuf> {
        let mut dir = start.into();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Try to discover and load configuration by walking up from current directory
    pub fn discover() -> Option<Self> {
        let path = Self::find_from(std::env::current_dir().ok()?)?;
        match Self::load(&path) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
                None
            }
        }
    }

    /// Check values that serde alone cannot
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.service.model_name.trim().is_empty() {
            anyhow::bail!("service.model_name is required (or pass --model)");
        }
        for (key, value) in [
            ("service.settle_time", self.service.settle_time.as_str()),
            ("service.request_timeout", self.service.request_timeout.as_str()),
            ("monitor.sample_interval", self.monitor.sample_interval.as_str()),
            ("monitor.ready_timeout", self.monitor.ready_timeout.as_str()),
        ] {
            Self::parse_duration(value).map_err(|e| anyhow::anyhow!("{}: {}", key, e))?;
        }
        for (key, value) in [
            ("policy.max_mean_wait", self.policy.max_mean_wait.as_deref()),
            ("policy.max_p95_wait", self.policy.max_p95_wait.as_deref()),
        ] {
            if let Some(value) = value {
                Self::parse_duration(value).map_err(|e| anyhow::anyhow!("{}: {}", key, e))?;
            }
        }
        if let Some(ratio) = self.policy.max_failure_ratio {
            if !(0.0..=1.0).contains(&ratio) {
                anyhow::bail!("policy.max_failure_ratio must be within 0.0..=1.0, got {}", ratio);
            }
        }

        self.plan()?
            .validate()
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        self.monitor_options()?
            .validate(self.monitor.target_pid)
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(())
    }

    /// The benchmark plan described by `[service]` and `[benchmark]`
    pub fn plan(&self) -> anyhow::Result<BenchmarkPlan> {
        let mut plan = BenchmarkPlan::new(self.service.model_name.clone());
        if let Some(archive) = &self.service.archive {
            plan.archive = archive.clone();
        }
        plan.initial_workers = self.service.initial_workers;
        plan.max_batch_delay_ms = self.service.max_batch_delay_ms;
        plan.settle_time = Self::parse_duration(&self.service.settle_time)?;
        plan.hit_size = self.benchmark.hit_size;
        plan.starting_batch_size = self.benchmark.starting_batch_size;
        plan.batch_size_increment = self.benchmark.batch_size_increment;
        plan.max_iterations = self.benchmark.max_iterations;
        plan.max_concurrency = self.benchmark.max_concurrency;
        plan.target_pid = self.monitor.target_pid;
        Ok(plan)
    }

    /// Monitor options described by `[monitor]`
    pub fn monitor_options(&self) -> anyhow::Result<MonitorOptions> {
        Ok(MonitorOptions {
            timer: self.monitor.timer,
            ram: self.monitor.ram,
            cpu: self.monitor.cpu,
            accelerator: self.monitor.accelerator,
            keep_samples: self.monitor.keep_samples,
            sample_interval: Self::parse_duration(&self.monitor.sample_interval)?,
            ready_timeout: Self::parse_duration(&self.monitor.ready_timeout)?,
        })
    }

    /// HTTP timeout for service and inference requests
    pub fn request_timeout(&self) -> anyhow::Result<Duration> {
        Self::parse_duration(&self.service.request_timeout)
    }

    /// Generate a default configuration as TOML string
    pub fn default_toml() -> String {
        r#"# servebench configuration

[service]
inference_url = "http://localhost:8080"
management_url = "http://localhost:8081"
# Model to register and benchmark (required)
model_name = "resnet-18"
# Archive passed at registration (defaults to <model_name>.mar)
# archive = "resnet-18.mar"
initial_workers = 1
max_batch_delay_ms = 100
# Pause after registering and unregistering
settle_time = "5s"
# Timeout of a single HTTP request
request_timeout = "60s"

[benchmark]
# Files sent with each hit are drawn round-robin from here
input_dir = "inputs"
# Concurrent hits per iteration (also the server-side batch size)
hit_size = 8
starting_batch_size = 1
batch_size_increment = 1
# Safety cap on iterations (uncomment to enable)
# max_iterations = 50
# Bound on concurrently running hits (uncomment to enable)
# max_concurrency = 8

[monitor]
# Model server process; required when ram, cpu or accelerator is on
# target_pid = 12345
timer = true
ram = true
cpu = true
accelerator = false
sample_interval = "20ms"
ready_timeout = "10s"
# Sampler isolation: "process" or "thread"
isolation = "process"
# Accelerator query format: "csv" or "xml"
accelerator_format = "csv"
accelerator_program = "nvidia-smi"
# Keep raw ram/cpu series in the JSON report
keep_samples = false

[policy]
# Stop at the first iteration that exceeds any of these
max_failure_ratio = 0.0
# max_mean_wait = "2s"
# max_p95_wait = "5s"
# max_batch_size = 64
# max_ram_uss_mib = 8192
# max_accelerator_mib = 16000

[output]
directory = "servebench-reports"
# filename = "resnet-18.csv"
# Also write a JSON run summary next to the CSV
json = false
"#
        .to_string()
    }

    /// Parse duration string (e.g., "3s", "500ms", "2m")
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim();
        if s.is_empty() {
            return Err(anyhow::anyhow!("Empty duration string"));
        }

        let (num_part, unit_part) = s
            .char_indices()
            .find(|(_, c)| c.is_alphabetic())
            .map(|(i, _)| s.split_at(i))
            .unwrap_or((s, "s"));

        let value: f64 = num_part
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid duration number: {}", num_part))?;
        if !value.is_finite() || value < 0.0 {
            return Err(anyhow::anyhow!("Invalid duration number: {}", num_part));
        }

        let multiplier: u64 = match unit_part.to_lowercase().as_str() {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" | "" => 1_000_000_000,
            "m" | "min" => 60_000_000_000,
            _ => return Err(anyhow::anyhow!("Unknown duration unit: {}", unit_part)),
        };

        Ok(Duration::from_nanos((value * multiplier as f64) as u64))
    }
}
