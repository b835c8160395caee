//! Accelerator Telemetry
//!
//! Runs `nvidia-smi`, parses its per-process report into
//! [`AcceleratorRecord`]s, and narrows them down to the process being
//! benchmarked. Two output formats are understood:
//!
//! - CSV from `--query-compute-apps=...  --format=csv`
//! - the XML document from `-q -x`, which nests processes under each GPU
//!
//! Both produce the same record shape. Anything that does not parse is an
//! error; nothing is defaulted.

use crate::error::{Categorized, ErrorCategory};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Fields requested from `nvidia-smi --query-compute-apps`
pub const CSV_QUERY_FIELDS: &str =
    "timestamp,gpu_name,gpu_bus_id,gpu_serial,gpu_uuid,pid,process_name,used_gpu_memory";

/// Errors from querying or interpreting accelerator telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Accelerator query tool '{program}' is not available: {message}")]
    ToolUnavailable { program: String, message: String },

    #[error("Accelerator query tool '{program}' exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to parse accelerator output: {0}")]
    Parse(String),

    #[error("No accelerator record matches {0}")]
    NoMatch(String),

    #[error("{count} accelerator records match {filter}; expected exactly one")]
    AmbiguousMatch { filter: String, count: usize },
}

impl Categorized for TelemetryError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Telemetry
    }
}

/// One process using one accelerator, as of the query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorRecord {
    /// PCI bus id of the device
    pub device_id: String,
    /// Marketing name of the device
    pub device_name: String,
    /// Device UUID
    pub device_uuid: String,
    /// Process id holding accelerator memory
    pub pid: u32,
    /// Process name as reported by the driver
    pub process_name: String,
    /// Device memory held by the process, in MiB
    pub used_memory_mib: u64,
}

/// Output format requested from the query tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFormat {
    #[default]
    Csv,
    Xml,
}

/// Which records to keep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordFilter {
    /// Exact process id
    Pid(u32),
    /// Substring of the process name
    NameContains(String),
}

impl RecordFilter {
    /// Whether `record` passes this filter
    pub fn matches(&self, record: &AcceleratorRecord) -> bool {
        match self {
            RecordFilter::Pid(pid) => record.pid == *pid,
            RecordFilter::NameContains(needle) => record.process_name.contains(needle.as_str()),
        }
    }
}

impl std::fmt::Display for RecordFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordFilter::Pid(pid) => write!(f, "pid {}", pid),
            RecordFilter::NameContains(needle) => write!(f, "process name containing '{}'", needle),
        }
    }
}

/// Keep the records passing `filter`. An empty result is not an error.
pub fn filter_records(records: &[AcceleratorRecord], filter: &RecordFilter) -> Vec<AcceleratorRecord> {
    records.iter().filter(|r| filter.matches(r)).cloned().collect()
}

/// Exactly one record must pass `filter`.
pub fn select_single(
    records: &[AcceleratorRecord],
    filter: &RecordFilter,
) -> Result<AcceleratorRecord, TelemetryError> {
    let mut matched = filter_records(records, filter);
    match matched.len() {
        0 => Err(TelemetryError::NoMatch(filter.to_string())),
        1 => Ok(matched.remove(0)),
        count => Err(TelemetryError::AmbiguousMatch {
            filter: filter.to_string(),
            count,
        }),
    }
}

/// Source of accelerator records
pub trait AcceleratorQuery: Send + Sync {
    /// Snapshot of every process currently holding accelerator memory
    fn records(&self) -> Result<Vec<AcceleratorRecord>, TelemetryError>;

    /// Memory held by `pid`, which must appear in exactly one record
    fn memory_for_pid(&self, pid: u32) -> Result<u64, TelemetryError> {
        let records = self.records()?;
        select_single(&records, &RecordFilter::Pid(pid)).map(|r| r.used_memory_mib)
    }
}

/// `nvidia-smi` invoked as a subprocess
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    program: String,
    format: QueryFormat,
}

impl NvidiaSmi {
    /// Query `program` in `format`
    pub fn new(program: impl Into<String>, format: QueryFormat) -> Self {
        Self {
            program: program.into(),
            format,
        }
    }

    /// Arguments passed to the tool for the configured format
    pub fn args(&self) -> Vec<String> {
        match self.format {
            QueryFormat::Csv => vec![
                format!("--query-compute-apps={}", CSV_QUERY_FIELDS),
                "--format=csv".to_string(),
            ],
            QueryFormat::Xml => vec!["-q".to_string(), "-x".to_string()],
        }
    }

    fn run(&self) -> Result<String, TelemetryError> {
        debug!(program = %self.program, format = ?self.format, "querying accelerator");
        let output = Command::new(&self.program)
            .args(self.args())
            .output()
            .map_err(|e| TelemetryError::ToolUnavailable {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(TelemetryError::ToolFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| TelemetryError::Parse(format!("output is not UTF-8: {}", e)))
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi", QueryFormat::Csv)
    }
}

impl AcceleratorQuery for NvidiaSmi {
    fn records(&self) -> Result<Vec<AcceleratorRecord>, TelemetryError> {
        let output = self.run()?;
        match self.format {
            QueryFormat::Csv => parse_csv(&output),
            QueryFormat::Xml => parse_xml(&output),
        }
    }
}

/// Parse a memory figure such as `"1024 MiB"` or `"1024"`.
pub fn parse_memory_mib(value: &str) -> Result<u64, TelemetryError> {
    let trimmed = value.trim();
    let number = trimmed
        .strip_suffix("MiB")
        .map(str::trim_end)
        .unwrap_or(trimmed);
    number
        .parse::<u64>()
        .map_err(|_| TelemetryError::Parse(format!("invalid memory value '{}'", value.trim())))
}

fn parse_pid(value: &str) -> Result<u32, TelemetryError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| TelemetryError::Parse(format!("invalid pid '{}'", value.trim())))
}

/// Parse `--query-compute-apps` CSV output.
///
/// Columns are located by header name, ignoring unit suffixes like
/// `used_gpu_memory [MiB]`, so column order does not matter. Output without
/// a header line is rejected; a header with no rows yields no records.
pub fn parse_csv(output: &str) -> Result<Vec<AcceleratorRecord>, TelemetryError> {
    if output.trim().is_empty() {
        return Err(TelemetryError::Parse("empty output, expected a CSV header".to_string()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(output.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| TelemetryError::Parse(e.to_string()))?
        .clone();
    let column = |name: &str| -> Result<usize, TelemetryError> {
        headers
            .iter()
            .position(|h| h.split_whitespace().next() == Some(name))
            .ok_or_else(|| TelemetryError::Parse(format!("missing column '{}'", name)))
    };

    let bus_id = column("gpu_bus_id")?;
    let gpu_name = column("gpu_name")?;
    let gpu_uuid = column("gpu_uuid")?;
    let pid = column("pid")?;
    let process_name = column("process_name")?;
    let used_memory = column("used_gpu_memory")?;

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.map_err(|e| TelemetryError::Parse(e.to_string()))?;
        let field = |idx: usize| csv_field(&row, idx, line + 1);
        records.push(AcceleratorRecord {
            device_id: field(bus_id)?.to_string(),
            device_name: field(gpu_name)?.to_string(),
            device_uuid: field(gpu_uuid)?.to_string(),
            pid: parse_pid(field(pid)?)?,
            process_name: field(process_name)?.to_string(),
            used_memory_mib: parse_memory_mib(field(used_memory)?)?,
        });
    }
    Ok(records)
}

fn csv_field(row: &csv::StringRecord, idx: usize, line: usize) -> Result<&str, TelemetryError> {
    row.get(idx)
        .ok_or_else(|| TelemetryError::Parse(format!("row {} is too short", line)))
}

#[derive(Default)]
struct GpuContext {
    id: String,
    name: String,
    uuid: String,
}

#[derive(Default)]
struct ProcessFields {
    pid: Option<String>,
    name: Option<String>,
    used_memory: Option<String>,
}

/// Parse the `nvidia-smi -q -x` document.
pub fn parse_xml(output: &str) -> Result<Vec<AcceleratorRecord>, TelemetryError> {
    let mut reader = Reader::from_str(output);
    let mut stack: Vec<String> = Vec::new();
    let mut gpu: Option<GpuContext> = None;
    let mut process: Option<ProcessFields> = None;
    let mut records = Vec::new();
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| TelemetryError::Parse(format!("at byte {}: {}", reader.buffer_position(), e)))?;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "nvidia_smi_log" => saw_root = true,
                    "gpu" => {
                        let mut ctx = GpuContext::default();
                        for attr in e.attributes() {
                            let attr = attr.map_err(|e| TelemetryError::Parse(e.to_string()))?;
                            if attr.key.as_ref() == b"id" {
                                ctx.id = attr
                                    .unescape_value()
                                    .map_err(|e| TelemetryError::Parse(e.to_string()))?
                                    .into_owned();
                            }
                        }
                        gpu = Some(ctx);
                    }
                    "process_info" => process = Some(ProcessFields::default()),
                    _ => {}
                }
                stack.push(name);
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| TelemetryError::Parse(e.to_string()))?;
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let depth = stack.len();
                let (Some(leaf), Some(parent)) = (
                    stack.last().map(String::as_str),
                    depth.checked_sub(2).and_then(|i| stack.get(i)).map(String::as_str),
                ) else {
                    continue;
                };
                match (parent, leaf) {
                    ("gpu", "product_name") => {
                        if let Some(ctx) = gpu.as_mut() {
                            ctx.name = text.to_string();
                        }
                    }
                    ("gpu", "uuid") => {
                        if let Some(ctx) = gpu.as_mut() {
                            ctx.uuid = text.to_string();
                        }
                    }
                    ("process_info", field) => {
                        if let Some(p) = process.as_mut() {
                            match field {
                                "pid" => p.pid = Some(text.to_string()),
                                "process_name" => p.name = Some(text.to_string()),
                                "used_memory" => p.used_memory = Some(text.to_string()),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Event::End(e) => {
                let name = e.name();
                match name.as_ref() {
                    b"process_info" => {
                        let fields = process.take().unwrap_or_default();
                        let ctx = gpu.as_ref().ok_or_else(|| {
                            TelemetryError::Parse("process_info outside of a gpu element".to_string())
                        })?;
                        let missing =
                            |what: &str| TelemetryError::Parse(format!("process_info without {}", what));
                        records.push(AcceleratorRecord {
                            device_id: ctx.id.clone(),
                            device_name: ctx.name.clone(),
                            device_uuid: ctx.uuid.clone(),
                            pid: parse_pid(&fields.pid.ok_or_else(|| missing("pid"))?)?,
                            process_name: fields.name.unwrap_or_default(),
                            used_memory_mib: parse_memory_mib(
                                &fields.used_memory.ok_or_else(|| missing("used_memory"))?,
                            )?,
                        });
                    }
                    b"gpu" => gpu = None,
                    _ => {}
                }
                stack.pop();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err(TelemetryError::Parse("missing <nvidia_smi_log> root element".to_string()));
    }
    Ok(records)
}
