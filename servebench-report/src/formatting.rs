//! Output Formatting
//!
//! Terminal table of a run: one line per iteration, followed by why the
//! loop stopped and what happened to the registration.

use crate::report::RunReport;
use servebench_core::{AxisSummary, StopReason, UnregisterOutcome};

fn fmt_ms(value: Option<f64>) -> String {
    value.map(|v| format!("{:.1}", v)).unwrap_or_else(|| "-".to_string())
}

fn fmt_axis(axis: Option<&AxisSummary>, scale: f64, precision: usize) -> String {
    match axis {
        None => "-".to_string(),
        Some(AxisSummary::NoData) => "n/a".to_string(),
        Some(AxisSummary::Observed(m)) => format!("{:.*}", precision, m.max / scale),
    }
}

/// Format a run report for terminal display
pub fn format_human_output(report: &RunReport) -> String {
    let mut output = String::new();

    output.push('\n');
    output.push_str(&format!("servebench results: {}\n", report.meta.model_name));
    output.push_str(&"=".repeat(78));
    output.push('\n');
    output.push_str(&format!(
        "hit_size {}  start {}  increment {}  registration {:?}\n\n",
        report.plan.hit_size,
        report.plan.starting_batch_size,
        report.plan.batch_size_increment,
        report.registration
    ));

    output.push_str(&format!(
        "  {:>4}  {:>6}  {:>10}  {:>9}  {:>10}  {:>10}  {:>12}  {:>8}  {:>8}\n",
        "iter", "batch", "elapsed ms", "ok/fail", "wait mean", "wait p95", "ram max MiB", "cpu max", "acc MiB"
    ));
    output.push_str(&format!("  {}\n", "-".repeat(76)));

    for record in &report.iterations {
        let wait = record.hits.wait.as_ref();
        output.push_str(&format!(
            "  {:>4}  {:>6}  {:>10}  {:>9}  {:>10}  {:>10}  {:>12}  {:>8}  {:>8}\n",
            record.state.iteration,
            record.state.batch_size,
            fmt_ms(record.summary.elapsed_ms),
            format!("{}/{}", record.hits.succeeded, record.hits.failed),
            fmt_ms(wait.map(|w| w.mean)),
            fmt_ms(wait.map(|w| w.p95)),
            fmt_axis(record.summary.ram_uss_bytes.as_ref(), 1024.0 * 1024.0, 1),
            fmt_axis(record.summary.cpu_percent.as_ref(), 1.0, 1),
            record
                .summary
                .accelerator_mem_mib
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ));
        if let Some(reason) = &record.summary.sampler_interruption {
            output.push_str(&format!("        sampler interrupted: {}\n", reason));
        }
    }

    if report.iterations.is_empty() {
        output.push_str("  (no completed iterations)\n");
    }

    output.push('\n');
    let stop = match &report.stop {
        StopReason::Policy => "stopping policy".to_string(),
        StopReason::IterationLimit => "iteration limit reached".to_string(),
        StopReason::Error { category, message } => format!("{}: {}", category, message),
    };
    output.push_str(&format!("Stopped: {}\n", stop));

    if let Some(batch) = report.max_completed_batch_size() {
        output.push_str(&format!("Largest completed batch size: {}\n", batch));
    }

    let unregister = match &report.unregistration {
        UnregisterOutcome::Removed => "removed".to_string(),
        UnregisterOutcome::NotRegistered => "was not registered".to_string(),
        UnregisterOutcome::Failed { message } => format!("FAILED ({})", message),
    };
    output.push_str(&format!("Unregistration: {}\n", unregister));

    output
}
