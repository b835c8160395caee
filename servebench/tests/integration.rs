//! Integration tests for servebench
//!
//! Full runs against a mocked model server: HTTP collaborators, the
//! directory strategy, monitoring, and the CSV/JSON reports together.

use mockito::{Matcher, Mock, Server, ServerGuard};
use servebench::{
    BenchmarkController, BenchmarkPlan, ControllerError, CsvReportSink, DirectoryStrategy,
    InferenceClient, ManagementClient, Monitor, MonitorOptions, Phase, Registration, ReportMeta,
    RunReport, StopReason, ThresholdPolicy, UnregisterOutcome, generate_json_report,
};
use std::time::Duration;

const MODEL: &str = "resnet-18";

struct MockServer {
    server: ServerGuard,
    _health: Vec<Mock>,
}

impl MockServer {
    fn healthy() -> Self {
        let mut server = Server::new();
        let ping = server.mock("GET", "/ping").with_status(200).create();
        let models = server
            .mock("GET", "/models")
            .with_status(200)
            .with_body(r#"{"models":[]}"#)
            .create();
        Self {
            server,
            _health: vec![ping, models],
        }
    }

    fn register(&mut self, status: usize) -> Mock {
        self.server
            .mock("POST", "/models")
            .match_query(Matcher::UrlEncoded("url".into(), format!("{}.mar", MODEL)))
            .with_status(status)
            .create()
    }

    fn predictions(&mut self, status: usize, hits: usize) -> Mock {
        self.server
            .mock("POST", format!("/predictions/{}", MODEL).as_str())
            .with_status(status)
            .with_body("ok")
            .expect(hits)
            .create()
    }

    fn unregister(&mut self, status: usize, calls: usize) -> Mock {
        self.server
            .mock("DELETE", format!("/models/{}", MODEL).as_str())
            .with_status(status)
            .expect(calls)
            .create()
    }

    fn clients(&self) -> (ManagementClient, InferenceClient) {
        let url = self.server.url();
        let timeout = Duration::from_secs(5);
        (
            ManagementClient::new(&url, &url, timeout).unwrap(),
            InferenceClient::new(&url, MODEL, timeout).unwrap(),
        )
    }
}

fn inputs() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("cat.jpg"), vec![1u8; 100]).unwrap();
    std::fs::write(dir.path().join("dog.jpg"), vec![2u8; 300]).unwrap();
    dir
}

fn plan() -> BenchmarkPlan {
    let mut plan = BenchmarkPlan::new(MODEL);
    plan.hit_size = 2;
    plan.starting_batch_size = 1;
    plan.batch_size_increment = 1;
    plan.max_iterations = Some(10);
    plan
}

/// Batch size grows until the policy limit, then the model is unregistered
#[test]
fn test_full_run_until_batch_limit() {
    let mut server = MockServer::healthy();
    let register = server.register(200);
    let predictions = server.predictions(200, 6);
    let unregister = server.unregister(200, 1);
    let (manager, endpoint) = server.clients();

    let input_dir = inputs();
    let strategy = DirectoryStrategy::new(
        input_dir.path(),
        ThresholdPolicy {
            max_batch_size: Some(3),
            ..ThresholdPolicy::default()
        },
    )
    .unwrap();
    let monitor = Monitor::new(MonitorOptions::timer_only());

    let report_dir = tempfile::tempdir().unwrap();
    let csv_path = report_dir.path().join("report.csv");
    let mut sink = CsvReportSink::open(&csv_path).unwrap();

    let outcome = BenchmarkController::new(plan(), &manager, &endpoint, &strategy, &monitor)
        .with_sink(&mut sink)
        .run()
        .unwrap();

    register.assert();
    predictions.assert();
    unregister.assert();

    assert_eq!(outcome.registration, Registration::Created);
    assert_eq!(outcome.stop, StopReason::Policy);
    assert_eq!(outcome.unregistration, UnregisterOutcome::Removed);
    assert_eq!(outcome.final_phase, Phase::Done);
    let batches: Vec<u32> = outcome.iterations.iter().map(|r| r.state.batch_size).collect();
    assert_eq!(batches, [1, 2, 3]);
    assert_eq!(outcome.total_hits(), 6);

    let csv = std::fs::read_to_string(&csv_path).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with(
        "iteration,batch_size,hit_size,elapsed_ms,hits_ok,hits_failed,wait_mean_ms"
    ));
    assert!(lines[0].ends_with("files_sent,payload_bytes_mean"));
    assert!(!lines[0].contains("ram_uss"));
    assert!(lines[3].starts_with("3,3,2,"));
}

/// Failed hits trip the default failure-ratio limit after one iteration
#[test]
fn test_failing_inference_stops_run() {
    let mut server = MockServer::healthy();
    let _register = server.register(409);
    let predictions = server.predictions(503, 2);
    let unregister = server.unregister(404, 1);
    let (manager, endpoint) = server.clients();

    let input_dir = inputs();
    let strategy = DirectoryStrategy::new(
        input_dir.path(),
        ThresholdPolicy {
            max_failure_ratio: Some(0.0),
            ..ThresholdPolicy::default()
        },
    )
    .unwrap();
    let monitor = Monitor::new(MonitorOptions::timer_only());

    let outcome = BenchmarkController::new(plan(), &manager, &endpoint, &strategy, &monitor)
        .run()
        .unwrap();

    predictions.assert();
    unregister.assert();
    assert_eq!(outcome.registration, Registration::AlreadyRegistered);
    assert_eq!(outcome.iterations.len(), 1);
    assert_eq!(outcome.iterations[0].hits.failed, 2);
    assert!(outcome.iterations[0].hits.wait.is_none());
    assert_eq!(outcome.stop, StopReason::Policy);
    assert_eq!(outcome.unregistration, UnregisterOutcome::NotRegistered);
}

/// Nothing is dispatched or unregistered when registration fails
#[test]
fn test_registration_failure() {
    let mut server = MockServer::healthy();
    let _register = server.register(500);
    let predictions = server.predictions(200, 0);
    let unregister = server.unregister(200, 0);
    let (manager, endpoint) = server.clients();

    let input_dir = inputs();
    let strategy = DirectoryStrategy::new(input_dir.path(), ThresholdPolicy::default()).unwrap();
    let monitor = Monitor::new(MonitorOptions::timer_only());

    let err = BenchmarkController::new(plan(), &manager, &endpoint, &strategy, &monitor)
        .run()
        .unwrap_err();
    assert!(matches!(err, ControllerError::Registration(_)));
    predictions.assert();
    unregister.assert();
}

/// Resource axes of the current process, sampled on a thread
#[cfg(target_os = "linux")]
#[test]
fn test_run_with_resource_sampling() {
    let mut server = MockServer::healthy();
    let _register = server.register(200);
    let _predictions = server.predictions(200, 2);
    let _unregister = server.unregister(200, 1);
    let (manager, endpoint) = server.clients();

    let input_dir = inputs();
    let strategy = DirectoryStrategy::new(input_dir.path(), ThresholdPolicy::default()).unwrap();
    let options = MonitorOptions {
        sample_interval: Duration::from_millis(5),
        ..MonitorOptions::default()
    };
    let monitor = Monitor::new(options.clone());

    let mut plan = plan();
    plan.max_iterations = Some(1);
    plan.target_pid = Some(std::process::id());

    let outcome = BenchmarkController::new(plan.clone(), &manager, &endpoint, &strategy, &monitor)
        .run()
        .unwrap();
    assert_eq!(outcome.stop, StopReason::IterationLimit);
    let summary = &outcome.iterations[0].summary;
    assert!(summary.ram_uss_bytes.is_some());
    assert!(summary.cpu_percent.is_some());
    assert!(summary.sample_count >= 1);

    let report = RunReport::new(ReportMeta::now(MODEL), plan, options, outcome);
    let json = generate_json_report(&report).unwrap();
    assert!(json.contains("\"iteration_limit\""));
    assert!(json.contains("ram_uss_bytes"));
}
