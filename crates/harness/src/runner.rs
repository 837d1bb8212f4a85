//! Suite orchestrator: preflight, sequential case dispatch, summary and report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::case::{CaseEngine, Outcome, Status};
use crate::error::HarnessResult;
use crate::spec::SuiteSpec;

/// Name of the JSON report written into the output directory
pub const REPORT_FILE: &str = "netcheck-report.json";

/// Configuration for the suite runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory the JSON report is written to
    pub output_dir: PathBuf,

    /// Only run cases carrying this tag
    pub tag: Option<String>,

    /// Only run the case with this exact name
    pub name: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("test-results"),
            tag: None,
            name: None,
        }
    }
}

/// Derived counts; never stored, always computed from the outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
}

impl Summary {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let count = |status: Status| outcomes.iter().filter(|o| o.status == status).count();
        Self {
            total: outcomes.len(),
            passed: count(Status::Pass),
            failed: count(Status::Fail),
            errored: count(Status::Error),
        }
    }

    /// `None` when nothing ran
    pub fn pass_rate(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.passed as f64 / self.total as f64 * 100.0)
        }
    }

    /// `"66.7%"`, or `"N/A"` for an empty run
    pub fn pass_rate_display(&self) -> String {
        match self.pass_rate() {
            Some(rate) => format!("{:.1}%", rate),
            None => "N/A".to_string(),
        }
    }
}

/// Process exit policy, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExitStatus {
    /// Every case passed
    Success,
    /// Tests ran and found defects
    Failures,
    /// Tests could not run (preflight, abort, or ERROR outcomes)
    Errors,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failures => 1,
            ExitStatus::Errors => 2,
        }
    }
}

/// Result of one suite run. Outcomes are append-only while the run is in
/// progress and read-only afterwards.
#[derive(Debug, Clone)]
pub struct SuiteResult {
    suite: String,
    run_id: Uuid,
    started_at: DateTime<Utc>,
    outcomes: Vec<Outcome>,
    preflight_error: Option<String>,
    aborted: bool,
    duration: Duration,
}

impl SuiteResult {
    fn new(suite: &str) -> Self {
        Self {
            suite: suite.to_string(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            outcomes: Vec::new(),
            preflight_error: None,
            aborted: false,
            duration: Duration::ZERO,
        }
    }

    fn record(&mut self, outcome: Outcome) {
        self.outcomes.push(outcome);
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn outcomes(&self) -> &[Outcome] {
        &self.outcomes
    }

    pub fn preflight_error(&self) -> Option<&str> {
        self.preflight_error.as_deref()
    }

    pub fn aborted(&self) -> bool {
        self.aborted
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn summary(&self) -> Summary {
        Summary::from_outcomes(&self.outcomes)
    }

    pub fn exit_status(&self) -> ExitStatus {
        let summary = self.summary();
        if self.preflight_error.is_some() || self.aborted || summary.errored > 0 {
            ExitStatus::Errors
        } else if summary.failed > 0 {
            ExitStatus::Failures
        } else {
            ExitStatus::Success
        }
    }

    pub fn report(&self) -> SuiteReport {
        let summary = self.summary();
        SuiteReport {
            suite: self.suite.clone(),
            run_id: self.run_id,
            started_at: self.started_at,
            total: summary.total,
            passed: summary.passed,
            failed: summary.failed,
            errored: summary.errored,
            pass_rate: summary.pass_rate_display(),
            aborted: self.aborted,
            preflight_error: self.preflight_error.clone(),
            duration_ms: self.duration.as_millis() as u64,
            cases: self.outcomes.clone(),
        }
    }
}

/// Structured record emitted at the end of a suite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub suite: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub pass_rate: String,
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_error: Option<String>,
    pub duration_ms: u64,
    pub cases: Vec<Outcome>,
}

/// Runs suites one case at a time
pub struct SuiteRunner {
    engine: CaseEngine,
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl SuiteRunner {
    pub fn new(engine: CaseEngine) -> Self {
        Self::with_config(engine, RunnerConfig::default())
    }

    pub fn with_config(engine: CaseEngine, config: RunnerConfig) -> Self {
        Self {
            engine,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run after the in-flight case finishes
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Probe every node that declares a health check
    pub async fn preflight(&self, suite: &SuiteSpec) -> Result<(), String> {
        let timeout = suite.defaults.probe_timeout();
        let mut problems = Vec::new();

        for node in suite.topology.nodes() {
            let Some(check) = &node.health_check else {
                continue;
            };
            let Some(endpoint) = node.health_endpoint() else {
                problems.push(format!("{}: no endpoint for health check", node.name));
                continue;
            };

            debug!(node = %node.name, endpoint, "health check");
            match self.engine.probes().run_checked(endpoint, &check.command, timeout).await {
                Ok(output) => match &check.expect {
                    Some(expected) if output.stdout.trim() != expected.as_str() => {
                        problems.push(format!(
                            "{}: expected {:?}, got {:?}",
                            node.name,
                            expected,
                            output.stdout.trim()
                        ));
                    }
                    _ => info!("✓ {} reachable", node.name),
                },
                Err(e) => problems.push(format!("{}: {}", node.name, e)),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Preflight, then run the selected cases in order
    pub async fn run_suite(&self, suite: &SuiteSpec) -> SuiteResult {
        let start = Instant::now();
        let mut result = SuiteResult::new(&suite.name);

        if let Err(reason) = self.preflight(suite).await {
            error!("Setup failed. Aborting tests: {}", reason);
            result.preflight_error = Some(reason);
            result.duration = start.elapsed();
            return result;
        }

        let cases = suite.select(self.config.tag.as_deref(), self.config.name.as_deref());
        info!("Running {} case(s) from suite {}...", cases.len(), suite.name);

        for case in cases {
            if self.cancel.is_cancelled() {
                warn!("run aborted; skipping remaining cases");
                result.aborted = true;
                break;
            }

            let outcome = self.engine.run(&suite.topology, case, &suite.defaults).await;
            match outcome.status {
                Status::Pass => info!("✓ {} ({} ms)", outcome.name, outcome.duration_ms),
                Status::Fail => error!("✗ {} - {}", outcome.name, outcome.message),
                Status::Error => error!("! {} - {}", outcome.name, outcome.message),
            }
            result.record(outcome);
        }

        result.duration = start.elapsed();
        let summary = result.summary();
        info!(
            "Results: {} passed, {} failed, {} errored, pass rate {} ({} ms)",
            summary.passed,
            summary.failed,
            summary.errored,
            summary.pass_rate_display(),
            result.duration.as_millis()
        );
        result
    }

    /// Write the report to `<output_dir>/netcheck-report.json`
    pub fn write_report(&self, result: &SuiteResult) -> HarnessResult<PathBuf> {
        write_report(&self.config.output_dir, &result.report())
    }
}

pub fn write_report(dir: &Path, report: &SuiteReport) -> HarnessResult<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let path = dir.join(REPORT_FILE);
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(&path, json)?;

    info!("Report written to: {}", path.display());
    Ok(path)
}
