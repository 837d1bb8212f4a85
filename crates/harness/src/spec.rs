//! Declarative YAML suite specification

use netcheck_common::{EndpointId, FrameSpec, PortId, Topology};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{HarnessError, HarnessResult};
use crate::sim::SimulationSpec;

/// A suite file: one topology plus the cases that run against it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    /// Unique name for this suite
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering suites
    #[serde(default)]
    pub tags: Vec<String>,

    pub topology: Topology,

    /// Global timing defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Cases to execute in order
    pub cases: Vec<CaseSpec>,

    /// Behavior of the in-process target used by `--simulate`
    #[serde(default)]
    pub simulation: Option<SimulationSpec>,
}

/// Timing defaults applied to intents that do not set their own
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Granularity of capture polling during an observation window
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_window_ms() -> u64 {
    1000
}

fn default_probe_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Defaults {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// One scenario: preconditions, stimuli with expectations, cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Case-local preconditions, run after the capture buffer is flushed
    #[serde(default)]
    pub setup: Vec<SetupStep>,

    pub intents: Vec<Intent>,

    /// Commands that always run once the case has started
    #[serde(default)]
    pub teardown: Vec<ProbeCommand>,
}

impl CaseSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            setup: Vec::new(),
            intents: Vec::new(),
            teardown: Vec::new(),
        }
    }

    pub fn setup(mut self, step: SetupStep) -> Self {
        self.setup.push(step);
        self
    }

    pub fn intent(mut self, intent: impl Into<Intent>) -> Self {
        self.intents.push(intent.into());
        self
    }

    pub fn teardown(mut self, endpoint: &str, command: &str) -> Self {
        self.teardown.push(ProbeCommand::new(endpoint, command));
        self
    }
}

/// A precondition step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SetupStep {
    /// Send a priming frame with no expectation (e.g. to teach the bridge a MAC)
    Inject { port: PortId, frame: FrameSpec },

    /// Wait for the target to settle (learning, route install)
    Settle { ms: u64 },

    /// Run a command that must exit 0
    Probe {
        endpoint: EndpointId,
        command: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

/// A stimulus together with its expected observable outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    Traffic(TrafficIntent),
    Probe(ProbeIntent),
    Agreement(AgreementIntent),
}

impl From<TrafficIntent> for Intent {
    fn from(intent: TrafficIntent) -> Self {
        Intent::Traffic(intent)
    }
}

impl From<ProbeIntent> for Intent {
    fn from(intent: ProbeIntent) -> Self {
        Intent::Probe(intent)
    }
}

impl From<AgreementIntent> for Intent {
    fn from(intent: AgreementIntent) -> Self {
        Intent::Agreement(intent)
    }
}

/// Inject a frame on one port, expect or forbid it on others
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficIntent {
    #[serde(default)]
    pub name: Option<String>,

    /// Ingress port the frame is sent on
    pub send: PortId,

    pub frame: FrameSpec,

    pub expect: Vec<PortExpectation>,

    #[serde(default)]
    pub window_ms: Option<u64>,
}

impl TrafficIntent {
    pub fn new(send: u16, frame: FrameSpec) -> Self {
        Self {
            name: None,
            send: PortId::new(send),
            frame,
            expect: Vec::new(),
            window_ms: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn expect(mut self, port: u16, expectation: Expectation) -> Self {
        self.expect.push(PortExpectation {
            port: PortId::new(port),
            expectation,
            frame: None,
        });
        self
    }

    pub fn window_ms(mut self, ms: u64) -> Self {
        self.window_ms = Some(ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    MustArrive,
    MustNotArrive,
}

impl std::fmt::Display for Expectation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expectation::MustArrive => write!(f, "must_arrive"),
            Expectation::MustNotArrive => write!(f, "must_not_arrive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortExpectation {
    pub port: PortId,
    pub expectation: Expectation,

    /// Match pattern for this port; defaults to the injected frame spec
    #[serde(default)]
    pub frame: Option<FrameSpec>,
}

/// Run a command on an endpoint and check its output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeIntent {
    #[serde(default)]
    pub name: Option<String>,

    pub endpoint: EndpointId,

    pub command: String,

    pub expect: OutputPredicate,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ProbeIntent {
    pub fn new(endpoint: &str, command: &str, expect: OutputPredicate) -> Self {
        Self {
            name: None,
            endpoint: endpoint.to_string(),
            command: command.to_string(),
            expect,
            timeout_ms: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }
}

/// Expected-output predicate; every clause that is set must hold
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputPredicate {
    #[serde(default)]
    pub contains: Option<String>,

    #[serde(default)]
    pub not_contains: Option<String>,

    #[serde(default)]
    pub regex: Option<String>,

    #[serde(default)]
    pub numeric: Option<NumericPredicate>,

    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl OutputPredicate {
    pub fn contains(text: &str) -> Self {
        Self { contains: Some(text.to_string()), ..Default::default() }
    }

    pub fn regex(pattern: &str) -> Self {
        Self { regex: Some(pattern.to_string()), ..Default::default() }
    }

    pub fn numeric(op: CompareOp, value: i64) -> Self {
        Self {
            numeric: Some(NumericPredicate { op, value, capture: None }),
            ..Default::default()
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.contains.is_none()
            && self.not_contains.is_none()
            && self.regex.is_none()
            && self.numeric.is_none()
            && self.exit_code.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumericPredicate {
    pub op: CompareOp,
    pub value: i64,

    /// Regex whose first capture group holds the number; whole stdout otherwise
    #[serde(default)]
    pub capture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn apply(self, actual: i64, expected: i64) -> bool {
        match self {
            CompareOp::Eq => actual == expected,
            CompareOp::Ne => actual != expected,
            CompareOp::Lt => actual < expected,
            CompareOp::Le => actual <= expected,
            CompareOp::Gt => actual > expected,
            CompareOp::Ge => actual >= expected,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// Several endpoints must report the same integer (e.g. route counts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementIntent {
    #[serde(default)]
    pub name: Option<String>,

    pub probes: Vec<ProbeCommand>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeCommand {
    pub endpoint: EndpointId,
    pub command: String,
}

impl ProbeCommand {
    pub fn new(endpoint: &str, command: &str) -> Self {
        Self { endpoint: endpoint.to_string(), command: command.to_string() }
    }
}

impl SuiteSpec {
    /// Parse a suite from YAML string
    pub fn from_yaml(yaml: &str) -> HarnessResult<Self> {
        serde_yaml::from_str(yaml).map_err(|e| HarnessError::SpecParse(e.to_string()))
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> HarnessResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content).map_err(|e| match e {
            HarnessError::SpecParse(msg) => {
                HarnessError::SpecParse(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Load a single suite file, or every suite in a directory
    pub fn load_all(path: &Path) -> HarnessResult<Vec<Self>> {
        if path.is_file() {
            return Ok(vec![Self::from_file(path)?]);
        }

        let mut files: Vec<_> = walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        files.sort();

        files.iter().map(|f| Self::from_file(f)).collect()
    }

    /// Cases selected by an optional tag and/or exact name
    pub fn select(&self, tag: Option<&str>, name: Option<&str>) -> Vec<&CaseSpec> {
        self.cases
            .iter()
            .filter(|c| tag.map_or(true, |t| c.tags.iter().any(|ct| ct == t)))
            .filter(|c| name.map_or(true, |n| c.name == n))
            .collect()
    }
}
