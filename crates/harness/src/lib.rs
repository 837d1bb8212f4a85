//! Netcheck conformance harness
//!
//! Drives declarative network-behavior cases against a live or simulated
//! target:
//! - Loads YAML suites (topology, timing defaults, cases)
//! - Injects frames and captures them through a dataplane transport
//! - Runs probe commands through a command-execution transport
//! - Matches observations against expectations and aggregates outcomes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  SuiteRunner (orchestrator)                 │
//! │    ├── preflight(suite) -> health checks                    │
//! │    ├── run_suite(suite) -> SuiteResult                      │
//! │    └── write_report(result) -> netcheck-report.json         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CaseEngine                                                 │
//! │    INIT ▶ SETUP ▶ STIMULUS ▶ OBSERVE ▶ VERIFY ▶ TEARDOWN    │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  PortAdapter                 │  ProbeAdapter                │
//! │    send / flush / observe    │    run(endpoint, cmd, t)     │
//! ├──────────────────────────────┼──────────────────────────────┤
//! │  DataplaneTransport          │  CommandTransport            │
//! │    ├── SimSwitch             │    ├── ShellTransport        │
//! │    └── RawSocketTransport    │    └── ScriptedCommands      │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```

pub mod case;
pub mod dataplane;
pub mod error;
pub mod matcher;
pub mod probe;
#[cfg(target_os = "linux")]
pub mod raw;
pub mod runner;
pub mod sim;
pub mod spec;

pub use case::{CaseEngine, CheckResult, Outcome, Status};
pub use dataplane::{DataplaneTransport, Observation, PortAdapter};
pub use error::{ErrorKind, HarnessError, HarnessResult, ProbeError};
pub use probe::{CommandTransport, ProbeAdapter, ProbeOutput, ShellTransport};
pub use runner::{ExitStatus, RunnerConfig, Summary, SuiteReport, SuiteResult, SuiteRunner};
pub use sim::{ScriptedCommands, SimSwitch, SimulationSpec};
pub use spec::{CaseSpec, Defaults, Expectation, Intent, SuiteSpec};
