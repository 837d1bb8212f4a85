//! Test case engine
//!
//! Every case runs the same fixed sequence:
//!
//! ```text
//! INIT ─▶ SETUP ─▶ STIMULUS ─▶ OBSERVE ─▶ VERIFY ─▶ TEARDOWN ─▶ PASS | FAIL | ERROR
//! ```
//!
//! INIT compiles the declarative [`CaseSpec`] against the topology, so a
//! malformed case is rejected before any transport call. SETUP flushes the
//! capture buffer, runs the case-local preconditions and flushes again.
//! STIMULUS issues intents in declaration order without waiting on earlier
//! ones; traffic windows are tracked per intent from its own send time. VERIFY evaluates every sub-check without
//! short-circuiting. TEARDOWN runs whenever INIT succeeded, whatever the
//! earlier phases did.

use bytes::Bytes;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use netcheck_common::{FramePattern, PortId, Topology};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::task::Poll;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::dataplane::{Observation, PortAdapter};
use crate::error::{ErrorKind, HarnessError, HarnessResult, ProbeError};
use crate::matcher::{self, OutputMatcher, Verdict};
use crate::probe::ProbeAdapter;
use crate::spec::{
    AgreementIntent, CaseSpec, Defaults, Expectation, Intent, ProbeCommand, ProbeIntent, SetupStep,
    TrafficIntent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pass => write!(f, "PASS"),
            Status::Fail => write!(f, "FAIL"),
            Status::Error => write!(f, "ERROR"),
        }
    }
}

/// Result of one sub-check inside a case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub status: Status,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl CheckResult {
    fn from_verdict(name: String, verdict: Verdict) -> Self {
        Self {
            name,
            status: if verdict.passed { Status::Pass } else { Status::Fail },
            detail: verdict.detail,
            error_kind: None,
        }
    }

    fn error(name: String, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self { name, status: Status::Error, detail: detail.into(), error_kind: Some(kind) }
    }
}

/// Final, immutable result of one case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub status: Status,
    pub message: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub checks: Vec<CheckResult>,
}

impl Outcome {
    fn from_checks(name: &str, checks: Vec<CheckResult>, duration: Duration) -> Self {
        let status = if checks.iter().any(|c| c.status == Status::Fail) {
            Status::Fail
        } else if checks.iter().any(|c| c.status == Status::Error) {
            Status::Error
        } else {
            Status::Pass
        };

        let message = if status == Status::Pass {
            format!("{} check(s) passed", checks.len())
        } else {
            checks
                .iter()
                .filter(|c| c.status != Status::Pass)
                .map(|c| format!("[{}] {}: {}", c.status, c.name, c.detail))
                .collect::<Vec<_>>()
                .join("; ")
        };

        let error_kind = match status {
            Status::Error => checks.iter().find_map(|c| c.error_kind),
            _ => None,
        };

        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: duration.as_millis() as u64,
            error_kind,
            checks,
        }
    }

    fn error(name: &str, kind: Option<ErrorKind>, message: String, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            status: Status::Error,
            message,
            duration_ms: duration.as_millis() as u64,
            error_kind: kind,
            checks: Vec::new(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ===== compiled case =====

enum SetupAction {
    Inject { port: PortId, frame: Bytes },
    Settle(Duration),
    Probe { endpoint: String, command: String, timeout: Duration },
}

struct PortCheck {
    port: PortId,
    expectation: Expectation,
    pattern: FramePattern,
}

struct TrafficPlan {
    name: String,
    send: PortId,
    frame: Bytes,
    window: Duration,
    checks: Vec<PortCheck>,
}

struct ProbePlan {
    name: String,
    endpoint: String,
    command: String,
    timeout: Duration,
    matcher: OutputMatcher,
}

struct AgreementPlan {
    name: String,
    probes: Vec<ProbeCommand>,
    timeout: Duration,
}

enum IntentPlan {
    Traffic(TrafficPlan),
    Probe(ProbePlan),
    Agreement(AgreementPlan),
}

/// A case validated against the topology with every frame pre-built
struct CasePlan {
    setup: Vec<SetupAction>,
    intents: Vec<IntentPlan>,
    teardown: Vec<ProbeCommand>,
    probe_timeout: Duration,
}

impl CasePlan {
    fn compile(spec: &CaseSpec, topology: &Topology, defaults: &Defaults) -> HarnessResult<Self> {
        if spec.intents.is_empty() {
            return Err(HarnessError::InvalidCase(format!("{} declares no intents", spec.name)));
        }

        let probe_timeout = defaults.probe_timeout();
        let timeout_or_default = |ms: Option<u64>| ms.map(Duration::from_millis).unwrap_or(probe_timeout);

        let mut setup = Vec::with_capacity(spec.setup.len());
        for step in &spec.setup {
            setup.push(match step {
                SetupStep::Inject { port, frame } => {
                    topology.check_port(*port)?;
                    SetupAction::Inject { port: *port, frame: frame.compile()?.build() }
                }
                SetupStep::Settle { ms } => SetupAction::Settle(Duration::from_millis(*ms)),
                SetupStep::Probe { endpoint, command, timeout_ms } => {
                    topology.check_endpoint(endpoint)?;
                    SetupAction::Probe {
                        endpoint: endpoint.clone(),
                        command: command.clone(),
                        timeout: timeout_or_default(*timeout_ms),
                    }
                }
            });
        }

        let mut intents = Vec::with_capacity(spec.intents.len());
        for (i, intent) in spec.intents.iter().enumerate() {
            intents.push(match intent {
                Intent::Traffic(t) => IntentPlan::Traffic(compile_traffic(i, t, topology, defaults)?),
                Intent::Probe(p) => IntentPlan::Probe(compile_probe(i, p, topology, probe_timeout)?),
                Intent::Agreement(a) => {
                    IntentPlan::Agreement(compile_agreement(i, a, topology, probe_timeout)?)
                }
            });
        }

        for cmd in &spec.teardown {
            topology.check_endpoint(&cmd.endpoint)?;
        }

        Ok(Self {
            setup,
            intents,
            teardown: spec.teardown.clone(),
            probe_timeout,
        })
    }
}

fn compile_traffic(
    index: usize,
    intent: &TrafficIntent,
    topology: &Topology,
    defaults: &Defaults,
) -> HarnessResult<TrafficPlan> {
    let name = intent.name.clone().unwrap_or_else(|| format!("traffic#{}", index));
    topology.check_port(intent.send)?;

    // Unverified stimuli are an authoring gap
    if intent.expect.is_empty() {
        return Err(HarnessError::InvalidCase(format!(
            "{}: stimulus on port {} has no expectation",
            name, intent.send
        )));
    }

    let sent = intent.frame.compile()?;
    let mut checks = Vec::with_capacity(intent.expect.len());
    for exp in &intent.expect {
        topology.check_port(exp.port)?;
        let pattern = match &exp.frame {
            Some(frame) => frame.compile()?,
            None => sent.clone(),
        };
        checks.push(PortCheck { port: exp.port, expectation: exp.expectation, pattern });
    }

    Ok(TrafficPlan {
        name,
        send: intent.send,
        frame: sent.build(),
        window: intent.window_ms.map(Duration::from_millis).unwrap_or_else(|| defaults.window()),
        checks,
    })
}

fn compile_probe(
    index: usize,
    intent: &ProbeIntent,
    topology: &Topology,
    default_timeout: Duration,
) -> HarnessResult<ProbePlan> {
    topology.check_endpoint(&intent.endpoint)?;
    Ok(ProbePlan {
        name: intent
            .name
            .clone()
            .unwrap_or_else(|| format!("probe#{} {}", index, intent.endpoint)),
        endpoint: intent.endpoint.clone(),
        command: intent.command.clone(),
        timeout: intent.timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout),
        matcher: OutputMatcher::compile(&intent.expect)?,
    })
}

fn compile_agreement(
    index: usize,
    intent: &AgreementIntent,
    topology: &Topology,
    default_timeout: Duration,
) -> HarnessResult<AgreementPlan> {
    let name = intent.name.clone().unwrap_or_else(|| format!("agreement#{}", index));
    if intent.probes.len() < 2 {
        return Err(HarnessError::InvalidCase(format!(
            "{}: agreement needs at least two probes",
            name
        )));
    }
    for probe in &intent.probes {
        topology.check_endpoint(&probe.endpoint)?;
    }
    Ok(AgreementPlan {
        name,
        probes: intent.probes.clone(),
        timeout: intent.timeout_ms.map(Duration::from_millis).unwrap_or(default_timeout),
    })
}

/// Check a case against the topology without touching any transport
pub fn validate(spec: &CaseSpec, topology: &Topology, defaults: &Defaults) -> HarnessResult<()> {
    CasePlan::compile(spec, topology, defaults).map(|_| ())
}

// ===== engine =====

/// A traffic intent whose frame made it onto the transmit path
struct Issued<'a> {
    plan: &'a TrafficPlan,
    at: Instant,
}

impl Issued<'_> {
    fn deadline(&self) -> Instant {
        self.at + self.plan.window
    }

    /// Resolved before its window closes: every check is MUST_ARRIVE and met
    fn satisfied(&self, observation: &Observation) -> bool {
        self.plan.checks.iter().all(|c| {
            c.expectation == Expectation::MustArrive
                && matcher::arrived(&observation.within(c.port, self.at, self.deadline()), &c.pattern)
        })
    }
}

/// Drives one case at a time through the adapters
#[derive(Clone)]
pub struct CaseEngine {
    dataplane: PortAdapter,
    probes: ProbeAdapter,
}

impl CaseEngine {
    pub fn new(dataplane: PortAdapter, probes: ProbeAdapter) -> Self {
        Self { dataplane, probes }
    }

    pub fn probes(&self) -> &ProbeAdapter {
        &self.probes
    }

    /// Run one case to a single outcome. Never returns an error: anything
    /// that prevents the hypothesis from being tested becomes `ERROR`.
    pub async fn run(&self, topology: &Topology, spec: &CaseSpec, defaults: &Defaults) -> Outcome {
        let span = info_span!("case", name = %spec.name);
        self.run_inner(topology, spec, defaults).instrument(span).await
    }

    async fn run_inner(&self, topology: &Topology, spec: &CaseSpec, defaults: &Defaults) -> Outcome {
        let start = Instant::now();

        let plan = match CasePlan::compile(spec, topology, defaults) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("case rejected: {}", e);
                return Outcome::error(&spec.name, Some(e.kind()), e.to_string(), start.elapsed());
            }
        };

        let phases = AssertUnwindSafe(self.run_phases(&plan)).catch_unwind().await;

        self.teardown(&plan).await;

        let elapsed = start.elapsed();
        match phases {
            Ok(Ok(checks)) => Outcome::from_checks(&spec.name, checks, elapsed),
            Ok(Err(e)) => Outcome::error(&spec.name, Some(e.kind()), e.to_string(), elapsed),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::error(&spec.name, None, format!("case aborted: {}", reason), elapsed)
            }
        }
    }

    async fn run_phases(&self, plan: &CasePlan) -> HarnessResult<Vec<CheckResult>> {
        self.setup(plan).await?;
        Ok(self.exercise(plan).await)
    }

    async fn setup(&self, plan: &CasePlan) -> HarnessResult<()> {
        let flush = || async {
            self.dataplane
                .flush()
                .await
                .map_err(|e| HarnessError::Setup(format!("capture flush failed: {}", e)))
        };

        flush().await?;

        for action in &plan.setup {
            match action {
                SetupAction::Inject { port, frame } => {
                    self.dataplane
                        .send(*port, frame.clone())
                        .await
                        .map_err(|e| HarnessError::Setup(format!("inject on port {} failed: {}", port, e)))?;
                }
                SetupAction::Settle(delay) => {
                    debug!("settling for {:?}", delay);
                    tokio::time::sleep(*delay).await;
                }
                SetupAction::Probe { endpoint, command, timeout } => {
                    self.probes
                        .run_checked(endpoint, command, *timeout)
                        .await
                        .map_err(|e| HarnessError::Setup(format!("{} `{}`: {}", endpoint, command, e)))?;
                }
            }
        }

        // Priming traffic must not leak into observation
        if !plan.setup.is_empty() {
            flush().await?;
        }
        Ok(())
    }

    /// STIMULUS, OBSERVE and VERIFY. Errors become sub-results.
    async fn exercise(&self, plan: &CasePlan) -> Vec<CheckResult> {
        let mut results: Vec<Vec<CheckResult>> = (0..plan.intents.len()).map(|_| Vec::new()).collect();
        let mut issued: Vec<(usize, Issued<'_>)> = Vec::new();
        let mut commands = FuturesUnordered::new();

        for (i, intent) in plan.intents.iter().enumerate() {
            match intent {
                IntentPlan::Traffic(traffic) => {
                    let at = Instant::now();
                    match self.dataplane.send(traffic.send, traffic.frame.clone()).await {
                        Ok(()) => issued.push((i, Issued { plan: traffic, at })),
                        Err(e) => {
                            warn!(intent = %traffic.name, "send failed: {}", e);
                            results[i] = traffic
                                .checks
                                .iter()
                                .map(|c| {
                                    CheckResult::error(
                                        check_name(traffic, c),
                                        ErrorKind::IoError,
                                        format!("send on port {} failed: {}", traffic.send, e),
                                    )
                                })
                                .collect();
                        }
                    }
                }
                IntentPlan::Probe(p) => commands.push(self.run_probe(p).map(move |r| (i, r)).boxed()),
                IntentPlan::Agreement(a) => commands.push(self.run_agreement(a).map(move |r| (i, r)).boxed()),
            }

            // Start pending commands before issuing the next intent
            while let Poll::Ready(Some((i, check))) = futures::poll!(commands.next()) {
                results[i].push(check);
            }
        }

        let (observation, command_results) =
            tokio::join!(self.observe(&issued), commands.collect::<Vec<_>>());

        for (i, check) in command_results {
            results[i].push(check);
        }

        for (i, sent) in &issued {
            results[*i] = sent
                .plan
                .checks
                .iter()
                .map(|c| match &observation {
                    Ok(obs) => {
                        let frames = obs.within(c.port, sent.at, sent.deadline());
                        let verdict = matcher::check_traffic(c.port, &frames, &c.pattern, c.expectation);
                        CheckResult::from_verdict(check_name(sent.plan, c), verdict)
                    }
                    Err(e) => CheckResult::error(
                        check_name(sent.plan, c),
                        ErrorKind::IoError,
                        format!("capture failed: {}", e),
                    ),
                })
                .collect();
        }

        results.into_iter().flatten().collect()
    }

    async fn observe(&self, issued: &[(usize, Issued<'_>)]) -> std::io::Result<Observation> {
        let Some(deadline) = issued.iter().map(|(_, s)| s.deadline()).max() else {
            return Ok(Observation::default());
        };
        let ports: BTreeSet<PortId> = issued
            .iter()
            .flat_map(|(_, s)| s.plan.checks.iter().map(|c| c.port))
            .collect();

        self.dataplane
            .observe_until(&ports, deadline, |obs| {
                let now = Instant::now();
                issued
                    .iter()
                    .all(|(_, s)| now >= s.deadline() || s.satisfied(obs))
            })
            .await
    }

    async fn run_probe(&self, plan: &ProbePlan) -> CheckResult {
        match self.probes.run(&plan.endpoint, &plan.command, plan.timeout).await {
            Ok(output) => CheckResult::from_verdict(plan.name.clone(), plan.matcher.check(&output)),
            Err(e) => probe_error(plan.name.clone(), &e),
        }
    }

    async fn run_agreement(&self, plan: &AgreementPlan) -> CheckResult {
        let runs = plan
            .probes
            .iter()
            .map(|p| self.probes.run(&p.endpoint, &p.command, plan.timeout));
        let mut outputs = Vec::with_capacity(plan.probes.len());
        for (probe, result) in plan.probes.iter().zip(join_all(runs).await) {
            match result {
                Ok(output) => outputs.push((probe.endpoint.clone(), output)),
                Err(e) => return probe_error(plan.name.clone(), &e),
            }
        }
        CheckResult::from_verdict(plan.name.clone(), matcher::check_agreement(&outputs))
    }

    async fn teardown(&self, plan: &CasePlan) {
        for cmd in &plan.teardown {
            if let Err(e) = self
                .probes
                .run_checked(&cmd.endpoint, &cmd.command, plan.probe_timeout)
                .await
            {
                warn!(endpoint = %cmd.endpoint, command = %cmd.command, "teardown failed: {}", e);
            }
        }
    }
}

fn check_name(plan: &TrafficPlan, check: &PortCheck) -> String {
    format!("{} port {} {}", plan.name, check.port, check.expectation)
}

fn probe_error(name: String, e: &ProbeError) -> CheckResult {
    CheckResult::error(name, e.kind(), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeOutput;
    use crate::sim::{AclRule, ScriptedCommands, SimSwitch};
    use crate::spec::{OutputPredicate, PortExpectation, ProbeIntent, TrafficIntent};
    use netcheck_common::{FrameSpec, Node};
    use std::sync::Arc;

    struct Rig {
        switch: Arc<SimSwitch>,
        commands: Arc<ScriptedCommands>,
        engine: CaseEngine,
        topology: Topology,
        defaults: Defaults,
    }

    fn rig() -> Rig {
        let topology = Topology::new(vec![
            Node::new("ptfhost").with_port(0, None).with_port(1, None),
            Node::new("sonic1").with_endpoint("sonic1"),
            Node::new("sonic2").with_endpoint("sonic2"),
        ])
        .unwrap();
        let switch = Arc::new(SimSwitch::from_topology(&topology));
        let commands = Arc::new(ScriptedCommands::new());
        let engine = CaseEngine::new(
            PortAdapter::new(switch.clone()).with_poll_interval(Duration::from_millis(10)),
            ProbeAdapter::new(commands.clone()),
        );
        let defaults = Defaults { window_ms: 100, probe_timeout_ms: 200, poll_interval_ms: 10 };
        Rig { switch, commands, engine, topology, defaults }
    }

    impl Rig {
        async fn run(&self, case: &CaseSpec) -> Outcome {
            self.engine.run(&self.topology, case, &self.defaults).await
        }
    }

    fn flood() -> FrameSpec {
        FrameSpec::new()
            .eth("00:11:22:33:44:55", "ff:ff:ff:ff:ff:ff")
            .ipv4("10.100.1.100", "10.100.1.255")
            .icmp(8, 0)
            .marker("BROADCAST_TEST")
    }

    #[tokio::test]
    async fn test_flood_case_passes() {
        let rig = rig();
        let case = CaseSpec::new("flood").intent(
            TrafficIntent::new(0, flood())
                .expect(1, Expectation::MustArrive)
                .expect(0, Expectation::MustNotArrive),
        );
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Pass, "{}", outcome.message);
        assert_eq!(outcome.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_all_subchecks_reported_without_short_circuit() {
        let rig = rig();
        rig.switch.set_hairpin(true);
        let case = CaseSpec::new("flood-back")
            .intent(
                TrafficIntent::new(0, flood())
                    .expect(0, Expectation::MustNotArrive)
                    .expect(1, Expectation::MustArrive),
            )
            .intent(ProbeIntent::new("sonic1", "missing", OutputPredicate::contains("x")));

        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Fail);
        let statuses: Vec<Status> = outcome.checks.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![Status::Fail, Status::Pass, Status::Fail]);
        assert!(outcome.message.contains("unexpected frame on port 0"));
    }

    #[tokio::test]
    async fn test_invalid_case_is_error_before_any_transport_call() {
        let rig = rig();
        let case = CaseSpec::new("bad-ip")
            .intent(TrafficIntent::new(0, FrameSpec::new().ipv4("10.100.1", "10.0.0.1")).expect(1, Expectation::MustArrive))
            .teardown("sonic1", "cleanup");
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
        assert!(rig.commands.calls().is_empty());
    }

    #[test]
    fn test_validate_agreement_needs_two_probes() {
        let rig = rig();
        let lonely = CaseSpec::new("lonely").intent(AgreementIntent {
            name: None,
            probes: vec![ProbeCommand::new("sonic1", "ip route show | grep via | wc -l")],
            timeout_ms: None,
        });
        let err = validate(&lonely, &rig.topology, &rig.defaults).unwrap_err();
        assert!(err.to_string().contains("at least two probes"));

        let unknown = CaseSpec::new("ghost").intent(ProbeIntent::new("sonic9", "true", OutputPredicate::default().with_exit_code(0)));
        assert_eq!(validate(&unknown, &rig.topology, &rig.defaults).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_stimulus_without_expectation_rejected() {
        let rig = rig();
        let case = CaseSpec::new("send-and-hope").intent(TrafficIntent::new(0, flood()));
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
        assert!(outcome.message.contains("no expectation"));
    }

    #[tokio::test]
    async fn test_unknown_port_rejected() {
        let rig = rig();
        let case = CaseSpec::new("port-9").intent(TrafficIntent::new(9, flood()).expect(1, Expectation::MustArrive));
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Validation));
    }

    #[tokio::test]
    async fn test_setup_failure_is_error_and_teardown_still_runs() {
        let rig = rig();
        rig.commands.reply("sonic1", "iptables -A INPUT -p tcp --dport 9999 -j DROP", ProbeOutput::failed(1, "permission denied"));
        let case = CaseSpec::new("acl-setup")
            .setup(SetupStep::Probe {
                endpoint: "sonic1".to_string(),
                command: "iptables -A INPUT -p tcp --dport 9999 -j DROP".to_string(),
                timeout_ms: None,
            })
            .intent(TrafficIntent::new(0, flood()).expect(1, Expectation::MustArrive))
            .teardown("sonic1", "iptables -F INPUT");

        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::SetupError));
        assert!(outcome.message.contains("permission denied"));
        assert_eq!(rig.commands.calls().last().unwrap().1, "iptables -F INPUT");
    }

    #[tokio::test]
    async fn test_learning_then_unicast() {
        let rig = rig();
        let case = CaseSpec::new("unicast")
            .setup(SetupStep::Inject {
                port: PortId::new(1),
                frame: FrameSpec::new().eth("00:aa:bb:cc:dd:02", "ff:ff:ff:ff:ff:ff").marker("LEARN"),
            })
            .setup(SetupStep::Settle { ms: 20 })
            .intent(
                TrafficIntent::new(0, FrameSpec::new().eth("00:aa:bb:cc:dd:01", "00:aa:bb:cc:dd:02").marker("UNICAST_TEST"))
                    .expect(1, Expectation::MustArrive),
            );

        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Pass, "{}", outcome.message);
        assert_eq!(
            rig.switch.learned_port("00:aa:bb:cc:dd:02".parse().unwrap()),
            Some(PortId::new(1))
        );
    }

    #[tokio::test]
    async fn test_priming_frames_are_flushed_before_stimulus() {
        let rig = rig();
        let mut stimulus = TrafficIntent::new(0, FrameSpec::new().marker("STIMULUS")).expect(1, Expectation::MustArrive);
        stimulus.expect.push(PortExpectation {
            port: PortId::new(1),
            expectation: Expectation::MustNotArrive,
            frame: Some(FrameSpec::new().marker("PRIMING")),
        });
        let case = CaseSpec::new("primed")
            .setup(SetupStep::Inject {
                port: PortId::new(0),
                frame: FrameSpec::new().marker("PRIMING"),
            })
            .intent(stimulus);

        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Pass, "{}", outcome.message);
        assert_eq!(outcome.checks.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_error_not_fail() {
        let rig = rig();
        rig.commands.hang("sonic1", "ping -c 3 -W 2 10.0.0.2");
        let case = CaseSpec::new("hung-ping").intent(
            ProbeIntent::new("sonic1", "ping -c 3 -W 2 10.0.0.2", OutputPredicate::contains(" 0% packet loss"))
                .timeout_ms(50),
        );

        let start = Instant::now();
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Timeout));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_must_arrive_resolves_early() {
        let rig = rig();
        let case = CaseSpec::new("early").intent(
            TrafficIntent::new(0, flood()).expect(1, Expectation::MustArrive).window_ms(5_000),
        );
        let start = Instant::now();
        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Pass);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_acl_toggle_changes_outcome_without_cached_state() {
        let rig = rig();
        let blocked = FrameSpec::new()
            .eth("00:11:22:33:44:55", "ff:ff:ff:ff:ff:ff")
            .ipv4("10.100.1.10", "10.100.1.1")
            .tcp(12345, 9999)
            .marker("ACL_DENY_TEST");
        let denied = CaseSpec::new("deny").intent(TrafficIntent::new(0, blocked.clone()).expect(1, Expectation::MustNotArrive));
        let allowed = CaseSpec::new("allow").intent(TrafficIntent::new(0, blocked).expect(1, Expectation::MustArrive));

        rig.switch.deny(AclRule::tcp(9999));
        assert_eq!(rig.run(&denied).await.status, Status::Pass);

        rig.switch.clear_acl();
        assert_eq!(rig.run(&allowed).await.status, Status::Pass);
        assert_eq!(rig.run(&denied).await.status, Status::Fail);
    }

    #[tokio::test]
    async fn test_send_failure_becomes_io_error_subresult() {
        let rig = rig();
        let switch_without_port_1 = Arc::new(SimSwitch::new([1]));
        let engine = CaseEngine::new(
            PortAdapter::new(switch_without_port_1).with_poll_interval(Duration::from_millis(10)),
            ProbeAdapter::new(rig.commands.clone()),
        );
        rig.commands.reply("sonic1", "echo ok", ProbeOutput::ok("ok"));
        let case = CaseSpec::new("io")
            .intent(TrafficIntent::new(0, flood()).expect(1, Expectation::MustArrive))
            .intent(ProbeIntent::new("sonic1", "echo ok", OutputPredicate::contains("ok")));

        let outcome = engine.run(&rig.topology, &case, &rig.defaults).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.checks[0].error_kind, Some(ErrorKind::IoError));
        assert_eq!(outcome.checks[1].status, Status::Pass);
    }

    /// Dataplane and command transport sharing one call log
    #[derive(Default)]
    struct Recorder {
        log: parking_lot::Mutex<Vec<String>>,
        capture_fails: bool,
    }

    #[async_trait::async_trait]
    impl crate::dataplane::DataplaneTransport for Recorder {
        async fn send(&self, port: PortId, _frame: Bytes) -> std::io::Result<()> {
            self.log.lock().push(format!("send {}", port));
            Ok(())
        }

        async fn flush(&self) -> std::io::Result<()> {
            Ok(())
        }

        async fn recv_all(
            &self,
            window: Duration,
        ) -> std::io::Result<std::collections::HashMap<PortId, Vec<Bytes>>> {
            if self.capture_fails {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "capture socket closed"));
            }
            tokio::time::sleep(window).await;
            Ok(Default::default())
        }
    }

    #[async_trait::async_trait]
    impl crate::probe::CommandTransport for Recorder {
        async fn exec(&self, _endpoint: &str, command: &str, _timeout: Duration) -> Result<ProbeOutput, ProbeError> {
            self.log.lock().push(format!("exec {}", command));
            Ok(ProbeOutput::ok("ok"))
        }
    }

    fn recording_engine(recorder: &Arc<Recorder>) -> CaseEngine {
        CaseEngine::new(
            PortAdapter::new(recorder.clone()).with_poll_interval(Duration::from_millis(10)),
            ProbeAdapter::new(recorder.clone()),
        )
    }

    #[tokio::test]
    async fn test_intents_issued_in_declaration_order() {
        let rig = rig();
        let recorder = Arc::new(Recorder::default());
        let case = CaseSpec::new("ordered")
            .intent(ProbeIntent::new("sonic1", "first", OutputPredicate::contains("ok")))
            .intent(TrafficIntent::new(0, flood()).expect(1, Expectation::MustNotArrive))
            .intent(ProbeIntent::new("sonic2", "last", OutputPredicate::contains("ok")));

        let outcome = recording_engine(&recorder).run(&rig.topology, &case, &rig.defaults).await;
        assert_eq!(outcome.status, Status::Pass);
        assert_eq!(*recorder.log.lock(), vec!["exec first", "send 0", "exec last"]);
    }

    #[tokio::test]
    async fn test_capture_failure_becomes_io_error_subresult() {
        let rig = rig();
        let recorder = Arc::new(Recorder { capture_fails: true, ..Default::default() });
        let case = CaseSpec::new("capture")
            .intent(
                TrafficIntent::new(0, flood())
                    .expect(1, Expectation::MustArrive)
                    .expect(0, Expectation::MustNotArrive),
            )
            .intent(ProbeIntent::new("sonic1", "echo ok", OutputPredicate::contains("ok")));

        let outcome = recording_engine(&recorder).run(&rig.topology, &case, &rig.defaults).await;
        assert_eq!(outcome.status, Status::Error);
        assert_eq!(outcome.checks.len(), 3);
        for check in &outcome.checks[..2] {
            assert_eq!(check.status, Status::Error);
            assert_eq!(check.error_kind, Some(ErrorKind::IoError));
            assert!(check.detail.contains("capture failed"));
        }
        assert_eq!(outcome.checks[2].status, Status::Pass);
    }

    #[tokio::test]
    async fn test_agreement_intent() {
        let rig = rig();
        let cmd = "ip route show | grep via | wc -l";
        rig.commands.reply("sonic1", cmd, ProbeOutput::ok("1"));
        rig.commands.reply("sonic2", cmd, ProbeOutput::ok("2"));
        let case = CaseSpec::new("symmetry").intent(AgreementIntent {
            name: Some("route_symmetry".to_string()),
            probes: vec![ProbeCommand::new("sonic1", cmd), ProbeCommand::new("sonic2", cmd)],
            timeout_ms: None,
        });

        let outcome = rig.run(&case).await;
        assert_eq!(outcome.status, Status::Fail);
        assert!(outcome.message.contains("sonic1=1, sonic2=2"));
    }
}
