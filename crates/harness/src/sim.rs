//! In-process target for tests and `--simulate` runs
//!
//! [`SimSwitch`] behaves like a single learning bridge: it floods
//! broadcast and unknown-unicast frames to every port except the ingress,
//! learns source MACs, and drops frames matching ACL deny rules.
//! [`ScriptedCommands`] answers probe commands from a reply table.

use async_trait::async_trait;
use bytes::Bytes;
use netcheck_common::frame::{ParsedL4, IPPROTO_TCP, IPPROTO_UDP};
use netcheck_common::{MacAddr, ParsedFrame, PortId, Topology};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::dataplane::{CaptureQueue, DataplaneTransport};
use crate::error::ProbeError;
use crate::probe::{CommandTransport, ProbeOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclProtocol {
    Tcp,
    Udp,
}

impl AclProtocol {
    fn number(self) -> u8 {
        match self {
            AclProtocol::Tcp => IPPROTO_TCP,
            AclProtocol::Udp => IPPROTO_UDP,
        }
    }
}

/// Drop rule: transport protocol plus destination port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclRule {
    pub protocol: AclProtocol,
    pub dport: u16,
}

impl AclRule {
    pub fn tcp(dport: u16) -> Self {
        Self { protocol: AclProtocol::Tcp, dport }
    }

    pub fn udp(dport: u16) -> Self {
        Self { protocol: AclProtocol::Udp, dport }
    }

    fn blocks(&self, frame: &ParsedFrame<'_>) -> bool {
        let Some(ip) = frame.ipv4 else {
            return false;
        };
        if ip.protocol != self.protocol.number() {
            return false;
        }
        match frame.l4 {
            Some(ParsedL4::Tcp { dport, .. }) | Some(ParsedL4::Udp { dport, .. }) => dport == self.dport,
            _ => false,
        }
    }
}

#[derive(Default)]
struct SwitchState {
    fdb: HashMap<MacAddr, PortId>,
    acl: Vec<AclRule>,
    hairpin: bool,
    dropped: u64,
}

/// Simulated learning bridge implementing [`DataplaneTransport`]
pub struct SimSwitch {
    ports: BTreeSet<PortId>,
    state: Mutex<SwitchState>,
    rx: CaptureQueue,
}

impl SimSwitch {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().map(PortId::new).collect(),
            state: Mutex::new(SwitchState::default()),
            rx: CaptureQueue::new(),
        }
    }

    /// One bridge port per dataplane port in the topology
    pub fn from_topology(topology: &Topology) -> Self {
        Self::new(topology.port_ids().into_iter().map(PortId::get))
    }

    pub fn deny(&self, rule: AclRule) {
        self.state.lock().acl.push(rule);
    }

    pub fn clear_acl(&self) {
        self.state.lock().acl.clear();
    }

    /// Reflect flooded frames back out of the ingress port (a forwarding defect)
    pub fn set_hairpin(&self, enabled: bool) {
        self.state.lock().hairpin = enabled;
    }

    pub fn learned_port(&self, mac: MacAddr) -> Option<PortId> {
        self.state.lock().fdb.get(&mac).copied()
    }

    pub fn forget_all(&self) {
        self.state.lock().fdb.clear();
    }

    /// Frames discarded by ACL rules so far
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn forward(&self, ingress: PortId, frame: Bytes) {
        let Some(parsed) = ParsedFrame::parse(&frame) else {
            trace!(%ingress, "runt frame discarded");
            return;
        };

        let mut state = self.state.lock();
        if !parsed.src.is_multicast() {
            state.fdb.insert(parsed.src, ingress);
        }

        if state.acl.iter().any(|rule| rule.blocks(&parsed)) {
            state.dropped += 1;
            debug!(%ingress, frame = %parsed, "dropped by acl");
            return;
        }

        let egress: Vec<PortId> = match state.fdb.get(&parsed.dst) {
            Some(port) if !parsed.dst.is_multicast() => {
                if *port == ingress {
                    Vec::new()
                } else {
                    vec![*port]
                }
            }
            _ => self
                .ports
                .iter()
                .copied()
                .filter(|p| *p != ingress || state.hairpin)
                .collect(),
        };
        drop(state);

        for port in egress {
            trace!(%ingress, egress = %port, "forwarding");
            self.rx.push(port, frame.clone());
        }
    }
}

#[async_trait]
impl DataplaneTransport for SimSwitch {
    async fn send(&self, port: PortId, frame: Bytes) -> io::Result<()> {
        if !self.ports.contains(&port) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("switch has no port {}", port),
            ));
        }
        self.forward(port, frame);
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        self.rx.clear();
        Ok(())
    }

    async fn recv_all(&self, window: Duration) -> io::Result<HashMap<PortId, Vec<Bytes>>> {
        tokio::time::sleep(window).await;
        Ok(self.rx.drain())
    }
}

/// Canned reply for a scripted command
#[derive(Debug, Clone)]
pub enum Reply {
    Output(ProbeOutput),
    /// Never answers
    Hang,
    /// Transport cannot reach the endpoint
    Unreachable,
}

/// Command transport answering from a reply table. Unknown commands exit
/// 127 like a shell would.
#[derive(Default)]
pub struct ScriptedCommands {
    replies: Mutex<HashMap<(String, String), Reply>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, endpoint: &str, command: &str, output: ProbeOutput) {
        self.set(endpoint, command, Reply::Output(output));
    }

    pub fn hang(&self, endpoint: &str, command: &str) {
        self.set(endpoint, command, Reply::Hang);
    }

    pub fn unreachable(&self, endpoint: &str, command: &str) {
        self.set(endpoint, command, Reply::Unreachable);
    }

    fn set(&self, endpoint: &str, command: &str, reply: Reply) {
        self.replies
            .lock()
            .insert((endpoint.to_string(), command.to_string()), reply);
    }

    /// Every `(endpoint, command)` executed, in order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandTransport for ScriptedCommands {
    async fn exec(&self, endpoint: &str, command: &str, _timeout: Duration) -> Result<ProbeOutput, ProbeError> {
        self.calls.lock().push((endpoint.to_string(), command.to_string()));
        let reply = self
            .replies
            .lock()
            .get(&(endpoint.to_string(), command.to_string()))
            .cloned();

        match reply {
            Some(Reply::Output(output)) => Ok(output),
            Some(Reply::Hang) => futures::future::pending().await,
            Some(Reply::Unreachable) => Err(ProbeError::ConnectError {
                endpoint: endpoint.to_string(),
                reason: "endpoint unreachable".to_string(),
            }),
            None => Ok(ProbeOutput::failed(127, &format!("sh: {}: not found", command))),
        }
    }
}

/// Scripted reply entry in a suite's `simulation` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedReply {
    pub endpoint: String,
    pub command: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Target behavior for `--simulate` runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationSpec {
    #[serde(default)]
    pub acl_deny: Vec<AclRule>,

    #[serde(default)]
    pub replies: Vec<ScriptedReply>,
}

impl SimulationSpec {
    pub fn build(&self, topology: &Topology) -> (Arc<SimSwitch>, Arc<ScriptedCommands>) {
        let switch = SimSwitch::from_topology(topology);
        for rule in &self.acl_deny {
            switch.deny(*rule);
        }

        let commands = ScriptedCommands::new();
        for r in &self.replies {
            commands.reply(
                &r.endpoint,
                &r.command,
                ProbeOutput {
                    exit_code: r.exit_code,
                    stdout: r.stdout.clone(),
                    stderr: r.stderr.clone(),
                },
            );
        }
        (Arc::new(switch), Arc::new(commands))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcheck_common::{build_frame, FrameSpec};

    fn delivered(switch: &SimSwitch) -> HashMap<PortId, Vec<Bytes>> {
        switch.rx.drain()
    }

    #[tokio::test]
    async fn test_broadcast_floods_except_ingress() {
        let switch = SimSwitch::new([0, 1, 2]);
        let frame = build_frame(&FrameSpec::new().eth("00:11:22:33:44:55", "ff:ff:ff:ff:ff:ff")).unwrap();
        switch.send(PortId::new(0), frame).await.unwrap();

        let out = delivered(&switch);
        assert!(!out.contains_key(&PortId::new(0)));
        assert_eq!(out[&PortId::new(1)].len(), 1);
        assert_eq!(out[&PortId::new(2)].len(), 1);
        assert_eq!(switch.learned_port("00:11:22:33:44:55".parse().unwrap()), Some(PortId::new(0)));
    }

    #[tokio::test]
    async fn test_learned_unicast_is_not_flooded() {
        let switch = SimSwitch::new([0, 1, 2]);
        let learn = build_frame(&FrameSpec::new().eth("00:aa:bb:cc:dd:02", "ff:ff:ff:ff:ff:ff")).unwrap();
        switch.send(PortId::new(1), learn).await.unwrap();
        switch.flush().await.unwrap();

        let unicast = build_frame(&FrameSpec::new().eth("00:aa:bb:cc:dd:01", "00:aa:bb:cc:dd:02")).unwrap();
        switch.send(PortId::new(0), unicast).await.unwrap();

        let out = delivered(&switch);
        assert_eq!(out.len(), 1);
        assert_eq!(out[&PortId::new(1)].len(), 1);
    }

    #[tokio::test]
    async fn test_acl_drops_matching_transport_port() {
        let switch = SimSwitch::new([0, 1]);
        switch.deny(AclRule::tcp(9999));

        let base = FrameSpec::new()
            .eth("00:11:22:33:44:55", "ff:ff:ff:ff:ff:ff")
            .ipv4("10.100.1.10", "10.100.1.1");
        switch.send(PortId::new(0), build_frame(&base.clone().tcp(12345, 9999)).unwrap()).await.unwrap();
        switch.send(PortId::new(0), build_frame(&base.clone().udp(5000, 9999)).unwrap()).await.unwrap();
        switch.send(PortId::new(0), build_frame(&base.tcp(12345, 80)).unwrap()).await.unwrap();

        assert_eq!(switch.dropped(), 1);
        assert_eq!(delivered(&switch)[&PortId::new(1)].len(), 2);
    }

    #[tokio::test]
    async fn test_hairpin_reflects_to_ingress() {
        let switch = SimSwitch::new([0, 1]);
        switch.set_hairpin(true);
        let frame = build_frame(&FrameSpec::new().marker("LOOP")).unwrap();
        switch.send(PortId::new(0), frame).await.unwrap();
        assert!(delivered(&switch).contains_key(&PortId::new(0)));
    }

    #[tokio::test]
    async fn test_send_on_unknown_port_fails() {
        let switch = SimSwitch::new([0]);
        let err = switch.send(PortId::new(7), Bytes::from_static(&[0; 60])).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_scripted_unknown_command_exits_127() {
        let commands = ScriptedCommands::new();
        let out = commands.exec("sonic1", "ip route show", Duration::from_secs(1)).await.unwrap();
        assert_eq!(out.exit_code, 127);
        assert_eq!(commands.calls(), vec![("sonic1".to_string(), "ip route show".to_string())]);
    }

    #[test]
    fn test_simulation_spec_from_yaml() {
        let yaml = r#"
acl_deny:
  - { protocol: tcp, dport: 9999 }
replies:
  - { endpoint: sonic1, command: "ip route show | grep via | wc -l", stdout: "1" }
"#;
        let sim: SimulationSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(sim.acl_deny, vec![AclRule::tcp(9999)]);
        assert_eq!(sim.replies[0].exit_code, 0);
    }
}
