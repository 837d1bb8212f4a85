//! Core types for netcheck

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Dataplane port number, as seen by the injection/capture transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct PortId(u16);

impl PortId {
    pub const fn new(port: u16) -> Self {
        Self(port)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<i64> for PortId {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        u16::try_from(value)
            .map(PortId)
            .map_err(|_| Error::out_of_range("port", value, u16::MAX as i64))
    }
}

impl From<PortId> for i64 {
    fn from(port: PortId) -> Self {
        port.0 as i64
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a probe target (container name, hostname, ...)
pub type EndpointId = String;

/// 48-bit IEEE MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// Group bit set (broadcast included)
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(Error::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(Error::InvalidMac(s.to_string()));
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidMac(s.to_string()))?;
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

/// Binding of a dataplane port to the host interface that carries it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub id: PortId,

    /// Interface name on the test host (e.g. `eth1`), used by raw transports
    #[serde(default)]
    pub interface: Option<String>,
}

/// Reachability check run against a node before any case executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Endpoint the command runs against; defaults to the node's first endpoint
    #[serde(default)]
    pub endpoint: Option<EndpointId>,

    pub command: String,

    /// Trimmed stdout must equal this value when set
    #[serde(default)]
    pub expect: Option<String>,
}

/// A named element of the lab (switch or test host)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,

    #[serde(default)]
    pub ports: Vec<PortBinding>,

    #[serde(default)]
    pub endpoints: Vec<EndpointId>,

    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            endpoints: Vec::new(),
            health_check: None,
        }
    }

    pub fn with_port(mut self, id: u16, interface: Option<&str>) -> Self {
        self.ports.push(PortBinding {
            id: PortId::new(id),
            interface: interface.map(str::to_string),
        });
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<EndpointId>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    /// Endpoint a health check should target
    pub fn health_endpoint(&self) -> Option<&str> {
        self.health_check
            .as_ref()
            .and_then(|c| c.endpoint.as_deref())
            .or_else(|| self.endpoints.first().map(String::as_str))
    }
}

#[derive(Deserialize)]
struct RawTopology {
    #[serde(default)]
    nodes: Vec<Node>,
}

/// The lab under test. Immutable once constructed and shared read-only
/// by every case of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology")]
pub struct Topology {
    nodes: Vec<Node>,
}

impl TryFrom<RawTopology> for Topology {
    type Error = Error;

    fn try_from(raw: RawTopology) -> Result<Self> {
        Topology::new(raw.nodes)
    }
}

impl Topology {
    /// Build a topology, rejecting duplicate node names, ports and endpoints
    pub fn new(nodes: Vec<Node>) -> Result<Self> {
        let mut names = BTreeSet::new();
        let mut ports = BTreeSet::new();
        let mut endpoints = BTreeSet::new();

        for node in &nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::Duplicate { kind: "node", id: node.name.clone() });
            }
            for port in &node.ports {
                if !ports.insert(port.id) {
                    return Err(Error::Duplicate { kind: "port", id: port.id.to_string() });
                }
            }
            for endpoint in &node.endpoints {
                if !endpoints.insert(endpoint.as_str()) {
                    return Err(Error::Duplicate { kind: "endpoint", id: endpoint.clone() });
                }
            }
            if node.health_check.is_some() && node.health_endpoint().is_none() {
                return Err(Error::InvalidConfig(format!(
                    "node {} has a health check but no endpoint",
                    node.name
                )));
            }
        }

        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// All dataplane ports, in ascending order
    pub fn port_ids(&self) -> Vec<PortId> {
        let set: BTreeSet<PortId> = self
            .nodes
            .iter()
            .flat_map(|n| n.ports.iter().map(|p| p.id))
            .collect();
        set.into_iter().collect()
    }

    pub fn has_port(&self, port: PortId) -> bool {
        self.nodes.iter().any(|n| n.ports.iter().any(|p| p.id == port))
    }

    pub fn has_endpoint(&self, endpoint: &str) -> bool {
        self.nodes.iter().any(|n| n.endpoints.iter().any(|e| e == endpoint))
    }

    pub fn interface_for(&self, port: PortId) -> Option<&str> {
        self.nodes
            .iter()
            .flat_map(|n| n.ports.iter())
            .find(|p| p.id == port)
            .and_then(|p| p.interface.as_deref())
    }

    pub fn check_port(&self, port: PortId) -> Result<()> {
        if self.has_port(port) {
            Ok(())
        } else {
            Err(Error::UnknownPort(port.get() as i64))
        }
    }

    pub fn check_endpoint(&self, endpoint: &str) -> Result<()> {
        if self.has_endpoint(endpoint) {
            Ok(())
        } else {
            Err(Error::UnknownEndpoint(endpoint.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab() -> Topology {
        Topology::new(vec![
            Node::new("ptfhost")
                .with_port(0, Some("eth1"))
                .with_port(1, Some("eth2"))
                .with_endpoint("clab-sonic-lab-ptfhost"),
            Node::new("sonic1").with_endpoint("clab-sonic-lab-sonic1"),
        ])
        .unwrap()
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "00:AA:bb:cc:dd:01".parse().unwrap();
        assert_eq!(mac.to_string(), "00:aa:bb:cc:dd:01");
        assert!(!mac.is_multicast());
        assert!("ff-ff-ff-ff-ff-ff".parse::<MacAddr>().unwrap().is_broadcast());
    }

    #[test]
    fn test_mac_rejects_garbage() {
        assert!("00:11:22:33:44".parse::<MacAddr>().is_err());
        assert!("00:11:22:33:44:zz".parse::<MacAddr>().is_err());
        assert!("0:11:22:33:44:55".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_negative_port_rejected() {
        assert!(matches!(PortId::try_from(-1), Err(Error::OutOfRange { .. })));
        assert_eq!(PortId::try_from(3).unwrap(), PortId::new(3));
    }

    #[test]
    fn test_topology_lookups() {
        let topo = lab();
        assert_eq!(topo.port_ids(), vec![PortId::new(0), PortId::new(1)]);
        assert_eq!(topo.interface_for(PortId::new(1)), Some("eth2"));
        assert!(topo.check_port(PortId::new(2)).is_err());
        assert!(topo.check_endpoint("clab-sonic-lab-sonic1").is_ok());
        assert!(topo.check_endpoint("clab-sonic-lab-sonic9").is_err());
    }

    #[test]
    fn test_topology_rejects_duplicates() {
        let err = Topology::new(vec![
            Node::new("a").with_port(0, None),
            Node::new("b").with_port(0, None),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Duplicate { kind: "port", .. }));
    }

    #[test]
    fn test_topology_from_yaml() {
        let yaml = r#"
nodes:
  - name: sonic1
    endpoints: [clab-sonic-lab-sonic1]
    health_check:
      command: "true"
  - name: ptfhost
    ports:
      - { id: 0, interface: eth1 }
      - { id: 1, interface: eth2 }
"#;
        let topo: Topology = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(topo.nodes().len(), 2);
        assert_eq!(
            topo.node("sonic1").unwrap().health_endpoint(),
            Some("clab-sonic-lab-sonic1")
        );
    }

    #[test]
    fn test_topology_yaml_negative_port_fails() {
        let yaml = "nodes:\n  - name: h\n    ports:\n      - { id: -1 }\n";
        assert!(serde_yaml::from_str::<Topology>(yaml).is_err());
    }
}
