//! Frame specifications
//!
//! A [`FrameSpec`] is the declarative, serde-friendly description of a
//! header stack plus a payload marker. It is used two ways:
//!
//! - compiled and built into an injectable byte sequence
//!   ([`build_frame`]), which is pure and deterministic;
//! - compiled into a match predicate for captured frames ([`matches`]),
//!   where every field left unset is a wildcard.
//!
//! Compilation ([`FrameSpec::compile`]) is where validation happens, so a
//! malformed spec is rejected before any transport is involved.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use internet_checksum::Checksum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::types::MacAddr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// IEEE 802 local experimental ethertype, used for marker-only frames
pub const ETHERTYPE_EXPERIMENTAL: u16 = 0x88b5;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
/// RFC 3692 experimentation protocol, used when no transport header is set
pub const IPPROTO_EXPERIMENTAL: u8 = 253;

/// Minimum Ethernet frame length without FCS
pub const ETH_MIN_LEN: usize = 60;
/// Largest frame (jumbo, without FCS) a spec may build or a capture may hold
pub const ETH_MAX_LEN: usize = 9216;

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const IPV4_HDR_LEN: usize = 20;
const TCP_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;
const ICMP_HDR_LEN: usize = 8;

const DEFAULT_TTL: u8 = 64;
const TCP_FLAG_SYN: u8 = 0x02;
const ICMP_ECHO_REQUEST: u8 = 8;

// ===== declarative spec =====

/// Link-layer header fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EthernetSpec {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub ethertype: Option<i64>,
}

/// Network-layer header fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Ipv4Spec {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    #[serde(default)]
    pub ttl: Option<i64>,
    #[serde(default)]
    pub protocol: Option<i64>,
}

/// Transport-layer header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "proto", rename_all = "lowercase")]
pub enum TransportSpec {
    Tcp {
        #[serde(default)]
        sport: Option<i64>,
        #[serde(default)]
        dport: Option<i64>,
        #[serde(default)]
        flags: Option<i64>,
    },
    Udp {
        #[serde(default)]
        sport: Option<i64>,
        #[serde(default)]
        dport: Option<i64>,
    },
    Icmp {
        #[serde(default, rename = "type")]
        icmp_type: Option<i64>,
        #[serde(default)]
        code: Option<i64>,
    },
}

/// Semantic description of a frame: header stack plus payload marker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameSpec {
    #[serde(default)]
    pub eth: Option<EthernetSpec>,

    /// 802.1Q VLAN id
    #[serde(default)]
    pub vlan: Option<i64>,

    #[serde(default)]
    pub ipv4: Option<Ipv4Spec>,

    #[serde(default)]
    pub l4: Option<TransportSpec>,

    /// Opaque payload tag carried as the frame body
    #[serde(default)]
    pub marker: Option<String>,
}

impl FrameSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eth(mut self, src: &str, dst: &str) -> Self {
        let eth = self.eth.get_or_insert_with(EthernetSpec::default);
        eth.src = Some(src.to_string());
        eth.dst = Some(dst.to_string());
        self
    }

    pub fn eth_dst(mut self, dst: &str) -> Self {
        self.eth.get_or_insert_with(EthernetSpec::default).dst = Some(dst.to_string());
        self
    }

    pub fn vlan(mut self, vid: i64) -> Self {
        self.vlan = Some(vid);
        self
    }

    pub fn ipv4(mut self, src: &str, dst: &str) -> Self {
        let ip = self.ipv4.get_or_insert_with(Ipv4Spec::default);
        ip.src = Some(src.to_string());
        ip.dst = Some(dst.to_string());
        self
    }

    pub fn tcp(mut self, sport: i64, dport: i64) -> Self {
        self.l4 = Some(TransportSpec::Tcp { sport: Some(sport), dport: Some(dport), flags: None });
        self
    }

    pub fn tcp_dport(mut self, dport: i64) -> Self {
        self.l4 = Some(TransportSpec::Tcp { sport: None, dport: Some(dport), flags: None });
        self
    }

    pub fn udp(mut self, sport: i64, dport: i64) -> Self {
        self.l4 = Some(TransportSpec::Udp { sport: Some(sport), dport: Some(dport) });
        self
    }

    pub fn icmp(mut self, icmp_type: i64, code: i64) -> Self {
        self.l4 = Some(TransportSpec::Icmp { icmp_type: Some(icmp_type), code: Some(code) });
        self
    }

    pub fn marker(mut self, marker: &str) -> Self {
        self.marker = Some(marker.to_string());
        self
    }

    /// Validate the spec and turn it into a typed [`FramePattern`]
    pub fn compile(&self) -> Result<FramePattern> {
        let mut pattern = FramePattern::default();

        if let Some(eth) = &self.eth {
            pattern.eth_src = eth.src.as_deref().map(str::parse::<MacAddr>).transpose()?;
            pattern.eth_dst = eth.dst.as_deref().map(str::parse::<MacAddr>).transpose()?;
            pattern.ethertype = eth.ethertype.map(|v| ranged("ethertype", v, 0xffff)).transpose()?;
        }

        pattern.vlan = self.vlan.map(|v| ranged("vlan", v, 4095)).transpose()?;

        if let Some(ip) = &self.ipv4 {
            pattern.ipv4 = true;
            pattern.ip_src = ip.src.as_deref().map(parse_ipv4).transpose()?;
            pattern.ip_dst = ip.dst.as_deref().map(parse_ipv4).transpose()?;
            pattern.ttl = ip.ttl.map(|v| ranged("ttl", v, 255)).transpose()?;
            pattern.ip_proto = ip.protocol.map(|v| ranged("protocol", v, 255)).transpose()?;

            if let Some(ethertype) = pattern.ethertype {
                if ethertype != ETHERTYPE_IPV4 {
                    return Err(Error::InvalidFrame(format!(
                        "ethertype {:#06x} conflicts with ipv4 header",
                        ethertype
                    )));
                }
            }
        }

        if let Some(l4) = &self.l4 {
            if self.ipv4.is_none() {
                return Err(Error::InvalidFrame(
                    "transport header requires an ipv4 header".to_string(),
                ));
            }
            let l4 = L4Pattern::compile(l4)?;
            if let Some(proto) = pattern.ip_proto {
                if proto != l4.protocol() {
                    return Err(Error::InvalidFrame(format!(
                        "ipv4 protocol {} conflicts with {} header",
                        proto,
                        l4.name()
                    )));
                }
            }
            pattern.l4 = Some(l4);
        }

        pattern.marker = self.marker.as_ref().map(|m| m.as_bytes().to_vec());

        let len = pattern.wire_len();
        if len > ETH_MAX_LEN {
            return Err(Error::InvalidFrame(format!(
                "frame of {} bytes exceeds the {} byte maximum",
                len, ETH_MAX_LEN
            )));
        }
        Ok(pattern)
    }
}

fn ranged<T: TryFrom<i64>>(field: &'static str, value: i64, max: i64) -> Result<T> {
    if !(0..=max).contains(&value) {
        return Err(Error::out_of_range(field, value, max));
    }
    T::try_from(value).map_err(|_| Error::out_of_range(field, value, max))
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    s.parse().map_err(|_| Error::InvalidIpv4(s.to_string()))
}

// ===== compiled pattern =====

#[derive(Debug, Clone, PartialEq, Eq)]
enum L4Pattern {
    Tcp { sport: Option<u16>, dport: Option<u16>, flags: Option<u8> },
    Udp { sport: Option<u16>, dport: Option<u16> },
    Icmp { icmp_type: Option<u8>, code: Option<u8> },
}

impl L4Pattern {
    fn compile(spec: &TransportSpec) -> Result<Self> {
        let port = |field: &'static str, v: Option<i64>| -> Result<Option<u16>> {
            v.map(|v| ranged(field, v, 0xffff)).transpose()
        };
        Ok(match spec {
            TransportSpec::Tcp { sport, dport, flags } => L4Pattern::Tcp {
                sport: port("tcp sport", *sport)?,
                dport: port("tcp dport", *dport)?,
                flags: flags.map(|v| ranged("tcp flags", v, 0xff)).transpose()?,
            },
            TransportSpec::Udp { sport, dport } => L4Pattern::Udp {
                sport: port("udp sport", *sport)?,
                dport: port("udp dport", *dport)?,
            },
            TransportSpec::Icmp { icmp_type, code } => L4Pattern::Icmp {
                icmp_type: icmp_type.map(|v| ranged("icmp type", v, 0xff)).transpose()?,
                code: code.map(|v| ranged("icmp code", v, 0xff)).transpose()?,
            },
        })
    }

    fn protocol(&self) -> u8 {
        match self {
            L4Pattern::Tcp { .. } => IPPROTO_TCP,
            L4Pattern::Udp { .. } => IPPROTO_UDP,
            L4Pattern::Icmp { .. } => IPPROTO_ICMP,
        }
    }

    fn header_len(&self) -> usize {
        match self {
            L4Pattern::Tcp { .. } => TCP_HDR_LEN,
            L4Pattern::Udp { .. } => UDP_HDR_LEN,
            L4Pattern::Icmp { .. } => ICMP_HDR_LEN,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            L4Pattern::Tcp { .. } => "tcp",
            L4Pattern::Udp { .. } => "udp",
            L4Pattern::Icmp { .. } => "icmp",
        }
    }

    fn matches(&self, observed: &ParsedL4) -> bool {
        match (self, observed) {
            (L4Pattern::Tcp { sport, dport, flags }, ParsedL4::Tcp { sport: s, dport: d, flags: f }) => {
                field_eq(sport, s) && field_eq(dport, d) && field_eq(flags, f)
            }
            (L4Pattern::Udp { sport, dport }, ParsedL4::Udp { sport: s, dport: d }) => {
                field_eq(sport, s) && field_eq(dport, d)
            }
            (L4Pattern::Icmp { icmp_type, code }, ParsedL4::Icmp { icmp_type: t, code: c }) => {
                field_eq(icmp_type, t) && field_eq(code, c)
            }
            _ => false,
        }
    }
}

fn field_eq<T: PartialEq>(expected: &Option<T>, observed: &T) -> bool {
    expected.as_ref().map_or(true, |e| e == observed)
}

/// Validated header stack. Unset fields take deterministic defaults when
/// building and act as wildcards when matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramePattern {
    eth_src: Option<MacAddr>,
    eth_dst: Option<MacAddr>,
    ethertype: Option<u16>,
    vlan: Option<u16>,
    ipv4: bool,
    ip_src: Option<Ipv4Addr>,
    ip_dst: Option<Ipv4Addr>,
    ttl: Option<u8>,
    ip_proto: Option<u8>,
    l4: Option<L4Pattern>,
    marker: Option<Vec<u8>>,
}

impl FramePattern {
    /// Serialize into wire bytes, padded to the Ethernet minimum
    pub fn build(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        buf.put_slice(&self.eth_dst.unwrap_or(MacAddr::BROADCAST).octets());
        buf.put_slice(&self.eth_src.unwrap_or(MacAddr::ZERO).octets());
        if let Some(vid) = self.vlan {
            buf.put_u16(ETHERTYPE_VLAN);
            buf.put_u16(vid & 0x0fff);
        }

        let payload = self.marker.as_deref().unwrap_or_default();
        if self.ipv4 {
            buf.put_u16(self.ethertype.unwrap_or(ETHERTYPE_IPV4));
            self.put_ipv4(&mut buf, payload);
        } else {
            buf.put_u16(self.ethertype.unwrap_or(ETHERTYPE_EXPERIMENTAL));
            buf.put_slice(payload);
        }

        if buf.len() < ETH_MIN_LEN {
            buf.put_bytes(0, ETH_MIN_LEN - buf.len());
        }
        buf.freeze()
    }

    /// Built length before minimum-size padding
    fn wire_len(&self) -> usize {
        let mut len = ETH_HDR_LEN + self.marker.as_ref().map_or(0, Vec::len);
        if self.vlan.is_some() {
            len += VLAN_TAG_LEN;
        }
        if self.ipv4 {
            len += IPV4_HDR_LEN + self.l4.as_ref().map_or(0, L4Pattern::header_len);
        }
        len
    }

    fn put_ipv4(&self, buf: &mut BytesMut, payload: &[u8]) {
        let src = self.ip_src.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let dst = self.ip_dst.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let proto = self
            .ip_proto
            .or_else(|| self.l4.as_ref().map(L4Pattern::protocol))
            .unwrap_or(IPPROTO_EXPERIMENTAL);

        let segment = match &self.l4 {
            Some(l4) => encode_l4(l4, src, dst, payload),
            None => BytesMut::from(payload),
        };

        let start = buf.len();
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16((IPV4_HDR_LEN + segment.len()) as u16);
        buf.put_u16(1);
        buf.put_u16(0);
        buf.put_u8(self.ttl.unwrap_or(DEFAULT_TTL));
        buf.put_u8(proto);
        buf.put_u16(0);
        buf.put_slice(&src.octets());
        buf.put_slice(&dst.octets());

        let mut cksum = Checksum::new();
        cksum.add_bytes(&buf[start..]);
        buf[start + 10..start + 12].copy_from_slice(&cksum.checksum());

        buf.put_slice(&segment);
    }

    /// Whether a captured frame satisfies every field this pattern sets
    pub fn matches(&self, observed: &[u8]) -> bool {
        let Some(frame) = ParsedFrame::parse(observed) else {
            return false;
        };

        if !field_eq(&self.eth_src, &frame.src) || !field_eq(&self.eth_dst, &frame.dst) {
            return false;
        }
        if !field_eq(&self.ethertype, &frame.ethertype) {
            return false;
        }
        if self.vlan.is_some() && self.vlan != frame.vlan {
            return false;
        }

        if self.ipv4 {
            let Some(ip) = &frame.ipv4 else {
                return false;
            };
            if !field_eq(&self.ip_src, &ip.src)
                || !field_eq(&self.ip_dst, &ip.dst)
                || !field_eq(&self.ttl, &ip.ttl)
                || !field_eq(&self.ip_proto, &ip.protocol)
            {
                return false;
            }
        }

        if let Some(l4) = &self.l4 {
            match &frame.l4 {
                Some(observed) if l4.matches(observed) => {}
                _ => return false,
            }
        }

        match &self.marker {
            Some(marker) => frame.payload == marker.as_slice(),
            None => true,
        }
    }
}

fn encode_l4(l4: &L4Pattern, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> BytesMut {
    let mut seg = BytesMut::with_capacity(TCP_HDR_LEN + payload.len());
    let cksum_at = match l4 {
        L4Pattern::Tcp { sport, dport, flags } => {
            seg.put_u16(sport.unwrap_or(20));
            seg.put_u16(dport.unwrap_or(80));
            seg.put_u32(0);
            seg.put_u32(0);
            seg.put_u8(((TCP_HDR_LEN / 4) as u8) << 4);
            seg.put_u8(flags.unwrap_or(TCP_FLAG_SYN));
            seg.put_u16(8192);
            seg.put_u16(0);
            seg.put_u16(0);
            16
        }
        L4Pattern::Udp { sport, dport } => {
            seg.put_u16(sport.unwrap_or(53));
            seg.put_u16(dport.unwrap_or(53));
            seg.put_u16((UDP_HDR_LEN + payload.len()) as u16);
            seg.put_u16(0);
            6
        }
        L4Pattern::Icmp { icmp_type, code } => {
            seg.put_u8(icmp_type.unwrap_or(ICMP_ECHO_REQUEST));
            seg.put_u8(code.unwrap_or(0));
            seg.put_u16(0);
            seg.put_u32(0);
            2
        }
    };
    seg.put_slice(payload);

    let mut cksum = Checksum::new();
    if !matches!(l4, L4Pattern::Icmp { .. }) {
        // Pseudo-header
        cksum.add_bytes(&src.octets());
        cksum.add_bytes(&dst.octets());
        cksum.add_bytes(&[0, l4.protocol()]);
        cksum.add_bytes(&(seg.len() as u16).to_be_bytes());
    }
    cksum.add_bytes(&seg);
    seg[cksum_at..cksum_at + 2].copy_from_slice(&cksum.checksum());
    seg
}

// ===== parsing =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedIpv4 {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub protocol: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedL4 {
    Tcp { sport: u16, dport: u16, flags: u8 },
    Udp { sport: u16, dport: u16 },
    Icmp { icmp_type: u8, code: u8 },
}

/// Lenient decode of a captured frame. Layers that cannot be decoded are
/// left as `None` rather than failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vlan: Option<u16>,
    pub ethertype: u16,
    pub ipv4: Option<ParsedIpv4>,
    pub l4: Option<ParsedL4>,
    pub payload: &'a [u8],
}

impl<'a> ParsedFrame<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < ETH_HDR_LEN {
            return None;
        }

        let mut buf = data;
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        buf.copy_to_slice(&mut dst);
        buf.copy_to_slice(&mut src);
        let mut ethertype = buf.get_u16();

        let mut vlan = None;
        if ethertype == ETHERTYPE_VLAN {
            if buf.remaining() < VLAN_TAG_LEN {
                return None;
            }
            vlan = Some(buf.get_u16() & 0x0fff);
            ethertype = buf.get_u16();
        }

        let mut frame = ParsedFrame {
            dst: MacAddr(dst),
            src: MacAddr(src),
            vlan,
            ethertype,
            ipv4: None,
            l4: None,
            payload: trim_padding(buf),
        };

        if ethertype == ETHERTYPE_IPV4 {
            frame.decode_ipv4(buf);
        }
        Some(frame)
    }

    fn decode_ipv4(&mut self, data: &'a [u8]) {
        if data.len() < IPV4_HDR_LEN || data[0] >> 4 != 4 {
            return;
        }
        let ihl = (data[0] & 0x0f) as usize * 4;
        let total_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if ihl < IPV4_HDR_LEN || total_len < ihl || data.len() < ihl {
            return;
        }

        let ip = ParsedIpv4 {
            ttl: data[8],
            protocol: data[9],
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };
        self.ipv4 = Some(ip);

        let segment = &data[ihl..total_len.min(data.len())];
        let (l4, hdr_len) = match ip.protocol {
            IPPROTO_TCP if segment.len() >= TCP_HDR_LEN => {
                let offset = (segment[12] >> 4) as usize * 4;
                let l4 = ParsedL4::Tcp {
                    sport: u16::from_be_bytes([segment[0], segment[1]]),
                    dport: u16::from_be_bytes([segment[2], segment[3]]),
                    flags: segment[13],
                };
                (Some(l4), offset.clamp(TCP_HDR_LEN, segment.len()))
            }
            IPPROTO_UDP if segment.len() >= UDP_HDR_LEN => {
                let l4 = ParsedL4::Udp {
                    sport: u16::from_be_bytes([segment[0], segment[1]]),
                    dport: u16::from_be_bytes([segment[2], segment[3]]),
                };
                (Some(l4), UDP_HDR_LEN)
            }
            IPPROTO_ICMP if segment.len() >= ICMP_HDR_LEN => {
                let l4 = ParsedL4::Icmp { icmp_type: segment[0], code: segment[1] };
                (Some(l4), ICMP_HDR_LEN)
            }
            _ => (None, 0),
        };
        self.l4 = l4;
        self.payload = &segment[hdr_len..];
    }
}

fn trim_padding(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

impl fmt::Display for ParsedFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {}", self.src, self.dst)?;
        if let Some(vid) = self.vlan {
            write!(f, " vlan {}", vid)?;
        }
        match &self.ipv4 {
            Some(ip) => write!(f, " ipv4 {} > {} ttl {}", ip.src, ip.dst, ip.ttl)?,
            None => write!(f, " type {:#06x}", self.ethertype)?,
        }
        match self.l4 {
            Some(ParsedL4::Tcp { sport, dport, .. }) => write!(f, " tcp {} > {}", sport, dport)?,
            Some(ParsedL4::Udp { sport, dport }) => write!(f, " udp {} > {}", sport, dport)?,
            Some(ParsedL4::Icmp { icmp_type, code }) => write!(f, " icmp {}/{}", icmp_type, code)?,
            None => {}
        }
        match std::str::from_utf8(self.payload) {
            Ok(text) if !text.is_empty() => write!(f, " payload {:?}", text),
            Ok(_) => Ok(()),
            Err(_) => write!(f, " payload 0x{}", hex::encode(self.payload)),
        }
    }
}

/// One-line description of captured bytes for failure messages
pub fn describe(data: &[u8]) -> String {
    match ParsedFrame::parse(data) {
        Some(frame) => frame.to_string(),
        None => format!("runt frame 0x{}", hex::encode(data)),
    }
}

// ===== entry points =====

/// Build the wire bytes for a spec. Identical specs yield identical bytes.
pub fn build_frame(spec: &FrameSpec) -> Result<Bytes> {
    Ok(spec.compile()?.build())
}

/// Whether `observed` satisfies every field `spec` sets
pub fn matches(observed: &[u8], spec: &FrameSpec) -> Result<bool> {
    Ok(spec.compile()?.matches(observed))
}
