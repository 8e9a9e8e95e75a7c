//! Connection model
//!
//! Defines the value types shared by both conntrack backends and the flow
//! tracker that consumes them.
//!
//! ## Organization
//!
//! - **Kernel Types**: record layouts shared with the tracing probe (from conntrack_common)
//! - **Flow Types**: `ConnectionTuple`, `ConnectionStats`, `IPTranslation`
//! - **Conntrack Types**: normalized conntrack entries and their lookup keys
//! - **Byte Keys**: fixed-width fingerprints of a connection

use crate::error::{ConntrackError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// Kernel Types (from the tracing probe)
// ============================================================================

pub mod kernel {
    //! Types shared between the kernel probe and userspace
    //!
    //! These are re-exported from the conntrack-common crate and must
    //! maintain binary compatibility with the probe.

    pub use conntrack_common::constants;
    pub use conntrack_common::types::{ConntrackEvent, ConntrackTuple};
}

use kernel::constants::{AF_INET, AF_INET6, IPPROTO_TCP, IPPROTO_UDP};

// ============================================================================
// Flow Types
// ============================================================================

/// Transport protocol of a connection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionType {
    #[default]
    Tcp = 0,
    Udp = 1,
}

impl ConnectionType {
    /// Map an IP protocol number; `None` for anything but TCP and UDP.
    pub fn from_ip_protocol(protocol: u8) -> Option<Self> {
        match protocol {
            IPPROTO_TCP => Some(Self::Tcp),
            IPPROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn ip_protocol(self) -> u8 {
        match self {
            Self::Tcp => IPPROTO_TCP,
            Self::Udp => IPPROTO_UDP,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Address family of a connection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnectionFamily {
    #[default]
    V4 = 0,
    V6 = 1,
}

impl ConnectionFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    /// Kernel address family constant (AF_INET / AF_INET6)
    pub fn af(self) -> u8 {
        match self {
            Self::V4 => AF_INET,
            Self::V6 => AF_INET6,
        }
    }
}

/// Direction of a connection relative to the observing host
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionDirection {
    #[default]
    Unknown,
    Incoming,
    Outgoing,
}

/// Identity of one direction of a flow
///
/// Matching is directional: swapping source and destination yields a
/// different tuple, mirroring the origin and reply legs of conntrack.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionTuple {
    pub protocol: ConnectionType,
    pub family: ConnectionFamily,
    pub source: IpAddr,
    pub dest: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub direction: ConnectionDirection,
    /// Inode of the observing network namespace
    pub netns: u32,
}

impl ConnectionTuple {
    /// Build a tuple, deriving the family from the source address.
    pub fn new(protocol: ConnectionType, source: IpAddr, sport: u16, dest: IpAddr, dport: u16) -> Self {
        Self {
            protocol,
            family: ConnectionFamily::of(&source),
            source,
            dest,
            sport,
            dport,
            direction: ConnectionDirection::Unknown,
            netns: 0,
        }
    }

    pub fn with_netns(mut self, netns: u32) -> Self {
        self.netns = netns;
        self
    }

    pub fn with_direction(mut self, direction: ConnectionDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Byte key of this tuple with no owning process (pid 0)
    pub fn byte_key<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        encode_byte_key(0, self, buf)
    }

    /// Conntrack lookup key for this direction of the flow
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            src_ip: self.source,
            src_port: self.sport,
            dst_ip: self.dest,
            dst_port: self.dport,
            protocol: self.protocol,
        }
    }
}

/// A tuple plus the observation state kept by the flow tracker
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
    pub tuple: ConnectionTuple,
    pub pid: u32,
    pub monotonic_sent_bytes: u64,
    pub monotonic_recv_bytes: u64,
    /// Monotonic timestamp (nanoseconds) of the last observation
    pub last_update_epoch: u64,
}

impl ConnectionStats {
    pub fn new(tuple: ConnectionTuple) -> Self {
        Self {
            tuple,
            pid: 0,
            monotonic_sent_bytes: 0,
            monotonic_recv_bytes: 0,
            last_update_epoch: 0,
        }
    }

    /// Encode the byte key into a caller-owned scratch buffer
    ///
    /// The buffer must hold at least `CONNECTION_BYTE_KEY_MAX_LEN` bytes;
    /// nothing is written otherwise. The returned slice borrows `buf`.
    pub fn byte_key<'a>(&self, buf: &'a mut [u8]) -> Result<&'a [u8]> {
        encode_byte_key(self.pid, &self.tuple, buf)
    }

    /// True iff more than `timeout` nanoseconds passed since the last update
    ///
    /// A `latest_time` behind `last_update_epoch` is never expired.
    pub fn is_expired(&self, latest_time: u64, timeout: u64) -> bool {
        latest_time
            .checked_sub(self.last_update_epoch)
            .is_some_and(|age| age > timeout)
    }
}

/// NAT-rewritten ("reply") addressing of a tracked connection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IPTranslation {
    pub repl_src_ip: IpAddr,
    pub repl_dst_ip: IpAddr,
    pub repl_src_port: u16,
    pub repl_dst_port: u16,
}

impl IPTranslation {
    /// Translation advertised by one conntrack leg
    pub fn from_leg(leg: &FlowKey) -> Self {
        Self {
            repl_src_ip: leg.src_ip,
            repl_dst_ip: leg.dst_ip,
            repl_src_port: leg.src_port,
            repl_dst_port: leg.dst_port,
        }
    }
}

// ============================================================================
// Conntrack Types
// ============================================================================

/// One leg of a conntrack entry, used as a cache lookup key
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: ConnectionType,
}

impl FlowKey {
    /// The same leg seen from the other end
    pub fn inverted(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Decode a probe record; `None` for unsupported families or protocols.
    pub fn from_raw(raw: &kernel::ConntrackTuple) -> Option<Self> {
        let protocol = ConnectionType::from_ip_protocol(raw.protocol)?;
        let (src_ip, dst_ip) = match raw.family {
            AF_INET => (ipv4_from_raw(&raw.saddr), ipv4_from_raw(&raw.daddr)),
            AF_INET6 => (
                IpAddr::V6(Ipv6Addr::from(raw.saddr)),
                IpAddr::V6(Ipv6Addr::from(raw.daddr)),
            ),
            _ => return None,
        };
        Some(Self {
            src_ip,
            src_port: raw.sport,
            dst_ip,
            dst_port: raw.dport,
            protocol,
        })
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.protocol,
            std::net::SocketAddr::new(self.src_ip, self.src_port),
            std::net::SocketAddr::new(self.dst_ip, self.dst_port)
        )
    }
}

fn ipv4_from_raw(bytes: &[u8; 16]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// A kernel conntrack entry normalized into the connection model
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConntrackEntry {
    pub origin: FlowKey,
    pub reply: FlowKey,
    /// Inode of the namespace the entry was observed in
    pub netns: u32,
}

impl ConntrackEntry {
    /// True when the reply leg is not simply the inverted origin leg
    pub fn is_nat(&self) -> bool {
        self.reply != self.origin.inverted()
    }

    /// Decode a pair of probe records; `None` for unsupported entries.
    pub fn from_raw(origin: &kernel::ConntrackTuple, reply: &kernel::ConntrackTuple) -> Option<Self> {
        Some(Self {
            origin: FlowKey::from_raw(origin)?,
            reply: FlowKey::from_raw(reply)?,
            netns: origin.netns,
        })
    }
}

/// Kind of change reported for a conntrack entry
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    New,
    Update,
    Destroy,
}

impl UpdateKind {
    pub fn from_event_type(event_type: u8) -> Option<Self> {
        use kernel::constants::{CT_EVENT_DESTROY, CT_EVENT_NEW, CT_EVENT_UPDATE};
        match event_type {
            CT_EVENT_NEW => Some(Self::New),
            CT_EVENT_UPDATE => Some(Self::Update),
            CT_EVENT_DESTROY => Some(Self::Destroy),
            _ => None,
        }
    }
}

/// A conntrack table change, as delivered by either backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackUpdate {
    pub kind: UpdateKind,
    pub entry: ConntrackEntry,
}

impl ConntrackUpdate {
    /// Decode a probe event; `None` for unsupported entries.
    pub fn from_event(event: &kernel::ConntrackEvent) -> Option<Self> {
        Some(Self {
            kind: UpdateKind::from_event_type(event.event_type)?,
            entry: ConntrackEntry::from_raw(&event.origin, &event.reply)?,
        })
    }
}

// ============================================================================
// Byte Keys
// ============================================================================

/// Maximum encoded length of a byte key
///
/// pid (4) + sport (2) + dport (2) + metadata (1) + two IPv6-sized addresses.
pub const CONNECTION_BYTE_KEY_MAX_LEN: usize = 4 + 2 + 2 + 1 + 16 + 16;

const BYTE_KEY_HEADER_LEN: usize = 9;

// Metadata byte layout
const META_FAMILY_V6: u8 = 0b0001;
const META_TYPE_UDP: u8 = 0b0010;
const META_SRC_V6: u8 = 0b0100;
const META_DST_V6: u8 = 0b1000;

fn encode_byte_key<'a>(pid: u32, tuple: &ConnectionTuple, buf: &'a mut [u8]) -> Result<&'a [u8]> {
    if buf.len() < CONNECTION_BYTE_KEY_MAX_LEN {
        return Err(ConntrackError::BufferTooSmall {
            needed: CONNECTION_BYTE_KEY_MAX_LEN,
            got: buf.len(),
        });
    }

    let mut meta = 0u8;
    if tuple.family == ConnectionFamily::V6 {
        meta |= META_FAMILY_V6;
    }
    if tuple.protocol == ConnectionType::Udp {
        meta |= META_TYPE_UDP;
    }
    if tuple.source.is_ipv6() {
        meta |= META_SRC_V6;
    }
    if tuple.dest.is_ipv6() {
        meta |= META_DST_V6;
    }

    buf[0..4].copy_from_slice(&pid.to_le_bytes());
    buf[4..6].copy_from_slice(&tuple.sport.to_le_bytes());
    buf[6..8].copy_from_slice(&tuple.dport.to_le_bytes());
    buf[8] = meta;

    let mut n = BYTE_KEY_HEADER_LEN;
    n += write_addr(&tuple.source, &mut buf[n..]);
    n += write_addr(&tuple.dest, &mut buf[n..]);
    Ok(&buf[..n])
}

fn write_addr(addr: &IpAddr, out: &mut [u8]) -> usize {
    match addr {
        IpAddr::V4(v4) => {
            out[..4].copy_from_slice(&v4.octets());
            4
        }
        IpAddr::V6(v6) => {
            out[..16].copy_from_slice(&v6.octets());
            16
        }
    }
}

fn read_addr(bytes: &[u8], v6: bool) -> Option<(IpAddr, usize)> {
    if v6 {
        let octets: [u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some((IpAddr::V6(Ipv6Addr::from(octets)), 16))
    } else {
        let octets: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        Some((IpAddr::V4(Ipv4Addr::from(octets)), 4))
    }
}

/// Render a byte key as `pid=.. source=.. sport=.. dest=.. dport=.. family=.. type=..`
///
/// Debugging aid only. Buffers that were not produced by `byte_key` render
/// as `invalid key (<n> bytes)`.
pub fn beautify_key(key: &[u8]) -> String {
    decode_byte_key(key).unwrap_or_else(|| format!("invalid key ({} bytes)", key.len()))
}

fn decode_byte_key(key: &[u8]) -> Option<String> {
    let header = key.get(..BYTE_KEY_HEADER_LEN)?;
    let pid = u32::from_le_bytes(header[0..4].try_into().ok()?);
    let sport = u16::from_le_bytes(header[4..6].try_into().ok()?);
    let dport = u16::from_le_bytes(header[6..8].try_into().ok()?);
    let meta = header[8];

    let rest = &key[BYTE_KEY_HEADER_LEN..];
    let (source, used) = read_addr(rest, meta & META_SRC_V6 != 0)?;
    let (dest, used_dst) = read_addr(&rest[used..], meta & META_DST_V6 != 0)?;
    if used + used_dst != rest.len() {
        return None;
    }

    let family = if meta & META_FAMILY_V6 != 0 {
        ConnectionFamily::V6
    } else {
        ConnectionFamily::V4
    };
    let protocol = if meta & META_TYPE_UDP != 0 {
        ConnectionType::Udp
    } else {
        ConnectionType::Tcp
    };

    Some(format!(
        "pid={} source={} sport={} dest={} dport={} family={} type={}",
        pid, source, sport, dest, dport, family as u8, protocol as u8
    ))
}
