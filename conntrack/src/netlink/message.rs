//! ctnetlink message construction and parsing
//!
//! Every message is a `nlmsghdr` followed by an `nfgenmsg` and a chain of
//! 4-byte aligned attributes. Tuples are nested attributes:
//!
//! ```text
//! CTA_TUPLE_ORIG / CTA_TUPLE_REPLY
//!   CTA_TUPLE_IP     { CTA_IP_V4_SRC | CTA_IP_V6_SRC, CTA_IP_V4_DST | CTA_IP_V6_DST }
//!   CTA_TUPLE_PROTO  { CTA_PROTO_NUM (u8), CTA_PROTO_SRC_PORT (be16), CTA_PROTO_DST_PORT (be16) }
//! ```

use crate::error::{ConntrackError, Result};
use crate::types::{ConnectionFamily, ConnectionType, ConntrackEntry, FlowKey, UpdateKind};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ============================================================================
// Protocol constants
// ============================================================================

pub const NLMSG_HDRLEN: usize = 16;
pub const NFGENMSG_LEN: usize = 4;
const NLA_HDRLEN: usize = 4;

pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_MULTI: u16 = 0x2;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_DUMP: u16 = 0x300;
pub const NLM_F_CREATE: u16 = 0x400;

pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub const IPCTNL_MSG_CT_NEW: u16 = 0;
pub const IPCTNL_MSG_CT_GET: u16 = 1;
pub const IPCTNL_MSG_CT_DELETE: u16 = 2;
const NFNETLINK_V0: u8 = 0;

/// Multicast groups of conntrack events
pub const NF_NETLINK_CONNTRACK_NEW: u32 = 0x1;
pub const NF_NETLINK_CONNTRACK_UPDATE: u32 = 0x2;
pub const NF_NETLINK_CONNTRACK_DESTROY: u32 = 0x4;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_F_NET_BYTEORDER: u16 = 0x4000;
const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

pub const CTA_TUPLE_ORIG: u16 = 1;
pub const CTA_TUPLE_REPLY: u16 = 2;

const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

#[inline]
const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

#[inline]
pub const fn ctnetlink_type(msg: u16) -> u16 {
    (NFNL_SUBSYS_CTNETLINK << 8) | msg
}

// ============================================================================
// Construction
// ============================================================================

/// Incremental builder for one ctnetlink request
pub struct MessageBuilder {
    buf: BytesMut,
    nests: Vec<usize>,
}

impl MessageBuilder {
    /// Start a message with its netlink and nfgenmsg headers
    pub fn new(msg_type: u16, flags: u16, seq: u32, family: u8) -> Self {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u32_ne(0); // length, patched by finish()
        buf.put_u16_ne(msg_type);
        buf.put_u16_ne(flags);
        buf.put_u32_ne(seq);
        buf.put_u32_ne(0); // port id, assigned by the kernel

        buf.put_u8(family);
        buf.put_u8(NFNETLINK_V0);
        buf.put_u16(0); // res_id, big endian
        Self { buf, nests: Vec::new() }
    }

    /// Append a flat attribute
    pub fn put_attr(&mut self, attr: u16, payload: &[u8]) {
        self.buf.put_u16_ne((NLA_HDRLEN + payload.len()) as u16);
        self.buf.put_u16_ne(attr);
        self.buf.put_slice(payload);
        self.pad();
    }

    /// Open a nested attribute; close it with `end_nested`
    pub fn begin_nested(&mut self, attr: u16) {
        self.nests.push(self.buf.len());
        self.buf.put_u16_ne(0);
        self.buf.put_u16_ne(attr | NLA_F_NESTED);
    }

    pub fn end_nested(&mut self) {
        if let Some(start) = self.nests.pop() {
            let len = (self.buf.len() - start) as u16;
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
    }

    /// Append a complete tuple under `attr` (`CTA_TUPLE_ORIG` or `CTA_TUPLE_REPLY`)
    pub fn put_tuple(&mut self, attr: u16, flow: &FlowKey) {
        self.begin_nested(attr);

        self.begin_nested(CTA_TUPLE_IP);
        match (flow.src_ip, flow.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                self.put_attr(CTA_IP_V4_SRC, &src.octets());
                self.put_attr(CTA_IP_V4_DST, &dst.octets());
            }
            (src, dst) => {
                self.put_attr(CTA_IP_V6_SRC, &to_v6(src).octets());
                self.put_attr(CTA_IP_V6_DST, &to_v6(dst).octets());
            }
        }
        self.end_nested();

        self.begin_nested(CTA_TUPLE_PROTO);
        self.put_attr(CTA_PROTO_NUM, &[flow.protocol.ip_protocol()]);
        self.put_attr(CTA_PROTO_SRC_PORT, &flow.src_port.to_be_bytes());
        self.put_attr(CTA_PROTO_DST_PORT, &flow.dst_port.to_be_bytes());
        self.end_nested();

        self.end_nested();
    }

    /// Patch the total length and return the wire bytes
    pub fn finish(mut self) -> Bytes {
        while !self.nests.is_empty() {
            self.end_nested();
        }
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf.freeze()
    }

    fn pad(&mut self) {
        let padded = align4(self.buf.len());
        self.buf.put_bytes(0, padded - self.buf.len());
    }
}

fn to_v6(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Request a full table dump for one address family
pub fn dump_request(family: ConnectionFamily, seq: u32) -> Bytes {
    MessageBuilder::new(
        ctnetlink_type(IPCTNL_MSG_CT_GET),
        NLM_F_REQUEST | NLM_F_DUMP,
        seq,
        family.af(),
    )
    .finish()
}

/// Request the entry having `flow` as its origin or reply leg
pub fn get_request(flow: &FlowKey, tuple_attr: u16, seq: u32) -> Bytes {
    let family = ConnectionFamily::of(&flow.src_ip);
    let mut builder = MessageBuilder::new(
        ctnetlink_type(IPCTNL_MSG_CT_GET),
        NLM_F_REQUEST | NLM_F_ACK,
        seq,
        family.af(),
    );
    builder.put_tuple(tuple_attr, flow);
    builder.finish()
}

// ============================================================================
// Parsing
// ============================================================================

/// One message borrowed from a receive buffer
#[derive(Debug, Clone, Copy)]
pub struct NetlinkMessage<'a> {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    /// Everything after the netlink header
    pub payload: &'a [u8],
}

/// What a received message means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed {
    /// A TCP/UDP conntrack entry
    Entry { kind: UpdateKind, entry: ConntrackEntry },
    /// End of a multipart dump
    Done,
    /// ACK (errno 0) or error (positive errno)
    Ack(i32),
    /// Kernel dropped messages for this socket
    Overrun,
    /// Anything we do not track (other protocols, other message types)
    Skip,
}

/// Iterator over the messages packed in one datagram
pub struct MessageIter<'a> {
    data: &'a [u8],
}

impl<'a> MessageIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = Result<NetlinkMessage<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLMSG_HDRLEN {
            return None;
        }

        let len = read_u32(self.data, 0) as usize;
        if len < NLMSG_HDRLEN || len > self.data.len() {
            self.data = &[];
            return Some(Err(ConntrackError::Message(format!(
                "message length {} out of bounds",
                len
            ))));
        }

        let msg = NetlinkMessage {
            msg_type: read_u16(self.data, 4),
            flags: read_u16(self.data, 6),
            seq: read_u32(self.data, 8),
            payload: &self.data[NLMSG_HDRLEN..len],
        };
        self.data = &self.data[align4(len).min(self.data.len())..];
        Some(Ok(msg))
    }
}

/// Iterator over a chain of attributes
struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<(u16, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }
        let len = read_u16(self.data, 0) as usize;
        let attr = read_u16(self.data, 2) & NLA_TYPE_MASK;
        if len < NLA_HDRLEN || len > self.data.len() {
            self.data = &[];
            return Some(Err(ConntrackError::Message(format!(
                "attribute {} length {} out of bounds",
                attr, len
            ))));
        }
        let payload = &self.data[NLA_HDRLEN..len];
        self.data = &self.data[align4(len).min(self.data.len())..];
        Some(Ok((attr, payload)))
    }
}

fn attrs(data: &[u8]) -> AttrIter<'_> {
    AttrIter { data }
}

/// Interpret one message
///
/// `netns` tags the decoded entry with the namespace it was observed in.
pub fn parse(msg: &NetlinkMessage<'_>, netns: u32) -> Result<Parsed> {
    match msg.msg_type {
        NLMSG_DONE => return Ok(Parsed::Done),
        NLMSG_NOOP => return Ok(Parsed::Skip),
        NLMSG_OVERRUN => return Ok(Parsed::Overrun),
        NLMSG_ERROR => {
            if msg.payload.len() < 4 {
                return Err(ConntrackError::Message("truncated error message".to_string()));
            }
            let errno = read_u32(msg.payload, 0) as i32;
            return Ok(Parsed::Ack(errno.wrapping_neg()));
        }
        _ => {}
    }

    if msg.msg_type >> 8 != NFNL_SUBSYS_CTNETLINK {
        return Ok(Parsed::Skip);
    }
    let kind = match msg.msg_type & 0xff {
        IPCTNL_MSG_CT_NEW if msg.flags & NLM_F_CREATE != 0 => UpdateKind::New,
        IPCTNL_MSG_CT_NEW => UpdateKind::Update,
        IPCTNL_MSG_CT_DELETE => UpdateKind::Destroy,
        _ => return Ok(Parsed::Skip),
    };

    if msg.payload.len() < NFGENMSG_LEN {
        return Err(ConntrackError::Message("missing nfgenmsg header".to_string()));
    }

    let mut origin = None;
    let mut reply = None;
    for attr in attrs(&msg.payload[NFGENMSG_LEN..]) {
        let (attr, payload) = attr?;
        match attr {
            CTA_TUPLE_ORIG => origin = parse_tuple(payload)?,
            CTA_TUPLE_REPLY => reply = parse_tuple(payload)?,
            _ => {}
        }
    }

    match (origin, reply) {
        (Some(origin), Some(reply)) => Ok(Parsed::Entry {
            kind,
            entry: ConntrackEntry { origin, reply, netns },
        }),
        _ => Ok(Parsed::Skip),
    }
}

/// Decode a tuple; `None` when it is not TCP/UDP over IP
fn parse_tuple(data: &[u8]) -> Result<Option<FlowKey>> {
    let mut src_ip = None;
    let mut dst_ip = None;
    let mut protocol = None;
    let mut src_port = None;
    let mut dst_port = None;

    for attr in attrs(data) {
        let (attr, payload) = attr?;
        match attr {
            CTA_TUPLE_IP => {
                for ip in attrs(payload) {
                    let (ip, value) = ip?;
                    match ip {
                        CTA_IP_V4_SRC => src_ip = Some(read_v4(value)?),
                        CTA_IP_V4_DST => dst_ip = Some(read_v4(value)?),
                        CTA_IP_V6_SRC => src_ip = Some(read_v6(value)?),
                        CTA_IP_V6_DST => dst_ip = Some(read_v6(value)?),
                        _ => {}
                    }
                }
            }
            CTA_TUPLE_PROTO => {
                for proto in attrs(payload) {
                    let (proto, value) = proto?;
                    match proto {
                        CTA_PROTO_NUM => protocol = value.first().copied(),
                        CTA_PROTO_SRC_PORT => src_port = Some(read_be16(value)?),
                        CTA_PROTO_DST_PORT => dst_port = Some(read_be16(value)?),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let Some(protocol) = protocol.and_then(ConnectionType::from_ip_protocol) else {
        return Ok(None);
    };
    match (src_ip, dst_ip, src_port, dst_port) {
        (Some(src_ip), Some(dst_ip), Some(src_port), Some(dst_port)) => Ok(Some(FlowKey {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
        })),
        _ => Ok(None),
    }
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_ne_bytes([data[off], data[off + 1]])
}

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_be16(value: &[u8]) -> Result<u16> {
    let bytes: [u8; 2] = value
        .get(..2)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ConntrackError::Message("short port attribute".to_string()))?;
    Ok(u16::from_be_bytes(bytes))
}

fn read_v4(value: &[u8]) -> Result<IpAddr> {
    let octets: [u8; 4] = value
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ConntrackError::Message("short IPv4 attribute".to_string()))?;
    Ok(IpAddr::V4(Ipv4Addr::from(octets)))
}

fn read_v6(value: &[u8]) -> Result<IpAddr> {
    let octets: [u8; 16] = value
        .get(..16)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ConntrackError::Message("short IPv6 attribute".to_string()))?;
    Ok(IpAddr::V6(Ipv6Addr::from(octets)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(src: &str, sport: u16, dst: &str, dport: u16, protocol: ConnectionType) -> FlowKey {
        FlowKey {
            src_ip: src.parse().unwrap(),
            src_port: sport,
            dst_ip: dst.parse().unwrap(),
            dst_port: dport,
            protocol,
        }
    }

    /// Build a kernel-style event carrying both legs
    fn event(msg: u16, flags: u16, origin: &FlowKey, reply: &FlowKey) -> Bytes {
        let family = ConnectionFamily::of(&origin.src_ip);
        let mut b = MessageBuilder::new(ctnetlink_type(msg), flags, 0, family.af());
        b.put_tuple(CTA_TUPLE_ORIG, origin);
        b.put_tuple(CTA_TUPLE_REPLY, reply);
        // Status attribute the parser must skip
        b.put_attr(3, &0x1a2u32.to_be_bytes());
        b.finish()
    }

    fn parse_one(data: &[u8]) -> Parsed {
        let mut iter = MessageIter::new(data);
        let msg = iter.next().unwrap().unwrap();
        assert!(iter.next().is_none());
        parse(&msg, 7).unwrap()
    }

    #[test]
    fn test_dump_request_layout() {
        let req = dump_request(ConnectionFamily::V6, 42);
        assert_eq!(req.len(), NLMSG_HDRLEN + NFGENMSG_LEN);
        assert_eq!(read_u32(&req, 0) as usize, req.len());
        assert_eq!(read_u16(&req, 4), 0x0101);
        assert_eq!(read_u16(&req, 6), NLM_F_REQUEST | NLM_F_DUMP);
        assert_eq!(read_u32(&req, 8), 42);
        assert_eq!(req[16], libc::AF_INET6 as u8);
    }

    #[test]
    fn test_get_request_is_aligned() {
        let req = get_request(
            &flow("10.0.0.1", 40000, "10.96.0.10", 80, ConnectionType::Tcp),
            CTA_TUPLE_ORIG,
            1,
        );
        assert_eq!(req.len() % 4, 0);
        assert_eq!(read_u32(&req, 0) as usize, req.len());
        // Outer tuple attribute is nested and spans the rest of the message
        let outer_len = read_u16(&req, 20) as usize;
        assert_eq!(read_u16(&req, 22), CTA_TUPLE_ORIG | NLA_F_NESTED);
        assert_eq!(20 + outer_len, req.len());
    }

    #[test]
    fn test_parse_new_event() {
        let origin = flow("10.0.0.1", 40000, "10.96.0.10", 80, ConnectionType::Tcp);
        let reply = flow("172.17.0.2", 8080, "10.0.0.1", 40000, ConnectionType::Tcp);
        let data = event(IPCTNL_MSG_CT_NEW, NLM_F_CREATE, &origin, &reply);

        match parse_one(&data) {
            Parsed::Entry { kind, entry } => {
                assert_eq!(kind, UpdateKind::New);
                assert_eq!(entry.origin, origin);
                assert_eq!(entry.reply, reply);
                assert_eq!(entry.netns, 7);
                assert!(entry.is_nat());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_update_and_destroy_v6() {
        let origin = flow("fd00::1", 5353, "fd00::53", 53, ConnectionType::Udp);
        let reply = origin.inverted();

        let update = event(IPCTNL_MSG_CT_NEW, 0, &origin, &reply);
        assert!(matches!(parse_one(&update), Parsed::Entry { kind: UpdateKind::Update, .. }));

        let destroy = event(IPCTNL_MSG_CT_DELETE, 0, &origin, &reply);
        match parse_one(&destroy) {
            Parsed::Entry { kind, entry } => {
                assert_eq!(kind, UpdateKind::Destroy);
                assert_eq!(entry.origin.src_ip, "fd00::1".parse::<IpAddr>().unwrap());
                assert!(!entry.is_nat());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_skips_other_protocols() {
        let mut b = MessageBuilder::new(ctnetlink_type(IPCTNL_MSG_CT_NEW), 0, 0, libc::AF_INET as u8);
        b.begin_nested(CTA_TUPLE_ORIG);
        b.begin_nested(CTA_TUPLE_PROTO);
        b.put_attr(CTA_PROTO_NUM, &[1]); // ICMP
        b.end_nested();
        b.end_nested();
        assert_eq!(parse_one(&b.finish()), Parsed::Skip);
    }

    #[test]
    fn test_multipart_done_and_error() {
        let origin = flow("10.0.0.1", 1, "10.0.0.2", 2, ConnectionType::Tcp);
        let mut data = event(IPCTNL_MSG_CT_NEW, NLM_F_MULTI, &origin, &origin.inverted()).to_vec();

        let mut done = MessageBuilder::new(NLMSG_DONE, NLM_F_MULTI, 0, 0).finish().to_vec();
        data.append(&mut done);

        let mut error = BytesMut::new();
        error.put_u32_ne((NLMSG_HDRLEN + 4) as u32);
        error.put_u16_ne(NLMSG_ERROR);
        error.put_u16_ne(0);
        error.put_u32_ne(9);
        error.put_u32_ne(0);
        error.put_i32_ne(-libc::ENOENT);
        data.extend_from_slice(&error);

        let parsed: Vec<Parsed> = MessageIter::new(&data)
            .map(|m| parse(&m.unwrap(), 0).unwrap())
            .collect();
        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[0], Parsed::Entry { .. }));
        assert_eq!(parsed[1], Parsed::Done);
        assert_eq!(parsed[2], Parsed::Ack(libc::ENOENT));
    }

    #[test]
    fn test_error_code_extremes_do_not_overflow() {
        let mut error = BytesMut::new();
        error.put_u32_ne((NLMSG_HDRLEN + 4) as u32);
        error.put_u16_ne(NLMSG_ERROR);
        error.put_u16_ne(0);
        error.put_u32_ne(1);
        error.put_u32_ne(0);
        error.put_i32_ne(i32::MIN);

        let msg = MessageIter::new(&error).next().unwrap().unwrap();
        assert_eq!(parse(&msg, 0).unwrap(), Parsed::Ack(i32::MIN));
    }

    #[test]
    fn test_truncated_message() {
        let origin = flow("10.0.0.1", 1, "10.0.0.2", 2, ConnectionType::Tcp);
        let data = event(IPCTNL_MSG_CT_NEW, 0, &origin, &origin.inverted());

        let mut iter = MessageIter::new(&data[..data.len() - 8]);
        assert!(matches!(iter.next(), Some(Err(ConntrackError::Message(_)))));
        assert!(iter.next().is_none());

        // Header intact, attribute length lies
        let mut bad = data.to_vec();
        bad[20] = 0xff;
        let msg = MessageIter::new(&bad).next().unwrap().unwrap();
        assert!(parse(&msg, 0).is_err());
    }
}
