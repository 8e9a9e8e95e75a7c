//! Blocking ctnetlink queries scoped to one network namespace

use super::message::{self, MessageIter, Parsed, CTA_TUPLE_ORIG, CTA_TUPLE_REPLY};
use super::socket::NetlinkSocket;
use crate::error::{ConntrackError, Result};
use crate::types::{ConnectionFamily, ConntrackEntry, FlowKey};
use log::debug;
use std::path::Path;
use std::time::{Duration, Instant};

/// Datagram size used for query replies
const RECV_BUFFER_LEN: usize = 64 * 1024;

/// How long a single receive may block
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Which leg of an entry a query tuple names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Origin,
    Reply,
}

impl Leg {
    fn attr(self) -> u16 {
        match self {
            Leg::Origin => CTA_TUPLE_ORIG,
            Leg::Reply => CTA_TUPLE_REPLY,
        }
    }
}

/// Request/response handle on the conntrack table of one namespace
pub struct Conntrack {
    socket: NetlinkSocket,
    netns: u32,
    seq: u32,
    buf: Vec<u8>,
}

impl Conntrack {
    /// Open a handle on the namespace behind `ns_path`, or on the current one
    ///
    /// `self_ns` names the caller's own namespace handle and is only used to
    /// tag entries when `ns_path` is `None`.
    pub fn new(ns_path: Option<&Path>, self_ns: &Path) -> Result<Self> {
        let (socket, netns) = match ns_path {
            Some(path) => (
                NetlinkSocket::open_in_namespace(path, 0, RECV_TIMEOUT)?,
                super::namespace_inode(path)?,
            ),
            None => (
                NetlinkSocket::open(0, RECV_TIMEOUT)?,
                super::namespace_inode(self_ns).unwrap_or(0),
            ),
        };
        Ok(Self {
            socket,
            netns,
            seq: 0,
            buf: vec![0u8; RECV_BUFFER_LEN],
        })
    }

    /// Inode of the namespace this handle queries
    pub fn netns(&self) -> u32 {
        self.netns
    }

    /// Stream every TCP/UDP entry of `family` into `visit`
    ///
    /// Stops early when `visit` returns `false`. Fails with `Transport` when
    /// the kernel has not finished the dump by `deadline`.
    pub fn dump<F>(&mut self, family: ConnectionFamily, deadline: Instant, mut visit: F) -> Result<usize>
    where
        F: FnMut(ConntrackEntry) -> bool,
    {
        let seq = self.next_seq();
        self.socket.send(&message::dump_request(family, seq))?;

        let mut visited = 0;
        loop {
            if Instant::now() >= deadline {
                return Err(ConntrackError::Transport(format!(
                    "conntrack dump not finished after {} entries",
                    visited
                )));
            }
            let Some(received) = self.socket.recv(&mut self.buf)? else {
                continue;
            };

            for msg in MessageIter::new(&self.buf[..received.len]) {
                let msg = msg?;
                if msg.seq != seq {
                    continue;
                }
                match message::parse(&msg, self.netns)? {
                    Parsed::Entry { entry, .. } => {
                        visited += 1;
                        if !visit(entry) {
                            debug!("conntrack dump stopped early after {} entries", visited);
                            return Ok(visited);
                        }
                    }
                    Parsed::Done => return Ok(visited),
                    Parsed::Ack(0) | Parsed::Skip => {}
                    Parsed::Ack(errno) => {
                        return Err(ConntrackError::Socket {
                            op: "conntrack dump",
                            source: std::io::Error::from_raw_os_error(errno),
                        })
                    }
                    Parsed::Overrun => {
                        return Err(ConntrackError::Transport("conntrack dump overrun".to_string()))
                    }
                }
            }
        }
    }

    /// Ask the kernel whether an entry has `flow` as its `leg`
    pub fn exists(&mut self, flow: &FlowKey, leg: Leg) -> Result<bool> {
        let seq = self.next_seq();
        self.socket.send(&message::get_request(flow, leg.attr(), seq))?;

        let deadline = Instant::now() + RECV_TIMEOUT * 4;
        let mut found = false;
        while Instant::now() < deadline {
            let Some(received) = self.socket.recv(&mut self.buf)? else {
                continue;
            };
            for msg in MessageIter::new(&self.buf[..received.len]) {
                let msg = msg?;
                if msg.seq != seq {
                    continue;
                }
                match message::parse(&msg, self.netns)? {
                    Parsed::Entry { .. } => found = true,
                    Parsed::Ack(0) | Parsed::Done => return Ok(found),
                    Parsed::Ack(libc::ENOENT) => return Ok(false),
                    Parsed::Ack(errno) => {
                        return Err(ConntrackError::Socket {
                            op: "conntrack get",
                            source: std::io::Error::from_raw_os_error(errno),
                        })
                    }
                    Parsed::Skip | Parsed::Overrun => {}
                }
            }
        }
        Err(ConntrackError::Transport("no reply to conntrack get".to_string()))
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }
}
