//! Netlink socket management
//!
//! Safe wrapper around an `AF_NETLINK`/`NETLINK_NETFILTER` socket. The file
//! descriptor is closed when the wrapper is dropped.

use crate::error::{ConntrackError, Result};
use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

/// Receive buffer requested from the kernel for event sockets
const RECV_BUFFER_BYTES: libc::c_int = 4 * 1024 * 1024;

/// Control buffer large enough for one `NETLINK_LISTEN_ALL_NSID` cmsg
const CONTROL_BUFFER_BYTES: usize = 64;

/// One datagram read from the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Bytes written into the caller's buffer
    pub len: usize,
    /// Peer namespace id, present when listening on all namespaces
    pub nsid: Option<i32>,
}

/// Netlink socket bound to the conntrack subsystem
pub struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    /// Open and bind a socket in the current network namespace
    ///
    /// # Arguments
    ///
    /// * `groups` - Multicast group mask (0 for request/response use)
    /// * `timeout` - Receive timeout; a blocked receive returns `Ok(None)` after it
    pub fn open(groups: u32, timeout: Duration) -> Result<Self> {
        // SAFETY: plain syscall, result checked below
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW | libc::SOCK_CLOEXEC, libc::NETLINK_NETFILTER) };
        if fd < 0 {
            return Err(ConntrackError::last_os_error("socket()"));
        }
        // Owned from here on; closed by Drop on any error below
        let socket = Self { fd };

        // SAFETY: sockaddr_nl is POD, all-zero is a valid value
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = groups;
        // SAFETY: addr outlives the call and the length matches its type
        let ret = unsafe {
            libc::bind(
                socket.fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::last_os_error("bind()"));
        }

        if groups != 0 {
            socket.set_option(libc::SOL_SOCKET, libc::SO_RCVBUF, &RECV_BUFFER_BYTES, "setsockopt(SO_RCVBUF)")?;
        }

        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        socket.set_option(libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv, "setsockopt(SO_RCVTIMEO)")?;

        Ok(socket)
    }

    /// Open a socket inside the network namespace behind `ns_path`
    ///
    /// `setns` only affects the calling thread, so the socket is created on a
    /// short-lived helper thread. Sockets keep the namespace they were
    /// created in.
    pub fn open_in_namespace(ns_path: &Path, groups: u32, timeout: Duration) -> Result<Self> {
        let ns = File::open(ns_path)?;
        let handle = std::thread::Builder::new()
            .name("conntrack-netns".to_string())
            .spawn(move || -> Result<Self> {
                // SAFETY: ns is an open namespace fd for the lifetime of the call
                if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
                    return Err(ConntrackError::last_os_error("setns()"));
                }
                Self::open(groups, timeout)
            })?;

        handle
            .join()
            .map_err(|_| ConntrackError::Transport("namespace helper thread panicked".to_string()))?
    }

    /// Receive events from every namespace that has an nsid in ours
    pub fn listen_all_nsid(&self) -> Result<()> {
        let on: libc::c_int = 1;
        self.set_option(
            libc::SOL_NETLINK,
            libc::NETLINK_LISTEN_ALL_NSID,
            &on,
            "setsockopt(NETLINK_LISTEN_ALL_NSID)",
        )
    }

    /// Send one request to the kernel
    pub fn send(&self, data: &[u8]) -> Result<()> {
        // SAFETY: sockaddr_nl is POD; nl_pid 0 addresses the kernel
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;

        // SAFETY: data and addr are valid for the lengths passed
        let ret = unsafe {
            libc::sendto(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::last_os_error("sendto()"));
        }
        if ret as usize != data.len() {
            return Err(ConntrackError::Transport(format!(
                "short send: {} of {} bytes",
                ret,
                data.len()
            )));
        }
        Ok(())
    }

    /// Receive one datagram
    ///
    /// Returns `Ok(None)` when the receive timeout elapsed or the call was
    /// interrupted. `ENOBUFS` (kernel dropped events) surfaces as an error.
    pub fn recv(&self, buf: &mut [u8]) -> Result<Option<Received>> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; CONTROL_BUFFER_BYTES];
        // SAFETY: sockaddr_nl and msghdr are POD
        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_name = &mut addr as *mut libc::sockaddr_nl as *mut libc::c_void;
        msg.msg_namelen = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        // SAFETY: every pointer in msg refers to a live local buffer
        let ret = unsafe { libc::recvmsg(self.fd, &mut msg, 0) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => Ok(None),
                _ => Err(ConntrackError::Socket {
                    op: "recvmsg()",
                    source: err,
                }),
            };
        }

        if msg.msg_flags & libc::MSG_TRUNC != 0 {
            return Err(ConntrackError::Message(format!(
                "datagram truncated to {} bytes",
                buf.len()
            )));
        }

        Ok(Some(Received {
            len: ret as usize,
            nsid: Self::peer_nsid(&msg),
        }))
    }

    fn peer_nsid(msg: &libc::msghdr) -> Option<i32> {
        // SAFETY: msg was filled by recvmsg and its control buffer is still live
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::SOL_NETLINK && hdr.cmsg_type == libc::NETLINK_LISTEN_ALL_NSID {
                    let data = libc::CMSG_DATA(cmsg) as *const i32;
                    return Some(data.read_unaligned());
                }
                cmsg = libc::CMSG_NXTHDR(msg, cmsg);
            }
        }
        None
    }

    fn set_option<T>(&self, level: libc::c_int, name: libc::c_int, value: &T, op: &'static str) -> Result<()> {
        // SAFETY: value is valid for size_of::<T>() bytes
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(ConntrackError::last_os_error(op));
        }
        Ok(())
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for NetlinkSocket {
    /// Take ownership of an already configured socket
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this wrapper and closed exactly once
        unsafe {
            libc::close(self.fd);
        }
    }
}
