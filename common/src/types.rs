//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between the tracing probe and userspace code.

/// One leg of a conntrack entry as emitted by the probe
///
/// Addresses are raw bytes in network byte order. IPv4 addresses occupy
/// the first four bytes and leave the rest zeroed. Ports are in host
/// byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConntrackTuple {
    /// Source address
    pub saddr: [u8; 16],
    /// Destination address
    pub daddr: [u8; 16],
    /// Source port
    pub sport: u16,
    /// Destination port
    pub dport: u16,
    /// Inode of the network namespace owning the entry
    pub netns: u32,
    /// Address family (AF_INET, AF_INET6)
    pub family: u8,
    /// IP protocol (IPPROTO_TCP, IPPROTO_UDP)
    pub protocol: u8,
    /// Padding for alignment
    pub _padding: [u8; 2],
}

/// Conntrack table change sent from kernel to userspace
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConntrackEvent {
    /// Origin leg, as the connection was initiated
    pub origin: ConntrackTuple,
    /// Reply leg, after any NAT rewrite
    pub reply: ConntrackTuple,
    /// Timestamp when the kernel touched the entry (nanoseconds)
    pub timestamp_ns: u64,
    /// Kind of change (see CT_EVENT_* constants)
    pub event_type: u8,
    /// Padding for alignment
    pub _padding: [u8; 7],
}

// Compile-time alignment checks
const _: () = {
    assert!(core::mem::size_of::<ConntrackTuple>() % core::mem::align_of::<ConntrackTuple>() == 0);
    assert!(core::mem::size_of::<ConntrackEvent>() % core::mem::align_of::<ConntrackEvent>() == 0);
    assert!(core::mem::size_of::<ConntrackTuple>() == 44);
    assert!(core::mem::size_of::<ConntrackEvent>() == 104);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    unsafe impl aya::Pod for ConntrackTuple {}
    unsafe impl aya::Pod for ConntrackEvent {}
}
