//! Shared constants for the conntrack probe
//!
//! These constants are used by both the kernel probe and the userspace
//! reader so both sides agree on map names, event kinds and limits.

// ============================================================================
// BPF Map Names and Sizes
// ============================================================================

/// Perf event array carrying `ConntrackEvent` records
pub const EVENTS_MAP: &str = "CONNTRACK_EVENTS";

/// Statistics counter map
pub const STATS_MAP: &str = "CONNTRACK_STATS";

// ============================================================================
// Event Types (for ConntrackEvent.event_type)
// ============================================================================

/// Entry inserted into the conntrack hash table
pub const CT_EVENT_NEW: u8 = 0;

/// Existing entry observed again (status change, dump)
pub const CT_EVENT_UPDATE: u8 = 1;

/// Entry removed from the conntrack table
pub const CT_EVENT_DESTROY: u8 = 2;

// ============================================================================
// Address Families (from linux/socket.h)
// ============================================================================

/// IPv4 address family
pub const AF_INET: u8 = 2;

/// IPv6 address family
pub const AF_INET6: u8 = 10;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Number of events written to the perf buffer
pub const STAT_EVENTS_EMITTED: u32 = 0;

/// Number of events the perf buffer rejected
pub const STAT_EVENTS_FAILED: u32 = 1;

/// Number of entries skipped for an unsupported protocol
pub const STAT_UNSUPPORTED_PROTOCOL: u32 = 2;

/// Number of kernel reads that failed
pub const STAT_READ_ERRORS: u32 = 3;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 4;
