//! NAT connection tracking
//!
//! Resolves the post-NAT addressing of TCP/UDP flows from the kernel's
//! connection-tracking table, either through ctnetlink or through a
//! conntrack tracing probe.

pub mod cache;
pub mod config;
pub mod conntracker;
pub mod ebpf;
pub mod error;
pub mod exporter;
pub mod netlink;
pub mod ratelimit;
pub mod runtime;
pub mod types;

pub use cache::TranslationCache;
pub use config::{BackendKind, Config};
pub use conntracker::{new_conntracker, Conntracker, Diagnostics, NoopConntracker};
pub use error::{ConntrackError, Result};
pub use exporter::{ExporterType, JsonExporter, MetricsExporter};
pub use runtime::{CommandCompiler, CompilationContext, KernelVersion};
pub use types::*;
