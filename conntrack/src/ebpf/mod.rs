//! Probe-based backend
//!
//! Loads the conntrack tracing probe and follows the events it emits.

pub mod conntracker;
pub mod events;
pub mod loader;

pub use conntracker::EbpfConntracker;
pub use events::{EventProcessor, RecordBatch, RecordSource};
pub use loader::{CounterSource, ProbeLoader};
