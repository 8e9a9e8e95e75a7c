//! Shared types for the conntrack tracing probe
//!
//! This crate provides the record layouts and constants shared between the
//! kernel-resident conntrack probe and the userspace reader.

#![no_std]

pub mod types;
pub mod constants;

// Re-export commonly used types
pub use types::{ConntrackEvent, ConntrackTuple};
pub use constants::*;
