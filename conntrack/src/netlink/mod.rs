//! ctnetlink backend
//!
//! Talks to the kernel connection-tracking table over `NETLINK_NETFILTER`.
//!
//! - `socket`: raw socket lifecycle, namespace entry, nsid-aware receive
//! - `message`: ctnetlink request encoding and response decoding
//! - `conntrack`: blocking per-namespace queries (dump, exists)
//! - `conntracker`: the cache-backed `Conntracker` fed by the event stream

pub mod conntrack;
pub mod conntracker;
pub mod message;
pub mod socket;

pub use conntrack::{Conntrack, Leg};
pub use conntracker::NetlinkConntracker;
pub use socket::NetlinkSocket;

use crate::error::Result;
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Inode number identifying the network namespace behind `ns_path`
pub fn namespace_inode(ns_path: &Path) -> Result<u32> {
    let ino = std::fs::metadata(ns_path)?.ino();
    Ok(ino as u32)
}

/// Distinct network namespaces of the processes under `proc_root`
///
/// Returns `(inode, handle path)` pairs, one per namespace. Processes that
/// exit or deny access during the scan are skipped.
pub fn list_namespaces(proc_root: &Path) -> Result<Vec<(u32, PathBuf)>> {
    let mut seen = HashSet::new();
    let mut namespaces = Vec::new();

    for dirent in std::fs::read_dir(proc_root)? {
        let Ok(dirent) = dirent else {
            continue;
        };
        let is_pid = dirent
            .file_name()
            .to_str()
            .map_or(false, |name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()));
        if !is_pid {
            continue;
        }

        let path = dirent.path().join("ns/net");
        if let Ok(inode) = namespace_inode(&path) {
            if seen.insert(inode) {
                namespaces.push((inode, path));
            }
        }
    }

    Ok(namespaces)
}
