//! Conntrack configuration
//!
//! Process-wide settings supplied by the flow tracker. Every field has a
//! default so partial JSON documents are accepted.

use crate::error::{ConntrackError, Result};
use crate::runtime::KernelVersion;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which conntracker implementation to construct
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Query and subscribe to ctnetlink
    #[default]
    Netlink,
    /// Consume events from the conntrack tracing probe
    Ebpf,
    /// Never resolve translations
    Disabled,
}

impl std::str::FromStr for BackendKind {
    type Err = ConntrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "netlink" => Ok(Self::Netlink),
            "ebpf" | "probe" => Ok(Self::Ebpf),
            "disabled" | "none" => Ok(Self::Disabled),
            _ => Err(ConntrackError::Config(format!(
                "unknown backend: {}. Use netlink, ebpf or disabled",
                s
            ))),
        }
    }
}

/// External command used to compile the probe on the host
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeCompilerConfig {
    /// Program to run
    pub command: String,
    /// Arguments passed to the program
    pub args: Vec<String>,
    /// Working directory holding the probe sources
    pub source_dir: PathBuf,
    /// Object file the command produces
    pub output: PathBuf,
}

impl Default for RuntimeCompilerConfig {
    fn default() -> Self {
        Self {
            command: "cargo".to_string(),
            args: vec![
                "+nightly".to_string(),
                "build".to_string(),
                "--release".to_string(),
                "-Z".to_string(),
                "build-std=core".to_string(),
                "--target".to_string(),
                "bpfel-unknown-none".to_string(),
            ],
            source_dir: PathBuf::from("/opt/conntrack/probe"),
            output: PathBuf::from("/opt/conntrack/probe/target/bpfel-unknown-none/release/conntrack-probe"),
        }
    }
}

/// Conntrack settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend selected at construction
    pub backend: BackendKind,
    /// Serve translations observed in any namespace
    pub enable_conntrack_all_namespaces: bool,
    /// Maximum number of cached conntrack legs, two per entry
    pub conntrack_max_state_size: usize,
    /// Conntrack updates admitted per second (0 = unlimited)
    pub conntrack_rate_limit: u32,
    /// Seconds after which an unrefreshed entry stops being served
    pub conntrack_retention_secs: u64,
    /// Upper bound on the initial table dump, in seconds
    pub conntrack_init_timeout_secs: u64,
    /// Capacity of the queue between probe readers and the cache
    pub event_queue_size: usize,
    /// Always compile the probe on the host
    pub enable_runtime_compiler: bool,
    /// Use the precompiled probe when compilation fails
    pub allow_precompiled_fallback: bool,
    /// Compile the probe with debug output
    pub bpf_debug: bool,
    /// Oldest kernel the precompiled probe supports
    pub precompiled_min_kernel: KernelVersion,
    /// Path of the precompiled probe object
    pub precompiled_object: Option<PathBuf>,
    /// How to compile the probe at runtime
    pub runtime_compiler: RuntimeCompilerConfig,
    /// Mount point of procfs
    pub proc_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            enable_conntrack_all_namespaces: false,
            conntrack_max_state_size: 65536 * 2,
            conntrack_rate_limit: 500,
            conntrack_retention_secs: 600,
            conntrack_init_timeout_secs: 10,
            event_queue_size: 4096,
            enable_runtime_compiler: false,
            allow_precompiled_fallback: true,
            bpf_debug: false,
            precompiled_min_kernel: KernelVersion::new(4, 14, 0),
            precompiled_object: None,
            runtime_compiler: RuntimeCompilerConfig::default(),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Config {
    /// Load settings from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| ConntrackError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no backend can run with
    pub fn validate(&self) -> Result<()> {
        if self.conntrack_max_state_size < 2 {
            return Err(ConntrackError::Config(
                "conntrack_max_state_size must be >= 2 to hold both legs of an entry".to_string(),
            ));
        }
        if self.event_queue_size == 0 {
            return Err(ConntrackError::Config("event_queue_size must be >= 1".to_string()));
        }
        if self.conntrack_retention_secs == 0 {
            return Err(ConntrackError::Config(
                "conntrack_retention_secs must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.conntrack_retention_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.conntrack_init_timeout_secs)
    }

    /// Namespace handle of the calling process
    pub fn self_netns_path(&self) -> PathBuf {
        self.proc_root.join("self/ns/net")
    }
}
