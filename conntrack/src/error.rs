//! Error types for connection tracking

use crate::runtime::KernelVersion;
use thiserror::Error;

/// Result type alias for conntrack operations.
pub type Result<T> = std::result::Result<T, ConntrackError>;

/// Errors that can occur while tracking connections.
#[derive(Debug, Error)]
pub enum ConntrackError {
    /// A netlink syscall failed.
    #[error("{op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The refresh channel to the kernel is currently broken.
    #[error("netlink transport error: {0}")]
    Transport(String),

    /// The kernel sent something we could not decode.
    #[error("malformed netlink message: {0}")]
    Message(String),

    /// The probe backend cannot run on this kernel.
    #[error("kernel {found} is below the minimum {required} supported by the probe backend")]
    UnsupportedKernel {
        found: KernelVersion,
        required: KernelVersion,
    },

    /// Runtime compilation of the probe failed and no fallback was allowed.
    #[error("runtime compilation failed: {0}")]
    Compilation(String),

    /// The precompiled probe artifact could not be found or read.
    #[error("no precompiled probe artifact available: {0}")]
    MissingArtifact(String),

    /// Loading or attaching the probe failed.
    #[error("probe setup failed: {0:#}")]
    Probe(#[from] anyhow::Error),

    /// Caller-supplied scratch buffer cannot hold a byte key.
    #[error("buffer too small for byte key: need {needed} bytes, got {got}")]
    BufferTooSmall { needed: usize, got: usize },

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Filesystem error (namespace handles, artifacts, config files).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ConntrackError {
    /// Wrap the last OS error for a failed syscall.
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Self::Socket {
            op,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Raw errno carried by a socket error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Socket { source, .. } => source.raw_os_error(),
            Self::Io(source) => source.raw_os_error(),
            _ => None,
        }
    }
}
