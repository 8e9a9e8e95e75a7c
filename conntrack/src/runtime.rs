//! Runtime compilation gate for the conntrack probe
//!
//! Decides whether the tracing probe must be compiled on this host or
//! whether the precompiled artifact may be loaded, and keeps the outcome
//! of each compilation for the lifetime of the owning `CompilationContext`.

use crate::config::Config;
use crate::error::{ConntrackError, Result};
use anyhow::Context;
use bytes::Bytes;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::process::Command;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Kernel below which the probe backend is never supported
pub const MINIMUM_PROBE_KERNEL: KernelVersion = KernelVersion::new(4, 5, 0);

/// Linux kernel release (major.minor.patch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KernelVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl KernelVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a release string such as `5.15.0-91-generic`
    ///
    /// Missing minor or patch components read as zero.
    pub fn parse(release: &str) -> Option<Self> {
        let numeric = release
            .split(|c: char| !(c.is_ascii_digit() || c == '.'))
            .next()?;
        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        Some(Self::new(major, minor, patch))
    }

    /// Version of the running kernel
    pub fn host() -> Result<Self> {
        let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
        // SAFETY: uname fills the zeroed struct we own
        if unsafe { libc::uname(&mut uts) } != 0 {
            return Err(ConntrackError::last_os_error("uname()"));
        }
        // SAFETY: uname NUL-terminates release
        let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) }.to_string_lossy();
        Self::parse(&release)
            .ok_or_else(|| ConntrackError::Config(format!("unparseable kernel release: {}", release)))
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for KernelVersion {
    type Err = ConntrackError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| ConntrackError::Config(format!("invalid kernel version: {}", s)))
    }
}

impl TryFrom<String> for KernelVersion {
    type Error = ConntrackError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<KernelVersion> for String {
    fn from(v: KernelVersion) -> Self {
        v.to_string()
    }
}

/// How the probe artifact is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// Compile on this host before attaching
    RuntimeCompile,
    /// Load the artifact shipped with the agent
    Precompiled,
}

/// Probe bytecode ready to load
#[derive(Debug, Clone)]
pub struct ProbeArtifact {
    pub strategy: ProbeStrategy,
    pub bytecode: Bytes,
}

/// Inputs that identify one compilation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompileOptions {
    pub kernel: KernelVersion,
    pub debug: bool,
}

/// Gate switches, extracted from the process configuration
#[derive(Debug, Clone, Copy)]
pub struct GatePolicy {
    pub enable_runtime_compiler: bool,
    pub allow_precompiled_fallback: bool,
    pub precompiled_min_kernel: KernelVersion,
    pub debug: bool,
}

impl From<&Config> for GatePolicy {
    fn from(cfg: &Config) -> Self {
        Self {
            enable_runtime_compiler: cfg.enable_runtime_compiler,
            allow_precompiled_fallback: cfg.allow_precompiled_fallback,
            precompiled_min_kernel: cfg.precompiled_min_kernel,
            debug: cfg.bpf_debug,
        }
    }
}

/// Pick the artifact strategy for `kernel`
///
/// Fails with `UnsupportedKernel` below `MINIMUM_PROBE_KERNEL`; callers
/// must fall back to the netlink backend in that case.
pub fn probe_strategy(kernel: KernelVersion, policy: &GatePolicy) -> Result<ProbeStrategy> {
    if kernel < MINIMUM_PROBE_KERNEL {
        return Err(ConntrackError::UnsupportedKernel {
            found: kernel,
            required: MINIMUM_PROBE_KERNEL,
        });
    }

    if policy.enable_runtime_compiler || kernel < policy.precompiled_min_kernel {
        Ok(ProbeStrategy::RuntimeCompile)
    } else {
        Ok(ProbeStrategy::Precompiled)
    }
}

/// Produces probe bytecode on the current host
pub trait ProbeCompiler: Send + Sync {
    fn compile(&self, opts: &CompileOptions) -> anyhow::Result<Bytes>;
}

/// Compiles the probe by running an external build command
pub struct CommandCompiler {
    command: String,
    args: Vec<String>,
    source_dir: std::path::PathBuf,
    output: std::path::PathBuf,
}

impl CommandCompiler {
    pub fn from_config(cfg: &Config) -> Self {
        let rc = &cfg.runtime_compiler;
        Self {
            command: rc.command.clone(),
            args: rc.args.clone(),
            source_dir: rc.source_dir.clone(),
            output: rc.output.clone(),
        }
    }
}

impl ProbeCompiler for CommandCompiler {
    fn compile(&self, opts: &CompileOptions) -> anyhow::Result<Bytes> {
        info!(
            "Compiling conntrack probe for kernel {} (debug: {})...",
            opts.kernel, opts.debug
        );

        let status = Command::new(&self.command)
            .args(&self.args)
            .env("CONNTRACK_PROBE_KERNEL", opts.kernel.to_string())
            .env("CONNTRACK_PROBE_DEBUG", if opts.debug { "1" } else { "0" })
            .current_dir(&self.source_dir)
            .status()
            .with_context(|| format!("failed to run {} in {}", self.command, self.source_dir.display()))?;

        if !status.success() {
            anyhow::bail!("probe build exited with {}", status);
        }

        let data = std::fs::read(&self.output)
            .with_context(|| format!("failed to read compiled probe {}", self.output.display()))?;
        Ok(Bytes::from(data))
    }
}

type CompileOutcome = std::result::Result<Bytes, String>;

/// Owner of compiled probe artifacts
///
/// Created once by the agent's startup sequence and passed to every probe
/// backend it constructs. Each distinct `CompileOptions` is compiled at most
/// once; failures are remembered too.
pub struct CompilationContext {
    compiler: Box<dyn ProbeCompiler>,
    compiled: Mutex<HashMap<CompileOptions, CompileOutcome>>,
    compilations: AtomicUsize,
}

impl CompilationContext {
    pub fn new(compiler: Box<dyn ProbeCompiler>) -> Self {
        Self {
            compiler,
            compiled: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        }
    }

    /// Compile, or reuse the outcome of an earlier identical request
    pub fn compile(&self, opts: &CompileOptions) -> Result<Bytes> {
        let mut compiled = self.compiled.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = compiled.entry(*opts).or_insert_with(|| {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            self.compiler.compile(opts).map_err(|e| format!("{:#}", e))
        });
        outcome.clone().map_err(ConntrackError::Compilation)
    }

    /// Number of compilations actually run
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Resolve the artifact the probe backend should load
    pub fn select_artifact(
        &self,
        kernel: KernelVersion,
        policy: &GatePolicy,
        precompiled: Option<&Path>,
    ) -> Result<ProbeArtifact> {
        match probe_strategy(kernel, policy)? {
            ProbeStrategy::Precompiled => load_precompiled(precompiled),
            ProbeStrategy::RuntimeCompile => {
                let opts = CompileOptions {
                    kernel,
                    debug: policy.debug,
                };
                match self.compile(&opts) {
                    Ok(bytecode) => Ok(ProbeArtifact {
                        strategy: ProbeStrategy::RuntimeCompile,
                        bytecode,
                    }),
                    Err(e) if policy.allow_precompiled_fallback => {
                        warn!("{}; falling back to the precompiled probe", e);
                        load_precompiled(precompiled)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

fn load_precompiled(path: Option<&Path>) -> Result<ProbeArtifact> {
    let path = path.ok_or_else(|| ConntrackError::MissingArtifact("no precompiled_object configured".to_string()))?;
    let data = std::fs::read(path)
        .map_err(|e| ConntrackError::MissingArtifact(format!("{}: {}", path.display(), e)))?;
    info!("Using precompiled conntrack probe from {:?}", path);
    Ok(ProbeArtifact {
        strategy: ProbeStrategy::Precompiled,
        bytecode: Bytes::from(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct FakeCompiler {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ProbeCompiler for FakeCompiler {
        fn compile(&self, opts: &CompileOptions) -> anyhow::Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("clang not found");
            }
            Ok(Bytes::from(format!("probe-{}", opts.kernel)))
        }
    }

    fn context(fail: bool) -> (CompilationContext, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = CompilationContext::new(Box::new(FakeCompiler {
            calls: Arc::clone(&calls),
            fail,
        }));
        (ctx, calls)
    }

    fn policy(runtime: bool, fallback: bool) -> GatePolicy {
        GatePolicy {
            enable_runtime_compiler: runtime,
            allow_precompiled_fallback: fallback,
            precompiled_min_kernel: KernelVersion::new(4, 14, 0),
            debug: false,
        }
    }

    fn precompiled_file(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("conntrack-{}-{}.o", name, std::process::id()));
        std::fs::write(&path, b"precompiled").unwrap();
        path
    }

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(KernelVersion::parse("5.15.0-91-generic"), Some(KernelVersion::new(5, 15, 0)));
        assert_eq!(KernelVersion::parse("4.19.112+"), Some(KernelVersion::new(4, 19, 112)));
        assert_eq!(KernelVersion::parse("6.1"), Some(KernelVersion::new(6, 1, 0)));
        assert_eq!(KernelVersion::parse("garbage"), None);
        assert!(KernelVersion::new(4, 4, 255) < MINIMUM_PROBE_KERNEL);
        assert!(KernelVersion::new(4, 5, 0) >= MINIMUM_PROBE_KERNEL);
    }

    #[test]
    fn test_strategy() {
        let v = KernelVersion::new;
        assert!(matches!(
            probe_strategy(v(4, 4, 0), &policy(true, true)),
            Err(ConntrackError::UnsupportedKernel { .. })
        ));
        assert_eq!(probe_strategy(v(4, 9, 0), &policy(false, true)).unwrap(), ProbeStrategy::RuntimeCompile);
        assert_eq!(probe_strategy(v(5, 4, 0), &policy(false, true)).unwrap(), ProbeStrategy::Precompiled);
        assert_eq!(probe_strategy(v(5, 4, 0), &policy(true, false)).unwrap(), ProbeStrategy::RuntimeCompile);
    }

    #[test]
    fn test_compile_once() {
        let (ctx, calls) = context(false);
        let kernel = KernelVersion::new(5, 10, 0);

        let first = ctx.select_artifact(kernel, &policy(true, false), None).unwrap();
        let second = ctx.select_artifact(kernel, &policy(true, false), None).unwrap();

        assert_eq!(first.strategy, ProbeStrategy::RuntimeCompile);
        assert_eq!(first.bytecode, second.bytecode);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.compilations(), 1);

        let debug = GatePolicy { debug: true, ..policy(true, false) };
        ctx.select_artifact(kernel, &debug, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_without_fallback_is_fatal_and_cached() {
        let (ctx, calls) = context(true);
        let kernel = KernelVersion::new(5, 10, 0);

        for _ in 0..2 {
            let err = ctx.select_artifact(kernel, &policy(true, false), None).unwrap_err();
            assert!(matches!(err, ConntrackError::Compilation(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_falls_back_to_precompiled() {
        let (ctx, _) = context(true);
        let path = precompiled_file("fallback");

        let artifact = ctx
            .select_artifact(KernelVersion::new(5, 10, 0), &policy(true, true), Some(&path))
            .unwrap();
        assert_eq!(artifact.strategy, ProbeStrategy::Precompiled);
        assert_eq!(&artifact.bytecode[..], b"precompiled");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_precompiled_without_artifact() {
        let (ctx, calls) = context(false);
        let err = ctx
            .select_artifact(KernelVersion::new(5, 10, 0), &policy(false, true), None)
            .unwrap_err();
        assert!(matches!(err, ConntrackError::MissingArtifact(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_host_version() {
        let version = KernelVersion::host().unwrap();
        assert!(version.major >= 2);
    }
}
