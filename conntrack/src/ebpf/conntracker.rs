//! Probe-backed conntracker
//!
//! The probe, its perf readers and the cache consumer live on a dedicated
//! thread running a single-threaded tokio runtime. Construction waits until
//! the probe is attached; `close` cancels the token and joins the thread,
//! which detaches the probe.

use super::events::EventProcessor;
use super::loader::ProbeLoader;
use crate::config::Config;
use crate::conntracker::{Conntracker, ConntrackState, Diagnostics};
use crate::error::{ConntrackError, Result};
use crate::netlink::conntracker::DumpScope;
use crate::runtime::{CompilationContext, GatePolicy, KernelVersion, ProbeArtifact};
use crate::types::{ConnectionStats, ConnectionTuple, IPTranslation};
use anyhow::Context;
use log::{info, warn};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Extra time granted on top of the init timeout for loading and attaching
const ATTACH_GRACE: Duration = Duration::from_secs(30);

/// Conntracker fed by the conntrack tracing probe
pub struct EbpfConntracker {
    state: Arc<ConntrackState>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EbpfConntracker {
    /// Select the probe artifact, attach it and start consuming events
    ///
    /// # Errors
    ///
    /// `UnsupportedKernel`, `Compilation` and `MissingArtifact` come from the
    /// compilation gate; `Probe` when loading or attaching fails.
    pub fn new(cfg: &Config, compilation: &CompilationContext) -> Result<Self> {
        let kernel = KernelVersion::host()?;
        let artifact = compilation.select_artifact(
            kernel,
            &GatePolicy::from(cfg),
            cfg.precompiled_object.as_deref(),
        )?;
        info!(
            "Using {:?} conntrack probe on kernel {}",
            artifact.strategy, kernel
        );

        let state = Arc::new(ConntrackState::new("ebpf", cfg));
        let cancel = CancellationToken::new();
        let (ready_tx, ready_rx) = sync_channel(1);
        let worker_state = Arc::clone(&state);
        let worker_cancel = cancel.clone();
        let queue_size = cfg.event_queue_size;

        let handle = std::thread::Builder::new()
            .name("conntrack-probe".to_string())
            .spawn(move || run(artifact, worker_state, worker_cancel, queue_size, ready_tx))?;

        let tracker = Self {
            state,
            cancel,
            worker: Mutex::new(Some(handle)),
        };

        match ready_rx.recv_timeout(cfg.init_timeout() + ATTACH_GRACE) {
            Ok(Ok(())) => {
                // Entries created before the probe attached are only visible via
                // netlink; dumping them also runs the fill_info kprobe
                match DumpScope::from_config(cfg).reload(&tracker.state) {
                    Ok(seeded) => info!("Loaded {} existing NAT conntrack entries", seeded),
                    Err(e) => warn!("Initial conntrack dump failed, relying on probe events: {}", e),
                }
                Ok(tracker)
            }
            Ok(Err(e)) => {
                tracker.close()?;
                Err(ConntrackError::Probe(e))
            }
            Err(RecvTimeoutError::Timeout) => {
                tracker.close()?;
                Err(ConntrackError::Probe(anyhow::anyhow!("conntrack probe did not attach in time")))
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracker.close()?;
                Err(ConntrackError::Probe(anyhow::anyhow!("conntrack probe thread exited during setup")))
            }
        }
    }
}

/// Body of the probe thread
fn run(
    artifact: ProbeArtifact,
    state: Arc<ConntrackState>,
    cancel: CancellationToken,
    queue_size: usize,
    ready: SyncSender<anyhow::Result<()>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build probe runtime")
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    runtime.block_on(async move {
        let processor = EventProcessor::new(state, cancel);
        let (tx, rx) = mpsc::channel(queue_size);

        let setup = (|| -> anyhow::Result<ProbeLoader> {
            let mut loader = ProbeLoader::load(&artifact.bytecode)?;
            loader.attach_kprobes()?;
            let mut perf_array = loader.get_perf_array()?;
            processor.spawn_cpu_readers(&mut perf_array, tx)?;
            Ok(loader)
        })();

        let loader = match setup {
            Ok(loader) => loader,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        processor.run_consumer(rx, &loader).await;
    });
    // Dropping the runtime ends the reader tasks; the loader was dropped
    // with the future, detaching the probe.
    info!("Conntrack probe detached");
}

impl Conntracker for EbpfConntracker {
    fn get_translation_for_conn(&self, conn: &ConnectionStats) -> Option<IPTranslation> {
        self.state.lookup(conn)
    }

    fn exists(&self, tuple: &ConnectionTuple) -> Result<bool> {
        self.state.exists(tuple)
    }

    fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            handle
                .join()
                .map_err(|_| ConntrackError::Transport("probe worker panicked".to_string()))?;
            info!("eBPF conntracker closed");
        }
        self.state.mark_closed();
        Ok(())
    }

    fn diagnostics(&self) -> Diagnostics {
        self.state.diagnostics()
    }
}

impl Drop for EbpfConntracker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing eBPF conntracker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{CompileOptions, ProbeCompiler};
    use bytes::Bytes;

    struct GarbageCompiler;

    impl ProbeCompiler for GarbageCompiler {
        fn compile(&self, _opts: &CompileOptions) -> anyhow::Result<Bytes> {
            Ok(Bytes::from_static(b"not an elf object"))
        }
    }

    #[test]
    fn test_bad_artifact_fails_construction() {
        let cfg = Config {
            enable_runtime_compiler: true,
            allow_precompiled_fallback: false,
            conntrack_init_timeout_secs: 1,
            ..Config::default()
        };
        let ctx = CompilationContext::new(Box::new(GarbageCompiler));

        match EbpfConntracker::new(&cfg, &ctx) {
            Err(ConntrackError::Probe(_)) | Err(ConntrackError::UnsupportedKernel { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("garbage bytecode must not load"),
        }
    }
}
