//! Event processing from the probe's perf buffers
//!
//! Per-CPU readers decode `ConntrackEvent` records and push them into a
//! bounded queue. When the queue is full the newest update is dropped and
//! counted; the kernel producer is never blocked. A single consumer applies
//! queued updates to the cache.

use crate::conntracker::{ConntrackState, SWEEP_INTERVAL};
use crate::ebpf::loader::CounterSource;
use crate::ratelimit::Backoff;
use crate::types::kernel::ConntrackEvent;
use crate::types::ConntrackUpdate;
use anyhow::Result;
use aya::{
    maps::{
        perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer},
        MapData,
    },
    util::online_cpus,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;

/// Event buffers handed to each `read_events` call
const READ_BATCH: usize = 16;

/// Decode one perf record; `None` for short buffers and untracked entries
pub(crate) fn decode_event(buf: &[u8]) -> Option<ConntrackUpdate> {
    if buf.len() < std::mem::size_of::<ConntrackEvent>() {
        return None;
    }
    // SAFETY: length checked above; ConntrackEvent is repr(C) plain data
    let event = unsafe { (buf.as_ptr() as *const ConntrackEvent).read_unaligned() };
    ConntrackUpdate::from_event(&event)
}

/// Offer an update to the queue without waiting
///
/// Returns false once the consumer is gone.
pub(crate) fn enqueue(tx: &mpsc::Sender<ConntrackUpdate>, update: ConntrackUpdate, state: &ConntrackState) -> bool {
    match tx.try_send(update) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            state.drop_updates(1);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Outcome of one `read_records` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordBatch {
    /// Leading buffers filled with one record each
    pub read: usize,
    /// Records the kernel overwrote before they were read
    pub lost: usize,
}

/// One CPU's stream of probe records
///
/// Returns a boxed future so reader tasks can be spawned over any source.
pub trait RecordSource: Send + 'static {
    fn read_records<'a>(
        &'a mut self,
        buffers: &'a mut [BytesMut],
    ) -> Pin<Box<dyn Future<Output = Result<RecordBatch>> + Send + 'a>>;
}

impl RecordSource for AsyncPerfEventArrayBuffer<MapData> {
    fn read_records<'a>(
        &'a mut self,
        buffers: &'a mut [BytesMut],
    ) -> Pin<Box<dyn Future<Output = Result<RecordBatch>> + Send + 'a>> {
        Box::pin(async move {
            let events = self.read_events(buffers).await?;
            Ok(RecordBatch {
                read: events.read,
                lost: events.lost,
            })
        })
    }
}

/// Drain one CPU's records into the queue until cancelled
///
/// Read failures are counted, logged and retried with backoff.
pub(crate) async fn read_cpu<S: RecordSource>(
    cpu_id: u32,
    mut source: S,
    state: Arc<ConntrackState>,
    cancel: CancellationToken,
    tx: mpsc::Sender<ConntrackUpdate>,
) {
    let mut buffers = (0..READ_BATCH)
        .map(|_| BytesMut::with_capacity(std::mem::size_of::<ConntrackEvent>()))
        .collect::<Vec<_>>();
    let mut backoff = Backoff::default();

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => break,
            batch = source.read_records(&mut buffers) => batch,
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                state.transient_error();
                let delay = backoff.next_delay();
                warn!(
                    "Error reading conntrack events from CPU {}: {}; retrying in {:?}",
                    cpu_id, e, delay
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = sleep(delay) => continue,
                }
            }
        };
        if backoff.attempts() > 0 {
            info!("Conntrack event reader for CPU {} recovered", cpu_id);
            backoff.reset();
        }

        if batch.lost > 0 {
            debug!("CPU {} lost {} conntrack events", cpu_id, batch.lost);
            state.drop_updates(batch.lost as u64);
        }

        for record in buffers.iter().take(batch.read) {
            let Some(update) = decode_event(record) else {
                continue;
            };
            if !enqueue(&tx, update, &state) {
                return;
            }
        }
    }
    debug!("Conntrack event reader for CPU {} stopped", cpu_id);
}

/// Reads probe events and feeds the translation cache
pub struct EventProcessor {
    state: Arc<ConntrackState>,
    cancel: CancellationToken,
    sweep_interval: Duration,
}

impl EventProcessor {
    pub(crate) fn new(state: Arc<ConntrackState>, cancel: CancellationToken) -> Self {
        Self {
            state,
            cancel,
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Spawn one reader task per online CPU
    pub fn spawn_cpu_readers(
        &self,
        perf_array: &mut AsyncPerfEventArray<MapData>,
        tx: mpsc::Sender<ConntrackUpdate>,
    ) -> Result<()> {
        let cpus = online_cpus()?;
        info!("Spawning conntrack event readers for {} CPUs", cpus.len());

        for cpu_id in cpus {
            let buf = perf_array.open(cpu_id, None)?;
            tokio::spawn(read_cpu(
                cpu_id,
                buf,
                Arc::clone(&self.state),
                self.cancel.clone(),
                tx.clone(),
            ));
        }

        Ok(())
    }

    /// Apply queued updates until cancelled
    ///
    /// Also expires stale entries and refreshes the probe's counters every
    /// sweep interval.
    pub async fn run_consumer<C>(&self, mut rx: mpsc::Receiver<ConntrackUpdate>, counters: &C)
    where
        C: CounterSource + ?Sized,
    {
        let mut ticker = interval(self.sweep_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => {
                        self.state.apply(&update, Instant::now());
                        if !self.state.is_healthy() {
                            self.state.set_healthy(true);
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let removed = self.state.sweep(Instant::now());
                    if removed > 0 {
                        debug!("expired {} conntrack entries", removed);
                    }
                    if let Some(snapshot) = counters.read_counters() {
                        self.state.set_kernel_counters(snapshot);
                    }
                }
            }
        }

        info!("Conntrack event consumer stopped");
    }
}
