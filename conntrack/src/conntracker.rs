//! Conntracker facade
//!
//! One capability set, `Conntracker`, implemented by the netlink backend, the
//! probe backend and a no-op backend. The backend is picked once by
//! `new_conntracker` from the configuration.

use crate::cache::TranslationCache;
use crate::config::{BackendKind, Config};
use crate::ebpf::EbpfConntracker;
use crate::error::{ConntrackError, Result};
use crate::netlink::NetlinkConntracker;
use crate::ratelimit::RateLimiter;
use crate::runtime::CompilationContext;
use crate::types::{ConnectionStats, ConnectionTuple, ConntrackEntry, ConntrackUpdate, IPTranslation, UpdateKind};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How often background tasks drop expired cache entries
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// NAT translation lookups for the flow tracker
///
/// Lookups never touch the kernel; they are served from a cache the backend
/// refreshes in the background.
pub trait Conntracker: Send + Sync {
    /// Post-NAT addressing of `conn`, `None` on a miss or after `close`
    fn get_translation_for_conn(&self, conn: &ConnectionStats) -> Option<IPTranslation>;

    /// Whether a tracked NAT entry has `tuple` as its origin or reply leg
    ///
    /// Answered from the cache, which only holds NAT entries, so plain
    /// connections report `false`. `netlink::Conntrack::exists` asks the
    /// kernel about any entry.
    ///
    /// Fails with `ConntrackError::Transport` while the backend cannot
    /// refresh from the kernel. Returns `Ok(false)` after `close`.
    fn exists(&self, tuple: &ConnectionTuple) -> Result<bool>;

    /// Stop background work and release kernel resources
    ///
    /// Idempotent. Returns once the background task has terminated.
    fn close(&self) -> Result<()>;

    /// Snapshot of cache and refresh counters
    fn diagnostics(&self) -> Diagnostics;
}

/// Build the backend selected by `cfg.backend`
///
/// # Errors
///
/// Construction failures are fatal: socket or probe setup errors, an
/// unsupported kernel, or a failed compilation without allowed fallback.
pub fn new_conntracker(cfg: &Config, compilation: &CompilationContext) -> Result<Box<dyn Conntracker>> {
    cfg.validate()?;

    let tracker: Box<dyn Conntracker> = match cfg.backend {
        BackendKind::Netlink => Box::new(NetlinkConntracker::new(cfg)?),
        BackendKind::Ebpf => Box::new(EbpfConntracker::new(cfg, compilation)?),
        BackendKind::Disabled => Box::new(NoopConntracker::default()),
    };
    info!("Conntracker ready (backend: {})", tracker.diagnostics().backend);
    Ok(tracker)
}

/// Backend that never resolves anything
#[derive(Debug, Default)]
pub struct NoopConntracker {
    closed: AtomicBool,
}

impl Conntracker for NoopConntracker {
    fn get_translation_for_conn(&self, _conn: &ConnectionStats) -> Option<IPTranslation> {
        None
    }

    fn exists(&self, _tuple: &ConnectionTuple) -> Result<bool> {
        Ok(false)
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            backend: "disabled".to_string(),
            collected_at: chrono::Utc::now().to_rfc3339(),
            healthy: true,
            closed: self.closed.load(Ordering::Acquire),
            ..Diagnostics::default()
        }
    }
}

/// Point-in-time view of a backend
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub backend: String,
    /// RFC 3339 time the snapshot was taken
    pub collected_at: String,
    /// False while the refresh channel is failing
    pub healthy: bool,
    pub closed: bool,
    pub cache_size: usize,
    pub max_entries: usize,
    /// Updates discarded by the rate limiter, a full queue or the kernel
    pub dropped_updates: u64,
    pub evictions: u64,
    pub registered: u64,
    pub unregistered: u64,
    pub transient_errors: u64,
    pub lookups: u64,
    pub hits: u64,
    /// Counters reported by the kernel probe, if any
    pub kernel_counters: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub(crate) struct BackendStats {
    registered: AtomicU64,
    unregistered: AtomicU64,
    dropped_updates: AtomicU64,
    transient_errors: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
}

/// Cache plus refresh bookkeeping shared by a backend and its worker
pub(crate) struct ConntrackState {
    backend: &'static str,
    cache: TranslationCache,
    stats: BackendStats,
    limiter: Mutex<RateLimiter>,
    healthy: AtomicBool,
    closed: AtomicBool,
    kernel_counters: Mutex<BTreeMap<String, u64>>,
}

impl ConntrackState {
    pub(crate) fn new(backend: &'static str, cfg: &Config) -> Self {
        Self {
            backend,
            cache: TranslationCache::new(
                cfg.conntrack_max_state_size,
                cfg.retention(),
                cfg.enable_conntrack_all_namespaces,
            ),
            stats: BackendStats::default(),
            limiter: Mutex::new(RateLimiter::new(cfg.conntrack_rate_limit, Instant::now())),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            kernel_counters: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record an entry found by a table dump, bypassing the rate limit
    pub(crate) fn seed(&self, entry: &ConntrackEntry, now: Instant) -> bool {
        let cached = self.cache.register(entry, now);
        if cached {
            self.stats.registered.fetch_add(1, Ordering::Relaxed);
        }
        cached
    }

    /// Apply one kernel notification, unless the rate limiter rejects it
    pub(crate) fn apply(&self, update: &ConntrackUpdate, now: Instant) -> bool {
        let admitted = self.limiter.lock().unwrap_or_else(|e| e.into_inner()).allow(now);
        if !admitted {
            let dropped = self.stats.dropped_updates.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!("conntrack update rate limit reached, {} updates dropped so far", dropped);
            }
            return false;
        }

        match update.kind {
            UpdateKind::New | UpdateKind::Update => {
                self.seed(&update.entry, now);
            }
            UpdateKind::Destroy => {
                if self.cache.unregister(&update.entry) > 0 {
                    self.stats.unregistered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        true
    }

    /// Count updates lost before reaching the cache
    pub(crate) fn drop_updates(&self, count: u64) {
        if count > 0 {
            self.stats.dropped_updates.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Count a refresh failure and mark the backend unhealthy
    pub(crate) fn transient_error(&self) {
        self.stats.transient_errors.fetch_add(1, Ordering::Relaxed);
        self.healthy.store(false, Ordering::Release);
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Mark closed and drop cached state; true on the first call only
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.cache.clear();
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn sweep(&self, now: Instant) -> usize {
        self.cache.sweep(now)
    }

    pub(crate) fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn max_entries(&self) -> usize {
        self.cache.max_entries()
    }

    pub(crate) fn set_kernel_counters(&self, counters: BTreeMap<String, u64>) {
        *self.kernel_counters.lock().unwrap_or_else(|e| e.into_inner()) = counters;
    }

    pub(crate) fn lookup(&self, conn: &ConnectionStats) -> Option<IPTranslation> {
        if self.is_closed() {
            return None;
        }
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        let translation = self
            .cache
            .get(conn.tuple.netns, &conn.tuple.flow_key(), Instant::now());
        if translation.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        }
        translation
    }

    pub(crate) fn exists(&self, tuple: &ConnectionTuple) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        if !self.is_healthy() {
            return Err(ConntrackError::Transport(format!(
                "{} refresh channel is failing",
                self.backend
            )));
        }
        Ok(self.cache.contains(tuple.netns, &tuple.flow_key(), Instant::now()))
    }

    pub(crate) fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            backend: self.backend.to_string(),
            collected_at: chrono::Utc::now().to_rfc3339(),
            healthy: self.is_healthy(),
            closed: self.is_closed(),
            cache_size: self.cache.len(),
            max_entries: self.cache.max_entries(),
            dropped_updates: self.stats.dropped_updates.load(Ordering::Relaxed),
            evictions: self.cache.evictions(),
            registered: self.stats.registered.load(Ordering::Relaxed),
            unregistered: self.stats.unregistered.load(Ordering::Relaxed),
            transient_errors: self.stats.transient_errors.load(Ordering::Relaxed),
            lookups: self.stats.lookups.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            kernel_counters: self
                .kernel_counters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}
