//! Netlink-backed conntracker
//!
//! Seeds the translation cache from a full table dump, then follows the
//! ctnetlink event groups on a dedicated thread. Read failures are retried
//! with backoff while the cache keeps serving what it has.

use super::conntrack::Conntrack;
use super::message::{
    self, MessageIter, Parsed, NF_NETLINK_CONNTRACK_DESTROY, NF_NETLINK_CONNTRACK_NEW, NF_NETLINK_CONNTRACK_UPDATE,
};
use super::socket::NetlinkSocket;
use crate::config::Config;
use crate::conntracker::{Conntracker, ConntrackState, Diagnostics, SWEEP_INTERVAL};
use crate::error::{ConntrackError, Result};
use crate::ratelimit::Backoff;
use crate::types::{ConnectionFamily, ConnectionStats, ConnectionTuple, ConntrackUpdate, IPTranslation};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Longest a blocked receive delays a stop request
const POLL_INTERVAL: Duration = Duration::from_millis(200);

const EVENT_BUFFER_LEN: usize = 64 * 1024;

const EVENT_GROUPS: u32 = NF_NETLINK_CONNTRACK_NEW | NF_NETLINK_CONNTRACK_UPDATE | NF_NETLINK_CONNTRACK_DESTROY;

/// Fill `state` from a table dump of both address families
///
/// Stops once the cache is full. Running out of time keeps what was loaded
/// and is only logged; socket failures are returned.
pub(crate) fn populate(ct: &mut Conntrack, state: &ConntrackState, deadline: Instant) -> Result<usize> {
    let mut seeded = 0;

    for family in [ConnectionFamily::V4, ConnectionFamily::V6] {
        if state.cache_len() >= state.max_entries() {
            break;
        }
        let result = ct.dump(family, deadline, |entry| {
            if state.seed(&entry, Instant::now()) {
                seeded += 1;
            }
            state.cache_len() < state.max_entries()
        });
        match result {
            Ok(visited) => debug!("conntrack dump ({:?}, namespace {}): {} entries visited", family, ct.netns(), visited),
            Err(ConntrackError::Transport(reason)) => {
                warn!("conntrack dump of namespace {} incomplete: {}", ct.netns(), reason);
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(seeded)
}

/// Namespaces a full table load covers
#[derive(Debug, Clone)]
pub(crate) struct DumpScope {
    self_ns: PathBuf,
    proc_root: PathBuf,
    all_namespaces: bool,
    timeout: Duration,
}

impl DumpScope {
    pub(crate) fn from_config(cfg: &Config) -> Self {
        Self {
            self_ns: cfg.self_netns_path(),
            proc_root: cfg.proc_root.clone(),
            all_namespaces: cfg.enable_conntrack_all_namespaces,
            timeout: cfg.init_timeout(),
        }
    }

    /// Load the namespace behind `ct`, then every other namespace found
    /// under procfs when all namespaces are tracked
    ///
    /// Only failures on `ct` are returned; peer namespaces that cannot be
    /// entered or dumped are skipped with a warning. The timeout bounds the
    /// whole load.
    pub(crate) fn load(&self, ct: &mut Conntrack, state: &ConntrackState) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut seeded = populate(ct, state, deadline)?;
        if !self.all_namespaces {
            return Ok(seeded);
        }

        let namespaces = match super::list_namespaces(&self.proc_root) {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!("listing namespaces under {}: {}", self.proc_root.display(), e);
                return Ok(seeded);
            }
        };

        for (inode, path) in namespaces.iter().filter(|(inode, _)| *inode != ct.netns()) {
            if state.cache_len() >= state.max_entries() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("conntrack load timed out, namespaces left unloaded");
                break;
            }
            match Conntrack::new(Some(path.as_path()), &self.self_ns).and_then(|mut peer| populate(&mut peer, state, deadline)) {
                Ok(count) => {
                    debug!("loaded {} NAT entries from namespace {}", count, inode);
                    seeded += count;
                }
                Err(e) => warn!("skipping namespace {} ({}): {}", inode, path.display(), e),
            }
        }

        Ok(seeded)
    }

    /// Open a handle on the own namespace and load
    pub(crate) fn reload(&self, state: &ConntrackState) -> Result<usize> {
        let mut ct = Conntrack::new(None, &self.self_ns)?;
        self.load(&mut ct, state)
    }
}

/// Tag for entries reported from a peer namespace
///
/// Peer namespaces are only known by their nsid, which lives in a different
/// number space than inodes; the tag keeps them apart from local entries.
fn peer_namespace_tag(nsid: i32) -> u32 {
    u32::MAX - nsid as u32
}

/// Event subscription plus what is needed to rebuild it
struct EventStream {
    socket: NetlinkSocket,
    netns: u32,
    all_namespaces: bool,
    buf: Vec<u8>,
}

impl EventStream {
    fn open(netns: u32, all_namespaces: bool) -> Result<Self> {
        Ok(Self::with_socket(Self::subscribe(all_namespaces)?, netns, all_namespaces))
    }

    fn with_socket(socket: NetlinkSocket, netns: u32, all_namespaces: bool) -> Self {
        Self {
            socket,
            netns,
            all_namespaces,
            buf: vec![0u8; EVENT_BUFFER_LEN],
        }
    }

    fn subscribe(all_namespaces: bool) -> Result<NetlinkSocket> {
        let socket = NetlinkSocket::open(EVENT_GROUPS, POLL_INTERVAL)?;
        if all_namespaces {
            socket.listen_all_nsid()?;
        }
        Ok(socket)
    }

    fn reconnect(&mut self) -> Result<()> {
        self.socket = Self::subscribe(self.all_namespaces)?;
        Ok(())
    }

    /// Read one datagram and apply its updates; `Ok` on timeout too
    fn poll(&mut self, state: &ConntrackState) -> Result<usize> {
        let Some(received) = self.socket.recv(&mut self.buf)? else {
            return Ok(0);
        };
        let netns = match received.nsid {
            Some(nsid) if nsid >= 0 => peer_namespace_tag(nsid),
            _ => self.netns,
        };

        let now = Instant::now();
        let mut applied = 0;
        for msg in MessageIter::new(&self.buf[..received.len]) {
            match message::parse(&msg?, netns)? {
                Parsed::Entry { kind, entry } => {
                    if state.apply(&ConntrackUpdate { kind, entry }, now) {
                        applied += 1;
                    }
                }
                Parsed::Overrun => {
                    return Err(ConntrackError::Transport("netlink overrun".to_string()));
                }
                Parsed::Ack(errno) if errno != 0 => {
                    debug!("unexpected netlink error on event socket: {}", errno);
                }
                _ => {}
            }
        }
        Ok(applied)
    }
}

/// Settings the refresh thread needs after construction
struct Worker {
    state: Arc<ConntrackState>,
    stop: Arc<AtomicBool>,
    events: EventStream,
    scope: DumpScope,
    sweep_interval: Duration,
}

impl Worker {
    fn run(mut self) {
        let mut backoff = Backoff::default();
        let mut last_sweep = Instant::now();

        while !self.stop.load(Ordering::Acquire) {
            match self.events.poll(&self.state) {
                Ok(_) => {
                    if backoff.attempts() > 0 {
                        info!("conntrack event stream recovered after {} attempts", backoff.attempts());
                        backoff.reset();
                        self.state.set_healthy(true);
                    }
                }
                Err(e) => {
                    self.state.transient_error();
                    let delay = backoff.next_delay();
                    if e.raw_os_error() == Some(libc::ENOBUFS) {
                        warn!("conntrack events lost (receive buffer overrun), resyncing in {:?}", delay);
                    } else {
                        warn!("conntrack event stream failed: {}; retrying in {:?}", e, delay);
                    }
                    if !self.sleep(delay) {
                        break;
                    }
                    self.recover();
                }
            }

            let now = Instant::now();
            if now.duration_since(last_sweep) >= self.sweep_interval {
                let removed = self.state.sweep(now);
                if removed > 0 {
                    debug!("expired {} conntrack entries", removed);
                }
                last_sweep = now;
            }
        }

        info!("conntrack netlink worker stopped");
    }

    /// Rebuild the subscription and reload what was missed
    fn recover(&mut self) {
        if let Err(e) = self.events.reconnect() {
            warn!("conntrack event socket reconnect failed: {}", e);
            return;
        }
        match self.scope.reload(&self.state) {
            Ok(seeded) => debug!("conntrack resync loaded {} NAT entries", seeded),
            Err(e) => warn!("conntrack resync failed: {}", e),
        }
    }

    /// Sleep in short steps; false when asked to stop
    fn sleep(&self, total: Duration) -> bool {
        let until = Instant::now() + total;
        while Instant::now() < until {
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL.min(until.saturating_duration_since(Instant::now())));
        }
        !self.stop.load(Ordering::Acquire)
    }
}

/// Conntracker fed by ctnetlink
pub struct NetlinkConntracker {
    state: Arc<ConntrackState>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetlinkConntracker {
    /// Subscribe to conntrack events, load the current table, start the worker
    ///
    /// The subscription is opened before the dump so nothing created in
    /// between is missed.
    pub fn new(cfg: &Config) -> Result<Self> {
        let state = Arc::new(ConntrackState::new("netlink", cfg));
        let scope = DumpScope::from_config(cfg);

        let mut ct = Conntrack::new(None, &cfg.self_netns_path())?;
        let events = EventStream::open(ct.netns(), cfg.enable_conntrack_all_namespaces)?;

        let started = Instant::now();
        let seeded = scope.load(&mut ct, &state)?;
        info!(
            "Loaded {} NAT conntrack entries in {:?} (namespace {})",
            seeded,
            started.elapsed(),
            ct.netns()
        );
        drop(ct);

        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            events,
            scope,
            sweep_interval: SWEEP_INTERVAL,
        };
        let handle = std::thread::Builder::new()
            .name("conntrack-netlink".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            state,
            stop,
            worker: Mutex::new(Some(handle)),
        })
    }
}

impl Conntracker for NetlinkConntracker {
    fn get_translation_for_conn(&self, conn: &ConnectionStats) -> Option<IPTranslation> {
        self.state.lookup(conn)
    }

    fn exists(&self, tuple: &ConnectionTuple) -> Result<bool> {
        self.state.exists(tuple)
    }

    fn close(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = worker.take() {
            handle
                .join()
                .map_err(|_| ConntrackError::Transport("netlink worker panicked".to_string()))?;
            info!("Netlink conntracker closed");
        }
        self.state.mark_closed();
        Ok(())
    }

    fn diagnostics(&self) -> Diagnostics {
        self.state.diagnostics()
    }
}

impl Drop for NetlinkConntracker {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing netlink conntracker: {}", e);
        }
    }
}
