//! NAT translation cache
//!
//! Maps (namespace, conntrack leg) to the translation advertised by the
//! opposite leg. Bounded in size with oldest-first eviction and a retention
//! window after which entries stop being served.

use crate::types::{ConntrackEntry, FlowKey, IPTranslation};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Namespace-scoped cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub netns: u32,
    pub flow: FlowKey,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    translation: IPTranslation,
    last_seen: Instant,
    /// Conntrack entry this leg belongs to
    seq: u64,
}

/// Both legs of one conntrack entry, inserted and evicted together
#[derive(Debug, Clone, Copy)]
struct EntryLegs {
    netns: u32,
    origin: FlowKey,
    reply: FlowKey,
    last_seen: Instant,
}

impl EntryLegs {
    fn keys(&self) -> [CacheKey; 2] {
        [
            CacheKey {
                netns: self.netns,
                flow: self.origin,
            },
            CacheKey {
                netns: self.netns,
                flow: self.reply,
            },
        ]
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Conntrack entries in refresh order, oldest first
    order: BTreeMap<u64, EntryLegs>,
    /// Namespaces holding each leg, in insertion order
    by_flow: HashMap<FlowKey, Vec<u32>>,
    next_seq: u64,
    evictions: u64,
}

impl CacheState {
    fn remove_leg(&mut self, key: &CacheKey, seq: u64) -> bool {
        if self.entries.get(key).map(|entry| entry.seq) != Some(seq) {
            return false;
        }
        self.entries.remove(key);
        if let Some(namespaces) = self.by_flow.get_mut(&key.flow) {
            namespaces.retain(|ns| *ns != key.netns);
            if namespaces.is_empty() {
                self.by_flow.remove(&key.flow);
            }
        }
        true
    }

    /// Remove both legs of the entry at `seq`, returns the legs removed
    fn remove_entry(&mut self, seq: u64) -> usize {
        let Some(legs) = self.order.remove(&seq) else {
            return 0;
        };
        legs.keys()
            .iter()
            .filter(|key| self.remove_leg(key, seq))
            .count()
    }

    /// Remove whichever entry currently owns `key`
    fn remove_owner(&mut self, key: &CacheKey) -> usize {
        match self.entries.get(key).map(|entry| entry.seq) {
            Some(seq) => self.remove_entry(seq),
            None => 0,
        }
    }

    fn insert(&mut self, legs: EntryLegs, translations: [IPTranslation; 2], max_entries: usize) {
        let keys = legs.keys();
        // A repeat observation replaces the previous legs instead of adding to them
        for key in &keys {
            self.remove_owner(key);
        }

        while self.entries.len() + keys.len() > max_entries {
            let Some(oldest) = self.order.first_key_value().map(|(seq, _)| *seq) else {
                break;
            };
            self.evictions += self.remove_entry(oldest) as u64;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        for (key, translation) in keys.into_iter().zip(translations) {
            self.entries.insert(
                key,
                CacheEntry {
                    translation,
                    last_seen: legs.last_seen,
                    seq,
                },
            );
            self.by_flow.entry(key.flow).or_default().push(key.netns);
        }
        self.order.insert(seq, legs);
    }
}

/// Translation cache shared between one refresh task and many readers
#[derive(Debug)]
pub struct TranslationCache {
    state: RwLock<CacheState>,
    max_entries: usize,
    retention: Duration,
    cross_namespace: bool,
}

impl TranslationCache {
    /// Create an empty cache
    ///
    /// # Arguments
    ///
    /// * `max_entries` - Hard bound on the number of cached legs (at least 2)
    /// * `retention` - Age after which an entry is no longer served
    /// * `cross_namespace` - Fall back to any namespace on a scoped miss
    pub fn new(max_entries: usize, retention: Duration, cross_namespace: bool) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_entries: max_entries.max(2),
            retention,
            cross_namespace,
        }
    }

    /// Record a conntrack entry, both legs
    ///
    /// Entries without NAT are ignored. Returns whether anything was cached.
    /// When the cache is full the oldest entries are evicted, both legs at
    /// once, before inserting.
    pub fn register(&self, entry: &ConntrackEntry, now: Instant) -> bool {
        if !entry.is_nat() || entry.origin == entry.reply {
            return false;
        }

        let legs = EntryLegs {
            netns: entry.netns,
            origin: entry.origin,
            reply: entry.reply,
            last_seen: now,
        };
        let translations = [
            IPTranslation::from_leg(&entry.reply),
            IPTranslation::from_leg(&entry.origin),
        ];
        self.write().insert(legs, translations, self.max_entries);
        true
    }

    /// Forget a conntrack entry
    ///
    /// A destroy for an entry that was never seen is a no-op. Returns the
    /// number of legs removed.
    pub fn unregister(&self, entry: &ConntrackEntry) -> usize {
        let mut state = self.write();
        [entry.origin, entry.reply]
            .iter()
            .map(|flow| {
                state.remove_owner(&CacheKey {
                    netns: entry.netns,
                    flow: *flow,
                })
            })
            .sum()
    }

    /// Translation for a leg observed in `netns`
    ///
    /// Expired entries are never served. With cross-namespace matching the
    /// first namespace holding the leg wins when the scoped lookup misses.
    pub fn get(&self, netns: u32, flow: &FlowKey, now: Instant) -> Option<IPTranslation> {
        let state = self.read();
        let fresh = |key: &CacheKey| {
            state
                .entries
                .get(key)
                .filter(|entry| !self.is_stale(entry, now))
                .map(|entry| entry.translation)
        };

        if let Some(translation) = fresh(&CacheKey { netns, flow: *flow }) {
            return Some(translation);
        }
        if !self.cross_namespace {
            return None;
        }

        state
            .by_flow
            .get(flow)?
            .iter()
            .find_map(|ns| fresh(&CacheKey { netns: *ns, flow: *flow }))
    }

    /// Whether a leg is currently tracked
    pub fn contains(&self, netns: u32, flow: &FlowKey, now: Instant) -> bool {
        self.get(netns, flow, now).is_some()
    }

    /// Drop entries older than the retention window, returns how many
    pub fn sweep(&self, now: Instant) -> usize {
        let mut state = self.write();
        let mut removed = 0;
        while let Some((seq, legs)) = state.order.first_key_value().map(|(seq, legs)| (*seq, *legs)) {
            if now.saturating_duration_since(legs.last_seen) <= self.retention {
                break;
            }
            removed += state.remove_entry(seq);
        }
        removed
    }

    pub fn clear(&self) {
        *self.write() = CacheState::default();
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries evicted to honor the size bound
    pub fn evictions(&self) -> u64 {
        self.read().evictions
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn is_stale(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_seen) > self.retention
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionType;
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    /// 10.0.0.1:<sport> -> 10.96.0.10:80 rewritten to 172.17.0.2:8080
    fn nat_entry(sport: u16, netns: u32) -> ConntrackEntry {
        let origin = FlowKey {
            src_ip: ip("10.0.0.1"),
            src_port: sport,
            dst_ip: ip("10.96.0.10"),
            dst_port: 80,
            protocol: ConnectionType::Tcp,
        };
        let reply = FlowKey {
            src_ip: ip("172.17.0.2"),
            src_port: 8080,
            dst_ip: ip("10.0.0.1"),
            dst_port: sport,
            protocol: ConnectionType::Tcp,
        };
        ConntrackEntry { origin, reply, netns }
    }

    fn cache(max: usize) -> TranslationCache {
        TranslationCache::new(max, Duration::from_secs(60), false)
    }

    #[test]
    fn test_register_both_legs() {
        let c = cache(100);
        let now = Instant::now();
        let entry = nat_entry(40000, 1);
        assert!(c.register(&entry, now));
        assert_eq!(c.len(), 2);

        let forward = c.get(1, &entry.origin, now).unwrap();
        assert_eq!(forward.repl_src_ip, ip("172.17.0.2"));
        assert_eq!(forward.repl_src_port, 8080);

        let backward = c.get(1, &entry.reply, now).unwrap();
        assert_eq!(backward.repl_src_ip, ip("10.0.0.1"));
        assert_eq!(backward.repl_dst_ip, ip("10.96.0.10"));
    }

    #[test]
    fn test_non_nat_entries_are_skipped() {
        let c = cache(100);
        let mut entry = nat_entry(40000, 1);
        entry.reply = entry.origin.inverted();
        assert!(!c.register(&entry, Instant::now()));
        assert!(c.is_empty());
    }

    #[test]
    fn test_repeat_observation_keeps_one_entry_per_key() {
        let c = cache(100);
        let now = Instant::now();
        let entry = nat_entry(40000, 1);
        c.register(&entry, now);
        c.register(&entry, now + Duration::from_secs(1));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_namespace_scoping() {
        let c = cache(100);
        let now = Instant::now();
        let entry = nat_entry(40000, 1);
        c.register(&entry, now);

        assert!(c.get(1, &entry.origin, now).is_some());
        assert!(c.get(2, &entry.origin, now).is_none());
    }

    #[test]
    fn test_cross_namespace_lookup() {
        let c = TranslationCache::new(100, Duration::from_secs(60), true);
        let now = Instant::now();
        let entry = nat_entry(40000, 7);
        c.register(&entry, now);

        let trans = c.get(1, &entry.origin, now).unwrap();
        assert_eq!(trans.repl_src_ip, ip("172.17.0.2"));

        c.unregister(&entry);
        assert!(c.get(1, &entry.origin, now).is_none());
    }

    #[test]
    fn test_eviction_is_oldest_first_and_bounded() {
        let c = cache(4);
        let start = Instant::now();
        for i in 0..10u16 {
            c.register(&nat_entry(40000 + i, 1), start + Duration::from_millis(u64::from(i)));
            assert!(c.len() <= 4);
        }
        assert_eq!(c.len(), 4);
        assert_eq!(c.evictions(), 16);

        let now = start + Duration::from_millis(10);
        assert!(c.get(1, &nat_entry(40000, 1).origin, now).is_none());
        assert!(c.get(1, &nat_entry(40009, 1).origin, now).is_some());
        assert!(c.get(1, &nat_entry(40008, 1).reply, now).is_some());
    }

    #[test]
    fn test_smallest_bound_keeps_both_legs() {
        let c = cache(1);
        let now = Instant::now();
        let entry = nat_entry(40000, 1);
        c.register(&entry, now);

        assert_eq!(c.max_entries(), 2);
        assert_eq!(c.len(), 2);
        assert_eq!(c.evictions(), 0);
        assert!(c.get(1, &entry.origin, now).is_some());
        assert!(c.get(1, &entry.reply, now).is_some());
    }

    #[test]
    fn test_odd_bound_leaves_no_orphan_leg() {
        let c = cache(3);
        let now = Instant::now();
        let a = nat_entry(40000, 1);
        let b = nat_entry(40001, 1);
        c.register(&a, now);
        c.register(&b, now);

        assert!(c.get(1, &a.origin, now).is_none());
        assert!(c.get(1, &a.reply, now).is_none());
        assert!(c.get(1, &b.origin, now).is_some());
        assert!(c.get(1, &b.reply, now).is_some());
        assert_eq!(c.len(), 2);
        assert_eq!(c.evictions(), 2);
    }

    #[test]
    fn test_refresh_protects_from_eviction() {
        let c = cache(4);
        let now = Instant::now();
        let first = nat_entry(40000, 1);
        c.register(&first, now);
        c.register(&nat_entry(40001, 1), now);
        // Refresh the first entry, making the second one the oldest
        c.register(&first, now);
        c.register(&nat_entry(40002, 1), now);

        assert!(c.get(1, &first.origin, now).is_some());
        assert!(c.get(1, &nat_entry(40001, 1).origin, now).is_none());
    }

    #[test]
    fn test_destroy_before_create_is_noop() {
        let c = cache(100);
        let entry = nat_entry(40000, 1);
        assert_eq!(c.unregister(&entry), 0);
        assert!(c.is_empty());

        c.register(&entry, Instant::now());
        assert_eq!(c.unregister(&entry), 2);
        assert!(c.is_empty());
    }

    #[test]
    fn test_expired_entries_are_not_served_or_resurrected() {
        let c = TranslationCache::new(100, Duration::from_secs(10), false);
        let start = Instant::now();
        let entry = nat_entry(40000, 1);
        c.register(&entry, start);

        let boundary = start + Duration::from_secs(10);
        assert!(c.get(1, &entry.origin, boundary).is_some());

        let later = start + Duration::from_secs(11);
        assert!(c.get(1, &entry.origin, later).is_none());
        assert_eq!(c.sweep(later), 2);
        assert!(c.get(1, &entry.origin, later).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn test_sweep_keeps_fresh_entries() {
        let c = TranslationCache::new(100, Duration::from_secs(10), false);
        let start = Instant::now();
        c.register(&nat_entry(40000, 1), start);
        c.register(&nat_entry(40001, 1), start + Duration::from_secs(5));

        assert_eq!(c.sweep(start + Duration::from_secs(12)), 2);
        assert_eq!(c.len(), 2);
    }
}
