//! Conntrack probe loader
//!
//! Loads the probe artifact chosen by the compilation gate and attaches its
//! kprobes to the conntrack insert and delete paths.

use crate::types::kernel::constants::{
    EVENTS_MAP, MAX_STATS, STATS_MAP, STAT_EVENTS_EMITTED, STAT_EVENTS_FAILED, STAT_READ_ERRORS,
    STAT_UNSUPPORTED_PROTOCOL,
};
use anyhow::{Context, Result};
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData, PerCpuArray},
    programs::KProbe,
    Bpf,
};
use log::{info, warn};
use std::collections::BTreeMap;

/// Required kprobes: (program name, kernel function)
const REQUIRED_KPROBES: &[(&str, &str)] = &[
    ("conntrack_hash_insert", "__nf_conntrack_hash_insert"),
    ("conntrack_delete", "nf_ct_delete"),
];

/// Reports entries that already existed when the probe was attached
const OPTIONAL_KPROBES: &[(&str, &str)] = &[("conntrack_fill_info", "ctnetlink_fill_info")];

/// Names of the probe's statistics counters, by index
const STAT_NAMES: [(u32, &str); MAX_STATS as usize] = [
    (STAT_EVENTS_EMITTED, "events_emitted"),
    (STAT_EVENTS_FAILED, "events_failed"),
    (STAT_UNSUPPORTED_PROTOCOL, "unsupported_protocol"),
    (STAT_READ_ERRORS, "read_errors"),
];

/// Where the event consumer reads the probe's own counters from
pub trait CounterSource {
    /// Current counter values by name, `None` when unavailable
    fn read_counters(&self) -> Option<BTreeMap<String, u64>>;
}

/// Loaded conntrack probe; programs detach when this is dropped
pub struct ProbeLoader {
    ebpf: Bpf,
}

impl ProbeLoader {
    /// Load probe bytecode
    pub fn load(bytecode: &[u8]) -> Result<Self> {
        info!("Loading conntrack probe ({} bytes)...", bytecode.len());
        let ebpf = Bpf::load(bytecode).context("Failed to load conntrack probe")?;
        info!("Conntrack probe loaded successfully");
        Ok(Self { ebpf })
    }

    /// Attach every kprobe; optional ones only warn when unavailable
    pub fn attach_kprobes(&mut self) -> Result<()> {
        info!("Attaching conntrack kprobes...");

        for (program, function) in REQUIRED_KPROBES {
            self.attach_kprobe(program, function)?;
            info!("  ✓ Attached to {}", function);
        }

        for (program, function) in OPTIONAL_KPROBES {
            if self.ebpf.program(program).is_none() {
                warn!("  ⚠ {} program not found (optional)", program);
                continue;
            }
            match self.attach_kprobe(program, function) {
                Ok(()) => info!("  ✓ Attached to {}", function),
                Err(e) => warn!("  ⚠ Failed to attach {} (not available on this kernel): {:#}", function, e),
            }
        }

        info!("All conntrack kprobes attached");
        Ok(())
    }

    fn attach_kprobe(&mut self, program: &str, function: &str) -> Result<()> {
        let probe: &mut KProbe = self
            .ebpf
            .program_mut(program)
            .with_context(|| format!("{} program not found in probe object", program))?
            .try_into()
            .with_context(|| format!("Failed to get {} as KProbe", program))?;
        probe
            .load()
            .with_context(|| format!("Failed to load {}", program))?;
        probe
            .attach(function, 0)
            .with_context(|| format!("Failed to attach {} kprobe", function))?;
        Ok(())
    }

    /// Take the perf event array carrying conntrack events
    pub fn get_perf_array(&mut self) -> Result<AsyncPerfEventArray<MapData>> {
        let map = self
            .ebpf
            .take_map(EVENTS_MAP)
            .with_context(|| format!("{} map not found in probe object", EVENTS_MAP))?;

        AsyncPerfEventArray::try_from(map)
            .with_context(|| format!("Failed to create AsyncPerfEventArray from {} map", EVENTS_MAP))
    }

    /// Sum the per-CPU statistics counters, `None` if the probe has none
    pub fn read_stats(&self) -> Option<BTreeMap<String, u64>> {
        let map = self.ebpf.map(STATS_MAP)?;
        let stats = match PerCpuArray::<_, u64>::try_from(map) {
            Ok(stats) => stats,
            Err(e) => {
                warn!("{} is not a per-CPU array: {}", STATS_MAP, e);
                return None;
            }
        };

        let mut counters = BTreeMap::new();
        for (index, name) in STAT_NAMES {
            match stats.get(&index, 0) {
                Ok(values) => {
                    counters.insert(name.to_string(), values.iter().sum());
                }
                Err(e) => warn!("reading {}[{}] failed: {}", STATS_MAP, index, e),
            }
        }
        Some(counters)
    }
}

impl CounterSource for ProbeLoader {
    fn read_counters(&self) -> Option<BTreeMap<String, u64>> {
        self.read_stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_rejects_garbage() {
        assert!(ProbeLoader::load(b"not an elf object").is_err());
    }

    #[test]
    fn test_stat_names_cover_every_index() {
        let mut indices: Vec<u32> = STAT_NAMES.iter().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..MAX_STATS).collect::<Vec<_>>());
    }
}
