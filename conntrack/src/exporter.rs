//! Diagnostics exporters
//!
//! Write a conntracker `Diagnostics` snapshot as JSON, Prometheus text or
//! InfluxDB line protocol.

use crate::conntracker::Diagnostics;
use anyhow::{Context, Result};
use std::{fs::File, io::Write, path::{Path, PathBuf}};

/// Trait for diagnostics exporters
pub trait MetricsExporter {
    /// Export one snapshot
    fn export(&self, diagnostics: &Diagnostics) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
    /// InfluxDB line protocol
    Influx,
}

impl std::str::FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" | "prom" => Ok(Self::Prometheus),
            "influx" | "influxdb" => Ok(Self::Influx),
            _ => anyhow::bail!("Unsupported format: {}. Use json, prometheus, or influx", s),
        }
    }
}

/// Build the exporter for `kind` writing to `output_path`
pub fn exporter_for(kind: ExporterType, output_path: PathBuf) -> Box<dyn MetricsExporter> {
    match kind {
        ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
        ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        ExporterType::Influx => Box::new(InfluxExporter::new(output_path, "conntrack".to_string())),
    }
}

fn write_file(path: &Path, data: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;
    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;
    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self { output_path, pretty }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, diagnostics: &Diagnostics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(diagnostics)?
        } else {
            serde_json::to_string(diagnostics)?
        };
        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    fn to_prometheus_format(d: &Diagnostics) -> String {
        let mut output = String::new();
        let backend = &d.backend;

        let mut metric = |name: &str, kind: &str, help: &str, value: u64| {
            output.push_str(&format!("# HELP conntrack_{} {}\n", name, help));
            output.push_str(&format!("# TYPE conntrack_{} {}\n", name, kind));
            output.push_str(&format!("conntrack_{}{{backend=\"{}\"}} {}\n", name, backend, value));
            output.push('\n');
        };

        metric("up", "gauge", "Whether the refresh channel is healthy", u64::from(d.healthy && !d.closed));
        metric("cache_entries", "gauge", "Cached NAT translation legs", d.cache_size as u64);
        metric("cache_max_entries", "gauge", "Configured cache bound", d.max_entries as u64);
        metric("dropped_updates_total", "counter", "Conntrack updates dropped before the cache", d.dropped_updates);
        metric("evictions_total", "counter", "Entries evicted to honor the cache bound", d.evictions);
        metric("registered_total", "counter", "NAT entries registered", d.registered);
        metric("unregistered_total", "counter", "NAT entries removed on destroy", d.unregistered);
        metric("transient_errors_total", "counter", "Refresh failures retried with backoff", d.transient_errors);
        metric("lookups_total", "counter", "Translation lookups", d.lookups);
        metric("hits_total", "counter", "Translation lookups that found an entry", d.hits);

        if !d.kernel_counters.is_empty() {
            output.push_str("# HELP conntrack_probe_counter Counters reported by the kernel probe\n");
            output.push_str("# TYPE conntrack_probe_counter counter\n");
            for (name, value) in &d.kernel_counters {
                output.push_str(&format!(
                    "conntrack_probe_counter{{backend=\"{}\",counter=\"{}\"}} {}\n",
                    backend, name, value
                ));
            }
            output.push('\n');
        }

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, diagnostics: &Diagnostics) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(diagnostics))
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    /// Create a new InfluxDB exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `measurement` - Measurement name for InfluxDB
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    fn to_influx_format(d: &Diagnostics, measurement: &str) -> String {
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
        let mut output = format!(
            "{},backend={} healthy={},cache_size={}i,dropped_updates={}i,evictions={}i,registered={}i,unregistered={}i,transient_errors={}i,lookups={}i,hits={}i {}\n",
            measurement,
            d.backend,
            d.healthy,
            d.cache_size,
            d.dropped_updates,
            d.evictions,
            d.registered,
            d.unregistered,
            d.transient_errors,
            d.lookups,
            d.hits,
            timestamp
        );

        if !d.kernel_counters.is_empty() {
            let fields: Vec<String> = d
                .kernel_counters
                .iter()
                .map(|(name, value)| format!("{}={}i", name, value))
                .collect();
            output.push_str(&format!(
                "{},backend={},type=probe {} {}\n",
                measurement,
                d.backend,
                fields.join(","),
                timestamp
            ));
        }

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn export(&self, diagnostics: &Diagnostics) -> Result<()> {
        write_file(&self.output_path, &Self::to_influx_format(diagnostics, &self.measurement))
    }
}
