//! Conntrack Agent
//!
//! Runs a conntracker, reports its diagnostics while it runs and exports
//! a final snapshot.
//!
//! ## Usage
//!
//! ```bash
//! # Follow ctnetlink for 60 seconds and export to JSON
//! sudo ./conntrack-agent --duration 60 --output conntrack.json
//!
//! # Use the tracing probe with settings from a file
//! sudo ./conntrack-agent --config conntrack.json --backend ebpf
//!
//! # Ask the kernel and the cache about one flow
//! sudo ./conntrack-agent --check tcp,10.0.0.1:40000,10.96.0.10:80 --duration 5
//!
//! # Export to Prometheus format
//! sudo ./conntrack-agent --format prometheus --output conntrack.prom
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use nat_conntrack::{
    exporter::{exporter_for, ExporterType},
    netlink::{namespace_inode, Conntrack, Leg},
    new_conntracker, BackendKind, CommandCompiler, CompilationContext, Config, ConnectionStats,
    ConnectionTuple, ConnectionType, Conntracker, Diagnostics,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal,
    time::{interval, sleep, Instant},
};

/// NAT connection tracking agent
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Backend override (netlink, ebpf, disabled)
    #[clap(short, long)]
    backend: Option<BackendKind>,

    /// Match translations across network namespaces
    #[clap(long)]
    all_namespaces: bool,

    /// Duration to run (in seconds, 0 = infinite)
    #[clap(short, long, default_value_t = 60)]
    duration: u64,

    /// Output file for diagnostics
    #[clap(short, long, default_value = "conntrack-diagnostics.json")]
    output: PathBuf,

    /// Output format (json, prometheus, influx)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Flow to look up, as PROTO,SRC:PORT,DST:PORT
    #[clap(long)]
    check: Option<String>,

    /// Network namespace handle used by --check (defaults to the current one)
    #[clap(long)]
    netns: Option<PathBuf>,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let export_format: ExporterType = args.format.parse()?;

    let mut cfg = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(backend) = args.backend {
        cfg.backend = backend;
    }
    if args.all_namespaces {
        cfg.enable_conntrack_all_namespaces = true;
    }

    let check = match args.check.as_deref() {
        Some(flow) => {
            let ns_path = args.netns.clone().unwrap_or_else(|| cfg.self_netns_path());
            Some(scope_to_namespace(parse_flow(flow)?, &ns_path)?)
        }
        None => None,
    };

    info!("Starting conntrack agent...");
    info!("   Backend: {:?}", cfg.backend);
    info!("   All namespaces: {}", cfg.enable_conntrack_all_namespaces);
    info!("   Max entries: {}", cfg.conntrack_max_state_size);
    info!("   Rate limit: {}/s", cfg.conntrack_rate_limit);
    info!("   Output: {:?} ({:?})", args.output, export_format);

    if let Some(tuple) = &check {
        query_kernel(&cfg, args.netns.clone(), tuple).await?;
    }

    let tracker: Arc<dyn Conntracker> = {
        let cfg = cfg.clone();
        let tracker = tokio::task::spawn_blocking(move || {
            let compilation = CompilationContext::new(Box::new(CommandCompiler::from_config(&cfg)));
            new_conntracker(&cfg, &compilation)
        })
        .await
        .context("conntracker construction task failed")??;
        Arc::from(tracker)
    };

    let reporter = spawn_progress_reporter(Arc::clone(&tracker), args.progress_interval);

    let start_time = Instant::now();
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }
    reporter.abort();

    if let Some(tuple) = &check {
        let translation = tracker.get_translation_for_conn(&ConnectionStats::new(*tuple));
        match translation {
            Some(t) => info!(
                "Translation: {}:{} -> {}:{}",
                t.repl_src_ip, t.repl_src_port, t.repl_dst_ip, t.repl_dst_port
            ),
            None => info!("No translation cached for the checked flow"),
        }
        match tracker.exists(tuple) {
            Ok(found) => info!("Cached NAT entry present: {}", found),
            Err(e) => warn!("Cache unavailable: {}", e),
        }
    }

    let diagnostics = tracker.diagnostics();
    exporter_for(export_format, args.output.clone()).export(&diagnostics)?;
    info!("Diagnostics written to {:?}", args.output);

    let closer = Arc::clone(&tracker);
    tokio::task::spawn_blocking(move || closer.close())
        .await
        .context("conntracker close task failed")??;

    print_summary(&diagnostics, start_time.elapsed().as_secs());

    Ok(())
}

/// Parse `PROTO,SRC:PORT,DST:PORT`
fn parse_flow(s: &str) -> Result<ConnectionTuple> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    let [proto, src, dst] = parts.as_slice() else {
        anyhow::bail!("Invalid flow '{}': expected PROTO,SRC:PORT,DST:PORT", s);
    };
    let protocol = match proto.to_lowercase().as_str() {
        "tcp" => ConnectionType::Tcp,
        "udp" => ConnectionType::Udp,
        other => anyhow::bail!("Unsupported protocol: {}. Use tcp or udp", other),
    };
    let src: SocketAddr = src.parse().with_context(|| format!("Invalid source address: {}", src))?;
    let dst: SocketAddr = dst.parse().with_context(|| format!("Invalid destination address: {}", dst))?;
    Ok(ConnectionTuple::new(protocol, src.ip(), src.port(), dst.ip(), dst.port()))
}

/// Tag `tuple` with the namespace whose handle is `ns_path`, as cached entries are
fn scope_to_namespace(tuple: ConnectionTuple, ns_path: &Path) -> Result<ConnectionTuple> {
    let netns = namespace_inode(ns_path).with_context(|| format!("Cannot read namespace {:?}", ns_path))?;
    Ok(tuple.with_netns(netns))
}

/// Ask the kernel directly whether the flow is tracked, as either leg
async fn query_kernel(cfg: &Config, netns: Option<PathBuf>, tuple: &ConnectionTuple) -> Result<()> {
    let self_ns = cfg.self_netns_path();
    let flow = tuple.flow_key();

    let (origin, reply) = tokio::task::spawn_blocking(move || -> nat_conntrack::Result<(bool, bool)> {
        let mut ct = Conntrack::new(netns.as_deref(), &self_ns)?;
        Ok((ct.exists(&flow, Leg::Origin)?, ct.exists(&flow, Leg::Reply)?))
    })
    .await
    .context("conntrack query task failed")??;

    info!("Kernel conntrack: origin leg {}, reply leg {}", origin, reply);
    Ok(())
}

fn spawn_progress_reporter(tracker: Arc<dyn Conntracker>, interval_secs: u64) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let d = tracker.diagnostics();
            info!(
                "📈 Progress: {} cached legs, {} registered, {} dropped updates{}",
                d.cache_size,
                d.registered,
                d.dropped_updates,
                if d.healthy { "" } else { " (refresh failing)" }
            );
        }
    })
}

fn print_summary(d: &Diagnostics, elapsed: u64) {
    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Backend:            {}", d.backend);
    info!("  Duration:           {} seconds", elapsed);
    info!("  Healthy:            {}", d.healthy);
    info!("");
    info!("  Cached legs:        {:>8} / {}", d.cache_size, d.max_entries);
    info!("  Registered:         {:>8}", d.registered);
    info!("  Unregistered:       {:>8}", d.unregistered);
    info!("  Evictions:          {:>8}", d.evictions);
    info!("  Dropped updates:    {:>8}", d.dropped_updates);
    info!("  Transient errors:   {:>8}", d.transient_errors);
    info!("  Lookups (hits):     {:>8} ({})", d.lookups, d.hits);
    if !d.kernel_counters.is_empty() {
        info!("");
        info!("  Probe counters:");
        for (name, value) in &d.kernel_counters {
            info!("    {:<22}{:>8}", name, value);
        }
    }
    info!("");
    info!("============================================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_parse_flow() {
        let tuple = parse_flow("udp, 10.0.0.1:40000, 10.96.0.10:53").unwrap();
        assert_eq!(tuple.protocol, ConnectionType::Udp);
        assert_eq!(tuple.sport, 40000);
        assert_eq!(tuple.dport, 53);
        assert_eq!(tuple.netns, 0);

        assert!(parse_flow("sctp,10.0.0.1:1,10.0.0.2:2").is_err());
        assert!(parse_flow("tcp,10.0.0.1:1").is_err());
    }

    #[test]
    fn test_checked_flow_is_scoped_to_namespace() {
        let dir = std::env::temp_dir().join(format!("conntrack-agent-ns-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let handle = dir.join("net");
        std::fs::write(&handle, b"").unwrap();
        let inode = std::fs::metadata(&handle).unwrap().ino() as u32;

        let tuple = parse_flow("tcp,10.0.0.1:40000,10.96.0.10:80").unwrap();
        let scoped = scope_to_namespace(tuple, &handle).unwrap();
        assert_eq!(scoped.netns, inode);
        assert_eq!(scoped.flow_key(), tuple.flow_key());

        assert!(scope_to_namespace(tuple, &dir.join("missing")).is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
