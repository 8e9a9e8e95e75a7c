//! NAT translation against a live kernel
//!
//! These tests install DNAT rules, dummy links and a network namespace, so
//! they need root plus the `ip` and `iptables` tools. They skip otherwise.

use nat_conntrack::netlink::{namespace_inode, NetlinkConntracker};
use nat_conntrack::{
    BackendKind, CommandCompiler, CompilationContext, Config, ConnectionStats, ConnectionTuple, ConnectionType,
    Conntracker, IPTranslation,
};
use std::fs::File;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

fn run(args: &[&str]) -> bool {
    Command::new(args[0])
        .args(&args[1..])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_or(false, |status| status.success())
}

fn privileged() -> bool {
    // SAFETY: geteuid has no preconditions
    let root = unsafe { libc::geteuid() } == 0;
    root && run(&["ip", "-V"]) && run(&["iptables", "--version"])
}

fn self_netns() -> u32 {
    namespace_inode(Path::new("/proc/self/ns/net")).unwrap()
}

/// Poll the tracker until it resolves `conn`
fn wait_for_translation(tracker: &dyn Conntracker, conn: &ConnectionStats) -> Option<IPTranslation> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let translation = tracker.get_translation_for_conn(conn);
        if translation.is_some() || Instant::now() >= deadline {
            return translation;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

fn tcp_stats(local: SocketAddr, dest: IpAddr, dport: u16, netns: u32) -> ConnectionStats {
    ConnectionStats::new(
        ConnectionTuple::new(ConnectionType::Tcp, local.ip(), local.port(), dest, dport).with_netns(netns),
    )
}

/// Local DNAT from `virtual_ip` to `real_ip` on a dummy link, removed on drop
struct Dnat {
    link: &'static str,
    virtual_ip: &'static str,
    real_ip: &'static str,
}

impl Dnat {
    fn setup(link: &'static str, real_ip: &'static str, virtual_ip: &'static str) -> Option<Self> {
        let dnat = Self {
            link,
            virtual_ip,
            real_ip,
        };
        let ok = run(&["ip", "link", "add", link, "type", "dummy"])
            && run(&["ip", "address", "add", real_ip, "broadcast", "+", "dev", link])
            && run(&["ip", "link", "set", link, "up"])
            && run(&["ip", "route", "add", &format!("{}/32", virtual_ip), "dev", link])
            && run(&[
                "iptables", "-t", "nat", "-A", "OUTPUT", "--dest", virtual_ip, "-j", "DNAT", "--to-destination",
                real_ip,
            ]);
        ok.then_some(dnat)
    }
}

impl Drop for Dnat {
    fn drop(&mut self) {
        run(&[
            "iptables", "-t", "nat", "-D", "OUTPUT", "--dest", self.virtual_ip, "-j", "DNAT", "--to-destination",
            self.real_ip,
        ]);
        run(&["ip", "link", "del", self.link]);
    }
}

/// Namespace reachable over a veth pair, redirecting `nat_port` to `srv_port`
struct PeerNamespace {
    name: &'static str,
    holder: Option<Child>,
}

impl PeerNamespace {
    const LOCAL_IP: &'static str = "2.2.4.3";
    const PEER_IP: &'static str = "2.2.4.4";

    fn setup(name: &'static str, nat_port: u16, srv_port: u16) -> Option<Self> {
        let mut ns = Self { name, holder: None };
        let exec = |args: &[&str]| {
            let mut full = vec!["ip", "netns", "exec", name];
            full.extend_from_slice(args);
            run(&full)
        };
        let ok = run(&["ip", "netns", "add", name])
            && run(&["ip", "link", "add", "ctveth0", "type", "veth", "peer", "name", "ctveth1"])
            && run(&["ip", "link", "set", "ctveth1", "netns", name])
            && run(&["ip", "address", "add", &format!("{}/24", Self::LOCAL_IP), "dev", "ctveth0"])
            && run(&["ip", "link", "set", "ctveth0", "up"])
            && exec(&["ip", "address", "add", &format!("{}/24", Self::PEER_IP), "dev", "ctveth1"])
            && exec(&["ip", "link", "set", "ctveth1", "up"])
            && exec(&["ip", "link", "set", "lo", "up"])
            && exec(&[
                "iptables", "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", &nat_port.to_string(), "-j",
                "REDIRECT", "--to-ports", &srv_port.to_string(),
            ]);
        if !ok {
            return None;
        }

        // A process living in the namespace makes it visible under /proc
        ns.holder = Command::new("ip")
            .args(["netns", "exec", name, "sleep", "60"])
            .spawn()
            .ok();
        ns.holder.is_some().then_some(ns)
    }

    fn path(&self) -> PathBuf {
        PathBuf::from("/run/netns").join(self.name)
    }

    /// Listen on `addr` from inside the namespace
    fn listen(&self, addr: SocketAddr) -> std::io::Result<TcpListener> {
        let ns = File::open(self.path())?;
        std::thread::spawn(move || {
            // SAFETY: ns is an open namespace handle for the duration of the call
            if unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
            TcpListener::bind(addr)
        })
        .join()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "listener thread panicked"))?
    }
}

impl Drop for PeerNamespace {
    fn drop(&mut self) {
        if let Some(mut holder) = self.holder.take() {
            let _ = holder.kill();
            let _ = holder.wait();
        }
        run(&["ip", "link", "del", "ctveth0"]);
        run(&["ip", "netns", "del", self.name]);
    }
}

fn check_dnat(tracker: &dyn Conntracker, real_ip: IpAddr, virtual_ip: IpAddr) {
    let netns = self_netns();
    let server = TcpListener::bind((real_ip, 0)).unwrap();
    let port = server.local_addr().unwrap().port();

    let client = TcpStream::connect((virtual_ip, port)).unwrap();
    let conn = tcp_stats(client.local_addr().unwrap(), virtual_ip, port, netns);
    let translation = wait_for_translation(tracker, &conn).expect("DNAT connection not translated");
    assert_eq!(translation.repl_src_ip, real_ip);
    assert_eq!(translation.repl_src_port, port);
    assert!(tracker.exists(&conn.tuple).unwrap());

    // Direct connections carry no translation
    let direct = TcpStream::connect((real_ip, port)).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    let conn = tcp_stats(direct.local_addr().unwrap(), real_ip, port, netns);
    assert!(tracker.get_translation_for_conn(&conn).is_none());
}

#[test]
fn test_netlink_dnat_translation() {
    if !privileged() {
        eprintln!("skipping: needs root with ip and iptables");
        return;
    }
    let Some(_dnat) = Dnat::setup("ctdnat0", "1.1.1.1", "2.2.2.2") else {
        eprintln!("skipping: DNAT setup failed");
        return;
    };
    let real_ip: IpAddr = "1.1.1.1".parse().unwrap();
    let virtual_ip: IpAddr = "2.2.2.2".parse().unwrap();

    let cfg = Config {
        conntrack_max_state_size: 100,
        conntrack_rate_limit: 500,
        ..Config::default()
    };

    // Connections made while the tracker runs arrive as events
    let tracker = NetlinkConntracker::new(&cfg).unwrap();
    check_dnat(&tracker, real_ip, virtual_ip);
    tracker.close().unwrap();

    // Connections that predate the tracker come from the initial dump
    let server = TcpListener::bind((real_ip, 0)).unwrap();
    let port = server.local_addr().unwrap().port();
    let client = TcpStream::connect((virtual_ip, port)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let tracker = NetlinkConntracker::new(&cfg).unwrap();
    let conn = tcp_stats(client.local_addr().unwrap(), virtual_ip, port, self_netns());
    let translation = tracker.get_translation_for_conn(&conn).expect("existing connection not loaded");
    assert_eq!(translation.repl_src_ip, real_ip);
    tracker.close().unwrap();
}

#[test]
fn test_netlink_loads_peer_namespaces() {
    const NAT_PORT: u16 = 38000;
    const SRV_PORT: u16 = 38080;

    if !privileged() {
        eprintln!("skipping: needs root with ip and iptables");
        return;
    }
    let Some(peer) = PeerNamespace::setup("ctnat-test", NAT_PORT, SRV_PORT) else {
        eprintln!("skipping: namespace setup failed");
        return;
    };
    let peer_ip: IpAddr = PeerNamespace::PEER_IP.parse().unwrap();
    let _server = peer.listen(SocketAddr::new(peer_ip, SRV_PORT)).unwrap();

    let client = TcpStream::connect((peer_ip, NAT_PORT)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // Created afterwards, so only the per-namespace dump can know the entry
    let cfg = Config {
        enable_conntrack_all_namespaces: true,
        ..Config::default()
    };
    let tracker = NetlinkConntracker::new(&cfg).unwrap();

    let peer_ns = namespace_inode(&peer.path()).unwrap();
    let conn = tcp_stats(client.local_addr().unwrap(), peer_ip, NAT_PORT, peer_ns);
    let translation = wait_for_translation(&tracker, &conn).expect("peer namespace entry not loaded");
    assert_eq!(translation.repl_src_ip, peer_ip);
    assert_eq!(translation.repl_src_port, SRV_PORT);
    tracker.close().unwrap();
}

/// Runs only when `CONNTRACK_PROBE_OBJECT` names a built probe object
#[test]
fn test_ebpf_dnat_translation() {
    let Some(object) = std::env::var_os("CONNTRACK_PROBE_OBJECT") else {
        eprintln!("skipping: CONNTRACK_PROBE_OBJECT not set");
        return;
    };
    if !privileged() {
        eprintln!("skipping: needs root with ip and iptables");
        return;
    }
    let Some(_dnat) = Dnat::setup("ctdnat1", "1.1.3.1", "2.2.3.2") else {
        eprintln!("skipping: DNAT setup failed");
        return;
    };
    let real_ip: IpAddr = "1.1.3.1".parse().unwrap();
    let virtual_ip: IpAddr = "2.2.3.2".parse().unwrap();

    // Established before the probe attaches; found by the post-attach dump
    let server = TcpListener::bind((real_ip, 0)).unwrap();
    let port = server.local_addr().unwrap().port();
    let early = TcpStream::connect((virtual_ip, port)).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let cfg = Config {
        backend: BackendKind::Ebpf,
        precompiled_object: Some(PathBuf::from(object)),
        ..Config::default()
    };
    let ctx = CompilationContext::new(Box::new(CommandCompiler::from_config(&cfg)));
    let tracker = nat_conntrack::new_conntracker(&cfg, &ctx).unwrap();

    let conn = tcp_stats(early.local_addr().unwrap(), virtual_ip, port, self_netns());
    assert!(wait_for_translation(tracker.as_ref(), &conn).is_some());

    check_dnat(tracker.as_ref(), real_ip, virtual_ip);
    tracker.close().unwrap();
}
