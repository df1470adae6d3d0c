//! Core functionality for actual scanning behaviour.
//!
//! The [`Scanner`] drives the whole run: it walks the permuted
//! (host x port) space once per pass, pushes every surviving pair through
//! the token bucket, and hands it to either the connect worker pool or the
//! inline SYN emitter. Results from all producers converge in the shared
//! [`ScanResults`] store.

pub mod syn;

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cidr_utils::cidr::IpCidr;
use colored::Colorize;
use futures::stream::{FuturesUnordered, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::cdn::CdnFilter;
use crate::input::ScanType;
use crate::permute::{Permutation, PERMUTATION_KEY};
use crate::progress::{self, Labels, ScanStats};
use crate::rate::RateLimiter;
use crate::results::ScanResults;
use crate::targets::TargetIndex;

use self::syn::SynSession;

/// Lifecycle of a scan run. Transitions are monotonic; output iteration is
/// only valid once Done has been reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunnerState {
    Init = 0,
    Scan = 1,
    Done = 2,
}

/// Shared, forward-only view of the runner state. The SYN reply collector
/// polls it to know when late replies must be dropped.
#[derive(Debug, Default)]
pub struct ScanState(AtomicU8);

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RunnerState {
        match self.0.load(Ordering::SeqCst) {
            0 => RunnerState::Init,
            1 => RunnerState::Scan,
            _ => RunnerState::Done,
        }
    }

    /// Move forward to `next`. Going backwards is silently ignored.
    pub fn advance(&self, next: RunnerState) {
        self.0.fetch_max(next as u8, Ordering::SeqCst);
    }
}

/// Immutable knobs of a scan run.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Packets per second; also the connect worker pool bound.
    pub rate: u32,
    /// Additional full passes over the search space.
    pub retries: u8,
    /// Per-connect timeout.
    pub timeout: Duration,
    pub scan_type: ScanType,
    /// Re-probe discovered ports over connect once the scan is done.
    pub verify: bool,
    /// Post-scan linger so straggling SYN/ACKs still land.
    pub warm_up: Duration,
    pub source_ip: Option<Ipv4Addr>,
    pub interface: Option<String>,
    pub progress: bool,
    pub greppable: bool,
    pub accessible: bool,
}

/// High-throughput scanner over a coalesced target space.
///
/// One instance owns the target index, the port list and the dispatch loop;
/// only the result store is shared with its workers. Construction is cheap,
/// all sockets and raw handles are opened inside [`run`](Self::run).
#[derive(Debug)]
pub struct Scanner {
    config: ScanConfig,
    targets: TargetIndex,
    ports: Vec<u16>,
    exclusions: Vec<IpCidr>,
    cdn: CdnFilter,
    results: Arc<ScanResults>,
    state: Arc<ScanState>,
    stats: Arc<ScanStats>,
}

impl Scanner {
    pub fn new(
        config: ScanConfig,
        targets: TargetIndex,
        ports: Vec<u16>,
        exclusions: Vec<IpCidr>,
        cdn: CdnFilter,
    ) -> Self {
        Self {
            config,
            targets,
            ports,
            exclusions,
            cdn,
            results: Arc::new(ScanResults::new()),
            state: Arc::new(ScanState::new()),
            stats: Arc::new(ScanStats::new()),
        }
    }

    pub fn results(&self) -> Arc<ScanResults> {
        Arc::clone(&self.results)
    }

    pub fn targets(&self) -> &TargetIndex {
        &self.targets
    }

    pub fn state(&self) -> RunnerState {
        self.state.current()
    }

    /// Probes dispatched so far, across all passes.
    pub fn packets_sent(&self) -> u64 {
        self.stats.packets()
    }

    /// Executes the scan across all configured targets and ports.
    ///
    /// Each pass walks the full space in the same shuffled order; pairs
    /// rejected by the exclusion list or the CDN policy are skipped before
    /// a rate token is spent. Per-probe failures never abort the run, the
    /// error that comes back is a setup failure (no targets, no raw-socket
    /// privilege in SYN mode, unresolvable source).
    pub async fn run(&self) -> Result<()> {
        let hosts = self.targets.count();
        let port_count = self.ports.len() as u64;
        let space = hosts
            .checked_mul(port_count)
            .context("search space size overflows u64")?;
        if space == 0 {
            bail!("nothing to scan: no targets or no ports");
        }

        let syn = self.setup_syn()?;
        self.state.advance(RunnerState::Scan);

        let reporter = self.config.progress.then(|| {
            progress::spawn_reporter(
                Arc::clone(&self.stats),
                Labels {
                    hosts,
                    ports: self.ports.len(),
                    retries: self.config.retries,
                    total: space * (u64::from(self.config.retries) + 1),
                },
            )
        });

        let limiter = RateLimiter::new(self.config.rate);
        let pool = Arc::new(Semaphore::new(self.config.rate as usize));

        debug!(
            "Start scanning. \nRate {}\nNumber of hosts {}\nNumber of ports {}\nPairs per pass {}",
            self.config.rate, hosts, port_count, space
        );

        for attempt in 0..=self.config.retries {
            debug!(
                "pass {} of {}",
                u16::from(attempt) + 1,
                u16::from(self.config.retries) + 1
            );
            let permutation = Permutation::new(space, PERMUTATION_KEY);
            for i in 0..space {
                let k = permutation.shuffle(i);
                let Ok(ip) = self.targets.ip_of(k / port_count) else {
                    continue;
                };
                let Some(&port) = self.ports.get((k % port_count) as usize) else {
                    continue;
                };
                if self.is_excluded(ip) {
                    debug!("{ip} is excluded, skipping");
                    continue;
                }
                if !self.cdn.allow(ip, port) {
                    debug!("{ip}:{port} blocked by CDN policy");
                    continue;
                }

                limiter.take().await;

                match &syn {
                    Some((session, _)) => {
                        if let Err(e) = session.send_syn(ip, port) {
                            debug!("{e}");
                        }
                    }
                    None => {
                        let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                            continue;
                        };
                        self.spawn_connect_worker(SocketAddr::new(IpAddr::V4(ip), port), permit);
                    }
                }
                self.stats.add_packet();
            }
        }

        // Drain barrier: every connect worker holds a pool permit until it
        // finishes, so reacquiring the whole pool means the pool is idle.
        if syn.is_none() {
            let _drained = pool
                .acquire_many(self.config.rate)
                .await
                .context("worker pool closed unexpectedly")?;
        }

        if !self.config.warm_up.is_zero() {
            debug!("warm-up: waiting {:?} for late replies", self.config.warm_up);
            tokio::time::sleep(self.config.warm_up).await;
        }

        self.state.advance(RunnerState::Done);

        if let Some((session, collector)) = syn {
            drop(session);
            // the collector re-checks the state at every poll interval
            let _ = tokio::task::spawn_blocking(move || collector.join()).await;
        }
        if let Some(reporter) = reporter {
            reporter.abort();
        }

        if self.config.verify {
            self.verify_pass().await;
        }

        debug!("Open pairs found on {} hosts", self.results.len());
        Ok(())
    }

    /// In SYN mode, resolve the probe source and start the reply collector
    /// before any probe is emitted.
    fn setup_syn(&self) -> Result<Option<(SynSession, std::thread::JoinHandle<()>)>> {
        if self.config.scan_type != ScanType::Syn {
            return Ok(None);
        }
        let selection =
            syn::resolve_source(self.config.source_ip, self.config.interface.as_deref())?;
        let (session, rx) = SynSession::open(&selection)?;
        let ports: Arc<HashSet<u16>> = Arc::new(self.ports.iter().copied().collect());
        let collector = syn::spawn_collector(
            rx,
            Arc::clone(&self.results),
            Arc::clone(&self.state),
            ports,
            session.source_port(),
            self.config.greppable,
            self.config.accessible,
        );
        Ok(Some((session, collector)))
    }

    fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        let addr = IpAddr::V4(ip);
        self.exclusions.iter().any(|cidr| cidr.contains(&addr))
    }

    fn spawn_connect_worker(
        &self,
        socket: SocketAddr,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let results = Arc::clone(&self.results);
        let connect_timeout = self.config.timeout;
        let greppable = self.config.greppable;
        let accessible = self.config.accessible;

        tokio::spawn(async move {
            let _permit = permit;
            let IpAddr::V4(ip) = socket.ip() else { return };
            if results.has(ip, socket.port()) {
                // an earlier pass already proved this one open
                return;
            }
            match connect(socket, connect_timeout).await {
                Ok(()) => {
                    if results.add(ip, socket.port()) {
                        debug!("Connection was successful to {}", &socket);
                        fmt_open(socket, greppable, accessible);
                    }
                }
                Err(e) => {
                    let error_string = e.to_string();
                    assert!(
                        !error_string.to_lowercase().contains("too many open files"),
                        "Too many open files. Please reduce the scan rate. The default is 1000. Try --rate 500."
                    );
                    debug!("{socket} treated as closed: {error_string}");
                }
            }
        });
    }

    /// Re-probe everything the scan found over plain connect and keep only
    /// the ports that still answer. Hosts fan out concurrently, a fresh
    /// token bucket paces the probes.
    async fn verify_pass(&self) {
        debug!("verifying discovered ports on {} hosts", self.results.len());
        let limiter = RateLimiter::new(self.config.rate);
        let mut hosts = FuturesUnordered::new();

        for (ip, ports) in self.results.snapshot() {
            let limiter = &limiter;
            hosts.push(async move {
                let mut verified = HashSet::new();
                for port in ports {
                    limiter.take().await;
                    let socket = SocketAddr::new(IpAddr::V4(ip), port);
                    if connect(socket, self.config.timeout).await.is_ok() {
                        verified.insert(port);
                    } else {
                        debug!("{socket} did not survive verification");
                    }
                }
                (ip, verified)
            });
        }

        while let Some((ip, verified)) = hosts.next().await {
            self.results.set(ip, verified);
        }
    }
}

/// One full handshake with a timeout; the stream is closed right away.
async fn connect(socket: SocketAddr, limit: Duration) -> io::Result<()> {
    let stream = timeout(limit, TcpStream::connect(socket))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
    drop(stream);
    Ok(())
}

/// Live output for a discovered pair, honoring the output modes.
pub(crate) fn fmt_open(socket: SocketAddr, greppable: bool, accessible: bool) {
    if !greppable {
        if accessible {
            println!("Open {socket}");
        } else {
            println!("Open {}", socket.to_string().purple());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdn::{CdnFilter, CdnProvider};
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    fn test_config() -> ScanConfig {
        ScanConfig {
            rate: 500,
            retries: 0,
            timeout: Duration::from_millis(300),
            scan_type: ScanType::Connect,
            verify: false,
            warm_up: Duration::ZERO,
            source_ip: None,
            interface: None,
            progress: false,
            greppable: true,
            accessible: true,
        }
    }

    fn loopback_index(ip: Ipv4Addr) -> TargetIndex {
        let mut targets = TargetIndex::new();
        targets.add_ip(ip);
        targets.coalesce();
        targets
    }

    fn scanner_for(ip: Ipv4Addr, ports: Vec<u16>, config: ScanConfig) -> Scanner {
        Scanner::new(
            config,
            loopback_index(ip),
            ports,
            Vec::new(),
            CdnFilter::new(false),
        )
    }

    #[test]
    fn state_transitions_are_monotonic() {
        let state = ScanState::new();
        assert_eq!(state.current(), RunnerState::Init);
        state.advance(RunnerState::Scan);
        assert_eq!(state.current(), RunnerState::Scan);
        state.advance(RunnerState::Done);
        state.advance(RunnerState::Scan);
        state.advance(RunnerState::Init);
        assert_eq!(state.current(), RunnerState::Done);
    }

    #[tokio::test]
    async fn scanner_runs() {
        // Makes sure the program still runs and doesn't panic
        let scanner = scanner_for(
            Ipv4Addr::new(127, 0, 0, 1),
            (1..=1000).collect(),
            test_config(),
        );
        scanner.run().await.unwrap();
        assert_eq!(scanner.state(), RunnerState::Done);
    }

    #[tokio::test]
    async fn finds_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let ip = Ipv4Addr::new(127, 0, 0, 1);

        let scanner = scanner_for(ip, vec![open_port], test_config());
        scanner.run().await.unwrap();

        assert!(scanner.results().has(ip, open_port));
    }

    #[tokio::test]
    async fn closed_ports_leave_no_results_and_count_packets() {
        // An otherwise unused loopback address and a hundred high ports
        // nothing binds to: every connect is refused.
        let ip = Ipv4Addr::new(127, 219, 4, 7);
        let config = ScanConfig {
            retries: 1,
            ..test_config()
        };
        let scanner = scanner_for(ip, (42_000..=42_099).collect(), config);
        scanner.run().await.unwrap();

        assert!(scanner.results().is_empty());
        // 100 pairs, two passes
        assert_eq!(scanner.packets_sent(), 200);
    }

    #[tokio::test]
    async fn empty_space_is_a_setup_error() {
        let scanner = scanner_for(Ipv4Addr::new(127, 0, 0, 1), Vec::new(), test_config());
        assert!(scanner.run().await.is_err());
    }

    #[tokio::test]
    async fn excluded_hosts_are_never_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let ip = Ipv4Addr::new(127, 0, 0, 1);

        let scanner = Scanner::new(
            test_config(),
            loopback_index(ip),
            vec![open_port],
            crate::address::parse_exclusions(&["127.0.0.0/8".to_owned()]),
            CdnFilter::new(false),
        );
        scanner.run().await.unwrap();

        assert!(scanner.results().is_empty());
        assert_eq!(scanner.packets_sent(), 0);
    }

    struct LoopbackIsCdn;
    impl CdnProvider for LoopbackIsCdn {
        fn classify(&self, ip: Ipv4Addr) -> anyhow::Result<Option<&'static str>> {
            Ok(ip.is_loopback().then_some("testnet"))
        }
    }

    #[tokio::test]
    async fn cdn_hosts_only_see_http_ports() {
        let ip = Ipv4Addr::new(127, 219, 4, 9);
        let config = ScanConfig {
            retries: 2,
            ..test_config()
        };
        let scanner = Scanner::new(
            config,
            loopback_index(ip),
            vec![80, 443, 8080],
            Vec::new(),
            CdnFilter::with_provider(true, Box::new(LoopbackIsCdn)),
        );
        scanner.run().await.unwrap();

        // only 80 and 443 were dispatched, three passes each
        assert_eq!(scanner.packets_sent(), 6);
    }

    #[tokio::test]
    async fn retries_are_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let closed_port = {
            let ghost = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ghost.local_addr().unwrap().port()
        };
        let ip = Ipv4Addr::new(127, 0, 0, 1);

        let once = scanner_for(ip, vec![open_port, closed_port], test_config());
        once.run().await.unwrap();

        let config = ScanConfig {
            retries: 2,
            ..test_config()
        };
        let thrice = scanner_for(ip, vec![open_port, closed_port], config);
        thrice.run().await.unwrap();

        assert_eq!(once.results().snapshot(), thrice.results().snapshot());
    }

    #[tokio::test]
    async fn verification_drops_false_positives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        // bind-and-drop: a freshly released ephemeral port stays quiet
        let dead_port = {
            let ghost = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ghost.local_addr().unwrap().port()
        };
        let ip = Ipv4Addr::new(127, 0, 0, 1);

        let scanner = scanner_for(ip, vec![live_port, dead_port], test_config());
        scanner.results.add(ip, live_port);
        scanner.results.add(ip, dead_port);

        scanner.verify_pass().await;

        let snapshot = scanner.results().snapshot();
        assert_eq!(snapshot, vec![(ip, vec![live_port])]);
    }
}
