//! End-to-end scenarios against loopback listeners.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;

use portsweep::cdn::CdnFilter;
use portsweep::input::ScanType;
use portsweep::output::{self, OutputOptions};
use portsweep::scanner::{RunnerState, ScanConfig, Scanner};
use portsweep::targets::TargetIndex;

fn config() -> ScanConfig {
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

fn targets_of(ips: &[Ipv4Addr]) -> TargetIndex {
    let mut targets = TargetIndex::new();
    for &ip in ips {
        targets.add_ip(ip);
    }
    targets.coalesce();
    targets
}

#[tokio::test]
async fn one_listener_in_a_small_block() {
    // A /30-sized sweep of loopback addresses with exactly one open port.
    let listener = TcpListener::bind("127.44.0.2:0").await.unwrap();
    let open_port = listener.local_addr().unwrap().port();
    // bind-and-drop: a freshly released ephemeral port stays quiet
    let closed_port = {
        let ghost = TcpListener::bind("127.44.0.2:0").await.unwrap();
        ghost.local_addr().unwrap().port()
    };
    let probe_ports = vec![open_port, closed_port];

    let block: Vec<Ipv4Addr> = (0..4).map(|i| Ipv4Addr::new(127, 44, 0, i)).collect();
    let scanner = Scanner::new(
        config(),
        targets_of(&block),
        probe_ports,
        Vec::new(),
        CdnFilter::new(false),
    );
    scanner.run().await.unwrap();

    assert_eq!(scanner.state(), RunnerState::Done);
    assert_eq!(
        scanner.results().snapshot(),
        vec![(Ipv4Addr::new(127, 44, 0, 2), vec![open_port])]
    );
}

#[tokio::test]
async fn all_closed_hosts_account_for_every_packet() {
    let hosts = [Ipv4Addr::new(127, 61, 1, 1), Ipv4Addr::new(127, 61, 1, 2)];
    let retries = 1;
    let scanner = Scanner::new(
        ScanConfig {
            retries,
            ..config()
        },
        targets_of(&hosts),
        // a hundred high ports nothing binds to on these loopback aliases
        (41_000..=41_099).collect(),
        Vec::new(),
        CdnFilter::new(false),
    );
    scanner.run().await.unwrap();

    assert!(scanner.results().is_empty());
    assert_eq!(
        scanner.packets_sent(),
        200 * (u64::from(retries) + 1),
        "every (host, port) pair is dispatched once per pass"
    );
}

#[tokio::test]
async fn single_pair_scan_finishes_promptly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let scanner = Scanner::new(
        ScanConfig {
            rate: 10,
            ..config()
        },
        targets_of(&[Ipv4Addr::new(127, 0, 0, 1)]),
        vec![port],
        Vec::new(),
        CdnFilter::new(false),
    );

    let start = Instant::now();
    scanner.run().await.unwrap();
    assert!(start.elapsed() <= Duration::from_secs(1));
    assert!(scanner.results().has(Ipv4Addr::new(127, 0, 0, 1), port));
}

#[tokio::test]
async fn verified_scan_keeps_only_live_ports() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let scanner = Scanner::new(
        ScanConfig {
            verify: true,
            ..config()
        },
        targets_of(&[Ipv4Addr::new(127, 0, 0, 1)]),
        vec![port],
        Vec::new(),
        CdnFilter::new(false),
    );
    scanner.run().await.unwrap();

    assert_eq!(
        scanner.results().snapshot(),
        vec![(Ipv4Addr::new(127, 0, 0, 1), vec![port])]
    );
}

#[tokio::test]
async fn json_file_output_lands_in_a_created_directory() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let scanner = Scanner::new(
        config(),
        targets_of(&[Ipv4Addr::new(127, 0, 0, 1)]),
        vec![port],
        Vec::new(),
        CdnFilter::new(false),
    );
    scanner.run().await.unwrap();

    let base = std::env::temp_dir().join(format!("portsweep-scenario-{}", std::process::id()));
    let destination = base.join("out").join("x");
    let options = OutputOptions {
        file: Some(destination.clone()),
        json: true,
    };

    let results = scanner.results();
    let mut stream = Vec::new();
    output::emit(&results, scanner.targets(), &options, &mut stream).unwrap();

    let written = std::fs::read_to_string(destination.with_extension("json")).unwrap();
    assert_eq!(written, format!("{{\"ip\":\"127.0.0.1\",\"port\":{port}}}\n"));
    assert_eq!(written.as_bytes(), stream.as_slice());

    std::fs::remove_dir_all(&base).unwrap();
}
