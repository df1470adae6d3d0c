//! Command-line entry point for the portsweep scanner.

use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::debug;
use rlimit::Resource;

use portsweep::address;
use portsweep::cdn::CdnFilter;
use portsweep::input::{Config, Opts, ScanType};
use portsweep::output::{self, OutputOptions};
use portsweep::scanner::{ScanConfig, Scanner};
use portsweep::{detail, warning};

#[tokio::main]
async fn main() {
    env_logger::init();
    let mut opts = Opts::read();
    let config = Config::read(opts.config_path.clone());
    opts.merge(&config);

    debug!("main() `opts` arguments are {opts:?}");

    if let Err(e) = run(opts).await {
        warning!(format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> Result<()> {
    adjust_ulimit(&opts);

    let ports = scan_ports(&opts)?;
    let targets = address::build_target_index(&opts).await;
    if targets.count() == 0 {
        bail!("no valid targets were provided");
    }

    let exclusions = match &opts.exclude_ips {
        Some(entries) => address::parse_exclusions(entries),
        None => Vec::new(),
    };

    let source_ip: Option<Ipv4Addr> = match &opts.source_ip {
        Some(raw) => Some(
            raw.parse()
                .with_context(|| format!("invalid source IP {raw:?}"))?,
        ),
        None => None,
    };

    let config = ScanConfig {
        rate: opts.rate,
        retries: opts.retries,
        timeout: Duration::from_millis(u64::from(opts.timeout)),
        scan_type: opts.scan_type,
        verify: opts.verify,
        warm_up: Duration::from_secs(opts.warm_up_time),
        source_ip,
        interface: opts.interface.clone(),
        progress: opts.progress,
        greppable: opts.greppable,
        accessible: opts.accessible,
    };

    detail!(
        format!(
            "Scanning {} hosts on {} ports ({} mode, {} pps).",
            targets.count(),
            ports.len(),
            match opts.scan_type {
                ScanType::Connect => "connect",
                ScanType::Syn => "syn",
            },
            opts.rate
        ),
        opts.greppable,
        opts.accessible
    );

    let scanner = Scanner::new(config, targets, ports, exclusions, CdnFilter::new(opts.exclude_cdn));
    scanner.run().await?;

    let options = OutputOptions {
        file: opts.output.clone(),
        json: opts.json,
    };
    let results = scanner.results();
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = output::emit(&results, scanner.targets(), &options, &mut stdout) {
        warning!(
            format!("Emitting results failed: {e:#}"),
            opts.greppable,
            opts.accessible
        );
    }

    if let Some(command) = &opts.nmap_cli {
        detail!(
            format!("Handing results to {command:?}."),
            opts.greppable,
            opts.accessible
        );
        output::run_post_processor(command, &results, scanner.targets());
    }

    Ok(())
}

/// The connect pool keeps up to `rate` sockets in flight; raise or at least
/// flag the open-file ceiling before the scan hits it.
fn adjust_ulimit(opts: &Opts) {
    if let Some(limit) = opts.ulimit {
        if Resource::NOFILE.set(limit, limit).is_err() {
            warning!(
                format!("Could not set ulimit to {limit}"),
                opts.greppable,
                opts.accessible
            );
        }
    }

    if opts.scan_type == ScanType::Connect {
        if let Ok((soft, _)) = Resource::NOFILE.get() {
            if u64::from(opts.rate) * 2 > soft {
                warning!(
                    format!(
                        "Open file limit {soft} is low for a rate of {}. Consider --ulimit {} or a lower --rate.",
                        opts.rate,
                        u64::from(opts.rate) * 2
                    ),
                    opts.greppable,
                    opts.accessible
                );
            }
        }
    }
}

/// Final port list: the parsed specification minus the excluded ports.
fn scan_ports(opts: &Opts) -> Result<Vec<u16>> {
    let mut ports = opts
        .ports
        .clone()
        .context("no ports were provided to scan")?;
    if let Some(excluded) = &opts.exclude_ports {
        ports.retain(|port| !excluded.contains(port));
    }
    if ports.is_empty() {
        bail!("every provided port is excluded, nothing to scan");
    }
    Ok(ports)
}
