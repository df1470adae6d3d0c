//! Provides functions to parse input IP addresses, CIDRs or files.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use cidr_utils::cidr::IpCidr;
use hickory_resolver::{
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};
use log::debug;
use tokio::{fs, io};

use crate::input::Opts;
use crate::targets::TargetIndex;
use crate::warning;

/// Parses the address inputs into a coalesced target index.
///
/// Goes through all possible inputs: literal IPs, CIDRs, host names (which
/// are resolved and remembered for the output phase) and files containing
/// any of the former, one per line.
///
/// ```rust
/// # use portsweep::input::Opts;
/// # use portsweep::address::build_target_index;
/// # #[tokio::main]
/// # async fn main() {
/// let mut opts = Opts::default();
/// opts.addresses = vec!["192.168.0.0/30".to_owned()];
///
/// let targets = build_target_index(&opts).await;
/// assert_eq!(targets.count(), 4);
/// # }
/// ```
pub async fn build_target_index(input: &Opts) -> TargetIndex {
    let resolver = get_resolver(&input.resolver).await;
    let mut index = TargetIndex::new();

    for address in &input.addresses {
        if ingest(address, &mut index, &resolver).await {
            continue;
        }
        // Not an address, a CIDR or a resolvable host: last chance is a file
        // of those, one entry per line.
        match fs::read_to_string(address).await {
            Ok(content) => {
                for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    if !ingest(line, &mut index, &resolver).await {
                        debug!("no usable addresses from line {line:?}");
                    }
                }
            }
            Err(_) => {
                warning!(
                    format!("Host {address:?} could not be resolved."),
                    input.greppable,
                    input.accessible
                );
            }
        }
    }

    index.coalesce();
    index
}

/// Parse one entry as an IP, a CIDR or a host name. Returns whether anything
/// was added to the index.
async fn ingest(address: &str, index: &mut TargetIndex, resolver: &TokioAsyncResolver) -> bool {
    if let Ok(ip) = Ipv4Addr::from_str(address) {
        index.add_ip(ip);
        return true;
    }

    if let Ok(cidr) = IpCidr::from_str(address) {
        return add_cidr(&cidr, index);
    }

    let mut found = false;
    for ip in resolve_ips_from_host(address, resolver).await {
        match ip {
            IpAddr::V4(v4) => {
                index.add_ip(v4);
                index.record_name(v4, address);
                found = true;
            }
            IpAddr::V6(v6) => debug!("skipping IPv6 address {v6} for host {address:?}"),
        }
    }
    found
}

fn add_cidr(cidr: &IpCidr, index: &mut TargetIndex) -> bool {
    match cidr {
        IpCidr::V4(v4) => {
            let base = u32::from(v4.first_address());
            match v4.network_length() {
                // a /0 does not fit one range counter, split it in half
                0 => {
                    index.add(0, 1 << 31);
                    index.add(1 << 31, 1 << 31);
                }
                length => index.add(base, 1u32 << (32 - length)),
            }
            true
        }
        IpCidr::V6(v6) => {
            debug!("skipping IPv6 network {v6}");
            false
        }
    }
}

/// Parse exclusion entries (IPs or CIDRs) for the dispatch-time filter.
/// Entries that parse as neither are dropped with a warning.
pub fn parse_exclusions(entries: &[String]) -> Vec<IpCidr> {
    entries
        .iter()
        .filter_map(|entry| {
            let entry = entry.trim();
            if let Ok(ip) = IpAddr::from_str(entry) {
                return Some(IpCidr::new_host(ip));
            }
            match IpCidr::from_str(entry) {
                Ok(cidr) => Some(cidr),
                Err(_) => {
                    warning!(format!("Ignoring unparseable exclusion {entry:?}"));
                    None
                }
            }
        })
        .collect()
}

/// Uses DNS to get the IPs associated with a host name.
async fn resolve_ips_from_host(source: &str, backup_resolver: &TokioAsyncResolver) -> Vec<IpAddr> {
    if let Ok(addrs) = tokio::net::lookup_host((source, 80)).await {
        return addrs.map(|socket| socket.ip()).collect();
    }
    if let Ok(addrs) = backup_resolver.lookup_ip(source).await {
        return addrs.iter().collect();
    }
    Vec::new()
}

/// Derive a DNS resolver.
///
/// 1. if the `resolver` parameter has been set:
///     1. assume the parameter is a path and attempt to read IPs.
///     2. parse the input as a comma-separated list of IPs.
/// 2. if `resolver` is not set:
///    1. attempt to derive a resolver from the system config. (e.g.
///       `/etc/resolv.conf` on *nix).
///    2. finally, build a CloudFlare-based resolver (default
///       behaviour).
async fn get_resolver(resolver: &Option<String>) -> TokioAsyncResolver {
    match resolver {
        Some(r) => {
            let mut config = ResolverConfig::new();
            let resolver_ips = match read_resolver_from_file(r).await {
                Ok(ips) => ips,
                Err(_) => r
                    .split(',')
                    .filter_map(|r| IpAddr::from_str(r).ok())
                    .collect::<Vec<_>>(),
            };
            for ip in resolver_ips {
                config.add_name_server(NameServerConfig::new(
                    SocketAddr::new(ip, 53),
                    Protocol::Udp,
                ));
            }
            TokioAsyncResolver::tokio(config, ResolverOpts::default())
        }
        None => TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare_tls(), ResolverOpts::default())
        }),
    }
}

/// Parses an input file of IPs for use in DNS resolution.
async fn read_resolver_from_file(path: &str) -> io::Result<Vec<IpAddr>> {
    let ips = fs::read_to_string(path)
        .await?
        .lines()
        .filter_map(|line| IpAddr::from_str(line.trim()).ok())
        .collect();

    Ok(ips)
}
