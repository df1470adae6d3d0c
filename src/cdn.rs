//! CDN classification and the dispatch-time scan policy built on it.

use std::net::Ipv4Addr;

use anyhow::Result;
use dashmap::DashMap;
use log::debug;
use once_cell::sync::Lazy;

/// Ports still worth probing on a CDN edge; everything else terminates at
/// the provider, not at the customer's machine.
pub const CDN_ALLOWED_PORTS: [u16; 2] = [80, 443];

/// Classifies an address as belonging to a content delivery network.
///
/// The built-in implementation matches against a static table of well-known
/// provider ranges; alternative sources (an API, a refreshed dataset) can be
/// plugged in through this trait.
pub trait CdnProvider: Send + Sync {
    /// Name of the network the address belongs to, or `None`.
    fn classify(&self, ip: Ipv4Addr) -> Result<Option<&'static str>>;
}

/// Published ranges of the large CDN and WAF operators.
static CDN_RANGES: Lazy<Vec<(u32, u32, &'static str)>> = Lazy::new(|| {
    let mut ranges: Vec<(u32, u32, &'static str)> = KNOWN_RANGES
        .iter()
        .filter_map(|&(cidr, provider)| {
            let (network, mask) = parse_cidr(cidr)?;
            Some((network, mask, provider))
        })
        .collect();
    ranges.sort_unstable_by_key(|&(network, _, _)| network);
    ranges
});

const KNOWN_RANGES: &[(&str, &str)] = &[
    // Cloudflare
    ("103.21.244.0/22", "cloudflare"),
    ("103.22.200.0/22", "cloudflare"),
    ("103.31.4.0/22", "cloudflare"),
    ("104.16.0.0/13", "cloudflare"),
    ("104.24.0.0/14", "cloudflare"),
    ("108.162.192.0/18", "cloudflare"),
    ("131.0.72.0/22", "cloudflare"),
    ("141.101.64.0/18", "cloudflare"),
    ("162.158.0.0/15", "cloudflare"),
    ("172.64.0.0/13", "cloudflare"),
    ("173.245.48.0/20", "cloudflare"),
    ("188.114.96.0/20", "cloudflare"),
    ("190.93.240.0/20", "cloudflare"),
    ("197.234.240.0/22", "cloudflare"),
    ("198.41.128.0/17", "cloudflare"),
    // Fastly
    ("146.75.0.0/16", "fastly"),
    ("151.101.0.0/16", "fastly"),
    ("199.232.0.0/16", "fastly"),
    // Amazon CloudFront
    ("13.32.0.0/15", "cloudfront"),
    ("13.224.0.0/14", "cloudfront"),
    ("52.84.0.0/15", "cloudfront"),
    ("54.230.0.0/16", "cloudfront"),
    ("99.84.0.0/16", "cloudfront"),
    ("204.246.164.0/22", "cloudfront"),
    ("205.251.192.0/19", "cloudfront"),
    // Akamai
    ("2.16.0.0/13", "akamai"),
    ("23.32.0.0/11", "akamai"),
    ("23.192.0.0/11", "akamai"),
    ("95.100.0.0/15", "akamai"),
    ("104.64.0.0/10", "akamai"),
    ("184.24.0.0/13", "akamai"),
    // Imperva Incapsula
    ("45.64.64.0/22", "incapsula"),
    ("103.28.248.0/22", "incapsula"),
    ("149.126.72.0/21", "incapsula"),
    ("198.143.32.0/19", "incapsula"),
    ("199.83.128.0/21", "incapsula"),
    // Sucuri
    ("66.248.200.0/22", "sucuri"),
    ("185.93.228.0/22", "sucuri"),
    ("192.124.249.0/24", "sucuri"),
];

fn parse_cidr(cidr: &str) -> Option<(u32, u32)> {
    let (addr, len) = cidr.split_once('/')?;
    let addr: Ipv4Addr = addr.parse().ok()?;
    let len: u8 = len.parse().ok()?;
    if len > 32 {
        return None;
    }
    let mask = if len == 0 {
        0
    } else {
        !((1u64 << (32 - len)) - 1) as u32
    };
    Some((u32::from(addr) & mask, mask))
}

/// Provider backed by the built-in range table.
#[derive(Debug, Default)]
pub struct RangeTableProvider;

impl CdnProvider for RangeTableProvider {
    fn classify(&self, ip: Ipv4Addr) -> Result<Option<&'static str>> {
        let bits = u32::from(ip);
        Ok(CDN_RANGES
            .iter()
            .find(|&&(network, mask, _)| bits & mask == network)
            .map(|&(_, _, provider)| provider))
    }
}

/// Dispatch-time policy: when enabled, hosts classified as CDN are only
/// probed on ports 80 and 443.
///
/// Classification failures fail open (treated as non-CDN) so a broken or
/// stale provider never silently drops reachable targets. Verdicts are
/// cached per address since every port of a host asks the same question.
pub struct CdnFilter {
    exclude_cdn: bool,
    provider: Box<dyn CdnProvider>,
    cache: DashMap<Ipv4Addr, Option<&'static str>>,
}

impl CdnFilter {
    pub fn new(exclude_cdn: bool) -> Self {
        Self::with_provider(exclude_cdn, Box::new(RangeTableProvider))
    }

    pub fn with_provider(exclude_cdn: bool, provider: Box<dyn CdnProvider>) -> Self {
        Self {
            exclude_cdn,
            provider,
            cache: DashMap::new(),
        }
    }

    /// Whether the pair may be dispatched under the CDN policy.
    pub fn allow(&self, ip: Ipv4Addr, port: u16) -> bool {
        if !self.exclude_cdn {
            return true;
        }
        match self.classify(ip) {
            Some(_) => CDN_ALLOWED_PORTS.contains(&port),
            None => true,
        }
    }

    /// Cached provider verdict for `ip`.
    pub fn classify(&self, ip: Ipv4Addr) -> Option<&'static str> {
        *self.cache.entry(ip).or_insert_with(|| {
            match self.provider.classify(ip) {
                Ok(verdict) => verdict,
                Err(e) => {
                    debug!("CDN classification for {ip} failed, assuming non-CDN: {e}");
                    None
                }
            }
        })
    }
}

impl std::fmt::Debug for CdnFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnFilter")
            .field("exclude_cdn", &self.exclude_cdn)
            .field("cached", &self.cache.len())
            .finish()
    }
}
