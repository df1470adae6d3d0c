//! Coalesced IPv4 target ranges with indexed addressing.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// Sentinel entry returned by [`TargetIndex::fqdn_of`] when no name is known
/// for an address, meaning "emit the literal IP".
pub const NO_NAME: &str = "ip";

/// A contiguous block of IPv4 addresses, `count` addresses from `base` up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRange {
    pub base: u32,
    pub count: u32,
}

/// Ordered set of target ranges supporting `ip_of(i)` lookups into the
/// flattened host space.
///
/// Ranges are accumulated with [`add`](Self::add) during ingest and then
/// merged once by [`coalesce`](Self::coalesce): overlapping and adjacent
/// blocks collapse, the survivors are sorted ascending by base, and a prefix
/// sum array is built so that the i-th host is found with a binary search.
///
/// Host names observed while resolving targets are recorded per address and
/// surface again at output time through [`fqdn_of`](Self::fqdn_of).
#[derive(Debug, Default)]
pub struct TargetIndex {
    ranges: Vec<TargetRange>,
    prefix: Vec<u64>,
    coalesced: bool,
    names: HashMap<Ipv4Addr, Vec<String>>,
}

impl TargetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw range. Ranges may arrive overlapping and in any order.
    pub fn add(&mut self, base: u32, count: u32) {
        if count == 0 {
            return;
        }
        self.ranges.push(TargetRange { base, count });
        self.coalesced = false;
    }

    /// Insert a single address.
    pub fn add_ip(&mut self, ip: Ipv4Addr) {
        self.add(u32::from(ip), 1);
    }

    /// Remember that `name` resolved to `ip`.
    pub fn record_name(&mut self, ip: Ipv4Addr, name: &str) {
        let names = self.names.entry(ip).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }

    /// Merge overlapping and adjacent ranges and rebuild the prefix sums.
    /// Call once after ingest; lookups require it.
    pub fn coalesce(&mut self) {
        self.ranges.sort_unstable_by_key(|r| r.base);

        let mut merged: Vec<TargetRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            let start = u64::from(range.base);
            let end = start + u64::from(range.count); // exclusive
            match merged.last_mut() {
                Some(last) => {
                    let last_end = u64::from(last.base) + u64::from(last.count);
                    if start > last_end {
                        merged.push(range);
                    } else if end > last_end {
                        // overlap/adjacent, extend
                        let grown = end - u64::from(last.base);
                        if grown <= u64::from(u32::MAX) {
                            last.count = grown as u32;
                        } else {
                            // would overflow the per-range counter, keep the
                            // tail as its own block
                            merged.push(TargetRange {
                                base: last_end as u32,
                                count: (end - last_end) as u32,
                            });
                        }
                    }
                    // else fully contained, drop
                }
                None => merged.push(range),
            }
        }

        // prefix[0] = 0; prefix.len() == merged.len() + 1
        self.prefix = merged.iter().fold(vec![0u64], |mut acc, range| {
            let last = *acc.last().unwrap_or(&0);
            acc.push(last + u64::from(range.count));
            acc
        });
        self.ranges = merged;
        self.coalesced = true;
    }

    /// Total number of addressable hosts.
    pub fn count(&self) -> u64 {
        self.prefix.last().copied().unwrap_or(0)
    }

    /// The i-th host of the coalesced space, `i` in `[0, count())`.
    pub fn ip_of(&self, i: u64) -> Result<Ipv4Addr> {
        if !self.coalesced {
            bail!("target index queried before coalesce");
        }
        if i >= self.count() {
            bail!("host index {i} out of range (have {})", self.count());
        }
        // Find idx with prefix[idx] <= i < prefix[idx + 1].
        let idx = self.prefix.partition_point(|&p| p <= i) - 1;
        let offset = (i - self.prefix[idx]) as u32;
        Ok(Ipv4Addr::from(self.ranges[idx].base + offset))
    }

    /// Names recorded for `ip` at ingest, or the [`NO_NAME`] sentinel.
    pub fn fqdn_of(&self, ip: Ipv4Addr) -> Vec<String> {
        match self.names.get(&ip) {
            Some(names) if !names.is_empty() => names.clone(),
            _ => vec![NO_NAME.to_owned()],
        }
    }

    /// The coalesced ranges, ascending and disjoint.
    pub fn ranges(&self) -> &[TargetRange] {
        &self.ranges
    }
}
