//! Concurrent store of discovered open (address, port) pairs.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use dashmap::DashMap;

/// Shared set of open ports per host.
///
/// All scan-time producers (connect workers, the SYN reply collector and the
/// verification pass) mutate this concurrently, so insertion goes through
/// the map's entry-level locking rather than one coarse lock around the
/// whole structure. Each (ip, port) pair is stored at most once regardless
/// of how many passes rediscover it.
#[derive(Debug, Default)]
pub struct ScanResults {
    open: DashMap<Ipv4Addr, HashSet<u16>>,
}

impl ScanResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open pair. Returns true when the pair was not known yet.
    pub fn add(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.open.entry(ip).or_default().insert(port)
    }

    /// Whether the pair is already recorded.
    pub fn has(&self, ip: Ipv4Addr, port: u16) -> bool {
        self.open.get(&ip).is_some_and(|ports| ports.contains(&port))
    }

    /// Replace a host's port set wholesale. An empty set removes the host.
    pub fn set(&self, ip: Ipv4Addr, ports: HashSet<u16>) {
        if ports.is_empty() {
            self.open.remove(&ip);
        } else {
            self.open.insert(ip, ports);
        }
    }

    /// Number of hosts with at least one open port.
    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Sorted snapshot of the current state, hosts ascending, ports
    /// ascending per host. Only meaningful once scanning has finished.
    pub fn snapshot(&self) -> Vec<(Ipv4Addr, Vec<u16>)> {
        let mut hosts: Vec<(Ipv4Addr, Vec<u16>)> = self
            .open
            .iter()
            .map(|entry| {
                let mut ports: Vec<u16> = entry.value().iter().copied().collect();
                ports.sort_unstable();
                (*entry.key(), ports)
            })
            .collect();
        hosts.sort_unstable_by_key(|(ip, _)| u32::from(*ip));
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn add_dedups() {
        let results = ScanResults::new();
        let ip = Ipv4Addr::new(10, 0, 0, 2);
        assert!(results.add(ip, 80));
        assert!(!results.add(ip, 80));
        assert!(results.add(ip, 443));
        assert_eq!(results.snapshot(), vec![(ip, vec![80, 443])]);
    }

    #[test]
    fn has_and_set() {
        let results = ScanResults::new();
        let ip = Ipv4Addr::new(192, 168, 1, 1);
        results.add(ip, 80);
        results.add(ip, 81);
        assert!(results.has(ip, 81));

        results.set(ip, HashSet::from([80]));
        assert!(results.has(ip, 80));
        assert!(!results.has(ip, 81));

        results.set(ip, HashSet::new());
        assert!(results.is_empty());
    }

    #[test]
    fn concurrent_adds_converge() {
        let results = Arc::new(ScanResults::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let results = Arc::clone(&results);
            handles.push(thread::spawn(move || {
                for host in 0..16u32 {
                    let ip = Ipv4Addr::from(0x0a00_0000 + host);
                    for port in 1..=64u16 {
                        results.add(ip, port);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = results.snapshot();
        assert_eq!(snapshot.len(), 16);
        for (_, ports) in snapshot {
            assert_eq!(ports, (1..=64).collect::<Vec<u16>>());
        }
    }
}
