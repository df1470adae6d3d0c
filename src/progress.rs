//! Periodic scan statistics on the log stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use tokio::task::JoinHandle;

const TICK: Duration = Duration::from_secs(5);

/// Counters shared between the dispatcher, the workers and the reporter.
/// Plain atomics: they are bumped from hot paths and must not contend.
#[derive(Debug)]
pub struct ScanStats {
    packets: AtomicU64,
    started: Instant,
}

impl ScanStats {
    pub fn new() -> Self {
        Self {
            packets: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn add_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Default for ScanStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Static dimensions of the running scan, printed with every tick.
#[derive(Debug, Clone, Copy)]
pub struct Labels {
    pub hosts: u64,
    pub ports: usize,
    pub retries: u8,
    pub total: u64,
}

/// Start the reporter task. It logs one summary line every five seconds
/// until aborted; the scan itself never depends on it.
pub fn spawn_reporter(stats: Arc<ScanStats>, labels: Labels) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(TICK);
        // the first tick of an interval fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let packets = stats.packets();
            let seconds = stats.elapsed().as_secs_f64();
            let pps = if seconds > 0.0 {
                packets as f64 / seconds
            } else {
                0.0
            };
            let percent = if labels.total > 0 {
                packets as f64 * 100.0 / labels.total as f64
            } else {
                0.0
            };
            info!(
                "{}s elapsed | hosts: {} ports: {} retries: {} | {:.0} pps | {}/{} ({:.1}%)",
                seconds as u64,
                labels.hosts,
                labels.ports,
                labels.retries,
                pps,
                packets,
                labels.total,
                percent
            );
        }
    })
}
