//! This crate exposes the internal functionality of the portsweep port
//! scanner.
//!
//! portsweep enumerates a potentially huge (host x port) search space at a
//! fixed packet rate and reports every pair with a TCP listener behind it.
//! Two techniques are available: an unprivileged *connect* scan performing
//! full three-way handshakes, and a privileged stateless *SYN* scan that
//! emits raw probes and correlates SYN/ACK replies asynchronously.
//!
//! ## Architecture Overview
//!
//! 1. **Input Processing**: addresses, CIDRs and host files are parsed and
//!    resolved into a coalesced [`TargetIndex`](targets::TargetIndex)
//! 2. **Shuffled Enumeration**: a keyed bijection
//!    ([`Permutation`](permute::Permutation)) walks the flattened
//!    (host x port) space in a de-correlated order without materializing it
//! 3. **Paced Dispatch**: a token bucket ([`RateLimiter`](rate::RateLimiter))
//!    caps the probe rate; a CDN policy filter can restrict well-known CDN
//!    ranges to the HTTP(S) ports
//! 4. **Probing**: connect workers or the raw SYN session test each pair;
//!    open pairs land in the shared [`ScanResults`](results::ScanResults)
//! 5. **Output**: results are written as text or JSON records and can be
//!    handed to an external post-processor such as nmap
//!
//! ## Basic Usage Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use portsweep::cdn::CdnFilter;
//! use portsweep::input::ScanType;
//! use portsweep::scanner::{ScanConfig, Scanner};
//! use portsweep::targets::TargetIndex;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut targets = TargetIndex::new();
//!     targets.add_ip("127.0.0.1".parse()?);
//!     targets.coalesce();
//!
//!     let config = ScanConfig {
//!         rate: 1000,
//!         retries: 1,
//!         timeout: Duration::from_millis(500),
//!         scan_type: ScanType::Connect,
//!         verify: false,
//!         warm_up: Duration::ZERO,
//!         source_ip: None,
//!         interface: None,
//!         progress: false,
//!         greppable: true,
//!         accessible: true,
//!     };
//!
//!     let scanner = Scanner::new(
//!         config,
//!         targets,
//!         vec![22, 80, 443],
//!         Vec::new(),
//!         CdnFilter::new(false),
//!     );
//!     scanner.run().await?;
//!
//!     for (ip, ports) in scanner.results().snapshot() {
//!         println!("{ip} -> {ports:?}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod tui;

pub mod input;

pub mod address;

pub mod targets;

pub mod permute;

pub mod rate;

pub mod cdn;

pub mod results;

pub mod scanner;

pub mod progress;

pub mod output;
