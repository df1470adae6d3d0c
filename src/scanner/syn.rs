//! Raw SYN emission and asynchronous reply collection.
//!
//! The SYN pass is stateless at the port level: probes carry no per-flow
//! timers, and coverage comes from replaying whole passes plus the optional
//! connect verification afterwards. One background thread owns the raw
//! receive side and feeds SYN/ACK replies straight into the result store
//! until the scan state flips to Done.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use pnet::datalink;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::tcp::{ipv4_checksum, MutableTcpPacket, TcpFlags};
use pnet::transport::{
    tcp_packet_iter, transport_channel, TransportChannelType::Layer4,
    TransportProtocol::Ipv4, TransportReceiver, TransportSender,
};
use rand::Rng;

use crate::results::ScanResults;
use crate::scanner::{fmt_open, RunnerState, ScanState};

const TCP_HEADER_LEN: usize = 20;
const CHANNEL_BUFFER: usize = 4096;
/// How long the collector blocks on the capture handle before re-checking
/// whether the scan has finished.
const CAPTURE_POLL: Duration = Duration::from_millis(200);
/// Well-known external address used to learn the outbound route. Nothing is
/// ever sent to it; connecting a UDP socket only consults the routing table.
const ROUTE_PROBE_ADDR: &str = "8.8.8.8:80";

/// Source address and interface the raw probes leave from.
#[derive(Debug, Clone)]
pub struct SourceSelection {
    pub ip: Ipv4Addr,
    pub interface: String,
}

/// Pick the source for raw probes.
///
/// When the caller supplied both an address and an interface, and the
/// interface exists, that pair wins. Otherwise the outbound address is
/// discovered from the host routing table and matched back to the
/// interface that owns it.
pub fn resolve_source(
    source_ip: Option<Ipv4Addr>,
    interface: Option<&str>,
) -> Result<SourceSelection> {
    if let (Some(ip), Some(name)) = (source_ip, interface) {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == name)
            .ok_or_else(|| anyhow!("interface {name:?} not found"))?;
        if !iface.ips.iter().any(|net| net.ip() == IpAddr::V4(ip)) {
            debug!("source address {ip} is not bound on {name}, using it anyway");
        }
        return Ok(SourceSelection {
            ip,
            interface: iface.name,
        });
    }

    let ip = discover_source_ip()?;
    let iface = datalink::interfaces()
        .into_iter()
        .find(|i| i.ips.iter().any(|net| net.ip() == IpAddr::V4(ip)))
        .ok_or_else(|| anyhow!("no interface owns the outbound address {ip}"))?;
    Ok(SourceSelection {
        ip,
        interface: iface.name,
    })
}

fn discover_source_ip() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("binding route probe socket")?;
    socket
        .connect(ROUTE_PROBE_ADDR)
        .context("consulting the routing table for the outbound interface")?;
    match socket.local_addr().context("reading probe address")?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => bail!("outbound route resolved to IPv6 address {ip}"),
    }
}

/// An open raw TCP channel plus the fixed identity every probe is sent with.
///
/// All probes of a run share one ephemeral source port, which is also how
/// the collector tells our replies apart from unrelated traffic.
pub struct SynSession {
    tx: Mutex<TransportSender>,
    source_ip: Ipv4Addr,
    source_port: u16,
}

impl SynSession {
    /// Open the raw channel. Failing here usually means the process lacks
    /// raw-socket privilege, which is fatal for SYN mode.
    pub fn open(selection: &SourceSelection) -> Result<(Self, TransportReceiver)> {
        let protocol = Layer4(Ipv4(IpNextHeaderProtocols::Tcp));
        let (tx, rx) = transport_channel(CHANNEL_BUFFER, protocol)
            .context("opening raw TCP channel (SYN mode requires raw-socket privilege)")?;
        let source_port = rand::rng().random_range(32_768..61_000);
        debug!(
            "raw channel open, probing from {}:{} via {}",
            selection.ip, source_port, selection.interface
        );
        Ok((
            Self {
                tx: Mutex::new(tx),
                source_ip: selection.ip,
                source_port,
            },
            rx,
        ))
    }

    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    /// Craft and send one SYN. Never blocks beyond the raw send itself, so
    /// the dispatcher's pacing stays intact.
    pub fn send_syn(&self, ip: Ipv4Addr, port: u16) -> Result<()> {
        let mut buffer = [0u8; TCP_HEADER_LEN];
        let mut tcp = fill_syn(&mut buffer, self.source_port, port)?;
        let checksum = ipv4_checksum(&tcp.to_immutable(), &self.source_ip, &ip);
        tcp.set_checksum(checksum);

        let mut tx = self
            .tx
            .lock()
            .map_err(|_| anyhow!("raw send channel poisoned"))?;
        tx.send_to(tcp, IpAddr::V4(ip))
            .map(|_| ())
            .map_err(|e| anyhow!("raw send to {ip}:{port} failed: {e}"))
    }
}

/// Write a SYN header into `buffer` and hand back the packet view so the
/// caller can checksum it against the address pair.
fn fill_syn(buffer: &mut [u8], source_port: u16, port: u16) -> Result<MutableTcpPacket<'_>> {
    let mut tcp =
        MutableTcpPacket::new(buffer).ok_or_else(|| anyhow!("TCP header buffer too small"))?;
    tcp.set_source(source_port);
    tcp.set_destination(port);
    tcp.set_sequence(rand::rng().random());
    tcp.set_data_offset(5);
    tcp.set_flags(TcpFlags::SYN);
    tcp.set_window(1024);
    Ok(tcp)
}

/// Start the background reply collector.
///
/// It reads inbound TCP packets until the state machine reaches Done:
/// SYN/ACKs addressed to the session's source port whose origin port is in
/// the scanned set are recorded as open, RSTs and everything else are
/// discarded. Replies arriving after Done are dropped on the floor.
pub fn spawn_collector(
    mut rx: TransportReceiver,
    results: Arc<ScanResults>,
    state: Arc<ScanState>,
    ports: Arc<HashSet<u16>>,
    session_port: u16,
    greppable: bool,
    accessible: bool,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut replies = tcp_packet_iter(&mut rx);
        while state.current() != RunnerState::Done {
            match replies.next_with_timeout(CAPTURE_POLL) {
                Ok(Some((tcp, addr))) => {
                    let IpAddr::V4(ip) = addr else { continue };
                    if tcp.get_destination() != session_port {
                        continue;
                    }
                    let port = tcp.get_source();
                    if !ports.contains(&port) {
                        continue;
                    }
                    let flags = tcp.get_flags();
                    if flags & TcpFlags::RST != 0 {
                        continue;
                    }
                    if flags & TcpFlags::SYN != 0 && flags & TcpFlags::ACK != 0 {
                        if state.current() == RunnerState::Done {
                            break;
                        }
                        if results.add(ip, port) {
                            debug!("SYN/ACK from {ip}:{port}");
                            fmt_open((ip, port).into(), greppable, accessible);
                        }
                    }
                }
                // poll timeout, go back around and re-check the state
                Ok(None) => {}
                Err(e) => debug!("capture read error: {e}"),
            }
        }
        debug!("reply collector stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::tcp::TcpPacket;

    #[test]
    fn crafted_syn_has_the_right_shape() {
        let source = Ipv4Addr::new(192, 0, 2, 1);
        let target = Ipv4Addr::new(198, 51, 100, 7);
        let mut buffer = [0u8; TCP_HEADER_LEN];

        {
            let mut tcp = fill_syn(&mut buffer, 40_000, 443).unwrap();
            let checksum = ipv4_checksum(&tcp.to_immutable(), &source, &target);
            tcp.set_checksum(checksum);
        }

        let parsed = TcpPacket::new(&buffer).unwrap();
        assert_eq!(parsed.get_source(), 40_000);
        assert_eq!(parsed.get_destination(), 443);
        assert_eq!(parsed.get_flags(), TcpFlags::SYN);
        assert_eq!(parsed.get_data_offset(), 5);
        assert_eq!(
            parsed.get_checksum(),
            ipv4_checksum(&parsed, &source, &target)
        );
    }

    #[test]
    fn crafted_syns_vary_their_sequence_numbers() {
        let mut first = [0u8; TCP_HEADER_LEN];
        let mut second = [0u8; TCP_HEADER_LEN];
        fill_syn(&mut first, 40_000, 80).unwrap();
        fill_syn(&mut second, 40_000, 80).unwrap();

        let first = TcpPacket::new(&first).unwrap().get_sequence();
        let second = TcpPacket::new(&second).unwrap().get_sequence();
        assert_ne!(first, second);
    }

    #[test]
    fn source_discovery_returns_a_routable_v4() {
        // Consults the routing table only; no packets leave the machine.
        if let Ok(selection) = resolve_source(None, None) {
            assert!(!selection.ip.is_unspecified());
            assert!(!selection.interface.is_empty());
        }
    }

    #[test]
    fn unknown_interface_is_an_error() {
        let result = resolve_source(Some(Ipv4Addr::new(192, 0, 2, 1)), Some("does-not-exist0"));
        assert!(result.is_err());
    }
}
