//! Provides a means to read, parse and hold configuration options for scans.
use clap::{Parser, ValueEnum};
use serde_derive::Deserialize;
use std::fs;
use std::path::PathBuf;

const LOWEST_PORT_NUMBER: u16 = 1;
const TOP_PORT_NUMBER: u16 = 65535;

// nmap's 100 most frequently open TCP ports
const TOP_100_PORTS: [u16; 100] = [
    7, 9, 13, 21, 22, 23, 25, 26, 37, 53, 79, 80, 81, 88, 106, 110, 111, 113, 119, 135, 139, 143,
    144, 179, 199, 389, 427, 443, 444, 445, 465, 513, 514, 515, 543, 544, 548, 554, 587, 631, 646,
    873, 990, 993, 995, 1025, 1026, 1027, 1028, 1029, 1110, 1433, 1720, 1723, 1755, 1900, 2000,
    2001, 2049, 2121, 2717, 3000, 3128, 3306, 3389, 3986, 4899, 5000, 5009, 5051, 5060, 5101,
    5190, 5357, 5432, 5631, 5666, 5800, 5900, 6000, 6001, 6646, 7070, 8000, 8008, 8009, 8080,
    8081, 8443, 8888, 9100, 9999, 10000, 32768, 49152, 49153, 49154, 49155, 49156, 49157,
];

/// Represents the scan technique.
///   - Connect performs full three-way handshakes through the socket API.
///   - Syn emits raw SYN probes and collects replies asynchronously; it
///     needs raw-socket privilege.
#[derive(Deserialize, Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Connect,
    Syn,
}

pub type Ports = Vec<u16>;

/// Parses a port specification: single ports, inclusive ranges, and the
/// symbolic groups `top` (the built-in top-100 set) and `full` (1-65535),
/// comma-separated in any combination.
pub fn parse_ports_and_ranges(input: &str) -> Result<Ports, String> {
    let mut ports = Vec::new();

    for part in input.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        match part {
            "full" => ports.extend(LOWEST_PORT_NUMBER..=TOP_PORT_NUMBER),
            "top" => ports.extend(TOP_100_PORTS),
            _ if part.contains('-') => {
                let range_ports = parse_port_range(part)?;
                ports.extend(range_ports);
            }
            _ => {
                let port = parse_single_port(part)?;
                ports.push(port);
            }
        }
    }

    if ports.is_empty() {
        return Err(String::from("No valid ports or ranges provided"));
    }

    ports.sort_unstable();
    ports.dedup();

    Ok(ports)
}

fn parse_port_range(range_str: &str) -> Result<Vec<u16>, String> {
    let range_parts: Vec<&str> = range_str.split('-').collect();
    if range_parts.len() != 2 {
        return Err(format!(
            "Invalid range format '{range_str}'. Expected 'start-end'. Example: 1-1000.",
        ));
    }

    let start: u16 = range_parts[0].parse().map_err(|_| {
        format!(
            "Invalid start port '{}' in range '{range_str}'",
            range_parts[0]
        )
    })?;
    let end: u16 = range_parts[1].parse().map_err(|_| {
        format!(
            "Invalid end port '{}' in range '{range_str}'",
            range_parts[1]
        )
    })?;

    if start > end {
        return Err(format!(
            "Start port {start} is greater than end port {end} in range '{range_str}'",
        ));
    }

    if start < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Ports in range '{range_str}' must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok((start..=end).collect())
}

fn parse_single_port(port_str: &str) -> Result<u16, String> {
    let port: u16 = port_str
        .parse()
        .map_err(|_| format!("Invalid port number '{port_str}'"))?;

    if port < LOWEST_PORT_NUMBER {
        return Err(format!(
            "Port {port} must be between {LOWEST_PORT_NUMBER} and {TOP_PORT_NUMBER}",
        ));
    }

    Ok(port)
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "portsweep",
    version = env!("CARGO_PKG_VERSION"),
    max_term_width = 120,
    help_template = "{bin} {version}\n{about}\n\nUSAGE:\n    {usage}\n\nOPTIONS:\n{options}",
)]
#[allow(clippy::struct_excessive_bools)]
/// High-throughput TCP port scanner.
/// WARNING Do not use this program against infrastructure you are not
/// authorized to scan; the SYN technique in particular emits raw packets at
/// the configured rate.
pub struct Opts {
    /// A comma-delimited list or newline-delimited file of CIDRs, IPs, or hosts to be scanned.
    #[arg(short, long, value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Ports and/or port ranges, plus the symbolic groups "top" and "full". Examples: 80,443,8080 or 1-1000 or full
    #[arg(short, long, alias = "range", value_parser = parse_ports_and_ranges, conflicts_with = "top")]
    pub ports: Option<Ports>,

    /// Use the built-in top-100 port set.
    #[arg(long)]
    pub top: bool,

    /// Packets per second. Also bounds the number of concurrent connect workers.
    #[arg(short, long, default_value = "1000")]
    pub rate: u32,

    /// The number of additional passes over the whole search space. Lost
    /// replies are recovered by rescanning, so stateless SYN scans want a
    /// couple of these.
    #[arg(long, default_value = "3")]
    pub retries: u8,

    /// The timeout in milliseconds before a port is assumed to be closed.
    #[arg(short, long, default_value = "1000")]
    pub timeout: u32,

    /// The scan technique to use. "syn" requires raw-socket privilege.
    #[arg(long, value_enum, ignore_case = true, default_value = "connect")]
    pub scan_type: ScanType,

    /// Source IPv4 address for raw SYN probes. Requires --interface.
    #[arg(long, requires = "interface")]
    pub source_ip: Option<String>,

    /// Network interface to emit raw SYN probes from. Requires --source-ip.
    #[arg(long, requires = "source_ip")]
    pub interface: Option<String>,

    /// Restrict hosts on known CDN ranges to ports 80 and 443.
    #[arg(long)]
    pub exclude_cdn: bool,

    /// A comma-delimited list of IPs or CIDRs that must never be probed.
    #[arg(short = 'x', long, value_delimiter = ',')]
    pub exclude_ips: Option<Vec<String>>,

    /// A comma-delimited list of ports to be excluded from scanning. Example: 80,443,8080.
    #[arg(short = 'e', long, value_delimiter = ',')]
    pub exclude_ports: Option<Vec<u16>>,

    /// Re-probe every discovered port with a full connect once the scan is
    /// done and keep only the survivors.
    #[arg(long)]
    pub verify: bool,

    /// Seconds to linger after the last probe so that straggling replies
    /// are still collected.
    #[arg(long, default_value = "2")]
    pub warm_up_time: u64,

    /// Write results to this path in addition to the output stream.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Emit structured JSON records instead of host:port lines.
    #[arg(long)]
    pub json: bool,

    /// Log periodic scan statistics.
    #[arg(long)]
    pub progress: bool,

    /// Command to hand discovered hosts and ports to after the scan,
    /// e.g. "nmap -sC -sV".
    #[arg(long)]
    pub nmap_cli: Option<String>,

    /// A comma-delimited list or file of DNS resolvers.
    #[arg(long)]
    pub resolver: Option<String>,

    /// Greppable mode. Only output the ports. Useful for grep or outputting to a file.
    #[arg(short, long)]
    pub greppable: bool,

    /// Accessible mode. Turns off features which negatively affect screen readers.
    #[arg(long)]
    pub accessible: bool,

    /// Whether to ignore the configuration file or not.
    #[arg(long)]
    pub no_config: bool,

    /// Custom path to config file
    #[arg(long, value_parser)]
    pub config_path: Option<PathBuf>,

    /// Automatically ups the ULIMIT with the value you provided.
    #[arg(short, long)]
    pub ulimit: Option<u64>,
}

impl Opts {
    pub fn read() -> Self {
        let mut opts = Opts::parse();

        // --top, or no port specification at all, means the built-in set
        if opts.top || opts.ports.is_none() {
            opts.ports = Some(TOP_100_PORTS.to_vec());
        }

        opts
    }

    /// Merge values found within the user configuration file into the
    /// command line arguments.
    pub fn merge(&mut self, config: &Config) {
        if !self.no_config {
            self.merge_required(config);
            self.merge_optional(config);
        }
    }

    fn merge_required(&mut self, config: &Config) {
        macro_rules! merge_required {
            ($($field: ident),+) => {
                $(
                    if let Some(e) = &config.$field {
                        self.$field = e.clone();
                    }
                )+
            }
        }

        merge_required!(
            addresses,
            rate,
            retries,
            timeout,
            scan_type,
            exclude_cdn,
            verify,
            warm_up_time,
            json,
            progress,
            greppable,
            accessible
        );
    }

    fn merge_optional(&mut self, config: &Config) {
        macro_rules! merge_optional {
            ($($field: ident),+) => {
                $(
                    if config.$field.is_some() {
                        self.$field = config.$field.clone();
                    }
                )+
            }
        }

        // Only use the built-in top ports when the user asks for them
        if self.top {
            self.ports = Some(TOP_100_PORTS.to_vec());
        } else if config.ports.is_some() {
            self.ports = config.ports.clone();
        }

        merge_optional!(
            resolver,
            ulimit,
            exclude_ports,
            exclude_ips,
            source_ip,
            interface,
            output,
            nmap_cli
        );
    }
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            addresses: vec![],
            ports: None,
            top: false,
            rate: 0,
            retries: 0,
            timeout: 0,
            scan_type: ScanType::Connect,
            source_ip: None,
            interface: None,
            exclude_cdn: false,
            exclude_ips: None,
            exclude_ports: None,
            verify: false,
            warm_up_time: 0,
            output: None,
            json: false,
            progress: false,
            nmap_cli: None,
            resolver: None,
            greppable: true,
            accessible: false,
            no_config: true,
            config_path: None,
            ulimit: None,
        }
    }
}

/// Struct used to deserialize the options specified within our config file.
/// These will be further merged with our command line arguments in order to
/// generate the final Opts struct.
#[derive(Debug, Deserialize)]
pub struct Config {
    addresses: Option<Vec<String>>,
    ports: Option<Vec<u16>>,
    rate: Option<u32>,
    retries: Option<u8>,
    timeout: Option<u32>,
    scan_type: Option<ScanType>,
    source_ip: Option<String>,
    interface: Option<String>,
    exclude_cdn: Option<bool>,
    exclude_ips: Option<Vec<String>>,
    exclude_ports: Option<Vec<u16>>,
    verify: Option<bool>,
    warm_up_time: Option<u64>,
    output: Option<PathBuf>,
    json: Option<bool>,
    progress: Option<bool>,
    nmap_cli: Option<String>,
    resolver: Option<String>,
    greppable: Option<bool>,
    accessible: Option<bool>,
    ulimit: Option<u64>,
}

impl Config {
    /// Reads the configuration file with TOML format and parses it into a
    /// Config struct.
    ///
    /// # Format
    ///
    /// addresses = ["127.0.0.1", "192.168.0.0/24"]
    /// ports = [80, 443, 8080]
    /// rate = 500
    /// scan_type = "Connect"
    /// exclude_ports = [8080, 9090]
    ///
    pub fn read(custom_config_path: Option<PathBuf>) -> Self {
        let mut content = String::new();
        let config_path = custom_config_path.unwrap_or_else(default_config_path);
        if config_path.exists() {
            content = fs::read_to_string(config_path).unwrap_or_default();
        }

        let config: Config = match toml::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                println!("Found {e} in configuration file.\nAborting scan.\n");
                std::process::exit(1);
            }
        };

        config
    }
}

/// Constructs default path to config toml
pub fn default_config_path() -> PathBuf {
    let Some(mut config_path) = dirs::home_dir() else {
        panic!("Could not infer config file path.");
    };
    config_path.push(".portsweep.toml");
    config_path
}
