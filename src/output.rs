//! Writes scan results to streams and files, and hands them off to an
//! external post-processor.

use std::fs::{DirBuilder, File};
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, warn};
use serde_derive::Serialize;

use crate::results::ScanResults;
use crate::targets::{TargetIndex, NO_NAME};

/// One structured output record. `host` is left out when it would just
/// repeat the address.
#[derive(Serialize, Debug, PartialEq, Eq)]
pub struct Record {
    pub ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct OutputOptions {
    /// File destination, written in parallel to the stream.
    pub file: Option<PathBuf>,
    /// JSON records instead of `host:port` lines.
    pub json: bool,
}

/// Emit every discovered pair to `stream`, and to the configured file.
///
/// A file that cannot be created only costs the file copy: results already
/// flowing to the stream are never rolled back, so the failure is logged
/// and emission continues.
pub fn emit<W: Write>(
    results: &ScanResults,
    targets: &TargetIndex,
    options: &OutputOptions,
    stream: &mut W,
) -> Result<()> {
    let mut file = match &options.file {
        Some(path) => match create_output_file(path, options.json) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("could not create output file: {e:#}");
                None
            }
        },
        None => None,
    };

    for (ip, ports) in results.snapshot() {
        let names = targets.fqdn_of(ip);
        if names.is_empty() {
            debug!("no usable name for {ip}, skipping its results");
            continue;
        }
        for port in ports {
            for name in &names {
                let line = render(ip, name, port, options.json)?;
                if let Err(e) = writeln!(stream, "{line}") {
                    warn!("stream write failed: {e}");
                }
                if let Some(file) = &mut file {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!("file write failed: {e}");
                    }
                }
            }
        }
    }

    if let Some(mut file) = file {
        if let Err(e) = file.flush() {
            warn!("file flush failed: {e}");
        }
    }
    Ok(())
}

fn render(ip: Ipv4Addr, name: &str, port: u16, json: bool) -> Result<String> {
    let ip_string = ip.to_string();
    let named = name != NO_NAME && name != ip_string;
    if json {
        let record = Record {
            ip: ip_string,
            host: named.then(|| name.to_owned()),
            port,
        };
        serde_json::to_string(&record).context("serializing result record")
    } else if named {
        Ok(format!("{name}:{port}"))
    } else {
        Ok(format!("{ip_string}:{port}"))
    }
}

/// Resolve the final path (structured mode gets a `.json` suffix) and open
/// it, creating missing parent directories with owner-only permissions.
fn create_output_file(path: &Path, json: bool) -> Result<BufWriter<File>> {
    let target = resolve_path(path, json);

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            let mut builder = DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder
                .create(parent)
                .with_context(|| format!("creating output directory {}", parent.display()))?;
        }
    }

    let file = File::create(&target)
        .with_context(|| format!("creating output file {}", target.display()))?;
    debug!("writing results to {}", target.display());
    Ok(BufWriter::new(file))
}

fn resolve_path(path: &Path, json: bool) -> PathBuf {
    if json && path.extension().is_none_or(|ext| ext != "json") {
        let mut with_suffix = path.as_os_str().to_owned();
        with_suffix.push(".json");
        PathBuf::from(with_suffix)
    } else {
        path.to_path_buf()
    }
}

/// Hand the discovered hosts and ports to an external command, in the
/// `nmap` tradition: the union of open ports goes in via `-p`, the hosts
/// are appended as positional arguments. Failures are logged, never fatal.
pub fn run_post_processor(command: &str, results: &ScanResults, targets: &TargetIndex) {
    if results.is_empty() {
        debug!("no results, skipping post-processor");
        return;
    }

    let mut parts = command.split_whitespace();
    let Some(program) = parts.next() else {
        warn!("empty post-processor command");
        return;
    };

    let snapshot = results.snapshot();
    let ports: Vec<u16> = snapshot
        .iter()
        .flat_map(|(_, ports)| ports.iter().copied())
        .sorted_unstable()
        .dedup()
        .collect();
    let hosts: Vec<String> = snapshot
        .iter()
        .map(|(ip, _)| {
            let names = targets.fqdn_of(*ip);
            match names.first() {
                Some(name) if name != NO_NAME => name.clone(),
                _ => ip.to_string(),
            }
        })
        .collect();

    let port_arg = ports.iter().join(",");
    debug!("handing off to {program}: -p {port_arg} {hosts:?}");

    let status = Command::new(program)
        .args(parts)
        .arg("-p")
        .arg(port_arg)
        .args(&hosts)
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => warn!("post-processor exited with {status}"),
        Err(e) => warn!("failed to launch post-processor {program:?}: {e}"),
    }
}
