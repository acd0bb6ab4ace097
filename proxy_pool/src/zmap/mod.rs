//! External port-scanner supervision.
//!
//! The scanner runs as a subprocess, never as a library: it needs elevated
//! capabilities the service should not carry. The driver builds the argument
//! vector, enforces the runtime deadline, streams scanner output into the
//! service logs and parses the CSV results into candidates.

pub mod preflight;
pub mod safety;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use proxy_feed::{harvester, Candidate, Protocol};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::metrics::Collector;

/// Extra slack past `max_runtime_seconds` before the process is killed; the
/// scanner's own `-T` flag should normally fire first.
const DEADLINE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZmapConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default)]
    pub bandwidth: String,
    #[serde(default = "default_max_runtime")]
    pub max_runtime_seconds: u64,
    #[serde(default)]
    pub target_ranges: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub interface: String,
    #[serde(default = "default_binary")]
    pub zmap_binary: String,
    #[serde(default, rename = "zmap_extra_args")]
    pub extra_args: Vec<String>,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for ZmapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ports: Vec::new(),
            rate_limit: default_rate_limit(),
            bandwidth: String::new(),
            max_runtime_seconds: default_max_runtime(),
            target_ranges: Vec::new(),
            blacklist: Vec::new(),
            interface: String::new(),
            zmap_binary: default_binary(),
            extra_args: Vec::new(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

fn default_rate_limit() -> u32 {
    10_000
}

fn default_max_runtime() -> u64 {
    600
}

fn default_binary() -> String {
    "zmap".into()
}

fn default_cooldown() -> u64 {
    3_600
}

/// Point-in-time scanner statistics, surfaced by `/stats/zmap`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub last_scan_time: Option<DateTime<Utc>>,
    pub last_scan_duration_secs: f64,
    pub candidates_found: usize,
    pub total_scans: u64,
}

pub struct ZmapScanner {
    config: ZmapConfig,
    metrics: Arc<Collector>,
    stats: RwLock<ScanStats>,
}

impl ZmapScanner {
    pub fn new(config: ZmapConfig, metrics: Arc<Collector>) -> Self {
        Self {
            config,
            metrics,
            stats: RwLock::new(ScanStats::default()),
        }
    }

    pub fn config(&self) -> &ZmapConfig {
        &self.config
    }

    pub fn stats(&self) -> ScanStats {
        self.stats.read().clone()
    }

    /// Run the scanner for every configured port, sequentially to keep one
    /// rate limit on the wire, and return the deduplicated union. Per-port
    /// failures are logged and counted; they never fail the scan.
    pub async fn scan(&self, cancel: &CancellationToken) -> Vec<Candidate> {
        let start_time = Utc::now();
        let started = Instant::now();
        info!("starting scan on ports {:?}", self.config.ports);

        let mut all = Vec::new();
        for &port in &self.config.ports {
            if cancel.is_cancelled() {
                break;
            }
            match self.scan_port(cancel, port).await {
                Ok(addresses) => {
                    let protocol = port_protocol(port);
                    info!(
                        "port {port} scan complete: {} candidates (protocol: {protocol})",
                        addresses.len()
                    );
                    self.metrics.record_zmap_scan(port, "success");
                    self.metrics.record_zmap_candidates(port, addresses.len());
                    all.extend(addresses.into_iter().map(|a| Candidate::new(a, protocol)));
                }
                Err(e) => {
                    error!("port {port} scan failed: {e}");
                    self.metrics.record_zmap_scan(port, "error");
                }
            }
        }

        let unique = harvester::dedup_candidates(all);
        let duration = started.elapsed();

        {
            let mut stats = self.stats.write();
            stats.last_scan_time = Some(start_time);
            stats.last_scan_duration_secs = duration.as_secs_f64();
            stats.candidates_found = unique.len();
            stats.total_scans += 1;
        }
        self.metrics.record_zmap_duration(duration.as_secs_f64());

        info!("scan complete: {} unique candidates in {:?}", unique.len(), duration);
        unique
    }

    async fn scan_port(&self, cancel: &CancellationToken, port: u16) -> anyhow::Result<Vec<String>> {
        let outfile = tempfile::Builder::new()
            .prefix(&format!("zmap_port_{port}_"))
            .suffix(".csv")
            .tempfile()?;
        let out_path = outfile.path().to_path_buf();

        let args = self.build_args(port, &out_path.to_string_lossy());
        info!("executing: {} {}", self.config.zmap_binary, args.join(" "));

        let mut child = Command::new(&self.config.zmap_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(target: "zmap", "{line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(target: "zmap", "{line}");
                }
            });
        }

        let deadline = Duration::from_secs(self.config.max_runtime_seconds) + DEADLINE_GRACE;
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("scan cancelled");
            }
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    bail!("scanner exited with {status}");
                }
            }
            _ = tokio::time::sleep(deadline) => {
                // Partial output is still worth parsing.
                warn!(
                    "port {port} scan exceeded {}s, killing scanner",
                    self.config.max_runtime_seconds
                );
                let _ = child.kill().await;
            }
        }

        parse_output(&out_path, port).await
    }

    fn build_args(&self, port: u16, outfile: &str) -> Vec<String> {
        let mut args = vec![
            "-p".into(),
            port.to_string(),
            "-r".into(),
            self.config.rate_limit.to_string(),
            "-o".into(),
            outfile.into(),
            "--output-fields=saddr".into(),
            "--output-module=csv".into(),
        ];

        if !self.config.bandwidth.is_empty() {
            args.push("-B".into());
            args.push(self.config.bandwidth.clone());
        }
        if self.config.max_runtime_seconds > 0 {
            args.push("-T".into());
            args.push(self.config.max_runtime_seconds.to_string());
        }
        for blacklist in &self.config.blacklist {
            if Path::new(blacklist).exists() {
                args.push("-b".into());
                args.push(blacklist.clone());
            } else {
                warn!("blacklist file not found: {blacklist}");
            }
        }
        if !self.config.interface.is_empty() {
            args.push("-i".into());
            args.push(self.config.interface.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());

        if self.config.target_ranges.is_empty() {
            warn!("no target ranges configured; the scanner will sweep the entire IPv4 space");
        } else {
            args.extend(self.config.target_ranges.iter().cloned());
        }

        args
    }
}

/// Ports the scanner sweeps map onto the protocol the candidate most likely
/// speaks; unknown ports default to http.
pub fn port_protocol(port: u16) -> Protocol {
    match port {
        80 | 8080 | 3128 | 8888 | 9090 => Protocol::Http,
        1080 => Protocol::Socks5,
        1081 => Protocol::Socks4,
        _ => Protocol::Http,
    }
}

/// Parse the scanner's CSV output: one `saddr` column, optional header.
async fn parse_output(path: &Path, port: u16) -> anyhow::Result<Vec<String>> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut addresses = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line == "saddr" || line.starts_with('#') {
            continue;
        }
        if line.parse::<std::net::Ipv4Addr>().is_err() {
            continue;
        }
        addresses.push(format!("{line}:{port}"));
    }
    Ok(addresses)
}
