//! Per-protocol proxy validation.
//!
//! Each admitted candidate yields exactly one [`CheckResult`]. HTTP
//! candidates are probed through a per-check client built from one shared
//! recipe (reqwest pins the upstream proxy at construction); SOCKS
//! candidates use raw handshakes. A counting semaphore bounds the batch, and
//! SOCKS checks run under a second, smaller semaphore because their dialers
//! cannot pool connections.

pub mod fastfilter;
pub mod socks;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use futures::stream::{FuturesUnordered, StreamExt};
use proxy_feed::{Candidate, Protocol};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{CheckMode, CheckerConfig, SocksMode};
use crate::metrics::Collector;

/// Outcome of one validation attempt.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub address: String,
    pub protocol: Protocol,
    pub alive: bool,
    pub latency_ms: i64,
    pub error: String,
}

#[derive(Clone)]
pub struct Checker {
    config: CheckerConfig,
    metrics: Arc<Collector>,
    in_flight: Arc<AtomicUsize>,
    socks_host: String,
    socks_port: u16,
    socks_path: String,
}

impl Checker {
    pub fn new(config: CheckerConfig, metrics: Arc<Collector>) -> anyhow::Result<Self> {
        let url = url::Url::parse(&config.socks_test_url)?;
        let socks_host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("socks_test_url has no host"))?
            .to_string();
        let socks_port = url.port_or_known_default().unwrap_or(80);
        let socks_path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Self {
            config,
            metrics,
            in_flight: Arc::new(AtomicUsize::new(0)),
            socks_host,
            socks_port,
            socks_path,
        })
    }

    /// Number of checks currently running; feeds adaptive backpressure.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CheckerConfig {
        &self.config
    }

    /// Validate a batch of candidates under `concurrency` simultaneous
    /// checks. Cancellation discards pending results; completed results are
    /// returned in no particular order.
    pub async fn check_batch(
        &self,
        cancel: &CancellationToken,
        candidates: Vec<Candidate>,
        concurrency: usize,
    ) -> Vec<CheckResult> {
        let total = candidates.len();
        if total == 0 {
            return Vec::new();
        }

        let started = Instant::now();
        info!("checking {total} candidates, concurrency={concurrency}");

        let global = Arc::new(Semaphore::new(concurrency.max(1)));
        let socks_limit = self.config.socks_concurrency.clamp(1, concurrency.max(1));
        let socks_sem = Arc::new(Semaphore::new(socks_limit));

        let mut tasks = FuturesUnordered::new();
        let batch = self.config.batch_size.max(1);
        for (i, chunk) in candidates.chunks(batch).enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                // brief pause between chunks to spread connect bursts
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            for candidate in chunk {
                let this = self.clone();
                let cancel = cancel.clone();
                let global = global.clone();
                let socks_sem = socks_sem.clone();
                let candidate = candidate.clone();
                tasks.push(tokio::spawn(async move {
                    let _permit = tokio::select! {
                        _ = cancel.cancelled() => return None,
                        p = global.acquire_owned() => p.ok()?,
                    };
                    let _socks_permit = if candidate.protocol != Protocol::Http {
                        Some(tokio::select! {
                            _ = cancel.cancelled() => return None,
                            p = socks_sem.acquire_owned() => p.ok()?,
                        })
                    } else {
                        None
                    };

                    this.in_flight.fetch_add(1, Ordering::Relaxed);
                    let result = this.check_with_retries(&cancel, &candidate).await;
                    this.in_flight.fetch_sub(1, Ordering::Relaxed);
                    result
                }));
            }
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.next().await {
            let Ok(Some(result)) = joined else { continue };
            if result.alive {
                self.metrics.record_check_success();
                self.metrics.record_check_duration(result.latency_ms as f64 / 1000.0);
            } else {
                self.metrics.record_check_failure();
            }
            results.push(result);
        }

        info!(
            "check batch complete: {}/{} results in {:?}",
            results.len(),
            total,
            started.elapsed()
        );
        results
    }

    /// One check plus up to `retries` re-attempts with quadratic backoff.
    /// Returns `None` only when cancelled mid-flight.
    async fn check_with_retries(
        &self,
        cancel: &CancellationToken,
        candidate: &Candidate,
    ) -> Option<CheckResult> {
        let mut last_error = String::new();

        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(u64::from(attempt * attempt) * 100);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                r = self.check_once(candidate) => r,
            };
            if result.alive {
                return Some(result);
            }
            last_error = result.error;
        }

        Some(CheckResult {
            address: candidate.address.clone(),
            protocol: candidate.protocol,
            alive: false,
            latency_ms: 0,
            error: last_error,
        })
    }

    async fn check_once(&self, candidate: &Candidate) -> CheckResult {
        let started = Instant::now();
        let outcome = match candidate.protocol {
            Protocol::Http => match self.config.mode {
                CheckMode::ConnectOnly => self.connect_only(&candidate.address).await,
                CheckMode::FullHttp => self.http_check(&candidate.address).await,
            },
            Protocol::Socks4 | Protocol::Socks5 => self.socks_check(candidate).await,
        };

        match outcome {
            Ok(()) => CheckResult {
                address: candidate.address.clone(),
                protocol: candidate.protocol,
                alive: true,
                latency_ms: started.elapsed().as_millis() as i64,
                error: String::new(),
            },
            Err(e) => CheckResult {
                address: candidate.address.clone(),
                protocol: candidate.protocol,
                alive: false,
                latency_ms: 0,
                error: e.to_string(),
            },
        }
    }

    async fn connect_only(&self, address: &str) -> anyhow::Result<()> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => bail!("connect: {e}"),
            Err(_) => bail!("connect timeout"),
        }
    }

    /// GET the test endpoint through the proxy. Statuses in [200, 400) count
    /// as alive; redirects are returned, not followed.
    async fn http_check(&self, address: &str) -> anyhow::Result<()> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let proxy = reqwest::Proxy::all(format!("http://{address}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(timeout / 2)
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .http1_only()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let resp = client
            .get(&self.config.test_url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("request: {e}"))?;

        let status = resp.status().as_u16();
        if (200..400).contains(&status) {
            Ok(())
        } else {
            bail!("HTTP {status}")
        }
    }

    /// Dial within half the SOCKS budget, then run the protocol exchange in
    /// the other half.
    async fn socks_check(&self, candidate: &Candidate) -> anyhow::Result<()> {
        if !self.config.socks_enabled {
            bail!("SOCKS checking disabled");
        }

        let half = Duration::from_millis(self.config.socks_timeout_ms / 2);
        let mut stream =
            match tokio::time::timeout(half, TcpStream::connect(&candidate.address)).await {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => bail!("connect: {e}"),
                Err(_) => bail!("connect timeout"),
            };

        let exchange = async {
            match candidate.protocol {
                Protocol::Socks5 => {
                    socks::socks5_tunnel(&mut stream, &self.socks_host, self.socks_port).await?
                }
                Protocol::Socks4 => {
                    socks::socks4_tunnel(&mut stream, &self.socks_host, self.socks_port).await?
                }
                Protocol::Http => bail!("not a socks candidate"),
            }
            if self.config.socks_mode == SocksMode::FullHttp {
                let status =
                    socks::http_get_via_tunnel(&mut stream, &self.socks_host, &self.socks_path)
                        .await?;
                if !(200..400).contains(&status) {
                    bail!("HTTP {status}");
                }
            }
            Ok(())
        };

        match tokio::time::timeout(half, exchange).await {
            Ok(r) => r,
            Err(_) => bail!("socks timeout"),
        }
    }
}
