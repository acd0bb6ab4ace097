//! The cycle controller.
//!
//! One cycle: aggregate -> launch the scanner in parallel -> fast-filter and
//! validate the scraped set -> publish -> wait for the scanner (bounded) ->
//! validate the scanned set -> publish the union. Publishing the scraped
//! pass immediately keeps the API fresh while scanning, which dominates
//! cycle time, runs in the background.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use proxy_feed::{Aggregator, Candidate};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checker::{fastfilter, CheckResult, Checker};
use crate::config::Config;
use crate::metrics::Collector;
use crate::snapshot::{AliveProxy, ProxySource, SnapshotStore, Stats};
use crate::zmap::ZmapScanner;

/// The fast filter only pays off on bulk input.
const FAST_FILTER_THRESHOLD: usize = 1_000;

/// Ceiling on waiting for the scanner, even if its own runtime limit failed.
const SCAN_HARD_DEADLINE: Duration = Duration::from_secs(15 * 60);

const MEMORY_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

pub struct Orchestrator {
    config: Config,
    aggregator: Aggregator,
    checker: Checker,
    zmap: Option<Arc<ZmapScanner>>,
    snapshot: Arc<SnapshotStore>,
    metrics: Arc<Collector>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        aggregator: Aggregator,
        checker: Checker,
        zmap: Option<Arc<ZmapScanner>>,
        snapshot: Arc<SnapshotStore>,
        metrics: Arc<Collector>,
    ) -> Self {
        Self {
            config,
            aggregator,
            checker,
            zmap,
            snapshot,
            metrics,
        }
    }

    /// Cycle loop: an immediate first cycle, then the configured cadence.
    /// A reload signal starts an out-of-band cycle; cancellation exits.
    pub async fn run(&self, cancel: CancellationToken, mut reload: mpsc::Receiver<()>) {
        self.run_once(&cancel).await;

        let interval = Duration::from_secs(self.config.aggregator.interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cycle loop stopped");
                    return;
                }
                _ = ticker.tick() => self.run_once(&cancel).await,
                signal = reload.recv() => match signal {
                    Some(()) => {
                        info!("out-of-band cycle triggered");
                        self.run_once(&cancel).await;
                    }
                    None => return,
                },
            }
        }
    }

    /// One full cycle. Cancellation at any point discards pending results
    /// without publishing a partial snapshot.
    pub async fn run_once(&self, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let started = Instant::now();
        info!("starting aggregation cycle");

        let (scraped, reports) = tokio::select! {
            _ = cancel.cancelled() => return,
            result = self.aggregator.aggregate() => match result {
                Ok(pair) => pair,
                Err(e) => {
                    error!("aggregation failed: {e}");
                    return;
                }
            },
        };
        for report in reports.values() {
            self.metrics
                .record_proxies_scraped(&report.url, report.proxies_found);
        }
        let total_scraped = scraped.len();
        info!(
            "aggregated {total_scraped} unique candidates from {} sources",
            reports.len()
        );

        // The scanner runs while scraped candidates are validated; the API
        // must not wait for it.
        let scan_task = self.zmap.clone().map(|scanner| {
            info!("launching scan in parallel with scraped validation");
            let scan_cancel = cancel.child_token();
            tokio::spawn(async move { scanner.scan(&scan_cancel).await })
        });
        let scraped_keys: HashSet<String> = scraped.iter().map(Candidate::key).collect();

        let scraped_results = self.filter_and_check(cancel, scraped).await;
        if cancel.is_cancelled() {
            info!("cycle cancelled, discarding results");
            return;
        }

        let scraped_alive = alive_entries(&scraped_results, ProxySource::Scraped);
        let scraped_dead = scraped_results.len() - scraped_alive.len();
        let stats = Stats {
            total_scraped,
            total_alive: scraped_alive.len(),
            total_dead: scraped_dead,
            alive_percent: percent(scraped_alive.len(), scraped_results.len()),
            last_check_time: Utc::now(),
            source_stats: reports.clone(),
        };
        info!(
            "scraped pass: {} alive, {} dead ({:.2}% alive)",
            scraped_alive.len(),
            scraped_dead,
            stats.alive_percent
        );
        self.snapshot.update(scraped_alive.clone(), stats.clone());

        if let Some(mut task) = scan_task {
            let scanned = tokio::select! {
                _ = cancel.cancelled() => {
                    task.abort();
                    return;
                }
                _ = tokio::time::sleep(SCAN_HARD_DEADLINE) => {
                    warn!("scan exceeded the 15 minute ceiling, discarding");
                    task.abort();
                    Vec::new()
                }
                joined = &mut task => joined.unwrap_or_default(),
            };
            // Merge point: a pair already validated in the scraped pass is
            // not checked twice.
            let scanned: Vec<Candidate> = scanned
                .into_iter()
                .filter(|c| !scraped_keys.contains(&c.key()))
                .collect();

            if scanned.is_empty() {
                info!("no scanned candidates to validate");
            } else {
                info!("validating {} scanned candidates", scanned.len());
                let scanned_results = self.filter_and_check(cancel, scanned).await;
                if cancel.is_cancelled() {
                    info!("cycle cancelled, discarding results");
                    return;
                }

                let scanned_alive = alive_entries(&scanned_results, ProxySource::Zmap);
                let scanned_dead = scanned_results.len() - scanned_alive.len();
                let total_alive = stats.total_alive + scanned_alive.len();
                let total_dead = stats.total_dead + scanned_dead;
                let combined_stats = Stats {
                    total_scraped,
                    total_alive,
                    total_dead,
                    alive_percent: percent(total_alive, total_alive + total_dead),
                    last_check_time: Utc::now(),
                    source_stats: reports,
                };
                info!(
                    "scanned pass: {} alive, {} dead; publishing union of {} proxies",
                    scanned_alive.len(),
                    scanned_dead,
                    total_alive
                );

                let mut combined = scraped_alive;
                combined.extend(scanned_alive);
                self.snapshot.update(combined, combined_stats);
            }
        }

        info!("cycle completed in {:?}", started.elapsed());
    }

    async fn filter_and_check(
        &self,
        cancel: &CancellationToken,
        candidates: Vec<Candidate>,
    ) -> Vec<CheckResult> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let cfg = &self.config.checker;
        let mut candidates = candidates;
        if cfg.enable_fast_filter && candidates.len() > FAST_FILTER_THRESHOLD {
            let before = candidates.len();
            candidates = fastfilter::fast_connect_filter(
                cancel,
                candidates,
                cfg.fast_filter_timeout_ms,
                cfg.fast_filter_concurrency,
            )
            .await;
            info!("fast filter: {}/{} passed", candidates.len(), before);
        }

        let limit = self.effective_concurrency();
        self.checker.check_batch(cancel, candidates, limit).await
    }

    /// Effective concurrency for the next batch: the nominal limit, reduced
    /// by whichever pressure signal demands the most.
    fn effective_concurrency(&self) -> usize {
        let nominal = self.config.checker.concurrency_total;
        if !self.config.checker.enable_adaptive_concurrency {
            return nominal;
        }
        compute_effective_concurrency(
            nominal,
            self.checker.in_flight(),
            nofile_limit(),
            resident_memory_bytes(),
            self.config.checker.max_fd_usage_percent,
        )
    }
}

/// Apply the three candidate reductions and take the minimum; the result
/// never exceeds `nominal`.
fn compute_effective_concurrency(
    nominal: usize,
    in_flight: usize,
    nofile: Option<u64>,
    rss_bytes: Option<u64>,
    max_fd_percent: u32,
) -> usize {
    let mut limit = nominal;

    if in_flight > nominal * 2 {
        let reduced = nominal * 6 / 10;
        warn!("high in-flight check count ({in_flight}), reducing concurrency: {nominal} -> {reduced}");
        limit = limit.min(reduced);
    }

    if let Some(nofile) = nofile {
        let needed = nominal as f64 * 1.5;
        let allowed = nofile as f64 * f64::from(max_fd_percent) / 100.0;
        if needed > allowed {
            let reduced = ((nofile * u64::from(max_fd_percent) / 150) as usize).max(100);
            warn!(
                "descriptor budget tight (rlimit {nofile}, need {needed:.0}), reducing concurrency: {nominal} -> {reduced}"
            );
            limit = limit.min(reduced);
        }
    }

    if let Some(rss) = rss_bytes {
        if rss > MEMORY_LIMIT_BYTES {
            let reduced = nominal * 7 / 10;
            warn!(
                "resident memory {:.2} GiB, reducing concurrency: {nominal} -> {reduced}",
                rss as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            limit = limit.min(reduced);
        }
    }

    limit
}

fn nofile_limit() -> Option<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we hand it.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    (rc == 0).then_some(lim.rlim_cur as u64)
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

fn alive_entries(results: &[CheckResult], source: ProxySource) -> Vec<AliveProxy> {
    results
        .iter()
        .filter(|r| r.alive)
        .map(|r| AliveProxy {
            address: r.address.clone(),
            protocol: r.protocol,
            alive: true,
            latency_ms: r.latency_ms,
            last_check: Utc::now(),
            source,
        })
        .collect()
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_feed::Protocol;

    #[test]
    fn unpressured_limit_is_nominal() {
        assert_eq!(
            compute_effective_concurrency(20_000, 0, Some(100_000), Some(0), 80),
            20_000
        );
    }

    #[test]
    fn high_in_flight_reduces_to_sixty_percent() {
        assert_eq!(
            compute_effective_concurrency(10_000, 25_000, Some(100_000), Some(0), 80),
            6_000
        );
    }

    #[test]
    fn descriptor_pressure_caps_with_floor() {
        // 20k nominal needs 30k descriptors; an 8k rlimit at 80% allows 6.4k.
        let limit = compute_effective_concurrency(20_000, 0, Some(8_192), Some(0), 80);
        assert_eq!(limit, 8_192 * 80 / 150);

        // Tiny rlimit still leaves the floor of 100.
        assert_eq!(compute_effective_concurrency(20_000, 0, Some(64), Some(0), 80), 100);
    }

    #[test]
    fn memory_pressure_reduces_to_seventy_percent() {
        let limit =
            compute_effective_concurrency(10_000, 0, Some(1_000_000), Some(3 << 30), 80);
        assert_eq!(limit, 7_000);
    }

    #[test]
    fn combined_pressure_takes_the_minimum() {
        // 60% of 10k = 6k, memory gives 7k, descriptors allow everything.
        let limit =
            compute_effective_concurrency(10_000, 25_000, Some(1_000_000), Some(3 << 30), 80);
        assert_eq!(limit, 6_000);
    }

    #[test]
    fn limit_never_exceeds_nominal() {
        assert_eq!(compute_effective_concurrency(500, 0, None, None, 80), 500);
    }

    #[test]
    fn alive_entries_keep_only_alive_results() {
        let results = vec![
            CheckResult {
                address: "1.1.1.1:80".into(),
                protocol: Protocol::Http,
                alive: true,
                latency_ms: 12,
                error: String::new(),
            },
            CheckResult {
                address: "2.2.2.2:80".into(),
                protocol: Protocol::Http,
                alive: false,
                latency_ms: 0,
                error: "connect timeout".into(),
            },
        ];
        let alive = alive_entries(&results, ProxySource::Zmap);
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].address, "1.1.1.1:80");
        assert_eq!(alive[0].source, ProxySource::Zmap);
        assert!(alive[0].alive);
    }

    #[test]
    fn percent_handles_empty_input() {
        assert_eq!(percent(0, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
    }
}
