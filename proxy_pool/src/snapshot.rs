//! Atomically-published view of the current alive set.
//!
//! Readers take a single pointer load and work on an immutable value; the
//! writer replaces the whole snapshot in one store. No lock sits on the read
//! path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use proxy_feed::{Protocol, SourceReport};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Collector;
use crate::storage::{Storage, StorageError};

/// Persisted entries older than this are dropped at startup.
const STALE_AFTER_SECS: i64 = 3600;

/// Where a proxy entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxySource {
    Scraped,
    Zmap,
}

/// An entry in the published snapshot; only proxies whose most recent check
/// returned alive appear here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AliveProxy {
    pub address: String,
    pub protocol: Protocol,
    pub alive: bool,
    pub latency_ms: i64,
    pub last_check: DateTime<Utc>,
    pub source: ProxySource,
}

/// Scalar summary of the most recent completed cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_scraped: usize,
    pub total_alive: usize,
    pub total_dead: usize,
    pub alive_percent: f64,
    pub last_check_time: DateTime<Utc>,
    #[serde(default)]
    pub source_stats: HashMap<String, SourceReport>,
}

impl Default for Stats {
    fn default() -> Self {
        Self {
            total_scraped: 0,
            total_alive: 0,
            total_dead: 0,
            alive_percent: 0.0,
            last_check_time: DateTime::<Utc>::UNIX_EPOCH,
            source_stats: HashMap::new(),
        }
    }
}

/// The atomically-published view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub proxies: Vec<AliveProxy>,
    pub stats: Stats,
    pub updated: DateTime<Utc>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            stats: Stats::default(),
            updated: Utc::now(),
        }
    }
}

pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    rr_index: AtomicU64,
    storage: Arc<dyn Storage>,
    persist_lock: Arc<Mutex<()>>,
    persist_interval: Duration,
    metrics: Arc<Collector>,
}

impl SnapshotStore {
    pub fn new(
        storage: Arc<dyn Storage>,
        persist_interval_seconds: u64,
        metrics: Arc<Collector>,
    ) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot::default()),
            rr_index: AtomicU64::new(0),
            storage,
            persist_lock: Arc::new(Mutex::new(())),
            persist_interval: Duration::from_secs(persist_interval_seconds),
            metrics,
        }
    }

    /// Current snapshot. Lock-free; the guard pins the value without cloning.
    pub fn get(&self) -> arc_swap::Guard<Arc<Snapshot>> {
        self.current.load()
    }

    /// Current snapshot as an owned handle.
    pub fn get_full(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Atomically publish a new snapshot. Readers observe either the old or
    /// the new value, never a mixture. The alive count is re-derived from the
    /// deduplicated sequence so it can never drift from the contents.
    pub fn update(&self, proxies: Vec<AliveProxy>, mut stats: Stats) {
        let proxies = dedup_proxies(proxies);
        stats.total_alive = proxies.len();
        self.metrics.set_alive_proxies(proxies.len());
        self.metrics.set_dead_proxies(stats.total_dead);

        let snapshot = Arc::new(Snapshot {
            proxies,
            stats,
            updated: Utc::now(),
        });
        self.current.store(snapshot.clone());
        info!("snapshot updated: {} alive proxies", snapshot.proxies.len());

        // Async write-behind; publication never waits on storage.
        tokio::spawn(persist(
            self.storage.clone(),
            self.persist_lock.clone(),
            self.metrics.clone(),
            snapshot,
        ));
    }

    /// One proxy by round-robin over the current snapshot.
    pub fn get_one(&self) -> Option<AliveProxy> {
        self.select(None, Some(1)).into_iter().next()
    }

    /// `n` proxies: round-robin for small `n`, random sample otherwise.
    pub fn get_n(&self, n: usize) -> Vec<AliveProxy> {
        self.select(None, Some(n))
    }

    /// Defensive copy of the current proxy sequence.
    pub fn get_all(&self) -> Vec<AliveProxy> {
        self.current.load().proxies.clone()
    }

    pub fn get_stats(&self) -> Stats {
        self.current.load().stats.clone()
    }

    /// Select proxies, optionally filtered by protocol. `limit = None` means
    /// every matching entry, in snapshot order. The round-robin counter is
    /// shared across callers; modulo arithmetic absorbs snapshot length
    /// changes.
    pub fn select(&self, protocol: Option<Protocol>, limit: Option<usize>) -> Vec<AliveProxy> {
        let snap = self.current.load();
        let filtered: Vec<&AliveProxy> = snap
            .proxies
            .iter()
            .filter(|p| protocol.map_or(true, |want| p.protocol == want))
            .collect();
        let total = filtered.len();
        if total == 0 {
            return Vec::new();
        }

        let n = match limit {
            None | Some(0) => return filtered.into_iter().cloned().collect(),
            Some(n) => n.min(total),
        };

        if n <= 10 {
            let start =
                (self.rr_index.fetch_add(n as u64, Ordering::Relaxed) % total as u64) as usize;
            (0..n).map(|i| filtered[(start + i) % total].clone()).collect()
        } else {
            let mut rng = rand::thread_rng();
            rand::seq::index::sample(&mut rng, total, n)
                .iter()
                .map(|i| filtered[i].clone())
                .collect()
        }
    }

    /// Restore the last persisted snapshot, dropping entries older than the
    /// staleness cutoff. Failure leaves the store empty; the caller decides
    /// how loudly to complain.
    pub async fn load_from_storage(&self) -> Result<(), StorageError> {
        let Some(mut snap) = self.storage.load().await? else {
            info!("no persisted snapshot found, starting empty");
            return Ok(());
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(STALE_AFTER_SECS);
        let before = snap.proxies.len();
        snap.proxies.retain(|p| p.last_check > cutoff);

        if snap.proxies.is_empty() {
            info!("no fresh proxies in persisted snapshot ({before} stale)");
            return Ok(());
        }

        snap.stats.total_alive = snap.proxies.len();
        self.metrics.set_alive_proxies(snap.proxies.len());
        info!(
            "loaded {} fresh proxies from storage ({} stale dropped)",
            snap.proxies.len(),
            before - snap.proxies.len()
        );
        self.current.store(Arc::new(snap));
        Ok(())
    }

    /// Periodic write-behind covering cycles that never complete. On
    /// cancellation one final durable write is flushed before returning.
    pub async fn run_periodic_persist(&self, cancel: CancellationToken) {
        if self.persist_interval.is_zero() {
            cancel.cancelled().await;
            self.persist_current().await;
            return;
        }

        let mut ticker = tokio::time::interval(self.persist_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.persist_current().await;
                    return;
                }
                _ = ticker.tick() => self.persist_current().await,
            }
        }
    }

    async fn persist_current(&self) {
        persist(
            self.storage.clone(),
            self.persist_lock.clone(),
            self.metrics.clone(),
            self.current.load_full(),
        )
        .await;
    }
}

async fn persist(
    storage: Arc<dyn Storage>,
    lock: Arc<Mutex<()>>,
    metrics: Arc<Collector>,
    snapshot: Arc<Snapshot>,
) {
    let _guard = lock.lock().await;
    match storage.save(&snapshot).await {
        Ok(()) => debug!("snapshot persisted: {} proxies", snapshot.proxies.len()),
        Err(e) => {
            warn!("failed to persist snapshot: {e}");
            metrics.record_persist_failure();
        }
    }
}

fn dedup_proxies(proxies: Vec<AliveProxy>) -> Vec<AliveProxy> {
    let mut seen = HashSet::with_capacity(proxies.len());
    let mut unique = Vec::with_capacity(proxies.len());
    for p in proxies {
        let key = format!("{}|{}", p.address.trim().to_lowercase(), p.protocol);
        if seen.insert(key) {
            unique.push(p);
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;

    fn proxy(address: &str, protocol: Protocol) -> AliveProxy {
        AliveProxy {
            address: address.into(),
            protocol,
            alive: true,
            latency_ms: 40,
            last_check: Utc::now(),
            source: ProxySource::Scraped,
        }
    }

    fn stats(alive: usize, dead: usize) -> Stats {
        Stats {
            total_scraped: alive + dead,
            total_alive: alive,
            total_dead: dead,
            alive_percent: 100.0 * alive as f64 / (alive + dead).max(1) as f64,
            last_check_time: Utc::now(),
            source_stats: HashMap::new(),
        }
    }

    fn store(dir: &tempfile::TempDir) -> SnapshotStore {
        let path = dir.path().join("proxies.json");
        let storage = Arc::new(FileStorage::new(path.to_str().unwrap().to_string()).unwrap());
        SnapshotStore::new(storage, 300, Arc::new(Collector::new("snaptest")))
    }

    #[tokio::test]
    async fn empty_store_returns_well_formed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let snap = s.get();
        assert!(snap.proxies.is_empty());
        assert_eq!(snap.stats.total_alive, 0);
        assert!(s.get_one().is_none());
        assert!(s.get_n(5).is_empty());
    }

    #[tokio::test]
    async fn update_enforces_alive_count_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.update(
            vec![
                proxy("1.1.1.1:80", Protocol::Http),
                proxy("1.1.1.1:80", Protocol::Http),
                proxy("1.1.1.1:80", Protocol::Socks5),
            ],
            stats(3, 1),
        );
        let snap = s.get();
        assert_eq!(snap.proxies.len(), 2);
        assert_eq!(snap.stats.total_alive, snap.proxies.len());
        for p in &snap.proxies {
            assert!(p.last_check <= snap.updated);
        }
    }

    #[tokio::test]
    async fn publish_is_idempotent_up_to_updated() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let proxies = vec![proxy("1.1.1.1:80", Protocol::Http)];
        let st = stats(1, 0);

        s.update(proxies.clone(), st.clone());
        let first = s.get_full();
        s.update(proxies, st);
        let second = s.get_full();

        assert_eq!(first.proxies.len(), second.proxies.len());
        assert_eq!(first.stats.total_alive, second.stats.total_alive);
        assert!(second.updated >= first.updated);
    }

    #[tokio::test]
    async fn round_robin_wraps_and_survives_updates() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.update(
            vec![
                proxy("1.1.1.1:80", Protocol::Http),
                proxy("2.2.2.2:80", Protocol::Http),
                proxy("3.3.3.3:80", Protocol::Http),
            ],
            stats(3, 0),
        );

        let picks: Vec<String> = (0..4).filter_map(|_| s.get_one()).map(|p| p.address).collect();
        assert_eq!(picks.len(), 4);
        assert_eq!(picks[0], picks[3]);
        assert_ne!(picks[0], picks[1]);

        // Shrinking the snapshot must not break selection.
        s.update(vec![proxy("9.9.9.9:80", Protocol::Http)], stats(1, 0));
        assert_eq!(s.get_one().unwrap().address, "9.9.9.9:80");
    }

    #[tokio::test]
    async fn get_n_clamps_and_returns_all() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.update(
            vec![
                proxy("1.1.1.1:80", Protocol::Http),
                proxy("2.2.2.2:80", Protocol::Http),
            ],
            stats(2, 0),
        );
        assert_eq!(s.get_n(10).len(), 2);
        assert_eq!(s.get_all().len(), 2);

        // Large requests switch to random sampling without duplicates.
        let many: Vec<AliveProxy> = (0..50)
            .map(|i| proxy(&format!("10.0.0.{i}:80"), Protocol::Http))
            .collect();
        s.update(many, stats(50, 0));
        let got = s.get_n(20);
        let unique: HashSet<String> = got.iter().map(|p| p.address.clone()).collect();
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn select_filters_by_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.update(
            vec![
                proxy("1.1.1.1:80", Protocol::Http),
                proxy("2.2.2.2:1080", Protocol::Socks5),
                proxy("3.3.3.3:1080", Protocol::Socks5),
            ],
            stats(3, 0),
        );

        let socks = s.select(Some(Protocol::Socks5), None);
        assert_eq!(socks.len(), 2);
        assert!(socks.iter().all(|p| p.protocol == Protocol::Socks5));

        let all = s.select(None, None);
        let filtered: Vec<_> = all.iter().filter(|p| p.protocol == Protocol::Socks5).collect();
        assert_eq!(filtered.len(), socks.len());

        assert!(s.select(Some(Protocol::Socks4), None).is_empty());
    }

    #[tokio::test]
    async fn update_persists_and_reload_applies_staleness_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);

        let mut stale = proxy("4.4.4.4:80", Protocol::Http);
        stale.last_check = Utc::now() - chrono::Duration::hours(2);
        s.update(vec![proxy("1.1.1.1:80", Protocol::Http), stale], stats(2, 0));

        // The write-behind runs on a spawned task; wait for the file.
        let path = dir.path().join("proxies.json");
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("persisted file never appeared");

        let fresh = store(&dir);
        fresh.load_from_storage().await.unwrap();
        let snap = fresh.get();
        assert_eq!(snap.proxies.len(), 1);
        assert_eq!(snap.proxies[0].address, "1.1.1.1:80");
        assert_eq!(snap.stats.total_alive, 1);
    }
}
