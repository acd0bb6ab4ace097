//! Bulk TCP-connect pre-filter.
//!
//! Most harvested addresses never accept a connection; probing them with the
//! full validator timeout would dominate the cycle. This pass keeps only
//! candidates whose address completes a handshake within a short timeout.
//! No payload is sent; the socket closes on success.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use proxy_feed::Candidate;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Return the subset of `candidates` whose address is connectable within
/// `timeout_ms`. Protocol is preserved; any connect error drops the entry.
pub async fn fast_connect_filter(
    cancel: &CancellationToken,
    candidates: Vec<Candidate>,
    timeout_ms: u64,
    concurrency: usize,
) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }

    let total = candidates.len();
    let timeout = Duration::from_millis(timeout_ms);
    let started = Instant::now();
    info!("fast filter: {total} candidates, concurrency={concurrency}, timeout={timeout_ms}ms");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let completed = Arc::new(AtomicU64::new(0));
    let connectable = Arc::new(AtomicU64::new(0));

    let progress = {
        let completed = completed.clone();
        let connectable = connectable.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let done = completed.load(Ordering::Relaxed);
                info!(
                    "fast filter progress: {done}/{total} ({:.1}%), connectable={}",
                    done as f64 / total as f64 * 100.0,
                    connectable.load(Ordering::Relaxed)
                );
            }
        })
    };

    let survivors: Vec<Candidate> = stream::iter(candidates)
        .map(|candidate| {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let completed = completed.clone();
            let connectable = connectable.clone();
            async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = semaphore.acquire_owned() => permit.ok()?,
                };

                let open = tokio::select! {
                    _ = cancel.cancelled() => false,
                    result = tokio::time::timeout(timeout, TcpStream::connect(&candidate.address)) => {
                        matches!(result, Ok(Ok(_)))
                    }
                };

                completed.fetch_add(1, Ordering::Relaxed);
                if open {
                    connectable.fetch_add(1, Ordering::Relaxed);
                    Some(candidate)
                } else {
                    None
                }
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|c| async move { c })
        .collect()
        .await;

    progress.abort();

    info!(
        "fast filter complete: {}/{} connectable in {:?}",
        survivors.len(),
        total,
        started.elapsed()
    );
    survivors
}

#[cfg(test)]
mod tests {
    use super::*;
    use proxy_feed::Protocol;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn keeps_connectable_and_drops_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let candidates = vec![
            Candidate::new(addr.to_string(), Protocol::Socks5),
            // TEST-NET-3, blackholed
            Candidate::new("203.0.113.1:9".to_string(), Protocol::Http),
        ];

        let cancel = CancellationToken::new();
        let survivors = fast_connect_filter(&cancel, candidates, 500, 16).await;
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].address, addr.to_string());
        assert_eq!(survivors[0].protocol, Protocol::Socks5);
    }

    #[tokio::test]
    async fn cancellation_drops_pending_candidates() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let candidates = vec![Candidate::new("203.0.113.1:9".to_string(), Protocol::Http)];
        let survivors = fast_connect_filter(&cancel, candidates, 5_000, 4).await;
        assert!(survivors.is_empty());
    }

    #[tokio::test]
    async fn empty_input_is_a_no_op() {
        let cancel = CancellationToken::new();
        let survivors = fast_connect_filter(&cancel, Vec::new(), 100, 4).await;
        assert!(survivors.is_empty());
    }
}
