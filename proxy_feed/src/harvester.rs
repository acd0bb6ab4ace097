use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tracing::{info, warn};

use crate::{Candidate, Config, Protocol, Source, SourceReport};

/// Whole-fetch budget for a single source.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard ceiling on a source body; anything past it is discarded.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

static LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:(https?|socks4|socks5)://)?((?:\d{1,3}\.){3}\d{1,3}):(\d{2,5})\b")
        .expect("proxy line regex")
});

/// Errors that can occur when aggregating proxy sources.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    #[error("HTTP error fetching {0}: {1}")]
    Http(String, #[source] reqwest::Error),
    #[error("{0} returned HTTP {1}")]
    Status(String, u16),
    #[error("no enabled sources")]
    NoSources,
}

/// Fetches all enabled sources concurrently and folds the results into one
/// deduplicated candidate list.
pub struct Aggregator {
    config: Config,
    client: Client,
}

impl Aggregator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch every enabled source and return the deduplicated candidates plus
    /// a per-source report. Individual source failures produce an empty
    /// contribution and an error string; only a fully-disabled source list is
    /// a hard error.
    pub async fn aggregate(
        &self,
    ) -> Result<(Vec<Candidate>, HashMap<String, SourceReport>), HarvestError> {
        let enabled: Vec<&Source> = self
            .config
            .sources
            .iter()
            .filter(|s| s.enabled)
            .collect();

        if enabled.is_empty() {
            return Err(HarvestError::NoSources);
        }

        info!("fetching from {} sources", enabled.len());

        let mut fetches = FuturesUnordered::new();
        for source in enabled {
            fetches.push(self.fetch_one(source));
        }

        let mut all = Vec::new();
        let mut reports = HashMap::new();
        while let Some((candidates, report)) = fetches.next().await {
            all.extend(candidates);
            reports.insert(report.url.clone(), report);
        }

        let before = all.len();
        let unique = dedup_candidates(all);
        info!("deduplicated: {} -> {} unique candidates", before, unique.len());

        Ok((unique, reports))
    }

    async fn fetch_one(&self, source: &Source) -> (Vec<Candidate>, SourceReport) {
        let start = Instant::now();
        let mut report = SourceReport {
            url: source.url.clone(),
            ..SourceReport::default()
        };

        match self.fetch_body(source).await {
            Ok(body) => {
                let candidates = parse_lines(&body, source);
                report.proxies_found = candidates.len();
                info!(
                    "source {} returned {} candidates (took {:?})",
                    source.url,
                    candidates.len(),
                    start.elapsed()
                );
                (candidates, report)
            }
            Err(e) => {
                warn!("source {} failed: {} (took {:?})", source.url, e, start.elapsed());
                report.error = e.to_string();
                (Vec::new(), report)
            }
        }
    }

    async fn fetch_body(&self, source: &Source) -> Result<String, HarvestError> {
        let mut req = self.client.get(&source.url).timeout(FETCH_TIMEOUT);
        if !self.config.user_agent.is_empty() {
            req = req.header(reqwest::header::USER_AGENT, &self.config.user_agent);
        }

        let mut resp = req
            .send()
            .await
            .map_err(|e| HarvestError::Http(source.url.clone(), e))?;

        if !resp.status().is_success() {
            return Err(HarvestError::Status(
                source.url.clone(),
                resp.status().as_u16(),
            ));
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| HarvestError::Http(source.url.clone(), e))?
        {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                body.extend_from_slice(&chunk[..MAX_BODY_BYTES - body.len()]);
                warn!("source {} body exceeds {} bytes, truncating", source.url, MAX_BODY_BYTES);
                break;
            }
            body.extend_from_slice(&chunk);
        }

        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Scan a body line by line, keeping candidates that match the proxy line
/// shape. Blank lines, `#` comments and unmatched lines are dropped.
pub fn parse_lines(body: &str, source: &Source) -> Vec<Candidate> {
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(caps) = LINE_RE.captures(line) {
            let address = format!("{}:{}", &caps[2], &caps[3]);
            let scheme = caps.get(1).map(|m| m.as_str());
            out.push(Candidate::new(address, resolve_protocol(scheme, source)));
        }
    }
    out
}

/// Protocol resolution order: explicit line scheme, the source's configured
/// protocol, a socks4/socks5 substring in the source URL, then http.
fn resolve_protocol(scheme: Option<&str>, source: &Source) -> Protocol {
    if let Some(p) = scheme.and_then(|s| s.parse::<Protocol>().ok()) {
        return p;
    }
    if let Some(p) = source.protocol.fixed() {
        return p;
    }
    let url = source.url.to_lowercase();
    if url.contains("socks5") {
        Protocol::Socks5
    } else if url.contains("socks4") {
        Protocol::Socks4
    } else {
        Protocol::Http
    }
}

/// Drop repeated (address, protocol) pairs, keeping first occurrence order.
pub fn dedup_candidates(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = HashSet::with_capacity(candidates.len());
    let mut unique = Vec::with_capacity(candidates.len());
    for c in candidates {
        if seen.insert(c.key()) {
            unique.push(c);
        }
    }
    unique
}
