//! HTTP API: proxy hand-out, stats, reload trigger and metrics exposition.
//!
//! Auth is a shared secret read from the environment at startup; an unset
//! secret disables auth with a warning. Per-client-IP token buckets guard
//! the protected surface.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use parking_lot::{Mutex, RwLock};
use proxy_feed::Protocol;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ApiConfig, Config, MetricsConfig};
use crate::metrics::Collector;
use crate::snapshot::SnapshotStore;
use crate::zmap::ZmapScanner;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token buckets behind a read-mostly map; the write lock is taken
/// only on first use of a key.
pub struct RateLimiter {
    buckets: RwLock<HashMap<IpAddr, Mutex<Bucket>>>,
    rate_per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            rate_per_sec: f64::from(requests_per_minute) / 60.0,
            burst: f64::from((requests_per_minute / 10).max(1)),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        {
            let buckets = self.buckets.read();
            if let Some(bucket) = buckets.get(&ip) {
                return self.take(&mut bucket.lock());
            }
        }

        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(ip).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: self.burst,
                last_refill: Instant::now(),
            })
        });
        let allowed = self.take(&mut bucket.lock());
        allowed
    }

    fn take(&self, bucket: &mut Bucket) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct ApiContext {
    api: ApiConfig,
    metrics_cfg: MetricsConfig,
    snapshot: Arc<SnapshotStore>,
    metrics: Arc<Collector>,
    zmap: Option<Arc<ZmapScanner>>,
    reload: mpsc::Sender<()>,
    api_key: Option<String>,
    limiter: RateLimiter,
}

impl ApiContext {
    pub fn new(
        config: &Config,
        snapshot: Arc<SnapshotStore>,
        metrics: Arc<Collector>,
        zmap: Option<Arc<ZmapScanner>>,
        reload: mpsc::Sender<()>,
        api_key: Option<String>,
    ) -> Self {
        if api_key.is_none() {
            warn!(
                "API key env {} not set, authentication disabled",
                config.api.api_key_env
            );
        }
        Self {
            api: config.api.clone(),
            metrics_cfg: config.metrics.clone(),
            snapshot,
            metrics,
            zmap,
            reload,
            api_key,
            limiter: RateLimiter::new(config.api.rate_limit_per_minute),
        }
    }
}

/// Bind and serve until the token is cancelled. A bind failure is returned
/// to the caller, which treats it as fatal.
pub async fn serve(
    ctx: Arc<ApiContext>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let ctx = ctx.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let ctx = ctx.clone();
                async move { Ok::<_, Infallible>(handle(req, ctx, remote).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!("API listening on {addr}");
    server.with_graceful_shutdown(cancel.cancelled_owned()).await?;
    info!("API server stopped");
    Ok(())
}

pub async fn handle(
    req: Request<Body>,
    ctx: Arc<ApiContext>,
    remote: SocketAddr,
) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = route(req, &ctx, remote);

    let elapsed = started.elapsed();
    let status = response.status().as_u16();
    info!(
        method = %method,
        path = %path,
        status,
        duration_ms = elapsed.as_millis() as u64,
        ip = %remote.ip(),
        "API request"
    );
    ctx.metrics.record_api_request(method.as_str(), &path, status);
    ctx.metrics
        .record_api_duration(method.as_str(), &path, elapsed.as_secs_f64());
    response
}

fn route(req: Request<Body>, ctx: &ApiContext, remote: SocketAddr) -> Response<Body> {
    let path = req.uri().path();

    // Public surface.
    if req.method() == Method::GET && path == "/health" {
        return text(StatusCode::OK, "ok");
    }
    if ctx.metrics_cfg.enabled && req.method() == Method::GET && path == ctx.metrics_cfg.endpoint {
        return text(StatusCode::OK, &ctx.metrics.gather());
    }

    if ctx.api.enable_api_key_auth {
        if let Some(expected) = &ctx.api_key {
            let presented = req
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .or_else(|| query_map(&req).remove("key"));
            if presented.as_deref() != Some(expected.as_str()) {
                return json_error(StatusCode::UNAUTHORIZED, "Invalid or missing API key");
            }
        }
    }

    if ctx.api.enable_ip_rate_limit && !ctx.limiter.allow(remote.ip()) {
        return json_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
    }

    match (req.method(), req.uri().path()) {
        (&Method::GET, "/get-proxy") => get_proxy(&req, ctx),
        (&Method::GET, "/stat") => stat(ctx),
        (&Method::POST, "/reload") => reload(ctx),
        (&Method::GET, "/stats/zmap") => zmap_stats(ctx),
        _ => json_error(StatusCode::NOT_FOUND, "Not found"),
    }
}

fn get_proxy(req: &Request<Body>, ctx: &ApiContext) -> Response<Body> {
    let q = query_map(req);

    let snap = ctx.snapshot.get_full();
    if snap.proxies.is_empty() {
        return json_error(StatusCode::SERVICE_UNAVAILABLE, "No alive proxies available");
    }

    let protocol = match q.get("protocol") {
        None => None,
        Some(p) => match p.parse::<Protocol>() {
            Ok(p) => Some(p),
            Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid protocol parameter"),
        },
    };

    let all = q.get("all").map(String::as_str) == Some("1");
    let limit = if all {
        None
    } else {
        match q.get("limit") {
            None => Some(1),
            Some(s) => match s.parse::<i64>() {
                Ok(n) if n >= 1 => Some(n as usize),
                _ => return json_error(StatusCode::BAD_REQUEST, "Invalid limit parameter"),
            },
        }
    };

    let proxies = ctx.snapshot.select(protocol, limit);

    let wants_json = q.get("format").map(String::as_str) == Some("json")
        || req
            .headers()
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

    if wants_json {
        json_response(
            StatusCode::OK,
            &json!({
                "total": snap.proxies.len(),
                "alive": snap.stats.total_alive,
                "proxies": proxies,
            }),
        )
    } else {
        let mut body = String::new();
        for p in &proxies {
            body.push_str(&p.address);
            body.push('\n');
        }
        text(StatusCode::OK, &body)
    }
}

fn stat(ctx: &ApiContext) -> Response<Body> {
    let snap = ctx.snapshot.get_full();
    let stats = &snap.stats;
    json_response(
        StatusCode::OK,
        &json!({
            "total_scraped": stats.total_scraped,
            "total_alive": stats.total_alive,
            "total_dead": stats.total_dead,
            "alive_percent": format!("{:.2}%", stats.alive_percent),
            "last_check": stats.last_check_time.to_rfc3339(),
            "updated": snap.updated.to_rfc3339(),
            "sources": stats.source_stats,
        }),
    )
}

fn reload(ctx: &ApiContext) -> Response<Body> {
    info!("manual reload triggered via API");
    // A full send would mean a cycle is already queued; either way the
    // caller gets an immediate acknowledgement.
    let _ = ctx.reload.try_send(());
    json_response(StatusCode::OK, &json!({ "message": "Reload triggered" }))
}

fn zmap_stats(ctx: &ApiContext) -> Response<Body> {
    let body = match &ctx.zmap {
        Some(scanner) => {
            let stats = scanner.stats();
            json!({
                "enabled": true,
                "ports": scanner.config().ports,
                "last_scan_time": stats.last_scan_time.map(|t| t.to_rfc3339()),
                "last_scan_duration": stats.last_scan_duration_secs,
                "candidates_found": stats.candidates_found,
                "total_scans": stats.total_scans,
            })
        }
        None => json!({
            "enabled": false,
            "ports": [],
            "last_scan_time": null,
            "last_scan_duration": 0.0,
            "candidates_found": 0,
            "total_scans": 0,
        }),
    };
    json_response(StatusCode::OK, &body)
}

fn query_map(req: &Request<Body>) -> HashMap<String, String> {
    url::form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
        .into_owned()
        .collect()
}

fn text(status: StatusCode, body: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap()
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{AliveProxy, ProxySource, Stats};
    use crate::storage::FileStorage;
    use chrono::Utc;

    struct TestApi {
        ctx: Arc<ApiContext>,
        reload_rx: mpsc::Receiver<()>,
        _dir: tempfile::TempDir,
    }

    fn test_api(api_key: Option<&str>, mutate: impl FnOnce(&mut Config)) -> TestApi {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            FileStorage::new(dir.path().join("p.json").to_string_lossy().into_owned()).unwrap(),
        );
        let metrics = Arc::new(Collector::new("apitest"));
        let snapshot = Arc::new(SnapshotStore::new(storage, 300, metrics.clone()));
        let (tx, rx) = mpsc::channel(1);

        let mut config = Config::default();
        mutate(&mut config);

        let ctx = ApiContext::new(
            &config,
            snapshot,
            metrics,
            None,
            tx,
            api_key.map(String::from),
        );
        TestApi {
            ctx: Arc::new(ctx),
            reload_rx: rx,
            _dir: dir,
        }
    }

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

    fn populate(api: &TestApi) {
        api.ctx.snapshot.update(
            vec![
                proxy("203.0.113.7:8080", Protocol::Http),
                proxy("198.51.100.2:1080", Protocol::Socks5),
                proxy("198.51.100.3:1080", Protocol::Socks5),
            ],
            Stats {
                total_scraped: 4,
                total_alive: 3,
                total_dead: 1,
                alive_percent: 75.0,
                last_check_time: Utc::now(),
                source_stats: HashMap::new(),
            },
        );
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn remote() -> SocketAddr {
        "192.0.2.50:55555".parse().unwrap()
    }

    async fn body_json(resp: Response<Body>) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(resp: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn health_is_public() {
        let api = test_api(Some("secret"), |_| {});
        let resp = handle(request(Method::GET, "/health"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "ok");
    }

    #[tokio::test]
    async fn missing_or_wrong_key_is_unauthorized() {
        let api = test_api(Some("secret"), |_| {});
        populate(&api);

        let resp = handle(request(Method::GET, "/get-proxy"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Invalid or missing API key");

        let mut req = request(Method::GET, "/get-proxy");
        req.headers_mut().insert("x-api-key", "wrong".parse().unwrap());
        let resp = handle(req, api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn header_and_query_keys_authenticate() {
        let api = test_api(Some("abc"), |_| {});
        populate(&api);

        let mut req = request(Method::GET, "/get-proxy");
        req.headers_mut().insert("x-api-key", "abc".parse().unwrap());
        let resp = handle(req, api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = handle(
            request(Method::GET, "/get-proxy?key=abc"),
            api.ctx.clone(),
            remote(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unset_key_disables_auth() {
        let api = test_api(None, |_| {});
        populate(&api);
        let resp = handle(request(Method::GET, "/get-proxy"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_snapshot_is_service_unavailable() {
        let api = test_api(None, |_| {});
        let resp = handle(request(Method::GET, "/get-proxy"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "No alive proxies available");
    }

    #[tokio::test]
    async fn default_response_is_one_address_per_line() {
        let api = test_api(None, |_| {});
        api.ctx.snapshot.update(
            vec![proxy("203.0.113.7:8080", Protocol::Http)],
            Stats::default(),
        );
        let resp = handle(request(Method::GET, "/get-proxy"), api.ctx.clone(), remote()).await;
        assert_eq!(body_text(resp).await, "203.0.113.7:8080\n");
    }

    #[tokio::test]
    async fn invalid_limit_is_bad_request() {
        let api = test_api(None, |_| {});
        populate(&api);
        for uri in ["/get-proxy?limit=0", "/get-proxy?limit=-3", "/get-proxy?limit=abc"] {
            let resp = handle(request(Method::GET, uri), api.ctx.clone(), remote()).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn limit_above_alive_count_returns_everything() {
        let api = test_api(None, |_| {});
        populate(&api);
        let resp = handle(
            request(Method::GET, "/get-proxy?limit=50&format=json"),
            api.ctx.clone(),
            remote(),
        )
        .await;
        let body = body_json(resp).await;
        assert_eq!(body["proxies"].as_array().unwrap().len(), 3);
        assert_eq!(body["total"], 3);
        assert_eq!(body["alive"], 3);
    }

    #[tokio::test]
    async fn protocol_filter_matches_filtered_all() {
        let api = test_api(None, |_| {});
        populate(&api);

        let all = body_json(
            handle(
                request(Method::GET, "/get-proxy?all=1&format=json"),
                api.ctx.clone(),
                remote(),
            )
            .await,
        )
        .await;
        let socks5 = body_json(
            handle(
                request(Method::GET, "/get-proxy?all=1&protocol=socks5&format=json"),
                api.ctx.clone(),
                remote(),
            )
            .await,
        )
        .await;

        let expected: Vec<&serde_json::Value> = all["proxies"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|p| p["protocol"] == "socks5")
            .collect();
        let got = socks5["proxies"].as_array().unwrap();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert_eq!(g["address"], e["address"]);
        }

        let resp = handle(
            request(Method::GET, "/get-proxy?protocol=ftp"),
            api.ctx.clone(),
            remote(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stat_reports_percent_and_timestamps() {
        let api = test_api(None, |_| {});
        populate(&api);
        let body = body_json(
            handle(request(Method::GET, "/stat"), api.ctx.clone(), remote()).await,
        )
        .await;
        assert_eq!(body["total_alive"], 3);
        assert_eq!(body["total_dead"], 1);
        assert_eq!(body["alive_percent"], "75.00%");
        assert!(body["updated"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn reload_returns_immediately_and_signals() {
        let mut api = test_api(None, |_| {});
        let resp = handle(request(Method::POST, "/reload"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["message"], "Reload triggered");
        assert!(api.reload_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_burst_per_ip() {
        let api = test_api(None, |cfg| {
            cfg.api.rate_limit_per_minute = 60; // burst of 6
        });
        populate(&api);

        let mut ok = 0;
        let mut limited = 0;
        for _ in 0..10 {
            let resp = handle(request(Method::GET, "/stat"), api.ctx.clone(), remote()).await;
            match resp.status() {
                StatusCode::OK => ok += 1,
                StatusCode::TOO_MANY_REQUESTS => limited += 1,
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(ok, 6);
        assert_eq!(limited, 4);

        // A different client IP is unaffected.
        let other: SocketAddr = "192.0.2.51:1000".parse().unwrap();
        let resp = handle(request(Method::GET, "/stat"), api.ctx.clone(), other).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn zmap_stats_reports_disabled_driver() {
        let api = test_api(None, |_| {});
        let body = body_json(
            handle(request(Method::GET, "/stats/zmap"), api.ctx.clone(), remote()).await,
        )
        .await;
        assert_eq!(body["enabled"], false);
        assert_eq!(body["total_scans"], 0);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_exposition_text() {
        let api = test_api(Some("secret"), |_| {});
        let resp = handle(request(Method::GET, "/metrics"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_text(resp).await.contains("apitest_"));
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let api = test_api(None, |_| {});
        let resp = handle(request(Method::GET, "/nope"), api.ctx.clone(), remote()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
