//! Prometheus collector. Owns a private registry so metrics stay a value
//! handed to collaborators at construction rather than process-wide state.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

pub struct Collector {
    registry: Registry,

    checks_total: IntCounterVec,
    checks_success: IntCounter,
    checks_failure: IntCounter,
    check_duration: Histogram,

    alive_proxies: IntGauge,
    dead_proxies: IntGauge,

    proxies_scraped: IntCounterVec,

    zmap_scans_total: IntCounterVec,
    zmap_candidates_found: IntGaugeVec,
    zmap_scan_duration: Histogram,

    api_requests: IntCounterVec,
    api_duration: HistogramVec,

    persist_failures: IntCounter,
}

impl Collector {
    pub fn new(namespace: &str) -> Self {
        let registry = Registry::new();

        let checks_total = IntCounterVec::new(
            Opts::new("checks_total", "Total number of proxy checks").namespace(namespace),
            &["result"],
        )
        .expect("checks_total");
        let checks_success = IntCounter::with_opts(
            Opts::new("checks_success_total", "Total number of successful proxy checks")
                .namespace(namespace),
        )
        .expect("checks_success_total");
        let checks_failure = IntCounter::with_opts(
            Opts::new("checks_failure_total", "Total number of failed proxy checks")
                .namespace(namespace),
        )
        .expect("checks_failure_total");
        let check_duration = Histogram::with_opts(
            HistogramOpts::new("check_duration_seconds", "Proxy check duration in seconds")
                .namespace(namespace)
                .buckets(vec![
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
        )
        .expect("check_duration_seconds");

        let alive_proxies = IntGauge::with_opts(
            Opts::new("alive_proxies", "Current number of alive proxies").namespace(namespace),
        )
        .expect("alive_proxies");
        let dead_proxies = IntGauge::with_opts(
            Opts::new("dead_proxies", "Current number of dead proxies").namespace(namespace),
        )
        .expect("dead_proxies");

        let proxies_scraped = IntCounterVec::new(
            Opts::new("proxies_scraped_total", "Total number of proxies scraped from sources")
                .namespace(namespace),
            &["source"],
        )
        .expect("proxies_scraped_total");

        let zmap_scans_total = IntCounterVec::new(
            Opts::new("zmap_scans_total", "Total number of scanner runs").namespace(namespace),
            &["port", "status"],
        )
        .expect("zmap_scans_total");
        let zmap_candidates_found = IntGaugeVec::new(
            Opts::new("zmap_candidates_found", "Candidate proxies found by the scanner")
                .namespace(namespace),
            &["port"],
        )
        .expect("zmap_candidates_found");
        let zmap_scan_duration = Histogram::with_opts(
            HistogramOpts::new("zmap_scan_duration_seconds", "Duration of scanner runs in seconds")
                .namespace(namespace)
                .buckets(vec![
                    10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0,
                ]),
        )
        .expect("zmap_scan_duration_seconds");

        let api_requests = IntCounterVec::new(
            Opts::new("api_requests_total", "Total number of API requests").namespace(namespace),
            &["method", "endpoint", "status"],
        )
        .expect("api_requests_total");
        let api_duration = HistogramVec::new(
            HistogramOpts::new("api_request_duration_seconds", "API request duration in seconds")
                .namespace(namespace),
            &["method", "endpoint"],
        )
        .expect("api_request_duration_seconds");

        let persist_failures = IntCounter::with_opts(
            Opts::new("persist_failures_total", "Snapshot persistence write failures")
                .namespace(namespace),
        )
        .expect("persist_failures_total");

        for metric in [
            Box::new(checks_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(checks_success.clone()),
            Box::new(checks_failure.clone()),
            Box::new(check_duration.clone()),
            Box::new(alive_proxies.clone()),
            Box::new(dead_proxies.clone()),
            Box::new(proxies_scraped.clone()),
            Box::new(zmap_scans_total.clone()),
            Box::new(zmap_candidates_found.clone()),
            Box::new(zmap_scan_duration.clone()),
            Box::new(api_requests.clone()),
            Box::new(api_duration.clone()),
            Box::new(persist_failures.clone()),
        ] {
            registry.register(metric).expect("register metric");
        }

        Self {
            registry,
            checks_total,
            checks_success,
            checks_failure,
            check_duration,
            alive_proxies,
            dead_proxies,
            proxies_scraped,
            zmap_scans_total,
            zmap_candidates_found,
            zmap_scan_duration,
            api_requests,
            api_duration,
            persist_failures,
        }
    }

    pub fn record_check_success(&self) {
        self.checks_total.with_label_values(&["success"]).inc();
        self.checks_success.inc();
    }

    pub fn record_check_failure(&self) {
        self.checks_total.with_label_values(&["failure"]).inc();
        self.checks_failure.inc();
    }

    pub fn record_check_duration(&self, seconds: f64) {
        self.check_duration.observe(seconds);
    }

    pub fn set_alive_proxies(&self, count: usize) {
        self.alive_proxies.set(count as i64);
    }

    pub fn set_dead_proxies(&self, count: usize) {
        self.dead_proxies.set(count as i64);
    }

    pub fn record_proxies_scraped(&self, source: &str, count: usize) {
        self.proxies_scraped
            .with_label_values(&[source])
            .inc_by(count as u64);
    }

    pub fn record_zmap_scan(&self, port: u16, status: &str) {
        self.zmap_scans_total
            .with_label_values(&[&port.to_string(), status])
            .inc();
    }

    pub fn record_zmap_candidates(&self, port: u16, count: usize) {
        self.zmap_candidates_found
            .with_label_values(&[&port.to_string()])
            .set(count as i64);
    }

    pub fn record_zmap_duration(&self, seconds: f64) {
        self.zmap_scan_duration.observe(seconds);
    }

    pub fn record_api_request(&self, method: &str, endpoint: &str, status: u16) {
        self.api_requests
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
    }

    pub fn record_api_duration(&self, method: &str, endpoint: &str, seconds: f64) {
        self.api_duration
            .with_label_values(&[method, endpoint])
            .observe(seconds);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("metrics encoding failed: {e}");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}
