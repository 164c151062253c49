//! Scraping the connector's Prometheus endpoint
//!
//! cloudflared exposes text-format metrics on the address announced in its
//! startup logs. The scraper polls every 3s and folds the raw samples into
//! a [`TunnelMetrics`] snapshot; a failed poll keeps the last good snapshot.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

/// Poll cadence
const SCRAPE_INTERVAL: Duration = Duration::from_secs(3);

/// A snapshot older than this is considered stale
const STALE_AFTER: Duration = Duration::from_secs(10);

/// Per-poll HTTP deadline; the endpoint is on loopback
const SCRAPE_TIMEOUT: Duration = Duration::from_secs(2);

const METRIC_TOTAL_REQUESTS: &str = "cloudflared_tunnel_total_requests";
const METRIC_REQUEST_ERRORS: &str = "cloudflared_tunnel_request_errors";
const METRIC_CONCURRENT_REQUESTS: &str = "cloudflared_tunnel_concurrent_requests_per_tunnel";
const METRIC_HA_CONNECTIONS: &str = "cloudflared_tunnel_ha_connections";
const METRIC_ACTIVE_STREAMS: &str = "cloudflared_tunnel_active_streams";
const METRIC_RESPONSE_BY_CODE: &str = "cloudflared_tunnel_response_by_code";
const METRIC_CONNECT_LATENCY_BUCKET: &str = "cloudflared_proxy_connect_latency_bucket";
const METRIC_QUIC_SMOOTHED_RTT: &str = "quic_client_smoothed_rtt";
const METRIC_QUIC_MIN_RTT: &str = "quic_client_min_rtt";

/// One exposition line: `name{labels} value`
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

impl Sample {
    fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Connect-latency percentiles derived from histogram buckets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// QUIC round-trip estimates in milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuicRtt {
    pub smoothed: f64,
    pub min: f64,
}

/// Derived snapshot of one connector's metrics
#[derive(Debug, Clone)]
pub struct TunnelMetrics {
    pub total_requests: u64,
    pub request_errors: u64,
    pub concurrent_requests: u64,
    pub ha_connections: u64,
    pub active_streams: u64,
    pub response_codes: BTreeMap<u16, u64>,
    pub connect_latency: Option<LatencyPercentiles>,
    pub quic_rtt: Option<QuicRtt>,
    pub scraped_at: Instant,
}

static EXPOSITION_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-zA-Z_:][a-zA-Z0-9_:]*)(\{[^}]*\})?\s+([0-9eE+.\-]+|NaN|\+Inf|-Inf)$")
        .unwrap()
});

static LABEL_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([a-zA-Z_][a-zA-Z0-9_]*)="([^"]*)""#).unwrap());

/// Parse Prometheus text exposition into raw samples, skipping comments and
/// lines that do not match the grammar
pub fn parse_exposition(text: &str) -> Vec<Sample> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let caps = EXPOSITION_LINE.captures(line)?;
            let value = parse_value(&caps[3])?;
            let labels = caps
                .get(2)
                .map(|block| {
                    LABEL_PAIR
                        .captures_iter(block.as_str())
                        .map(|c| (c[1].to_string(), c[2].to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Some(Sample {
                name: caps[1].to_string(),
                labels,
                value,
            })
        })
        .collect()
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}

/// Sum of every sample with the given name; values for the same name with
/// different label sets accumulate
fn accumulate(samples: &[Sample], name: &str) -> Option<f64> {
    let mut found = false;
    let mut sum = 0.0;
    for sample in samples.iter().filter(|s| s.name == name) {
        found = true;
        sum += sample.value;
    }
    found.then_some(sum)
}

/// Fold raw samples into the typed snapshot
pub fn derive_snapshot(samples: &[Sample]) -> TunnelMetrics {
    let counter = |name: &str| accumulate(samples, name).unwrap_or(0.0).max(0.0) as u64;

    let mut response_codes = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.name == METRIC_RESPONSE_BY_CODE) {
        if let Some(code) = sample.label("status_code").and_then(|c| c.parse().ok()) {
            *response_codes.entry(code).or_insert(0) += sample.value.max(0.0) as u64;
        }
    }

    let quic_rtt = match (
        accumulate(samples, METRIC_QUIC_SMOOTHED_RTT),
        accumulate(samples, METRIC_QUIC_MIN_RTT),
    ) {
        (Some(smoothed), Some(min)) => Some(QuicRtt { smoothed, min }),
        _ => None,
    };

    TunnelMetrics {
        total_requests: counter(METRIC_TOTAL_REQUESTS),
        request_errors: counter(METRIC_REQUEST_ERRORS),
        concurrent_requests: counter(METRIC_CONCURRENT_REQUESTS),
        ha_connections: counter(METRIC_HA_CONNECTIONS),
        active_streams: counter(METRIC_ACTIVE_STREAMS),
        response_codes,
        connect_latency: derive_latency(samples),
        quic_rtt,
        scraped_at: Instant::now(),
    }
}

/// Histogram percentile: smallest `le` whose cumulative count reaches the
/// target share of observations
fn derive_latency(samples: &[Sample]) -> Option<LatencyPercentiles> {
    let mut buckets: BTreeMap<String, f64> = BTreeMap::new();
    for sample in samples
        .iter()
        .filter(|s| s.name == METRIC_CONNECT_LATENCY_BUCKET)
    {
        let le = sample.label("le")?.to_string();
        *buckets.entry(le).or_insert(0.0) += sample.value;
    }
    if buckets.is_empty() {
        return None;
    }

    let mut sorted: Vec<(f64, f64)> = buckets
        .into_iter()
        .filter_map(|(le, count)| parse_value(&le).map(|le| (le, count)))
        .collect();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let total = sorted
        .iter()
        .find(|(le, _)| le.is_infinite())
        .map(|(_, count)| *count)
        .or_else(|| sorted.last().map(|(_, count)| *count))?;
    if total <= 0.0 {
        return None;
    }

    let percentile = |p: f64| {
        let target = total * p;
        sorted
            .iter()
            .find(|(_, count)| *count >= target)
            .map(|(le, _)| *le)
            .unwrap_or(f64::INFINITY)
    };

    Some(LatencyPercentiles {
        p50: percentile(0.50),
        p95: percentile(0.95),
        p99: percentile(0.99),
    })
}

struct ScraperState {
    addr: Option<String>,
    snapshot: Option<TunnelMetrics>,
    last_error: Option<String>,
}

/// Periodic scraper bound to one connector's metrics address
pub struct MetricsScraper {
    state: Arc<Mutex<ScraperState>>,
    http: reqwest::Client,
    task: Option<JoinHandle<()>>,
}

impl MetricsScraper {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(SCRAPE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            state: Arc::new(Mutex::new(ScraperState {
                addr: None,
                snapshot: None,
                last_error: None,
            })),
            http,
            task: None,
        }
    }

    /// Point the scraper at a metrics address; a change of address discards
    /// the previous snapshot and poll task
    pub fn set_addr(&mut self, addr: Option<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.addr == addr {
                return;
            }
            state.addr = addr.clone();
            state.snapshot = None;
            state.last_error = None;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let Some(addr) = addr else { return };
        let state = Arc::clone(&self.state);
        let http = self.http.clone();
        self.task = Some(tokio::spawn(async move {
            let url = format!("http://{addr}/metrics");
            let mut ticker = tokio::time::interval(SCRAPE_INTERVAL);
            loop {
                ticker.tick().await;
                match scrape_once(&http, &url).await {
                    Ok(snapshot) => {
                        let mut state = state.lock().unwrap();
                        state.snapshot = Some(snapshot);
                        state.last_error = None;
                    }
                    Err(err) => {
                        debug!("metrics scrape of {} failed: {}", url, err);
                        state.lock().unwrap().last_error = Some(err);
                    }
                }
            }
        }));
    }

    /// The last good snapshot, if any
    pub fn snapshot(&self) -> Option<TunnelMetrics> {
        self.state.lock().unwrap().snapshot.clone()
    }

    /// True when no snapshot has landed within the staleness window
    pub fn is_stale(&self) -> bool {
        match self.state.lock().unwrap().snapshot.as_ref() {
            Some(snapshot) => snapshot.scraped_at.elapsed() > STALE_AFTER,
            None => true,
        }
    }

    /// The last scrape error, kept alongside the surviving snapshot
    pub fn last_error(&self) -> Option<String> {
        self.state.lock().unwrap().last_error.clone()
    }
}

impl Default for MetricsScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MetricsScraper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn scrape_once(http: &reqwest::Client, url: &str) -> Result<TunnelMetrics, String> {
    let response = http.get(url).send().await.map_err(|e| e.to_string())?;
    let text = response.text().await.map_err(|e| e.to_string())?;
    Ok(derive_snapshot(&parse_exposition(&text)))
}
