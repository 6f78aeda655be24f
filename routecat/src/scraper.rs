use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use prometheus_parser::{GroupKind, MetricGroup};

use crate::registry::{EndpointRegistry, Quarantine};
use crate::stats::RequestStatsMonitor;
use crate::{ErrorKind, Result};

const RUNNING_METRIC: &str = "vllm:num_requests_running";
const WAITING_METRIC: &str = "vllm:num_requests_waiting";
const KV_USAGE_METRIC: &str = "vllm:gpu_cache_usage_perc";

/// Queue depth and cache pressure scraped from one engine's /metrics
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct EngineStats {
    pub running_requests: f64,
    pub waiting_requests: f64,
    /// KV-cache utilisation in [0, 1]
    pub gpu_cache_usage: f64,
}

fn first_value(group: &MetricGroup) -> Option<f64> {
    match &group.metrics {
        GroupKind::Gauge(map) | GroupKind::Counter(map) | GroupKind::Untyped(map) => {
            map.values().next().map(|m| m.value)
        }
        _ => None,
    }
}

/// Pull the engine gauges out of a prometheus exposition body
pub fn parse_engine_metrics(url: &str, text: &str) -> Result<EngineStats> {
    let groups = prometheus_parser::parse_text(text)
        .map_err(|e| {
            debug!("Metrics parse failure from {}: {}", url, e);
            ErrorKind::MetricsUnparseable(url.to_string())
        })?;
    let mut stats = EngineStats::default();
    for group in &groups {
        match group.name.as_str() {
            RUNNING_METRIC => stats.running_requests = first_value(group).unwrap_or(0.0),
            WAITING_METRIC => stats.waiting_requests = first_value(group).unwrap_or(0.0),
            KV_USAGE_METRIC => stats.gpu_cache_usage = first_value(group).unwrap_or(0.0),
            _ => {}
        }
    }
    Ok(stats)
}

/// Periodic scraper of every live engine's /metrics endpoint
///
/// Also the housekeeping tick: clears the connect-failure quarantine and
/// prunes request stats for engines that left the registry.
#[derive(Clone)]
pub struct EngineStatsScraper {
    stats: Arc<RwLock<HashMap<String, EngineStats>>>,
    healthy: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl EngineStatsScraper {
    /// Spawn the scrape loop on the runtime and return the shared handle
    pub fn start(
        registry: EndpointRegistry,
        client: reqwest::Client,
        quarantine: Quarantine,
        request_stats: RequestStatsMonitor,
        interval_secs: u64,
    ) -> Self {
        let scraper = EngineStatsScraper {
            stats: Arc::new(RwLock::new(HashMap::new())),
            healthy: Arc::new(AtomicBool::new(true)),
            running: Arc::new(AtomicBool::new(true)),
        };
        let worker = scraper.clone();
        tokio::spawn(async move {
            while worker.running.load(Ordering::SeqCst) {
                tokio::time::delay_for(Duration::from_secs(interval_secs)).await;
                if !worker.running.load(Ordering::SeqCst) {
                    break;
                }
                worker.scrape_cycle(&registry, &client).await;
                quarantine.clear();
                let live: HashSet<String> =
                    registry.list().into_iter().map(|e| e.url).collect();
                request_stats.retain(&live);
            }
            debug!("Engine stats scraper stopped");
        });
        scraper
    }

    async fn scrape_cycle(&self, registry: &EndpointRegistry, client: &reqwest::Client) {
        let engines = registry.list();
        if engines.is_empty() {
            self.healthy.store(true, Ordering::SeqCst);
            return;
        }
        let mut successes = 0;
        let mut fresh = HashMap::with_capacity(engines.len());
        for engine in &engines {
            match scrape_one(client, &engine.url).await {
                Ok(stats) => {
                    trace!(
                        "Scraped {}: running={} waiting={} kv={}",
                        engine.url, stats.running_requests, stats.waiting_requests,
                        stats.gpu_cache_usage
                    );
                    fresh.insert(engine.url.clone(), stats);
                    successes += 1;
                }
                Err(e) => warn!("Failed to scrape {}: {}", engine.url, e),
            }
        }
        *self.stats.write().unwrap() = fresh;
        self.healthy.store(successes > 0, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HashMap<String, EngineStats> {
        self.stats.read().unwrap().clone()
    }

    /// True iff the last cycle reached at least one engine (or had none to reach)
    pub fn get_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn scrape_one(client: &reqwest::Client, url: &str) -> Result<EngineStats> {
    let mut req = client.get(&format!("{}/metrics", url));
    if let Ok(key) = std::env::var("VLLM_API_KEY") {
        req = req.header("Authorization", format!("Bearer {}", key));
    }
    let res = req.send().await?;
    if !res.status().is_success() {
        return Err(ErrorKind::UpstreamProbeFailure(url.to_string(), res.status()).into());
    }
    let body = res.text().await?;
    parse_engine_metrics(url, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# HELP vllm:num_requests_running Number of requests currently running on GPU.
# TYPE vllm:num_requests_running gauge
vllm:num_requests_running{model_name=\"m\"} 3.0
# HELP vllm:num_requests_waiting Number of requests waiting to be processed.
# TYPE vllm:num_requests_waiting gauge
vllm:num_requests_waiting{model_name=\"m\"} 7.0
# HELP vllm:gpu_cache_usage_perc GPU KV-cache usage. 1 means 100 percent usage.
# TYPE vllm:gpu_cache_usage_perc gauge
vllm:gpu_cache_usage_perc{model_name=\"m\"} 0.25
# TYPE vllm:request_success_total counter
vllm:request_success_total{model_name=\"m\"} 120.0
";

    #[test]
    fn parses_engine_gauges() {
        let stats = parse_engine_metrics("http://e0:8000", SAMPLE).unwrap();
        assert_eq!(stats.running_requests, 3.0);
        assert_eq!(stats.waiting_requests, 7.0);
        assert_eq!(stats.gpu_cache_usage, 0.25);
    }

    #[test]
    fn missing_gauges_default_to_zero() {
        let stats = parse_engine_metrics("http://e0:8000", "# just a comment\n").unwrap();
        assert_eq!(stats, EngineStats::default());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_engine_metrics("http://e0:8000", "{not prometheus}").is_err());
    }
}
