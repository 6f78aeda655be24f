use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Point-in-time request statistics for one engine url
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct RequestStats {
    /// Completed requests per second over the sliding window
    pub qps: f64,
    pub in_flight: usize,
    /// Mean time-to-first-token in seconds
    pub ttft_avg: f64,
    /// Mean inter-token latency in seconds
    pub itl_avg: f64,
}

#[derive(Default)]
struct Average {
    sum: f64,
    count: u64,
}

impl Average {
    fn push(&mut self, v: f64) {
        self.sum += v;
        self.count += 1;
    }

    fn get(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

#[derive(Default)]
struct UrlCounters {
    in_flight: AtomicUsize,
    completions: Mutex<VecDeque<Instant>>,
    ttft: Mutex<Average>,
    itl: Mutex<Average>,
}

/// Sliding-window request statistics keyed by engine url
///
/// The dispatcher is the only mutator. Counters appear on first observation
/// and are pruned by the scrape cycle when their engine leaves the registry.
#[derive(Clone)]
pub struct RequestStatsMonitor {
    counters: Arc<RwLock<HashMap<String, Arc<UrlCounters>>>>,
    window: Duration,
}

impl RequestStatsMonitor {
    pub fn new(window_secs: u64) -> Self {
        RequestStatsMonitor {
            counters: Arc::new(RwLock::new(HashMap::new())),
            window: Duration::from_secs(window_secs),
        }
    }

    fn counters_for(&self, url: &str) -> Arc<UrlCounters> {
        if let Some(c) = self.counters.read().unwrap().get(url) {
            return Arc::clone(c);
        }
        let mut map = self.counters.write().unwrap();
        Arc::clone(map.entry(url.to_string()).or_default())
    }

    pub fn on_request_start(&self, url: &str) {
        self.counters_for(url)
            .in_flight
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_first_byte(&self, url: &str, ttft: Duration) {
        self.counters_for(url)
            .ttft
            .lock()
            .unwrap()
            .push(ttft.as_secs_f64());
    }

    pub fn on_inter_byte(&self, url: &str, gap: Duration) {
        self.counters_for(url)
            .itl
            .lock()
            .unwrap()
            .push(gap.as_secs_f64());
    }

    /// Release the in-flight slot; `completed` records the qps sample too.
    /// Aborted dispatches release without counting towards throughput.
    pub fn on_request_end(&self, url: &str, completed: bool) {
        let counters = self.counters_for(url);
        let prev = counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            // over-release would wrap; pin back to zero
            counters.in_flight.store(0, Ordering::SeqCst);
        }
        if completed {
            counters.completions.lock().unwrap().push_back(Instant::now());
        }
    }

    /// Current stats per url; completion rings are pruned here
    pub fn snapshot(&self) -> HashMap<String, RequestStats> {
        let now = Instant::now();
        let map = self.counters.read().unwrap();
        let mut out = HashMap::with_capacity(map.len());
        for (url, c) in map.iter() {
            let mut ring = c.completions.lock().unwrap();
            while let Some(front) = ring.front() {
                if now.duration_since(*front) > self.window {
                    ring.pop_front();
                } else {
                    break;
                }
            }
            let qps = ring.len() as f64 / self.window.as_secs_f64();
            drop(ring);
            out.insert(
                url.clone(),
                RequestStats {
                    qps,
                    in_flight: c.in_flight.load(Ordering::SeqCst),
                    ttft_avg: c.ttft.lock().unwrap().get(),
                    itl_avg: c.itl.lock().unwrap().get(),
                },
            );
        }
        out
    }

    /// Drop counters whose engine is no longer live
    pub fn retain(&self, live_urls: &HashSet<String>) {
        self.counters
            .write()
            .unwrap()
            .retain(|url, _| live_urls.contains(url));
    }
}
