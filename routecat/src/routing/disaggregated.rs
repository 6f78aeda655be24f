use std::sync::atomic::{AtomicUsize, Ordering};

use super::RouteDecision;
use crate::{EndpointInfo, ErrorKind, Result};

/// Disaggregated prefill/decode routing
///
/// The eligible pool is partitioned by `model_label` into a prefill pool and
/// a decode pool; each pool round-robins independently and every request gets
/// one engine from each.
pub struct DisaggregatedRouter {
    prefill_labels: Vec<String>,
    decode_labels: Vec<String>,
    prefill_cursor: AtomicUsize,
    decode_cursor: AtomicUsize,
}

impl DisaggregatedRouter {
    pub fn new(prefill_labels: Vec<String>, decode_labels: Vec<String>) -> Self {
        DisaggregatedRouter {
            prefill_labels,
            decode_labels,
            prefill_cursor: AtomicUsize::new(0),
            decode_cursor: AtomicUsize::new(0),
        }
    }

    fn pool<'a>(&self, eligible: &'a [EndpointInfo], labels: &[String]) -> Vec<&'a str> {
        let mut urls: Vec<&str> = eligible
            .iter()
            .filter(|e| {
                e.model_label
                    .as_ref()
                    .map(|l| labels.contains(l))
                    .unwrap_or(false)
            })
            .map(|e| e.url.as_str())
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    pub fn route(&self, eligible: &[EndpointInfo]) -> Result<RouteDecision> {
        let prefill_pool = self.pool(eligible, &self.prefill_labels);
        let decode_pool = self.pool(eligible, &self.decode_labels);
        if prefill_pool.is_empty() || decode_pool.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        let p = self.prefill_cursor.fetch_add(1, Ordering::SeqCst) % prefill_pool.len();
        let d = self.decode_cursor.fetch_add(1, Ordering::SeqCst) % decode_pool.len();
        Ok(RouteDecision::Pair {
            prefill: prefill_pool[p].to_string(),
            decode: decode_pool[d].to_string(),
        })
    }
}
