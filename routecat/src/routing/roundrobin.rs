use std::sync::atomic::{AtomicUsize, Ordering};

use super::sorted_urls;
use crate::{EndpointInfo, ErrorKind, Result};

/// Round-robin over the url-sorted eligible pool
///
/// The cursor only ever increments, so over a stable pool of N engines any
/// run of K selections differs by at most one request per engine.
#[derive(Default)]
pub struct RoundRobinRouter {
    cursor: AtomicUsize,
}

impl RoundRobinRouter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn route(&self, eligible: &[EndpointInfo]) -> Result<String> {
        let urls = sorted_urls(eligible);
        if urls.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        let idx = self.cursor.fetch_add(1, Ordering::SeqCst) % urls.len();
        Ok(urls[idx].to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::fleet;
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn distributes_evenly() {
        let eligible = fleet(&["u2", "u0", "u1"], "m");
        let router = RoundRobinRouter::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let url = router.route(&eligible).unwrap();
            *counts.entry(url).or_default() += 1;
        }
        assert_eq!(counts["u0"], 3);
        assert_eq!(counts["u1"], 3);
        assert_eq!(counts["u2"], 3);
    }

    #[test]
    fn balance_holds_for_uneven_request_counts() {
        for n in 1..6 {
            let urls: Vec<String> = (0..n).map(|i| format!("u{}", i)).collect();
            let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
            let eligible = fleet(&refs, "m");
            let router = RoundRobinRouter::new();
            let mut counts: HashMap<String, usize> = HashMap::new();
            for _ in 0..(n * 7 + 3) {
                let url = router.route(&eligible).unwrap();
                *counts.entry(url).or_default() += 1;
            }
            let max = counts.values().max().unwrap();
            let min = counts.values().min().unwrap();
            assert!(max - min <= 1, "n={} spread {}..{}", n, min, max);
        }
    }

    #[test]
    fn selection_order_is_lexicographic() {
        let eligible = fleet(&["ub", "ua"], "m");
        let router = RoundRobinRouter::new();
        assert_eq!(router.route(&eligible).unwrap(), "ua");
        assert_eq!(router.route(&eligible).unwrap(), "ub");
    }
}
