use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::{least_loaded, sorted_urls, RequestFacts};
use crate::stats::RequestStats;
use crate::{EndpointInfo, ErrorKind, Result};

// Full reset threshold so an adversarial prompt mix cannot grow the
// tree without bound.
const MAX_TREE_NODES: usize = 1 << 20;

#[derive(Default)]
struct Node {
    children: HashMap<u64, Node>,
    urls: HashSet<String>,
}

#[derive(Default)]
struct PrefixTree {
    root: Node,
    node_count: usize,
}

impl PrefixTree {
    /// Deepest chunk depth at which any of `candidates` has seen this prefix,
    /// together with the engines present at that depth.
    fn longest_match(&self, chunks: &[u64], candidates: &HashSet<&str>) -> Option<Vec<String>> {
        let mut node = &self.root;
        let mut best: Option<Vec<String>> = None;
        for chunk in chunks {
            node = match node.children.get(chunk) {
                Some(n) => n,
                None => break,
            };
            let present: Vec<String> = node
                .urls
                .iter()
                .filter(|u| candidates.contains(u.as_str()))
                .cloned()
                .collect();
            if !present.is_empty() {
                best = Some(present);
            }
        }
        best
    }

    fn insert(&mut self, chunks: &[u64], url: &str) {
        let mut node = &mut self.root;
        for chunk in chunks {
            if !node.children.contains_key(chunk) {
                self.node_count += 1;
            }
            node = node.children.entry(*chunk).or_default();
            node.urls.insert(url.to_string());
        }
    }

    fn maybe_reset(&mut self) {
        if self.node_count > MAX_TREE_NODES {
            debug!("Prefix tree exceeded {} nodes, resetting", MAX_TREE_NODES);
            self.root = Node::default();
            self.node_count = 0;
        }
    }
}

/// Prefix-aware routing over fixed-size prompt chunks
///
/// A trie remembers which engine recently saw which chunked prefix. Requests
/// follow the longest matching prefix; with no match at all they go to the
/// least loaded engine, and the chosen engine's trie path is extended either
/// way.
pub struct PrefixAwareRouter {
    chunk_size: usize,
    tree: Mutex<PrefixTree>,
}

impl PrefixAwareRouter {
    pub fn new(chunk_size: usize) -> Self {
        PrefixAwareRouter {
            chunk_size: chunk_size.max(1),
            tree: Mutex::new(PrefixTree::default()),
        }
    }

    fn chunk_hashes(&self, prompt: &str) -> Vec<u64> {
        let chars: Vec<char> = prompt.chars().collect();
        chars
            .chunks(self.chunk_size)
            .map(|chunk| {
                let mut hasher = DefaultHasher::new();
                for c in chunk {
                    c.hash(&mut hasher);
                }
                hasher.finish()
            })
            .collect()
    }

    pub fn route(
        &self,
        eligible: &[EndpointInfo],
        request_stats: &HashMap<String, RequestStats>,
        facts: &RequestFacts,
    ) -> Result<String> {
        let urls = sorted_urls(eligible);
        if urls.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        let candidates: HashSet<&str> = urls.iter().copied().collect();
        let chunks = self.chunk_hashes(&facts.prompt);

        let mut tree = self.tree.lock().unwrap();
        let matched = tree.longest_match(&chunks, &candidates);
        let chosen = match matched {
            Some(mut present) => {
                present.sort();
                let present_refs: Vec<&str> = present.iter().map(String::as_str).collect();
                least_loaded(&present_refs, request_stats).unwrap()
            }
            None => least_loaded(&urls, request_stats).unwrap(),
        };
        tree.insert(&chunks, &chosen);
        tree.maybe_reset();
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::fleet;
    use super::*;

    fn facts(prompt: &str) -> RequestFacts {
        RequestFacts {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    fn in_flight(pairs: &[(&str, usize)]) -> HashMap<String, RequestStats> {
        pairs
            .iter()
            .map(|(u, n)| {
                (
                    u.to_string(),
                    RequestStats {
                        in_flight: *n,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn growing_prefixes_stay_on_one_engine() {
        let eligible = fleet(&["u0", "u1", "u2"], "m");
        let router = PrefixAwareRouter::new(4);
        let stats = HashMap::new();
        let a = router.route(&eligible, &stats, &facts("AAAA")).unwrap();
        let b = router.route(&eligible, &stats, &facts("AAAABBBB")).unwrap();
        let c = router
            .route(&eligible, &stats, &facts("AAAABBBBCCCC"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn disjoint_prefixes_spread_under_load() {
        let eligible = fleet(&["u0", "u1"], "m");
        let router = PrefixAwareRouter::new(4);

        let a = router
            .route(&eligible, &in_flight(&[]), &facts("AAAA"))
            .unwrap();
        // first stream still in flight on its engine
        let b = router
            .route(&eligible, &in_flight(&[(&a, 1)]), &facts("DDDD"))
            .unwrap();
        let c = router
            .route(&eligible, &in_flight(&[(&a, 1), (&b, 1)]), &facts("GGGG"))
            .unwrap();

        let mut distinct: Vec<&str> = vec![&a, &b, &c];
        distinct.sort();
        distinct.dedup();
        assert!(distinct.len() >= 2, "expected spread, got {:?}", (a, b, c));
    }

    #[test]
    fn shared_first_chunk_beats_load() {
        let eligible = fleet(&["u0", "u1"], "m");
        let router = PrefixAwareRouter::new(4);
        let stats = HashMap::new();
        let a = router.route(&eligible, &stats, &facts("AAAAXX")).unwrap();
        // heavy load on the matched engine must not divert a matching prefix
        let loaded = in_flight(&[(&a, 50)]);
        let b = router.route(&eligible, &loaded, &facts("AAAAYY")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_prompt_routes_to_least_loaded() {
        let eligible = fleet(&["u0", "u1"], "m");
        let router = PrefixAwareRouter::new(4);
        let stats = in_flight(&[("u0", 3), ("u1", 1)]);
        assert_eq!(router.route(&eligible, &stats, &facts("")).unwrap(), "u1");
    }

    #[test]
    fn match_is_scoped_to_eligible_engines() {
        let router = PrefixAwareRouter::new(4);
        let stats = HashMap::new();
        let first = fleet(&["u0"], "m");
        router.route(&first, &stats, &facts("AAAA")).unwrap();
        // u0 left the pool; the remembered prefix must not leak through
        let second = fleet(&["u1"], "m");
        assert_eq!(
            router.route(&second, &stats, &facts("AAAA")).unwrap(),
            "u1"
        );
    }
}
