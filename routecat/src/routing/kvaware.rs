use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use super::{least_loaded, sorted_urls, RequestFacts};
use crate::scraper::EngineStats;
use crate::stats::RequestStats;
use crate::{EndpointInfo, ErrorKind, Result};

/// Estimator of per-engine KV-cache hit prefix lengths
///
/// Implementations answer, for one prompt, how many leading characters each
/// candidate engine is likely to already hold in its KV cache. `observe`
/// feeds back the routing decision so the estimate can learn.
pub trait KvCacheIndexer {
    fn estimate(&self, prompt: &str, urls: &[&str]) -> HashMap<String, usize>;
    fn observe(&self, url: &str, prompt: &str);
}

// Sequences remembered per engine before the oldest is evicted.
const OBSERVED_PER_ENGINE: usize = 256;

/// Default indexer: longest chunk-wise overlap with recently routed prompts
pub struct ChunkOverlapIndexer {
    chunk_size: usize,
    seen: Mutex<HashMap<String, VecDeque<Vec<u64>>>>,
}

impl ChunkOverlapIndexer {
    pub fn new(chunk_size: usize) -> Self {
        ChunkOverlapIndexer {
            chunk_size: chunk_size.max(1),
            seen: Mutex::new(HashMap::new()),
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

    fn common_prefix_chunks(a: &[u64], b: &[u64]) -> usize {
        a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
    }
}

impl KvCacheIndexer for ChunkOverlapIndexer {
    fn estimate(&self, prompt: &str, urls: &[&str]) -> HashMap<String, usize> {
        let chunks = self.chunk_hashes(prompt);
        let seen = self.seen.lock().unwrap();
        urls.iter()
            .map(|url| {
                let best = seen
                    .get(*url)
                    .map(|history| {
                        history
                            .iter()
                            .map(|h| Self::common_prefix_chunks(&chunks, h))
                            .max()
                            .unwrap_or(0)
                    })
                    .unwrap_or(0);
                (url.to_string(), best * self.chunk_size)
            })
            .collect()
    }

    fn observe(&self, url: &str, prompt: &str) {
        let chunks = self.chunk_hashes(prompt);
        let mut seen = self.seen.lock().unwrap();
        let history = seen.entry(url.to_string()).or_default();
        history.push_back(chunks);
        while history.len() > OBSERVED_PER_ENGINE {
            history.pop_front();
        }
    }
}

/// KV-cache-aware routing: argmax of the indexer's estimated hit length
///
/// Ties break on the lowest in-flight count, then on url.
pub struct KvAwareRouter {
    indexer: Box<dyn KvCacheIndexer + Send + Sync>,
}

impl KvAwareRouter {
    pub fn new(indexer: Box<dyn KvCacheIndexer + Send + Sync>) -> Self {
        KvAwareRouter { indexer }
    }

    pub fn route(
        &self,
        eligible: &[EndpointInfo],
        _engine_stats: &HashMap<String, EngineStats>,
        request_stats: &HashMap<String, RequestStats>,
        facts: &RequestFacts,
    ) -> Result<String> {
        let urls = sorted_urls(eligible);
        if urls.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        let estimates = self.indexer.estimate(&facts.prompt, &urls);
        let best_len = urls
            .iter()
            .map(|u| estimates.get(*u).copied().unwrap_or(0))
            .max()
            .unwrap_or(0);
        let best: Vec<&str> = urls
            .iter()
            .filter(|u| estimates.get(**u).copied().unwrap_or(0) == best_len)
            .copied()
            .collect();
        let chosen = least_loaded(&best, request_stats).unwrap();
        self.indexer.observe(&chosen, &facts.prompt);
        Ok(chosen)
    }
}
