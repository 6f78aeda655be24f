use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::{sorted_urls, RequestFacts, RoundRobinRouter};
use crate::{EndpointInfo, ErrorKind, Result};

/// Session-affinity routing keyed on a configurable header
///
/// The same session id maps to the same engine for as long as the eligible
/// pool is unchanged. Requests without the header fall back to round-robin.
pub struct SessionRouter {
    session_key: String,
    fallback: RoundRobinRouter,
}

impl SessionRouter {
    pub fn new(session_key: String) -> Self {
        SessionRouter {
            session_key,
            fallback: RoundRobinRouter::new(),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn route(&self, eligible: &[EndpointInfo], facts: &RequestFacts) -> Result<String> {
        let urls = sorted_urls(eligible);
        if urls.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        match facts.session_id {
            Some(ref sid) => {
                let mut hasher = DefaultHasher::new();
                sid.hash(&mut hasher);
                let idx = (hasher.finish() % urls.len() as u64) as usize;
                Ok(urls[idx].to_string())
            }
            None => self.fallback.route(eligible),
        }
    }
}
