use std::collections::HashMap;

use crate::scraper::EngineStats;
use crate::stats::RequestStats;
use crate::{EndpointInfo, ErrorKind, Result, RouterConfig, RoutingLogic};

mod roundrobin;
pub use roundrobin::RoundRobinRouter;

mod session;
pub use session::SessionRouter;

mod prefix;
pub use prefix::PrefixAwareRouter;

mod kvaware;
pub use kvaware::{ChunkOverlapIndexer, KvAwareRouter, KvCacheIndexer};

mod disaggregated;
pub use disaggregated::DisaggregatedRouter;

/// Everything a strategy may fingerprint on for one inbound request
#[derive(Clone, Debug, Default)]
pub struct RequestFacts {
    pub request_id: String,
    /// Requested model after alias resolution
    pub model: String,
    /// Value of the configured session header, when present
    pub session_id: Option<String>,
    /// Extracted prompt text (empty for bodies without one)
    pub prompt: String,
}

/// Outcome of a routing decision
#[derive(Clone, Debug, PartialEq)]
pub enum RouteDecision {
    Single(String),
    Pair { prefill: String, decode: String },
}

impl RouteDecision {
    /// The engine that will stream the response back
    pub fn primary(&self) -> &str {
        match self {
            RouteDecision::Single(url) => url,
            RouteDecision::Pair { decode, .. } => decode,
        }
    }
}

/// The active routing strategy
///
/// Strategies are pure with respect to their inputs; internal cursors and
/// caches mutate atomically so concurrent selections stay consistent.
pub enum Router {
    RoundRobin(RoundRobinRouter),
    Session(SessionRouter),
    PrefixAware(PrefixAwareRouter),
    KvAware(KvAwareRouter),
    Disaggregated(DisaggregatedRouter),
}

impl Router {
    pub fn from_config(cfg: &RouterConfig) -> Router {
        match cfg.routing_logic {
            RoutingLogic::RoundRobin => Router::RoundRobin(RoundRobinRouter::new()),
            RoutingLogic::Session => Router::Session(SessionRouter::new(
                cfg.session_key.clone().unwrap_or_else(|| "x-user-id".into()),
            )),
            RoutingLogic::PrefixAware => {
                Router::PrefixAware(PrefixAwareRouter::new(cfg.prefix_chunk_size))
            }
            RoutingLogic::KvAware => Router::KvAware(KvAwareRouter::new(Box::new(
                ChunkOverlapIndexer::new(cfg.prefix_chunk_size),
            ))),
            RoutingLogic::DisaggregatedPrefill => Router::Disaggregated(DisaggregatedRouter::new(
                cfg.prefill_model_labels.clone(),
                cfg.decode_model_labels.clone(),
            )),
        }
    }

    /// The header name the dispatcher should read the session id from
    pub fn session_header(&self) -> Option<&str> {
        match self {
            Router::Session(s) => Some(s.session_key()),
            _ => None,
        }
    }

    /// Choose the engine(s) for one request from the eligible pool
    pub fn route(
        &self,
        eligible: &[EndpointInfo],
        engine_stats: &HashMap<String, EngineStats>,
        request_stats: &HashMap<String, RequestStats>,
        facts: &RequestFacts,
    ) -> Result<RouteDecision> {
        if eligible.is_empty() {
            return Err(ErrorKind::NoEnginesAvailable.into());
        }
        match self {
            Router::RoundRobin(r) => r.route(eligible).map(RouteDecision::Single),
            Router::Session(r) => r.route(eligible, facts).map(RouteDecision::Single),
            Router::PrefixAware(r) => r
                .route(eligible, request_stats, facts)
                .map(RouteDecision::Single),
            Router::KvAware(r) => r
                .route(eligible, engine_stats, request_stats, facts)
                .map(RouteDecision::Single),
            Router::Disaggregated(r) => r.route(eligible),
        }
    }
}

/// Deterministic url ordering shared by the strategies
pub(crate) fn sorted_urls(eligible: &[EndpointInfo]) -> Vec<&str> {
    let mut urls: Vec<&str> = eligible.iter().map(|e| e.url.as_str()).collect();
    urls.sort();
    urls.dedup();
    urls
}

/// Lowest in-flight count wins; ties break on the lexicographically
/// smallest url so the choice is stable.
pub(crate) fn least_loaded(
    urls: &[&str],
    request_stats: &HashMap<String, RequestStats>,
) -> Option<String> {
    urls.iter()
        .map(|u| {
            let in_flight = request_stats.get(*u).map(|s| s.in_flight).unwrap_or(0);
            (in_flight, *u)
        })
        .min()
        .map(|(_, u)| u.to_string())
}
