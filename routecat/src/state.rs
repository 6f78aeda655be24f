use std::sync::{Arc, RwLock};

use crate::discovery::ServiceDiscovery;
use crate::dynamic::DynamicConfigWatcher;
use crate::registry::{EndpointRegistry, Quarantine};
use crate::routing::Router;
use crate::scraper::EngineStatsScraper;
use crate::stats::RequestStatsMonitor;
use crate::RouterConfig;

/// The canonical shared state for actix
///
/// Every subsystem handle is dependency-injected here by `main`; nothing in
/// the crate reaches for globals. Handlers clone what they need out of the
/// locks and never hold a guard across an await point.
#[derive(Clone)]
pub struct AppState {
    pub config: RouterConfig,
    pub registry: EndpointRegistry,
    pub discovery: Arc<RwLock<ServiceDiscovery>>,
    pub router: Arc<RwLock<Router>>,
    pub request_stats: RequestStatsMonitor,
    pub scraper: EngineStatsScraper,
    pub quarantine: Quarantine,
    pub client: reqwest::Client,
    pub dynamic: Option<DynamicConfigWatcher>,
}

impl AppState {
    /// Cheap clone of the active discovery backend
    pub fn discovery(&self) -> ServiceDiscovery {
        self.discovery.read().unwrap().clone()
    }

    /// Header name carrying the session id, when session routing is active
    pub fn session_header(&self) -> Option<String> {
        self.router
            .read()
            .unwrap()
            .session_header()
            .map(String::from)
    }
}
