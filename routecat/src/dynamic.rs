use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::discovery::{reconfigure_service_discovery, ServiceDiscovery};
use crate::registry::EndpointRegistry;
use crate::routing::Router;
use crate::{ConfigFormat, DynamicConfig, RouterConfig};

const POLL_PERIOD: Duration = Duration::from_secs(10);

/// Does this overlay require tearing down the discovery backend?
fn touches_discovery(dc: &DynamicConfig) -> bool {
    dc.service_discovery.is_some()
        || dc.static_backends.is_some()
        || dc.static_models.is_some()
        || dc.static_model_labels.is_some()
        || dc.static_aliases.is_some()
        || dc.k8s_namespace.is_some()
        || dc.k8s_port.is_some()
        || dc.k8s_label_selector.is_some()
}

struct Inner {
    path: PathBuf,
    format: ConfigFormat,
    /// Config as currently applied; overlays stack onto this
    applied: RwLock<RouterConfig>,
    current: RwLock<Option<DynamicConfig>>,
    last_raw: RwLock<Option<String>>,
    healthy: AtomicBool,
    running: AtomicBool,
}

/// Poll-based watcher over the dynamic YAML/JSON config file
///
/// Changed content is parsed, validated against the running config and only
/// then applied: the router swaps atomically and the discovery backend is
/// rebuilt when a discovery key changed. Any failure leaves the previous
/// configuration running.
#[derive(Clone)]
pub struct DynamicConfigWatcher {
    inner: Arc<Inner>,
}

impl DynamicConfigWatcher {
    pub fn start(
        path: PathBuf,
        format: ConfigFormat,
        base: RouterConfig,
        registry: EndpointRegistry,
        client: reqwest::Client,
        discovery: Arc<RwLock<ServiceDiscovery>>,
        router: Arc<RwLock<Router>>,
    ) -> DynamicConfigWatcher {
        let watcher = DynamicConfigWatcher {
            inner: Arc::new(Inner {
                path,
                format,
                applied: RwLock::new(base),
                current: RwLock::new(None),
                last_raw: RwLock::new(None),
                healthy: AtomicBool::new(true),
                running: AtomicBool::new(true),
            }),
        };
        let worker = watcher.clone();
        tokio::spawn(async move {
            info!(
                "Watching dynamic config at {}",
                worker.inner.path.display()
            );
            while worker.inner.running.load(Ordering::SeqCst) {
                worker.tick(&registry, &client, &discovery, &router).await;
                tokio::time::delay_for(POLL_PERIOD).await;
            }
            debug!("Dynamic config watcher stopped");
        });
        watcher
    }

    async fn tick(
        &self,
        registry: &EndpointRegistry,
        client: &reqwest::Client,
        discovery: &Arc<RwLock<ServiceDiscovery>>,
        router: &Arc<RwLock<Router>>,
    ) {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(
                    "Could not read dynamic config {}: {}",
                    self.inner.path.display(),
                    e
                );
                self.inner.healthy.store(false, Ordering::SeqCst);
                return;
            }
        };
        self.inner.healthy.store(true, Ordering::SeqCst);
        {
            let last = self.inner.last_raw.read().unwrap();
            if last.as_deref() == Some(raw.as_str()) {
                return;
            }
        }

        let dc = match DynamicConfig::parse(&raw, self.inner.format) {
            Ok(dc) => dc,
            Err(e) => {
                error!("Dynamic config rejected (parse): {}", e);
                *self.inner.last_raw.write().unwrap() = Some(raw);
                return;
            }
        };
        let merged = {
            let applied = self.inner.applied.read().unwrap();
            match dc.apply_to(&applied) {
                Ok(m) => m,
                Err(e) => {
                    error!("Dynamic config rejected (validation): {}", e);
                    *self.inner.last_raw.write().unwrap() = Some(raw);
                    return;
                }
            }
        };

        if touches_discovery(&dc) {
            if let Err(e) = reconfigure_service_discovery(
                discovery,
                &merged,
                registry.clone(),
                client.clone(),
            )
            .await
            {
                error!("Dynamic config rejected (discovery): {}", e);
                *self.inner.last_raw.write().unwrap() = Some(raw);
                return;
            }
        }
        *router.write().unwrap() = Router::from_config(&merged);
        info!(
            "Dynamic config applied: routing logic {:?}, discovery {:?}",
            merged.routing_logic, merged.service_discovery
        );
        *self.inner.applied.write().unwrap() = merged;
        *self.inner.current.write().unwrap() = Some(dc);
        *self.inner.last_raw.write().unwrap() = Some(raw);
    }

    /// Last successfully applied overlay, surfaced on /health
    pub fn current(&self) -> Option<DynamicConfig> {
        self.inner.current.read().unwrap().clone()
    }

    pub fn get_health(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}
