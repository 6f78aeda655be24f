use crate::registry::EndpointRegistry;
use crate::{DiscoveryMode, Result, RouterConfig};

mod static_list;
pub use static_list::StaticDiscovery;

mod kubernetes;
pub use kubernetes::{apply_subject_update, K8sDiscovery, SubjectFacts, WatchKind};

/// The active service discovery backend
///
/// Exactly one backend owns the registry at a time. Handles are cheap clones
/// so callers never hold a lock across the async control operations.
#[derive(Clone)]
pub enum ServiceDiscovery {
    Static(StaticDiscovery),
    Kubernetes(K8sDiscovery),
}

impl ServiceDiscovery {
    /// Build the configured backend, seed or start watching, return the handle
    pub async fn initialize(
        cfg: &RouterConfig,
        registry: EndpointRegistry,
        client: reqwest::Client,
    ) -> Result<ServiceDiscovery> {
        match cfg.service_discovery {
            DiscoveryMode::Static => {
                let sd = StaticDiscovery::start(cfg, registry, client)?;
                Ok(ServiceDiscovery::Static(sd))
            }
            DiscoveryMode::K8s => {
                let kd = K8sDiscovery::start(cfg, registry, client).await?;
                Ok(ServiceDiscovery::Kubernetes(kd))
            }
        }
    }

    pub fn get_health(&self) -> bool {
        match self {
            ServiceDiscovery::Static(sd) => sd.get_health(),
            ServiceDiscovery::Kubernetes(kd) => kd.get_health(),
        }
    }

    /// Rewrite an inbound model name through the alias table, if any
    pub fn resolve_alias(&self, model: &str) -> String {
        match self {
            ServiceDiscovery::Static(sd) => sd.resolve_alias(model),
            ServiceDiscovery::Kubernetes(_) => model.to_string(),
        }
    }

    /// Mark the subject as sleeping in the discovery source
    pub async fn add_sleep_label(&self, subject: &str) -> Result<()> {
        match self {
            ServiceDiscovery::Static(_) => Ok(()),
            ServiceDiscovery::Kubernetes(kd) => kd.add_sleep_label(subject).await,
        }
    }

    pub async fn remove_sleep_label(&self, subject: &str) -> Result<()> {
        match self {
            ServiceDiscovery::Static(_) => Ok(()),
            ServiceDiscovery::Kubernetes(kd) => kd.remove_sleep_label(subject).await,
        }
    }

    /// Stop the background worker and release the registry
    pub fn close(&self) {
        match self {
            ServiceDiscovery::Static(sd) => sd.close(),
            ServiceDiscovery::Kubernetes(kd) => kd.close(),
        }
    }
}

/// Replace the running discovery backend with a freshly configured one
///
/// The old backend is closed first so its engines leave the registry before
/// the new backend seeds or watches.
pub async fn reconfigure_service_discovery(
    slot: &std::sync::Arc<std::sync::RwLock<ServiceDiscovery>>,
    cfg: &RouterConfig,
    registry: EndpointRegistry,
    client: reqwest::Client,
) -> Result<()> {
    let old = slot.read().unwrap().clone();
    old.close();
    let fresh = ServiceDiscovery::initialize(cfg, registry, client).await?;
    *slot.write().unwrap() = fresh;
    info!("Service discovery reconfigured to {:?}", cfg.service_discovery);
    Ok(())
}
