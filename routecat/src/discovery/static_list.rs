use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::registry::EndpointRegistry;
use crate::{EndpointInfo, ModelInfo, ModelType, Result, RouterConfig, SleepState};

const PROBE_PERIOD: Duration = Duration::from_secs(60);

struct StaticEntry {
    id: Uuid,
    url: String,
    model: String,
    model_label: Option<String>,
    model_type: Option<ModelType>,
}

impl StaticEntry {
    fn endpoint(&self) -> EndpointInfo {
        let mut model_info = BTreeMap::new();
        model_info.insert(self.model.clone(), ModelInfo::base(&self.model));
        EndpointInfo {
            id: self.id,
            url: self.url.clone(),
            model_names: vec![self.model.clone()],
            model_info,
            model_label: self.model_label.clone(),
            added_timestamp: Utc::now().timestamp(),
            sleep: SleepState::Awake,
            pod_name: None,
            service_name: None,
            namespace: None,
        }
    }
}

struct Inner {
    entries: Vec<StaticEntry>,
    aliases: BTreeMap<String, String>,
    registry: EndpointRegistry,
    client: reqwest::Client,
    /// Entries currently hidden from the registry; ids are remembered so a
    /// later probe success re-admits the same engine id.
    unhealthy: Mutex<HashSet<Uuid>>,
    running: AtomicBool,
}

/// Fixed engine inventory from parallel CLI lists
///
/// One engine per (url, model) pair, written to the registry at start.
/// With health checks enabled, a periodic probe hides entries that fail a
/// protocol-specific liveness request.
#[derive(Clone)]
pub struct StaticDiscovery {
    inner: Arc<Inner>,
}

impl StaticDiscovery {
    pub fn start(
        cfg: &RouterConfig,
        registry: EndpointRegistry,
        client: reqwest::Client,
    ) -> Result<StaticDiscovery> {
        let entries: Vec<StaticEntry> = cfg
            .static_backends
            .iter()
            .enumerate()
            .map(|(i, url)| StaticEntry {
                id: Uuid::new_v4(),
                url: url.clone(),
                model: cfg.static_models[i].clone(),
                model_label: cfg.static_model_labels.get(i).cloned(),
                model_type: cfg.static_model_types.get(i).copied(),
            })
            .collect();

        let sd = StaticDiscovery {
            inner: Arc::new(Inner {
                entries,
                aliases: cfg.static_aliases.clone(),
                registry,
                client,
                unhealthy: Mutex::new(HashSet::new()),
                running: AtomicBool::new(true),
            }),
        };
        for entry in &sd.inner.entries {
            sd.inner.registry.upsert(entry.endpoint());
        }
        if cfg.static_backend_health_checks {
            let worker = sd.clone();
            tokio::spawn(async move {
                worker.probe_loop().await;
            });
            info!("Static backend health checks enabled");
        }
        Ok(sd)
    }

    pub fn resolve_alias(&self, model: &str) -> String {
        self.inner
            .aliases
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub fn get_health(&self) -> bool {
        self.inner.registry.health()
    }

    pub fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.registry.clear();
        self.inner.registry.close();
    }

    async fn probe_loop(&self) {
        while self.inner.running.load(Ordering::SeqCst) {
            self.probe_cycle().await;
            tokio::time::delay_for(PROBE_PERIOD).await;
        }
        debug!("Static health probe stopped");
    }

    async fn probe_cycle(&self) {
        for entry in &self.inner.entries {
            if !self.inner.running.load(Ordering::SeqCst) {
                return;
            }
            let healthy = self.probe_entry(entry).await;
            let mut unhealthy = self.inner.unhealthy.lock().unwrap();
            if healthy {
                if unhealthy.remove(&entry.id) {
                    info!("{} at {} is healthy again", entry.model, entry.url);
                    self.inner.registry.upsert(entry.endpoint());
                } else {
                    debug!("{} at {} is healthy", entry.model, entry.url);
                }
            } else if unhealthy.insert(entry.id) {
                warn!("{} at {} not healthy!", entry.model, entry.url);
                self.inner.registry.remove(&entry.id);
            }
        }
    }

    /// One-shot decoy request appropriate to the configured model type
    async fn probe_entry(&self, entry: &StaticEntry) -> bool {
        let mtype = match entry.model_type {
            Some(t) => t,
            None => return true,
        };
        let url = format!("{}{}", entry.url, mtype.probe_path());
        let mut req = self
            .inner
            .client
            .post(&url)
            .json(&mtype.probe_body(&entry.model));
        if let Ok(key) = std::env::var("VLLM_API_KEY") {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        match req.send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }
}
