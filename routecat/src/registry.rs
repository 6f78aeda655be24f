use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use crate::{EndpointInfo, SleepState};

/// The canonical shared inventory of live engines
///
/// Discovery workers are the only writers; everyone else takes value-copy
/// snapshots via `list()` so no lock is held across routing or upstream I/O.
#[derive(Clone, Default)]
pub struct EndpointRegistry {
    engines: Arc<RwLock<BTreeMap<Uuid, EndpointInfo>>>,
    observed: Arc<AtomicBool>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Point-in-time snapshot of the fleet
    pub fn list(&self) -> Vec<EndpointInfo> {
        self.engines.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.engines.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &Uuid) -> Option<EndpointInfo> {
        self.engines.read().unwrap().get(id).cloned()
    }

    pub fn find_by_url(&self, url: &str) -> Option<EndpointInfo> {
        self.engines
            .read()
            .unwrap()
            .values()
            .find(|e| e.url == url)
            .cloned()
    }

    /// Insert or replace by engine id
    pub fn upsert(&self, engine: EndpointInfo) {
        let mut map = self.engines.write().unwrap();
        if map.contains_key(&engine.id) {
            debug!("Updating serving engine {} at {}", engine.id, engine.url);
        } else {
            info!(
                "Discovered new serving engine {} at {}, running models: {:?}",
                engine.id, engine.url, engine.model_names
            );
        }
        map.insert(engine.id, engine);
        drop(map);
        self.observed.store(true, Ordering::SeqCst);
    }

    /// Remove by engine id; no-op when absent
    pub fn remove(&self, id: &Uuid) {
        let mut map = self.engines.write().unwrap();
        if let Some(old) = map.remove(id) {
            info!("Serving engine {} at {} is deleted", id, old.url);
            drop(map);
            self.observed.store(true, Ordering::SeqCst);
        }
    }

    /// Update the sleep state of one engine in place
    pub fn set_sleep(&self, id: &Uuid, sleep: SleepState) {
        let mut map = self.engines.write().unwrap();
        if let Some(engine) = map.get_mut(id) {
            engine.sleep = sleep;
        }
    }

    /// Drop every engine; used when a discovery backend shuts down
    pub fn clear(&self) {
        let mut map = self.engines.write().unwrap();
        if !map.is_empty() {
            info!("Releasing {} serving engines from the registry", map.len());
            map.clear();
        }
    }

    /// True once the first discovery tick has been applied, until `close()`
    pub fn health(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    /// Called by discovery teardown; clears the progress bit
    pub fn close(&self) {
        self.observed.store(false, Ordering::SeqCst);
    }
}

/// One-strike transient failure set for upstream connect errors
///
/// A struck url is hidden from routing until the next scrape cycle clears it.
#[derive(Clone, Default)]
pub struct Quarantine {
    urls: Arc<Mutex<HashSet<String>>>,
}

impl Quarantine {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn strike(&self, url: &str) {
        let mut urls = self.urls.lock().unwrap();
        if urls.insert(url.to_string()) {
            warn!("Engine at {} quarantined until the next probe cycle", url);
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.lock().unwrap().contains(url)
    }

    pub fn clear(&self) {
        let mut urls = self.urls.lock().unwrap();
        if !urls.is_empty() {
            debug!("Clearing {} quarantined engines", urls.len());
            urls.clear();
        }
    }
}
