use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use kube::{
    api::{Api, ListParams, PatchParams, PatchStrategy, Resource, WatchEvent},
    client::APIClient,
    runtime::Informer,
};
use uuid::Uuid;

use crate::registry::EndpointRegistry;
use crate::{
    EndpointInfo, ErrorKind, K8sDiscoveryType, ModelInfo, Result, RouterConfig, SleepState,
};

const WATCH_BACKOFF: Duration = Duration::from_millis(500);
const WATCH_TIMEOUT_SECS: u32 = 30;
const SLEEP_MODE_FLAG: &str = "--enable-sleep-mode";
const MODEL_LABEL: &str = "model";

/// Client creator: in-cluster service account first, kubeconfig fallback
async fn make_client() -> Result<APIClient> {
    let config = if let Ok(cfg) = kube::config::incluster_config() {
        cfg
    } else {
        kube::config::load_kube_config()
            .await
            .map_err(ErrorKind::KubeError)?
    };
    Ok(APIClient::new(config))
}

/// Kind of a watch event after readiness classification
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum WatchKind {
    Added,
    Modified,
    Deleted,
}

/// Everything the reconciler needs to know about one watched subject
///
/// Extracted from the k8s object plus the engine probes so the registry
/// update itself is a pure function.
#[derive(Clone, Debug)]
pub struct SubjectFacts {
    pub name: String,
    pub url: Option<String>,
    pub ready: bool,
    pub model_names: Vec<String>,
    pub model_info: BTreeMap<String, ModelInfo>,
    pub model_label: Option<String>,
    pub sleep: SleepState,
    pub namespace: String,
    pub is_pod: bool,
}

/// Stable engine id for a k8s subject name
pub fn subject_id(name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes())
}

/// Apply one watch observation to the registry
///
/// ADDED and MODIFIED admit the engine only when the subject is ready and
/// reported a non-empty model list; MODIFIED to a not-ready or model-less
/// state removes it. For a given subject the last event wins.
pub fn apply_subject_update(registry: &EndpointRegistry, kind: WatchKind, facts: SubjectFacts) {
    let id = subject_id(&facts.name);
    match kind {
        WatchKind::Added | WatchKind::Modified => {
            let url = match facts.url {
                Some(ref u) => u.clone(),
                None => return,
            };
            if facts.ready && !facts.model_names.is_empty() {
                registry.upsert(EndpointInfo {
                    id,
                    url,
                    model_names: facts.model_names,
                    model_info: facts.model_info,
                    model_label: facts.model_label,
                    added_timestamp: Utc::now().timestamp(),
                    sleep: facts.sleep,
                    pod_name: if facts.is_pod {
                        Some(facts.name.clone())
                    } else {
                        None
                    },
                    service_name: if facts.is_pod {
                        None
                    } else {
                        Some(facts.name.clone())
                    },
                    namespace: Some(facts.namespace),
                });
            } else if kind == WatchKind::Modified {
                registry.remove(&id);
            }
        }
        WatchKind::Deleted => registry.remove(&id),
    }
}

struct Inner {
    namespace: String,
    port: u16,
    variant: K8sDiscoveryType,
    label_selector: Option<String>,
    registry: EndpointRegistry,
    http: reqwest::Client,
    kube: APIClient,
    running: AtomicBool,
}

/// Kubernetes-backed discovery: a long-lived watch over engine pods or
/// services in one namespace, reconciling the registry on every event.
#[derive(Clone)]
pub struct K8sDiscovery {
    inner: Arc<Inner>,
}

impl K8sDiscovery {
    pub async fn start(
        cfg: &RouterConfig,
        registry: EndpointRegistry,
        http: reqwest::Client,
    ) -> Result<K8sDiscovery> {
        let kube = make_client().await?;
        let kd = K8sDiscovery {
            inner: Arc::new(Inner {
                namespace: cfg.k8s_namespace.clone(),
                port: cfg.k8s_port,
                variant: cfg.k8s_service_discovery_type,
                label_selector: cfg.k8s_label_selector.clone(),
                registry,
                http,
                kube,
                running: AtomicBool::new(true),
            }),
        };
        if kd.inner.variant == K8sDiscoveryType::ServiceName {
            warn!(
                "service-name discovery relies on kubernetes service load-balancing; \
                 only use it with 1:1 service-to-pod deployments"
            );
        }
        let worker = kd.clone();
        tokio::spawn(async move {
            worker.watch_loop().await;
        });
        Ok(kd)
    }

    pub fn get_health(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && self.inner.registry.health()
    }

    pub fn close(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.registry.clear();
        self.inner.registry.close();
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default().timeout(WATCH_TIMEOUT_SECS);
        if let Some(ref sel) = self.inner.label_selector {
            lp = lp.labels(sel);
        }
        lp
    }

    /// Watch until closed; stream errors retry with a short back-off
    async fn watch_loop(&self) {
        info!(
            "Watching {:?} in namespace {} (selector: {:?})",
            self.inner.variant, self.inner.namespace, self.inner.label_selector
        );
        while self.inner.running.load(Ordering::SeqCst) {
            let res = match self.inner.variant {
                K8sDiscoveryType::PodIp => self.watch_pods().await,
                K8sDiscoveryType::ServiceName => self.watch_services().await,
            };
            if let Err(e) = res {
                if self.inner.running.load(Ordering::SeqCst) {
                    warn!("K8s watcher error: {}", e);
                    tokio::time::delay_for(WATCH_BACKOFF).await;
                }
            }
        }
        debug!("K8s watcher stopped");
    }

    async fn watch_pods(&self) -> Result<()> {
        let resource = Resource::namespaced::<Pod>(&self.inner.namespace);
        let informer = Informer::new(self.inner.kube.clone(), self.list_params(), resource);
        let mut events = informer.poll().await.map_err(ErrorKind::KubeError)?.boxed();
        while let Some(event) = events.try_next().await.map_err(ErrorKind::KubeError)? {
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            match event {
                WatchEvent::Added(pod) => self.on_pod_event(WatchKind::Added, pod).await,
                WatchEvent::Modified(pod) => self.on_pod_event(WatchKind::Modified, pod).await,
                WatchEvent::Deleted(pod) => self.on_pod_event(WatchKind::Deleted, pod).await,
                WatchEvent::Error(e) => warn!("Pod watch error event: {:?}", e),
                _ => {}
            }
        }
        Ok(())
    }

    async fn watch_services(&self) -> Result<()> {
        let resource = Resource::namespaced::<Service>(&self.inner.namespace);
        let informer = Informer::new(self.inner.kube.clone(), self.list_params(), resource);
        let mut events = informer.poll().await.map_err(ErrorKind::KubeError)?.boxed();
        while let Some(event) = events.try_next().await.map_err(ErrorKind::KubeError)? {
            if !self.inner.running.load(Ordering::SeqCst) {
                break;
            }
            match event {
                WatchEvent::Added(svc) => self.on_service_event(WatchKind::Added, svc).await,
                WatchEvent::Modified(svc) => self.on_service_event(WatchKind::Modified, svc).await,
                WatchEvent::Deleted(svc) => self.on_service_event(WatchKind::Deleted, svc).await,
                WatchEvent::Error(e) => warn!("Service watch error event: {:?}", e),
                _ => {}
            }
        }
        Ok(())
    }

    async fn on_pod_event(&self, kind: WatchKind, pod: Pod) {
        let meta = match pod.metadata {
            Some(ref m) => m,
            None => return,
        };
        let name = match meta.name {
            Some(ref n) => n.clone(),
            None => return,
        };
        let pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
        let url = pod_ip.map(|ip| format!("http://{}:{}", ip, self.inner.port));
        let ready = pod_ready(&pod);

        let (model_names, model_info, sleep) = if ready && url.is_some() {
            let base = url.as_ref().unwrap();
            let (names, info) = self.fetch_models(base).await;
            let sleep = if pod_has_sleep_mode(&pod) {
                self.fetch_sleep_status(base).await
            } else {
                SleepState::Awake
            };
            (names, info, sleep)
        } else {
            (vec![], BTreeMap::new(), SleepState::Awake)
        };
        let model_label = meta
            .labels
            .as_ref()
            .and_then(|l| l.get(MODEL_LABEL))
            .cloned();

        apply_subject_update(
            &self.inner.registry,
            kind,
            SubjectFacts {
                name,
                url,
                ready,
                model_names,
                model_info,
                model_label,
                sleep,
                namespace: self.inner.namespace.clone(),
                is_pod: true,
            },
        );
    }

    async fn on_service_event(&self, kind: WatchKind, svc: Service) {
        let name = match svc.metadata.as_ref().and_then(|m| m.name.clone()) {
            Some(n) => n,
            None => return,
        };
        let url = format!("http://{}:{}", name, self.inner.port);
        let ready = match self.service_ready(&name).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Could not read endpoints for {}: {}", name, e);
                false
            }
        };

        let (model_names, model_info, sleep) = if ready {
            let (names, info) = self.fetch_models(&url).await;
            let sleep = match self.service_has_sleep_mode(&svc).await {
                Ok(true) => self.fetch_sleep_status(&url).await,
                _ => SleepState::Awake,
            };
            (names, info, sleep)
        } else {
            (vec![], BTreeMap::new(), SleepState::Awake)
        };
        let model_label = svc
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .and_then(|sel| sel.get(MODEL_LABEL))
            .cloned();

        apply_subject_update(
            &self.inner.registry,
            kind,
            SubjectFacts {
                name,
                url: Some(url),
                ready,
                model_names,
                model_info,
                model_label,
                sleep,
                namespace: self.inner.namespace.clone(),
                is_pod: false,
            },
        );
    }

    /// At least one address in the service's endpoints object
    async fn service_ready(&self, name: &str) -> Result<bool> {
        let api: Api<Endpoints> = Api::namespaced(self.inner.kube.clone(), &self.inner.namespace);
        let eps = api.get(name).await.map_err(ErrorKind::KubeError)?;
        let ready = eps
            .subsets
            .as_ref()
            .map(|subsets| {
                subsets.iter().any(|s| {
                    s.addresses
                        .as_ref()
                        .map(|a| !a.is_empty())
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);
        Ok(ready)
    }

    /// Whether the pods behind this service launch with sleep mode enabled
    async fn service_has_sleep_mode(&self, svc: &Service) -> Result<bool> {
        let selector = match svc.spec.as_ref().and_then(|s| s.selector.as_ref()) {
            Some(sel) if !sel.is_empty() => sel,
            _ => return Ok(false),
        };
        let labels = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let api: Api<Pod> = Api::namespaced(self.inner.kube.clone(), &self.inner.namespace);
        let lp = ListParams::default().labels(&labels);
        let pods = api.list(&lp).await.map_err(ErrorKind::KubeError)?;
        Ok(pods.items.first().map(pod_has_sleep_mode).unwrap_or(false))
    }

    /// `GET /v1/models` on the engine; a failure keeps it out of the registry
    async fn fetch_models(&self, base: &str) -> (Vec<String>, BTreeMap<String, ModelInfo>) {
        let url = format!("{}/v1/models", base);
        let res = match self.engine_get(&url).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to get model names from {}: {}", url, e);
                return (vec![], BTreeMap::new());
            }
        };
        let data = match res.get("data").and_then(|d| d.as_array()) {
            Some(d) => d.clone(),
            None => {
                warn!("Model listing from {} has no data array", url);
                return (vec![], BTreeMap::new());
            }
        };
        let mut names = vec![];
        let mut info = BTreeMap::new();
        for entry in &data {
            if let Some(mi) = ModelInfo::from_value(entry) {
                names.push(mi.id.clone());
                info.insert(mi.id.clone(), mi);
            }
        }
        info!("Found models on {}: {:?}", base, names);
        (names, info)
    }

    /// `GET /is_sleeping`; probe failure reports `Unknown`
    async fn fetch_sleep_status(&self, base: &str) -> SleepState {
        let url = format!("{}/is_sleeping", base);
        match self.engine_get(&url).await {
            Ok(body) => match body.get("is_sleeping").and_then(|s| s.as_bool()) {
                Some(true) => SleepState::Sleeping,
                Some(false) => SleepState::Awake,
                None => SleepState::Unknown,
            },
            Err(e) => {
                warn!("Failed to get the sleep status from {}: {}", url, e);
                SleepState::Unknown
            }
        }
    }

    async fn engine_get(&self, url: &str) -> Result<serde_json::Value> {
        let mut req = self.inner.http.get(url);
        if let Ok(key) = std::env::var("VLLM_API_KEY") {
            debug!("Using engine api key authentication");
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            return Err(ErrorKind::UpstreamProbeFailure(url.to_string(), res.status()).into());
        }
        Ok(res.json().await?)
    }

    /// Merge-patch `sleeping=true` onto the watched subject
    pub async fn add_sleep_label(&self, subject: &str) -> Result<()> {
        let body = serde_json::json!({ "metadata": { "labels": { "sleeping": "true" } } });
        self.patch_subject(subject, &body).await?;
        info!("Sleeping label added to {}", subject);
        Ok(())
    }

    pub async fn remove_sleep_label(&self, subject: &str) -> Result<()> {
        let body = serde_json::json!({ "metadata": { "labels": { "sleeping": null } } });
        self.patch_subject(subject, &body).await?;
        info!("Sleeping label removed from {}", subject);
        Ok(())
    }

    async fn patch_subject(&self, subject: &str, body: &serde_json::Value) -> Result<()> {
        let pp = PatchParams {
            patch_strategy: PatchStrategy::Merge,
            ..Default::default()
        };
        let payload = serde_json::to_vec(body)?;
        match self.inner.variant {
            K8sDiscoveryType::PodIp => {
                let api: Api<Pod> =
                    Api::namespaced(self.inner.kube.clone(), &self.inner.namespace);
                api.patch(subject, &pp, payload)
                    .await
                    .map_err(ErrorKind::KubeError)?;
            }
            K8sDiscoveryType::ServiceName => {
                let api: Api<Service> =
                    Api::namespaced(self.inner.kube.clone(), &self.inner.namespace);
                api.patch(subject, &pp, payload)
                    .await
                    .map_err(ErrorKind::KubeError)?;
            }
        }
        Ok(())
    }
}

/// All containers report ready
fn pod_ready(pod: &Pod) -> bool {
    let statuses = match pod.status.as_ref().and_then(|s| s.container_statuses.as_ref()) {
        Some(s) if !s.is_empty() => s,
        _ => return false,
    };
    statuses.iter().all(|s| s.ready)
}

/// Any container launched with the sleep-mode flag
fn pod_has_sleep_mode(pod: &Pod) -> bool {
    let spec = match pod.spec.as_ref() {
        Some(s) => s,
        None => return false,
    };
    spec.containers.iter().any(|c| {
        c.command
            .as_ref()
            .map(|args| args.iter().any(|a| a == SLEEP_MODE_FLAG))
            .unwrap_or(false)
            || c.args
                .as_ref()
                .map(|args| args.iter().any(|a| a == SLEEP_MODE_FLAG))
                .unwrap_or(false)
    })
}
