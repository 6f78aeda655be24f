use std::collections::BTreeMap;
use std::str::FromStr;

use super::{ErrorKind, Result};

/// Routing policy selector
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoutingLogic {
    #[serde(rename = "roundrobin")]
    RoundRobin,
    Session,
    #[serde(rename = "prefixaware")]
    PrefixAware,
    #[serde(rename = "kvaware")]
    KvAware,
    DisaggregatedPrefill,
}

impl FromStr for RoutingLogic {
    type Err = super::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "roundrobin" => Ok(RoutingLogic::RoundRobin),
            "session" => Ok(RoutingLogic::Session),
            "prefixaware" => Ok(RoutingLogic::PrefixAware),
            "kvaware" => Ok(RoutingLogic::KvAware),
            "disaggregated_prefill" => Ok(RoutingLogic::DisaggregatedPrefill),
            _ => Err(ErrorKind::InvalidRoutingLogic(s.into()).into()),
        }
    }
}

/// Where the engine inventory comes from
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    Static,
    K8s,
}

impl FromStr for DiscoveryMode {
    type Err = super::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "static" => Ok(DiscoveryMode::Static),
            "k8s" => Ok(DiscoveryMode::K8s),
            _ => Err(ErrorKind::InvalidDiscoveryMode(s.into()).into()),
        }
    }
}

/// Kubernetes watch subject
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub enum K8sDiscoveryType {
    #[serde(rename = "pod-ip")]
    PodIp,
    #[serde(rename = "service-name")]
    ServiceName,
}

impl FromStr for K8sDiscoveryType {
    type Err = super::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "pod-ip" => Ok(K8sDiscoveryType::PodIp),
            "service-name" => Ok(K8sDiscoveryType::ServiceName),
            other => Err(ErrorKind::InvalidDiscoveryMode(other.into()).into()),
        }
    }
}

/// Protocol family of a statically configured engine
///
/// Determines the decoy request used by the static health probe.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Chat,
    Completion,
    Rerank,
    Score,
    Embeddings,
}

impl FromStr for ModelType {
    type Err = super::Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(ModelType::Chat),
            "completion" => Ok(ModelType::Completion),
            "rerank" => Ok(ModelType::Rerank),
            "score" => Ok(ModelType::Score),
            "embeddings" => Ok(ModelType::Embeddings),
            _ => Err(ErrorKind::InvalidModelType(s.into()).into()),
        }
    }
}

impl ModelType {
    /// Path of the one-shot liveness request for this engine type
    pub fn probe_path(&self) -> &'static str {
        match self {
            ModelType::Chat | ModelType::Completion => "/v1/completions",
            ModelType::Embeddings => "/v1/embeddings",
            ModelType::Rerank => "/v1/rerank",
            ModelType::Score => "/v1/score",
        }
    }

    /// Minimal request body that exercises the engine without real work
    pub fn probe_body(&self, model: &str) -> serde_json::Value {
        match self {
            ModelType::Chat | ModelType::Completion => serde_json::json!({
                "model": model, "prompt": "Hi", "max_tokens": 1
            }),
            ModelType::Embeddings => serde_json::json!({
                "model": model, "input": "Hi"
            }),
            ModelType::Rerank => serde_json::json!({
                "model": model, "query": "Hi", "documents": ["Hi"]
            }),
            ModelType::Score => serde_json::json!({
                "model": model, "text_1": "Hi", "text_2": "hello"
            }),
        }
    }
}

/// Dynamic config file format
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Yaml,
    Json,
}

/// Complete runtime configuration for the router process
///
/// Assembled from CLI flags in main, then `verify()`d before anything starts.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RouterConfig {
    pub host: String,
    pub port: u16,

    pub routing_logic: RoutingLogic,
    pub service_discovery: DiscoveryMode,

    /// Parallel lists for static discovery; one engine per (url, model) pair
    #[serde(default)]
    pub static_backends: Vec<String>,
    #[serde(default)]
    pub static_models: Vec<String>,
    /// Optional per-backend classification labels (parallel to backends)
    #[serde(default)]
    pub static_model_labels: Vec<String>,
    /// Required when health checks are enabled (parallel to backends)
    #[serde(default)]
    pub static_model_types: Vec<ModelType>,
    /// alias -> model rewrites applied before routing
    #[serde(default)]
    pub static_aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub static_backend_health_checks: bool,

    #[serde(default = "default_namespace")]
    pub k8s_namespace: String,
    #[serde(default = "default_engine_port")]
    pub k8s_port: u16,
    #[serde(default)]
    pub k8s_label_selector: Option<String>,
    #[serde(default = "default_k8s_type")]
    pub k8s_service_discovery_type: K8sDiscoveryType,

    /// Header carrying the session id for session-affinity routing
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub prefix_chunk_size: usize,

    #[serde(default)]
    pub prefill_model_labels: Vec<String>,
    #[serde(default)]
    pub decode_model_labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_config_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_config_format: Option<ConfigFormat>,

    /// Optional per-request deadline in seconds (none by default)
    #[serde(default)]
    pub request_timeout: Option<u64>,
    /// QPS sliding window in seconds
    #[serde(default = "default_stats_window")]
    pub stats_window: u64,
    /// Engine /metrics scrape period in seconds
    #[serde(default = "default_scrape_interval")]
    pub scrape_interval: u64,
}

fn default_namespace() -> String {
    "default".into()
}
fn default_engine_port() -> u16 {
    8000
}
fn default_k8s_type() -> K8sDiscoveryType {
    K8sDiscoveryType::PodIp
}
fn default_chunk_size() -> usize {
    128
}
fn default_stats_window() -> u64 {
    60
}
fn default_scrape_interval() -> u64 {
    30
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            host: "0.0.0.0".into(),
            port: 8000,
            routing_logic: RoutingLogic::RoundRobin,
            service_discovery: DiscoveryMode::Static,
            static_backends: vec![],
            static_models: vec![],
            static_model_labels: vec![],
            static_model_types: vec![],
            static_aliases: BTreeMap::new(),
            static_backend_health_checks: false,
            k8s_namespace: default_namespace(),
            k8s_port: default_engine_port(),
            k8s_label_selector: None,
            k8s_service_discovery_type: default_k8s_type(),
            session_key: None,
            prefix_chunk_size: default_chunk_size(),
            prefill_model_labels: vec![],
            decode_model_labels: vec![],
            dynamic_config_file: None,
            dynamic_config_format: None,
            request_timeout: None,
            stats_window: default_stats_window(),
            scrape_interval: default_scrape_interval(),
        }
    }
}

impl RouterConfig {
    pub fn verify(&self) -> Result<()> {
        if self.service_discovery == DiscoveryMode::Static {
            if self.static_backends.is_empty() {
                bail!("static service discovery needs at least one backend url");
            }
            if self.static_backends.len() != self.static_models.len() {
                bail!(
                    "static backends and models must have the same length ({} vs {})",
                    self.static_backends.len(),
                    self.static_models.len()
                );
            }
            if !self.static_model_labels.is_empty()
                && self.static_model_labels.len() != self.static_backends.len()
            {
                bail!("static model labels must match the backend list length");
            }
            if self.static_backend_health_checks {
                if self.static_model_types.len() != self.static_backends.len() {
                    bail!("static health checks need a model type per backend");
                }
            }
            for url in &self.static_backends {
                if url.ends_with('/') {
                    bail!("backend url {} must not end with a slash", url);
                }
                url::Url::parse(url)?;
            }
        }
        if self.routing_logic == RoutingLogic::Session && self.session_key.is_none() {
            bail!("session routing needs --session-key");
        }
        if self.routing_logic == RoutingLogic::DisaggregatedPrefill {
            if self.prefill_model_labels.is_empty() || self.decode_model_labels.is_empty() {
                bail!("disaggregated_prefill routing needs both prefill and decode model labels");
            }
            if self.service_discovery == DiscoveryMode::Static && self.static_model_labels.is_empty()
            {
                warn!("disaggregated routing over static discovery needs labelled backends");
            }
        }
        if self.prefix_chunk_size == 0 {
            bail!("prefix chunk size must be positive");
        }
        if self.stats_window == 0 {
            bail!("stats window must be positive");
        }
        if self.dynamic_config_file.is_some() && self.dynamic_config_format.is_none() {
            bail!("dynamic config file needs a format (yaml or json)");
        }
        Ok(())
    }

    /// Resolve an inbound model name through the alias table
    pub fn resolve_alias<'a>(&'a self, model: &'a str) -> &'a str {
        self.static_aliases
            .get(model)
            .map(|s| s.as_str())
            .unwrap_or(model)
    }
}

/// Split a comma-joined CLI list, dropping empty segments
pub fn parse_comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Parse `alias:model` pairs from a comma-joined list
pub fn parse_alias_list(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut aliases = BTreeMap::new();
    for entry in parse_comma_list(raw) {
        let mut parts = entry.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(alias), Some(model)) if !alias.is_empty() && !model.is_empty() => {
                aliases.insert(alias.trim().to_string(), model.trim().to_string());
            }
            _ => return Err(ErrorKind::InvalidAlias(entry).into()),
        }
    }
    Ok(aliases)
}

/// Subset of the config that may be hot-swapped from the watched file
///
/// Absent keys leave the corresponding running setting untouched.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct DynamicConfig {
    #[serde(default)]
    pub routing_logic: Option<RoutingLogic>,
    #[serde(default)]
    pub service_discovery: Option<DiscoveryMode>,
    #[serde(default)]
    pub static_backends: Option<String>,
    #[serde(default)]
    pub static_models: Option<String>,
    #[serde(default)]
    pub static_model_labels: Option<String>,
    #[serde(default)]
    pub static_aliases: Option<String>,
    #[serde(default)]
    pub k8s_namespace: Option<String>,
    #[serde(default)]
    pub k8s_port: Option<u16>,
    #[serde(default)]
    pub k8s_label_selector: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub prefix_chunk_size: Option<usize>,
}

impl DynamicConfig {
    pub fn parse(raw: &str, format: ConfigFormat) -> Result<Self> {
        let dc = match format {
            ConfigFormat::Yaml => serde_yaml::from_str(raw)?,
            ConfigFormat::Json => serde_json::from_str(raw)?,
        };
        Ok(dc)
    }

    /// Overlay onto a running config, then re-verify the merged result
    pub fn apply_to(&self, base: &RouterConfig) -> Result<RouterConfig> {
        let mut cfg = base.clone();
        if let Some(logic) = self.routing_logic {
            cfg.routing_logic = logic;
        }
        if let Some(mode) = self.service_discovery {
            cfg.service_discovery = mode;
        }
        if let Some(ref raw) = self.static_backends {
            cfg.static_backends = parse_comma_list(raw);
        }
        if let Some(ref raw) = self.static_models {
            cfg.static_models = parse_comma_list(raw);
        }
        if let Some(ref raw) = self.static_model_labels {
            cfg.static_model_labels = parse_comma_list(raw);
        }
        if let Some(ref raw) = self.static_aliases {
            cfg.static_aliases = parse_alias_list(raw)?;
        }
        if let Some(ref ns) = self.k8s_namespace {
            cfg.k8s_namespace = ns.clone();
        }
        if let Some(port) = self.k8s_port {
            cfg.k8s_port = port;
        }
        if let Some(ref sel) = self.k8s_label_selector {
            cfg.k8s_label_selector = Some(sel.clone());
        }
        if let Some(ref key) = self.session_key {
            cfg.session_key = Some(key.clone());
        }
        if let Some(size) = self.prefix_chunk_size {
            cfg.prefix_chunk_size = size;
        }
        cfg.verify()?;
        Ok(cfg)
    }
}
