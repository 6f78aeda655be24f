use std::collections::BTreeMap;

use chrono::Utc;
use uuid::Uuid;

/// Metadata for a single model as reported by an engine
///
/// Mirrors one entry of an OpenAI-compatible `GET /v1/models` response.
/// A model with a `parent` is an adapter served on top of that base model.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default = "default_model_object")]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default = "default_model_owner")]
    pub owned_by: String,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub is_adapter: bool,
}

fn default_model_object() -> String {
    "model".into()
}
fn default_model_owner() -> String {
    "vllm".into()
}

impl ModelInfo {
    /// Plain base model entry used when an engine cannot be queried for details
    pub fn base(id: &str) -> Self {
        ModelInfo {
            id: id.into(),
            object: "model".into(),
            created: Utc::now().timestamp(),
            owned_by: "vllm".into(),
            root: None,
            parent: None,
            is_adapter: false,
        }
    }

    /// Parse a single `/v1/models` data entry, tolerating missing fields
    pub fn from_value(data: &serde_json::Value) -> Option<Self> {
        let id = data.get("id")?.as_str()?.to_string();
        let parent = data
            .get("parent")
            .and_then(|p| p.as_str())
            .map(String::from);
        Some(ModelInfo {
            id,
            object: data
                .get("object")
                .and_then(|o| o.as_str())
                .unwrap_or("model")
                .into(),
            created: data
                .get("created")
                .and_then(|c| c.as_i64())
                .unwrap_or_else(|| Utc::now().timestamp()),
            owned_by: data
                .get("owned_by")
                .and_then(|o| o.as_str())
                .unwrap_or("vllm")
                .into(),
            root: data.get("root").and_then(|r| r.as_str()).map(String::from),
            is_adapter: parent.is_some(),
            parent,
        })
    }
}

/// Engine sleep state
///
/// `Unknown` is only reported for engines whose launch flags enable sleep
/// mode but whose `/is_sleeping` probe failed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SleepState {
    Awake,
    Sleeping,
    Unknown,
}

impl Default for SleepState {
    fn default() -> Self {
        SleepState::Awake
    }
}

/// A live serving engine as tracked by the registry
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EndpointInfo {
    /// Stable engine identifier (v5 uuid from the k8s name, v4 for static entries)
    pub id: Uuid,
    /// Base URL without a trailing slash
    pub url: String,
    /// All model ids served by this engine, adapters included
    pub model_names: Vec<String>,
    /// Detailed per-model metadata keyed by model id
    #[serde(default)]
    pub model_info: BTreeMap<String, ModelInfo>,
    /// Operator-assigned classification tag, e.g. "prefill" or "decode"
    #[serde(default)]
    pub model_label: Option<String>,
    /// Unix seconds at first observation
    pub added_timestamp: i64,
    #[serde(default)]
    pub sleep: SleepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl EndpointInfo {
    pub fn has_model(&self, model_id: &str) -> bool {
        self.model_names.iter().any(|m| m == model_id)
    }

    /// Models without a parent
    pub fn base_models(&self) -> Vec<&str> {
        self.model_info
            .values()
            .filter(|i| i.parent.is_none())
            .map(|i| i.id.as_str())
            .collect()
    }

    /// Models with a parent
    pub fn adapters(&self) -> Vec<&str> {
        self.model_info
            .values()
            .filter(|i| i.parent.is_some())
            .map(|i| i.id.as_str())
            .collect()
    }

    /// Adapters whose parent is `base_model`
    pub fn adapters_for(&self, base_model: &str) -> Vec<&str> {
        self.model_info
            .values()
            .filter(|i| i.parent.as_deref() == Some(base_model))
            .map(|i| i.id.as_str())
            .collect()
    }

    pub fn model_info(&self, model_id: &str) -> Option<&ModelInfo> {
        self.model_info.get(model_id)
    }

    /// The k8s subject name this engine was discovered from, if any
    pub fn subject_name(&self) -> Option<&str> {
        self.pod_name
            .as_deref()
            .or_else(|| self.service_name.as_deref())
    }
}

/// One entry of the `/v1/models` listing
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelCard {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// OpenAI-shaped `/v1/models` response body
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelCard>,
}

impl ModelList {
    /// Project a fleet snapshot into model cards, each model id at most once
    pub fn from_endpoints(endpoints: &[EndpointInfo]) -> Self {
        let mut seen = std::collections::BTreeSet::new();
        let mut data = vec![];
        for ep in endpoints {
            for (model_id, info) in &ep.model_info {
                if !seen.insert(model_id.clone()) {
                    continue;
                }
                data.push(ModelCard {
                    id: model_id.clone(),
                    object: "model".into(),
                    created: info.created,
                    owned_by: info.owned_by.clone(),
                    parent: info.parent.clone(),
                });
            }
        }
        ModelList {
            object: "list".into(),
            data,
        }
    }
}

/// One entry of the `/engines` listing
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EngineCard {
    pub engine_id: Uuid,
    pub serving_models: Vec<String>,
    pub created: i64,
}

impl EngineCard {
    /// Project a fleet snapshot into engine cards, each engine id at most once
    pub fn from_endpoints(endpoints: &[EndpointInfo]) -> Vec<Self> {
        let mut seen = std::collections::BTreeSet::new();
        let mut cards = vec![];
        for ep in endpoints {
            if !seen.insert(ep.id) {
                continue;
            }
            cards.push(EngineCard {
                engine_id: ep.id,
                serving_models: ep.model_names.clone(),
                created: ep.added_timestamp,
            });
        }
        cards
    }
}
