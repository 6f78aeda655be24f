#![allow(dead_code)]

use std::collections::BTreeMap;

use uuid::Uuid;

use routecat::{EndpointInfo, ModelInfo, RouterConfig, SleepState};

pub fn endpoint(url: &str, models: &[&str], label: Option<&str>) -> EndpointInfo {
    let model_info: BTreeMap<String, ModelInfo> = models
        .iter()
        .map(|m| (m.to_string(), ModelInfo::base(m)))
        .collect();
    EndpointInfo {
        id: Uuid::new_v5(&Uuid::NAMESPACE_DNS, url.as_bytes()),
        url: url.into(),
        model_names: models.iter().map(|m| m.to_string()).collect(),
        model_info,
        model_label: label.map(String::from),
        added_timestamp: 0,
        sleep: SleepState::Awake,
        pod_name: None,
        service_name: None,
        namespace: None,
    }
}

pub fn fleet(urls: &[&str], model: &str) -> Vec<EndpointInfo> {
    urls.iter().map(|u| endpoint(u, &[model], None)).collect()
}

pub fn static_config(urls: &[&str], model: &str) -> RouterConfig {
    RouterConfig {
        static_backends: urls.iter().map(|u| u.to_string()).collect(),
        static_models: urls.iter().map(|_| model.to_string()).collect(),
        ..Default::default()
    }
}
