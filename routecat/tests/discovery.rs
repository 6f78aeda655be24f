#![warn(rust_2018_idioms)]

mod common;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use maplit::btreemap;

use crate::common::static_config;
use routecat::discovery::{
    apply_subject_update, reconfigure_service_discovery, ServiceDiscovery, SubjectFacts, WatchKind,
};
use routecat::registry::EndpointRegistry;
use routecat::{ModelInfo, SleepState};

fn pod_facts(name: &str, ready: bool, models: &[&str]) -> SubjectFacts {
    let model_info: BTreeMap<String, ModelInfo> = models
        .iter()
        .map(|m| (m.to_string(), ModelInfo::base(m)))
        .collect();
    SubjectFacts {
        name: name.into(),
        url: Some("http://10.1.2.3:8000".into()),
        ready,
        model_names: models.iter().map(|m| m.to_string()).collect(),
        model_info,
        model_label: Some("default".into()),
        sleep: SleepState::Awake,
        namespace: "default".into(),
        is_pod: true,
    }
}

#[test]
fn pod_lifecycle_added_modified_deleted() {
    let registry = EndpointRegistry::new();

    // ADDED while not ready: no engine
    apply_subject_update(&registry, WatchKind::Added, pod_facts("engine-0", false, &[]));
    assert_eq!(registry.len(), 0);

    // MODIFIED to ready with a model listing: engine present
    apply_subject_update(
        &registry,
        WatchKind::Modified,
        pod_facts("engine-0", true, &["m"]),
    );
    assert_eq!(registry.len(), 1);
    let engines = registry.list();
    assert!(engines[0].has_model("m"));
    assert_eq!(engines[0].namespace.as_deref(), Some("default"));

    // DELETED: engine gone
    apply_subject_update(
        &registry,
        WatchKind::Deleted,
        pod_facts("engine-0", true, &["m"]),
    );
    assert_eq!(registry.len(), 0);
}

#[test]
fn modified_back_to_not_ready_evicts() {
    let registry = EndpointRegistry::new();
    apply_subject_update(&registry, WatchKind::Added, pod_facts("engine-0", true, &["m"]));
    assert_eq!(registry.len(), 1);
    apply_subject_update(
        &registry,
        WatchKind::Modified,
        pod_facts("engine-0", false, &[]),
    );
    assert_eq!(registry.len(), 0);
}

#[tokio::test]
async fn static_discovery_seeds_and_resolves_aliases() {
    let registry = EndpointRegistry::new();
    let mut cfg = static_config(&["http://e0:8000", "http://e1:8000"], "llama-70b");
    cfg.static_aliases = btreemap! {
        "gpt4".to_string() => "llama-70b".to_string()
    };
    let sd = ServiceDiscovery::initialize(&cfg, registry.clone(), reqwest::Client::new())
        .await
        .unwrap();

    assert_eq!(registry.len(), 2);
    assert!(sd.get_health());
    assert_eq!(sd.resolve_alias("gpt4"), "llama-70b");
    assert_eq!(sd.resolve_alias("llama-70b"), "llama-70b");
}

#[tokio::test]
async fn reconfigure_swaps_the_backend_set() {
    let registry = EndpointRegistry::new();
    let client = reqwest::Client::new();
    let cfg_a = static_config(&["http://old:8000"], "m");
    let slot = Arc::new(RwLock::new(
        ServiceDiscovery::initialize(&cfg_a, registry.clone(), client.clone())
            .await
            .unwrap(),
    ));
    assert_eq!(registry.list()[0].url, "http://old:8000");

    let cfg_b = static_config(&["http://new:8000", "http://newer:8000"], "m");
    reconfigure_service_discovery(&slot, &cfg_b, registry.clone(), client)
        .await
        .unwrap();

    let urls: Vec<String> = registry.list().into_iter().map(|e| e.url).collect();
    assert_eq!(urls.len(), 2);
    assert!(urls.contains(&"http://new:8000".to_string()));
    assert!(!urls.contains(&"http://old:8000".to_string()));
}

#[tokio::test]
async fn closing_discovery_clears_health_and_registry() {
    let registry = EndpointRegistry::new();
    let cfg = static_config(&["http://e0:8000"], "m");
    let sd = ServiceDiscovery::initialize(&cfg, registry.clone(), reqwest::Client::new())
        .await
        .unwrap();
    assert!(sd.get_health());
    sd.close();
    assert!(!sd.get_health());
    assert_eq!(registry.len(), 0);
}
