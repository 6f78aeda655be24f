#![warn(rust_2018_idioms)]

mod common;

use std::sync::{Arc, RwLock};

use actix_web::{test, App};
use maplit::btreemap;
use mockito::{mock, Matcher};

use crate::common::static_config;
use routecat::api;
use routecat::discovery::ServiceDiscovery;
use routecat::registry::{EndpointRegistry, Quarantine};
use routecat::routing::Router;
use routecat::scraper::EngineStatsScraper;
use routecat::stats::RequestStatsMonitor;
use routecat::{AppState, RouterConfig, SleepState};

async fn make_state(cfg: RouterConfig) -> AppState {
    let client = reqwest::Client::new();
    let registry = EndpointRegistry::new();
    let quarantine = Quarantine::new();
    let request_stats = RequestStatsMonitor::new(cfg.stats_window);
    // hour-long scrape period keeps the background cycle out of the way
    let scraper = EngineStatsScraper::start(
        registry.clone(),
        client.clone(),
        quarantine.clone(),
        request_stats.clone(),
        3600,
    );
    let discovery = Arc::new(RwLock::new(
        ServiceDiscovery::initialize(&cfg, registry.clone(), client.clone())
            .await
            .unwrap(),
    ));
    let router = Arc::new(RwLock::new(Router::from_config(&cfg)));
    AppState {
        config: cfg,
        registry,
        discovery,
        router,
        request_stats,
        scraper,
        quarantine,
        client,
        dynamic: None,
    }
}

#[actix_rt::test]
async fn completions_round_trip_with_header_passthrough() {
    let mocked = mock("POST", "/v1/completions")
        .match_header("authorization", "Bearer abc123")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"cmpl-1","choices":[]}"#)
        .expect(1)
        .create();

    let state = make_state(static_config(&[&mockito::server_url()], "m")).await;
    let mut app =
        test::init_service(App::new().data(state.clone()).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/v1/completions")
        .header("authorization", "Bearer abc123")
        .set_payload(r#"{"model":"m","prompt":"hi"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    assert!(String::from_utf8_lossy(&body).contains("cmpl-1"));
    mocked.assert();

    // stats balance: the dispatch fully released its slot
    let snap = state.request_stats.snapshot();
    assert_eq!(snap[&mockito::server_url()].in_flight, 0);
    assert!(snap[&mockito::server_url()].qps > 0.0);
}

#[actix_rt::test]
async fn upstream_errors_pass_through_unchanged() {
    let mocked = mock("POST", "/v1/embeddings")
        .with_status(418)
        .with_body("teapot says no")
        .expect(1)
        .create();

    let state = make_state(static_config(&[&mockito::server_url()], "m")).await;
    let mut app = test::init_service(App::new().data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/v1/embeddings")
        .set_payload(r#"{"model":"m","input":"x"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status().as_u16(), 418);
    let body = test::read_body(resp).await;
    assert_eq!(body, "teapot says no".as_bytes());
    mocked.assert();
}

#[actix_rt::test]
async fn unknown_model_is_a_503_with_a_named_model() {
    let state = make_state(static_config(&["http://e0:8000"], "m1")).await;
    let mut app = test::init_service(App::new().data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/v1/completions")
        .set_payload(r#"{"model":"m2","prompt":"hi"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status().as_u16(), 503);
    let body = test::read_body(resp).await;
    assert!(String::from_utf8_lossy(&body).contains("no engine serves model m2"));
}

#[actix_rt::test]
async fn refused_connections_become_502_and_quarantine() {
    // nothing listens on the discard port
    let dead = "http://127.0.0.1:9";
    let state = make_state(static_config(&[dead], "m")).await;
    let mut app =
        test::init_service(App::new().data(state.clone()).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/v1/completions")
        .set_payload(r#"{"model":"m","prompt":"hi"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status().as_u16(), 502);
    assert!(state.quarantine.contains(dead));
    assert_eq!(state.request_stats.snapshot()[dead].in_flight, 0);

    // until a probe cycle clears the strike, the engine is not eligible
    let req = test::TestRequest::post()
        .uri("/v1/completions")
        .set_payload(r#"{"model":"m","prompt":"hi"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status().as_u16(), 503);
}

#[actix_rt::test]
async fn aliases_rewrite_the_forwarded_model() {
    let mocked = mock("POST", "/tokenize")
        .match_body(Matcher::Json(serde_json::json!({
            "model": "llama-70b", "prompt": "x"
        })))
        .with_status(200)
        .with_body(r#"{"tokens":[1]}"#)
        .expect(1)
        .create();

    let mut cfg = static_config(&[&mockito::server_url()], "llama-70b");
    cfg.static_aliases = btreemap! {
        "gpt4".to_string() => "llama-70b".to_string()
    };
    let state = make_state(cfg).await;
    let mut app = test::init_service(App::new().data(state).configure(api::configure)).await;

    let req = test::TestRequest::post()
        .uri("/tokenize")
        .set_payload(r#"{"model":"gpt4","prompt":"x"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status(), 200);
    mocked.assert();
}

#[actix_rt::test]
async fn model_listing_deduplicates() {
    let state = make_state(static_config(&["http://e0:8000", "http://e1:8000"], "m")).await;
    let mut app = test::init_service(App::new().data(state).configure(api::configure)).await;

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    let listing: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(listing["data"].as_array().unwrap().len(), 1);
    assert_eq!(listing["data"][0]["id"], "m");
}

#[actix_rt::test]
async fn engines_and_version_and_health() {
    let state = make_state(static_config(&["http://e0:8000", "http://e1:8000"], "m")).await;
    let mut app = test::init_service(App::new().data(state).configure(api::configure)).await;

    let resp = test::call_service(
        &mut app,
        test::TestRequest::get().uri("/engines").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let cards: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(cards.as_array().unwrap().len(), 2);

    let resp = test::call_service(
        &mut app,
        test::TestRequest::get().uri("/version").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);

    let resp = test::call_service(
        &mut app,
        test::TestRequest::get().uri("/health").to_request(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let health: serde_json::Value =
        serde_json::from_slice(&test::read_body(resp).await).unwrap();
    assert_eq!(health["status"], "healthy");
}

#[actix_rt::test]
async fn is_sleeping_refreshes_the_registry() {
    let mocked = mock("GET", "/is_sleeping")
        .with_status(200)
        .with_body(r#"{"is_sleeping":true}"#)
        .expect(1)
        .create();

    let state = make_state(static_config(&[&mockito::server_url()], "m")).await;
    let mut app =
        test::init_service(App::new().data(state.clone()).configure(api::configure)).await;

    let uri = format!(
        "/is_sleeping?url={}",
        url::form_urlencoded::byte_serialize(mockito::server_url().as_bytes()).collect::<String>()
    );
    let resp = test::call_service(&mut app, test::TestRequest::get().uri(&uri).to_request()).await;
    assert_eq!(resp.status(), 200);
    mocked.assert();

    let engine = state.registry.find_by_url(&mockito::server_url()).unwrap();
    assert_eq!(engine.sleep, SleepState::Sleeping);

    // a sleeping engine is no longer eligible for dispatch
    let req = test::TestRequest::post()
        .uri("/v1/completions")
        .set_payload(r#"{"model":"m","prompt":"hi"}"#)
        .to_request();
    let resp = test::call_service(&mut app, req).await;
    assert_eq!(resp.status().as_u16(), 503);
}
