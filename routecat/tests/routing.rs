#![warn(rust_2018_idioms)]

mod common;

use std::collections::HashMap;

use crate::common::{endpoint, fleet, static_config};
use routecat::routing::{RequestFacts, RouteDecision, Router};
use routecat::stats::RequestStats;
use routecat::{RouterConfig, RoutingLogic};

fn facts(model: &str) -> RequestFacts {
    RequestFacts {
        request_id: "r".into(),
        model: model.into(),
        session_id: None,
        prompt: String::new(),
    }
}

fn route_url(router: &Router, eligible: &[routecat::EndpointInfo], f: &RequestFacts) -> String {
    match router
        .route(eligible, &HashMap::new(), &HashMap::new(), f)
        .unwrap()
    {
        RouteDecision::Single(url) => url,
        other => panic!("expected a single engine, got {:?}", other),
    }
}

#[test]
fn nine_requests_over_three_engines_land_three_each() {
    let cfg = static_config(&["u0", "u1", "u2"], "m");
    let router = Router::from_config(&cfg);
    let eligible = fleet(&["u0", "u1", "u2"], "m");

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..9 {
        let url = route_url(&router, &eligible, &facts("m"));
        *counts.entry(url).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|c| *c == 3), "counts: {:?}", counts);
}

#[test]
fn sessions_stick_to_their_engine() {
    let cfg = RouterConfig {
        routing_logic: RoutingLogic::Session,
        session_key: Some("x-user-id".into()),
        ..static_config(&["u0", "u1"], "m")
    };
    let router = Router::from_config(&cfg);
    let eligible = fleet(&["u0", "u1"], "m");

    let with_session = |sid: &str| RequestFacts {
        session_id: Some(sid.into()),
        ..facts("m")
    };

    let abc: Vec<String> = (0..5)
        .map(|_| route_url(&router, &eligible, &with_session("abc")))
        .collect();
    let xyz: Vec<String> = (0..5)
        .map(|_| route_url(&router, &eligible, &with_session("xyz")))
        .collect();

    assert!(abc.iter().all(|u| u == &abc[0]), "abc spread: {:?}", abc);
    assert!(xyz.iter().all(|u| u == &xyz[0]), "xyz spread: {:?}", xyz);
}

#[test]
fn growing_shared_prefixes_follow_the_first_request() {
    let cfg = RouterConfig {
        routing_logic: RoutingLogic::PrefixAware,
        prefix_chunk_size: 4,
        ..static_config(&["u0", "u1", "u2"], "m")
    };
    let router = Router::from_config(&cfg);
    let eligible = fleet(&["u0", "u1", "u2"], "m");

    let with_prompt = |p: &str| RequestFacts {
        prompt: p.into(),
        ..facts("m")
    };

    let a = route_url(&router, &eligible, &with_prompt("AAAA"));
    let b = route_url(&router, &eligible, &with_prompt("AAAABBBB"));
    let c = route_url(&router, &eligible, &with_prompt("AAAABBBBCCCC"));
    assert_eq!(a, b);
    assert_eq!(b, c);
}

#[test]
fn disjoint_prefixes_spread_across_engines() {
    let cfg = RouterConfig {
        routing_logic: RoutingLogic::PrefixAware,
        prefix_chunk_size: 4,
        ..static_config(&["u0", "u1"], "m")
    };
    let router = Router::from_config(&cfg);
    let eligible = fleet(&["u0", "u1"], "m");

    let with_prompt = |p: &str| RequestFacts {
        prompt: p.into(),
        ..facts("m")
    };
    let loaded = |pairs: &[(&str, usize)]| -> HashMap<String, RequestStats> {
        pairs
            .iter()
            .map(|(u, n)| {
                (
                    u.to_string(),
                    RequestStats {
                        in_flight: *n,
                        ..Default::default()
                    },
                )
            })
            .collect()
    };

    // three prompts with nothing in common while earlier streams are live
    let a = match router
        .route(&eligible, &HashMap::new(), &loaded(&[]), &with_prompt("AAAA"))
        .unwrap()
    {
        RouteDecision::Single(u) => u,
        _ => unreachable!(),
    };
    let b = match router
        .route(
            &eligible,
            &HashMap::new(),
            &loaded(&[(&a, 1)]),
            &with_prompt("DDDD"),
        )
        .unwrap()
    {
        RouteDecision::Single(u) => u,
        _ => unreachable!(),
    };
    let c = match router
        .route(
            &eligible,
            &HashMap::new(),
            &loaded(&[(&a, 1), (&b, 1)]),
            &with_prompt("GGGG"),
        )
        .unwrap()
    {
        RouteDecision::Single(u) => u,
        _ => unreachable!(),
    };

    let mut distinct = vec![a, b, c];
    distinct.sort();
    distinct.dedup();
    assert!(distinct.len() >= 2, "selections: {:?}", distinct);
}

#[test]
fn kvaware_repeats_route_to_the_warm_engine() {
    let cfg = RouterConfig {
        routing_logic: RoutingLogic::KvAware,
        prefix_chunk_size: 4,
        ..static_config(&["u0", "u1"], "m")
    };
    let router = Router::from_config(&cfg);
    let eligible = fleet(&["u0", "u1"], "m");

    let with_prompt = |p: &str| RequestFacts {
        prompt: p.into(),
        ..facts("m")
    };
    let first = route_url(&router, &eligible, &with_prompt("AAAABBBBCCCC"));
    let second = route_url(&router, &eligible, &with_prompt("AAAABBBBDDDD"));
    assert_eq!(first, second);
}

#[test]
fn disaggregated_pairs_prefill_and_decode() {
    let cfg = RouterConfig {
        routing_logic: RoutingLogic::DisaggregatedPrefill,
        prefill_model_labels: vec!["prefill".into()],
        decode_model_labels: vec!["decode".into()],
        ..static_config(&["p0", "d0"], "m")
    };
    let router = Router::from_config(&cfg);
    let eligible = vec![
        endpoint("p0", &["m"], Some("prefill")),
        endpoint("p1", &["m"], Some("prefill")),
        endpoint("d0", &["m"], Some("decode")),
    ];

    match router
        .route(&eligible, &HashMap::new(), &HashMap::new(), &facts("m"))
        .unwrap()
    {
        RouteDecision::Pair { prefill, decode } => {
            assert!(prefill == "p0" || prefill == "p1");
            assert_eq!(decode, "d0");
        }
        other => panic!("expected a pair, got {:?}", other),
    }
}

#[test]
fn stable_registry_keeps_roundrobin_fair_at_scale() {
    let cfg = static_config(&["u0"], "m");
    let router = Router::from_config(&RouterConfig {
        routing_logic: RoutingLogic::RoundRobin,
        ..cfg
    });
    for n in &[1usize, 4, 7] {
        let urls: Vec<String> = (0..*n).map(|i| format!("e{:02}", i)).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let eligible = fleet(&refs, "m");
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..(n * 13 + 5) {
            let url = route_url(&router, &eligible, &facts("m"));
            *counts.entry(url).or_default() += 1;
        }
        let max = counts.values().max().unwrap();
        let min = counts.values().min().unwrap();
        assert!(max - min <= 1, "n={} counts={:?}", n, counts);
    }
}
