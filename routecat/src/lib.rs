#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;
error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {}
    foreign_links {
        Fmt(::std::fmt::Error);
        Io(::std::io::Error) #[cfg(unix)];
        Int(::std::num::ParseIntError);
        Defs(routecat_definitions::Error);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        Reqe(reqwest::Error);
        Time(::std::time::SystemTimeError);
    }
    errors {
        ModelNotAvailable(model: String) {
            description("no engine serves the requested model")
            display("no engine serves model {}", &model)
        }
        NoEnginesAvailable {
            description("routing policy found no candidate engines")
            display("no engines available to route this request")
        }
        UpstreamConnectFailure(url: String) {
            description("could not reach the upstream engine")
            display("failed to connect to engine at {}", &url)
        }
        UpstreamProbeFailure(url: String, status: reqwest::StatusCode) {
            description("engine probe returned an unexpected status")
            display("probe of {} failed with status {}", &url, &status)
        }
        KubeError(e: kube::Error) {
            description("kube api interaction failed")
            display("kube api error: {}", e)
        }
        EngineNotFound(target: String) {
            description("no live engine matches the requested target")
            display("no engine matches target {}", &target)
        }
        MetricsUnparseable(url: String) {
            description("engine metrics exposition could not be parsed")
            display("could not parse metrics from {}", &url)
        }
    }
}

pub use routecat_definitions::{
    parse_alias_list, parse_comma_list, ConfigFormat, DiscoveryMode, DynamicConfig, EndpointInfo,
    EngineCard, K8sDiscoveryType, ModelCard, ModelInfo, ModelList, ModelType, RouterConfig,
    RoutingLogic, SleepState,
};

/// Thread-safe inventory of live engines
pub mod registry;
pub use registry::{EndpointRegistry, Quarantine};

/// Service discovery backends (static list and kubernetes watches)
pub mod discovery;
pub use discovery::ServiceDiscovery;

/// Per-engine request statistics (qps / in-flight / ttft / itl)
pub mod stats;
pub use stats::{RequestStats, RequestStatsMonitor};

/// Periodic engine /metrics scraping
pub mod scraper;
pub use scraper::{EngineStats, EngineStatsScraper};

/// Routing strategies
pub mod routing;
pub use routing::{RequestFacts, RouteDecision, Router};

/// The request dispatcher (proxy path)
pub mod proxy;

/// Public HTTP surface
pub mod api;

/// Dynamic config file watcher
pub mod dynamic;

/// Shared application state for actix
pub mod state;
pub use state::AppState;
