#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

#[macro_use]
extern crate log;

extern crate chrono;
extern crate url;
extern crate uuid;

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
        Float(::std::num::ParseFloatError);
        Int(::std::num::ParseIntError);
        SerdeY(serde_yaml::Error);
        SerdeJ(serde_json::Error);
        UrlParse(url::ParseError);
    }
    errors {
        InvalidRoutingLogic(logic: String) {
            description("routing logic not recognised")
            display("routing logic '{}' is not one of roundrobin, session, prefixaware, kvaware, disaggregated_prefill", &logic)
        }
        InvalidDiscoveryMode(mode: String) {
            description("service discovery mode not recognised")
            display("service discovery '{}' is not one of static, k8s", &mode)
        }
        InvalidModelType(mtype: String) {
            description("model type not recognised")
            display("model type '{}' is not one of chat, completion, rerank, score, embeddings", &mtype)
        }
        InvalidConfig(reason: String) {
            description("router config does not validate")
            display("invalid router config: {}", &reason)
        }
        InvalidAlias(entry: String) {
            description("alias entry is of incorrect form")
            display("alias '{}' is not of the form alias:model", &entry)
        }
    }
}

/// Engine endpoint metadata and model projections
pub mod endpoint;
pub use endpoint::{EndpointInfo, EngineCard, ModelCard, ModelInfo, ModelList, SleepState};

/// Router configuration records with validation
pub mod config;
pub use config::{
    parse_alias_list, parse_comma_list, ConfigFormat, DiscoveryMode, DynamicConfig,
    K8sDiscoveryType, ModelType, RouterConfig, RoutingLogic,
};
