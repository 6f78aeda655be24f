#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, RwLock};

use actix_web::{middleware, App as WebApp, HttpServer};
use clap::{App, AppSettings, Arg, ArgMatches};

use routecat::discovery::ServiceDiscovery;
use routecat::dynamic::DynamicConfigWatcher;
use routecat::registry::{EndpointRegistry, Quarantine};
use routecat::routing::Router;
use routecat::scraper::EngineStatsScraper;
use routecat::stats::RequestStatsMonitor;
use routecat::{
    api, parse_alias_list, parse_comma_list, AppState, ConfigFormat, Error, ModelType, Result,
    RouterConfig,
};

fn print_error_debug(e: &Error) {
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

fn cli() -> App<'static, 'static> {
    App::new("routecat")
        .version(crate_version!())
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .about("Route right meow")
        .arg(Arg::with_name("host")
            .long("host")
            .takes_value(true)
            .default_value("0.0.0.0")
            .help("Address to bind the router on"))
        .arg(Arg::with_name("port")
            .long("port")
            .takes_value(true)
            .default_value("8000")
            .help("Port to bind the router on"))
        .arg(Arg::with_name("routing-logic")
            .long("routing-logic")
            .takes_value(true)
            .default_value("roundrobin")
            .possible_values(&["roundrobin", "session", "prefixaware", "kvaware", "disaggregated_prefill"])
            .help("Routing policy"))
        .arg(Arg::with_name("service-discovery")
            .long("service-discovery")
            .takes_value(true)
            .default_value("static")
            .possible_values(&["static", "k8s"])
            .help("Engine inventory source"))
        .arg(Arg::with_name("static-backends")
            .long("static-backends")
            .takes_value(true)
            .help("Comma-joined engine base urls"))
        .arg(Arg::with_name("static-models")
            .long("static-models")
            .takes_value(true)
            .help("Comma-joined model per backend"))
        .arg(Arg::with_name("static-model-labels")
            .long("static-model-labels")
            .takes_value(true)
            .help("Comma-joined label per backend (e.g. prefill,decode)"))
        .arg(Arg::with_name("static-model-types")
            .long("static-model-types")
            .takes_value(true)
            .help("Comma-joined model type per backend (chat|completion|rerank|score|embeddings)"))
        .arg(Arg::with_name("static-aliases")
            .long("static-aliases")
            .takes_value(true)
            .help("Comma-joined alias:model rewrites"))
        .arg(Arg::with_name("static-backend-health-checks")
            .long("static-backend-health-checks")
            .help("Probe static backends every minute and hide the unhealthy"))
        .arg(Arg::with_name("k8s-namespace")
            .long("k8s-namespace")
            .takes_value(true)
            .default_value("default")
            .help("Namespace the engine pods or services live in"))
        .arg(Arg::with_name("k8s-port")
            .long("k8s-port")
            .takes_value(true)
            .default_value("8000")
            .help("Port every discovered engine listens on"))
        .arg(Arg::with_name("k8s-label-selector")
            .long("k8s-label-selector")
            .takes_value(true)
            .help("Label selector filtering the watch"))
        .arg(Arg::with_name("k8s-service-discovery-type")
            .long("k8s-service-discovery-type")
            .takes_value(true)
            .default_value("pod-ip")
            .possible_values(&["pod-ip", "service-name"])
            .help("Watch pods directly or route via service names"))
        .arg(Arg::with_name("session-key")
            .long("session-key")
            .takes_value(true)
            .help("Header carrying the session id for session routing"))
        .arg(Arg::with_name("prefix-chunk-size")
            .long("prefix-chunk-size")
            .takes_value(true)
            .default_value("128")
            .help("Prompt chunk size for prefix-aware routing"))
        .arg(Arg::with_name("prefill-model-labels")
            .long("prefill-model-labels")
            .takes_value(true)
            .help("Comma-joined labels marking prefill engines"))
        .arg(Arg::with_name("decode-model-labels")
            .long("decode-model-labels")
            .takes_value(true)
            .help("Comma-joined labels marking decode engines"))
        .arg(Arg::with_name("dynamic-config-yaml")
            .long("dynamic-config-yaml")
            .takes_value(true)
            .conflicts_with("dynamic-config-json")
            .help("YAML file watched for hot reconfiguration"))
        .arg(Arg::with_name("dynamic-config-json")
            .long("dynamic-config-json")
            .takes_value(true)
            .help("JSON file watched for hot reconfiguration"))
        .arg(Arg::with_name("request-timeout")
            .long("request-timeout")
            .takes_value(true)
            .help("Optional per-request deadline in seconds"))
        .arg(Arg::with_name("stats-window")
            .long("stats-window")
            .takes_value(true)
            .default_value("60")
            .help("QPS sliding window in seconds"))
        .arg(Arg::with_name("scrape-interval")
            .long("scrape-interval")
            .takes_value(true)
            .default_value("30")
            .help("Engine /metrics scrape period in seconds"))
        .arg(Arg::with_name("verbose")
            .short("v")
            .long("verbose")
            .help("Increase verbosity"))
}

/// Map the flag surface onto a verified RouterConfig
fn build_config(args: &ArgMatches<'_>) -> Result<RouterConfig> {
    let mut cfg = RouterConfig::default();
    cfg.host = args.value_of("host").unwrap().into();
    cfg.port = args.value_of("port").unwrap().parse()?;
    cfg.routing_logic = args.value_of("routing-logic").unwrap().parse::<routecat::RoutingLogic>()?;
    cfg.service_discovery = args
        .value_of("service-discovery")
        .unwrap()
        .parse::<routecat::DiscoveryMode>()?;

    if let Some(raw) = args.value_of("static-backends") {
        cfg.static_backends = parse_comma_list(raw);
    }
    if let Some(raw) = args.value_of("static-models") {
        cfg.static_models = parse_comma_list(raw);
    }
    if let Some(raw) = args.value_of("static-model-labels") {
        cfg.static_model_labels = parse_comma_list(raw);
    }
    if let Some(raw) = args.value_of("static-model-types") {
        cfg.static_model_types = parse_comma_list(raw)
            .iter()
            .map(|t| t.parse::<ModelType>())
            .collect::<routecat_definitions::Result<Vec<_>>>()?;
    }
    if let Some(raw) = args.value_of("static-aliases") {
        cfg.static_aliases = parse_alias_list(raw)?;
    }
    cfg.static_backend_health_checks = args.is_present("static-backend-health-checks");

    cfg.k8s_namespace = args.value_of("k8s-namespace").unwrap().into();
    cfg.k8s_port = args.value_of("k8s-port").unwrap().parse()?;
    cfg.k8s_label_selector = args.value_of("k8s-label-selector").map(String::from);
    cfg.k8s_service_discovery_type = args
        .value_of("k8s-service-discovery-type")
        .unwrap()
        .parse::<routecat::K8sDiscoveryType>()?;

    cfg.session_key = args.value_of("session-key").map(String::from);
    cfg.prefix_chunk_size = args.value_of("prefix-chunk-size").unwrap().parse()?;
    if let Some(raw) = args.value_of("prefill-model-labels") {
        cfg.prefill_model_labels = parse_comma_list(raw);
    }
    if let Some(raw) = args.value_of("decode-model-labels") {
        cfg.decode_model_labels = parse_comma_list(raw);
    }

    if let Some(path) = args.value_of("dynamic-config-yaml") {
        cfg.dynamic_config_file = Some(path.into());
        cfg.dynamic_config_format = Some(ConfigFormat::Yaml);
    } else if let Some(path) = args.value_of("dynamic-config-json") {
        cfg.dynamic_config_file = Some(path.into());
        cfg.dynamic_config_format = Some(ConfigFormat::Json);
    }

    cfg.request_timeout = match args.value_of("request-timeout") {
        Some(raw) => Some(raw.parse()?),
        None => None,
    };
    cfg.stats_window = args.value_of("stats-window").unwrap().parse()?;
    cfg.scrape_interval = args.value_of("scrape-interval").unwrap().parse()?;

    cfg.verify()?;
    Ok(cfg)
}

async fn run(cfg: RouterConfig) -> Result<()> {
    let client = reqwest::Client::new();
    let registry = EndpointRegistry::new();
    let quarantine = Quarantine::new();
    let request_stats = RequestStatsMonitor::new(cfg.stats_window);
    let scraper = EngineStatsScraper::start(
        registry.clone(),
        client.clone(),
        quarantine.clone(),
        request_stats.clone(),
        cfg.scrape_interval,
    );
    let discovery = Arc::new(RwLock::new(
        ServiceDiscovery::initialize(&cfg, registry.clone(), client.clone()).await?,
    ));
    let router = Arc::new(RwLock::new(Router::from_config(&cfg)));
    let dynamic = match (&cfg.dynamic_config_file, cfg.dynamic_config_format) {
        (Some(path), Some(format)) => Some(DynamicConfigWatcher::start(
            PathBuf::from(path),
            format,
            cfg.clone(),
            registry.clone(),
            client.clone(),
            discovery.clone(),
            router.clone(),
        )),
        _ => None,
    };

    let state = AppState {
        config: cfg.clone(),
        registry,
        discovery,
        router,
        request_stats,
        scraper,
        quarantine,
        client,
        dynamic,
    };

    let bind = format!("{}:{}", cfg.host, cfg.port);
    info!("Creating http server on {}", bind);
    HttpServer::new(move || {
        WebApp::new()
            .data(state.clone())
            .wrap(middleware::Logger::default().exclude("/health"))
            .configure(api::configure)
    })
    .bind(&bind)?
    .run()
    .await?;
    Ok(())
}

#[actix_rt::main]
async fn main() {
    let matches = match cli().get_matches_safe() {
        Ok(matches) => matches,
        Err(e) => match e.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => {
                println!("{}", e.message);
                process::exit(0);
            }
            _ => {
                eprintln!("{}", e.message);
                process::exit(2);
            }
        },
    };

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "actix_web=info,routecat=info,kube=info");
    }
    if matches.is_present("verbose") {
        env::set_var("RUST_LOG", "actix_web=info,routecat=debug,kube=debug");
    }
    env_logger::init();

    let cfg = match build_config(&matches) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("config error: {}", e);
            print_error_debug(&e);
            process::exit(2);
        }
    };

    if let Err(e) = run(cfg).await {
        error!("routecat error: {}", e);
        print_error_debug(&e);
        process::exit(1);
    }
    process::exit(0);
}
