use actix_web::{web, HttpRequest, HttpResponse};

use crate::proxy::{route_general_request, route_sleep_wakeup_request};
use crate::state::AppState;
use crate::{EngineCard, ModelList};

// Route entrypoints

async fn chat_completions(
    req: HttpRequest,
    body: web::Bytes,
    data: web::Data<AppState>,
) -> HttpResponse {
    route_general_request(&data, &req, body, "/v1/chat/completions").await
}

async fn completions(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/v1/completions").await
}

async fn embeddings(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/v1/embeddings").await
}

async fn rerank_v1(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/v1/rerank").await
}

async fn rerank(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/rerank").await
}

async fn score_v1(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/v1/score").await
}

async fn score(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/score").await
}

async fn tokenize(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/tokenize").await
}

async fn detokenize(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_general_request(&data, &req, body, "/detokenize").await
}

async fn sleep(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_sleep_wakeup_request(&data, &req, body, "/sleep").await
}

async fn wake_up(req: HttpRequest, body: web::Bytes, data: web::Data<AppState>) -> HttpResponse {
    route_sleep_wakeup_request(&data, &req, body, "/wake_up").await
}

async fn is_sleeping(req: HttpRequest, data: web::Data<AppState>) -> HttpResponse {
    route_sleep_wakeup_request(&data, &req, web::Bytes::new(), "/is_sleeping").await
}

/// Deduplicated model cards across the whole fleet
async fn models(data: web::Data<AppState>) -> HttpResponse {
    let endpoints = data.registry.list();
    HttpResponse::Ok().json(ModelList::from_endpoints(&endpoints))
}

/// Engine cards for operators
async fn engines(data: web::Data<AppState>) -> HttpResponse {
    let endpoints = data.registry.list();
    HttpResponse::Ok().json(EngineCard::from_endpoints(&endpoints))
}

async fn version() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

/// OK only when every subsystem reports healthy
async fn health(data: web::Data<AppState>) -> HttpResponse {
    if !data.discovery().get_health() {
        return HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({ "status": "Service discovery module is down." }));
    }
    if !data.scraper.get_health() {
        return HttpResponse::ServiceUnavailable()
            .json(serde_json::json!({ "status": "Engine stats scraper is down." }));
    }
    if let Some(ref watcher) = data.dynamic {
        if !watcher.get_health() {
            return HttpResponse::ServiceUnavailable()
                .json(serde_json::json!({ "status": "Dynamic config watcher is down." }));
        }
        return HttpResponse::Ok().json(serde_json::json!({
            "status": "healthy",
            "dynamic_config": watcher.current(),
        }));
    }
    HttpResponse::Ok().json(serde_json::json!({ "status": "healthy" }))
}

/// Wire every public path onto an actix app
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/v1/chat/completions").route(web::post().to(chat_completions)))
        .service(web::resource("/v1/completions").route(web::post().to(completions)))
        .service(web::resource("/v1/embeddings").route(web::post().to(embeddings)))
        .service(web::resource("/v1/rerank").route(web::post().to(rerank_v1)))
        .service(web::resource("/rerank").route(web::post().to(rerank)))
        .service(web::resource("/v1/score").route(web::post().to(score_v1)))
        .service(web::resource("/score").route(web::post().to(score)))
        .service(web::resource("/tokenize").route(web::post().to(tokenize)))
        .service(web::resource("/detokenize").route(web::post().to(detokenize)))
        .service(web::resource("/sleep").route(web::post().to(sleep)))
        .service(web::resource("/wake_up").route(web::post().to(wake_up)))
        .service(web::resource("/is_sleeping").route(web::get().to(is_sleeping)))
        .service(web::resource("/v1/models").route(web::get().to(models)))
        .service(web::resource("/engines").route(web::get().to(engines)))
        .service(web::resource("/version").route(web::get().to(version)))
        .service(web::resource("/health").route(web::get().to(health)));
}
