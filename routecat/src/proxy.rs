use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use uuid::Uuid;

use crate::routing::{RequestFacts, RouteDecision};
use crate::state::AppState;
use crate::stats::RequestStatsMonitor;
use crate::{EndpointInfo, SleepState};

/// Headers that must not be forwarded in either direction
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn json_error(status: StatusCode, msg: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": msg }))
}

/// Pull the fingerprintable prompt text out of an OpenAI-shaped body
fn extract_prompt(body: &serde_json::Value) -> String {
    if let Some(prompt) = body.get("prompt") {
        match prompt {
            serde_json::Value::String(s) => return s.clone(),
            serde_json::Value::Array(parts) => {
                return parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            _ => {}
        }
    }
    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        return messages
            .iter()
            .filter_map(|m| m.get("content"))
            .filter_map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("\n");
    }
    String::new()
}

/// Byte pump from the upstream engine back to the caller
///
/// Records TTFT on the first chunk and inter-chunk gaps after that. The
/// in-flight slot is released in Drop so a caller disconnect (actix drops
/// the body stream) is accounted exactly like a clean completion.
struct ProxyStream {
    inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    stats: RequestStatsMonitor,
    url: String,
    request_id: String,
    started: Instant,
    last_byte: Option<Instant>,
    deadline: Option<Instant>,
    finished: bool,
}

impl ProxyStream {
    fn new(
        inner: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
        stats: RequestStatsMonitor,
        url: String,
        request_id: String,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Self {
        ProxyStream {
            inner,
            stats,
            url,
            request_id,
            started,
            last_byte: None,
            deadline,
            finished: false,
        }
    }
}

impl Stream for ProxyStream {
    type Item = std::result::Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                warn!("Request {} exceeded its deadline mid-stream", self.request_id);
                return Poll::Ready(Some(Err(actix_web::error::ErrorGatewayTimeout(
                    "upstream deadline exceeded",
                ))));
            }
        }
        match self.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                let now = Instant::now();
                match self.last_byte {
                    None => {
                        let ttft = now.duration_since(self.started);
                        self.stats.on_first_byte(&self.url, ttft);
                    }
                    Some(last) => {
                        self.stats.on_inter_byte(&self.url, now.duration_since(last));
                    }
                }
                self.last_byte = Some(now);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                warn!("Upstream stream error from {}: {}", self.url, e);
                Poll::Ready(Some(Err(actix_web::error::ErrorBadGateway(e))))
            }
            Poll::Ready(None) => {
                self.finished = true;
                debug!(
                    "Request {} completed in {:?}",
                    self.request_id,
                    self.started.elapsed()
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProxyStream {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                "Request {} aborted by the caller, cancelling upstream to {}",
                self.request_id, self.url
            );
        }
        self.stats.on_request_end(&self.url, self.finished);
    }
}

/// Gather the routing fingerprint for one inbound request
fn request_facts(
    state: &AppState,
    req: &HttpRequest,
    model: &str,
    body: &serde_json::Value,
) -> RequestFacts {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_id = state.session_header().and_then(|h| {
        req.headers()
            .get(h.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    RequestFacts {
        request_id,
        model: model.to_string(),
        session_id,
        prompt: extract_prompt(body),
    }
}

/// Route one OpenAI-style request to an engine and stream the answer back
pub async fn route_general_request(
    state: &AppState,
    req: &HttpRequest,
    body: Bytes,
    path: &str,
) -> HttpResponse {
    let mut parsed: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return json_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid JSON body: {}", e),
            )
        }
    };
    let requested = match parsed.get("model").and_then(|m| m.as_str()) {
        Some(m) => m.to_string(),
        None => return json_error(StatusCode::BAD_REQUEST, "request body has no model"),
    };

    // alias resolution happens before eligibility filtering
    let discovery = state.discovery();
    let model = discovery.resolve_alias(&requested);
    let out_body = if model != requested {
        debug!("Resolved model alias {} -> {}", requested, model);
        parsed["model"] = serde_json::Value::String(model.clone());
        match serde_json::to_vec(&parsed) {
            Ok(v) => Bytes::from(v),
            Err(e) => {
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &format!("could not rewrite body: {}", e),
                )
            }
        }
    } else {
        body
    };

    let facts = request_facts(state, req, &model, &parsed);

    let engines = state.registry.list();
    let serving: Vec<EndpointInfo> = engines
        .into_iter()
        .filter(|e| e.has_model(&model))
        .collect();
    if serving.is_empty() {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("no engine serves model {}", model),
        );
    }
    let eligible: Vec<EndpointInfo> = serving
        .into_iter()
        .filter(|e| e.sleep != SleepState::Sleeping && !state.quarantine.contains(&e.url))
        .collect();
    if eligible.is_empty() {
        return json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no engines available to route this request",
        );
    }

    let decision = {
        let router = state.router.read().unwrap();
        router.route(
            &eligible,
            &state.scraper.snapshot(),
            &state.request_stats.snapshot(),
            &facts,
        )
    };
    let decision = match decision {
        Ok(d) => d,
        Err(e) => return json_error(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    };

    info!(
        "Routing request {} with session id {} to {} at {}",
        facts.request_id,
        facts.session_id.as_deref().unwrap_or("None"),
        decision.primary(),
        Utc::now().timestamp()
    );

    if let RouteDecision::Pair {
        ref prefill,
        ref decode,
    } = decision
    {
        debug!(
            "Request {} prefills on {} before decoding on {}",
            facts.request_id, prefill, decode
        );
        if let Err(resp) = run_prefill(state, req, &out_body, prefill, path, &facts).await {
            return resp;
        }
    }

    dispatch_streaming(state, req, out_body, decision.primary(), path, &facts).await
}

/// Fire the prefill half of a disaggregated pair and wait it out
async fn run_prefill(
    state: &AppState,
    req: &HttpRequest,
    body: &Bytes,
    url: &str,
    path: &str,
    facts: &RequestFacts,
) -> std::result::Result<(), HttpResponse> {
    state.request_stats.on_request_start(url);
    let res = build_upstream(state, req, body.clone(), url, path, facts)
        .send()
        .await;
    match res {
        Ok(res) => {
            let status = res.status();
            // drain so the connection can be reused
            let _ = res.bytes().await;
            state.request_stats.on_request_end(url, true);
            if status.is_success() {
                Ok(())
            } else {
                warn!("Prefill engine {} returned {}", url, status);
                Err(json_error(
                    StatusCode::BAD_GATEWAY,
                    &format!("prefill engine returned {}", status),
                ))
            }
        }
        Err(e) => {
            state.request_stats.on_request_end(url, false);
            state.quarantine.strike(url);
            warn!("Failed to connect to prefill engine at {}: {}", url, e);
            Err(json_error(
                StatusCode::BAD_GATEWAY,
                &format!("failed to connect to engine at {}", url),
            ))
        }
    }
}

fn build_upstream(
    state: &AppState,
    req: &HttpRequest,
    body: Bytes,
    url: &str,
    path: &str,
    facts: &RequestFacts,
) -> reqwest::RequestBuilder {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in req.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    if let Ok(rid) = reqwest::header::HeaderValue::from_str(&facts.request_id) {
        headers.insert("x-request-id", rid);
    }
    state
        .client
        .post(&format!("{}{}", url, path))
        .headers(headers)
        .body(body.to_vec())
}

async fn dispatch_streaming(
    state: &AppState,
    req: &HttpRequest,
    body: Bytes,
    url: &str,
    path: &str,
    facts: &RequestFacts,
) -> HttpResponse {
    state.request_stats.on_request_start(url);
    let started = Instant::now();
    let deadline = state
        .config
        .request_timeout
        .map(|secs| started + Duration::from_secs(secs));

    let send = build_upstream(state, req, body, url, path, facts).send();
    let res = if let Some(secs) = state.config.request_timeout {
        match tokio::time::timeout(Duration::from_secs(secs), send).await {
            Ok(r) => r,
            Err(_) => {
                state.request_stats.on_request_end(url, false);
                warn!("Request {} to {} timed out", facts.request_id, url);
                return json_error(
                    StatusCode::GATEWAY_TIMEOUT,
                    &format!("engine at {} did not answer in time", url),
                );
            }
        }
    } else {
        send.await
    };

    let res = match res {
        Ok(r) => r,
        Err(e) => {
            state.request_stats.on_request_end(url, false);
            state.quarantine.strike(url);
            warn!("Failed to connect to engine at {}: {}", url, e);
            return json_error(
                StatusCode::BAD_GATEWAY,
                &format!("failed to connect to engine at {}", url),
            );
        }
    };

    // upstream 4xx/5xx pass through unchanged, body included
    let status = StatusCode::from_u16(res.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = HttpResponse::build(status);
    for (name, value) in res.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder.header(name.clone(), value.clone());
    }
    let stream = ProxyStream::new(
        Box::pin(res.bytes_stream()),
        state.request_stats.clone(),
        url.to_string(),
        facts.request_id.clone(),
        started,
        deadline,
    );
    builder.streaming(stream)
}

/// Control path for `/sleep`, `/wake_up` and `/is_sleeping`
///
/// The target engine is named by a `url` or `engine_id` key in the JSON body
/// (query parameters for the GET variant). On success the sleep label is
/// pushed through discovery and the registry state refreshed.
pub async fn route_sleep_wakeup_request(
    state: &AppState,
    req: &HttpRequest,
    body: Bytes,
    path: &str,
) -> HttpResponse {
    let target = match find_target(state, req, &body) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let endpoint_url = format!("{}{}", target.url, path);
    let mut upstream = if path == "/is_sleeping" {
        state.client.get(&endpoint_url)
    } else {
        state.client.post(&endpoint_url)
    };
    if let Ok(key) = std::env::var("VLLM_API_KEY") {
        upstream = upstream.header("Authorization", format!("Bearer {}", key));
    }

    let res = match upstream.send().await {
        Ok(r) => r,
        Err(e) => {
            state.quarantine.strike(&target.url);
            warn!("Failed to connect to engine at {}: {}", target.url, e);
            return json_error(
                StatusCode::BAD_GATEWAY,
                &format!("failed to connect to engine at {}", target.url),
            );
        }
    };
    let status =
        StatusCode::from_u16(res.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload: serde_json::Value = res.json().await.unwrap_or(serde_json::Value::Null);

    if status.is_success() {
        let discovery = state.discovery();
        match path {
            "/sleep" => {
                if let Some(name) = target.subject_name() {
                    if let Err(e) = discovery.add_sleep_label(name).await {
                        warn!("Could not label {} as sleeping: {}", name, e);
                    }
                }
                state.registry.set_sleep(&target.id, SleepState::Sleeping);
            }
            "/wake_up" => {
                if let Some(name) = target.subject_name() {
                    if let Err(e) = discovery.remove_sleep_label(name).await {
                        warn!("Could not remove the sleeping label from {}: {}", name, e);
                    }
                }
                state.registry.set_sleep(&target.id, SleepState::Awake);
            }
            _ => {
                if let Some(sleeping) = payload.get("is_sleeping").and_then(|s| s.as_bool()) {
                    let sleep = if sleeping {
                        SleepState::Sleeping
                    } else {
                        SleepState::Awake
                    };
                    state.registry.set_sleep(&target.id, sleep);
                }
            }
        }
    }
    HttpResponse::build(status).json(payload)
}

/// Resolve the engine a control request is aimed at
fn find_target(
    state: &AppState,
    req: &HttpRequest,
    body: &Bytes,
) -> std::result::Result<EndpointInfo, HttpResponse> {
    let mut url = None;
    let mut engine_id = None;
    if !body.is_empty() {
        if let Ok(v) = serde_json::from_slice::<serde_json::Value>(body) {
            url = v.get("url").and_then(|u| u.as_str()).map(String::from);
            engine_id = v
                .get("engine_id")
                .and_then(|i| i.as_str())
                .map(String::from);
        }
    }
    for (key, value) in url::form_urlencoded::parse(req.query_string().as_bytes()) {
        match key.as_ref() {
            "url" => url = Some(value.into_owned()),
            "engine_id" => engine_id = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(u) = url {
        return state.registry.find_by_url(&u).ok_or_else(|| {
            json_error(
                StatusCode::NOT_FOUND,
                &format!("no engine matches target {}", u),
            )
        });
    }
    if let Some(raw) = engine_id {
        let id = match raw.parse::<Uuid>() {
            Ok(id) => id,
            Err(_) => {
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    &format!("engine_id {} is not a uuid", raw),
                ))
            }
        };
        return state.registry.get(&id).ok_or_else(|| {
            json_error(
                StatusCode::NOT_FOUND,
                &format!("no engine matches target {}", raw),
            )
        });
    }
    Err(json_error(
        StatusCode::BAD_REQUEST,
        "name an engine with a url or engine_id key",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_extraction_prefers_prompt_key() {
        let body = serde_json::json!({ "prompt": "hello world" });
        assert_eq!(extract_prompt(&body), "hello world");

        let body = serde_json::json!({ "prompt": ["a", "b"] });
        assert_eq!(extract_prompt(&body), "a\nb");
    }

    #[test]
    fn prompt_extraction_concatenates_chat_messages() {
        let body = serde_json::json!({
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" }
            ]
        });
        assert_eq!(extract_prompt(&body), "be brief\nhi");
    }

    #[test]
    fn prompt_extraction_tolerates_other_bodies() {
        let body = serde_json::json!({ "input": "embed me" });
        assert_eq!(extract_prompt(&body), "");
    }

    #[test]
    fn hop_by_hop_headers_are_recognised() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
