//! HTTP validator surface
//!
//! The out-of-band endpoints a reverse proxy calls to authorize protected
//! routes, plus read-only status/health/platform endpoints (§4.8).

use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::BrokerError;
use crate::invite::InviteService;
use crate::net::client_ip;
use crate::registry::StateRegistry;
use crate::store::Store;
use tokio::sync::Mutex;

const SESSION_COOKIE: &str = "demo_session";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Mutex<StateRegistry>>,
    pub invites: Arc<InviteService>,
    pub store: Arc<dyn Store>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/session/validate", get(session_validate))
        .route("/session/cookie", post(session_cookie))
        .route("/session/logout", post(session_logout))
        .route("/invite/validate", get(invite_validate))
        .route("/health", get(health))
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health))
        .route("/status", get(status))
        .route("/platforms", get(platforms))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: &BrokerError) -> Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({ "code": err.code(), "message": err.message() });
    if let Some(retry_after) = err.retry_after_secs() {
        body["details"] = json!({ "retryAfter": retry_after });
    }
    (status, Json(body)).into_response()
}

/// `GET /session/validate`. Valid iff the cookie is an active token whose
/// mapped session id equals the currently active session, or a pending
/// token. Stale active-map entries are garbage-collected on lookup miss.
async fn session_validate(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some(cookie) = jar.get(SESSION_COOKIE) else {
        return error_response(&BrokerError::NoSessionCookie);
    };
    let token = cookie.value();

    let mut reg = state.registry.lock().await;
    if let Some(session_id) = reg.active_token_session(token).cloned() {
        let current_matches = reg
            .active_session()
            .map(|s| s.session_id == session_id)
            .unwrap_or(false);
        if current_matches {
            let active = reg.active_session().unwrap();
            let short_id = &active.session_id[..8.min(active.session_id.len())];
            let mut headers = HeaderMap::new();
            if let Ok(value) = format!("demo-{short_id}").parse() {
                headers.insert("X-Grafana-User", value);
            }
            return (StatusCode::OK, headers).into_response();
        }
        reg.remove_active_token(token);
        return error_response(&BrokerError::SessionNotActive);
    }

    if reg.pending_token_client(token).is_some() {
        return StatusCode::OK.into_response();
    }

    error_response(&BrokerError::SessionNotActive)
}

#[derive(Deserialize)]
struct CookieRequest {
    token: String,
}

/// `POST /session/cookie {token}`. Rejects unless `token` is known to
/// either the active or pending index.
async fn session_cookie(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<CookieRequest>,
) -> Response {
    let reg = state.registry.lock().await;
    let known = reg.active_token_session(&req.token).is_some()
        || reg.pending_token_client(&req.token).is_some();
    drop(reg);

    if !known {
        return error_response(&BrokerError::InvalidToken);
    }

    let max_age_secs = state.config.session_timeout.as_secs() as i64;
    let cookie = Cookie::build((SESSION_COOKIE, req.token))
        .http_only(true)
        .same_site(SameSite::Strict)
        .secure(state.config.cookie_secure)
        .max_age(time::Duration::seconds(max_age_secs))
        .path("/")
        .build();

    (jar.add(cookie), StatusCode::OK).into_response()
}

/// `POST /session/logout`. Clears the cookie.
async fn session_logout(jar: CookieJar) -> Response {
    let cookie = Cookie::build(SESSION_COOKIE).path("/").build();
    (jar.remove(cookie), StatusCode::OK).into_response()
}

#[derive(Deserialize)]
struct InviteValidateQuery {
    token: Option<String>,
}

/// `GET /invite/validate`. Token from `X-Invite-Token` header or `token`
/// query param; IP from the forwarded-for chain.
async fn invite_validate(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<InviteValidateQuery>,
) -> Response {
    let token = headers
        .get("x-invite-token")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .or(query.token);

    let forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let ip = client_ip(forwarded_for, peer);

    match state.invites.validate(token.as_deref(), ip).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(reason) => {
            let err = crate::queue::reject_reason_to_error(reason);
            error_response(&err)
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

/// `GET /health` / `GET /health/ready`: 503 if the store `ping` fails.
async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthBody { status: "ok" })).into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthBody { status: "degraded" }),
        )
            .into_response(),
    }
}

/// `GET /health/live`: always 200 while the process is up.
async fn health_live() -> Response {
    (StatusCode::OK, Json(HealthBody { status: "ok" })).into_response()
}

#[derive(Serialize)]
struct StatusBody {
    queue_size: usize,
    session_active: bool,
}

/// `GET /status`: public queue snapshot.
async fn status(State(state): State<AppState>) -> Response {
    let reg = state.registry.lock().await;
    Json(StatusBody {
        queue_size: reg.queue_len(),
        session_active: reg.active_session().is_some(),
    })
    .into_response()
}

#[derive(Serialize)]
struct PlatformsBody {
    enabled: Vec<String>,
    scenarios: Vec<String>,
}

/// `GET /platforms`: enabled platform names plus the scenario names found
/// under `BROKER_SCENARIOS_PATH` (opaque to the core — just file stems).
async fn platforms(State(state): State<AppState>) -> Response {
    Json(PlatformsBody {
        enabled: state
            .config
            .enabled_platforms
            .iter()
            .map(|p| p.name().to_string())
            .collect(),
        scenarios: list_scenarios(&state.config.scenarios_path).await,
    })
    .into_response()
}

/// Lists scenario file stems under the configured scenarios directory.
/// Missing or unreadable directories yield an empty list rather than an
/// error — scenario discovery is a read-only convenience, not load-bearing
/// for queue/session correctness.
async fn list_scenarios(path: &str) -> Vec<String> {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    names
}
