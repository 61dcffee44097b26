//! HTTP route handlers.
//!
//! All handlers are thin - they delegate to the orchestrator and store.
//! The wire contract:
//!
//! - `POST /api/v3/intents` - idempotent admission, always `202` on valid
//!   authorized input. Lease contention is NOT an HTTP error; it surfaces
//!   later as a terminal session state.
//! - `GET /api/v3/sessions/{id}` - state + reason + URLs.
//! - `POST /api/v3/sessions/{id}/stop` - stop intent, `202`.
//! - `GET /api/v3/sessions/{id}/hls/{asset}` - playlist and media with
//!   bit-exact MIME types.
//! - `GET /healthz` / `GET /readyz` - liveness / readiness.

use std::net::SocketAddr;

use axum::{
    extract::{connect_info::ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;

use crate::api::AppState;
use crate::error::{E2castError, E2castResult};
use crate::hls::{AssetKind, SessionDir};
use crate::protocol_constants::{API_VERSION, SCOPE_READ, SCOPE_WRITE};
use crate::session::{Session, SessionState};

/// Builds the full router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/api/v3/intents", post(post_intent))
        .route("/api/v3/sessions", get(list_sessions))
        .route("/api/v3/sessions/{id}", get(get_session))
        .route("/api/v3/sessions/{id}/stop", post(stop_session))
        .route("/api/v3/sessions/{id}/hls/{asset}", get(serve_hls_asset))
        .layer(axum::middleware::from_fn(security_headers))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Response headers carried by every reply, success or error.
async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("X-API-Version", HeaderValue::from_static(API_VERSION));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadyComponents {
    store: &'static str,
    worker: &'static str,
}

async fn readiness_check(State(state): State<AppState>) -> Response {
    let store_healthy = state.store.get_session("readyz-probe").is_ok();
    let worker_enabled = state.config.read().worker_enabled;

    let components = ReadyComponents {
        store: if store_healthy { "healthy" } else { "unhealthy" },
        worker: if worker_enabled { "healthy" } else { "disabled" },
    };
    let (status, overall) = if state.lifecycle.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else if !store_healthy {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if !worker_enabled {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ready")
    };
    (
        status,
        Json(json!({ "status": overall, "components": components })),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// Intents
// ─────────────────────────────────────────────────────────────────────────────

async fn post_intent(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> E2castResult<Response> {
    state
        .auth
        .authorize(&headers, &remote.to_string(), SCOPE_WRITE)?;
    if state.lifecycle.is_draining() {
        return Err(E2castError::Draining);
    }

    let body: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| E2castError::InvalidRequest(format!("body must be JSON: {e}")))?;
    let service_ref = body
        .get("serviceRef")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| E2castError::InvalidRequest("serviceRef is required".into()))?;
    let profile = body
        .get("profile")
        .filter(|v| v.is_object())
        .ok_or_else(|| E2castError::InvalidRequest("profile object is required".into()))?;
    let start_ms = match body.get("startMs") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => Some(v.as_u64().ok_or_else(|| {
            E2castError::InvalidRequest("startMs must be a non-negative integer".into())
        })?),
    };

    let outcome = state
        .orchestrator
        .admit(service_ref, profile, start_ms)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "sessionId": outcome.session_id })),
    )
        .into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionUrls {
    playlist: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    session_id: String,
    state: SessionState,
    reason: &'static str,
    urls: SessionUrls,
}

impl SessionResponse {
    fn from_session(session: &Session) -> Self {
        let playlist = (session.state == SessionState::Ready)
            .then(|| format!("/api/v3/sessions/{}/hls/index.m3u8", session.id));
        Self {
            session_id: session.id.clone(),
            state: session.state,
            reason: session.reason.as_str(),
            urls: SessionUrls { playlist },
        }
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> E2castResult<Json<Vec<SessionResponse>>> {
    state
        .auth
        .authorize(&headers, &remote.to_string(), SCOPE_READ)?;
    let mut sessions = state.store.list_sessions()?;
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(
        sessions.iter().map(SessionResponse::from_session).collect(),
    ))
}

async fn get_session(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> E2castResult<Json<SessionResponse>> {
    state
        .auth
        .authorize(&headers, &remote.to_string(), SCOPE_READ)?;
    let session = state
        .store
        .get_session(&id)?
        .ok_or(E2castError::SessionNotFound(id))?;
    Ok(Json(SessionResponse::from_session(&session)))
}

async fn stop_session(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> E2castResult<Response> {
    state
        .auth
        .authorize(&headers, &remote.to_string(), SCOPE_WRITE)?;
    state.orchestrator.request_stop(&id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "sessionId": id }))).into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// HLS Assets
// ─────────────────────────────────────────────────────────────────────────────

async fn serve_hls_asset(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((id, asset)): Path<(String, String)>,
    headers: HeaderMap,
) -> E2castResult<Response> {
    state
        .auth
        .authorize(&headers, &remote.to_string(), SCOPE_READ)?;

    let dir = SessionDir::new(&state.hls_root, &id)
        .ok_or_else(|| E2castError::SessionNotFound(id.clone()))?;
    let Some((path, kind)) = dir.asset(&asset) else {
        return Err(E2castError::SessionNotFound(asset));
    };

    // Playlist fetches feed the idle gate.
    if kind == AssetKind::Playlist {
        state.orchestrator.touch(&id);
    }

    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let cache_control = match kind {
                // The EVENT playlist grows; never cache it.
                AssetKind::Playlist => "no-store",
                // Published segments are immutable for the session's life.
                _ => "max-age=3600, immutable",
            };
            Ok((
                [
                    (header::CONTENT_TYPE, kind.mime()),
                    (header::CACHE_CONTROL, cache_control),
                ],
                bytes,
            )
                .into_response())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Distinguish "not published yet" from "no such thing".
            match state.store.get_session(&id)? {
                Some(session) if !session.state.is_terminal()
                    && session.state != SessionState::Ready =>
                {
                    Err(E2castError::NotReady(id))
                }
                _ => Err(E2castError::SessionNotFound(asset)),
            }
        }
        Err(e) => Err(E2castError::Internal(format!(
            "asset read failed: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::AuthPolicy;
    use crate::events::NoopEventEmitter;
    use crate::lifecycle::Lifecycle;
    use crate::metrics::Metrics;
    use crate::probe::MediaProbe;
    use crate::receiver::{ReceiverResult, StreamResolver};
    use crate::services::LeaseManager;
    use crate::session::{Orchestrator, Profile, Reason, WorkerConfig, WorkerDeps};
    use crate::state::Config;
    use crate::store::{MemoryStore, SessionStore};
    use parking_lot::RwLock;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct StaticResolver;

    #[async_trait::async_trait]
    impl StreamResolver for StaticResolver {
        async fn resolve(
            &self,
            _service_ref: &str,
            _cancel: &CancellationToken,
        ) -> ReceiverResult<String> {
            Ok("http://box:8001/ref".to_string())
        }
    }

    struct TestApp {
        base: String,
        state: AppState,
        client: reqwest::Client,
        _hls_root: tempfile::TempDir,
    }

    async fn spawn_app() -> TestApp {
        let hls_root = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::new());
        let config = Config::default();

        let deps = Arc::new(WorkerDeps {
            store: Arc::clone(&store),
            leases: Arc::new(LeaseManager::new(
                Arc::clone(&store),
                vec![0],
                Duration::from_secs(30),
                Arc::clone(&metrics),
            )),
            resolver: Arc::new(StaticResolver),
            probe: Arc::new(MediaProbe::new(PathBuf::from("ffprobe"), Duration::from_secs(5))),
            config: WorkerConfig::from(&config),
            metrics: Arc::clone(&metrics),
            emitter: Arc::new(NoopEventEmitter),
        });
        let orchestrator = Arc::new(Orchestrator::new(deps, false, Duration::from_secs(60)));

        let state = AppState {
            store,
            orchestrator,
            lifecycle: Arc::new(Lifecycle::new()),
            auth: Arc::new(AuthPolicy::new(
                "sekrit".to_string(),
                vec!["v3:read".to_string(), "v3:write".to_string()],
            )),
            hls_root: hls_root.path().to_path_buf(),
            config: Arc::new(RwLock::new(config)),
            metrics,
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        TestApp {
            base: format!("http://{addr}"),
            state,
            client: reqwest::Client::new(),
            _hls_root: hls_root,
        }
    }

    fn intent_body() -> serde_json::Value {
        json!({ "serviceRef": "1:0:19:1:1:1:1:0:0:0:", "profile": {"codec": "h264"} })
    }

    #[tokio::test]
    async fn healthz_is_open_and_carries_security_headers() {
        let app = spawn_app().await;
        let response = app
            .client
            .get(format!("{}/healthz", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let headers = response.headers();
        assert_eq!(headers["X-API-Version"], "3");
        assert_eq!(headers["X-Content-Type-Options"], "nosniff");
        assert_eq!(headers["X-Frame-Options"], "DENY");
        assert!(headers.contains_key("Content-Security-Policy"));
    }

    #[tokio::test]
    async fn intents_require_auth_and_scope() {
        let app = spawn_app().await;
        let url = format!("{}/api/v3/intents", app.base);

        let response = app.client.post(&url).json(&intent_body()).send().await.unwrap();
        assert_eq!(response.status(), 401);

        let response = app
            .client
            .post(&url)
            .bearer_auth("wrong")
            .json(&intent_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
    }

    #[tokio::test]
    async fn identical_intents_share_a_session_id() {
        let app = spawn_app().await;
        let url = format!("{}/api/v3/intents", app.base);

        let first: serde_json::Value = app
            .client
            .post(&url)
            .bearer_auth("sekrit")
            .json(&intent_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let second_response = app
            .client
            .post(&url)
            .bearer_auth("sekrit")
            .json(&intent_body())
            .send()
            .await
            .unwrap();
        assert_eq!(second_response.status(), 202);
        let second: serde_json::Value = second_response.json().await.unwrap();
        assert_eq!(first["sessionId"], second["sessionId"]);
    }

    #[tokio::test]
    async fn invalid_payloads_get_400() {
        let app = spawn_app().await;
        let url = format!("{}/api/v3/intents", app.base);

        for body in [
            json!({}),
            json!({ "serviceRef": "" , "profile": {}}),
            json!({ "serviceRef": "ref" }),
            json!({ "serviceRef": "ref", "profile": "h264" }),
            json!({ "serviceRef": "ref", "profile": {}, "startMs": -5 }),
        ] {
            let response = app
                .client
                .post(&url)
                .bearer_auth("sekrit")
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 400, "body: {body}");
        }
    }

    #[tokio::test]
    async fn draining_control_plane_returns_503_with_retry_after() {
        let app = spawn_app().await;
        app.state.lifecycle.begin_shutdown();

        let response = app
            .client
            .post(format!("{}/api/v3/intents", app.base))
            .bearer_auth("sekrit")
            .json(&intent_body())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
        assert!(response.headers().contains_key("Retry-After"));
    }

    #[tokio::test]
    async fn session_fetch_reports_state_and_reason() {
        let app = spawn_app().await;
        let admitted: serde_json::Value = app
            .client
            .post(format!("{}/api/v3/intents", app.base))
            .bearer_auth("sekrit")
            .json(&intent_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = admitted["sessionId"].as_str().unwrap();

        let session: serde_json::Value = app
            .client
            .get(format!("{}/api/v3/sessions/{id}", app.base))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session["state"], "NEW");
        assert_eq!(session["reason"], "R_NONE");
        assert!(session["urls"]["playlist"].is_null());

        let missing = app
            .client
            .get(format!("{}/api/v3/sessions/doesnotexist", app.base))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn stop_is_accepted_and_cancels_unpicked_sessions() {
        let app = spawn_app().await;
        let admitted: serde_json::Value = app
            .client
            .post(format!("{}/api/v3/intents", app.base))
            .bearer_auth("sekrit")
            .json(&intent_body())
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let id = admitted["sessionId"].as_str().unwrap();

        let response = app
            .client
            .post(format!("{}/api/v3/sessions/{id}/stop", app.base))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);

        let session: serde_json::Value = app
            .client
            .get(format!("{}/api/v3/sessions/{id}", app.base))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session["state"], "CANCELLED");

        let response = app
            .client
            .post(format!("{}/api/v3/sessions/ghost/stop", app.base))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn hls_assets_are_served_with_exact_mime_types() {
        let app = spawn_app().await;

        // A READY session with artifacts on disk.
        let mut session = Session::new(
            "ready1".to_string(),
            "ref".to_string(),
            Profile::default(),
            None,
        );
        session.transition(SessionState::Starting, Reason::None).unwrap();
        session.transition(SessionState::Priming, Reason::None).unwrap();
        session.transition(SessionState::Ready, Reason::None).unwrap();
        app.state.store.put_session(&session).unwrap();

        let dir = app.state.hls_root.join("sessions/ready1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(dir.join("init.mp4"), b"init").unwrap();
        std::fs::write(dir.join("seg_000001.m4s"), b"seg").unwrap();

        for (asset, mime) in [
            ("index.m3u8", "application/vnd.apple.mpegurl"),
            ("init.mp4", "video/mp4"),
            ("seg_000001.m4s", "video/mp4"),
        ] {
            let response = app
                .client
                .get(format!(
                    "{}/api/v3/sessions/ready1/hls/{asset}",
                    app.base
                ))
                .bearer_auth("sekrit")
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), 200, "{asset}");
            assert_eq!(response.headers()["Content-Type"], mime, "{asset}");
        }

        // Unknown segment: 404 even though the session is READY.
        let response = app
            .client
            .get(format!(
                "{}/api/v3/sessions/ready1/hls/seg_000099.m4s",
                app.base
            ))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        // Traversal shapes are refused outright.
        let response = app
            .client
            .get(format!(
                "{}/api/v3/sessions/ready1/hls/..%2Fsecret",
                app.base
            ))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn unpublished_playlist_of_a_priming_session_is_425() {
        let app = spawn_app().await;
        let mut session = Session::new(
            "warming".to_string(),
            "ref".to_string(),
            Profile::default(),
            None,
        );
        session.transition(SessionState::Starting, Reason::None).unwrap();
        session.transition(SessionState::Priming, Reason::None).unwrap();
        app.state.store.put_session(&session).unwrap();

        let response = app
            .client
            .get(format!(
                "{}/api/v3/sessions/warming/hls/index.m3u8",
                app.base
            ))
            .bearer_auth("sekrit")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 425);
    }

    #[tokio::test]
    async fn readyz_reflects_draining() {
        let app = spawn_app().await;
        let response = app
            .client
            .get(format!("{}/readyz", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "ready");
        assert_eq!(body["components"]["store"], "healthy");

        app.state.lifecycle.begin_shutdown();
        let response = app
            .client
            .get(format!("{}/readyz", app.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 503);
    }
}
