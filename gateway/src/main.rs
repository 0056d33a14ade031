use std::{collections::HashMap, env, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use meshtalk_p2p::{
    ChatMessage, LifecycleSignal, LocalDirectory, LocalNetwork, MeshConfig, MeshHandle,
    MeshSession, MeshSnapshot, SessionError,
};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

/// Every session hosted by this gateway shares one in-process network and
/// directory, so sessions created here form a mesh with each other.
#[derive(Clone)]
struct AppState {
    network: LocalNetwork,
    directory: Arc<LocalDirectory>,
    config: MeshConfig,
    sessions: Arc<RwLock<HashMap<String, MeshHandle>>>,
}

impl AppState {
    fn new(config: MeshConfig) -> Self {
        Self {
            network: LocalNetwork::new(),
            directory: Arc::new(LocalDirectory::new()),
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn session(&self, peer_id: &str) -> Result<MeshHandle, ApiError> {
        self.sessions
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| {
                api_error(
                    StatusCode::NOT_FOUND,
                    "session_not_found",
                    format!("no session for {peer_id}"),
                )
            })
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    sessions: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: &'static str,
    detail: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &'static str, detail: String) -> ApiError {
    (status, Json(ErrorResponse { error, detail }))
}

fn session_closed(e: SessionError) -> ApiError {
    let detail = e.to_string();
    error!(%detail, "mesh session unavailable");
    api_error(StatusCode::SERVICE_UNAVAILABLE, "session_closed", detail)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    peer_id: String,
}

#[derive(Debug, Serialize)]
struct StartResponse {
    started: bool,
    session: MeshSnapshot,
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct SignalRequest {
    signal: LifecycleSignal,
}

#[derive(Debug, Serialize)]
struct DirectoryResponse {
    online: Vec<String>,
    endpoints: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("meshtalk-gateway");

    let bind_addr = env::var("GATEWAY_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let socket_addr: SocketAddr = bind_addr.parse()?;
    let config = MeshConfig::from_env();
    info!(?config, "mesh configuration loaded");

    let state = AppState::new(config);
    let app = router(state.clone());

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    info!(%socket_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop_all(&state).await;
    global::shutdown_tracer_provider();
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        // Sessions
        .route("/v0/sessions", get(list_sessions).post(start_session))
        .route("/v0/sessions/{peer_id}", get(get_session))
        .route("/v0/sessions/{peer_id}/messages", get(list_messages))
        .route("/v0/sessions/{peer_id}/chat", post(send_chat))
        .route("/v0/sessions/{peer_id}/signal", post(send_signal))
        .route("/v0/sessions/{peer_id}/stop", post(stop_session))
        // Directory
        .route("/v0/directory", get(directory))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn init_tracing(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gateway=info,meshtalk_p2p=info,tower_http=info"));
    let fmt_layer = tracing_subscriber::fmt::layer().compact().with_target(false);

    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_owned()),
                ])),
            )
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio);

        match provider {
            Ok(provider) => {
                let tracer = provider.tracer(service_name.to_owned());
                global::set_tracer_provider(provider);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .init();
                info!("tracing initialized with OpenTelemetry OTLP exporter");
                return;
            }
            Err(error) => {
                eprintln!("failed to initialize OTLP exporter: {error}");
            }
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
    info!("tracing initialized (stdout only)");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "meshtalk-gateway",
        sessions: state.sessions.read().await.len(),
    })
}

// ---------------------------------------------------------------------------
// Session endpoints
// ---------------------------------------------------------------------------

/// POST /v0/sessions — Start (or restart) the session for `peer_id`.
#[instrument(skip(state, body), fields(peer_id = %body.peer_id))]
async fn start_session(
    State(state): State<AppState>,
    Json(body): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let peer_id = body.peer_id.trim().to_string();
    if peer_id.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_peer_id",
            "peer_id must not be empty".into(),
        ));
    }

    let (handle, created) = {
        let mut sessions = state.sessions.write().await;
        match sessions.get(&peer_id) {
            Some(handle) => (handle.clone(), false),
            None => {
                let handle = MeshSession::spawn(
                    Arc::new(state.network.transport()),
                    state.directory.clone(),
                    state.config.clone(),
                );
                sessions.insert(peer_id.clone(), handle.clone());
                (handle, true)
            }
        }
    };

    let started = handle.start(&peer_id).await.map_err(session_closed)?;
    info!(%peer_id, started, created, "session start requested");
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(StartResponse {
            started,
            session: handle.snapshot(),
        }),
    ))
}

/// GET /v0/sessions — Snapshot of every hosted session, ordered by peer id.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<MeshSnapshot>> {
    let sessions = state.sessions.read().await;
    let mut ids: Vec<&String> = sessions.keys().collect();
    ids.sort();
    Json(ids.into_iter().map(|id| sessions[id].snapshot()).collect())
}

async fn get_session(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<MeshSnapshot>, ApiError> {
    Ok(Json(state.session(&peer_id).await?.snapshot()))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.session(&peer_id).await?.messages()))
}

/// POST /v0/sessions/{peer_id}/chat — Broadcast a chat message.
#[instrument(skip(state, body))]
async fn send_chat(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
    Json(body): Json<ChatRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), ApiError> {
    let handle = state.session(&peer_id).await?;
    match handle.send_chat(&body.text).await.map_err(session_closed)? {
        Some(message) => Ok((StatusCode::ACCEPTED, Json(message))),
        None => {
            warn!(%peer_id, "chat rejected");
            Err(api_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                "chat_rejected",
                "text is blank or the session is not running".into(),
            ))
        }
    }
}

/// POST /v0/sessions/{peer_id}/signal — Deliver a host lifecycle signal.
#[instrument(skip(state, body))]
async fn send_signal(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
    Json(body): Json<SignalRequest>,
) -> Result<Json<MeshSnapshot>, ApiError> {
    let handle = state.session(&peer_id).await?;
    handle.signal(body.signal).await.map_err(session_closed)?;
    Ok(Json(handle.snapshot()))
}

/// POST /v0/sessions/{peer_id}/stop — Stop the session. The handle is kept
/// so the same peer id can be started again.
#[instrument(skip(state))]
async fn stop_session(
    State(state): State<AppState>,
    Path(peer_id): Path<String>,
) -> Result<Json<MeshSnapshot>, ApiError> {
    let handle = state.session(&peer_id).await?;
    handle.stop().await.map_err(session_closed)?;
    Ok(Json(handle.snapshot()))
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// GET /v0/directory — Ids registered online and endpoints currently open.
async fn directory(State(state): State<AppState>) -> Json<DirectoryResponse> {
    Json(DirectoryResponse {
        online: state.directory.online_ids().await,
        endpoints: state.network.endpoint_ids(),
    })
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

async fn stop_all(state: &AppState) {
    let handles: Vec<(String, MeshHandle)> = state.sessions.write().await.drain().collect();
    for (peer_id, handle) in handles {
        if let Err(e) = handle.stop().await {
            warn!(%peer_id, error = %e, "session already gone at shutdown");
        }
    }
    info!("all sessions stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::new(MeshConfig::default())
    }

    async fn start(state: &AppState, peer_id: &str) -> (StatusCode, StartResponse) {
        let (status, Json(body)) = start_session(
            State(state.clone()),
            Json(StartRequest {
                peer_id: peer_id.into(),
            }),
        )
        .await
        .unwrap();
        (status, body)
    }

    async fn wait_connected(state: &AppState, peer_id: &str, peers: usize) {
        let handle = state.session(peer_id).await.unwrap();
        handle
            .wait_for(|s| s.is_ready && s.connected_peers.len() == peers)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn start_creates_then_reuses_session() {
        let state = test_state();
        let (status, body) = start(&state, "peer:a").await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(body.started);
        assert_eq!(body.session.self_id.as_deref(), Some("peer:a"));

        let (status, body) = start(&state, "peer:a").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.started);

        let Json(all) = list_sessions(State(state.clone())).await;
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn blank_peer_id_is_rejected() {
        let state = test_state();
        let err = start_session(
            State(state),
            Json(StartRequest {
                peer_id: "  ".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(err.1.error, "invalid_peer_id");
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = test_state();
        let err = get_session(State(state), Path("peer:ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chat_flows_between_hosted_sessions() {
        let state = test_state();
        start(&state, "peer:a").await;
        wait_connected(&state, "peer:a", 0).await;
        while !state.directory.online_ids().await.contains(&"peer:a".to_string()) {
            tokio::task::yield_now().await;
        }
        start(&state, "peer:b").await;
        wait_connected(&state, "peer:a", 1).await;
        wait_connected(&state, "peer:b", 1).await;

        let (status, Json(sent)) = send_chat(
            State(state.clone()),
            Path("peer:a".into()),
            Json(ChatRequest {
                text: "hello from a".into(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);

        let b = state.session("peer:b").await.unwrap();
        b.wait_for(|s| s.messages.iter().any(|m| m.id == sent.id))
            .await
            .unwrap();
        let Json(messages) = list_messages(State(state.clone()), Path("peer:b".into()))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from, "peer:a");
    }

    #[tokio::test]
    async fn blank_chat_is_unprocessable() {
        let state = test_state();
        start(&state, "peer:a").await;
        let err = send_chat(
            State(state),
            Path("peer:a".into()),
            Json(ChatRequest { text: " ".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn stop_keeps_handle_and_clears_directory() {
        let state = test_state();
        start(&state, "peer:a").await;
        wait_connected(&state, "peer:a", 0).await;

        let Json(snapshot) = stop_session(State(state.clone()), Path("peer:a".into()))
            .await
            .unwrap();
        assert_eq!(snapshot.status.to_string(), "closed");
        assert_eq!(snapshot.active_count, 0);

        let Json(listing) = directory(State(state.clone())).await;
        assert!(listing.endpoints.is_empty());

        let (status, body) = start(&state, "peer:a").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.started);
    }

    #[tokio::test]
    async fn signal_body_uses_snake_case() {
        let request: SignalRequest =
            serde_json::from_str(r#"{"signal":"network_offline"}"#).unwrap();
        assert_eq!(request.signal, LifecycleSignal::NetworkOffline);

        let state = test_state();
        start(&state, "peer:a").await;
        wait_connected(&state, "peer:a", 0).await;
        let Json(snapshot) = send_signal(
            State(state),
            Path("peer:a".into()),
            Json(request),
        )
        .await
        .unwrap();
        assert_eq!(snapshot.status.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn shutdown_stops_every_session() {
        let state = test_state();
        start(&state, "peer:a").await;
        let handle = state.session("peer:a").await.unwrap();

        stop_all(&state).await;
        assert!(state.sessions.read().await.is_empty());
        assert_eq!(handle.snapshot().status.to_string(), "closed");
    }
}
