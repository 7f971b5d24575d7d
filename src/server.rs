//! HTTP and WebSocket surface.
//!
//! Routes:
//!
//! - `GET /available-logs`: JSON object mapping each source's endpoint to its
//!   name.
//! - `GET /ws/{endpoint}`: WebSocket feed of a source. The history window is
//!   sent first, then every new line, one text message per line. Anything
//!   the client sends is ignored.
//! - `GET /health`: liveness probe.
//!
//! When a shared secret is configured, the first two require it either as
//! `Authorization: Bearer <secret>` or as a `token` query parameter.

use std::future::Future;
use std::io;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::registry::SourceRegistry;
use crate::source::{Source, SourceState};

#[derive(Clone)]
struct AppState {
    registry: Arc<SourceRegistry>,
    secret: Option<Arc<str>>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Builds the application router.
///
/// `secret`, if set, is required on the directory and WebSocket routes.
/// `allowed_origins` restricts CORS; empty allows any origin.
pub fn router(
    registry: Arc<SourceRegistry>,
    secret: Option<&str>,
    allowed_origins: &[String],
) -> Router {
    let state = AppState {
        registry,
        secret: secret.filter(|s| !s.is_empty()).map(Arc::from),
    };

    Router::new()
        .route("/available-logs", get(available_logs))
        .route("/ws/{endpoint}", get(subscribe))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(cors(allowed_origins))
        .with_state(state)
}

/// Serves `app` on `listener` until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET]);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn require_secret(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(secret) = state.secret.as_deref() else {
        return next.run(request).await;
    };

    let authorized = match bearer_token(request.headers()) {
        Some(token) => secrets_match(token, secret),
        None => Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .is_some_and(|token| secrets_match(&token, secret)),
    };

    if authorized {
        next.run(request).await
    } else {
        debug!(uri = %request.uri(), "rejected request without a valid secret");
        StatusCode::UNAUTHORIZED.into_response()
    }
}

async fn available_logs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.directory())
}

async fn subscribe(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(source) = state.registry.get(&endpoint).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if source.state() == SourceState::Failed {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| feed(socket, source))
}

fn text(line: &str) -> Message {
    Message::Text(line.to_string().into())
}

/// Streams a source to one connected client until either side goes away.
async fn feed(socket: WebSocket, source: Arc<Source>) {
    let mut subscription = source.subscribe();
    let (mut sink, mut stream) = socket.split();

    info!(
        source = %source.endpoint(),
        subscriber = %subscription.id(),
        "client connected"
    );

    for line in subscription.take_replay() {
        if sink.send(text(&line)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            line = subscription.recv() => match line {
                Some(line) => {
                    if let Err(e) = sink.send(text(&line)).await {
                        debug!(source = %source.endpoint(), error = %e, "write failed");
                        break;
                    }
                }
                // Dropped for falling behind, or the source stopped.
                None => break,
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = sink.close().await;

    info!(
        source = %source.endpoint(),
        subscriber = %subscription.id(),
        "client disconnected"
    );
}
