//! Operator web API
//!
//! Read side: current state snapshot plus an SSE stream of state changes.
//! Write side: mode/profile/manual/reset/dump commands forwarded to the
//! cycle driver over its command channel. The static dashboard is served
//! from the configured directory.

use crate::config::WebConfig;
use crate::controller::{ManualCommand, Mode};
use crate::driver::{DriverCommand, DriverHandle};
use crate::error::{HestiaError, Result};
use crate::logging::{get_logger, subscribe_log_lines};
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct AppState {
    handle: DriverHandle,
}

/// Bind and serve until the process exits
pub async fn serve(config: WebConfig, handle: DriverHandle) -> Result<()> {
    let logger = get_logger("web");
    let app = router(handle, &config.static_dir);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    logger.info(&format!("listening on http://{}", addr));
    axum::serve(listener, app)
        .await
        .map_err(|e| HestiaError::io(e.to_string()))
}

fn router(handle: DriverHandle, static_dir: &str) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(api_state))
        .route("/api/events", get(api_events))
        .route("/api/logs", get(api_logs))
        .route("/api/mode", post(api_mode))
        .route("/api/profile", post(api_profile))
        .route("/api/manual", post(api_manual))
        .route("/api/reset", post(api_reset))
        .route("/api/blackbox/dump", post(api_blackbox_dump))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { handle })
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("APP_VERSION") }))
}

async fn api_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.handle.state.borrow().clone();
    Json(json!(snapshot))
}

async fn api_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.handle.state.clone()).map(|snapshot| {
        let event = Event::default()
            .json_data(&snapshot)
            .unwrap_or_else(|_| Event::default());
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Live log lines; lagging subscribers silently skip dropped lines
async fn api_logs() -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(subscribe_log_lines())
        .filter_map(|line| line.ok())
        .map(|line| Ok(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    mode: Mode,
}

async fn api_mode(
    State(state): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    send(&state, DriverCommand::SetMode(request.mode))
}

#[derive(Debug, Deserialize)]
struct ProfileRequest {
    profile: usize,
}

async fn api_profile(
    State(state): State<AppState>,
    Json(request): Json<ProfileRequest>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    send(&state, DriverCommand::SelectProfile(request.profile))
}

async fn api_manual(
    State(state): State<AppState>,
    Json(command): Json<ManualCommand>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    send(&state, DriverCommand::Manual(command))
}

async fn api_reset(
    State(state): State<AppState>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    send(&state, DriverCommand::ResetError)
}

async fn api_blackbox_dump(
    State(state): State<AppState>,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    send(&state, DriverCommand::DumpBlackbox)
}

fn send(
    state: &AppState,
    command: DriverCommand,
) -> std::result::Result<Json<serde_json::Value>, StatusCode> {
    state
        .handle
        .commands
        .send(command)
        .map(|_| Json(json!({ "ok": true })))
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverState;
    use http_body_util::BodyExt;
    use tokio::sync::{mpsc, watch};
    use tower::ServiceExt;

    fn test_router() -> (
        Router,
        mpsc::UnboundedReceiver<DriverCommand>,
        watch::Sender<DriverState>,
    ) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(DriverState::default());
        let handle = DriverHandle {
            commands,
            state: state_rx,
        };
        (router(handle, "web"), commands_rx, state_tx)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (app, _rx, _tx) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_state_endpoint() {
        let (app, _rx, _tx) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/state")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["mode"], "off");
        assert_eq!(json["state"], "init");
    }

    #[tokio::test]
    async fn test_mode_command_is_forwarded() {
        let (app, mut rx, _tx) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/mode")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"mode":"auto"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap(), DriverCommand::SetMode(Mode::Auto));
    }

    #[tokio::test]
    async fn test_manual_command_is_forwarded() {
        let (app, mut rx, _tx) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/manual")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(
                        r#"{"set_p":-300.0,"command":"sleep"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        match rx.try_recv().unwrap() {
            DriverCommand::Manual(manual) => {
                assert_eq!(manual.set_p, -300.0);
                assert!(manual.command.is_some());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_mode_rejected() {
        let (app, _rx, _tx) = test_router();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/api/mode")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(r#"{"mode":"turbo"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
