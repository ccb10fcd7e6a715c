//! HTTP surface: `POST /rpc`, `GET /ws`, `GET /session?s=<token>`, plus
//! `/healthz` and `/metrics`.

use std::convert::Infallible;
use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, increment_gauge};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::ports::PortAllocator;
use crate::registry::{DeviceRegistry, MetadataCache};
use crate::rpc::protocol::{JsonRpcResponse, ERROR_INTERNAL};
use crate::rpc::RpcService;
use crate::session::SessionManager;
use crate::stream::StreamPipeline;

const OUTBOUND_DEPTH: usize = 64;
const WRITER_DRAIN: Duration = Duration::from_secs(2);

pub struct AppState {
    pub service: RpcService,
    pub metrics: Option<PrometheusHandle>,
}

/// Wires registry, sessions and pipeline together for `config`.
pub fn build_service(config: &ServerConfig, shutdown: CancellationToken) -> RpcService {
    let platforms = config.build_platforms();
    let metadata = MetadataCache::new(config.metadata_ttl);
    let registry = DeviceRegistry::new(platforms.clone(), metadata.clone());
    let allocator = PortAllocator::new(config.port_range.clone());
    let sessions = SessionManager::new(platforms, allocator, metadata, config.session.clone());
    let pipeline = StreamPipeline::new(registry.clone(), sessions.clone(), config.stream.clone());
    RpcService::new(registry, sessions, pipeline, shutdown)
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .route("/session", get(session_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let service = build_service(&config, shutdown.clone());

    let reclaimed = service.sessions().reclaim_stale_forwards().await;
    if reclaimed > 0 {
        info!(reclaimed, "reclaimed stale port forwards");
    }

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
    let local_addr = listener.local_addr().context("failed to read listener address")?;

    serve(listener, service, metrics, config.shutdown_grace).await?;
    info!(%local_addr, "device-hub stopped");
    Ok(())
}

/// Serves until a signal or `server.shutdown`, then runs the shutdown
/// sequence: streams, listener, sessions.
pub async fn serve(
    listener: tokio::net::TcpListener,
    service: RpcService,
    metrics: Option<PrometheusHandle>,
    grace: Duration,
) -> Result<()> {
    let shutdown = service.shutdown_token().clone();
    let recycler = service
        .pipeline()
        .tokens()
        .spawn_recycler(recycle_interval(service.pipeline().tokens().idle_timeout()));
    let health = service.sessions().spawn_health_monitor();

    let state = Arc::new(AppState {
        service: service.clone(),
        metrics,
    });
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "device-hub listening");
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                signal_token.cancel();
            }
            _ = signal_token.cancelled() => {}
        }
    });

    let drain_token = shutdown.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { drain_token.cancelled().await })
            .into_future(),
    );

    let early_exit = tokio::select! {
        result = &mut server => Some(result),
        _ = shutdown.cancelled() => None,
    };
    if let Some(result) = early_exit {
        recycler.abort();
        health.abort();
        result.context("server task panicked")?.context("server exited with error")?;
        return Ok(());
    }

    wind_down(&service, &mut server, grace).await;
    recycler.abort();
    health.abort();
    info!("graceful shutdown complete");
    Ok(())
}

/// Ends open streams, then drains the listener while sessions tear down.
/// Both share one grace period.
async fn wind_down(
    service: &RpcService,
    server: &mut JoinHandle<std::io::Result<()>>,
    grace: Duration,
) {
    // Open stream bodies never finish on their own.
    service.pipeline().tokens().cancel_all();
    let drain = async {
        match tokio::time::timeout(grace, &mut *server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => warn!(error = %err, "server exited with error during shutdown"),
            Ok(Err(err)) => warn!(error = %err, "server task failed during shutdown"),
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "connections still open after grace period; closing listener"
                );
                server.abort();
            }
        }
    };
    tokio::join!(drain, service.sessions().shutdown_all(grace));
}

fn recycle_interval(idle_timeout: Duration) -> Duration {
    (idle_timeout / 2).max(Duration::from_millis(100))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn encode(response: &JsonRpcResponse) -> String {
    // Our response types always serialize.
    serde_json::to_string(response).unwrap_or_else(|err| {
        json!({
            "jsonrpc": "2.0",
            "id": null,
            "error": { "code": ERROR_INTERNAL, "message": err.to_string() }
        })
        .to_string()
    })
}

async fn rpc_handler(State(state): State<Arc<AppState>>, body: String) -> Response {
    let reply = state.service.handle_text(&body).await;
    if reply.shutdown_requested {
        // Graceful shutdown still lets this response reach the client.
        state.service.request_shutdown();
    }
    match reply.response {
        Some(response) => Json(response).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

struct Outbound {
    text: String,
    shutdown_after: bool,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let service = state.service.clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(OUTBOUND_DEPTH);

    increment_gauge!("device_hub_ws_connections", 1.0);
    info!(%connection_id, "websocket connected");

    let writer_service = service.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            if ws_tx.send(Message::Text(outbound.text)).await.is_err() {
                break;
            }
            if outbound.shutdown_after {
                writer_service.request_shutdown();
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = service.shutdown_token().cancelled() => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(frame))) => {
                debug!(
                    %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                warn!(%connection_id, error = %err, "error receiving websocket message");
                break;
            }
            None => break,
        };

        counter!("device_hub_ws_messages_total", 1);
        let service = service.clone();
        let tx = tx.clone();
        // Each request runs on its own; responses go out in completion order.
        tokio::spawn(async move {
            let reply = service.handle_text(&text).await;
            match reply.response {
                Some(response) => {
                    let outbound = Outbound {
                        text: encode(&response),
                        shutdown_after: reply.shutdown_requested,
                    };
                    if tx.send(outbound).await.is_err() && reply.shutdown_requested {
                        service.request_shutdown();
                    }
                }
                None if reply.shutdown_requested => service.request_shutdown(),
                None => {}
            }
        });
    }

    drop(tx);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
    decrement_gauge!("device_hub_ws_connections", 1.0);
    info!(%connection_id, "websocket closed");
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    s: String,
}

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(claimed) = state.service.pipeline().tokens().claim(&query.s) else {
        counter!("device_hub_stream_claims_total", 1, "outcome" => "not_found");
        return (StatusCode::NOT_FOUND, "unknown or expired stream token").into_response();
    };
    counter!("device_hub_stream_claims_total", 1, "outcome" => "ok");
    debug!(device_id = %claimed.device_id, "stream claimed");

    let body = Body::from_stream(ReceiverStream::new(claimed.receiver).map(Ok::<_, Infallible>));
    (
        [
            (header::CONTENT_TYPE, claimed.content_type),
            (header::CACHE_CONTROL, "no-store"),
        ],
        body,
    )
        .into_response()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let service = &state.service;
    let status = if service.shutdown_token().is_cancelled() {
        "shutting_down"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "sessions": service.sessions().running_count(),
        "streams": service.pipeline().tokens().active(),
    }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::device::{DeviceKind, DeviceState, Platform};
    use crate::platform::mock::MockPlatform;
    use crate::platform::Platforms;
    use crate::session::SessionConfig;
    use crate::stream::StreamConfig;

    fn mock_service(mock: Arc<MockPlatform>) -> RpcService {
        let platforms = Platforms::new().with(mock);
        let metadata = MetadataCache::new(Duration::from_secs(60));
        let registry = DeviceRegistry::new(platforms.clone(), metadata.clone());
        let sessions = SessionManager::new(
            platforms,
            PortAllocator::without_bind_check(46000..=46020),
            metadata,
            SessionConfig {
                start_timeout: Duration::from_millis(300),
                probe_initial_backoff: Duration::from_millis(5),
                probe_max_backoff: Duration::from_millis(20),
                start_retries: 1,
                health_interval: Duration::from_secs(3600),
            },
        );
        let pipeline = StreamPipeline::new(registry.clone(), sessions.clone(), StreamConfig::default());
        RpcService::new(registry, sessions, pipeline, CancellationToken::new())
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn wind_down_spends_one_grace_period() {
        let device =
            MockPlatform::device("emulator-5554", DeviceKind::Emulator, DeviceState::Booted);
        let mock = Arc::new(
            MockPlatform::new(Platform::Android).with_devices(vec![device.clone()]),
        );
        let service = mock_service(mock.clone());
        service.sessions().ensure(&device).await.unwrap();
        mock.set_close_delay(Duration::from_millis(600));

        // A listener that never drains on its own.
        let mut server = tokio::spawn(std::future::pending::<std::io::Result<()>>());
        let grace = Duration::from_secs(1);
        let started = Instant::now();
        wind_down(&service, &mut server, grace).await;

        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(service.sessions().running_count(), 0);
        assert_eq!(service.sessions().allocator().active_leases(), 0);
        assert_eq!(mock.live_processes(), 0);
        assert!(server.await.unwrap_err().is_cancelled());
    }
}
