//! JSON-RPC 2.0 front end shared by the HTTP and WebSocket transports.

mod methods;
pub mod protocol;

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::HubError;
use crate::registry::DeviceRegistry;
use crate::session::SessionManager;
use crate::stream::StreamPipeline;

pub use self::methods::{is_known_method, METHODS, SERVER_SHUTDOWN};
use self::protocol::{decode_request, hub_error, success, JsonRpcRequest, JsonRpcResponse};

/// Outcome of one inbound frame.
#[derive(Debug)]
pub struct Reply {
    /// `None` for notifications.
    pub response: Option<JsonRpcResponse>,
    /// Set by `server.shutdown`; the transport triggers shutdown once the
    /// response has been written.
    pub shutdown_requested: bool,
}

impl Reply {
    fn respond(response: JsonRpcResponse) -> Self {
        Self {
            response: Some(response),
            shutdown_requested: false,
        }
    }
}

#[derive(Clone)]
pub struct RpcService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    registry: DeviceRegistry,
    sessions: SessionManager,
    pipeline: StreamPipeline,
    shutdown: CancellationToken,
    started_at: Instant,
}

impl RpcService {
    pub fn new(
        registry: DeviceRegistry,
        sessions: SessionManager,
        pipeline: StreamPipeline,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                sessions,
                pipeline,
                shutdown,
                started_at: Instant::now(),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    pub fn pipeline(&self) -> &StreamPipeline {
        &self.inner.pipeline
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    pub fn request_shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("shutdown requested over JSON-RPC");
            self.inner.shutdown.cancel();
        }
    }

    pub async fn handle_text(&self, raw: &str) -> Reply {
        match decode_request(raw) {
            Ok(request) => self.handle(request).await,
            Err(response) => {
                counter!("device_hub_rpc_rejected_total", 1);
                debug!(?response, "rejected malformed JSON-RPC frame");
                Reply::respond(response)
            }
        }
    }

    pub async fn handle(&self, request: JsonRpcRequest) -> Reply {
        let notification = request.is_notification();
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        let label = if is_known_method(&method) {
            method.clone()
        } else {
            "unknown".to_string()
        };
        let started = Instant::now();
        let span = info_span!("rpc", method = %method);
        let outcome = self.dispatch(&method, params).instrument(span).await;
        let elapsed = started.elapsed().as_secs_f64();

        let response = match outcome {
            Ok(result) => {
                counter!("device_hub_rpc_requests_total", 1, "method" => label.clone(), "outcome" => "ok");
                histogram!("device_hub_rpc_duration_seconds", elapsed, "method" => label);
                id.map(|id| success(id, result))
            }
            Err(err) => {
                counter!(
                    "device_hub_rpc_requests_total",
                    1,
                    "method" => label.clone(),
                    "outcome" => err.metric_label()
                );
                histogram!("device_hub_rpc_duration_seconds", elapsed, "method" => label);
                warn!(
                    method = %method,
                    device_id = err.device_id().unwrap_or("-"),
                    error = %err,
                    "request failed"
                );
                // Notifications never get a response, not even an error.
                if notification {
                    None
                } else {
                    Some(hub_error(id, &method, &err))
                }
            }
        };

        Reply {
            response,
            shutdown_requested: method == SERVER_SHUTDOWN,
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, HubError> {
        if self.inner.shutdown.is_cancelled() && method != methods::SERVER_INFO {
            return Err(HubError::ShuttingDown);
        }
        methods::dispatch(self, method, params).await
    }
}
