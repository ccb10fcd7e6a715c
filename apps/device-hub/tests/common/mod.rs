#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use device_hub::device::{DeviceKind, DeviceState, Platform};
use device_hub::platform::mock::MockPlatform;
use device_hub::platform::Platforms;
use device_hub::ports::PortAllocator;
use device_hub::registry::{DeviceRegistry, MetadataCache};
use device_hub::rpc::RpcService;
use device_hub::server::{router, AppState};
use device_hub::session::{SessionConfig, SessionManager};
use device_hub::stream::{StreamConfig, StreamPipeline};

pub const BOOTED_ANDROID: &str = "emulator-5554";
pub const OFFLINE_ANDROID: &str = "Pixel_7_API_34";
pub const BOOTED_SIMULATOR: &str = "5A0C3E7E-0000-4000-8000-000000000001";

pub struct Harness {
    pub android: Arc<MockPlatform>,
    pub ios: Arc<MockPlatform>,
    pub registry: DeviceRegistry,
    pub sessions: SessionManager,
    pub pipeline: StreamPipeline,
    pub service: RpcService,
}

pub fn fast_sessions() -> SessionConfig {
    SessionConfig {
        start_timeout: Duration::from_millis(300),
        probe_initial_backoff: Duration::from_millis(5),
        probe_max_backoff: Duration::from_millis(20),
        start_retries: 1,
        health_interval: Duration::from_secs(3600),
    }
}

/// One booted and one offline Android emulator; no iOS devices.
pub fn harness() -> Harness {
    build(
        MockPlatform::new(Platform::Android).with_devices(vec![
            MockPlatform::device(BOOTED_ANDROID, DeviceKind::Emulator, DeviceState::Booted),
            MockPlatform::device(OFFLINE_ANDROID, DeviceKind::Emulator, DeviceState::Offline),
        ]),
        MockPlatform::new(Platform::Ios),
    )
}

/// Adds a booted iOS simulator so device selection becomes ambiguous.
pub fn harness_with_simulator() -> Harness {
    build(
        MockPlatform::new(Platform::Android).with_devices(vec![MockPlatform::device(
            BOOTED_ANDROID,
            DeviceKind::Emulator,
            DeviceState::Booted,
        )]),
        MockPlatform::new(Platform::Ios).with_devices(vec![MockPlatform::device(
            BOOTED_SIMULATOR,
            DeviceKind::Simulator,
            DeviceState::Booted,
        )]),
    )
}

pub fn build(android: MockPlatform, ios: MockPlatform) -> Harness {
    let android = Arc::new(android);
    let ios = Arc::new(ios);
    let platforms = Platforms::new().with(android.clone()).with(ios.clone());
    let metadata = MetadataCache::new(Duration::from_secs(300));
    let registry = DeviceRegistry::new(platforms.clone(), metadata.clone());
    let allocator = PortAllocator::without_bind_check(41000..=41063);
    let sessions = SessionManager::new(platforms, allocator, metadata, fast_sessions());
    let pipeline = StreamPipeline::new(
        registry.clone(),
        sessions.clone(),
        StreamConfig {
            idle_timeout: Duration::from_secs(5),
            ..StreamConfig::default()
        },
    );
    let service = RpcService::new(
        registry.clone(),
        sessions.clone(),
        pipeline.clone(),
        CancellationToken::new(),
    );
    Harness {
        android,
        ios,
        registry,
        sessions,
        pipeline,
        service,
    }
}

impl Harness {
    pub fn router(&self) -> Router {
        router(Arc::new(AppState {
            service: self.service.clone(),
            metrics: None,
        }))
    }
}

pub async fn post_raw(app: &Router, body: String) -> (StatusCode, Option<Value>) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/rpc")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .expect("build rpc request"),
        )
        .await
        .expect("send rpc request");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read rpc body")
        .to_bytes();
    let value = if bytes.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(&bytes).expect("rpc body is json"))
    };
    (status, value)
}

/// Sends one request with id 1 and returns the decoded response object.
pub async fn call(app: &Router, method: &str, params: Value) -> Value {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let (status, value) = post_raw(app, body.to_string()).await;
    assert_eq!(status, StatusCode::OK);
    value.expect("response body")
}

pub async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .uri(uri)
                .body(Body::empty())
                .expect("build get request"),
        )
        .await
        .expect("send get request")
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
