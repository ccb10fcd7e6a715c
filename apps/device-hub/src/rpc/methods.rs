use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::RpcService;
use crate::device::{Device, DeviceFilter};
use crate::error::{HubError, HubResult};
use crate::platform::{DeviceCommand, ImageFormat, Orientation, PowerAction};
use crate::stream::{CaptureFormat, CaptureRequest, DEFAULT_QUALITY};

pub const DEVICES_LIST: &str = "devices.list";
pub const DEVICE_INFO: &str = "device.info";
pub const AGENT_START: &str = "device.agent.start";
pub const AGENT_STOP: &str = "device.agent.stop";
pub const AGENT_STATUS: &str = "device.agent.status";
pub const SCREENSHOT: &str = "device.screenshot";
pub const SCREEN_CAPTURE: &str = "device.screencapture";
pub const AUDIO_CAPTURE: &str = "device.audiocapture";
pub const IO_TAP: &str = "device.io.tap";
pub const IO_LONGPRESS: &str = "device.io.longpress";
pub const IO_SWIPE: &str = "device.io.swipe";
pub const IO_TEXT: &str = "device.io.text";
pub const IO_BUTTON: &str = "device.io.button";
pub const ORIENTATION_GET: &str = "device.io.orientation.get";
pub const ORIENTATION_SET: &str = "device.io.orientation.set";
pub const APPS_LAUNCH: &str = "device.apps.launch";
pub const APPS_TERMINATE: &str = "device.apps.terminate";
pub const APPS_LIST: &str = "device.apps.list";
pub const BOOT: &str = "device.boot";
pub const SHUTDOWN: &str = "device.shutdown";
pub const REBOOT: &str = "device.reboot";
pub const DUMP_UI: &str = "device.dump.ui";
pub const OPEN_URL: &str = "device.url";
pub const SERVER_INFO: &str = "server.info";
pub const SERVER_SHUTDOWN: &str = "server.shutdown";

pub const METHODS: &[&str] = &[
    DEVICES_LIST,
    DEVICE_INFO,
    AGENT_START,
    AGENT_STOP,
    AGENT_STATUS,
    SCREENSHOT,
    SCREEN_CAPTURE,
    AUDIO_CAPTURE,
    IO_TAP,
    IO_LONGPRESS,
    IO_SWIPE,
    IO_TEXT,
    IO_BUTTON,
    ORIENTATION_GET,
    ORIENTATION_SET,
    APPS_LAUNCH,
    APPS_TERMINATE,
    APPS_LIST,
    BOOT,
    SHUTDOWN,
    REBOOT,
    DUMP_UI,
    OPEN_URL,
    SERVER_INFO,
    SERVER_SHUTDOWN,
];

const DEFAULT_LONGPRESS_MS: u64 = 1000;
const DEFAULT_SWIPE_MS: u64 = 300;

pub fn is_known_method(method: &str) -> bool {
    METHODS.contains(&method)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Target {
    #[serde(default)]
    device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequiredTarget {
    device_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PointParams {
    x: i32,
    y: i32,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwipeParams {
    x1: i32,
    y1: i32,
    x2: i32,
    y2: i32,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TextParams {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ButtonParams {
    button: String,
}

#[derive(Debug, Deserialize)]
struct OrientationParams {
    orientation: Orientation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppParams {
    #[serde(alias = "packageName")]
    bundle_id: String,
}

#[derive(Debug, Deserialize)]
struct UrlParams {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ScreenshotParams {
    #[serde(default)]
    format: Option<ImageFormat>,
    #[serde(default)]
    quality: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ScreenCaptureParams {
    format: String,
    #[serde(default)]
    quality: Option<u32>,
    #[serde(default)]
    scale: Option<f64>,
    #[serde(default)]
    fps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AudioCaptureParams {
    format: String,
}

fn parse<T: DeserializeOwned>(params: &Option<Value>) -> HubResult<T> {
    let value = match params {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(value) => value.clone(),
    };
    serde_json::from_value(value).map_err(|err| HubError::validation(err.to_string()))
}

fn ok() -> Value {
    json!({ "status": "ok" })
}

fn non_empty(field: &str, value: String) -> HubResult<String> {
    if value.trim().is_empty() {
        Err(HubError::validation(format!("{field} must not be empty")))
    } else {
        Ok(value)
    }
}

pub(super) async fn dispatch(
    service: &RpcService,
    method: &str,
    params: Option<Value>,
) -> HubResult<Value> {
    match method {
        DEVICES_LIST => {
            let filter: DeviceFilter = parse(&params)?;
            let devices = service.registry().list(&filter).await?;
            Ok(json!({ "devices": devices }))
        }
        DEVICE_INFO => device_info(service, &params).await,
        AGENT_START => {
            let device = resolve(service, &params).await?;
            service.sessions().ensure(&device).await?;
            Ok(serde_json::to_value(service.sessions().snapshot(&device))
                .map_err(|err| HubError::Transport(err.to_string()))?)
        }
        AGENT_STOP => {
            let device = resolve(service, &params).await?;
            // Streams read from forwards owned by the session; end them first.
            service.pipeline().stop_device(&device.id);
            let stopped = service.sessions().stop(&device.id).await;
            Ok(json!({ "status": "ok", "stopped": stopped }))
        }
        AGENT_STATUS => {
            let device = resolve(service, &params).await?;
            serde_json::to_value(service.sessions().snapshot(&device))
                .map_err(|err| HubError::Transport(err.to_string()))
        }
        SCREENSHOT => screenshot(service, &params).await,
        SCREEN_CAPTURE => {
            let capture: ScreenCaptureParams = parse(&params)?;
            let format: CaptureFormat = capture.format.parse()?;
            let request =
                CaptureRequest::video(format, capture.quality, capture.scale, capture.fps)?;
            start_stream(service, &params, request).await
        }
        AUDIO_CAPTURE => {
            let capture: AudioCaptureParams = parse(&params)?;
            let format: CaptureFormat = capture.format.parse()?;
            let request = CaptureRequest::audio(format)?;
            start_stream(service, &params, request).await
        }
        IO_TAP => {
            let point: PointParams = parse(&params)?;
            run_command(service, &params, DeviceCommand::Tap { x: point.x, y: point.y }).await
        }
        IO_LONGPRESS => {
            let point: PointParams = parse(&params)?;
            let command = DeviceCommand::LongPress {
                x: point.x,
                y: point.y,
                duration_ms: point.duration_ms.unwrap_or(DEFAULT_LONGPRESS_MS),
            };
            run_command(service, &params, command).await
        }
        IO_SWIPE => {
            let swipe: SwipeParams = parse(&params)?;
            let command = DeviceCommand::Swipe {
                x1: swipe.x1,
                y1: swipe.y1,
                x2: swipe.x2,
                y2: swipe.y2,
                duration_ms: swipe.duration_ms.unwrap_or(DEFAULT_SWIPE_MS),
            };
            run_command(service, &params, command).await
        }
        IO_TEXT => {
            let text: TextParams = parse(&params)?;
            let text = non_empty("text", text.text)?;
            run_command(service, &params, DeviceCommand::Text { text }).await
        }
        IO_BUTTON => {
            let button: ButtonParams = parse(&params)?;
            let button = non_empty("button", button.button)?;
            run_command(service, &params, DeviceCommand::Button { button }).await
        }
        ORIENTATION_GET => run_command(service, &params, DeviceCommand::GetOrientation).await,
        ORIENTATION_SET => {
            let params_in: OrientationParams = parse(&params)?;
            let command = DeviceCommand::SetOrientation {
                orientation: params_in.orientation,
            };
            run_command(service, &params, command).await
        }
        APPS_LAUNCH => {
            let app: AppParams = parse(&params)?;
            let bundle_id = non_empty("bundleId", app.bundle_id)?;
            run_command(service, &params, DeviceCommand::LaunchApp { bundle_id }).await
        }
        APPS_TERMINATE => {
            let app: AppParams = parse(&params)?;
            let bundle_id = non_empty("bundleId", app.bundle_id)?;
            run_command(service, &params, DeviceCommand::TerminateApp { bundle_id }).await
        }
        APPS_LIST => run_command(service, &params, DeviceCommand::ListApps).await,
        DUMP_UI => run_command(service, &params, DeviceCommand::DumpUi).await,
        OPEN_URL => {
            let url: UrlParams = parse(&params)?;
            let url = non_empty("url", url.url)?;
            run_command(service, &params, DeviceCommand::OpenUrl { url }).await
        }
        BOOT => power(service, &params, PowerAction::Boot).await,
        SHUTDOWN => power(service, &params, PowerAction::Shutdown).await,
        REBOOT => power(service, &params, PowerAction::Reboot).await,
        SERVER_INFO => Ok(json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "sessions": service.sessions().running_count(),
            "streams": service.pipeline().tokens().active(),
            "uptimeSecs": service.uptime_secs(),
        })),
        SERVER_SHUTDOWN => Ok(json!({ "status": "shutting down" })),
        other => Err(HubError::MethodNotFound(other.to_string())),
    }
}

async fn resolve(service: &RpcService, params: &Option<Value>) -> HubResult<Device> {
    let target: Target = parse(params)?;
    service.registry().resolve(target.device_id.as_deref()).await
}

async fn device_info(service: &RpcService, params: &Option<Value>) -> HubResult<Value> {
    let device = resolve(service, params).await?;
    let mut metadata = service.registry().metadata().get(&device.id);
    if metadata.is_none() && device.is_booted() {
        let platform = service.registry().platform(device.platform)?;
        match platform.fetch_metadata(&device).await {
            Ok(fetched) => {
                service.registry().metadata().put(&device.id, fetched.clone());
                metadata = Some(fetched);
            }
            Err(err) => debug!(device_id = %device.id, error = %err, "metadata unavailable"),
        }
    }

    let mut result = json!({ "device": device });
    if let Some(metadata) = metadata {
        result["metadata"] = json!(metadata);
    }
    let snapshot = service.sessions().snapshot(&device);
    if snapshot.state != crate::session::LifecycleState::Absent || snapshot.last_error.is_some() {
        result["session"] = json!(snapshot);
    }
    Ok(result)
}

async fn screenshot(service: &RpcService, params: &Option<Value>) -> HubResult<Value> {
    let shot: ScreenshotParams = parse(params)?;
    let format = shot.format.unwrap_or_default();
    let quality = match shot.quality.unwrap_or(0) {
        0 => DEFAULT_QUALITY,
        q @ 1..=100 => q as u8,
        q => return Err(HubError::validation(format!("quality must be 1-100, got {q}"))),
    };
    let device = resolve(service, params).await?;
    let image = service
        .sessions()
        .with_agent(&device, |handle| async move {
            handle
                .platform
                .screenshot(&handle.endpoint, format, quality)
                .await
        })
        .await?;
    Ok(json!({ "format": format, "data": BASE64.encode(image) }))
}

async fn start_stream(
    service: &RpcService,
    params: &Option<Value>,
    request: CaptureRequest,
) -> HubResult<Value> {
    let device = resolve(service, params).await?;
    let redirect = service.pipeline().start(&device, request).await?;
    serde_json::to_value(redirect).map_err(|err| HubError::Transport(err.to_string()))
}

async fn run_command(
    service: &RpcService,
    params: &Option<Value>,
    command: DeviceCommand,
) -> HubResult<Value> {
    let device = resolve(service, params).await?;
    let output = service
        .sessions()
        .with_agent(&device, |handle| {
            let command = command.clone();
            async move { handle.platform.execute(&handle.endpoint, &command).await }
        })
        .await?;
    Ok(shape_result(&command, output))
}

/// Agents answer in slightly different shapes; callers get one.
fn shape_result(command: &DeviceCommand, output: Value) -> Value {
    match command {
        DeviceCommand::GetOrientation => {
            let orientation = output
                .get("orientation")
                .cloned()
                .unwrap_or(output);
            json!({ "orientation": orientation })
        }
        DeviceCommand::ListApps => {
            let apps = output.get("apps").cloned().unwrap_or(output);
            json!({ "apps": as_array(apps) })
        }
        DeviceCommand::DumpUi => {
            let elements = output.get("elements").cloned().unwrap_or(output);
            json!({ "elements": as_array(elements) })
        }
        _ => ok(),
    }
}

fn as_array(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        Value::Null => Value::Array(Vec::new()),
        other => Value::Array(vec![other]),
    }
}

async fn power(service: &RpcService, params: &Option<Value>, action: PowerAction) -> HubResult<Value> {
    let target: RequiredTarget = parse(params)?;
    let device_id = non_empty("deviceId", target.device_id)?;
    let device = service.registry().resolve(Some(&device_id)).await?;
    let platform = service.registry().platform(device.platform)?;

    // A device that is going down cannot keep hosting its agent.
    if matches!(action, PowerAction::Shutdown | PowerAction::Reboot) {
        service.pipeline().stop_device(&device.id);
        service.sessions().stop(&device.id).await;
    }
    platform
        .power(&device, action)
        .await
        .map_err(|err| HubError::device(device.id.clone(), err))?;
    service.registry().metadata().invalidate(&device.id);
    info!(device_id = %device.id, ?action, "power action completed");
    Ok(ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn method_table_has_no_duplicates() {
        let mut methods = METHODS.to_vec();
        methods.sort_unstable();
        methods.dedup();
        assert_eq!(methods.len(), METHODS.len());
        assert!(is_known_method("device.io.tap"));
        assert!(!is_known_method("device.io.teleport"));
    }

    #[test_timeout::timeout]
    fn missing_params_parse_as_empty_object() {
        let target: Target = parse(&None).unwrap();
        assert!(target.device_id.is_none());
        let err = parse::<PointParams>(&Some(json!({ "x": 1 }))).unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test_timeout::timeout]
    fn command_results_are_normalized() {
        let shaped = shape_result(&DeviceCommand::GetOrientation, json!("landscape"));
        assert_eq!(shaped, json!({ "orientation": "landscape" }));
        let shaped = shape_result(&DeviceCommand::ListApps, json!({ "apps": ["a", "b"] }));
        assert_eq!(shaped["apps"].as_array().unwrap().len(), 2);
        let shaped = shape_result(&DeviceCommand::DumpUi, Value::Null);
        assert_eq!(shaped, json!({ "elements": [] }));
        let shaped = shape_result(&DeviceCommand::Tap { x: 1, y: 2 }, Value::Null);
        assert_eq!(shaped, json!({ "status": "ok" }));
    }

    #[test_timeout::timeout]
    fn app_params_accept_package_name() {
        let app: AppParams = parse(&Some(json!({ "packageName": "com.example" }))).unwrap();
        assert_eq!(app.bundle_id, "com.example");
    }
}
