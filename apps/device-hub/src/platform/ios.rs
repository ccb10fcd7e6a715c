//! iOS simulators (`xcrun simctl`) and real devices (go-ios `ios`).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use super::agent_client::AgentClient;
use super::capture;
use super::relay::TcpRelay;
use super::runner::{run_checked, ChildProcess, DEFAULT_TOOL_TIMEOUT};
use super::{
    AgentEndpoint, AgentPlan, Capabilities, DeviceCommand, DevicePlatform, ImageFormat,
    PlatformError, PowerAction, Resource,
};
use crate::device::{Device, DeviceKind, DeviceMetadata, DeviceState, Platform};
use crate::stream::{CaptureFormat, CaptureRequest, CaptureSink};

const AGENT_CONTROL_PORT: u16 = 8100;
const AGENT_VIDEO_PORT: u16 = 9100;
const AGENT_BUNDLE_ID: &str = "com.devicehub.agent.xctrunner";
const AGENT_TEST_CONFIG: &str = "DeviceHubAgent.xctest";
/// Real devices on iOS 17+ are only reachable through a userspace tunnel.
const TUNNEL_MIN_MAJOR: u32 = 17;
const TUNNEL_READY_TIMEOUT: Duration = Duration::from_secs(15);
const BOOT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct IosTools {
    pub xcrun: String,
    pub go_ios: String,
}

impl Default for IosTools {
    fn default() -> Self {
        Self {
            xcrun: "xcrun".to_string(),
            go_ios: "ios".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SimctlList {
    #[serde(default)]
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(default = "available")]
    is_available: bool,
    #[serde(default)]
    device_type_identifier: Option<String>,
}

fn available() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoIosList {
    #[serde(default)]
    device_list: Vec<GoIosDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GoIosDevice {
    udid: String,
    #[serde(default)]
    device_name: Option<String>,
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    product_version: Option<String>,
}

/// `com.apple.CoreSimulator.SimRuntime.iOS-17-2` -> `Some("17.2")`.
pub fn runtime_version(runtime: &str) -> Option<String> {
    let suffix = runtime.rsplit('.').next()?;
    let (family, version) = suffix.split_once('-')?;
    if family != "iOS" {
        return None;
    }
    Some(version.replace('-', "."))
}

pub fn parse_simctl(output: &str) -> Result<Vec<Device>, PlatformError> {
    let list: SimctlList = serde_json::from_str(output)
        .map_err(|err| PlatformError::Agent(format!("simctl list: {err}")))?;
    let mut devices = Vec::new();
    for (runtime, entries) in list.devices {
        let Some(os_version) = runtime_version(&runtime) else {
            continue;
        };
        for entry in entries.into_iter().filter(|entry| entry.is_available) {
            devices.push(Device {
                id: entry.udid,
                platform: Platform::Ios,
                kind: DeviceKind::Simulator,
                state: if entry.state == "Booted" {
                    DeviceState::Booted
                } else {
                    DeviceState::Offline
                },
                name: entry.name,
                os_version: os_version.clone(),
            });
        }
    }
    Ok(devices)
}

pub fn parse_go_ios(output: &str) -> Result<Vec<Device>, PlatformError> {
    // go-ios prints log lines before the JSON document.
    let json_start = output.find('{').unwrap_or(0);
    let list: GoIosList = serde_json::from_str(output[json_start..].trim())
        .map_err(|err| PlatformError::Agent(format!("ios list: {err}")))?;
    Ok(list
        .device_list
        .into_iter()
        .map(|entry| Device {
            name: entry
                .device_name
                .or(entry.product_type)
                .unwrap_or_else(|| entry.udid.clone()),
            id: entry.udid,
            platform: Platform::Ios,
            kind: DeviceKind::Real,
            state: DeviceState::Booted,
            os_version: entry.product_version.unwrap_or_default(),
        })
        .collect())
}

pub struct IosPlatform {
    tools: IosTools,
}

impl IosPlatform {
    pub fn new(tools: IosTools) -> Self {
        Self { tools }
    }

    async fn simctl(&self, args: &[&str]) -> Result<String, PlatformError> {
        let mut full = vec!["simctl"];
        full.extend_from_slice(args);
        Ok(run_checked(&self.tools.xcrun, &full, DEFAULT_TOOL_TIMEOUT)
            .await?
            .stdout_text())
    }

    async fn go_ios(&self, args: &[&str]) -> Result<String, PlatformError> {
        Ok(run_checked(&self.tools.go_ios, args, DEFAULT_TOOL_TIMEOUT)
            .await?
            .stdout_text())
    }

    async fn simulators(&self) -> Result<Vec<Device>, PlatformError> {
        parse_simctl(&self.simctl(&["list", "devices", "--json"]).await?)
    }

    async fn real_devices(&self) -> Result<Vec<Device>, PlatformError> {
        parse_go_ios(&self.go_ios(&["list", "--details"]).await?)
    }

    async fn wait_for_tunnel(&self, udid: &str) -> Result<(), PlatformError> {
        let deadline = Instant::now() + TUNNEL_READY_TIMEOUT;
        let mut backoff = Duration::from_millis(200);
        loop {
            if let Ok(output) = self.go_ios(&["tunnel", "ls"]).await {
                if output.contains(udid) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(PlatformError::Timeout(format!("tunnel for {udid}")));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(2));
        }
    }

    fn is_simulator(device: &Device) -> bool {
        device.kind == DeviceKind::Simulator
    }
}

#[async_trait]
impl DevicePlatform for IosPlatform {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    async fn enumerate(&self, include_offline: bool) -> Result<Vec<Device>, PlatformError> {
        let (simulators, real) = tokio::join!(self.simulators(), self.real_devices());
        let mut devices = Vec::new();
        match (simulators, real) {
            (Err(sim_err), Err(real_err)) => {
                debug!(error = %real_err, "go-ios enumeration failed");
                return Err(sim_err);
            }
            (simulators, real) => {
                for result in [simulators, real] {
                    match result {
                        Ok(found) => devices.extend(found),
                        Err(err) => debug!(error = %err, "partial iOS enumeration"),
                    }
                }
            }
        }
        devices.retain(|device| include_offline || device.is_booted());
        Ok(devices)
    }

    fn agent_plan(&self, device: &Device) -> AgentPlan {
        AgentPlan {
            requires_tunnel: device.kind == DeviceKind::Real
                && device.os_major() >= TUNNEL_MIN_MAJOR,
            control_port: AGENT_CONTROL_PORT,
            video_port: AGENT_VIDEO_PORT,
            audio_port: 0,
        }
    }

    fn capabilities(&self, _device: &Device) -> Capabilities {
        Capabilities {
            formats: vec![CaptureFormat::Mjpeg],
        }
    }

    async fn open_tunnel(&self, device: &Device) -> Result<Box<dyn Resource>, PlatformError> {
        let udid_arg = format!("--udid={}", device.id);
        let process = ChildProcess::spawn(
            format!("tunnel {}", device.id),
            &self.tools.go_ios,
            &["tunnel", "start", "--userspace", &udid_arg],
        )?;
        let process: Box<dyn Resource> = Box::new(process);
        if let Err(err) = self.wait_for_tunnel(&device.id).await {
            if let Err(close_err) = process.close().await {
                warn!(device_id = %device.id, error = %close_err, "failed to stop tunnel");
            }
            return Err(err);
        }
        Ok(process)
    }

    async fn forward(
        &self,
        device: &Device,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        if Self::is_simulator(device) {
            // Simulators share the host loopback.
            let target = SocketAddr::from(([127, 0, 0, 1], remote_port));
            return Ok(Box::new(TcpRelay::bind(local_port, target).await?));
        }
        let udid_arg = format!("--udid={}", device.id);
        let local = local_port.to_string();
        let remote = remote_port.to_string();
        let process = ChildProcess::spawn(
            format!("ios forward {} {local} -> {remote}", device.id),
            &self.tools.go_ios,
            &["forward", &udid_arg, &local, &remote],
        )?;
        Ok(Box::new(process))
    }

    async fn probe(&self, endpoint: &AgentEndpoint) -> bool {
        AgentClient::new(endpoint.control_port).is_alive().await
    }

    async fn launch_agent(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        let device = &endpoint.device;
        let process = if Self::is_simulator(device) {
            ChildProcess::spawn(
                format!("agent {}", device.id),
                &self.tools.xcrun,
                &["simctl", "launch", "--console", &device.id, AGENT_BUNDLE_ID],
            )?
        } else {
            let udid_arg = format!("--udid={}", device.id);
            let bundle_arg = format!("--bundleid={AGENT_BUNDLE_ID}");
            let runner_arg = format!("--testrunnerbundleid={AGENT_BUNDLE_ID}");
            let config_arg = format!("--xctestconfig={AGENT_TEST_CONFIG}");
            ChildProcess::spawn(
                format!("agent {}", device.id),
                &self.tools.go_ios,
                &["runwda", &bundle_arg, &runner_arg, &config_arg, &udid_arg],
            )?
        };
        Ok(Box::new(process))
    }

    async fn fetch_metadata(&self, device: &Device) -> Result<DeviceMetadata, PlatformError> {
        if Self::is_simulator(device) {
            let output = self.simctl(&["list", "devices", "--json"]).await?;
            let list: SimctlList = serde_json::from_str(&output)
                .map_err(|err| PlatformError::Agent(format!("simctl list: {err}")))?;
            let model = list
                .devices
                .values()
                .flatten()
                .find(|entry| entry.udid == device.id)
                .and_then(|entry| entry.device_type_identifier.clone())
                .map(|identifier| {
                    identifier
                        .rsplit('.')
                        .next()
                        .unwrap_or(&identifier)
                        .replace('-', " ")
                });
            return Ok(DeviceMetadata {
                name: device.name.clone(),
                os_version: device.os_version.clone(),
                model,
                screen: None,
            });
        }

        let udid_arg = format!("--udid={}", device.id);
        let output = self.go_ios(&["info", &udid_arg]).await?;
        let json_start = output.find('{').unwrap_or(0);
        let info: Value = serde_json::from_str(output[json_start..].trim())
            .map_err(|err| PlatformError::Agent(format!("ios info: {err}")))?;
        let field = |key: &str| info.get(key).and_then(Value::as_str).map(str::to_string);
        Ok(DeviceMetadata {
            name: field("DeviceName").unwrap_or_else(|| device.name.clone()),
            os_version: field("ProductVersion").unwrap_or_else(|| device.os_version.clone()),
            model: field("ProductType"),
            screen: None,
        })
    }

    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        command: &DeviceCommand,
    ) -> Result<Value, PlatformError> {
        let device = &endpoint.device;
        if Self::is_simulator(device) {
            match command {
                DeviceCommand::OpenUrl { url } => {
                    self.simctl(&["openurl", &device.id, url]).await?;
                    return Ok(Value::Null);
                }
                DeviceCommand::LaunchApp { bundle_id } => {
                    self.simctl(&["launch", &device.id, bundle_id]).await?;
                    return Ok(Value::Null);
                }
                DeviceCommand::TerminateApp { bundle_id } => {
                    self.simctl(&["terminate", &device.id, bundle_id]).await?;
                    return Ok(Value::Null);
                }
                _ => {}
            }
        }
        AgentClient::new(endpoint.control_port)
            .call(command.agent_method(), command.agent_params())
            .await
    }

    async fn screenshot(
        &self,
        endpoint: &AgentEndpoint,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, PlatformError> {
        let result = AgentClient::new(endpoint.control_port)
            .call("screenshot", json!({ "format": format, "quality": quality }))
            .await?;
        let data = result
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| PlatformError::Agent("screenshot: missing data".to_string()))?;
        BASE64
            .decode(data)
            .map_err(|err| PlatformError::Agent(format!("screenshot: invalid base64: {err}")))
    }

    async fn capture(
        &self,
        endpoint: &AgentEndpoint,
        stream_port: u16,
        request: &CaptureRequest,
        sink: &mut CaptureSink,
    ) -> Result<(), PlatformError> {
        if request.format != CaptureFormat::Mjpeg {
            return Err(PlatformError::Unsupported(format!(
                "{} capture on iOS",
                request.format
            )));
        }
        AgentClient::new(endpoint.control_port)
            .call(
                "stream.configure",
                json!({
                    "quality": request.quality,
                    "scale": request.scale,
                    "fps": request.fps,
                }),
            )
            .await?;

        let mut socket = capture::connect(stream_port).await?;
        socket
            .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
            .await?;
        let mut reader = BufReader::new(socket);
        capture::skip_http_head(&mut reader).await?;
        sink.progress("mjpeg stream connected");
        capture::pump_raw(&mut reader, sink).await
    }

    async fn power(&self, device: &Device, action: PowerAction) -> Result<(), PlatformError> {
        if !Self::is_simulator(device) {
            return match action {
                PowerAction::Reboot => {
                    let udid_arg = format!("--udid={}", device.id);
                    self.go_ios(&["reboot", &udid_arg]).await.map(|_| ())
                }
                _ => Err(PlatformError::Unsupported(format!(
                    "{action:?} on real iOS device {}",
                    device.id
                ))),
            };
        }

        if matches!(action, PowerAction::Shutdown | PowerAction::Reboot) && device.is_booted() {
            self.simctl(&["shutdown", &device.id]).await?;
        }
        if matches!(action, PowerAction::Boot | PowerAction::Reboot) {
            if action == PowerAction::Reboot || !device.is_booted() {
                self.simctl(&["boot", &device.id]).await?;
            }
            run_checked(
                &self.tools.xcrun,
                &["simctl", "bootstatus", &device.id, "-b"],
                BOOT_TIMEOUT,
            )
            .await?;
        }
        Ok(())
    }
}
