//! Android devices and emulators driven through `adb` and `emulator`.
//!
//! Emulators are identified by their AVD name so a device keeps its id across
//! boots; real devices by their adb serial.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::agent_client::AgentClient;
use super::capture;
use super::runner::{run_checked, run_tool, ChildProcess, DEFAULT_TOOL_TIMEOUT};
use super::{
    AgentEndpoint, AgentPlan, Capabilities, DeviceCommand, DevicePlatform, ForwardEntry,
    ImageFormat, PlatformError, PowerAction, Resource,
};
use crate::device::{Device, DeviceKind, DeviceMetadata, DeviceState, Platform, ScreenSize};
use crate::stream::{CaptureFormat, CaptureRequest, CaptureSink};

const AGENT_CONTROL_PORT: u16 = 12000;
const AGENT_VIDEO_PORT: u16 = 12001;
const AGENT_AUDIO_PORT: u16 = 12002;
const AGENT_JAR: &str = "/data/local/tmp/device-hub-agent.jar";
const AGENT_MAIN_CLASS: &str = "com.devicehub.agent.Server";

const BOOT_TIMEOUT: Duration = Duration::from_secs(180);
const BOOT_POLL: Duration = Duration::from_secs(2);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct AndroidTools {
    pub adb: String,
    pub emulator: String,
}

impl Default for AndroidTools {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            emulator: "emulator".to_string(),
        }
    }
}

/// One line of `adb devices -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbEntry {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
}

pub fn parse_adb_devices(output: &str) -> Vec<AdbEntry> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter(|line| !line.to_ascii_lowercase().starts_with("list of devices"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let serial = tokens.next()?.to_string();
            let state = tokens.next()?.to_string();
            let model = tokens
                .find_map(|token| token.strip_prefix("model:"))
                .map(|model| model.replace('_', " "));
            Some(AdbEntry {
                serial,
                state,
                model,
            })
        })
        .collect()
}

pub fn parse_getprop(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once("]: [")?;
            let key = key.trim_start_matches('[').trim();
            let value = value.trim_end_matches(']').trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// `adb forward --list`: `<serial> tcp:<local> tcp:<remote>`.
pub fn parse_forward_list(output: &str) -> Vec<ForwardEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            let device_id = tokens.next()?.to_string();
            let local_port = tokens.next()?.strip_prefix("tcp:")?.parse().ok()?;
            let remote_port = tokens.next()?.strip_prefix("tcp:")?.parse().ok()?;
            Some(ForwardEntry {
                device_id,
                local_port,
                remote_port,
            })
        })
        .collect()
}

/// `wm size` output, preferring an override over the physical size.
pub fn parse_wm_size(output: &str) -> Option<ScreenSize> {
    let pick = |prefix: &str| {
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix(prefix))
            .and_then(|size| size.trim().split_once('x'))
            .and_then(|(w, h)| Some(ScreenSize {
                width: w.trim().parse().ok()?,
                height: h.trim().parse().ok()?,
            }))
    };
    pick("Override size:").or_else(|| pick("Physical size:"))
}

/// `pm list packages` lines (`package:<name>`), sorted.
pub fn parse_packages(output: &str) -> Vec<String> {
    let mut packages: Vec<String> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(|payload| {
            payload
                .rsplit_once('=')
                .map_or(payload, |(_, name)| name)
                .trim()
                .to_string()
        })
        .filter(|name| !name.is_empty())
        .collect();
    packages.sort();
    packages
}

pub struct AndroidPlatform {
    tools: AndroidTools,
    /// AVD name -> adb serial for running emulators.
    serials: DashMap<String, String>,
}

impl AndroidPlatform {
    pub fn new(tools: AndroidTools) -> Self {
        Self {
            tools,
            serials: DashMap::new(),
        }
    }

    async fn adb(&self, args: &[&str]) -> Result<String, PlatformError> {
        Ok(run_checked(&self.tools.adb, args, DEFAULT_TOOL_TIMEOUT)
            .await?
            .stdout_text())
    }

    async fn shell(&self, serial: &str, command: &[&str]) -> Result<String, PlatformError> {
        let mut args = vec!["-s", serial, "shell"];
        args.extend_from_slice(command);
        self.adb(&args).await
    }

    async fn avd_name(&self, serial: &str) -> Option<String> {
        let output = self.adb(&["-s", serial, "emu", "avd", "name"]).await.ok()?;
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && *line != "OK")
            .map(str::to_string)
    }

    async fn describe(&self, entry: AdbEntry) -> Device {
        let online = entry.state == "device";
        let is_emulator = entry.serial.starts_with("emulator-");
        let id = if is_emulator && online {
            match self.avd_name(&entry.serial).await {
                Some(avd) => {
                    self.serials.insert(avd.clone(), entry.serial.clone());
                    avd
                }
                None => entry.serial.clone(),
            }
        } else {
            entry.serial.clone()
        };

        let props = if online {
            self.shell(&entry.serial, &["getprop"])
                .await
                .map(|output| parse_getprop(&output))
                .unwrap_or_default()
        } else {
            HashMap::new()
        };
        let name = entry
            .model
            .clone()
            .or_else(|| props.get("ro.product.model").cloned())
            .unwrap_or_else(|| id.clone());

        Device {
            id,
            platform: Platform::Android,
            kind: if is_emulator {
                DeviceKind::Emulator
            } else {
                DeviceKind::Real
            },
            state: if online {
                DeviceState::Booted
            } else {
                DeviceState::Offline
            },
            name,
            os_version: props
                .get("ro.build.version.release")
                .cloned()
                .unwrap_or_default(),
        }
    }

    async fn list_avds(&self) -> Vec<String> {
        match run_checked(&self.tools.emulator, &["-list-avds"], DEFAULT_TOOL_TIMEOUT).await {
            Ok(output) => output
                .stdout_text()
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with("INFO"))
                .map(str::to_string)
                .collect(),
            Err(err) => {
                debug!(error = %err, "cannot list AVDs");
                Vec::new()
            }
        }
    }

    /// adb serial for `device`, refreshing the AVD map when needed.
    async fn serial(&self, device: &Device) -> Result<String, PlatformError> {
        if device.kind != DeviceKind::Emulator || device.id.starts_with("emulator-") {
            return Ok(device.id.clone());
        }
        if let Some(serial) = self.serials.get(&device.id) {
            return Ok(serial.clone());
        }
        self.enumerate(false).await?;
        self.serials
            .get(&device.id)
            .map(|serial| serial.clone())
            .ok_or_else(|| PlatformError::Command {
                command: format!("resolve serial of {}", device.id),
                detail: "emulator is not running".to_string(),
            })
    }

    async fn wait_booted(&self, device: &Device) -> Result<(), PlatformError> {
        let deadline = Instant::now() + BOOT_TIMEOUT;
        loop {
            if let Ok(serial) = self.serial(device).await {
                let booted = self
                    .shell(&serial, &["getprop", "sys.boot_completed"])
                    .await
                    .map(|output| output.trim() == "1")
                    .unwrap_or(false);
                if booted {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(PlatformError::Timeout(format!("boot of {}", device.id)));
            }
            tokio::time::sleep(BOOT_POLL).await;
        }
    }

    fn spawn_emulator(&self, avd: &str) -> Result<(), PlatformError> {
        // Detached on purpose: the emulator outlives this process.
        let child = tokio::process::Command::new(&self.tools.emulator)
            .args(["-avd", avd, "-no-snapshot-save", "-no-boot-anim"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    PlatformError::ToolMissing {
                        tool: self.tools.emulator.clone(),
                        detail: err.to_string(),
                    }
                } else {
                    PlatformError::Io(err)
                }
            })?;
        info!(avd, pid = child.id(), "emulator launched");
        Ok(())
    }

    async fn screencap_png(&self, serial: &str) -> Result<Vec<u8>, PlatformError> {
        let output = run_checked(
            &self.tools.adb,
            &["-s", serial, "exec-out", "screencap", "-p"],
            SCREENSHOT_TIMEOUT,
        )
        .await?;
        if output.stdout.is_empty() {
            return Err(PlatformError::Command {
                command: "screencap -p".to_string(),
                detail: "empty output".to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// `adb forward` that removes itself when closed.
struct AdbForward {
    label: String,
    adb: String,
    serial: String,
    local_port: u16,
}

#[async_trait]
impl Resource for AdbForward {
    fn label(&self) -> &str {
        &self.label
    }

    async fn close(self: Box<Self>) -> Result<(), PlatformError> {
        let local = format!("tcp:{}", self.local_port);
        run_checked(
            &self.adb,
            &["-s", &self.serial, "forward", "--remove", &local],
            DEFAULT_TOOL_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    fn force_close(&mut self) {
        let local = format!("tcp:{}", self.local_port);
        let _ = std::process::Command::new(&self.adb)
            .args(["-s", &self.serial, "forward", "--remove", &local])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

#[async_trait]
impl DevicePlatform for AndroidPlatform {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    async fn enumerate(&self, include_offline: bool) -> Result<Vec<Device>, PlatformError> {
        let output = self.adb(&["devices", "-l"]).await?;
        let entries: Vec<AdbEntry> = parse_adb_devices(&output)
            .into_iter()
            .filter(|entry| include_offline || entry.state == "device")
            .collect();
        let mut devices = join_all(entries.into_iter().map(|entry| self.describe(entry))).await;

        if include_offline {
            for avd in self.list_avds().await {
                if devices.iter().any(|device| device.id == avd) {
                    continue;
                }
                devices.push(Device {
                    id: avd.clone(),
                    platform: Platform::Android,
                    kind: DeviceKind::Emulator,
                    state: DeviceState::Offline,
                    name: avd.replace('_', " "),
                    os_version: String::new(),
                });
            }
        }
        Ok(devices)
    }

    fn agent_plan(&self, _device: &Device) -> AgentPlan {
        AgentPlan {
            requires_tunnel: false,
            control_port: AGENT_CONTROL_PORT,
            video_port: AGENT_VIDEO_PORT,
            audio_port: AGENT_AUDIO_PORT,
        }
    }

    fn capabilities(&self, device: &Device) -> Capabilities {
        let mut formats = vec![CaptureFormat::Mjpeg, CaptureFormat::Avc];
        // Audio playback capture needs Android 11.
        if device.os_major() >= 11 {
            formats.extend([CaptureFormat::Ogg, CaptureFormat::Opus]);
        }
        Capabilities { formats }
    }

    async fn open_tunnel(&self, device: &Device) -> Result<Box<dyn Resource>, PlatformError> {
        Err(PlatformError::Unsupported(format!(
            "{} does not need a tunnel",
            device.id
        )))
    }

    async fn forward(
        &self,
        device: &Device,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        let serial = self.serial(device).await?;
        let local = format!("tcp:{local_port}");
        let remote = format!("tcp:{remote_port}");
        self.adb(&["-s", &serial, "forward", &local, &remote]).await?;
        Ok(Box::new(AdbForward {
            label: format!("adb forward {serial} {local} -> {remote}"),
            adb: self.tools.adb.clone(),
            serial,
            local_port,
        }))
    }

    async fn list_forwards(&self) -> Result<Vec<ForwardEntry>, PlatformError> {
        Ok(parse_forward_list(&self.adb(&["forward", "--list"]).await?))
    }

    async fn remove_forward(&self, entry: &ForwardEntry) -> Result<(), PlatformError> {
        let local = format!("tcp:{}", entry.local_port);
        self.adb(&["-s", &entry.device_id, "forward", "--remove", &local])
            .await
            .map(|_| ())
    }

    async fn probe(&self, endpoint: &AgentEndpoint) -> bool {
        AgentClient::new(endpoint.control_port).is_alive().await
    }

    async fn launch_agent(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        let serial = self.serial(&endpoint.device).await?;
        let classpath = format!("CLASSPATH={AGENT_JAR}");
        let port = AGENT_CONTROL_PORT.to_string();
        let process = ChildProcess::spawn(
            format!("agent {serial}"),
            &self.tools.adb,
            &[
                "-s",
                &serial,
                "shell",
                &classpath,
                "app_process",
                "/",
                AGENT_MAIN_CLASS,
                "--port",
                &port,
            ],
        )?;
        Ok(Box::new(process))
    }

    async fn fetch_metadata(&self, device: &Device) -> Result<DeviceMetadata, PlatformError> {
        let serial = self.serial(device).await?;
        let props = parse_getprop(&self.shell(&serial, &["getprop"]).await?);
        let screen = match self.shell(&serial, &["wm", "size"]).await {
            Ok(output) => parse_wm_size(&output),
            Err(err) => {
                warn!(device_id = %device.id, error = %err, "cannot read screen size");
                None
            }
        };
        Ok(DeviceMetadata {
            name: props
                .get("ro.product.model")
                .cloned()
                .unwrap_or_else(|| device.name.clone()),
            os_version: props
                .get("ro.build.version.release")
                .cloned()
                .unwrap_or_else(|| device.os_version.clone()),
            model: props.get("ro.product.device").cloned(),
            screen,
        })
    }

    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        command: &DeviceCommand,
    ) -> Result<Value, PlatformError> {
        match command {
            DeviceCommand::ListApps => {
                let serial = self.serial(&endpoint.device).await?;
                let output = self.shell(&serial, &["pm", "list", "packages", "-3"]).await?;
                Ok(parse_packages(&output)
                    .into_iter()
                    .map(|package| json!({ "bundleId": package }))
                    .collect())
            }
            DeviceCommand::OpenUrl { url } => {
                let serial = self.serial(&endpoint.device).await?;
                self.shell(
                    &serial,
                    &["am", "start", "-a", "android.intent.action.VIEW", "-d", url],
                )
                .await?;
                Ok(Value::Null)
            }
            _ => {
                AgentClient::new(endpoint.control_port)
                    .call(command.agent_method(), command.agent_params())
                    .await
            }
        }
    }

    async fn screenshot(
        &self,
        endpoint: &AgentEndpoint,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, PlatformError> {
        if format == ImageFormat::Png {
            let serial = self.serial(&endpoint.device).await?;
            return self.screencap_png(&serial).await;
        }
        let result = AgentClient::new(endpoint.control_port)
            .call(
                "screenshot",
                json!({ "format": "jpeg", "quality": quality }),
            )
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
        let client = AgentClient::new(endpoint.control_port);
        client
            .call(
                "stream.start",
                json!({
                    "format": request.format,
                    "quality": request.quality,
                    "scale": request.scale,
                    "fps": request.fps,
                }),
            )
            .await?;
        sink.progress(format!("{} stream started", request.format));

        let mut socket = capture::connect(stream_port).await?;
        let result = match request.format {
            CaptureFormat::Avc => capture::pump_raw(&mut socket, sink).await,
            format => capture::pump_records(&mut socket, format, sink).await,
        };

        if let Err(err) = client
            .call("stream.stop", json!({ "format": request.format }))
            .await
        {
            debug!(device_id = %endpoint.device.id, error = %err, "stream.stop failed");
        }
        result
    }

    async fn power(&self, device: &Device, action: PowerAction) -> Result<(), PlatformError> {
        match action {
            PowerAction::Boot => {
                if device.is_booted() {
                    return Ok(());
                }
                if device.kind != DeviceKind::Emulator {
                    return Err(PlatformError::Unsupported(format!(
                        "{} is a real device and cannot be booted remotely",
                        device.id
                    )));
                }
                self.spawn_emulator(&device.id)?;
                self.wait_booted(device).await
            }
            PowerAction::Shutdown => {
                let serial = self.serial(device).await?;
                if device.kind == DeviceKind::Emulator {
                    self.adb(&["-s", &serial, "emu", "kill"]).await?;
                } else {
                    self.adb(&["-s", &serial, "reboot", "-p"]).await?;
                }
                self.serials.remove(&device.id);
                Ok(())
            }
            PowerAction::Reboot => {
                let serial = self.serial(device).await?;
                self.adb(&["-s", &serial, "reboot"]).await?;
                let _ = run_tool(
                    &self.tools.adb,
                    &["-s", &serial, "wait-for-device"],
                    BOOT_TIMEOUT,
                )
                .await?;
                self.wait_booted(device).await
            }
        }
    }
}
