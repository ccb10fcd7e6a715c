//! Capability interface implemented once per device platform family.
//!
//! The session manager and the protocol server only ever talk to
//! `dyn DevicePlatform`; everything platform specific (adb, simctl, go-ios,
//! the on-device agent wire format) stays behind this trait.

pub mod agent_client;
pub mod capture;
pub mod android;
pub mod ios;
pub mod mock;
pub mod relay;
pub mod runner;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::device::{Device, DeviceMetadata, Platform};
use crate::stream::{CaptureFormat, CaptureRequest, CaptureSink};

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("required tool '{tool}' is not available: {detail}")]
    ToolMissing { tool: String, detail: String },
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },
    #[error("{0} timed out")]
    Timeout(String),
    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),
    #[error("agent returned an error: {0}")]
    Agent(String),
    #[error("not supported: {0}")]
    Unsupported(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Fatal errors are surfaced verbatim and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlatformError::ToolMissing { .. } | PlatformError::Unsupported(_)
        )
    }
}

/// Something acquired on behalf of an agent session that must be given back:
/// a tunnel, a port forward, a spawned process.
#[async_trait]
pub trait Resource: Send {
    fn label(&self) -> &str;

    async fn close(self: Box<Self>) -> Result<(), PlatformError>;

    /// Synchronous last resort once the shutdown grace period is exhausted.
    fn force_close(&mut self) {}

    /// Only meaningful for processes.
    fn has_exited(&mut self) -> bool {
        false
    }
}

/// Static facts about how the agent of a given device is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentPlan {
    pub requires_tunnel: bool,
    pub control_port: u16,
    pub video_port: u16,
    pub audio_port: u16,
}

impl AgentPlan {
    pub fn stream_port(&self, format: CaptureFormat) -> u16 {
        if format.is_audio() {
            self.audio_port
        } else {
            self.video_port
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub formats: Vec<CaptureFormat>,
}

impl Capabilities {
    pub fn supports(&self, format: CaptureFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Everything a command needs to reach a running agent.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub device: Device,
    pub control_port: u16,
}

/// A port forward the platform tooling still knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry {
    pub device_id: String,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Boot,
    Shutdown,
    Reboot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

/// Simple synchronous commands executed against a running agent.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    Tap { x: i32, y: i32 },
    LongPress { x: i32, y: i32, duration_ms: u64 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64 },
    Text { text: String },
    Button { button: String },
    GetOrientation,
    SetOrientation { orientation: Orientation },
    LaunchApp { bundle_id: String },
    TerminateApp { bundle_id: String },
    ListApps,
    DumpUi,
    OpenUrl { url: String },
}

impl DeviceCommand {
    /// Method name the on-device agent understands.
    pub fn agent_method(&self) -> &'static str {
        match self {
            DeviceCommand::Tap { .. } => "io.tap",
            DeviceCommand::LongPress { .. } => "io.longpress",
            DeviceCommand::Swipe { .. } => "io.swipe",
            DeviceCommand::Text { .. } => "io.text",
            DeviceCommand::Button { .. } => "io.button",
            DeviceCommand::GetOrientation => "io.orientation.get",
            DeviceCommand::SetOrientation { .. } => "io.orientation.set",
            DeviceCommand::LaunchApp { .. } => "apps.launch",
            DeviceCommand::TerminateApp { .. } => "apps.terminate",
            DeviceCommand::ListApps => "apps.list",
            DeviceCommand::DumpUi => "dump.ui",
            DeviceCommand::OpenUrl { .. } => "url.open",
        }
    }

    pub fn agent_params(&self) -> Value {
        use serde_json::json;
        match self {
            DeviceCommand::Tap { x, y } => json!({ "x": x, "y": y }),
            DeviceCommand::LongPress { x, y, duration_ms } => {
                json!({ "x": x, "y": y, "durationMs": duration_ms })
            }
            DeviceCommand::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => json!({ "x1": x1, "y1": y1, "x2": x2, "y2": y2, "durationMs": duration_ms }),
            DeviceCommand::Text { text } => json!({ "text": text }),
            DeviceCommand::Button { button } => json!({ "button": button }),
            DeviceCommand::SetOrientation { orientation } => json!({ "orientation": orientation }),
            DeviceCommand::LaunchApp { bundle_id } | DeviceCommand::TerminateApp { bundle_id } => {
                json!({ "bundleId": bundle_id })
            }
            DeviceCommand::OpenUrl { url } => json!({ "url": url }),
            DeviceCommand::GetOrientation | DeviceCommand::ListApps | DeviceCommand::DumpUi => {
                json!({})
            }
        }
    }
}

#[async_trait]
pub trait DevicePlatform: Send + Sync {
    fn platform(&self) -> Platform;

    async fn enumerate(&self, include_offline: bool) -> Result<Vec<Device>, PlatformError>;

    fn agent_plan(&self, device: &Device) -> AgentPlan;

    fn capabilities(&self, device: &Device) -> Capabilities;

    async fn open_tunnel(&self, device: &Device) -> Result<Box<dyn Resource>, PlatformError>;

    async fn forward(
        &self,
        device: &Device,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Resource>, PlatformError>;

    /// Forwards left behind by an earlier process, if the tooling can list them.
    async fn list_forwards(&self) -> Result<Vec<ForwardEntry>, PlatformError> {
        Ok(Vec::new())
    }

    async fn remove_forward(&self, _entry: &ForwardEntry) -> Result<(), PlatformError> {
        Ok(())
    }

    /// Cheap liveness check against the forwarded control port.
    async fn probe(&self, endpoint: &AgentEndpoint) -> bool;

    async fn launch_agent(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<Box<dyn Resource>, PlatformError>;

    async fn fetch_metadata(&self, device: &Device) -> Result<DeviceMetadata, PlatformError>;

    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        command: &DeviceCommand,
    ) -> Result<Value, PlatformError>;

    async fn screenshot(
        &self,
        endpoint: &AgentEndpoint,
        format: ImageFormat,
        quality: u8,
    ) -> Result<Vec<u8>, PlatformError>;

    /// Drives a capture until the source ends or `sink.push` reports the
    /// consumer is gone.
    async fn capture(
        &self,
        endpoint: &AgentEndpoint,
        stream_port: u16,
        request: &CaptureRequest,
        sink: &mut CaptureSink,
    ) -> Result<(), PlatformError>;

    async fn power(&self, device: &Device, action: PowerAction) -> Result<(), PlatformError>;
}

/// The platform families this process was configured with.
#[derive(Clone, Default)]
pub struct Platforms {
    inner: HashMap<Platform, Arc<dyn DevicePlatform>>,
}

impl Platforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, platform: Arc<dyn DevicePlatform>) -> Self {
        self.inner.insert(platform.platform(), platform);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn DevicePlatform>> {
        self.inner.get(&platform).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DevicePlatform>> {
        self.inner.values()
    }
}
