//! In-memory platform for tests and `--mock` runs. Devices, forwards and
//! agents are bookkeeping only; nothing touches real tooling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{
    AgentEndpoint, AgentPlan, Capabilities, DeviceCommand, DevicePlatform, ForwardEntry,
    ImageFormat, PlatformError, PowerAction, Resource,
};
use super::capture::mjpeg_part;
use crate::device::{Device, DeviceKind, DeviceMetadata, DeviceState, Platform, ScreenSize};
use crate::stream::{CaptureFormat, CaptureRequest, CaptureSink};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

#[derive(Default)]
struct MockState {
    devices: Vec<Device>,
    formats: Vec<CaptureFormat>,
    answering: HashSet<String>,
    killed: HashSet<u64>,
    never_ready: bool,
    forward_error: Option<PlatformError>,
    command_error: Option<PlatformError>,
    close_delay: Duration,
    stale: Vec<ForwardEntry>,
    executed: Vec<(String, DeviceCommand)>,
    power: Vec<(String, PowerAction)>,
}

#[derive(Default)]
struct Counters {
    tunnels: AtomicU64,
    forwards: AtomicU64,
    launches: AtomicU64,
    live_processes: AtomicU64,
    live_forwards: AtomicU64,
    active_captures: AtomicU64,
    next_process: AtomicU64,
}

pub struct MockPlatform {
    platform: Platform,
    state: Arc<Mutex<MockState>>,
    counters: Arc<Counters>,
}

impl MockPlatform {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            state: Arc::new(Mutex::new(MockState {
                formats: vec![
                    CaptureFormat::Mjpeg,
                    CaptureFormat::Avc,
                    CaptureFormat::Ogg,
                    CaptureFormat::Opus,
                ],
                ..MockState::default()
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn with_devices(self, devices: Vec<Device>) -> Self {
        self.state.lock().devices = devices;
        self
    }

    pub fn with_formats(self, formats: Vec<CaptureFormat>) -> Self {
        self.state.lock().formats = formats;
        self
    }

    /// Descriptor named after its id, running OS version 14.
    pub fn device(id: &str, kind: DeviceKind, state: DeviceState) -> Device {
        let platform = match kind {
            DeviceKind::Simulator => Platform::Ios,
            _ => Platform::Android,
        };
        Device {
            id: id.to_string(),
            platform,
            kind,
            state,
            name: id.to_string(),
            os_version: "14".to_string(),
        }
    }

    pub fn set_agent_never_ready(&self, never_ready: bool) {
        self.state.lock().never_ready = never_ready;
    }

    pub fn set_forward_error(&self, error: Option<PlatformError>) {
        self.state.lock().forward_error = error;
    }

    /// Agent commands fail with `error` until cleared.
    pub fn set_command_error(&self, error: Option<PlatformError>) {
        self.state.lock().command_error = error;
    }

    /// Agent processes take `delay` to exit when closed.
    pub fn set_close_delay(&self, delay: Duration) {
        self.state.lock().close_delay = delay;
    }

    /// Every launched agent process dies.
    pub fn kill_agents(&self) {
        let mut state = self.state.lock();
        state.answering.clear();
        let launched = self.counters.next_process.load(Ordering::SeqCst);
        state.killed.extend(0..launched);
    }

    /// Agents stop answering while their processes keep running.
    pub fn stall_agents(&self) {
        self.state.lock().answering.clear();
    }

    pub fn add_stale_forward(&self, device_id: &str, local_port: u16, remote_port: u16) {
        self.state.lock().stale.push(ForwardEntry {
            device_id: device_id.to_string(),
            local_port,
            remote_port,
        });
    }

    pub fn stale_forwards(&self) -> Vec<ForwardEntry> {
        self.state.lock().stale.clone()
    }

    pub fn executed(&self) -> Vec<(String, DeviceCommand)> {
        self.state.lock().executed.clone()
    }

    pub fn power_actions(&self) -> Vec<(String, PowerAction)> {
        self.state.lock().power.clone()
    }

    pub fn tunnels(&self) -> u64 {
        self.counters.tunnels.load(Ordering::SeqCst)
    }

    pub fn forwards(&self) -> u64 {
        self.counters.forwards.load(Ordering::SeqCst)
    }

    pub fn launches(&self) -> u64 {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn live_processes(&self) -> u64 {
        self.counters.live_processes.load(Ordering::SeqCst)
    }

    pub fn live_forwards(&self) -> u64 {
        self.counters.live_forwards.load(Ordering::SeqCst)
    }

    pub fn active_captures(&self) -> u64 {
        self.counters.active_captures.load(Ordering::SeqCst)
    }

    fn is_answering(&self, device_id: &str) -> bool {
        self.state.lock().answering.contains(device_id)
    }

    fn require_agent(&self, endpoint: &AgentEndpoint) -> Result<(), PlatformError> {
        if self.is_answering(&endpoint.device.id) {
            Ok(())
        } else {
            Err(PlatformError::AgentUnreachable(format!(
                "connection refused on 127.0.0.1:{}",
                endpoint.control_port
            )))
        }
    }
}

/// Rebuilds a configured failure for every call; `PlatformError` is not
/// `Clone` because of its io variant.
fn replay(error: &PlatformError) -> PlatformError {
    match error {
        PlatformError::ToolMissing { tool, detail } => PlatformError::ToolMissing {
            tool: tool.clone(),
            detail: detail.clone(),
        },
        PlatformError::Command { command, detail } => PlatformError::Command {
            command: command.clone(),
            detail: detail.clone(),
        },
        PlatformError::Timeout(what) => PlatformError::Timeout(what.clone()),
        PlatformError::AgentUnreachable(what) => PlatformError::AgentUnreachable(what.clone()),
        PlatformError::Agent(what) => PlatformError::Agent(what.clone()),
        PlatformError::Unsupported(what) => PlatformError::Unsupported(what.clone()),
        PlatformError::Io(err) => PlatformError::Io(std::io::Error::new(err.kind(), err.to_string())),
    }
}

struct MockResource {
    label: String,
    live: Arc<Counters>,
    kind: ResourceKind,
}

enum ResourceKind {
    Tunnel,
    Forward,
    Process {
        id: u64,
        device_id: String,
        state: Arc<Mutex<MockState>>,
    },
}

#[async_trait]
impl Resource for MockResource {
    fn label(&self) -> &str {
        &self.label
    }

    async fn close(self: Box<Self>) -> Result<(), PlatformError> {
        if let ResourceKind::Process { state, .. } = &self.kind {
            let delay = state.lock().close_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    fn has_exited(&mut self) -> bool {
        match &self.kind {
            ResourceKind::Process { id, state, .. } => state.lock().killed.contains(id),
            _ => false,
        }
    }
}

impl Drop for MockResource {
    fn drop(&mut self) {
        match &self.kind {
            ResourceKind::Tunnel => {}
            ResourceKind::Forward => {
                self.live.live_forwards.fetch_sub(1, Ordering::SeqCst);
            }
            ResourceKind::Process {
                device_id, state, ..
            } => {
                state.lock().answering.remove(device_id);
                self.live.live_processes.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl DevicePlatform for MockPlatform {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn enumerate(&self, include_offline: bool) -> Result<Vec<Device>, PlatformError> {
        Ok(self
            .state
            .lock()
            .devices
            .iter()
            .filter(|device| include_offline || device.is_booted())
            .cloned()
            .collect())
    }

    fn agent_plan(&self, device: &Device) -> AgentPlan {
        AgentPlan {
            requires_tunnel: device.platform == Platform::Ios && device.kind == DeviceKind::Real,
            control_port: 12000,
            video_port: 12001,
            audio_port: 12002,
        }
    }

    fn capabilities(&self, _device: &Device) -> Capabilities {
        Capabilities {
            formats: self.state.lock().formats.clone(),
        }
    }

    async fn open_tunnel(&self, device: &Device) -> Result<Box<dyn Resource>, PlatformError> {
        self.counters.tunnels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockResource {
            label: format!("tunnel {}", device.id),
            live: Arc::clone(&self.counters),
            kind: ResourceKind::Tunnel,
        }))
    }

    async fn forward(
        &self,
        device: &Device,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        self.counters.forwards.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.lock().forward_error.as_ref() {
            return Err(replay(err));
        }
        self.counters.live_forwards.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockResource {
            label: format!("forward {} tcp:{local_port} -> tcp:{remote_port}", device.id),
            live: Arc::clone(&self.counters),
            kind: ResourceKind::Forward,
        }))
    }

    async fn list_forwards(&self) -> Result<Vec<ForwardEntry>, PlatformError> {
        Ok(self.state.lock().stale.clone())
    }

    async fn remove_forward(&self, entry: &ForwardEntry) -> Result<(), PlatformError> {
        self.state.lock().stale.retain(|stale| stale != entry);
        Ok(())
    }

    async fn probe(&self, endpoint: &AgentEndpoint) -> bool {
        self.is_answering(&endpoint.device.id)
    }

    async fn launch_agent(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<Box<dyn Resource>, PlatformError> {
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        self.counters.live_processes.fetch_add(1, Ordering::SeqCst);
        let id = self.counters.next_process.fetch_add(1, Ordering::SeqCst);
        let device_id = endpoint.device.id.clone();
        {
            let mut state = self.state.lock();
            if !state.never_ready {
                state.answering.insert(device_id.clone());
            }
        }
        Ok(Box::new(MockResource {
            label: format!("agent {device_id}"),
            live: Arc::clone(&self.counters),
            kind: ResourceKind::Process {
                id,
                device_id,
                state: Arc::clone(&self.state),
            },
        }))
    }

    async fn fetch_metadata(&self, device: &Device) -> Result<DeviceMetadata, PlatformError> {
        Ok(DeviceMetadata {
            name: device.name.clone(),
            os_version: device.os_version.clone(),
            model: Some("mock".to_string()),
            screen: Some(ScreenSize {
                width: 1080,
                height: 2400,
            }),
        })
    }

    async fn execute(
        &self,
        endpoint: &AgentEndpoint,
        command: &DeviceCommand,
    ) -> Result<Value, PlatformError> {
        self.require_agent(endpoint)?;
        {
            let mut state = self.state.lock();
            if let Some(err) = state.command_error.as_ref() {
                return Err(replay(err));
            }
            state
                .executed
                .push((endpoint.device.id.clone(), command.clone()));
        }
        Ok(match command {
            DeviceCommand::GetOrientation => json!({ "orientation": "portrait" }),
            DeviceCommand::ListApps => json!([
                { "bundleId": "com.example.notes", "name": "Notes" },
                { "bundleId": "com.example.maps", "name": "Maps" },
            ]),
            DeviceCommand::DumpUi => json!([
                { "type": "Button", "label": "OK", "rect": { "x": 10, "y": 20, "width": 100, "height": 40 } },
            ]),
            _ => Value::Null,
        })
    }

    async fn screenshot(
        &self,
        endpoint: &AgentEndpoint,
        format: ImageFormat,
        _quality: u8,
    ) -> Result<Vec<u8>, PlatformError> {
        self.require_agent(endpoint)?;
        Ok(match format {
            ImageFormat::Png => PNG_MAGIC.to_vec(),
            ImageFormat::Jpeg => vec![0xff, 0xd8, 0xff, 0xd9],
        })
    }

    async fn capture(
        &self,
        endpoint: &AgentEndpoint,
        _stream_port: u16,
        request: &CaptureRequest,
        sink: &mut CaptureSink,
    ) -> Result<(), PlatformError> {
        self.require_agent(endpoint)?;
        self.counters.active_captures.fetch_add(1, Ordering::SeqCst);
        let _active = CaptureGuard(Arc::clone(&self.counters));

        let interval = if request.format.is_audio() {
            Duration::from_millis(20)
        } else {
            Duration::from_millis(1000 / u64::from(request.fps.max(1)))
        };
        let mut sequence: u64 = 0;
        loop {
            let unit = match request.format {
                CaptureFormat::Mjpeg => mjpeg_part(&[0xff, 0xd8, sequence as u8, 0xff, 0xd9]),
                CaptureFormat::Avc => Bytes::from(vec![0, 0, 0, 1, 0x65, sequence as u8]),
                CaptureFormat::Ogg | CaptureFormat::Opus => Bytes::from(vec![0xfc, sequence as u8]),
            };
            if !sink.push(unit).await {
                return Ok(());
            }
            sequence += 1;
            if sequence % 30 == 0 {
                sink.progress(format!("{sequence} units captured"));
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn power(&self, device: &Device, action: PowerAction) -> Result<(), PlatformError> {
        let mut state = self.state.lock();
        state.power.push((device.id.clone(), action));
        let entry = state
            .devices
            .iter_mut()
            .find(|candidate| candidate.id == device.id)
            .ok_or_else(|| PlatformError::Command {
                command: format!("power {:?}", action),
                detail: format!("unknown device {}", device.id),
            })?;
        entry.state = match action {
            PowerAction::Boot | PowerAction::Reboot => DeviceState::Booted,
            PowerAction::Shutdown => DeviceState::Offline,
        };
        Ok(())
    }
}

struct CaptureGuard(Arc<Counters>);

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.0.active_captures.fetch_sub(1, Ordering::SeqCst);
    }
}
