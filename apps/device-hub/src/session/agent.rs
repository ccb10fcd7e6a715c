use std::collections::BTreeMap;
use std::collections::HashMap;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, warn};

use crate::device::{Device, DeviceMetadata};
use crate::platform::{AgentEndpoint, AgentPlan, PlatformError, Resource};
use crate::ports::{PortLease, PortPurpose};

use super::LifecycleState;

/// Everything acquired for one running agent. Built up step by step during
/// startup and torn down in reverse order.
pub struct AgentSession {
    device: Device,
    plan: AgentPlan,
    generation: u64,
    tunnel: Option<Box<dyn Resource>>,
    control: Option<(PortLease, Box<dyn Resource>)>,
    streams: HashMap<PortPurpose, (PortLease, Box<dyn Resource>)>,
    process: Option<Box<dyn Resource>>,
    metadata: Option<DeviceMetadata>,
    started_at: Instant,
    started_at_ms: u64,
}

impl AgentSession {
    pub(super) fn new(device: Device, plan: AgentPlan, generation: u64) -> Self {
        Self {
            device,
            plan,
            generation,
            tunnel: None,
            control: None,
            streams: HashMap::new(),
            process: None,
            metadata: None,
            started_at: Instant::now(),
            started_at_ms: now_millis(),
        }
    }

    pub fn plan(&self) -> AgentPlan {
        self.plan
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(super) fn set_tunnel(&mut self, tunnel: Box<dyn Resource>) {
        self.tunnel = Some(tunnel);
    }

    pub(super) fn set_control(&mut self, lease: PortLease, forward: Box<dyn Resource>) {
        self.control = Some((lease, forward));
    }

    pub(super) fn set_process(&mut self, process: Box<dyn Resource>) {
        self.process = Some(process);
    }

    pub(super) fn set_metadata(&mut self, metadata: DeviceMetadata) {
        self.metadata = Some(metadata);
    }

    pub(super) fn add_stream(&mut self, lease: PortLease, forward: Box<dyn Resource>) {
        self.streams.insert(lease.purpose(), (lease, forward));
    }

    pub fn stream_port(&self, purpose: PortPurpose) -> Option<u16> {
        self.streams.get(&purpose).map(|(lease, _)| lease.port())
    }

    pub fn control_port(&self) -> Option<u16> {
        self.control.as_ref().map(|(lease, _)| lease.port())
    }

    pub fn metadata(&self) -> Option<&DeviceMetadata> {
        self.metadata.as_ref()
    }

    pub fn endpoint(&self) -> Option<AgentEndpoint> {
        self.control_port().map(|control_port| AgentEndpoint {
            device: self.device.clone(),
            control_port,
        })
    }

    /// Local check only: did the process we launched die?
    pub fn process_exited(&mut self) -> bool {
        self.process
            .as_mut()
            .is_some_and(|process| process.has_exited())
    }

    /// Kills the launched process right away, e.g. after a readiness timeout.
    pub(super) async fn kill_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            process.force_close();
            close_quietly(&self.device.id, process).await;
        }
    }

    /// Best-effort reverse-order teardown. Leases go back to the allocator
    /// as they drop, whatever the close calls return.
    pub async fn teardown(mut self) {
        let device_id = self.device.id.clone();
        if let Some(process) = self.process.take() {
            close_quietly(&device_id, process).await;
        }
        for (_, (lease, forward)) in self.streams.drain() {
            close_quietly(&device_id, forward).await;
            drop(lease);
        }
        if let Some((lease, forward)) = self.control.take() {
            close_quietly(&device_id, forward).await;
            drop(lease);
        }
        if let Some(tunnel) = self.tunnel.take() {
            close_quietly(&device_id, tunnel).await;
        }
        debug!(device_id = %device_id, "agent session torn down");
    }

    /// Synchronous fallback once the shutdown grace period ran out.
    pub fn force_teardown(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.force_close();
        }
        for (_, forward) in self.streams.values_mut() {
            forward.force_close();
        }
        if let Some((_, forward)) = self.control.as_mut() {
            forward.force_close();
        }
        if let Some(tunnel) = self.tunnel.as_mut() {
            tunnel.force_close();
        }
        self.process = None;
        self.streams.clear();
        self.control = None;
        self.tunnel = None;
    }

    pub fn snapshot(&self, state: LifecycleState) -> SessionSnapshot {
        SessionSnapshot {
            device_id: self.device.id.clone(),
            platform: self.device.platform.to_string(),
            state,
            control_port: self.control_port(),
            stream_ports: self
                .streams
                .iter()
                .map(|(purpose, (lease, _))| (purpose.to_string(), lease.port()))
                .collect(),
            tunnel: self.tunnel.is_some(),
            agent_launched: self.process.is_some(),
            started_at: self.started_at_ms,
            uptime_secs: self.started_at.elapsed().as_secs(),
            metadata: self.metadata.clone(),
            last_error: None,
        }
    }
}

async fn close_quietly(device_id: &str, resource: Box<dyn Resource>) {
    let label = resource.label().to_string();
    if let Err(err) = resource.close().await {
        log_close_error(device_id, &label, &err);
    }
}

fn log_close_error(device_id: &str, label: &str, err: &PlatformError) {
    warn!(device_id, resource = label, error = %err, "failed to release resource");
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Cloned, serializable view of a session; never shares live state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub device_id: String,
    pub platform: String,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    pub stream_ports: BTreeMap<String, u16>,
    pub tunnel: bool,
    pub agent_launched: bool,
    pub started_at: u64,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<DeviceMetadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    /// Shape reported for devices without a session.
    pub fn absent(device: &Device, last_error: Option<String>) -> Self {
        Self {
            device_id: device.id.clone(),
            platform: device.platform.to_string(),
            state: LifecycleState::Absent,
            control_port: None,
            stream_ports: BTreeMap::new(),
            tunnel: false,
            agent_launched: false,
            started_at: 0,
            uptime_secs: 0,
            metadata: None,
            last_error,
        }
    }
}
