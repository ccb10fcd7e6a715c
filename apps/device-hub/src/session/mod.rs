//! Per-device agent lifecycle: at most one running agent per device, started
//! on demand under an exclusive per-device lock.

mod agent;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{HubError, HubResult, StartStep};
use crate::platform::{AgentEndpoint, AgentPlan, DevicePlatform, PlatformError, Platforms};
use crate::ports::{PortAllocator, PortPurpose};
use crate::registry::MetadataCache;

pub use self::agent::{AgentSession, SessionSnapshot};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Upper bound on waiting for a freshly launched agent to answer.
    pub start_timeout: Duration,
    pub probe_initial_backoff: Duration,
    pub probe_max_backoff: Duration,
    /// Extra attempts after a transient startup failure.
    pub start_retries: u32,
    pub health_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            probe_initial_backoff: Duration::from_millis(100),
            probe_max_backoff: Duration::from_secs(2),
            start_retries: 2,
            health_interval: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Absent,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// What callers hold on to after `ensure`: enough to talk to the agent,
/// nothing that keeps the session alive.
#[derive(Clone)]
pub struct AgentHandle {
    pub endpoint: AgentEndpoint,
    pub platform: Arc<dyn DevicePlatform>,
    pub plan: AgentPlan,
    pub generation: u64,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("device_id", &self.endpoint.device.id)
            .field("control_port", &self.endpoint.control_port)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

struct DeviceSlot {
    state: parking_lot::RwLock<LifecycleState>,
    last_error: parking_lot::RwLock<Option<String>>,
    session: Mutex<Option<AgentSession>>,
}

impl DeviceSlot {
    fn new() -> Self {
        Self {
            state: parking_lot::RwLock::new(LifecycleState::Absent),
            last_error: parking_lot::RwLock::new(None),
            session: Mutex::new(None),
        }
    }

    fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    fn set_state(&self, state: LifecycleState) {
        *self.state.write() = state;
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    platforms: Platforms,
    allocator: PortAllocator,
    metadata: MetadataCache,
    config: SessionConfig,
    slots: DashMap<String, Arc<DeviceSlot>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        platforms: Platforms,
        allocator: PortAllocator,
        metadata: MetadataCache,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                platforms,
                allocator,
                metadata,
                config,
                slots: DashMap::new(),
                generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.inner.allocator
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn platform(&self, device: &Device) -> HubResult<Arc<dyn DevicePlatform>> {
        self.inner.platforms.get(device.platform).ok_or_else(|| {
            HubError::validation(format!("platform '{}' is not enabled", device.platform))
        })
    }

    fn slot(&self, device_id: &str) -> Arc<DeviceSlot> {
        self.inner
            .slots
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(DeviceSlot::new()))
            .clone()
    }

    pub fn state(&self, device_id: &str) -> LifecycleState {
        self.inner
            .slots
            .get(device_id)
            .map(|slot| slot.state())
            .unwrap_or(LifecycleState::Absent)
    }

    /// Returns the running agent for `device`, starting it if needed.
    /// Concurrent callers for one device share a single startup.
    pub async fn ensure(&self, device: &Device) -> HubResult<AgentHandle> {
        if self.inner.shutdown.is_cancelled() {
            return Err(HubError::ShuttingDown);
        }
        let platform = self.platform(device)?;
        let slot = self.slot(&device.id);
        let mut guard = slot.session.lock().await;

        if let Some(session) = guard.as_mut() {
            if !session.process_exited() {
                if let Some(handle) = handle_for(session, &platform) {
                    return Ok(handle);
                }
            }
            warn!(device_id = %device.id, "agent process exited; restarting session");
            if let Some(stale) = guard.take() {
                slot.set_state(LifecycleState::Stopping);
                stale.teardown().await;
            }
        }

        slot.set_state(LifecycleState::Starting);
        let started = Instant::now();
        match self.start_with_retries(&platform, device).await {
            Ok(session) => {
                let handle = handle_for(&session, &platform).ok_or_else(|| {
                    HubError::Transport("agent session has no control port".into())
                })?;
                *guard = Some(session);
                slot.set_state(LifecycleState::Running);
                *slot.last_error.write() = None;
                histogram!(
                    "device_hub_agent_start_seconds",
                    started.elapsed().as_secs_f64(),
                    "platform" => device.platform.as_str()
                );
                counter!("device_hub_agent_starts_total", 1, "outcome" => "ok");
                self.publish_gauge();
                info!(
                    device_id = %device.id,
                    control_port = handle.endpoint.control_port,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "agent session running"
                );
                Ok(handle)
            }
            Err(err) => {
                slot.set_state(LifecycleState::Failed);
                *slot.last_error.write() = Some(err.to_string());
                counter!("device_hub_agent_starts_total", 1, "outcome" => err.metric_label());
                warn!(device_id = %device.id, error = %err, "agent session failed to start");
                Err(err)
            }
        }
    }

    async fn start_with_retries(
        &self,
        platform: &Arc<dyn DevicePlatform>,
        device: &Device,
    ) -> HubResult<AgentSession> {
        let retries = self.inner.config.start_retries;
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                result = self.start_once(platform, device) => result,
                _ = self.inner.shutdown.cancelled() => Err(HubError::ShuttingDown),
            };
            match result {
                Err(HubError::AgentStartFailed { ref cause, step, .. })
                    if !cause.is_fatal() && attempt < retries =>
                {
                    attempt += 1;
                    warn!(
                        device_id = %device.id,
                        %step,
                        error = %cause,
                        attempt,
                        "transient agent start failure; retrying"
                    );
                    let pause = self.inner.config.probe_initial_backoff * attempt;
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = self.inner.shutdown.cancelled() => return Err(HubError::ShuttingDown),
                    }
                }
                other => return other,
            }
        }
    }

    async fn start_once(
        &self,
        platform: &Arc<dyn DevicePlatform>,
        device: &Device,
    ) -> HubResult<AgentSession> {
        let plan = platform.agent_plan(device);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let mut session = AgentSession::new(device.clone(), plan, generation);

        match self.bring_up(platform, device, plan, &mut session).await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.teardown().await;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        platform: &Arc<dyn DevicePlatform>,
        device: &Device,
        plan: AgentPlan,
        session: &mut AgentSession,
    ) -> HubResult<()> {
        let failed = |step: StartStep| {
            let device_id = device.id.clone();
            move |cause: PlatformError| HubError::AgentStartFailed {
                device_id,
                step,
                cause,
            }
        };

        if plan.requires_tunnel {
            debug!(device_id = %device.id, "opening tunnel");
            let tunnel = platform
                .open_tunnel(device)
                .await
                .map_err(failed(StartStep::Tunnel))?;
            session.set_tunnel(tunnel);
        }

        let lease = self
            .inner
            .allocator
            .lease(&device.id, PortPurpose::Control)?;
        let forward = platform
            .forward(device, lease.port(), plan.control_port)
            .await
            .map_err(failed(StartStep::Forward))?;
        let endpoint = AgentEndpoint {
            device: device.clone(),
            control_port: lease.port(),
        };
        session.set_control(lease, forward);

        if platform.probe(&endpoint).await {
            debug!(device_id = %device.id, "agent already answering; reusing it");
        } else {
            let process = platform
                .launch_agent(&endpoint)
                .await
                .map_err(failed(StartStep::Launch))?;
            session.set_process(process);
            if let Err(cause) = self.wait_ready(platform, &endpoint, session).await {
                session.kill_process().await;
                return Err(failed(StartStep::WaitReady)(cause));
            }
        }

        let metadata = match self.inner.metadata.get(&device.id) {
            Some(cached) => cached,
            None => {
                let fetched = platform
                    .fetch_metadata(device)
                    .await
                    .map_err(failed(StartStep::Metadata))?;
                self.inner.metadata.put(&device.id, fetched.clone());
                fetched
            }
        };
        session.set_metadata(metadata);
        Ok(())
    }

    /// Polls the control port with exponential backoff until the agent
    /// answers, the launched process dies, or the start timeout passes.
    async fn wait_ready(
        &self,
        platform: &Arc<dyn DevicePlatform>,
        endpoint: &AgentEndpoint,
        session: &mut AgentSession,
    ) -> Result<(), PlatformError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.start_timeout;
        let mut backoff = config.probe_initial_backoff;
        loop {
            if platform.probe(endpoint).await {
                return Ok(());
            }
            if session.process_exited() {
                return Err(PlatformError::AgentUnreachable(
                    "agent process exited during startup".into(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PlatformError::Timeout(format!(
                    "agent readiness after {}s",
                    config.start_timeout.as_secs()
                )));
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(config.probe_max_backoff);
        }
    }

    /// Leases and forwards a streaming port the first time a stream of that
    /// kind is requested; later calls reuse it.
    pub async fn stream_port(
        &self,
        handle: &AgentHandle,
        purpose: PortPurpose,
        remote_port: u16,
    ) -> HubResult<u16> {
        let device = &handle.endpoint.device;
        let slot = self.slot(&device.id);
        let mut guard = slot.session.lock().await;
        let session = guard
            .as_mut()
            .filter(|session| session.generation() == handle.generation)
            .ok_or_else(|| HubError::AgentUnhealthy {
                device_id: device.id.clone(),
                cause: "agent session ended before the stream started".into(),
            })?;

        if let Some(port) = session.stream_port(purpose) {
            return Ok(port);
        }
        let lease = self.inner.allocator.lease(&device.id, purpose)?;
        let forward = handle
            .platform
            .forward(device, lease.port(), remote_port)
            .await
            .map_err(|err| HubError::device(device.id.clone(), err))?;
        let port = lease.port();
        session.add_stream(lease, forward);
        debug!(device_id = %device.id, %purpose, port, "stream port forwarded");
        Ok(port)
    }

    /// Like `ensure`, but also checks that the agent answers. A silent agent
    /// is torn down and started once more.
    pub async fn ensure_live(&self, device: &Device) -> HubResult<AgentHandle> {
        let handle = self.ensure(device).await?;
        if handle.platform.probe(&handle.endpoint).await {
            return Ok(handle);
        }
        self.mark_unhealthy(&device.id, handle.generation, "liveness probe failed")
            .await;
        // A fresh start only returns once the new agent answers.
        self.ensure(device).await
    }

    /// Runs `call` against the agent. An unreachable agent gets one
    /// transparent restart before the failure is reported.
    pub async fn with_agent<T, F, Fut>(&self, device: &Device, call: F) -> HubResult<T>
    where
        F: Fn(AgentHandle) -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let handle = self.ensure(device).await?;
        let generation = handle.generation;
        match call(handle).await {
            Ok(value) => return Ok(value),
            Err(PlatformError::AgentUnreachable(cause)) => {
                self.mark_unhealthy(&device.id, generation, &cause).await;
            }
            Err(err) => return Err(HubError::device(device.id.clone(), err)),
        }

        let handle = self.ensure(device).await?;
        let generation = handle.generation;
        match call(handle).await {
            Ok(value) => Ok(value),
            Err(PlatformError::AgentUnreachable(cause)) => {
                self.mark_unhealthy(&device.id, generation, &cause).await;
                Err(HubError::AgentUnhealthy {
                    device_id: device.id.clone(),
                    cause,
                })
            }
            Err(err) => Err(HubError::device(device.id.clone(), err)),
        }
    }

    /// Tears down the session of `device_id` if it is still the one
    /// identified by `generation`.
    pub async fn mark_unhealthy(&self, device_id: &str, generation: u64, cause: &str) {
        let Some(slot) = self.inner.slots.get(device_id).map(|slot| slot.clone()) else {
            return;
        };
        let mut guard = slot.session.lock().await;
        if !guard
            .as_ref()
            .is_some_and(|session| session.generation() == generation)
        {
            return;
        }
        warn!(device_id, cause, "agent unhealthy; tearing session down");
        counter!("device_hub_agent_unhealthy_total", 1);
        *slot.last_error.write() = Some(cause.to_string());
        if let Some(session) = guard.take() {
            slot.set_state(LifecycleState::Stopping);
            session.teardown().await;
        }
        slot.set_state(LifecycleState::Absent);
        self.publish_gauge();
    }

    /// Stops the agent session of `device_id`. Returns whether one existed.
    pub async fn stop(&self, device_id: &str) -> bool {
        let Some(slot) = self.inner.slots.get(device_id).map(|slot| slot.clone()) else {
            return false;
        };
        let stopped = stop_slot(device_id, &slot).await;
        if stopped {
            info!(device_id, "agent session stopped");
            self.publish_gauge();
        }
        stopped
    }

    pub fn snapshot(&self, device: &Device) -> SessionSnapshot {
        let Some(slot) = self.inner.slots.get(&device.id).map(|slot| slot.clone()) else {
            return SessionSnapshot::absent(device, None);
        };
        let state = slot.state();
        let last_error = slot.last_error.read().clone();
        // A startup in progress holds the lock; report its state instead of waiting.
        let snapshot = match slot.session.try_lock() {
            Ok(guard) => match guard.as_ref() {
                Some(session) => session.snapshot(state),
                None => SessionSnapshot {
                    state,
                    ..SessionSnapshot::absent(device, last_error)
                },
            },
            Err(_) => SessionSnapshot {
                state,
                ..SessionSnapshot::absent(device, last_error)
            },
        };
        snapshot
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let slots: Vec<Arc<DeviceSlot>> =
            self.inner.slots.iter().map(|slot| slot.clone()).collect();
        let mut snapshots = Vec::new();
        for slot in slots {
            if let Ok(guard) = slot.session.try_lock() {
                if let Some(session) = guard.as_ref() {
                    snapshots.push(session.snapshot(slot.state()));
                }
            }
        }
        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    pub fn running_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.state() == LifecycleState::Running)
            .count()
    }

    /// Probes every running session once; failed probes tear the session
    /// down so the next call restarts it. Failed slots settle back to absent.
    pub async fn verify_health(&self) -> usize {
        let candidates: Vec<(String, Arc<DeviceSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let mut unhealthy = 0;
        for (device_id, slot) in candidates {
            let target = match slot.session.try_lock() {
                Ok(guard) if guard.is_none() && slot.state() == LifecycleState::Failed => {
                    // The failure stays readable through last_error.
                    slot.set_state(LifecycleState::Absent);
                    None
                }
                Ok(mut guard) => guard.as_mut().and_then(|session| {
                    let exited = session.process_exited();
                    session
                        .endpoint()
                        .map(|endpoint| (endpoint, session.generation(), exited))
                }),
                Err(_) => None,
            };
            let Some((endpoint, generation, exited)) = target else {
                continue;
            };
            let Some(platform) = self.inner.platforms.get(endpoint.device.platform) else {
                continue;
            };
            let cause = if exited {
                Some("agent process exited")
            } else if !platform.probe(&endpoint).await {
                Some("liveness probe failed")
            } else {
                None
            };
            if let Some(cause) = cause {
                unhealthy += 1;
                self.mark_unhealthy(&device_id, generation, cause).await;
            }
        }
        unhealthy
    }

    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let manager = self.clone();
        let mut interval = tokio::time::interval(self.inner.config.health_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = manager.inner.shutdown.cancelled() => break,
                }
                let unhealthy = manager.verify_health().await;
                if unhealthy > 0 {
                    info!(unhealthy, "health sweep tore down sessions");
                }
            }
        })
    }

    /// Removes forwards in our port range left behind by an earlier process.
    pub async fn reclaim_stale_forwards(&self) -> usize {
        let mut reclaimed = 0;
        for platform in self.inner.platforms.iter() {
            let entries = match platform.list_forwards().await {
                Ok(entries) => entries,
                Err(err) => {
                    debug!(platform = %platform.platform(), error = %err, "cannot list forwards");
                    continue;
                }
            };
            for entry in entries
                .iter()
                .filter(|entry| self.inner.allocator.contains(entry.local_port))
            {
                match platform.remove_forward(entry).await {
                    Ok(()) => {
                        reclaimed += 1;
                        info!(
                            device_id = %entry.device_id,
                            local_port = entry.local_port,
                            "removed stale port forward"
                        );
                    }
                    Err(err) => warn!(
                        device_id = %entry.device_id,
                        local_port = entry.local_port,
                        error = %err,
                        "failed to remove stale port forward"
                    ),
                }
            }
        }
        reclaimed
    }

    /// Stops every session in parallel. Whatever has not finished within
    /// `grace` is force-terminated.
    pub async fn shutdown_all(&self, grace: Duration) {
        self.inner.shutdown.cancel();
        let slots: Vec<(String, Arc<DeviceSlot>)> = self
            .inner
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if slots.is_empty() {
            return;
        }

        let graceful = join_all(
            slots
                .iter()
                .map(|(device_id, slot)| stop_slot(device_id, slot)),
        );
        if tokio::time::timeout(grace, graceful).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "session teardown exceeded grace period; force terminating"
            );
            for (_, slot) in &slots {
                if let Ok(mut guard) = slot.session.try_lock() {
                    if let Some(mut session) = guard.take() {
                        session.force_teardown();
                    }
                }
                slot.set_state(LifecycleState::Absent);
            }
        }
        self.publish_gauge();
        info!(sessions = slots.len(), "all agent sessions stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn publish_gauge(&self) {
        gauge!("device_hub_agent_sessions_running", self.running_count() as f64);
    }
}

fn handle_for(session: &AgentSession, platform: &Arc<dyn DevicePlatform>) -> Option<AgentHandle> {
    session.endpoint().map(|endpoint| AgentHandle {
        endpoint,
        platform: Arc::clone(platform),
        plan: session.plan(),
        generation: session.generation(),
    })
}

async fn stop_slot(device_id: &str, slot: &DeviceSlot) -> bool {
    let mut guard = slot.session.lock().await;
    let Some(session) = guard.take() else {
        return false;
    };
    slot.set_state(LifecycleState::Stopping);
    session.teardown().await;
    slot.set_state(LifecycleState::Absent);
    debug!(device_id, "session slot cleared");
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceState, Platform};
    use crate::platform::mock::MockPlatform;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            start_timeout: Duration::from_millis(300),
            probe_initial_backoff: Duration::from_millis(5),
            probe_max_backoff: Duration::from_millis(20),
            start_retries: 1,
            health_interval: Duration::from_millis(50),
        }
    }

    fn manager(mock: Arc<MockPlatform>) -> SessionManager {
        SessionManager::new(
            Platforms::new().with(mock),
            PortAllocator::without_bind_check(45000..=45020),
            MetadataCache::new(Duration::from_secs(60)),
            fast_config(),
        )
    }

    fn booted(id: &str) -> Device {
        MockPlatform::device(id, DeviceKind::Emulator, DeviceState::Booted)
    }

    #[test_timeout::tokio_timeout_test]
    async fn running_session_is_reused_without_relaunch() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");

        let first = sessions.ensure(&device).await.unwrap();
        let second = sessions.ensure(&device).await.unwrap();
        assert_eq!(first.endpoint.control_port, second.endpoint.control_port);
        assert_eq!(first.generation, second.generation);
        assert_eq!(mock.launches(), 1);
        assert_eq!(sessions.state(&device.id), LifecycleState::Running);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stop_releases_every_lease() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");

        let handle = sessions.ensure(&device).await.unwrap();
        sessions
            .stream_port(&handle, PortPurpose::Video, 1717)
            .await
            .unwrap();
        assert_eq!(sessions.allocator().active_leases(), 2);

        assert!(sessions.stop(&device.id).await);
        assert_eq!(sessions.allocator().active_leases(), 0);
        assert_eq!(sessions.state(&device.id), LifecycleState::Absent);
        assert!(!sessions.stop(&device.id).await);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stream_ports_are_leased_once_per_purpose() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");
        let handle = sessions.ensure(&device).await.unwrap();

        let a = sessions.stream_port(&handle, PortPurpose::Video, 1717).await.unwrap();
        let b = sessions.stream_port(&handle, PortPurpose::Video, 1717).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(sessions.allocator().lease_count(&device.id, PortPurpose::Video), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn readiness_timeout_kills_process_and_reports_step() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        mock.set_agent_never_ready(true);
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");

        let err = sessions.ensure(&device).await.unwrap_err();
        match err {
            HubError::AgentStartFailed { step, cause, .. } => {
                assert_eq!(step, StartStep::WaitReady);
                assert!(matches!(cause, PlatformError::Timeout(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        // One retry on top of the first attempt.
        assert_eq!(mock.launches(), 2);
        assert_eq!(mock.live_processes(), 0);
        assert_eq!(sessions.allocator().active_leases(), 0);
        assert_eq!(sessions.state(&device.id), LifecycleState::Failed);
        assert!(sessions.snapshot(&device).last_error.is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn failed_state_settles_to_absent_but_keeps_the_error() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        mock.set_agent_never_ready(true);
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");

        sessions.ensure(&device).await.unwrap_err();
        assert_eq!(sessions.state(&device.id), LifecycleState::Failed);

        assert_eq!(sessions.verify_health().await, 0);
        assert_eq!(sessions.state(&device.id), LifecycleState::Absent);
        let snapshot = sessions.snapshot(&device);
        assert_eq!(snapshot.state, LifecycleState::Absent);
        assert!(snapshot.last_error.is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn ensure_live_restarts_a_silent_agent() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");

        let first = sessions.ensure(&device).await.unwrap();
        mock.stall_agents();
        let second = sessions.ensure_live(&device).await.unwrap();
        assert_ne!(first.generation, second.generation);
        assert_eq!(mock.launches(), 2);
        assert_eq!(sessions.state(&device.id), LifecycleState::Running);
        assert_eq!(sessions.allocator().active_leases(), 1);

        // A healthy agent is handed back as is.
        let third = sessions.ensure_live(&device).await.unwrap();
        assert_eq!(third.generation, second.generation);
        assert_eq!(mock.launches(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn fatal_errors_are_not_retried() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        mock.set_forward_error(Some(PlatformError::ToolMissing {
            tool: "adb".into(),
            detail: "not found".into(),
        }));
        let sessions = manager(mock.clone());

        let err = sessions.ensure(&booted("emulator-5554")).await.unwrap_err();
        assert!(matches!(
            err,
            HubError::AgentStartFailed {
                step: StartStep::Forward,
                ..
            }
        ));
        assert_eq!(mock.forwards(), 1);
        assert_eq!(sessions.allocator().active_leases(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_sweep_tears_down_dead_agents() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");
        sessions.ensure(&device).await.unwrap();

        mock.kill_agents();
        assert_eq!(sessions.verify_health().await, 1);
        assert_eq!(sessions.state(&device.id), LifecycleState::Absent);

        sessions.ensure(&device).await.unwrap();
        assert_eq!(mock.launches(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_rejects_new_sessions() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        let sessions = manager(mock.clone());
        let device = booted("emulator-5554");
        sessions.ensure(&device).await.unwrap();

        sessions.shutdown_all(Duration::from_secs(1)).await;
        assert_eq!(sessions.allocator().active_leases(), 0);
        assert!(matches!(
            sessions.ensure(&device).await,
            Err(HubError::ShuttingDown)
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn stale_forwards_in_range_are_reclaimed() {
        let mock = Arc::new(MockPlatform::new(Platform::Android));
        mock.add_stale_forward("emulator-5554", 45003, 7001);
        mock.add_stale_forward("emulator-5554", 9000, 7001);
        let sessions = manager(mock.clone());

        assert_eq!(sessions.reclaim_stale_forwards().await, 1);
        assert_eq!(mock.stale_forwards().len(), 1);
        assert_eq!(mock.stale_forwards()[0].local_port, 9000);
    }
}
