use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::device::{Device, DeviceFilter, DeviceMetadata, Platform};
use crate::error::{HubError, HubResult};
use crate::platform::{DevicePlatform, Platforms};

/// Short-lived cache of per-device metadata shared by the registry and the
/// session manager.
#[derive(Clone)]
pub struct MetadataCache {
    entries: Arc<DashMap<String, (DeviceMetadata, Instant)>>,
    ttl: Duration,
}

impl MetadataCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceMetadata> {
        let expired = match self.entries.get(device_id) {
            Some(entry) if entry.1.elapsed() <= self.ttl => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(device_id);
        }
        None
    }

    pub fn put(&self, device_id: &str, metadata: DeviceMetadata) {
        self.entries
            .insert(device_id.to_string(), (metadata, Instant::now()));
    }

    pub fn invalidate(&self, device_id: &str) {
        self.entries.remove(device_id);
    }
}

/// Answers "what devices exist" without touching session state.
#[derive(Clone)]
pub struct DeviceRegistry {
    platforms: Platforms,
    metadata: MetadataCache,
}

impl DeviceRegistry {
    pub fn new(platforms: Platforms, metadata: MetadataCache) -> Self {
        Self {
            platforms,
            metadata,
        }
    }

    pub fn platforms(&self) -> &Platforms {
        &self.platforms
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn platform(&self, platform: Platform) -> HubResult<Arc<dyn DevicePlatform>> {
        self.platforms
            .get(platform)
            .ok_or_else(|| HubError::validation(format!("platform '{platform}' is not enabled")))
    }

    pub async fn list(&self, filter: &DeviceFilter) -> HubResult<Vec<Device>> {
        let selected: Vec<Arc<dyn DevicePlatform>> = self
            .platforms
            .iter()
            .filter(|platform| filter.platform.map_or(true, |p| p == platform.platform()))
            .cloned()
            .collect();

        if let Some(wanted) = filter.platform {
            if selected.is_empty() {
                return Err(HubError::validation(format!(
                    "platform '{wanted}' is not enabled"
                )));
            }
        }

        let results = join_all(selected.iter().map(|platform| async move {
            (platform.platform(), platform.enumerate(filter.include_offline).await)
        }))
        .await;

        let mut devices = Vec::new();
        for (platform, result) in results {
            match result {
                Ok(found) => {
                    debug!(%platform, count = found.len(), "enumerated devices");
                    devices.extend(found);
                }
                Err(err) if filter.platform == Some(platform) => return Err(err.into()),
                Err(err) => {
                    warn!(%platform, error = %err, "device enumeration failed; skipping platform");
                }
            }
        }

        devices.retain(|device| filter.matches(device));
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices.dedup_by(|a, b| a.id == b.id);

        for device in &devices {
            self.remember(device);
        }
        Ok(devices)
    }

    /// Resolves an explicit id, or auto-selects the only booted device.
    pub async fn resolve(&self, id: Option<&str>) -> HubResult<Device> {
        let id = id.map(str::trim).filter(|id| !id.is_empty());
        let booted = self.list(&DeviceFilter::booted()).await?;

        let Some(id) = id else {
            return match booted.len() {
                0 => Err(HubError::NoDeviceFound),
                1 => Ok(booted.into_iter().next().ok_or(HubError::NoDeviceFound)?),
                _ => Err(HubError::AmbiguousSelection(
                    booted.into_iter().map(|device| device.id).collect(),
                )),
            };
        };

        if let Some(device) = booted.into_iter().find(|device| device.id == id) {
            return Ok(device);
        }

        self.list(&DeviceFilter::all())
            .await?
            .into_iter()
            .find(|device| device.id == id)
            .ok_or_else(|| HubError::DeviceNotFound(id.to_string()))
    }

    fn remember(&self, device: &Device) {
        if device.name.is_empty() || device.os_version.is_empty() {
            return;
        }
        if self.metadata.get(&device.id).is_none() {
            self.metadata.put(
                &device.id,
                DeviceMetadata {
                    name: device.name.clone(),
                    os_version: device.os_version.clone(),
                    model: None,
                    screen: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, DeviceState};
    use crate::platform::mock::MockPlatform;

    fn registry_with(devices: Vec<Device>) -> DeviceRegistry {
        let mock = Arc::new(MockPlatform::new(Platform::Android).with_devices(devices));
        DeviceRegistry::new(
            Platforms::new().with(mock),
            MetadataCache::new(Duration::from_secs(60)),
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn list_excludes_offline_unless_requested() {
        let registry = registry_with(vec![
            MockPlatform::device("pixel", DeviceKind::Real, DeviceState::Booted),
            MockPlatform::device("avd-1", DeviceKind::Emulator, DeviceState::Offline),
        ]);

        let booted = registry.list(&DeviceFilter::default()).await.unwrap();
        assert_eq!(booted.len(), 1);
        assert!(booted.iter().all(Device::is_booted));

        let all = registry.list(&DeviceFilter::all()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn resolve_without_id_requires_exactly_one_booted_device() {
        let none = registry_with(vec![MockPlatform::device(
            "avd-1",
            DeviceKind::Emulator,
            DeviceState::Offline,
        )]);
        assert!(matches!(
            none.resolve(None).await,
            Err(HubError::NoDeviceFound)
        ));

        let two = registry_with(vec![
            MockPlatform::device("a", DeviceKind::Real, DeviceState::Booted),
            MockPlatform::device("b", DeviceKind::Real, DeviceState::Booted),
        ]);
        match two.resolve(Some("  ")).await {
            Err(HubError::AmbiguousSelection(ids)) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("unexpected: {other:?}"),
        }

        let one = registry_with(vec![MockPlatform::device(
            "only",
            DeviceKind::Real,
            DeviceState::Booted,
        )]);
        assert_eq!(one.resolve(None).await.unwrap().id, "only");
    }

    #[test_timeout::tokio_timeout_test]
    async fn resolve_finds_offline_devices_by_id() {
        let registry = registry_with(vec![MockPlatform::device(
            "avd-1",
            DeviceKind::Emulator,
            DeviceState::Offline,
        )]);
        let device = registry.resolve(Some("avd-1")).await.unwrap();
        assert_eq!(device.state, DeviceState::Offline);

        assert!(matches!(
            registry.resolve(Some("missing")).await,
            Err(HubError::DeviceNotFound(id)) if id == "missing"
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn enumeration_populates_metadata_cache() {
        let registry = registry_with(vec![MockPlatform::device(
            "pixel",
            DeviceKind::Real,
            DeviceState::Booted,
        )]);
        assert!(registry.metadata().get("pixel").is_none());
        registry.list(&DeviceFilter::default()).await.unwrap();
        let cached = registry.metadata().get("pixel").unwrap();
        assert_eq!(cached.name, "pixel");
    }

    #[test_timeout::timeout]
    fn metadata_entries_expire() {
        let cache = MetadataCache::new(Duration::from_millis(0));
        cache.put(
            "x",
            DeviceMetadata {
                name: "x".into(),
                os_version: "1".into(),
                model: None,
                screen: None,
            },
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("x").is_none());
    }
}
