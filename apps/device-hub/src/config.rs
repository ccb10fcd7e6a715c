use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::device::{DeviceKind, DeviceState, Platform};
use crate::platform::android::{AndroidPlatform, AndroidTools};
use crate::platform::ios::{IosPlatform, IosTools};
use crate::platform::mock::MockPlatform;
use crate::platform::{DevicePlatform, Platforms};
use crate::session::SessionConfig;
use crate::stream::StreamConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "device-hub",
    author,
    version,
    about = "JSON-RPC control plane for Android and iOS devices"
)]
pub struct Cli {
    /// Address the HTTP/WebSocket listener binds to.
    #[arg(long, env = "DEVICE_HUB_LISTEN_ADDR", default_value = "127.0.0.1:7100")]
    pub listen_addr: String,

    /// Local ports available for agent forwards, as `start-end`.
    #[arg(long, env = "DEVICE_HUB_PORT_RANGE", default_value = "27100-27299")]
    pub port_range: String,

    /// Comma separated platform families to enable.
    #[arg(long, env = "DEVICE_HUB_PLATFORMS", default_value = "android,ios")]
    pub platforms: String,

    /// Serve in-memory fake devices instead of driving real tooling.
    #[arg(long, env = "DEVICE_HUB_MOCK", default_value_t = false)]
    pub mock: bool,

    #[arg(long, env = "DEVICE_HUB_AGENT_START_TIMEOUT_SECS", default_value_t = 30)]
    pub agent_start_timeout_secs: u64,

    #[arg(long, env = "DEVICE_HUB_PROBE_INITIAL_BACKOFF_MS", default_value_t = 100)]
    pub probe_initial_backoff_ms: u64,

    #[arg(long, env = "DEVICE_HUB_PROBE_MAX_BACKOFF_MS", default_value_t = 2000)]
    pub probe_max_backoff_ms: u64,

    /// Extra attempts after a transient agent startup failure.
    #[arg(long, env = "DEVICE_HUB_START_RETRIES", default_value_t = 2)]
    pub start_retries: u32,

    /// Seconds between liveness sweeps over running agents.
    #[arg(long, env = "DEVICE_HUB_HEALTH_INTERVAL_SECS", default_value_t = 15)]
    pub health_interval_secs: u64,

    /// Unclaimed stream tokens are dropped after this many seconds.
    #[arg(long, env = "DEVICE_HUB_STREAM_IDLE_TIMEOUT_SECS", default_value_t = 30)]
    pub stream_idle_timeout_secs: u64,

    #[arg(long, env = "DEVICE_HUB_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    #[arg(long, env = "DEVICE_HUB_METADATA_TTL_SECS", default_value_t = 300)]
    pub metadata_ttl_secs: u64,

    #[arg(long, env = "DEVICE_HUB_ADB", default_value = "adb")]
    pub adb: String,

    #[arg(long, env = "DEVICE_HUB_EMULATOR", default_value = "emulator")]
    pub emulator: String,

    #[arg(long, env = "DEVICE_HUB_XCRUN", default_value = "xcrun")]
    pub xcrun: String,

    /// go-ios binary used for real iOS devices.
    #[arg(long, env = "DEVICE_HUB_GO_IOS", default_value = "ios")]
    pub go_ios: String,

    #[arg(long, env = "DEVICE_HUB_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub port_range: RangeInclusive<u16>,
    pub platforms: Vec<Platform>,
    pub mock: bool,
    pub session: SessionConfig,
    pub stream: StreamConfig,
    pub shutdown_grace: Duration,
    pub metadata_ttl: Duration,
    pub android: AndroidTools,
    pub ios: IosTools,
    pub log_format: LogFormat,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let port_range = parse_port_range(&cli.port_range)?;
        let platforms = parse_platforms(&cli.platforms)?;
        if cli.agent_start_timeout_secs == 0 {
            bail!("agent start timeout must be greater than zero");
        }
        if cli.probe_initial_backoff_ms == 0 || cli.probe_max_backoff_ms < cli.probe_initial_backoff_ms
        {
            bail!(
                "probe backoff must satisfy 0 < initial ({}) <= max ({})",
                cli.probe_initial_backoff_ms,
                cli.probe_max_backoff_ms
            );
        }
        if cli.health_interval_secs == 0 || cli.stream_idle_timeout_secs == 0 {
            bail!("health interval and stream idle timeout must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            port_range,
            platforms,
            mock: cli.mock,
            session: SessionConfig {
                start_timeout: Duration::from_secs(cli.agent_start_timeout_secs),
                probe_initial_backoff: Duration::from_millis(cli.probe_initial_backoff_ms),
                probe_max_backoff: Duration::from_millis(cli.probe_max_backoff_ms),
                start_retries: cli.start_retries,
                health_interval: Duration::from_secs(cli.health_interval_secs),
            },
            stream: StreamConfig {
                idle_timeout: Duration::from_secs(cli.stream_idle_timeout_secs),
                ..StreamConfig::default()
            },
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            metadata_ttl: Duration::from_secs(cli.metadata_ttl_secs),
            android: AndroidTools {
                adb: cli.adb,
                emulator: cli.emulator,
            },
            ios: IosTools {
                xcrun: cli.xcrun,
                go_ios: cli.go_ios,
            },
            log_format: cli.log_format,
        })
    }
}

impl ServerConfig {
    /// Instantiates the enabled platform families.
    pub fn build_platforms(&self) -> Platforms {
        let mut platforms = Platforms::new();
        for platform in &self.platforms {
            let instance: Arc<dyn DevicePlatform> = match (self.mock, platform) {
                (true, Platform::Android) => Arc::new(MockPlatform::new(Platform::Android).with_devices(vec![
                    MockPlatform::device("emulator-5554", DeviceKind::Emulator, DeviceState::Booted),
                    MockPlatform::device("Pixel_7_API_34", DeviceKind::Emulator, DeviceState::Offline),
                ])),
                (true, Platform::Ios) => Arc::new(MockPlatform::new(Platform::Ios).with_devices(vec![
                    MockPlatform::device(
                        "5A0C3E7E-0000-4000-8000-000000000001",
                        DeviceKind::Simulator,
                        DeviceState::Booted,
                    ),
                ])),
                (false, Platform::Android) => Arc::new(AndroidPlatform::new(self.android.clone())),
                (false, Platform::Ios) => Arc::new(IosPlatform::new(self.ios.clone())),
            };
            platforms = platforms.with(instance);
        }
        platforms
    }
}

pub fn parse_port_range(value: &str) -> Result<RangeInclusive<u16>> {
    let (start, end) = value
        .split_once('-')
        .with_context(|| format!("port range '{value}' must look like start-end"))?;
    let start: u16 = start
        .trim()
        .parse()
        .with_context(|| format!("invalid port range start in '{value}'"))?;
    let end: u16 = end
        .trim()
        .parse()
        .with_context(|| format!("invalid port range end in '{value}'"))?;
    if start == 0 || start > end {
        bail!("port range '{value}' is empty or starts at 0");
    }
    Ok(start..=end)
}

pub fn parse_platforms(value: &str) -> Result<Vec<Platform>> {
    let mut platforms = Vec::new();
    for name in value.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        let platform: Platform = name.parse().map_err(anyhow::Error::msg)?;
        if !platforms.contains(&platform) {
            platforms.push(platform);
        }
    }
    if platforms.is_empty() {
        bail!("at least one platform must be enabled");
    }
    Ok(platforms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["device-hub"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let config = ServerConfig::try_from(cli(&[])).unwrap();
        assert_eq!(config.port_range, 27100..=27299);
        assert_eq!(config.session.start_timeout, Duration::from_secs(30));
        assert_eq!(config.session.probe_initial_backoff, Duration::from_millis(100));
        assert_eq!(config.session.probe_max_backoff, Duration::from_secs(2));
        assert_eq!(config.session.start_retries, 2);
        assert_eq!(config.stream.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.metadata_ttl, Duration::from_secs(300));
        assert_eq!(config.platforms, vec![Platform::Android, Platform::Ios]);
    }

    #[test_timeout::timeout]
    fn rejects_bad_listen_address() {
        let err = ServerConfig::try_from(cli(&["--listen-addr", "not-an-addr"])).unwrap_err();
        assert!(err.to_string().contains("invalid listen address"));
    }

    #[test_timeout::timeout]
    fn port_range_must_be_ordered() {
        assert_eq!(parse_port_range("100-200").unwrap(), 100..=200);
        assert!(parse_port_range("200-100").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("27100").is_err());
    }

    #[test_timeout::timeout]
    fn platforms_are_deduplicated() {
        assert_eq!(
            parse_platforms("ios, ios,android").unwrap(),
            vec![Platform::Ios, Platform::Android]
        );
        assert!(parse_platforms("windows").is_err());
        assert!(parse_platforms(" , ").is_err());
    }

    #[test_timeout::timeout]
    fn mock_mode_builds_fake_platforms() {
        let config = ServerConfig::try_from(cli(&["--mock", "--platforms", "android"])).unwrap();
        let platforms = config.build_platforms();
        assert!(platforms.get(Platform::Android).is_some());
        assert!(platforms.get(Platform::Ios).is_none());
    }
}
