use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Real,
    Simulator,
    Emulator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Offline,
    Booted,
}

/// Normalized device descriptor. Produced fresh by every registry query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub platform: Platform,
    pub kind: DeviceKind,
    pub state: DeviceState,
    #[serde(rename = "displayName")]
    pub name: String,
    pub os_version: String,
}

impl Device {
    pub fn is_booted(&self) -> bool {
        matches!(self.state, DeviceState::Booted)
    }

    /// Major component of `os_version`, `0` when it cannot be parsed.
    pub fn os_major(&self) -> u32 {
        self.os_version
            .split('.')
            .next()
            .and_then(|major| major.trim().parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFilter {
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default, alias = "type")]
    pub kind: Option<DeviceKind>,
    #[serde(default)]
    pub include_offline: bool,
}

impl DeviceFilter {
    pub fn booted() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            include_offline: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        if !self.include_offline && !device.is_booted() {
            return false;
        }
        if let Some(platform) = self.platform {
            if device.platform != platform {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if device.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Details learned about a device that are expensive to fetch repeatedly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadata {
    pub name: String,
    pub os_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen: Option<ScreenSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}
