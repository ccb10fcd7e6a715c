use std::fmt;

use thiserror::Error;

use crate::platform::PlatformError;

/// Lifecycle step that failed while bringing an agent up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStep {
    Tunnel,
    Forward,
    Launch,
    WaitReady,
    Metadata,
}

impl StartStep {
    pub fn as_str(self) -> &'static str {
        match self {
            StartStep::Tunnel => "tunnel",
            StartStep::Forward => "port_forward",
            StartStep::Launch => "launch",
            StartStep::WaitReady => "wait_ready",
            StartStep::Metadata => "metadata",
        }
    }
}

impl fmt::Display for StartStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("no booted device found")]
    NoDeviceFound,
    #[error("more than one booted device ({}); pass deviceId to select one", .0.join(", "))]
    AmbiguousSelection(Vec<String>),
    #[error("capture format '{format}' is not supported by device '{device_id}'")]
    UnsupportedFormat { device_id: String, format: String },
    #[error("invalid params: {0}")]
    Validation(String),
    #[error("agent start failed for '{device_id}' at step {step}: {cause}")]
    AgentStartFailed {
        device_id: String,
        step: StartStep,
        cause: PlatformError,
    },
    #[error("agent for '{device_id}' is unhealthy: {cause}")]
    AgentUnhealthy { device_id: String, cause: String },
    #[error("method '{0}' not found")]
    MethodNotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no free port left in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },
    #[error("server is shutting down")]
    ShuttingDown,
    /// Tooling or agent failure while acting on one device.
    #[error("device '{device_id}': {source}")]
    Device {
        device_id: String,
        #[source]
        source: PlatformError,
    },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl HubError {
    pub fn validation(message: impl Into<String>) -> Self {
        HubError::Validation(message.into())
    }

    pub fn device(device_id: impl Into<String>, source: PlatformError) -> Self {
        HubError::Device {
            device_id: device_id.into(),
            source,
        }
    }

    /// Device the error is scoped to, when there is one.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            HubError::DeviceNotFound(id) => Some(id),
            HubError::UnsupportedFormat { device_id, .. }
            | HubError::AgentStartFailed { device_id, .. }
            | HubError::AgentUnhealthy { device_id, .. }
            | HubError::Device { device_id, .. } => Some(device_id),
            _ => None,
        }
    }

    /// Underlying cause worth echoing back to the caller.
    pub fn cause(&self) -> Option<String> {
        match self {
            HubError::AgentStartFailed { cause, .. } => Some(cause.to_string()),
            HubError::AgentUnhealthy { cause, .. } => Some(cause.clone()),
            HubError::Device { source, .. } | HubError::Platform(source) => Some(source.to_string()),
            _ => None,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            HubError::DeviceNotFound(_) => "device_not_found",
            HubError::NoDeviceFound => "no_device_found",
            HubError::AmbiguousSelection(_) => "ambiguous_selection",
            HubError::UnsupportedFormat { .. } => "unsupported_format",
            HubError::Validation(_) => "validation",
            HubError::AgentStartFailed { .. } => "agent_start_failed",
            HubError::AgentUnhealthy { .. } => "agent_unhealthy",
            HubError::MethodNotFound(_) => "method_not_found",
            HubError::Transport(_) => "transport",
            HubError::ResourceExhausted { .. } => "resource_exhausted",
            HubError::ShuttingDown => "shutting_down",
            HubError::Device { .. } | HubError::Platform(_) => "platform",
        }
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn start_failure_message_names_step_and_cause() {
        let err = HubError::AgentStartFailed {
            device_id: "emulator-5554".into(),
            step: StartStep::WaitReady,
            cause: PlatformError::Timeout("agent readiness probe".into()),
        };
        let text = err.to_string();
        assert!(text.contains("emulator-5554"));
        assert!(text.contains("wait_ready"));
        assert!(text.contains("timed out"));
        assert_eq!(err.device_id(), Some("emulator-5554"));
        assert!(err.cause().is_some());
    }

    #[test_timeout::timeout]
    fn device_failures_keep_the_device_id() {
        let err = HubError::device(
            "emulator-5554",
            PlatformError::Agent("element not found".into()),
        );
        assert_eq!(err.device_id(), Some("emulator-5554"));
        assert_eq!(err.cause().as_deref(), Some("agent returned an error: element not found"));
        assert_eq!(err.metric_label(), "platform");
    }

    #[test_timeout::timeout]
    fn ambiguous_selection_lists_candidates() {
        let err = HubError::AmbiguousSelection(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a, b"));
        assert_eq!(err.metric_label(), "ambiguous_selection");
    }
}
