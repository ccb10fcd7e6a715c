//! Capture producers feeding HTTP consumers through bounded channels.

pub mod ogg;
pub mod tokens;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::device::Device;
use crate::error::{HubError, HubResult};
use crate::platform::{DevicePlatform, PlatformError};
use crate::ports::PortPurpose;
use crate::registry::DeviceRegistry;
use crate::session::{AgentHandle, SessionManager};

use self::ogg::OggFramer;
pub use self::tokens::{ClaimedStream, StreamRegistry};

pub const MJPEG_BOUNDARY: &str = "BoundaryString";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureFormat {
    Mjpeg,
    Avc,
    Ogg,
    Opus,
}

impl CaptureFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureFormat::Mjpeg => "mjpeg",
            CaptureFormat::Avc => "avc",
            CaptureFormat::Ogg => "ogg",
            CaptureFormat::Opus => "opus",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, CaptureFormat::Ogg | CaptureFormat::Opus)
    }

    pub fn content_type(self) -> &'static str {
        match self {
            CaptureFormat::Mjpeg => "multipart/x-mixed-replace; boundary=BoundaryString",
            CaptureFormat::Avc => "video/h264",
            CaptureFormat::Ogg => "audio/ogg",
            CaptureFormat::Opus => "application/octet-stream",
        }
    }

    fn port_purpose(self) -> PortPurpose {
        if self.is_audio() {
            PortPurpose::Audio
        } else {
            PortPurpose::Video
        }
    }
}

impl fmt::Display for CaptureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaptureFormat {
    type Err = HubError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" => Ok(CaptureFormat::Mjpeg),
            "avc" | "h264" => Ok(CaptureFormat::Avc),
            "ogg" => Ok(CaptureFormat::Ogg),
            "opus" => Ok(CaptureFormat::Opus),
            other => Err(HubError::validation(format!("unknown capture format '{other}'"))),
        }
    }
}

pub const DEFAULT_QUALITY: u8 = 80;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_SCALE: f64 = 1.0;

/// Validated capture parameters handed to the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub format: CaptureFormat,
    pub quality: u8,
    pub scale: f64,
    pub fps: u32,
}

impl CaptureRequest {
    /// Zero or missing numeric values fall back to defaults.
    pub fn video(
        format: CaptureFormat,
        quality: Option<u32>,
        scale: Option<f64>,
        fps: Option<u32>,
    ) -> HubResult<Self> {
        if format.is_audio() {
            return Err(HubError::validation(format!(
                "'{format}' is an audio format; use device.audiocapture"
            )));
        }

        let quality = match quality.unwrap_or(0) {
            0 => DEFAULT_QUALITY,
            q @ 1..=100 => q as u8,
            q => return Err(HubError::validation(format!("quality must be 1-100, got {q}"))),
        };
        let fps = match fps.unwrap_or(0) {
            0 => DEFAULT_FPS,
            f @ 1..=60 => f,
            f => return Err(HubError::validation(format!("fps must be 1-60, got {f}"))),
        };
        let scale = match scale.unwrap_or(0.0) {
            s if s == 0.0 => DEFAULT_SCALE,
            s if s > 0.0 && s <= 1.0 => s,
            s => return Err(HubError::validation(format!("scale must be in (0, 1], got {s}"))),
        };

        Ok(Self {
            format,
            quality,
            scale,
            fps,
        })
    }

    pub fn audio(format: CaptureFormat) -> HubResult<Self> {
        if !format.is_audio() {
            return Err(HubError::validation(format!(
                "'{format}' is a video format; use device.screencapture"
            )));
        }
        Ok(Self {
            format,
            quality: DEFAULT_QUALITY,
            scale: DEFAULT_SCALE,
            fps: 0,
        })
    }
}

/// Producer side of one stream. Once `push` has returned `false` the sink
/// stays closed and nothing more reaches the consumer.
pub struct CaptureSink {
    tx: mpsc::Sender<Bytes>,
    progress: mpsc::Sender<String>,
    framer: Option<OggFramer>,
    closed: bool,
    units: u64,
    bytes: u64,
}

impl CaptureSink {
    pub fn new(
        format: CaptureFormat,
        tx: mpsc::Sender<Bytes>,
        progress: mpsc::Sender<String>,
    ) -> Self {
        let framer = matches!(format, CaptureFormat::Ogg).then(|| OggFramer::new(rand::random()));
        Self {
            tx,
            progress,
            framer,
            closed: false,
            units: 0,
            bytes: 0,
        }
    }

    /// Sink plus the receiving ends of its payload and progress channels.
    pub fn channel(
        format: CaptureFormat,
        depth: usize,
        progress_depth: usize,
    ) -> (Self, mpsc::Receiver<Bytes>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let (progress_tx, progress_rx) = mpsc::channel(progress_depth.max(1));
        (Self::new(format, tx, progress_tx), rx, progress_rx)
    }

    pub async fn push(&mut self, unit: Bytes) -> bool {
        if self.closed {
            return false;
        }
        let payload = match self.framer.as_mut() {
            Some(framer) => framer.frame(&unit),
            None => unit,
        };
        let len = payload.len() as u64;
        if self.tx.send(payload).await.is_err() {
            self.closed = true;
            return false;
        }
        self.units += 1;
        self.bytes += len;
        true
    }

    /// Best effort; dropped when the progress channel is full.
    pub fn progress(&self, message: impl Into<String>) {
        let _ = self.progress.try_send(message.into());
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn units(&self) -> u64 {
        self.units
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Emits the Ogg end-of-stream page when the source ended on its own.
    pub async fn finish(&mut self) {
        if self.closed {
            return;
        }
        if let Some(page) = self.framer.as_mut().and_then(OggFramer::finish) {
            if self.tx.send(page).await.is_err() {
                self.closed = true;
            }
        }
    }

    fn consumer_handle(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub channel_depth: usize,
    pub progress_depth: usize,
    pub idle_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_depth: 4,
            progress_depth: 16,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Indirection returned to JSON-RPC callers; the bytes are fetched with a
/// plain GET on `url`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRedirect {
    pub url: String,
    pub content_type: String,
    pub expires_in_secs: u64,
}

#[derive(Clone)]
pub struct StreamPipeline {
    registry: DeviceRegistry,
    sessions: SessionManager,
    tokens: StreamRegistry,
    config: StreamConfig,
}

impl StreamPipeline {
    pub fn new(registry: DeviceRegistry, sessions: SessionManager, config: StreamConfig) -> Self {
        let tokens = StreamRegistry::new(config.idle_timeout);
        Self {
            registry,
            sessions,
            tokens,
            config,
        }
    }

    pub fn tokens(&self) -> &StreamRegistry {
        &self.tokens
    }

    /// Ends every stream of `device_id`, claimed or not.
    pub fn stop_device(&self, device_id: &str) -> usize {
        let cancelled = self.tokens.cancel_device(device_id);
        if cancelled > 0 {
            info!(device_id, cancelled, "capture streams cancelled");
        }
        cancelled
    }

    pub async fn start(&self, device: &Device, request: CaptureRequest) -> HubResult<StreamRedirect> {
        let platform = self.registry.platform(device.platform)?;
        if !platform.capabilities(device).supports(request.format) {
            return Err(HubError::UnsupportedFormat {
                device_id: device.id.clone(),
                format: request.format.to_string(),
            });
        }

        let handle = self.sessions.ensure_live(device).await?;
        let remote_port = handle.plan.stream_port(request.format);
        let stream_port = self
            .sessions
            .stream_port(&handle, request.format.port_purpose(), remote_port)
            .await?;

        let (sink, receiver, progress) = CaptureSink::channel(
            request.format,
            self.config.channel_depth,
            self.config.progress_depth,
        );
        let producer = CancellationToken::new();
        let content_type = request.format.content_type();
        let token = self
            .tokens
            .mint(&device.id, content_type, receiver, producer.clone());

        tokio::spawn(log_progress(device.id.clone(), progress));
        tokio::spawn(run_capture(CaptureJob {
            platform,
            handle,
            stream_port,
            request,
            sink,
            producer,
            token: token.clone(),
            tokens: self.tokens.clone(),
            sessions: self.sessions.clone(),
        }));

        info!(device_id = %device.id, stream_port, "capture stream started");
        Ok(StreamRedirect {
            url: format!("/session?s={token}"),
            content_type: content_type.to_string(),
            expires_in_secs: self.config.idle_timeout.as_secs(),
        })
    }
}

struct CaptureJob {
    platform: Arc<dyn DevicePlatform>,
    handle: AgentHandle,
    stream_port: u16,
    request: CaptureRequest,
    sink: CaptureSink,
    producer: CancellationToken,
    token: String,
    tokens: StreamRegistry,
    sessions: SessionManager,
}

async fn run_capture(job: CaptureJob) {
    let CaptureJob {
        platform,
        handle,
        stream_port,
        request,
        mut sink,
        producer,
        token,
        tokens,
        sessions,
    } = job;
    let device_id = handle.endpoint.device.id.clone();
    let started = Instant::now();
    let consumer = sink.consumer_handle();

    let outcome = tokio::select! {
        result = platform.capture(&handle.endpoint, stream_port, &request, &mut sink) => Some(result),
        _ = consumer.closed() => None,
        _ = producer.cancelled() => None,
    };
    drop(consumer);

    let label = match outcome {
        Some(Ok(())) => {
            sink.finish().await;
            "completed"
        }
        Some(Err(err)) => {
            warn!(device_id = %device_id, format = %request.format, error = %err, "capture failed");
            if matches!(err, PlatformError::AgentUnreachable(_)) {
                sessions
                    .mark_unhealthy(&device_id, handle.generation, &err.to_string())
                    .await;
            }
            "failed"
        }
        None => "cancelled",
    };

    tokens.invalidate(&token);
    counter!(
        "device_hub_streams_total",
        1,
        "format" => request.format.as_str(),
        "outcome" => label
    );
    histogram!(
        "device_hub_stream_duration_seconds",
        started.elapsed().as_secs_f64(),
        "format" => request.format.as_str()
    );
    info!(
        device_id = %device_id,
        format = %request.format,
        outcome = label,
        units = sink.units(),
        bytes = sink.bytes(),
        "capture stream ended"
    );
}

async fn log_progress(device_id: String, mut progress: mpsc::Receiver<String>) {
    while let Some(message) = progress.recv().await {
        debug!(device_id = %device_id, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn zero_means_default() {
        let request = CaptureRequest::video(CaptureFormat::Mjpeg, Some(0), Some(0.0), None).unwrap();
        assert_eq!(request.quality, DEFAULT_QUALITY);
        assert_eq!(request.fps, DEFAULT_FPS);
        assert_eq!(request.scale, DEFAULT_SCALE);
    }

    #[test_timeout::timeout]
    fn out_of_range_values_are_rejected() {
        let cases = [
            CaptureRequest::video(CaptureFormat::Mjpeg, Some(101), None, None),
            CaptureRequest::video(CaptureFormat::Mjpeg, None, None, Some(61)),
            CaptureRequest::video(CaptureFormat::Mjpeg, None, Some(1.5), None),
            CaptureRequest::video(CaptureFormat::Mjpeg, None, Some(-0.5), None),
            CaptureRequest::video(CaptureFormat::Ogg, None, None, None),
            CaptureRequest::audio(CaptureFormat::Avc),
        ];
        for case in cases {
            assert!(matches!(case, Err(HubError::Validation(_))), "{case:?}");
        }
    }

    #[test_timeout::timeout]
    fn format_names_parse_case_insensitively() {
        assert_eq!("MJPEG".parse::<CaptureFormat>().unwrap(), CaptureFormat::Mjpeg);
        assert_eq!("h264".parse::<CaptureFormat>().unwrap(), CaptureFormat::Avc);
        assert!("webm".parse::<CaptureFormat>().is_err());
        assert!(CaptureFormat::Mjpeg.content_type().contains(MJPEG_BOUNDARY));
    }

    #[test_timeout::tokio_timeout_test]
    async fn push_stays_false_after_consumer_leaves() {
        let (mut sink, receiver, _progress) = CaptureSink::channel(CaptureFormat::Mjpeg, 1, 1);
        assert!(sink.push(Bytes::from_static(b"one")).await);
        drop(receiver);
        assert!(!sink.push(Bytes::from_static(b"two")).await);
        assert!(sink.is_closed());
        assert!(!sink.push(Bytes::from_static(b"three")).await);
        assert_eq!(sink.units(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn progress_never_blocks_or_mixes_with_payload() {
        let (mut sink, mut receiver, mut progress) =
            CaptureSink::channel(CaptureFormat::Avc, 2, 1);
        sink.progress("first");
        sink.progress("dropped");
        assert!(sink.push(Bytes::from_static(b"nal")).await);
        assert_eq!(progress.recv().await.unwrap(), "first");
        assert!(progress.try_recv().is_err());
        assert_eq!(receiver.recv().await.unwrap(), Bytes::from_static(b"nal"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn ogg_sinks_frame_packets_and_close_with_eos() {
        let (mut sink, mut receiver, _progress) = CaptureSink::channel(CaptureFormat::Ogg, 4, 1);
        assert!(sink.push(Bytes::from_static(&[0xfc, 0xff])).await);
        sink.finish().await;
        drop(sink);

        let first = receiver.recv().await.unwrap();
        assert!(first.starts_with(b"OggS"));
        assert!(first.windows(8).any(|window| window == b"OpusHead"));
        let last = receiver.recv().await.unwrap();
        assert_eq!(last[5], 0x04);
        assert!(receiver.recv().await.is_none());
    }
}
