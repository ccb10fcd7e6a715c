//! Reading capture data off a forwarded agent stream port.
//!
//! Agents write video frames and audio packets as `u32` big-endian length
//! prefixed records; H.264 and ready-made MJPEG are plain byte streams.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};
use tokio::net::TcpStream;

use super::PlatformError;
use crate::stream::{CaptureFormat, CaptureSink, MJPEG_BOUNDARY};

const MAX_RECORD: usize = 8 * 1024 * 1024;
const RAW_CHUNK: usize = 64 * 1024;

pub async fn connect(stream_port: u16) -> Result<TcpStream, PlatformError> {
    TcpStream::connect(("127.0.0.1", stream_port))
        .await
        .map_err(|err| PlatformError::AgentUnreachable(format!("stream port {stream_port}: {err}")))
}

/// Consumes an HTTP response head, leaving `reader` at the first body byte.
pub async fn skip_http_head<R>(reader: &mut R) -> Result<(), PlatformError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(PlatformError::AgentUnreachable(
                "stream closed before response headers".to_string(),
            ));
        }
        if line == "\r\n" || line == "\n" {
            return Ok(());
        }
    }
}

/// Wraps one JPEG image as a `multipart/x-mixed-replace` part.
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part.freeze()
}

/// Pumps length-prefixed records into `sink` until EOF or the consumer
/// leaves. JPEG frames are wrapped as multipart parts on the way.
pub async fn pump_records<R>(
    reader: &mut R,
    format: CaptureFormat,
    sink: &mut CaptureSink,
) -> Result<(), PlatformError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if len > MAX_RECORD {
            return Err(PlatformError::Agent(format!(
                "stream record of {len} bytes exceeds limit"
            )));
        }
        let mut record = vec![0u8; len];
        reader.read_exact(&mut record).await?;

        let unit = match format {
            CaptureFormat::Mjpeg => mjpeg_part(&record),
            _ => Bytes::from(record),
        };
        if !sink.push(unit).await {
            return Ok(());
        }
    }
}

/// Pumps an unframed byte stream (H.264 Annex B, MJPEG over HTTP).
pub async fn pump_raw<R>(reader: &mut R, sink: &mut CaptureSink) -> Result<(), PlatformError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(RAW_CHUNK);
    loop {
        buf.reserve(RAW_CHUNK);
        let read = reader.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        if !sink.push(buf.split().freeze()).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn length_prefixed_jpegs_become_multipart_parts() {
        let mut wire = Vec::new();
        for frame in [&b"\xff\xd8one\xff\xd9"[..], &b"\xff\xd8two\xff\xd9"[..]] {
            wire.extend_from_slice(&(frame.len() as u32).to_be_bytes());
            wire.extend_from_slice(frame);
        }
        let (mut sink, mut rx, _progress) = CaptureSink::channel(CaptureFormat::Mjpeg, 4, 1);
        pump_records(&mut wire.as_slice(), CaptureFormat::Mjpeg, &mut sink)
            .await
            .unwrap();
        drop(sink);

        let first = rx.recv().await.unwrap();
        assert!(first.starts_with(b"--BoundaryString\r\n"));
        assert!(first.ends_with(b"\xff\xd9\r\n"));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn raw_pump_stops_when_consumer_leaves() {
        let data = vec![7u8; 4 * RAW_CHUNK];
        let (mut sink, rx, _progress) = CaptureSink::channel(CaptureFormat::Avc, 1, 1);
        drop(rx);
        pump_raw(&mut data.as_slice(), &mut sink).await.unwrap();
        assert!(sink.is_closed());
    }

    #[test_timeout::tokio_timeout_test]
    async fn http_head_is_skipped_before_body() {
        let wire = b"HTTP/1.0 200 OK\r\nContent-Type: multipart/x-mixed-replace\r\n\r\n--BoundaryString";
        let mut reader = tokio::io::BufReader::new(&wire[..]);
        skip_http_head(&mut reader).await.unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"--BoundaryString");
    }

    #[test_timeout::tokio_timeout_test]
    async fn truncated_record_is_an_error() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let (mut sink, _rx, _progress) = CaptureSink::channel(CaptureFormat::Opus, 4, 1);
        let err = pump_records(&mut wire.as_slice(), CaptureFormat::Opus, &mut sink)
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Io(_)));
    }
}
