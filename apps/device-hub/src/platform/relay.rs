use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PlatformError, Resource};

/// In-process port forward: accepts on a local port and relays every
/// connection to `target`. Used where the device shares the host network
/// (simulators) and no platform tool is needed to reach it.
pub struct TcpRelay {
    label: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TcpRelay {
    pub async fn bind(local_port: u16, target: SocketAddr) -> Result<Self, PlatformError> {
        let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let label = format!("relay {local_addr} -> {target}");

        let accept_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((inbound, peer)) => {
                        let conn_cancel = accept_cancel.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = conn_cancel.cancelled() => {}
                                result = relay_connection(inbound, target) => {
                                    if let Err(err) = result {
                                        debug!(%peer, %target, error = %err, "relay connection ended");
                                    }
                                }
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%target, error = %err, "relay accept failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            label,
            local_addr,
            cancel,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn relay_connection(mut inbound: TcpStream, target: SocketAddr) -> std::io::Result<()> {
    let mut outbound = TcpStream::connect(target).await?;
    copy_bidirectional(&mut inbound, &mut outbound).await?;
    Ok(())
}

#[async_trait]
impl Resource for TcpRelay {
    fn label(&self) -> &str {
        &self.label
    }

    async fn close(mut self: Box<Self>) -> Result<(), PlatformError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    fn force_close(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test_timeout::tokio_timeout_test(10)]
    async fn relays_bytes_both_ways_until_closed() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = echo.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let relay = TcpRelay::bind(0, echo_addr).await.unwrap();
        let relay_addr = relay.local_addr();

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        Box::new(relay).close().await.unwrap();
        assert!(TcpStream::connect(relay_addr).await.is_err());
    }
}
