use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use metrics::{counter, gauge};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const TOKEN_LEN: usize = 32;

/// A stream waiting for, or being read by, its one HTTP consumer.
struct StreamEntry {
    device_id: String,
    content_type: &'static str,
    created_at: Instant,
    receiver: Option<mpsc::Receiver<Bytes>>,
    producer: CancellationToken,
}

/// What the `/session` handler gets when it redeems a token.
pub struct ClaimedStream {
    pub device_id: String,
    pub content_type: &'static str,
    pub receiver: mpsc::Receiver<Bytes>,
}

/// Opaque, single-use stream tokens. An entry lives until its producer ends;
/// the receiver can be taken exactly once.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    entries: DashMap<String, StreamEntry>,
    idle_timeout: Duration,
}

impl StreamRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                idle_timeout,
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.idle_timeout
    }

    pub fn mint(
        &self,
        device_id: &str,
        content_type: &'static str,
        receiver: mpsc::Receiver<Bytes>,
        producer: CancellationToken,
    ) -> String {
        let token = loop {
            let candidate: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LEN)
                .map(char::from)
                .collect();
            if !self.inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        self.inner.entries.insert(
            token.clone(),
            StreamEntry {
                device_id: device_id.to_string(),
                content_type,
                created_at: Instant::now(),
                receiver: Some(receiver),
                producer,
            },
        );
        counter!("device_hub_stream_tokens_minted_total", 1);
        self.publish_gauge();
        debug!(device_id, content_type, "stream token minted");
        token
    }

    /// Redeems a token. `None` when unknown, already claimed or ended.
    pub fn claim(&self, token: &str) -> Option<ClaimedStream> {
        let mut entry = self.inner.entries.get_mut(token)?;
        let receiver = entry.receiver.take()?;
        Some(ClaimedStream {
            device_id: entry.device_id.clone(),
            content_type: entry.content_type,
            receiver,
        })
    }

    /// Called when the producer ends; the token stops resolving.
    pub fn invalidate(&self, token: &str) {
        if let Some((_, entry)) = self.inner.entries.remove(token) {
            entry.producer.cancel();
            self.publish_gauge();
        }
    }

    pub fn active(&self) -> usize {
        self.inner.entries.len()
    }

    /// Cancels every producer, claimed or not.
    pub fn cancel_all(&self) {
        let tokens: Vec<String> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let count = tokens.len();
        for token in tokens {
            self.invalidate(&token);
        }
        if count > 0 {
            info!(count, "cancelled open streams");
        }
    }

    /// Cancels every stream of `device_id`. Returns how many were open.
    pub fn cancel_device(&self, device_id: &str) -> usize {
        let tokens: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.device_id == device_id)
            .map(|entry| entry.key().clone())
            .collect();
        for token in &tokens {
            self.invalidate(token);
        }
        tokens.len()
    }

    /// Drops tokens nobody redeemed within the idle timeout.
    pub fn expire_idle(&self) -> usize {
        let idle_timeout = self.inner.idle_timeout;
        let expired: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.receiver.is_some() && entry.created_at.elapsed() >= idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();
        for token in &expired {
            self.invalidate(token);
        }
        if !expired.is_empty() {
            counter!("device_hub_stream_tokens_expired_total", expired.len() as u64);
            debug!(count = expired.len(), "expired unclaimed stream tokens");
        }
        expired.len()
    }

    pub fn spawn_recycler(&self, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let mut ticker = tokio::time::interval(interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                registry.expire_idle();
            }
        })
    }

    fn publish_gauge(&self) {
        gauge!("device_hub_streams_active", self.inner.entries.len() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(registry: &StreamRegistry) -> (String, CancellationToken, mpsc::Sender<Bytes>) {
        let (tx, rx) = mpsc::channel(1);
        let producer = CancellationToken::new();
        let token = registry.mint("dev-1", "video/h264", rx, producer.clone());
        (token, producer, tx)
    }

    #[test_timeout::tokio_timeout_test]
    async fn tokens_are_single_use() {
        let registry = StreamRegistry::new(Duration::from_secs(30));
        let (token, _producer, tx) = pending(&registry);
        assert_eq!(token.len(), TOKEN_LEN);

        let mut claimed = registry.claim(&token).expect("first claim succeeds");
        assert_eq!(claimed.content_type, "video/h264");
        tx.send(Bytes::from_static(b"frame")).await.unwrap();
        assert_eq!(claimed.receiver.recv().await.unwrap(), Bytes::from_static(b"frame"));

        assert!(registry.claim(&token).is_none());
        assert!(registry.claim("unknown").is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn invalidated_tokens_stop_resolving_and_cancel_the_producer() {
        let registry = StreamRegistry::new(Duration::from_secs(30));
        let (token, producer, _tx) = pending(&registry);
        registry.invalidate(&token);
        assert!(producer.is_cancelled());
        assert!(registry.claim(&token).is_none());
        assert_eq!(registry.active(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn only_unclaimed_tokens_expire() {
        let registry = StreamRegistry::new(Duration::from_millis(0));
        let (idle, idle_producer, _a) = pending(&registry);
        let (claimed, claimed_producer, _b) = pending(&registry);
        let _reader = registry.claim(&claimed).unwrap();

        assert_eq!(registry.expire_idle(), 1);
        assert!(idle_producer.is_cancelled());
        assert!(!claimed_producer.is_cancelled());
        assert!(registry.claim(&idle).is_none());

        registry.cancel_all();
        assert!(claimed_producer.is_cancelled());
        assert_eq!(registry.active(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn cancel_device_leaves_other_devices_alone() {
        let registry = StreamRegistry::new(Duration::from_secs(30));
        let (_mine, mine_producer, _a) = pending(&registry);
        let (rx_tx, rx) = mpsc::channel(1);
        let other_producer = CancellationToken::new();
        registry.mint("dev-2", "audio/ogg", rx, other_producer.clone());

        assert_eq!(registry.cancel_device("dev-1"), 1);
        assert!(mine_producer.is_cancelled());
        assert!(!other_producer.is_cancelled());
        assert_eq!(registry.active(), 1);
        drop(rx_tx);
    }
}
