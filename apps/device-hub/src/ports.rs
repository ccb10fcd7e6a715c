use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::error::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPurpose {
    Control,
    Video,
    Audio,
}

impl fmt::Display for PortPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PortPurpose::Control => "control",
            PortPurpose::Video => "video",
            PortPurpose::Audio => "audio",
        };
        f.write_str(label)
    }
}

/// Hands out exclusive local TCP ports from a bounded range. Every lease and
/// release goes through one critical section.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<AllocatorInner>,
}

struct AllocatorInner {
    start: u16,
    end: u16,
    check_bindable: bool,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    leased: HashMap<u16, LeaseOwner>,
    cursor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LeaseOwner {
    owner: String,
    purpose: PortPurpose,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self::build(range, true)
    }

    /// Skip the bind probe; for ports that are never actually bound locally.
    pub fn without_bind_check(range: RangeInclusive<u16>) -> Self {
        Self::build(range, false)
    }

    fn build(range: RangeInclusive<u16>, check_bindable: bool) -> Self {
        let (start, end) = range.into_inner();
        Self {
            inner: Arc::new(AllocatorInner {
                start,
                end: end.max(start),
                check_bindable,
                state: Mutex::new(AllocatorState {
                    leased: HashMap::new(),
                    cursor: start,
                }),
            }),
        }
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.inner.start..=self.inner.end
    }

    pub fn contains(&self, port: u16) -> bool {
        self.range().contains(&port)
    }

    pub fn lease(&self, owner: &str, purpose: PortPurpose) -> Result<PortLease, HubError> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let span = u32::from(inner.end - inner.start) + 1;

        for _ in 0..span {
            let candidate = state.cursor;
            state.cursor = if candidate >= inner.end {
                inner.start
            } else {
                candidate + 1
            };

            if state.leased.contains_key(&candidate) {
                continue;
            }
            if inner.check_bindable && !is_bindable(candidate) {
                debug!(port = candidate, "skipping port bound by another process");
                continue;
            }

            state.leased.insert(
                candidate,
                LeaseOwner {
                    owner: owner.to_string(),
                    purpose,
                },
            );
            gauge!("device_hub_port_leases_active", state.leased.len() as f64);
            debug!(port = candidate, owner, %purpose, "port leased");
            return Ok(PortLease {
                port: candidate,
                purpose,
                owner: owner.to_string(),
                allocator: Arc::clone(inner),
            });
        }

        Err(HubError::ResourceExhausted {
            start: inner.start,
            end: inner.end,
        })
    }

    /// Number of live leases held by `owner` for `purpose`.
    pub fn lease_count(&self, owner: &str, purpose: PortPurpose) -> usize {
        self.inner
            .state
            .lock()
            .leased
            .values()
            .filter(|lease| lease.owner == owner && lease.purpose == purpose)
            .count()
    }

    pub fn active_leases(&self) -> usize {
        self.inner.state.lock().leased.len()
    }
}

impl AllocatorInner {
    fn release(&self, port: u16, owner: &str) {
        let mut state = self.state.lock();
        if state
            .leased
            .get(&port)
            .is_some_and(|lease| lease.owner == owner)
        {
            state.leased.remove(&port);
            gauge!("device_hub_port_leases_active", state.leased.len() as f64);
            debug!(port, owner, "port released");
        }
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Exclusive ownership of one local port. Returned to the allocator when
/// dropped, whatever else failed during teardown.
pub struct PortLease {
    port: u16,
    purpose: PortPurpose,
    owner: String,
    allocator: Arc<AllocatorInner>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn purpose(&self) -> PortPurpose {
        self.purpose
    }
}

impl fmt::Debug for PortLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortLease")
            .field("port", &self.port)
            .field("purpose", &self.purpose)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port, &self.owner);
    }
}
