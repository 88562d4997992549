//! Core prefix value types and the receiver contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv6Net;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::ReceiverError;

/// Capacity of every receiver's event channel. Sends never block; a consumer
/// that falls more than this many events behind observes a lag and must
/// re-read `current_prefix()`.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// How a prefix was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Dhcpv6Pd,
    RouterAdvertisement,
    Static,
    Unknown,
}

impl Source {
    /// The stable string tag used in status fields and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Dhcpv6Pd => "dhcpv6-pd",
            Source::RouterAdvertisement => "router-advertisement",
            Source::Static => "static",
            Source::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Source> for crds::PrefixSource {
    fn from(source: Source) -> Self {
        match source {
            Source::Dhcpv6Pd => crds::PrefixSource::Dhcpv6Pd,
            Source::RouterAdvertisement => crds::PrefixSource::RouterAdvertisement,
            Source::Static => crds::PrefixSource::Static,
            Source::Unknown => crds::PrefixSource::Unknown,
        }
    }
}

/// An acquired IPv6 prefix with its lease metadata. Immutable once
/// constructed; a receiver replaces the whole value on change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    /// The delegated IPv6 network
    pub network: Ipv6Net,

    /// How long this prefix is valid
    pub valid_lifetime: Duration,

    /// How long this prefix is preferred
    pub preferred_lifetime: Duration,

    /// How this prefix was obtained
    pub source: Source,

    /// When this prefix was received
    pub received_at: DateTime<Utc>,
}

impl Prefix {
    /// Lease expiry, or `None` when no valid lifetime was delegated.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.valid_lifetime.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.valid_lifetime)
            .ok()
            .map(|d| self.received_at + d)
    }
}

/// What happened to a receiver's prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// A prefix was obtained and none was held before
    Acquired,
    /// The same network was re-confirmed with fresh lifetimes
    Renewed,
    /// A different network replaced the previous one
    Changed,
    /// The held prefix's lease ran out; `current_prefix()` is now empty
    Expired,
    /// A transient acquisition or renewal failure
    Failed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::Acquired => "acquired",
            EventType::Renewed => "renewed",
            EventType::Changed => "changed",
            EventType::Expired => "expired",
            EventType::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A prefix-related event emitted by a receiver.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened
    pub event_type: EventType,

    /// The prefix involved, when one is known
    pub prefix: Option<Prefix>,

    /// Failure description for `Failed` events
    pub error: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType, prefix: Option<Prefix>) -> Self {
        Self {
            event_type,
            prefix,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Failed,
            prefix: None,
            error: Some(error.into()),
        }
    }
}

/// The contract every prefix acquisition implementation satisfies.
///
/// All implementations are thread-safe: `events()` and `current_prefix()`
/// may be called from any task at any time. Event channels are bounded and
/// never block the producer; consumers must tolerate lagged/dropped events
/// and re-read `current_prefix()` after any wake-up.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Begin receiving prefixes. Idempotent; the receiver shuts down when
    /// either `stop()` is called or `shutdown` is cancelled.
    async fn start(&self, shutdown: CancellationToken) -> Result<(), ReceiverError>;

    /// Stop receiving prefixes and release sockets and workers. Idempotent;
    /// after return the event stream has no further emissions.
    async fn stop(&self) -> Result<(), ReceiverError>;

    /// Subscribe to prefix events.
    fn events(&self) -> broadcast::Receiver<Event>;

    /// The authoritative latest prefix, or `None` when none is held.
    fn current_prefix(&self) -> Option<Prefix>;

    /// The source tag of this receiver. Stable for the receiver's lifetime
    /// except for composite receivers, which report the active child.
    fn source(&self) -> Source;
}

/// Classify event emission for a freshly received prefix against the
/// previously held one.
pub(crate) fn classify_update(previous: Option<&Prefix>, network: Ipv6Net) -> EventType {
    match previous {
        None => EventType::Acquired,
        Some(prev) if prev.network != network => EventType::Changed,
        Some(_) => EventType::Renewed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(network: &str) -> Prefix {
        Prefix {
            network: network.parse().unwrap(),
            valid_lifetime: Duration::from_secs(3600),
            preferred_lifetime: Duration::from_secs(1800),
            source: Source::Dhcpv6Pd,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn update_classification() {
        let held = prefix("2001:db8:1::/48");

        assert_eq!(
            classify_update(None, "2001:db8:1::/48".parse().unwrap()),
            EventType::Acquired
        );
        assert_eq!(
            classify_update(Some(&held), "2001:db8:1::/48".parse().unwrap()),
            EventType::Renewed
        );
        assert_eq!(
            classify_update(Some(&held), "2001:db8:2::/48".parse().unwrap()),
            EventType::Changed
        );
    }

    #[test]
    fn expiry_from_lifetime() {
        let p = prefix("2001:db8:1::/48");
        let expires = p.expires_at().unwrap();
        assert_eq!((expires - p.received_at).num_seconds(), 3600);

        let mut no_lease = p.clone();
        no_lease.valid_lifetime = Duration::ZERO;
        assert!(no_lease.expires_at().is_none());
    }
}
