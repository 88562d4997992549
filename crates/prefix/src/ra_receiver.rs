//! Passive Router Advertisement receiver.
//!
//! Useful when another component (the host OS, systemd-networkd, the router
//! itself) handles prefix delegation and the operator only needs to observe
//! which prefix is in use on the link.

use std::io::Read;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv6Net;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ReceiverError;
use crate::ndp::{
    is_global_unicast, is_unique_local, parse_router_advertisement, PrefixInformation,
    RouterAdvertisement,
};
use crate::types::{
    classify_update, Event, EventType, Prefix, Receiver, Source, EVENT_CHANNEL_CAPACITY,
};

const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Monitors Router Advertisements on one interface to passively track the
/// delegated IPv6 prefix.
pub struct RaReceiver {
    iface: String,
    shared: Arc<RaShared>,
    shutdown: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

/// State shared between the receiver handle and its worker thread.
struct RaShared {
    current: RwLock<Option<Prefix>>,
    events: broadcast::Sender<Event>,
}

impl RaReceiver {
    /// Create a receiver for the given interface. No sockets are opened
    /// until `start`.
    pub fn new(iface: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            iface: iface.into(),
            shared: Arc::new(RaShared {
                current: RwLock::new(None),
                events,
            }),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    fn open_socket(&self) -> Result<Socket, ReceiverError> {
        let socket_err = |source| ReceiverError::Socket {
            kind: "ICMPv6",
            iface: self.iface.clone(),
            source,
        };

        let socket =
            Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6)).map_err(socket_err)?;
        socket
            .bind_device(Some(self.iface.as_bytes()))
            .and_then(|_| socket.set_read_timeout(Some(READ_DEADLINE)))
            .map_err(socket_err)?;

        Ok(socket)
    }

    fn receive_loop(
        iface: String,
        mut socket: Socket,
        token: CancellationToken,
        shared: Arc<RaShared>,
    ) {
        info!("RA receive loop started on {}", iface);
        let mut buf = [0u8; 1500];
        let mut idle_iterations: u64 = 0;

        while !token.is_cancelled() {
            let len = match socket.read(&mut buf) {
                Ok(len) => len,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    idle_iterations += 1;
                    if idle_iterations % 30 == 0 {
                        debug!(
                            "Waiting for Router Advertisements on {} ({} deadline intervals)",
                            iface, idle_iterations
                        );
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read ICMPv6 message on {}: {}", iface, e);
                    shared.send(Event::failed(format!("icmpv6 read failed: {e}")));
                    continue;
                }
            };

            let Some(ra) = parse_router_advertisement(&buf[..len]) else {
                // Unrelated ICMPv6 traffic
                continue;
            };

            debug!(
                "Received Router Advertisement on {} with {} prefix option(s)",
                iface,
                ra.prefixes.len()
            );
            Self::handle_router_advertisement(&iface, &ra, &shared);
        }

        info!("RA receive loop stopped on {}", iface);
    }

    fn handle_router_advertisement(iface: &str, ra: &RouterAdvertisement, shared: &RaShared) {
        let Some(best) = select_prefix(ra) else {
            debug!("No suitable prefix in Router Advertisement on {}", iface);
            return;
        };

        let Ok(network) = Ipv6Net::new(best.prefix, best.prefix_length) else {
            warn!(
                "Ignoring advertised prefix {}/{} with invalid length",
                best.prefix, best.prefix_length
            );
            return;
        };

        shared.update(
            network.trunc(),
            best.valid_lifetime,
            best.preferred_lifetime,
        );
    }
}

impl RaShared {
    fn send(&self, event: Event) {
        // A send without subscribers is fine; events are best-effort.
        let _ = self.events.send(event);
    }

    fn update(&self, network: Ipv6Net, valid: Duration, preferred: Duration) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());

        let event_type = classify_update(current.as_ref(), network);
        let prefix = Prefix {
            network,
            valid_lifetime: valid,
            preferred_lifetime: preferred,
            source: Source::RouterAdvertisement,
            received_at: Utc::now(),
        };

        if event_type != EventType::Renewed {
            info!(
                "Observed prefix {} via router advertisement ({})",
                network, event_type
            );
        }

        *current = Some(prefix.clone());
        drop(current);

        self.send(Event::new(event_type, Some(prefix)));
    }
}

/// Pick the best prefix from an RA: first global unicast wins, then first
/// unique-local. The autonomous flag is ignored on purpose; many ISPs
/// advertise prefixes with it cleared while still using the prefix for
/// stateful assignment.
fn select_prefix(ra: &RouterAdvertisement) -> Option<&PrefixInformation> {
    let mut best: Option<&PrefixInformation> = None;

    for pi in &ra.prefixes {
        if !pi.on_link {
            continue;
        }
        if pi.valid_lifetime.is_zero() {
            // Deprecated prefix
            continue;
        }

        if is_global_unicast(pi.prefix) {
            if best.map_or(true, |b| !is_global_unicast(b.prefix)) {
                best = Some(pi);
            }
        } else if is_unique_local(pi.prefix) && best.is_none() {
            best = Some(pi);
        }
    }

    best
}

#[async_trait]
impl Receiver for RaReceiver {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), ReceiverError> {
        {
            let guard = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_some() {
                return Ok(());
            }
        }

        let socket = self.open_socket()?;
        info!("NDP listener started on {}", self.iface);

        let token = shutdown.child_token();
        let iface = self.iface.clone();
        let loop_token = token.clone();
        let loop_shared = self.shared.clone();
        let handle = std::thread::spawn(move || {
            Self::receive_loop(iface, socket, loop_token, loop_shared);
        });

        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *self.shutdown.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);

        Ok(())
    }

    async fn stop(&self) -> Result<(), ReceiverError> {
        let token = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(token) = token else {
            return Ok(());
        };
        token.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            // The worker wakes within one read deadline.
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    fn current_prefix(&self) -> Option<Prefix> {
        self.shared
            .current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn source(&self) -> Source {
        Source::RouterAdvertisement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndp::RouterAdvertisement;

    fn pi(prefix: &str, on_link: bool, valid_secs: u64) -> PrefixInformation {
        PrefixInformation {
            prefix_length: 64,
            on_link,
            autonomous: false,
            valid_lifetime: Duration::from_secs(valid_secs),
            preferred_lifetime: Duration::from_secs(valid_secs / 2),
            prefix: prefix.parse().unwrap(),
        }
    }

    #[test]
    fn global_unicast_preferred_over_unique_local() {
        let ra = RouterAdvertisement {
            prefixes: vec![pi("fd00:1::", true, 3600), pi("2001:db8:1::", true, 3600)],
        };
        let best = select_prefix(&ra).unwrap();
        assert_eq!(best.prefix, "2001:db8:1::".parse::<std::net::Ipv6Addr>().unwrap());
    }

    #[test]
    fn first_global_unicast_wins() {
        let ra = RouterAdvertisement {
            prefixes: vec![pi("2001:db8:1::", true, 3600), pi("2001:db8:2::", true, 3600)],
        };
        let best = select_prefix(&ra).unwrap();
        assert_eq!(best.prefix, "2001:db8:1::".parse::<std::net::Ipv6Addr>().unwrap());
    }

    #[test]
    fn off_link_and_deprecated_prefixes_skipped() {
        let ra = RouterAdvertisement {
            prefixes: vec![
                pi("2001:db8:1::", false, 3600), // not on-link
                pi("2001:db8:2::", true, 0),     // deprecated
                pi("fd00:1::", true, 3600),
            ],
        };
        let best = select_prefix(&ra).unwrap();
        assert_eq!(best.prefix, "fd00:1::".parse::<std::net::Ipv6Addr>().unwrap());
    }

    #[test]
    fn link_local_never_selected() {
        let ra = RouterAdvertisement {
            prefixes: vec![pi("fe80::", true, 3600)],
        };
        assert!(select_prefix(&ra).is_none());
    }

    #[tokio::test]
    async fn update_emits_classified_events() {
        let receiver = RaReceiver::new("test0");
        let mut events = receiver.events();

        receiver.shared.update(
            "2001:db8:1::/48".parse().unwrap(),
            Duration::from_secs(3600),
            Duration::from_secs(1800),
        );
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Acquired);

        receiver.shared.update(
            "2001:db8:1::/48".parse().unwrap(),
            Duration::from_secs(7200),
            Duration::from_secs(3600),
        );
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Renewed);

        receiver.shared.update(
            "2001:db8:2::/48".parse().unwrap(),
            Duration::from_secs(3600),
            Duration::from_secs(1800),
        );
        assert_eq!(events.recv().await.unwrap().event_type, EventType::Changed);

        assert_eq!(
            receiver.current_prefix().unwrap().network,
            "2001:db8:2::/48".parse::<Ipv6Net>().unwrap()
        );
    }
}
