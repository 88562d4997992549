//! DHCPv6 Prefix Delegation client receiver.
//!
//! Actively requests a delegated prefix from the upstream DHCPv6 server via
//! the standard 4-message exchange and keeps the lease alive with
//! RENEW/REBIND. Lease timers follow RFC 8415: renew at T1, rebind at T2,
//! expire at the valid lifetime.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use ipnet::Ipv6Net;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dhcpv6::{
    duid_ll, IaPd, IaPrefix, Message, MessageType, ALL_DHCP_RELAY_AGENTS_AND_SERVERS, CLIENT_PORT,
    OPTION_DNS_SERVERS, SERVER_PORT, STATUS_SUCCESS,
};
use crate::error::{Dhcpv6Error, ReceiverError};
use crate::iface::{self, LinkInfo};
use crate::types::{
    classify_update, Event, EventType, Prefix, Receiver, Source, EVENT_CHANNEL_CAPACITY,
};

/// Upper bound for one SOLICIT/REQUEST/RENEW/REBIND exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between acquisition attempts while no lease is held.
const REACQUIRE_DELAY: Duration = Duration::from_secs(10);

/// Longest uninterrupted sleep, so shutdown stays responsive.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// A bound DHCPv6-PD lease.
#[derive(Debug, Clone)]
struct Dhcpv6Lease {
    iaid: [u8; 4],
    network: Ipv6Net,
    t1: Duration,
    t2: Duration,
    valid_lifetime: Duration,
    server_duid: Vec<u8>,
    /// Monotonic clock for timer arithmetic
    received: Instant,
}

/// Mutable client state shared with the worker task.
#[derive(Default)]
struct PdState {
    current: Option<Prefix>,
    lease: Option<Dhcpv6Lease>,
}

struct PdShared {
    iface: String,
    requested_prefix_length: u8,
    state: RwLock<PdState>,
    events: broadcast::Sender<Event>,
}

/// DHCPv6 Prefix Delegation client for one interface.
pub struct Dhcpv6PdReceiver {
    shared: Arc<PdShared>,
    shutdown: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Dhcpv6PdReceiver {
    /// Create a PD client for the given interface. `requested_prefix_length`
    /// is a hint to the server; 0 selects the default of 56 and other values
    /// are clamped to 48..=64.
    pub fn new(iface: impl Into<String>, requested_prefix_length: u8) -> Self {
        let requested_prefix_length = if requested_prefix_length == 0 {
            56
        } else {
            requested_prefix_length.clamp(48, 64)
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(PdShared {
                iface: iface.into(),
                requested_prefix_length,
                state: RwLock::new(PdState::default()),
                events,
            }),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    async fn run_loop(shared: Arc<PdShared>, token: CancellationToken) {
        info!("DHCPv6-PD client loop started on {}", shared.iface);

        // Initial acquisition
        if let Err(e) = shared.acquire(&token).await {
            warn!("Initial prefix acquisition on {} failed: {}", shared.iface, e);
            shared.send(Event::failed(format!("prefix acquisition failed: {e}")));
        }

        while !token.is_cancelled() {
            let lease = {
                let state = shared.state.read().unwrap_or_else(|e| e.into_inner());
                state.lease.clone()
            };

            let Some(lease) = lease else {
                if sleep_or_cancelled(&token, REACQUIRE_DELAY).await {
                    break;
                }
                if let Err(e) = shared.acquire(&token).await {
                    warn!("Prefix acquisition on {} failed: {}", shared.iface, e);
                    shared.send(Event::failed(format!("prefix acquisition failed: {e}")));
                }
                continue;
            };

            let elapsed = lease.received.elapsed();

            // Lease ran out without a successful REPLY
            if elapsed >= lease.valid_lifetime {
                warn!(
                    "DHCPv6 lease for {} on {} expired",
                    lease.network, shared.iface
                );
                shared.expire();
                continue;
            }

            if elapsed >= lease.t1 {
                if let Err(e) = shared.renew(&token, &lease).await {
                    warn!("Prefix renewal on {} failed: {}", shared.iface, e);
                    shared.send(Event::failed(format!("prefix renewal failed: {e}")));

                    if elapsed >= lease.t2 {
                        if let Err(e) = shared.rebind(&token, &lease).await {
                            warn!("Prefix rebind on {} failed: {}", shared.iface, e);
                            shared.send(Event::failed(format!("prefix rebind failed: {e}")));
                        }
                    }
                }
                continue;
            }

            let sleep = std::cmp::min(lease.t1 - elapsed, MAX_SLEEP);
            if sleep_or_cancelled(&token, sleep).await {
                break;
            }
        }

        info!("DHCPv6-PD client loop stopped on {}", shared.iface);
    }
}

/// Returns true when the token fired before the sleep completed.
async fn sleep_or_cancelled(token: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

impl PdShared {
    fn send(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /// Generate the IAID from the interface index, stable across restarts.
    fn iaid(link: &LinkInfo) -> [u8; 4] {
        link.index.to_be_bytes()
    }

    fn open_socket(&self, link: &LinkInfo) -> Result<UdpSocket, ReceiverError> {
        let socket_err = |source| ReceiverError::Socket {
            kind: "DHCPv6",
            iface: self.iface.clone(),
            source,
        };

        let socket =
            Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(socket_err)?;
        socket.set_only_v6(true).map_err(socket_err)?;
        socket.set_reuse_address(true).map_err(socket_err)?;
        socket
            .bind_device(Some(self.iface.as_bytes()))
            .map_err(socket_err)?;
        socket.set_multicast_if_v6(link.index).map_err(socket_err)?;
        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, CLIENT_PORT, 0, 0);
        socket.bind(&bind_addr.into()).map_err(socket_err)?;
        socket.set_nonblocking(true).map_err(socket_err)?;

        UdpSocket::from_std(socket.into()).map_err(socket_err)
    }

    /// Full SOLICIT → ADVERTISE → REQUEST → REPLY acquisition.
    async fn acquire(&self, token: &CancellationToken) -> Result<(), ReceiverError> {
        let link = iface::lookup(&self.iface)?;
        let socket = self.open_socket(&link)?;
        let iaid = Self::iaid(&link);
        let client_duid = duid_ll(&link.mac);
        let xid = rand::random::<u32>() & 0x00FF_FFFF;

        let mut solicit = Message::new(MessageType::Solicit, xid);
        solicit.client_id = Some(client_duid.clone());
        solicit.oro = vec![OPTION_DNS_SERVERS];
        solicit.ia_pds.push(IaPd {
            iaid,
            prefixes: vec![IaPrefix {
                preferred_lifetime: 0,
                valid_lifetime: 0,
                prefix_length: self.requested_prefix_length,
                prefix: Ipv6Addr::UNSPECIFIED,
            }],
            ..IaPd::default()
        });

        let advertise = exchange(
            token,
            &socket,
            link.index,
            &solicit,
            MessageType::Advertise,
            "ADVERTISE",
        )
        .await?;

        let server_duid = advertise
            .server_id
            .clone()
            .ok_or(Dhcpv6Error::MissingServerId)?;
        let advertised = advertise.ia_pd(iaid).ok_or(Dhcpv6Error::MissingIaPd)?.clone();

        debug!(
            "ADVERTISE on {} offered {} prefix(es)",
            self.iface,
            advertised.prefixes.len()
        );

        let mut request = Message::new(MessageType::Request, xid);
        request.client_id = Some(client_duid);
        request.server_id = Some(server_duid.clone());
        request.oro = vec![OPTION_DNS_SERVERS];
        request.ia_pds.push(advertised);

        let reply = exchange(
            token,
            &socket,
            link.index,
            &request,
            MessageType::Reply,
            "REPLY",
        )
        .await?;

        self.process_reply(&reply, iaid, server_duid)?;
        Ok(())
    }

    /// RENEW the current lease with the server that granted it.
    async fn renew(
        &self,
        token: &CancellationToken,
        lease: &Dhcpv6Lease,
    ) -> Result<(), ReceiverError> {
        self.refresh(token, lease, MessageType::Renew, true).await
    }

    /// REBIND with any server once the granting server stopped answering.
    async fn rebind(
        &self,
        token: &CancellationToken,
        lease: &Dhcpv6Lease,
    ) -> Result<(), ReceiverError> {
        self.refresh(token, lease, MessageType::Rebind, false).await
    }

    async fn refresh(
        &self,
        token: &CancellationToken,
        lease: &Dhcpv6Lease,
        message_type: MessageType,
        with_server_id: bool,
    ) -> Result<(), ReceiverError> {
        let link = iface::lookup(&self.iface)?;
        let socket = self.open_socket(&link)?;
        let xid = rand::random::<u32>() & 0x00FF_FFFF;

        let mut msg = Message::new(message_type, xid);
        msg.client_id = Some(duid_ll(&link.mac));
        if with_server_id {
            msg.server_id = Some(lease.server_duid.clone());
        }
        msg.ia_pds.push(IaPd {
            iaid: lease.iaid,
            prefixes: vec![IaPrefix {
                preferred_lifetime: 0,
                valid_lifetime: lease.valid_lifetime.as_secs() as u32,
                prefix_length: lease.network.prefix_len(),
                prefix: lease.network.network(),
            }],
            ..IaPd::default()
        });

        let reply = exchange(token, &socket, link.index, &msg, MessageType::Reply, "REPLY").await?;

        // A REBIND reply may come from a different server.
        let server_duid = match reply.server_id.clone() {
            Some(duid) => duid,
            None if with_server_id => lease.server_duid.clone(),
            None => return Err(Dhcpv6Error::MissingServerId.into()),
        };

        self.process_reply(&reply, lease.iaid, server_duid)?;
        Ok(())
    }

    /// Apply a REPLY to client state, emitting the classifying event.
    ///
    /// On error the current binding is untouched: a failed renewal keeps the
    /// lease until its own timers run out.
    fn process_reply(
        &self,
        reply: &Message,
        iaid: [u8; 4],
        server_duid: Vec<u8>,
    ) -> Result<EventType, ReceiverError> {
        if let Some(status) = &reply.status {
            if status.code != STATUS_SUCCESS {
                return Err(Dhcpv6Error::Status {
                    code: status.code,
                    message: status.message.clone(),
                }
                .into());
            }
        }

        let ia_pd = reply.ia_pd(iaid).ok_or(Dhcpv6Error::MissingIaPd)?;
        if let Some(status) = &ia_pd.status {
            if status.code != STATUS_SUCCESS {
                return Err(Dhcpv6Error::Status {
                    code: status.code,
                    message: status.message.clone(),
                }
                .into());
            }
        }

        // Prefixes whose valid lifetime is zero are withdrawals, not grants.
        let best = ia_pd.best_prefix().ok_or(Dhcpv6Error::NoValidPrefix)?;
        let network = Ipv6Net::new(best.prefix, best.prefix_length)
            .map_err(|_| Dhcpv6Error::NoValidPrefix)?
            .trunc();

        let valid = Duration::from_secs(u64::from(best.valid_lifetime));
        let preferred = Duration::from_secs(u64::from(best.preferred_lifetime));
        let (t1, t2) = derive_timers(ia_pd.t1, ia_pd.t2, valid);

        let prefix = Prefix {
            network,
            valid_lifetime: valid,
            preferred_lifetime: preferred,
            source: Source::Dhcpv6Pd,
            received_at: Utc::now(),
        };
        let lease = Dhcpv6Lease {
            iaid,
            network,
            t1,
            t2,
            valid_lifetime: valid,
            server_duid,
            received: Instant::now(),
        };

        let event_type = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let event_type = classify_update(state.current.as_ref(), network);
            state.current = Some(prefix.clone());
            state.lease = Some(lease);
            event_type
        };

        info!(
            "DHCPv6-PD {} on {}: {} (valid {}s, T1 {}s, T2 {}s)",
            event_type,
            self.iface,
            network,
            valid.as_secs(),
            t1.as_secs(),
            t2.as_secs()
        );

        self.send(Event::new(event_type, Some(prefix)));
        Ok(event_type)
    }

    /// Drop the lease and clear the current prefix.
    fn expire(&self) {
        let expired = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.lease = None;
            state.current.take()
        };

        self.send(Event {
            event_type: EventType::Expired,
            prefix: expired,
            error: None,
        });
    }
}

/// T1/T2 derivation with the RFC 8415 client-side defaults: a server that
/// sends zero leaves the choice to the client (50 % and 80 % of the valid
/// lifetime), and T1 <= T2 <= valid is enforced.
fn derive_timers(t1: u32, t2: u32, valid: Duration) -> (Duration, Duration) {
    let mut t1 = if t1 > 0 {
        Duration::from_secs(u64::from(t1))
    } else {
        valid / 2
    };
    let mut t2 = if t2 > 0 {
        Duration::from_secs(u64::from(t2))
    } else {
        valid * 4 / 5
    };

    if t2 > valid {
        t2 = valid;
    }
    if t1 > t2 {
        t1 = t2;
    }
    (t1, t2)
}

/// Send a message to All_DHCP_Relay_Agents_and_Servers and wait for the
/// matching response type with our transaction id.
async fn exchange(
    token: &CancellationToken,
    socket: &UdpSocket,
    scope_id: u32,
    message: &Message,
    expected: MessageType,
    expected_name: &'static str,
) -> Result<Message, ReceiverError> {
    let destination = SocketAddrV6::new(ALL_DHCP_RELAY_AGENTS_AND_SERVERS, SERVER_PORT, 0, scope_id);
    socket.send_to(&message.encode(), destination).await?;

    let started = Instant::now();
    let mut buf = [0u8; 2048];

    loop {
        let Some(remaining) = EXCHANGE_TIMEOUT.checked_sub(started.elapsed()) else {
            return Err(ReceiverError::ExchangeTimeout(expected_name));
        };

        let received = tokio::select! {
            _ = token.cancelled() => return Err(ReceiverError::ExchangeTimeout(expected_name)),
            received = tokio::time::timeout(remaining, socket.recv_from(&mut buf)) => received,
        };

        let (len, _) = match received {
            Ok(result) => result?,
            Err(_) => return Err(ReceiverError::ExchangeTimeout(expected_name)),
        };

        match Message::decode(&buf[..len]) {
            Ok(msg)
                if msg.transaction_id == message.transaction_id
                    && msg.message_type == expected =>
            {
                return Ok(msg);
            }
            Ok(other) => {
                debug!(
                    "Ignoring DHCPv6 {:?} while waiting for {}",
                    other.message_type, expected_name
                );
            }
            Err(e) => {
                debug!("Ignoring undecodable DHCPv6 message: {}", e);
            }
        }
    }
}

#[async_trait]
impl Receiver for Dhcpv6PdReceiver {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), ReceiverError> {
        let mut guard = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Ok(());
        }

        let token = shutdown.child_token();
        let shared = self.shared.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            Dhcpv6PdReceiver::run_loop(shared, loop_token).await;
        });

        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        *guard = Some(token);
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
            let _ = handle.await;
        }

        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    fn current_prefix(&self) -> Option<Prefix> {
        self.shared
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    fn source(&self) -> Source {
        Source::Dhcpv6Pd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcpv6::Status;

    fn shared() -> PdShared {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        PdShared {
            iface: "test0".to_string(),
            requested_prefix_length: 56,
            state: RwLock::new(PdState::default()),
            events,
        }
    }

    fn reply(iaid: [u8; 4], prefix: &str, valid: u32, t1: u32, t2: u32) -> Message {
        let mut msg = Message::new(MessageType::Reply, 1);
        msg.server_id = Some(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]);
        msg.ia_pds.push(IaPd {
            iaid,
            t1,
            t2,
            prefixes: vec![IaPrefix {
                preferred_lifetime: valid / 2,
                valid_lifetime: valid,
                prefix_length: 48,
                prefix: prefix.parse().unwrap(),
            }],
            status: None,
        });
        msg
    }

    #[test]
    fn timer_derivation_defaults() {
        let valid = Duration::from_secs(3600);

        // Server supplied both
        assert_eq!(
            derive_timers(1800, 2880, valid),
            (Duration::from_secs(1800), Duration::from_secs(2880))
        );

        // Server left both to the client: 50 % and 80 %
        assert_eq!(
            derive_timers(0, 0, valid),
            (Duration::from_secs(1800), Duration::from_secs(2880))
        );

        // Invariants enforced: T1 <= T2 <= valid
        let (t1, t2) = derive_timers(4000, 8000, valid);
        assert!(t1 <= t2 && t2 <= valid);
        assert_eq!(t2, valid);
    }

    #[test]
    fn first_reply_is_an_acquisition() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        let event = shared
            .process_reply(&reply(iaid, "2001:db8:1::", 3600, 0, 0), iaid, vec![1])
            .unwrap();

        assert_eq!(event, EventType::Acquired);
        let state = shared.state.read().unwrap();
        assert_eq!(
            state.current.as_ref().unwrap().network,
            "2001:db8:1::/48".parse::<Ipv6Net>().unwrap()
        );
        let lease = state.lease.as_ref().unwrap();
        assert_eq!(lease.t1, Duration::from_secs(1800));
        assert_eq!(lease.t2, Duration::from_secs(2880));
    }

    #[test]
    fn same_network_reply_is_a_renewal() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        shared
            .process_reply(&reply(iaid, "2001:db8:1::", 3600, 0, 0), iaid, vec![1])
            .unwrap();

        let event = shared
            .process_reply(&reply(iaid, "2001:db8:1::", 7200, 0, 0), iaid, vec![1])
            .unwrap();
        assert_eq!(event, EventType::Renewed);

        let state = shared.state.read().unwrap();
        assert_eq!(
            state.current.as_ref().unwrap().valid_lifetime,
            Duration::from_secs(7200)
        );
    }

    #[test]
    fn different_network_reply_is_a_change() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        shared
            .process_reply(&reply(iaid, "2001:db8:1::", 3600, 0, 0), iaid, vec![1])
            .unwrap();

        let event = shared
            .process_reply(&reply(iaid, "2001:db8:2::", 3600, 0, 0), iaid, vec![1])
            .unwrap();
        assert_eq!(event, EventType::Changed);
    }

    #[test]
    fn all_zero_lifetimes_is_a_failure_not_an_acquisition() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        let err = shared
            .process_reply(&reply(iaid, "2001:db8:1::", 0, 0, 0), iaid, vec![1])
            .unwrap_err();

        assert!(matches!(
            err,
            ReceiverError::Dhcpv6(Dhcpv6Error::NoValidPrefix)
        ));
        assert!(shared.state.read().unwrap().current.is_none());
    }

    #[test]
    fn ia_pd_error_status_keeps_existing_binding() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        shared
            .process_reply(&reply(iaid, "2001:db8:1::", 3600, 0, 0), iaid, vec![1])
            .unwrap();

        let mut failure = reply(iaid, "2001:db8:2::", 3600, 0, 0);
        failure.ia_pds[0].status = Some(Status {
            code: crate::dhcpv6::STATUS_NO_PREFIX_AVAIL,
            message: "gone".to_string(),
        });

        let err = shared.process_reply(&failure, iaid, vec![1]).unwrap_err();
        assert!(matches!(
            err,
            ReceiverError::Dhcpv6(Dhcpv6Error::Status { .. })
        ));

        // Binding unchanged
        let state = shared.state.read().unwrap();
        assert_eq!(
            state.current.as_ref().unwrap().network,
            "2001:db8:1::/48".parse::<Ipv6Net>().unwrap()
        );
    }

    #[test]
    fn expiry_clears_binding_and_reports_the_lost_prefix() {
        let shared = shared();
        let iaid = [0, 0, 0, 7];
        shared
            .process_reply(&reply(iaid, "2001:db8:1::", 3600, 0, 0), iaid, vec![1])
            .unwrap();

        let mut events = shared.events.subscribe();
        shared.expire();

        let state = shared.state.read().unwrap();
        assert!(state.current.is_none());
        assert!(state.lease.is_none());
        drop(state);

        let event = events.try_recv().unwrap();
        assert_eq!(event.event_type, EventType::Expired);
        assert!(event.prefix.is_some());
    }
}
