//! UDP channels for discovery and group traffic.
//!
//! A [`Channel`] owns one socket bound with address reuse, so several
//! participants can share a host. The [`ChannelKind`] decides what happens
//! around the socket:
//!
//! - **Broadcast**: the socket may send to the subnet broadcast address.
//! - **Multicast**: the destination must be a multicast address; the socket
//!   joins the group on open and leaves it on close.
//!
//! Received datagrams are handed to a caller-supplied handler from a single
//! background task. The next receive is armed only after the handler
//! returns, so a channel never has two deliveries in flight and handlers
//! observe datagrams in arrival order. Bursts larger than the OS socket
//! buffer can still be dropped silently.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, trace, warn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::ChannelConfig;
use crate::error::{GroupChatError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    Broadcast,
    Multicast,
}

/// True when the high four bits of the first octet are `1110`.
/// Only IPv4 groups are supported.
pub fn is_multicast(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.octets()[0] >> 4 == 0b1110,
        IpAddr::V6(_) => false,
    }
}

/// Local address a channel binds.
///
/// Broadcast sockets take the wildcard so datagrams sent to the broadcast
/// address still arrive when a local address is configured. On unix a
/// multicast socket binds its group address, which keeps datagrams for
/// other groups sharing the port off this socket.
fn bind_ip(group: Option<Ipv4Addr>) -> Ipv4Addr {
    match group {
        #[cfg(unix)]
        Some(group) => group,
        #[cfg(not(unix))]
        Some(_) => Ipv4Addr::UNSPECIFIED,
        None => Ipv4Addr::UNSPECIFIED,
    }
}

const MIN_RECV_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RECV_BACKOFF: Duration = Duration::from_secs(1);

/// Delay between receive attempts after consecutive socket errors, doubling
/// up to a ceiling.
#[derive(Debug, Default)]
struct ErrorBackoff {
    failures: u32,
}

impl ErrorBackoff {
    fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exponent = (self.failures - 1).min(16);
        MIN_RECV_BACKOFF
            .saturating_mul(1 << exponent)
            .min(MAX_RECV_BACKOFF)
    }

    fn failures(&self) -> u32 {
        self.failures
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

/// A received datagram with its source address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub source: SocketAddr,
}

impl Datagram {
    pub fn new(data: Vec<u8>, source: SocketAddr) -> Self {
        Self { data, source }
    }
}

struct ChannelState {
    socket: Option<Arc<UdpSocket>>,
    receiver: Option<JoinHandle<()>>,
}

pub struct Channel {
    kind: ChannelKind,
    destination: SocketAddr,
    local_addr: SocketAddr,
    interface: Ipv4Addr,
    recv_buffer_size: usize,
    state: Mutex<ChannelState>,
}

impl Channel {
    /// Bind a socket for `config` and, for multicast channels, join the group.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: ChannelConfig) -> Result<Self> {
        let group = match (config.kind, config.destination.ip()) {
            (ChannelKind::Multicast, IpAddr::V4(group)) if is_multicast(group.into()) => Some(group),
            (ChannelKind::Multicast, other) => return Err(GroupChatError::InvalidAddress(other)),
            (ChannelKind::Broadcast, _) => None,
        };

        let interface = config.local_address.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let bind_ip = bind_ip(group);
        let bind_addr = SocketAddr::new(IpAddr::V4(bind_ip), config.local_port);

        let bind_error = |source: std::io::Error| GroupChatError::Bind {
            addr: bind_addr,
            source,
        };

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&SockAddr::from(bind_addr)).map_err(bind_error)?;

        match group {
            None => socket.set_broadcast(true).map_err(bind_error)?,
            Some(group) => {
                socket.join_multicast_v4(&group, &interface).map_err(bind_error)?;
                socket
                    .set_multicast_loop_v4(config.multicast_loopback)
                    .map_err(bind_error)?;
                socket
                    .set_multicast_ttl_v4(config.multicast_ttl)
                    .map_err(bind_error)?;
                if !interface.is_unspecified() {
                    socket.set_multicast_if_v4(&interface).map_err(bind_error)?;
                }
            }
        }

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_error)?;
        let mut local_addr = socket.local_addr().map_err(bind_error)?;
        if group.is_none() && !interface.is_unspecified() {
            local_addr.set_ip(IpAddr::V4(interface));
        }

        info!(
            "{:?} channel bound to {} (destination {})",
            config.kind, local_addr, config.destination
        );

        Ok(Channel {
            kind: config.kind,
            destination: config.destination,
            local_addr,
            interface,
            recv_buffer_size: config.recv_buffer_size,
            state: Mutex::new(ChannelState {
                socket: Some(Arc::new(socket)),
                receiver: None,
            }),
        })
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.state().socket.is_none()
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the background receive loop, delivering every datagram to `handler`.
    ///
    /// Calling this again while the loop runs is a no-op. A closed channel
    /// cannot start receiving again.
    pub fn start_receiving<F>(&self, mut handler: F) -> Result<()>
    where
        F: FnMut(Datagram) + Send + 'static,
    {
        let mut state = self.state();
        let Some(socket) = state.socket.as_ref().map(Arc::clone) else {
            return Err(GroupChatError::ChannelClosed);
        };
        if state.receiver.is_some() {
            debug!("{:?} channel on {} is already receiving", self.kind, self.local_addr);
            return Ok(());
        }

        let kind = self.kind;
        let buffer_size = self.recv_buffer_size;
        state.receiver = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; buffer_size];
            let mut backoff = ErrorBackoff::default();
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        backoff.reset();
                        trace!("{:?} channel received {} bytes from {}", kind, len, source);
                        handler(Datagram::new(buf[..len].to_vec(), source));
                    }
                    Err(e) => {
                        let delay = backoff.failed();
                        if backoff.failures() == 1 {
                            warn!("{:?} channel receive failed: {}", kind, e);
                        } else {
                            debug!(
                                "{:?} channel receive failed again ({} in a row): {}",
                                kind,
                                backoff.failures(),
                                e
                            );
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }));

        Ok(())
    }

    /// Send `payload` to `destination`. Success means the datagram was
    /// handed to the OS, not that anyone received it.
    pub async fn send(&self, payload: &[u8], destination: SocketAddr) -> Result<()> {
        let socket = self
            .state()
            .socket
            .as_ref()
            .map(Arc::clone)
            .ok_or(GroupChatError::ChannelClosed)?;

        socket
            .send_to(payload, destination)
            .await
            .map_err(|source| GroupChatError::Send {
                destination,
                source,
            })?;

        trace!("{:?} channel sent {} bytes to {}", self.kind, payload.len(), destination);
        Ok(())
    }

    pub async fn send_to_destination(&self, payload: &[u8]) -> Result<()> {
        self.send(payload, self.destination).await
    }

    /// Stop receiving, leave the multicast group if any, and release the
    /// socket. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.state();
        if let Some(receiver) = state.receiver.take() {
            receiver.abort();
        }
        let Some(socket) = state.socket.take() else {
            return;
        };

        if let (ChannelKind::Multicast, IpAddr::V4(group)) = (self.kind, self.destination.ip()) {
            if let Err(e) = socket.leave_multicast_v4(group, self.interface) {
                warn!("failed to leave multicast group {}: {}", group, e);
            }
        }

        info!("{:?} channel on {} closed", self.kind, self.local_addr);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
