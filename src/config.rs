use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::channel::ChannelKind;

pub const DEFAULT_DISCOVERY_PORT: u16 = 9000;
pub const DEFAULT_GROUP_PORT: u16 = 9100;
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(60);
/// Largest payload a UDP datagram over IPv4 can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Settings shared by every channel a [`MembershipEngine`](crate::MembershipEngine) opens.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Local port the discovery (broadcast) channel binds to.
    pub discovery_port: u16,
    /// Where discovery traffic is sent.
    pub broadcast_destination: SocketAddrV4,
    /// Port used by `create_group` when the caller has no preference.
    pub group_port: u16,
    /// Interface used for multicast membership and egress. Sockets still
    /// bind the wildcard (discovery) or the group address, so broadcasts
    /// arrive either way. `None` lets the OS choose.
    pub local_address: Option<Ipv4Addr>,
    pub join_timeout: Duration,
    pub multicast_ttl: u32,
    pub multicast_loopback: bool,
    pub recv_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_destination: SocketAddrV4::new(Ipv4Addr::BROADCAST, DEFAULT_DISCOVERY_PORT),
            group_port: DEFAULT_GROUP_PORT,
            local_address: None,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            multicast_ttl: 1,
            multicast_loopback: true,
            recv_buffer_size: MAX_DATAGRAM_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind discovery to `port` and broadcast to the same port on the subnet.
    pub fn discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = port;
        self.broadcast_destination.set_port(port);
        self
    }

    pub fn broadcast_destination(mut self, destination: SocketAddrV4) -> Self {
        self.broadcast_destination = destination;
        self
    }

    pub fn group_port(mut self, port: u16) -> Self {
        self.group_port = port;
        self
    }

    pub fn local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn multicast_loopback(mut self, enabled: bool) -> Self {
        self.multicast_loopback = enabled;
        self
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub(crate) fn broadcast_channel(&self) -> ChannelConfig {
        ChannelConfig {
            kind: ChannelKind::Broadcast,
            destination: SocketAddr::V4(self.broadcast_destination),
            local_port: self.discovery_port,
            local_address: self.local_address,
            multicast_ttl: self.multicast_ttl,
            multicast_loopback: self.multicast_loopback,
            recv_buffer_size: self.recv_buffer_size,
        }
    }

    pub(crate) fn multicast_channel(&self, group: SocketAddrV4) -> ChannelConfig {
        ChannelConfig {
            kind: ChannelKind::Multicast,
            destination: SocketAddr::V4(group),
            local_port: group.port(),
            local_address: self.local_address,
            multicast_ttl: self.multicast_ttl,
            multicast_loopback: self.multicast_loopback,
            recv_buffer_size: self.recv_buffer_size,
        }
    }
}

/// Everything [`Channel::open`](crate::Channel::open) needs to set up one socket.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub destination: SocketAddr,
    pub local_port: u16,
    pub local_address: Option<Ipv4Addr>,
    pub multicast_ttl: u32,
    pub multicast_loopback: bool,
    pub recv_buffer_size: usize,
}

impl ChannelConfig {
    pub fn broadcast(destination: SocketAddrV4, local_port: u16) -> Self {
        EngineConfig::default()
            .broadcast_destination(destination)
            .broadcast_channel()
            .local_port(local_port)
    }

    pub fn multicast(group: SocketAddrV4) -> Self {
        EngineConfig::default().multicast_channel(group)
    }

    pub fn local_address(mut self, address: Ipv4Addr) -> Self {
        self.local_address = Some(address);
        self
    }

    pub fn local_port(mut self, port: u16) -> Self {
        self.local_port = port;
        self
    }
}
