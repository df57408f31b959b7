use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GroupChatError {
    #[error("failed to bind UDP socket to {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a multicast address")]
    InvalidAddress(IpAddr),
    #[error("no response to join request for group '{group_id}' within {timeout:?}")]
    JoinTimeout { group_id: String, timeout: Duration },
    #[error("join request for group '{group_id}' was denied")]
    JoinDenied { group_id: String },
    #[error("failed to send datagram to {destination}")]
    Send {
        destination: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("channel is closed")]
    ChannelClosed,
    #[error("username must not be empty")]
    InvalidUsername,
    #[error("failed to encode message")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GroupChatError {
    /// Timeouts and denials are ordinary handshake outcomes; the caller may retry.
    pub fn is_join_outcome(&self) -> bool {
        matches!(self, Self::JoinTimeout { .. } | Self::JoinDenied { .. })
    }
}

pub type Result<T> = std::result::Result<T, GroupChatError>;
