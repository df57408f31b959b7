//! Serverless group chat for a local network.
//!
//! Participants find each other with UDP broadcast and talk inside a group
//! over UDP multicast. One participant creates a group by naming it and
//! picking a multicast address; others broadcast a join request that the
//! creator accepts or denies.

pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod messages;
pub mod queue;

pub use channel::{is_multicast, Channel, ChannelKind, Datagram};
pub use codec::{Codec, JsonCodec};
pub use config::{ChannelConfig, EngineConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_GROUP_PORT};
pub use engine::{JoinDecision, MembershipEngine, Role};
pub use error::{GroupChatError, Result};
pub use messages::{
    ChatMessage, GroupEvent, GroupId, JoinRequest, JoinResponse, ReceivedMessage, ResponseCode,
    Username,
};
pub use queue::{JoinRequestQueue, PendingJoinRequest};
