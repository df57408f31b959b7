use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GroupChatError, Result};

pub type GroupId = String;

/// A display name that is never empty. Comparison is case-sensitive.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(GroupChatError::InvalidUsername);
        }
        Ok(Username(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = GroupChatError;

    fn try_from(name: String) -> Result<Self> {
        Username::new(name)
    }
}

impl From<Username> for String {
    fn from(name: Username) -> Self {
        name.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JoinRequest {
    pub username: Username,
    pub group_id: GroupId,
    pub sent_at: DateTime<Utc>,
}

impl JoinRequest {
    pub fn new(username: Username, group_id: impl Into<GroupId>) -> Self {
        JoinRequest {
            username,
            group_id: group_id.into(),
            sent_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "fail")]
    Fail,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct JoinResponse {
    pub code: ResponseCode,
    pub group_id: GroupId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_endpoint: Option<SocketAddrV4>,
}

impl JoinResponse {
    pub fn accept(group_id: impl Into<GroupId>, group_endpoint: SocketAddrV4) -> Self {
        JoinResponse {
            code: ResponseCode::Success,
            group_id: group_id.into(),
            group_endpoint: Some(group_endpoint),
        }
    }

    pub fn deny(group_id: impl Into<GroupId>) -> Self {
        JoinResponse {
            code: ResponseCode::Fail,
            group_id: group_id.into(),
            group_endpoint: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResponseCode::Success
    }

    /// The group's multicast endpoint. Always `None` for a failed response,
    /// whatever the datagram carried.
    pub fn group_endpoint(&self) -> Option<SocketAddrV4> {
        match self.code {
            ResponseCode::Success => self.group_endpoint,
            ResponseCode::Fail => None,
        }
    }
}

/// A chat line as it travels on a group's multicast address. The group is
/// implied by the address, so no group id is carried.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChatMessage {
    pub username: Username,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(username: Username, text: impl Into<String>) -> Self {
        ChatMessage {
            username,
            text: text.into(),
            sent_at: Utc::now(),
        }
    }
}

/// A chat message surfaced to the caller, tagged with the group it arrived on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub group_id: GroupId,
    pub username: Username,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub from: SocketAddr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupEvent {
    Message(ReceivedMessage),
    /// A join request was queued; `count` is the queue length after the push.
    JoinRequestsPending { count: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rejects_empty() {
        assert!(matches!(Username::new(""), Err(GroupChatError::InvalidUsername)));
        assert_eq!(Username::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn username_is_case_sensitive() {
        assert_ne!(Username::new("Alice").unwrap(), Username::new("alice").unwrap());
    }

    #[test]
    fn denied_response_never_exposes_endpoint() {
        let denied = JoinResponse::deny("book-club");
        assert!(!denied.is_success());
        assert_eq!(denied.group_endpoint(), None);

        let forged = JoinResponse {
            code: ResponseCode::Fail,
            group_id: "book-club".into(),
            group_endpoint: Some("239.1.1.1:9100".parse().unwrap()),
        };
        assert_eq!(forged.group_endpoint(), None);
    }

    #[test]
    fn accepted_response_carries_endpoint() {
        let endpoint: SocketAddrV4 = "239.1.1.1:9100".parse().unwrap();
        let accepted = JoinResponse::accept("book-club", endpoint);
        assert!(accepted.is_success());
        assert_eq!(accepted.group_endpoint(), Some(endpoint));
    }
}
