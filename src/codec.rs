//! Datagram encoding.
//!
//! The wire carries no type tag: a datagram is classified by trying each
//! known message shape in a fixed order and keeping the first that decodes.
//! Every message struct rejects unknown fields, so one shape never decodes
//! as another.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::messages::{JoinRequest, JoinResponse};

pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>>;

    /// Returns `None` for anything that is not a well-formed `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, message: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(message)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T> {
        if bytes.is_empty() {
            return None;
        }
        serde_json::from_slice(bytes).ok()
    }
}

/// What a datagram on the discovery channel turned out to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryDatagram {
    Request(JoinRequest),
    Response(JoinResponse),
}

/// Join requests are tried before join responses.
pub fn classify_discovery<C: Codec>(codec: &C, bytes: &[u8]) -> Option<DiscoveryDatagram> {
    if let Some(request) = codec.decode::<JoinRequest>(bytes) {
        return Some(DiscoveryDatagram::Request(request));
    }
    codec
        .decode::<JoinResponse>(bytes)
        .map(DiscoveryDatagram::Response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ChatMessage, Username};

    fn alice() -> Username {
        Username::new("alice").unwrap()
    }

    #[test]
    fn join_request_round_trip() {
        let request = JoinRequest::new(alice(), "book-club");
        let bytes = JsonCodec.encode(&request).unwrap();
        assert_eq!(JsonCodec.decode::<JoinRequest>(&bytes), Some(request));
    }

    #[test]
    fn join_response_round_trip_keeps_optional_endpoint() {
        let accepted = JoinResponse::accept("book-club", "239.1.1.1:9100".parse().unwrap());
        let bytes = JsonCodec.encode(&accepted).unwrap();
        assert_eq!(JsonCodec.decode::<JoinResponse>(&bytes), Some(accepted));

        let denied = JoinResponse::deny("book-club");
        let bytes = JsonCodec.encode(&denied).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("group_endpoint"));
        let decoded = JsonCodec.decode::<JoinResponse>(&bytes).unwrap();
        assert_eq!(decoded, denied);
        assert_eq!(decoded.group_endpoint(), None);
    }

    #[test]
    fn chat_message_round_trip() {
        let message = ChatMessage::new(alice(), "hello, group");
        let bytes = JsonCodec.encode(&message).unwrap();
        assert_eq!(JsonCodec.decode::<ChatMessage>(&bytes), Some(message));
    }

    #[test]
    fn shapes_do_not_cross_decode() {
        let chat = JsonCodec.encode(&ChatMessage::new(alice(), "hi")).unwrap();
        assert!(JsonCodec.decode::<JoinRequest>(&chat).is_none());
        assert!(JsonCodec.decode::<JoinResponse>(&chat).is_none());

        let request = JsonCodec.encode(&JoinRequest::new(alice(), "g")).unwrap();
        assert!(JsonCodec.decode::<JoinResponse>(&request).is_none());
        assert!(JsonCodec.decode::<ChatMessage>(&request).is_none());

        let response = JsonCodec.encode(&JoinResponse::deny("g")).unwrap();
        assert!(JsonCodec.decode::<JoinRequest>(&response).is_none());
        assert!(JsonCodec.decode::<ChatMessage>(&response).is_none());
    }

    #[test]
    fn garbage_and_empty_usernames_are_rejected() {
        assert!(JsonCodec.decode::<JoinRequest>(b"").is_none());
        assert!(JsonCodec.decode::<JoinRequest>(b"\x00\x01not json").is_none());
        assert!(JsonCodec.decode::<JoinRequest>(b"{\"username\":\"alice\"").is_none());

        let empty_name = br#"{"username":"","group_id":"g","sent_at":"2024-01-01T00:00:00Z"}"#;
        assert!(JsonCodec.decode::<JoinRequest>(empty_name).is_none());
    }

    #[test]
    fn classify_prefers_request_then_response() {
        let request = JoinRequest::new(alice(), "book-club");
        let bytes = JsonCodec.encode(&request).unwrap();
        assert_eq!(
            classify_discovery(&JsonCodec, &bytes),
            Some(DiscoveryDatagram::Request(request))
        );

        let response = JoinResponse::deny("book-club");
        let bytes = JsonCodec.encode(&response).unwrap();
        assert_eq!(
            classify_discovery(&JsonCodec, &bytes),
            Some(DiscoveryDatagram::Response(response))
        );

        let chat = JsonCodec.encode(&ChatMessage::new(alice(), "hi")).unwrap();
        assert_eq!(classify_discovery(&JsonCodec, &chat), None);
    }
}
