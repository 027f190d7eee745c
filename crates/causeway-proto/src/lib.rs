//! Wire protocol shared by the causeway relay and its clients.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other client languages without pulling in heavier runtime code.
//!
//! All frames are JSON text messages over a single WebSocket per client.
//! Offer, answer, and candidate payloads are opaque strings: the relay
//! stores and forwards them but never inspects their contents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Register the sender as a member of the named channel.
    #[serde(rename_all = "camelCase")]
    Join { channel_name: String },
    /// Store the offer (last writer wins) and forward it to the other members.
    #[serde(rename_all = "camelCase")]
    SubmitOffer { channel_name: String, offer: String },
    /// Fetch the stored offer; used by a late joiner that missed the broadcast.
    #[serde(rename_all = "camelCase")]
    GetOffer { channel_name: String },
    /// Store the answer (last writer wins) and forward it to the other members.
    #[serde(rename_all = "camelCase")]
    SubmitAnswer { channel_name: String, answer: String },
    /// Append a connectivity candidate and forward it to the other members.
    #[serde(rename_all = "camelCase")]
    SubmitIceCandidate {
        channel_name: String,
        candidate: String,
    },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Join acknowledgment; the channel membership now includes the sender.
    #[serde(rename_all = "camelCase")]
    Joined { channel_name: String },
    /// Acknowledges a `submitOffer` after the forward went out.
    #[serde(rename_all = "camelCase")]
    OfferSubmitted { channel_name: String },
    /// Acknowledges a `submitAnswer` after the forward went out.
    #[serde(rename_all = "camelCase")]
    AnswerSubmitted { channel_name: String },
    /// Acknowledges a `submitIceCandidate` after the forward went out.
    #[serde(rename_all = "camelCase")]
    IceCandidateSubmitted { channel_name: String },
    /// Reply to `getOffer`; `offer` is absent when nothing is stored yet.
    #[serde(rename_all = "camelCase")]
    OfferRetrieved {
        channel_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<String>,
    },
    /// An offer submitted by another member of the channel.
    #[serde(rename_all = "camelCase")]
    OfferReceived { channel_name: String, offer: String },
    /// An answer submitted by another member of the channel.
    #[serde(rename_all = "camelCase")]
    AnswerReceived { channel_name: String, answer: String },
    /// A candidate submitted by another member of the channel.
    #[serde(rename_all = "camelCase")]
    IceCandidateReceived {
        channel_name: String,
        candidate: String,
    },
    /// Heartbeat reply.
    Pong,
    /// A malformed frame or handler failure; never closes the connection.
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Generate a unique connection identifier for a relay socket.
pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_wire_names() {
        let msg = ClientMessage::SubmitIceCandidate {
            channel_name: "room1".into(),
            candidate: "candidate:0 1 udp".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"submitIceCandidate\""), "{json}");
        assert!(json.contains("\"channelName\":\"room1\""), "{json}");

        let join = serde_json::to_string(&ClientMessage::Join {
            channel_name: "room1".into(),
        })
        .unwrap();
        assert!(join.contains("\"type\":\"join\""), "{join}");
    }

    #[test]
    fn offer_retrieved_omits_empty_offer() {
        let none = ServerMessage::OfferRetrieved {
            channel_name: "room1".into(),
            offer: None,
        };
        let json = serde_json::to_string(&none).unwrap();
        assert!(!json.contains("offer\":"), "{json}");

        let parsed: ServerMessage =
            serde_json::from_str("{\"type\":\"offerRetrieved\",\"channelName\":\"room1\"}").unwrap();
        match parsed {
            ServerMessage::OfferRetrieved { offer, .. } => assert!(offer.is_none()),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_message_round_trip() {
        let msg = ServerMessage::IceCandidateReceived {
            channel_name: "room1".into(),
            candidate: "candidate:1 1 udp 2113937151".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"iceCandidateReceived\""), "{json}");
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::IceCandidateReceived { candidate, .. } => {
                assert_eq!(candidate, "candidate:1 1 udp 2113937151");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
