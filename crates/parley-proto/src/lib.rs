//! Wire protocol for the Parley signaling channel.
//! Lives in its own crate so the relay and the mesh client share one
//! definition of the frame format without pulling in runtime code.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One signaling frame. The room is part of the connection address
/// (`/ws/{room_id}`), never the envelope.
///
/// `sdp` and `candidate` payloads are opaque JSON to the relay; only
/// the two endpoints of a pair interpret them (see [`SessionDescription`]
/// and [`CandidateInit`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// Sender announces itself to the room. Broadcast to every other
    /// member; never echoed back.
    #[serde(rename_all = "camelCase")]
    Join { sender_id: String },
    /// Session description offer, relayed verbatim to `target_id`.
    #[serde(rename_all = "camelCase")]
    Offer {
        sender_id: String,
        target_id: String,
        sdp: Value,
    },
    /// Session description answer, relayed verbatim to `target_id`.
    #[serde(rename_all = "camelCase")]
    Answer {
        sender_id: String,
        target_id: String,
        sdp: Value,
    },
    /// Trickled ICE candidate, relayed verbatim to `target_id`.
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        sender_id: String,
        target_id: String,
        candidate: Value,
    },
    /// Sender is leaving the room. Broadcast to the remaining members.
    #[serde(rename_all = "camelCase")]
    Leave { sender_id: String },
}

impl Envelope {
    pub fn sender_id(&self) -> &str {
        match self {
            Envelope::Join { sender_id }
            | Envelope::Offer { sender_id, .. }
            | Envelope::Answer { sender_id, .. }
            | Envelope::IceCandidate { sender_id, .. }
            | Envelope::Leave { sender_id } => sender_id,
        }
    }

    /// Routing target. `None` for the broadcast types (join/leave).
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Envelope::Offer { target_id, .. }
            | Envelope::Answer { target_id, .. }
            | Envelope::IceCandidate { target_id, .. } => Some(target_id),
            Envelope::Join { .. } | Envelope::Leave { .. } => None,
        }
    }

    /// Wire name of the frame type, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Join { .. } => "join",
            Envelope::Offer { .. } => "offer",
            Envelope::Answer { .. } => "answer",
            Envelope::IceCandidate { .. } => "ice-candidate",
            Envelope::Leave { .. } => "leave",
        }
    }
}

/// The `sdp` payload of an offer/answer envelope, as the endpoints
/// read it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// The `candidate` payload of an ice-candidate envelope. Field names
/// follow the conventional RTCIceCandidateInit spelling, including the
/// irregular `sdpMLineIndex`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}
