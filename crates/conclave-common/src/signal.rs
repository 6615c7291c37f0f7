//! Signaling envelopes — join/leave/offer/answer/ice-candidate, relayed as
//! ordinary room message events rather than through a signaling server.

use crate::participant::ParticipantSummary;
use crate::{SessionId, UserId};
use serde::{Deserialize, Serialize};

/// An SDP session description carried in an offer or answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

/// A network path descriptor exchanged to establish a direct connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u32>,
}

/// Signal payloads. `Join`/`Leave` are broadcast to the room; the SDP and
/// candidate variants are targeted at one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// Announce presence, carrying enough to seed a registry entry.
    Join { member: ParticipantSummary },
    /// Announce departure; receivers drop the peer link and registry entry.
    Leave,
    Offer { description: SessionDescription },
    Answer { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl SignalPayload {
    /// Only a join may create state for an unknown sender; everything else
    /// is buffered until the join is processed.
    pub fn is_join(&self) -> bool {
        matches!(self, Self::Join { .. })
    }
}

/// The envelope sent on the room's signal event type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub session_id: SessionId,
    /// `None` means broadcast-to-room (join/leave).
    pub target: Option<UserId>,
    pub from: UserId,
    #[serde(flatten)]
    pub payload: SignalPayload,
    /// Uniquifies otherwise-identical envelopes on the wire.
    pub nonce: String,
}

impl SignalEnvelope {
    pub fn broadcast(session_id: impl Into<SessionId>, from: impl Into<UserId>, payload: SignalPayload) -> Self {
        Self {
            session_id: session_id.into(),
            target: None,
            from: from.into(),
            payload,
            nonce: new_nonce(),
        }
    }

    pub fn targeted(
        session_id: impl Into<SessionId>,
        from: impl Into<UserId>,
        target: impl Into<UserId>,
        payload: SignalPayload,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            target: Some(target.into()),
            from: from.into(),
            payload,
            nonce: new_nonce(),
        }
    }

    /// Acceptance filter: the session must match, the envelope must be for
    /// us (or broadcast), and we never process our own reflected sends.
    pub fn accepts(&self, session_id: &str, local_user: &str) -> bool {
        self.session_id == session_id
            && self.from != local_user
            && self.target.as_deref().is_none_or(|t| t == local_user)
    }
}

fn new_nonce() -> String {
    use rand::Rng;
    let n: u64 = rand::rng().random();
    format!("{n:016x}")
}
