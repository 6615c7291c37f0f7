//! Control bus messages — small state deltas broadcast over data channels,
//! with a durable room state event as the eventual-consistency fallback.

use crate::participant::ParticipantSummary;
use crate::session::CoWatchState;
use crate::stage::StageState;
use crate::{SessionId, UserId};
use serde::{Deserialize, Serialize};

/// Control message variants. Unknown kinds received from newer peers are
/// ignored at the dispatch point, not treated as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ControlMessage {
    CowatchToggle {
        co_watch: CoWatchState,
    },
    /// Full participant snapshot; pushed immediately on channel open so a
    /// newly connected peer does not wait for the next debounce cycle.
    ParticipantsSync {
        participants: Vec<ParticipantSummary>,
    },
    ScreenshareToggle {
        user_id: UserId,
        active: bool,
    },
    StageUpdate {
        stage: StageState,
    },
    HandRaise {
        user_id: UserId,
    },
    HandLower {
        user_id: UserId,
    },
    /// A host/moderator invites a queued listener onto the stage.
    StageInvite {
        user_id: UserId,
        role: crate::participant::ParticipantRole,
    },
}

/// The envelope sent on the room's control event type and over control data
/// channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlEnvelope {
    pub session_id: SessionId,
    pub from: UserId,
    pub message: ControlMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kebab_case_tags() {
        let msg = ControlMessage::HandRaise { user_id: "@bob:x".into() };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "hand-raise");
        assert_eq!(json["payload"]["user_id"], "@bob:x");
    }

    #[test]
    fn test_unknown_variant_fails_parse() {
        // The dispatch point relies on this erroring so it can ignore the
        // message instead of acting on garbage.
        let raw = serde_json::json!({ "type": "jazz-hands", "payload": {} });
        assert!(serde_json::from_value::<ControlMessage>(raw).is_err());
    }

    #[test]
    fn test_stage_update_round_trip() {
        let msg = ControlMessage::StageUpdate { stage: StageState::default() };
        let raw = serde_json::to_string(&msg).unwrap();
        let back: ControlMessage = serde_json::from_str(&raw).unwrap();
        assert!(matches!(back, ControlMessage::StageUpdate { .. }));
    }
}
