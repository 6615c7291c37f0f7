//! Room event wire formats — the event types and durable state envelopes the
//! coordinator exchanges with the host room system.

use crate::participant::ParticipantSummary;
use crate::session::{CallKind, CoWatchState};
use crate::stage::StageState;
use crate::{SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Message event carrying a [`crate::signal::SignalEnvelope`].
pub const GROUP_CALL_SIGNAL_EVENT_TYPE: &str = "io.conclave.call.signal";

/// Message event carrying a [`crate::control::ControlEnvelope`].
pub const GROUP_CALL_CONTROL_EVENT_TYPE: &str = "io.conclave.call.control";

/// State event carrying [`ParticipantsStateContent`], keyed by session id.
pub const GROUP_CALL_PARTICIPANTS_EVENT_TYPE: &str = "io.conclave.call.participants";

/// State event carrying [`CallStateContent`], keyed by session id.
pub const GROUP_CALL_STATE_EVENT_TYPE: &str = "io.conclave.call.state";

/// Durable participant snapshot, written on the debounced sync path and read
/// by late joiners and on reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantsStateContent {
    pub session_id: SessionId,
    pub participants: Vec<ParticipantSummary>,
    pub updated_at: DateTime<Utc>,
}

/// Durable call-level snapshot: session metadata plus derived stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallStateContent {
    pub session_id: SessionId,
    pub started_by: UserId,
    pub started_at: DateTime<Utc>,
    pub kind: CallKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub participants: Vec<ParticipantSummary>,
    #[serde(default)]
    pub co_watch: CoWatchState,
    #[serde(default)]
    pub stage: StageState,
}
