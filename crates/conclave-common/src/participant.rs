//! Participant model — one entry per call member, local or remote.

use crate::media::MediaStream;
use crate::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a participant within the call.
///
/// Roles drive the stage state machine: everyone whose role is neither
/// `Listener` nor `RequestingSpeak` counts as a speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Host,
    Moderator,
    Presenter,
    Participant,
    Listener,
    RequestingSpeak,
}

impl ParticipantRole {
    /// Whether this role is allowed to transmit media as a speaker.
    pub fn is_speaker(self) -> bool {
        !matches!(self, Self::Listener | Self::RequestingSpeak)
    }

    /// Host and moderator cannot be demoted to the audience.
    pub fn is_privileged(self) -> bool {
        matches!(self, Self::Host | Self::Moderator)
    }
}

/// Connection state of the peer link backing a remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    /// States in which the participant's displayed stream is cleared. The
    /// registry entry itself survives until an explicit leave or kick.
    pub fn is_down(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

/// A member of the call, local or remote.
///
/// Mutated by control messages, state-event replay, or local actions;
/// removed only on a leave signal, a kick, or coordinator teardown.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: ParticipantRole,
    pub is_local: bool,
    pub is_muted: bool,
    pub is_video_muted: bool,
    pub is_screensharing: bool,
    pub is_co_watching: bool,
    pub last_active: DateTime<Utc>,
    /// Set while the role is `RequestingSpeak`; orders the hand-raise queue.
    pub hand_raised_at: Option<DateTime<Utc>>,
    pub connection_state: PeerConnectionState,
    /// Live camera/mic stream currently displayed for this participant.
    pub stream: Option<MediaStream>,
    pub screenshare_stream: Option<MediaStream>,
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role,
            is_local: false,
            is_muted: false,
            is_video_muted: false,
            is_screensharing: false,
            is_co_watching: false,
            last_active: Utc::now(),
            hand_raised_at: None,
            connection_state: PeerConnectionState::New,
            stream: None,
            screenshare_stream: None,
        }
    }

    pub fn local(user_id: impl Into<UserId>, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        let mut p = Self::new(user_id, display_name, role);
        p.is_local = true;
        p.connection_state = PeerConnectionState::Connected;
        p
    }

    /// Wire-safe projection (no stream handles) for state events and
    /// `participants-sync` control messages.
    pub fn to_summary(&self) -> ParticipantSummary {
        ParticipantSummary {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
            role: self.role,
            is_muted: self.is_muted,
            is_video_muted: self.is_video_muted,
            is_screensharing: self.is_screensharing,
            is_co_watching: self.is_co_watching,
            hand_raised_at: self.hand_raised_at,
            last_active: self.last_active,
        }
    }
}

/// The participant subset that travels over the wire. Streams and connection
/// state are per-viewer and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    pub role: ParticipantRole,
    #[serde(default)]
    pub is_muted: bool,
    #[serde(default)]
    pub is_video_muted: bool,
    #[serde(default)]
    pub is_screensharing: bool,
    #[serde(default)]
    pub is_co_watching: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_raised_at: Option<DateTime<Utc>>,
    pub last_active: DateTime<Utc>,
}

impl ParticipantSummary {
    /// Rebuild a registry entry from a wire summary (late join / replay).
    pub fn into_participant(self) -> Participant {
        Participant {
            user_id: self.user_id,
            display_name: self.display_name,
            avatar_url: self.avatar_url,
            role: self.role,
            is_local: false,
            is_muted: self.is_muted,
            is_video_muted: self.is_video_muted,
            is_screensharing: self.is_screensharing,
            is_co_watching: self.is_co_watching,
            last_active: self.last_active,
            hand_raised_at: self.hand_raised_at,
            connection_state: PeerConnectionState::New,
            stream: None,
            screenshare_stream: None,
        }
    }
}
