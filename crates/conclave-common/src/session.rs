//! Call session metadata — one instance per call, not per participant.

use crate::{SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of call this session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Voice,
    Video,
}

/// Shared "watch together" state, toggled via the control bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoWatchState {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_by: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Call-level metadata, created by whoever starts the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub started_by: UserId,
    pub started_at: DateTime<Utc>,
    pub kind: CallKind,
    /// Deep link into the hosting application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub co_watch: CoWatchState,
}

impl CallSession {
    pub fn new(session_id: impl Into<SessionId>, started_by: impl Into<UserId>, kind: CallKind) -> Self {
        Self {
            session_id: session_id.into(),
            started_by: started_by.into(),
            started_at: Utc::now(),
            kind,
            url: None,
            co_watch: CoWatchState::default(),
        }
    }
}

/// ICE server configuration (STUN/TURN) handed to the peer factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Default STUN servers (free, public).
    pub fn default_stun() -> Vec<Self> {
        vec![
            Self {
                urls: vec!["stun:stun.l.google.com:19302".into()],
                username: None,
                credential: None,
            },
            Self {
                urls: vec!["stun:stun1.l.google.com:19302".into()],
                username: None,
                credential: None,
            },
        ]
    }
}
