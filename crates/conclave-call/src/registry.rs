//! Participant registry and stage state machine.
//!
//! The registry is the authoritative in-memory map of everyone on the call.
//! The stage (speakers / listeners / hand-raise queue) is always derived
//! from participant roles, never stored independently, so the two cannot
//! drift apart. Every role mutation ends with a recompute; the coordinator
//! then broadcasts the result and schedules the durable sync.

use chrono::Utc;
use conclave_common::error::{CallError, CallResult};
use conclave_common::media::MediaStream;
use conclave_common::participant::{
    Participant, ParticipantRole, ParticipantSummary, PeerConnectionState,
};
use conclave_common::stage::StageState;
use conclave_common::UserId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Authoritative participant map plus the derived stage.
pub struct ParticipantRegistry {
    local_user: UserId,
    participants: RwLock<HashMap<UserId, Participant>>,
    stage: RwLock<StageState>,
}

impl ParticipantRegistry {
    pub fn new(local: Participant) -> Self {
        let local_user = local.user_id.clone();
        let mut map = HashMap::new();
        map.insert(local_user.clone(), local);
        Self {
            local_user,
            participants: RwLock::new(map),
            stage: RwLock::new(StageState::default()),
        }
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub async fn get(&self, user_id: &str) -> Option<Participant> {
        self.participants.read().await.get(user_id).cloned()
    }

    pub async fn local(&self) -> Participant {
        // The local entry is inserted in new() and only removed by clear().
        self.participants
            .read()
            .await
            .get(&self.local_user)
            .cloned()
            .unwrap_or_else(|| Participant::local(self.local_user.clone(), "", ParticipantRole::Participant))
    }

    pub async fn contains(&self, user_id: &str) -> bool {
        self.participants.read().await.contains_key(user_id)
    }

    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    /// All participants, sorted by id for deterministic output.
    pub async fn all(&self) -> Vec<Participant> {
        let mut all: Vec<Participant> = self.participants.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        all
    }

    /// Wire-safe snapshot for state events and `participants-sync`.
    pub async fn summaries(&self) -> Vec<ParticipantSummary> {
        self.all().await.iter().map(Participant::to_summary).collect()
    }

    pub async fn stage(&self) -> StageState {
        self.stage.read().await.clone()
    }

    /// Re-derive the stage from current roles and store it.
    pub async fn recompute_stage(&self) -> StageState {
        let stage = {
            let parts = self.participants.read().await;
            StageState::derive(parts.values())
        };
        *self.stage.write().await = stage.clone();
        stage
    }

    /// Create or update a remote participant from a join payload or sync
    /// snapshot. Returns true when the participant was previously unknown.
    /// The local entry is never overwritten by remote data.
    pub async fn upsert_remote(&self, summary: ParticipantSummary) -> bool {
        if summary.user_id == self.local_user {
            return false;
        }
        let mut parts = self.participants.write().await;
        match parts.get_mut(&summary.user_id) {
            Some(existing) => {
                let keep_stream = existing.stream.clone();
                let keep_screen = existing.screenshare_stream.clone();
                let keep_conn = existing.connection_state;
                let mut updated = summary.into_participant();
                updated.stream = keep_stream;
                updated.screenshare_stream = keep_screen;
                updated.connection_state = keep_conn;
                *existing = updated;
                false
            }
            None => {
                let user_id = summary.user_id.clone();
                parts.insert(user_id.clone(), summary.into_participant());
                tracing::info!(user = %user_id, "Participant joined");
                true
            }
        }
    }

    /// Remove on leave/kick. Returns the removed entry.
    pub async fn remove(&self, user_id: &str) -> Option<Participant> {
        if user_id == self.local_user {
            return None;
        }
        let removed = self.participants.write().await.remove(user_id);
        if removed.is_some() {
            tracing::info!(user = %user_id, "Participant removed");
        }
        removed
    }

    /// Apply a closure to one participant. Returns false if unknown.
    pub async fn update<F>(&self, user_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Participant),
    {
        let mut parts = self.participants.write().await;
        match parts.get_mut(user_id) {
            Some(p) => {
                f(p);
                p.last_active = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Set a participant's role, keeping `hand_raised_at` consistent:
    /// entering `requesting_speak` stamps the raise time (first-raised order
    /// for the queue), leaving it clears the stamp.
    pub async fn set_role(&self, user_id: &str, role: ParticipantRole) -> bool {
        self.update(user_id, |p| {
            if role == ParticipantRole::RequestingSpeak {
                if p.role != ParticipantRole::RequestingSpeak {
                    p.hand_raised_at = Some(Utc::now());
                }
            } else {
                p.hand_raised_at = None;
            }
            p.role = role;
        })
        .await
    }

    /// Toggle the local hand: a listener starts requesting, a requester
    /// returns to listener. Raising twice equals lowering. Returns the new
    /// "raised" flag, or None if the local role cannot raise a hand.
    pub async fn toggle_local_hand(&self) -> Option<bool> {
        let local = self.local_user.clone();
        let current = self.get(&local).await?.role;
        match current {
            ParticipantRole::RequestingSpeak => {
                self.set_role(&local, ParticipantRole::Listener).await;
                Some(false)
            }
            ParticipantRole::Listener => {
                self.set_role(&local, ParticipantRole::RequestingSpeak).await;
                Some(true)
            }
            // Speakers have nothing to request.
            _ => None,
        }
    }

    /// Promote a listener or requester onto the stage, removing them from
    /// the hand-raise queue.
    pub async fn promote(&self, user_id: &str, role: ParticipantRole) -> CallResult<()> {
        if !self.contains(user_id).await {
            return Err(CallError::UnknownParticipant { user_id: user_id.into() });
        }
        self.set_role(user_id, role).await;
        Ok(())
    }

    /// Demote a participant to the audience. Hosts and moderators cannot be
    /// demoted.
    pub async fn demote(&self, user_id: &str) -> CallResult<()> {
        let target = self
            .get(user_id)
            .await
            .ok_or_else(|| CallError::UnknownParticipant { user_id: user_id.into() })?;
        if target.role.is_privileged() {
            return Err(CallError::Forbidden {
                message: format!("cannot move {} ({:?}) to the audience", user_id, target.role),
            });
        }
        self.set_role(user_id, ParticipantRole::Listener).await;
        Ok(())
    }

    /// Record a connection-state transition. Streams are cleared when the
    /// link goes down, but the entry itself survives until leave/kick.
    pub async fn set_connection_state(&self, user_id: &str, state: PeerConnectionState) -> bool {
        self.update(user_id, |p| {
            p.connection_state = state;
            if state.is_down() {
                p.stream = None;
                p.screenshare_stream = None;
            }
        })
        .await
    }

    pub async fn set_stream(&self, user_id: &str, stream: Option<MediaStream>) -> bool {
        self.update(user_id, |p| p.stream = stream).await
    }

    pub async fn set_screenshare_stream(&self, user_id: &str, stream: Option<MediaStream>) -> bool {
        self.update(user_id, |p| {
            p.is_screensharing = stream.is_some();
            p.screenshare_stream = stream;
        })
        .await
    }

    /// Drop every entry, local included. Only teardown calls this.
    pub async fn clear(&self) {
        self.participants.write().await.clear();
        *self.stage.write().await = StageState::default();
    }
}
