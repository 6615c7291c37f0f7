//! Stage state — who speaks, who listens, who is waiting to be promoted.

use crate::participant::Participant;
use crate::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derived stage membership, recomputed whenever any participant's role
/// changes and broadcast after each recomputation.
///
/// Invariants:
/// - every id here exists in the participant registry
/// - `hand_raise_queue` holds exactly the `requesting_speak` ids, in
///   first-raised order
/// - `speakers` holds every participant whose role is neither `listener`
///   nor `requesting_speak`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageState {
    pub speakers: Vec<UserId>,
    pub listeners: Vec<UserId>,
    pub hand_raise_queue: Vec<UserId>,
    pub updated_at: DateTime<Utc>,
}

impl StageState {
    /// Derive the stage from the full participant set.
    pub fn derive<'a>(participants: impl Iterator<Item = &'a Participant>) -> Self {
        let mut speakers = Vec::new();
        let mut listeners = Vec::new();
        let mut queue: Vec<(DateTime<Utc>, UserId)> = Vec::new();

        for p in participants {
            if p.role.is_speaker() {
                speakers.push(p.user_id.clone());
            } else {
                listeners.push(p.user_id.clone());
            }
            if p.role == crate::participant::ParticipantRole::RequestingSpeak {
                // Entries missing a raise timestamp sort first; they came
                // from a wire summary that predates the field.
                let at = p.hand_raised_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
                queue.push((at, p.user_id.clone()));
            }
        }

        // Deterministic output regardless of map iteration order.
        speakers.sort();
        listeners.sort();
        queue.sort();

        Self {
            speakers,
            listeners,
            hand_raise_queue: queue.into_iter().map(|(_, id)| id).collect(),
            updated_at: Utc::now(),
        }
    }

    pub fn is_speaker(&self, user_id: &str) -> bool {
        self.speakers.iter().any(|u| u == user_id)
    }

    pub fn queue_position(&self, user_id: &str) -> Option<usize> {
        self.hand_raise_queue.iter().position(|u| u == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::{Participant, ParticipantRole};
    use chrono::Duration;

    fn member(id: &str, role: ParticipantRole) -> Participant {
        Participant::new(id, id.trim_start_matches('@'), role)
    }

    #[test]
    fn test_derive_partitions_by_role() {
        let parts = vec![
            member("@alice:x", ParticipantRole::Host),
            member("@bob:x", ParticipantRole::Listener),
            member("@carol:x", ParticipantRole::Presenter),
        ];
        let stage = StageState::derive(parts.iter());
        assert_eq!(stage.speakers, vec!["@alice:x", "@carol:x"]);
        assert_eq!(stage.listeners, vec!["@bob:x"]);
        assert!(stage.hand_raise_queue.is_empty());
    }

    #[test]
    fn test_queue_ordered_by_raise_time() {
        let now = Utc::now();
        let mut late = member("@a-late:x", ParticipantRole::RequestingSpeak);
        late.hand_raised_at = Some(now);
        let mut early = member("@z-early:x", ParticipantRole::RequestingSpeak);
        early.hand_raised_at = Some(now - Duration::seconds(30));

        let parts = vec![late, early];
        let stage = StageState::derive(parts.iter());
        // @z-early raised first, so it leads despite sorting after @a-late
        // lexicographically.
        assert_eq!(stage.hand_raise_queue, vec!["@z-early:x", "@a-late:x"]);
        assert_eq!(stage.queue_position("@a-late:x"), Some(1));
    }

    #[test]
    fn test_requesting_speak_counts_as_listener() {
        let parts = vec![member("@bob:x", ParticipantRole::RequestingSpeak)];
        let stage = StageState::derive(parts.iter());
        assert!(!stage.is_speaker("@bob:x"));
        assert_eq!(stage.listeners, vec!["@bob:x"]);
        assert_eq!(stage.hand_raise_queue, vec!["@bob:x"]);
    }
}
