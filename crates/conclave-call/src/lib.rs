//! # conclave-call
//!
//! Group-call coordinator for a full-mesh peer-to-peer call among the
//! members of a chat room. Signaling is relayed through the room's ordinary
//! message/state event channel — there is no dedicated signaling server.
//!
//! Architecture, leaves first:
//! - `transport` — the room event channel seam (send events, send durable
//!   state events, subscribe to inbound events)
//! - `peer` — one WebRTC link per remote participant, glare-free
//!   negotiation, pending-signal buffering
//! - `registry` — authoritative participant map + derived stage
//!   (speakers / listeners / hand-raise queue)
//! - `control_bus` — two-tier state delta broadcast: immediate best-effort
//!   data-channel sends, debounced durable state events
//! - `captions` — live transcription relay with bounded history replay
//! - `effects` — processed-stream substitution without renegotiation
//! - `screenshare` — display capture hot-swapped onto the video sender
//! - `coordinator` — lifecycle, event dispatch, teardown
//!
//! All mutation happens inside one coordinator's event-processing context;
//! state is owned per call instance, never process-global.

pub mod capture;
pub mod captions;
pub mod control_bus;
pub mod coordinator;
pub mod effects;
pub mod peer;
pub mod registry;
pub mod screenshare;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use coordinator::{CallCollaborators, CallCoordinator, CallOptions, CallStats};

use conclave_common::participant::Participant;
use conclave_common::session::CoWatchState;
use conclave_common::stage::StageState;

/// Events fanned out to embedders over a `tokio::sync::broadcast` channel
/// (subscribe via [`CallCoordinator::subscribe`]).
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// The participant set or some participant attribute changed.
    ParticipantsChanged(Vec<Participant>),
    CoWatchChanged(CoWatchState),
    /// Local screen share started or stopped.
    ScreenshareChanged(bool),
    StageChanged(StageState),
    /// A non-fatal error was logged and surfaced; the call continues.
    Error { code: &'static str, message: String },
    /// The coordinator finished teardown. Terminal.
    Disposed,
}
