//! # conclave-common
//!
//! Shared types for the Conclave group-call coordinator: the participant and
//! stage data model, the wire envelopes exchanged over the room's event
//! channel, caption events, lightweight media primitives, and the error
//! taxonomy. This is the foundation layer — no I/O, no call logic.

pub mod caption;
pub mod control;
pub mod error;
pub mod events;
pub mod media;
pub mod participant;
pub mod session;
pub mod signal;
pub mod stage;

/// A room-level user identifier, e.g. `@alice:chat.example.org`.
///
/// Kept as a plain string because the host room system owns the format; the
/// coordinator only needs equality and lexicographic ordering (the offer
/// glare rule in `conclave-call` compares ids with `<`).
pub type UserId = String;

/// Identifier of the room hosting the call.
pub type RoomId = String;

/// Identifier of one call session within a room.
pub type SessionId = String;
