//! Room transport seam.
//!
//! The coordinator never talks to the network directly: all signaling rides
//! on the host room system's ordinary message and state events. The
//! transport guarantees persistence and delivery order per event stream, but
//! no causal ordering across independent sends — which is why the peer layer
//! buffers signals that outrun their `join`.

use async_trait::async_trait;
use conclave_common::UserId;
use tokio::sync::mpsc;

/// An inbound room event, already filtered by the transport to the event
/// types the coordinator subscribed to.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub event_type: String,
    pub sender: UserId,
    pub content: serde_json::Value,
    /// Present for state events; the coordinator keys call state by session.
    pub state_key: Option<String>,
}

/// The host room system, seen from the call coordinator.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    /// Send a message-style event: effectively fire-and-forget, unordered
    /// relative to other event types.
    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// Send a durable state event, keyed so later writes replace earlier
    /// ones for the same session.
    async fn send_state_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: serde_json::Value,
        state_key: &str,
    ) -> anyhow::Result<()>;

    /// Subscribe to inbound call-related events, delivered in arrival order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomEvent>;
}
