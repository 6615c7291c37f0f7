//! Caption relay — live transcription chunks over a dedicated data channel.
//!
//! History is append-only per call and capped in memory; a channel that just
//! opened receives at most the last [`CAPTION_REPLAY_LIMIT`] events as one
//! `call.caption_history` replay. This is the only place the call core talks
//! to the transcription/persistence collaborators, and every sink call is
//! fire-and-forget: failures are logged, never propagated.

use crate::peer::{ChannelKind, PeerManager, SignalChannel};
use async_trait::async_trait;
use conclave_common::caption::{
    CaptionChannelMessage, CaptionEvent, CaptionSource, CaptionTranslation, LiveTranscriptChunk,
    CAPTION_HISTORY_LIMIT, CAPTION_REPLAY_LIMIT,
};
use conclave_common::{SessionId, UserId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Caption persistence and notification collaborators.
#[async_trait]
pub trait CaptionSinks: Send + Sync {
    async fn append_to_timeline(&self, event: &CaptionEvent) -> anyhow::Result<()>;
    async fn index_for_search(&self, event: &CaptionEvent) -> anyhow::Result<()>;
    async fn push_notify(&self, event: &CaptionEvent) -> anyhow::Result<()>;
    /// Normalized chunk for the local live-transcript view.
    fn emit_live_chunk(&self, chunk: LiveTranscriptChunk);
}

/// Relays captions between the local transcriber, remote peers, and the
/// persistence sinks.
pub struct CaptionRelay {
    session_id: SessionId,
    local_user: UserId,
    peers: Arc<PeerManager>,
    sinks: Arc<dyn CaptionSinks>,
    history: Mutex<VecDeque<CaptionEvent>>,
}

impl CaptionRelay {
    pub fn new(session_id: SessionId, local_user: UserId, peers: Arc<PeerManager>, sinks: Arc<dyn CaptionSinks>) -> Self {
        Self {
            session_id,
            local_user,
            peers,
            sinks,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    pub async fn history(&self) -> Vec<CaptionEvent> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Append one event, enforcing the cap. Returns false when the id was
    /// already present (replayed history overlapping live delivery).
    async fn append(&self, event: CaptionEvent) -> bool {
        let mut history = self.history.lock().await;
        if history.iter().any(|e| e.id == event.id) {
            return false;
        }
        history.push_back(event);
        while history.len() > CAPTION_HISTORY_LIMIT {
            history.pop_front();
        }
        true
    }

    async fn fan_out(&self, message: &CaptionChannelMessage) {
        let bytes = match serde_json::to_vec(message) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode caption message");
                return;
            }
        };
        for (remote, channel) in self.peers.open_channels(ChannelKind::Caption).await {
            if let Err(e) = channel.send(&bytes).await {
                tracing::warn!(remote = %remote, error = %e, "Caption channel send failed");
            }
        }
    }

    /// Feed an event to the persistence collaborators. Errors are swallowed
    /// and logged.
    async fn persist(&self, event: &CaptionEvent) {
        if let Err(e) = self.sinks.append_to_timeline(event).await {
            tracing::warn!(caption = %event.id, error = %e, "Timeline append failed");
        }
        if let Err(e) = self.sinks.index_for_search(event).await {
            tracing::warn!(caption = %event.id, error = %e, "Search indexing failed");
        }
        if let Err(e) = self.sinks.push_notify(event).await {
            tracing::warn!(caption = %event.id, error = %e, "Caption notify failed");
        }
        self.sinks.emit_live_chunk(LiveTranscriptChunk::from(event));
    }

    /// Publish a locally transcribed chunk: record it, relay it to every
    /// open caption channel, and persist it.
    pub async fn publish_local(&self, mut event: CaptionEvent) {
        event.call_id = self.session_id.clone();
        event.sender = self.local_user.clone();
        event.source = CaptionSource::Local;
        if !self.append(event.clone()).await {
            return;
        }
        self.fan_out(&CaptionChannelMessage::Caption(event.clone())).await;
        self.persist(&event).await;
    }

    /// Attach a translation to an already-relayed caption and forward it.
    pub async fn publish_translation(&self, translation: CaptionTranslation) {
        let updated = self.apply_translation_locally(&translation).await;
        self.fan_out(&CaptionChannelMessage::Translation(translation)).await;
        if let Some(event) = updated {
            self.sinks.emit_live_chunk(LiveTranscriptChunk::from(&event));
        }
    }

    async fn apply_translation_locally(&self, translation: &CaptionTranslation) -> Option<CaptionEvent> {
        let mut history = self.history.lock().await;
        let event = history.iter_mut().find(|e| e.id == translation.caption_id)?;
        event.translated_text = Some(translation.translated_text.clone());
        event.target_language = Some(translation.target_language.clone());
        Some(event.clone())
    }

    /// Handle a message that arrived on some peer's caption channel.
    pub async fn handle_channel_message(&self, from: &str, message: CaptionChannelMessage) {
        match message {
            CaptionChannelMessage::Caption(mut event) => {
                event.source = CaptionSource::Remote;
                if !self.append(event.clone()).await {
                    return;
                }
                self.persist(&event).await;
            }
            CaptionChannelMessage::Translation(translation) => {
                if let Some(event) = self.apply_translation_locally(&translation).await {
                    self.sinks.emit_live_chunk(LiveTranscriptChunk::from(&event));
                } else {
                    tracing::debug!(from = %from, caption = %translation.caption_id, "Translation for unknown caption");
                }
            }
            CaptionChannelMessage::History { events } => {
                // Late-join replay from a peer: merge by id, persist only
                // what we had not seen.
                for mut event in events {
                    event.source = CaptionSource::Remote;
                    if self.append(event.clone()).await {
                        self.persist(&event).await;
                    }
                }
            }
        }
    }

    /// Replay recent history to a caption channel that just opened. At most
    /// [`CAPTION_REPLAY_LIMIT`] events, in non-decreasing timestamp order,
    /// sent once as a single history message.
    pub async fn replay_to(&self, remote: &str, channel: &Arc<dyn SignalChannel>) {
        let mut events: Vec<CaptionEvent> = {
            let history = self.history.lock().await;
            let skip = history.len().saturating_sub(CAPTION_REPLAY_LIMIT);
            history.iter().skip(skip).cloned().collect()
        };
        if events.is_empty() {
            return;
        }
        // History holds arrival order; remote events carry their senders'
        // clocks, so a late delivery can land behind a newer stamp.
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        let count = events.len();
        let message = CaptionChannelMessage::History { events };
        match serde_json::to_vec(&message) {
            Ok(bytes) => {
                if let Err(e) = channel.send(&bytes).await {
                    tracing::warn!(remote = %remote, error = %e, "Caption history replay failed");
                } else {
                    tracing::debug!(remote = %remote, count, "Replayed caption history");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode caption history"),
        }
    }

    /// Drop all history. Part of teardown.
    pub async fn clear(&self) {
        self.history.lock().await.clear();
    }
}
