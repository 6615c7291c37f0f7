//! Caption events — live transcription chunks relayed over a dedicated data
//! channel, with bounded history replayed to late joiners.

use crate::{SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum caption events kept in memory per call.
pub const CAPTION_HISTORY_LIMIT: usize = 100;

/// How many buffered events a newly opened caption channel receives.
pub const CAPTION_REPLAY_LIMIT: usize = 50;

/// Where a caption entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptionSource {
    Local,
    Remote,
}

/// One transcription chunk, final or interim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionEvent {
    /// Globally unique per call: `session:timestamp:random` unless the
    /// caller supplies its own.
    pub id: String,
    pub call_id: SessionId,
    pub sender: UserId,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_language: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Interim chunks may be replaced by a later final chunk with the same id.
    #[serde(rename = "final")]
    pub final_: bool,
    pub source: CaptionSource,
}

impl CaptionEvent {
    pub fn new(call_id: impl Into<SessionId>, sender: impl Into<UserId>, text: impl Into<String>) -> Self {
        let call_id = call_id.into();
        let timestamp = Utc::now();
        Self {
            id: Self::generate_id(&call_id, timestamp),
            call_id,
            sender: sender.into(),
            text: text.into(),
            language: None,
            translated_text: None,
            target_language: None,
            timestamp,
            final_: true,
            source: CaptionSource::Local,
        }
    }

    fn generate_id(call_id: &str, timestamp: DateTime<Utc>) -> String {
        use rand::Rng;
        let suffix: u32 = rand::rng().random();
        format!("{call_id}:{}:{suffix:08x}", timestamp.timestamp_millis())
    }
}

/// A sparse update attaching a translation to an already-relayed caption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionTranslation {
    pub caption_id: String,
    pub translated_text: String,
    pub target_language: String,
}

/// Messages traveling the caption data channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum CaptionChannelMessage {
    #[serde(rename = "call.caption")]
    Caption(CaptionEvent),
    #[serde(rename = "call.caption_translation")]
    Translation(CaptionTranslation),
    /// Replay of buffered events for a channel that just opened.
    #[serde(rename = "call.caption_history")]
    History { events: Vec<CaptionEvent> },
}

/// Normalized chunk handed to local consumers (live transcript view).
#[derive(Debug, Clone, Serialize)]
pub struct LiveTranscriptChunk {
    pub caption_id: String,
    pub call_id: SessionId,
    pub sender: UserId,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "final")]
    pub final_: bool,
}

impl From<&CaptionEvent> for LiveTranscriptChunk {
    fn from(ev: &CaptionEvent) -> Self {
        Self {
            caption_id: ev.id.clone(),
            call_id: ev.call_id.clone(),
            sender: ev.sender.clone(),
            text: ev.translated_text.clone().unwrap_or_else(|| ev.text.clone()),
            language: ev.target_language.clone().or_else(|| ev.language.clone()),
            timestamp: ev.timestamp,
            final_: ev.final_,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_unique_and_prefixed() {
        let a = CaptionEvent::new("s1", "@alice:x", "hello");
        let b = CaptionEvent::new("s1", "@alice:x", "hello");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("s1:"));
    }

    #[test]
    fn test_channel_message_tags() {
        let ev = CaptionEvent::new("s1", "@alice:x", "hi");
        let json = serde_json::to_value(CaptionChannelMessage::Caption(ev)).unwrap();
        assert_eq!(json["type"], "call.caption");

        let json = serde_json::to_value(CaptionChannelMessage::History { events: vec![] }).unwrap();
        assert_eq!(json["type"], "call.caption_history");
    }

    #[test]
    fn test_chunk_prefers_translation() {
        let mut ev = CaptionEvent::new("s1", "@bob:x", "bonjour");
        ev.translated_text = Some("hello".into());
        ev.target_language = Some("en".into());
        let chunk = LiveTranscriptChunk::from(&ev);
        assert_eq!(chunk.text, "hello");
        assert_eq!(chunk.language.as_deref(), Some("en"));
    }
}
