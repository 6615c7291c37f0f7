//! Lightweight media primitives.
//!
//! The coordinator never touches raw samples; capture, encoding, and
//! rendering live behind the collaborator traits in `conclave-call`. These
//! types model just what the call logic needs: track identity, kind, the
//! mutable `enabled` flag, and the one-shot `ended` transition a capture
//! backend fires when the user stops sharing from outside the app.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    ended_tx: watch::Sender<bool>,
}

/// A single audio or video track. Clones share state, like handles to one
/// underlying capture track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        let (ended_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                enabled: AtomicBool::new(true),
                ended_tx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended_tx.borrow()
    }

    /// Stop the track. Fired by capture backends when the source goes away
    /// (e.g. the browser-style "stop sharing" affordance) and by teardown.
    pub fn end(&self) {
        self.inner.ended_tx.send_replace(true);
    }

    /// Resolves once the track ends. Used by the screen-share manager to
    /// route a native stop into the same teardown as a manual toggle.
    pub async fn ended(&self) {
        let mut rx = self.inner.ended_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        // The sender lives in self, so changed() cannot error here.
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A bundle of tracks originating from one source (camera+mic, or a screen
/// capture). Clones share the underlying tracks.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            id: format!("{}:{}", label.into(), Uuid::new_v4()),
            tracks: Vec::new(),
        }
    }

    pub fn with_tracks(label: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        let mut s = Self::new(label);
        s.tracks = tracks;
        s
    }

    /// Standard camera+mic stream: one audio and one video track.
    pub fn camera() -> Self {
        Self::with_tracks(
            "camera",
            vec![MediaTrack::new(TrackKind::Audio), MediaTrack::new(TrackKind::Video)],
        )
    }

    /// Screen capture stream: video only.
    pub fn screen() -> Self {
        Self::with_tracks("screen", vec![MediaTrack::new(TrackKind::Video)])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track in the stream.
    pub fn stop(&self) {
        for t in &self.tracks {
            t.end();
        }
    }
}
