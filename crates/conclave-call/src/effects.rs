//! Media effects bridge — swap raw streams for processed ones without
//! disturbing active senders or receivers.
//!
//! When an effects configuration is active the raw capture is never sent:
//! the bridge derives a processed stream and keeps every outgoing sender
//! pointed at the processed tracks via slot replacement (never
//! remove+re-add, which would renegotiate). Incoming streams get the same
//! substitution per remote participant, independently configurable. Pipeline
//! failures are non-fatal: the bridge logs a warning and falls back to the
//! raw stream.

use crate::peer::{PeerManager, TrackSlot};
use async_trait::async_trait;
use conclave_common::error::{CallError, CallResult};
use conclave_common::media::MediaStream;
use conclave_common::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An effects configuration. Opaque to the call core; deep clone is just
/// `clone()` since it is plain JSON.
pub type EffectsConfig = serde_json::Value;

/// A running effects pipeline for one stream.
pub trait EffectsRig: Send + Sync {
    /// The processed stream derived from the input.
    fn stream(&self) -> MediaStream;
    /// Release pipeline resources. Idempotent.
    fn dispose(&self);
}

/// The video-effects processing collaborator.
#[async_trait]
pub trait EffectsFactory: Send + Sync {
    async fn create(
        &self,
        input: &MediaStream,
        config: &EffectsConfig,
    ) -> CallResult<Box<dyn EffectsRig>>;

    /// Baseline configuration applied when the embedder supplies none but
    /// effects are requested.
    fn default_config(&self) -> EffectsConfig;
}

struct LocalPipeline {
    raw: MediaStream,
    rig: Option<Box<dyn EffectsRig>>,
    config: Option<EffectsConfig>,
}

/// Owns the local and per-remote effects pipelines for one call.
pub struct MediaEffectsBridge {
    factory: Arc<dyn EffectsFactory>,
    peers: Arc<PeerManager>,
    local: Mutex<Option<LocalPipeline>>,
    remote: Mutex<HashMap<UserId, Box<dyn EffectsRig>>>,
}

impl MediaEffectsBridge {
    pub fn new(factory: Arc<dyn EffectsFactory>, peers: Arc<PeerManager>) -> Self {
        Self {
            factory,
            peers,
            local: Mutex::new(None),
            remote: Mutex::new(HashMap::new()),
        }
    }

    /// An empty object means "effects on, factory defaults"; anything else
    /// is taken verbatim.
    fn effective_config(&self, config: &EffectsConfig) -> EffectsConfig {
        if config.as_object().is_some_and(|o| o.is_empty()) {
            self.factory.default_config()
        } else {
            config.clone()
        }
    }

    /// Install the raw local capture and derive the outgoing stream. With no
    /// config the raw stream goes out untouched; with one, the processed
    /// stream does — unless the pipeline fails, in which case the raw stream
    /// is the documented fallback.
    pub async fn install_local(
        &self,
        raw: MediaStream,
        config: Option<EffectsConfig>,
    ) -> MediaStream {
        let rig = match &config {
            Some(cfg) => match self.factory.create(&raw, &self.effective_config(cfg)).await {
                Ok(rig) => Some(rig),
                Err(e) => {
                    tracing::warn!(error = %e, "Effects pipeline failed, sending raw stream");
                    None
                }
            },
            None => None,
        };
        let outgoing = rig.as_ref().map(|r| r.stream()).unwrap_or_else(|| raw.clone());
        *self.local.lock().await = Some(LocalPipeline { raw, rig, config });
        outgoing
    }

    /// Re-derive the outgoing stream for a new configuration and point every
    /// sender at the new tracks. `None` drops back to the raw stream.
    pub async fn set_local_config(&self, config: Option<EffectsConfig>) -> CallResult<()> {
        let outgoing = {
            let mut guard = self.local.lock().await;
            let pipeline = guard.as_mut().ok_or_else(|| CallError::EffectsPipeline {
                message: "no local stream installed".into(),
            })?;

            if let Some(old) = pipeline.rig.take() {
                old.dispose();
            }
            pipeline.config = config.clone();
            pipeline.rig = match &config {
                Some(cfg) => match self.factory.create(&pipeline.raw, &self.effective_config(cfg)).await {
                    Ok(rig) => Some(rig),
                    Err(e) => {
                        tracing::warn!(error = %e, "Effects pipeline failed, sending raw stream");
                        None
                    }
                },
                None => None,
            };
            pipeline
                .rig
                .as_ref()
                .map(|r| r.stream())
                .unwrap_or_else(|| pipeline.raw.clone())
        };

        self.retarget_senders(&outgoing).await;
        Ok(())
    }

    async fn retarget_senders(&self, outgoing: &MediaStream) {
        self.peers
            .set_outgoing_track(TrackSlot::Audio, outgoing.audio_track().cloned())
            .await;
        self.peers
            .set_outgoing_track(TrackSlot::Video, outgoing.video_track().cloned())
            .await;
    }

    /// The stream currently going out to peers.
    pub async fn outgoing_stream(&self) -> Option<MediaStream> {
        let guard = self.local.lock().await;
        guard
            .as_ref()
            .map(|p| p.rig.as_ref().map(|r| r.stream()).unwrap_or_else(|| p.raw.clone()))
    }

    pub async fn raw_stream(&self) -> Option<MediaStream> {
        self.local.lock().await.as_ref().map(|p| p.raw.clone())
    }

    /// Keep the raw and processed audio enabled flags in lockstep (the mute
    /// toggle flips both so the pipeline cannot leak un-muted audio).
    pub async fn set_audio_enabled(&self, enabled: bool) {
        let guard = self.local.lock().await;
        if let Some(p) = guard.as_ref() {
            if let Some(t) = p.raw.audio_track() {
                t.set_enabled(enabled);
            }
            if let Some(rig) = &p.rig {
                if let Some(t) = rig.stream().audio_track() {
                    t.set_enabled(enabled);
                }
            }
        }
    }

    /// Same lockstep for video.
    pub async fn set_video_enabled(&self, enabled: bool) {
        let guard = self.local.lock().await;
        if let Some(p) = guard.as_ref() {
            if let Some(t) = p.raw.video_track() {
                t.set_enabled(enabled);
            }
            if let Some(rig) = &p.rig {
                if let Some(t) = rig.stream().video_track() {
                    t.set_enabled(enabled);
                }
            }
        }
    }

    /// Process an incoming remote stream for display. Per-remote pipelines
    /// are independent; failures fall back to the unprocessed stream.
    pub async fn process_incoming(
        &self,
        remote: &UserId,
        stream: MediaStream,
        config: Option<&EffectsConfig>,
    ) -> MediaStream {
        let Some(cfg) = config else {
            return stream;
        };
        match self.factory.create(&stream, &self.effective_config(cfg)).await {
            Ok(rig) => {
                let processed = rig.stream();
                if let Some(old) = self.remote.lock().await.insert(remote.clone(), rig) {
                    old.dispose();
                }
                processed
            }
            Err(e) => {
                tracing::warn!(remote = %remote, error = %e, "Incoming effects failed, showing raw stream");
                stream
            }
        }
    }

    pub async fn dispose_remote(&self, remote: &str) {
        if let Some(rig) = self.remote.lock().await.remove(remote) {
            rig.dispose();
        }
    }

    /// Dispose every pipeline and stop the raw capture. Part of teardown.
    pub async fn dispose_all(&self) {
        if let Some(pipeline) = self.local.lock().await.take() {
            if let Some(rig) = pipeline.rig {
                rig.dispose();
            }
            pipeline.raw.stop();
        }
        for (_, rig) in self.remote.lock().await.drain() {
            rig.dispose();
        }
    }
}
