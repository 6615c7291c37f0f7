//! Local capture seam — camera/mic and display acquisition.

use async_trait::async_trait;
use conclave_common::error::CallResult;
use conclave_common::media::MediaStream;
use conclave_common::session::CallKind;

/// Provider of local capture streams. Failures map to
/// [`conclave_common::error::CallError::MediaAcquisition`], which is fatal
/// to call creation (camera/mic) or aborts the share (display).
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the camera/mic stream. Voice calls get audio only.
    async fn user_media(&self, kind: CallKind) -> CallResult<MediaStream>;

    /// Acquire a screen-capture stream. The returned video track's `ended`
    /// transition is how the platform reports the native "stop sharing"
    /// affordance.
    async fn display_media(&self) -> CallResult<MediaStream>;
}
