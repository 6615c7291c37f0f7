//! Centralized error types for Conclave.
//!
//! Uses `thiserror` for ergonomic error definitions. The taxonomy follows
//! how each failure is handled at the call layer: media acquisition is fatal
//! to call creation, signaling failures are surfaced but not retried,
//! negotiation failures leave recovery to ICE restart, and effects-pipeline
//! failures fall back to the raw stream.

/// Core error type used across the Conclave crates.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// Local capture device or permission failure. Fatal to call creation.
    #[error("Media acquisition failed: {message}")]
    MediaAcquisition { message: String },

    /// Transport send failure for a signal or control message. Logged and
    /// surfaced; never retried automatically — the periodic durable state
    /// sync is the reconciliation path.
    #[error("Signaling failed: {message}")]
    Signaling { message: String },

    /// Offer/answer/candidate application failure on a peer connection.
    /// The connection is left to reach `failed`, which triggers ICE restart.
    #[error("Negotiation with {remote} failed: {message}")]
    Negotiation { remote: String, message: String },

    /// Video-effects pipeline failure. Non-fatal: the bridge falls back to
    /// the unprocessed stream.
    #[error("Effects pipeline error: {message}")]
    EffectsPipeline { message: String },

    /// Operation rejected by call rules (e.g. demoting a host).
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Referenced participant is not in the registry.
    #[error("Unknown participant: {user_id}")]
    UnknownParticipant { user_id: String },

    /// Invalid caller-supplied input (e.g. a malformed co-watch URL).
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// The coordinator has already been torn down.
    #[error("Call already disposed")]
    Disposed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CallError {
    /// Stable code string for programmatic handling by embedders.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MediaAcquisition { .. } => "MEDIA_ACQUISITION",
            Self::Signaling { .. } => "SIGNALING",
            Self::Negotiation { .. } => "NEGOTIATION",
            Self::EffectsPipeline { .. } => "EFFECTS_PIPELINE",
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::UnknownParticipant { .. } => "UNKNOWN_PARTICIPANT",
            Self::Validation { .. } => "VALIDATION",
            Self::Disposed => "DISPOSED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether this error ends the call (vs. degrading one participant or
    /// one subsystem).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MediaAcquisition { .. } | Self::Disposed)
    }
}

/// Convenience alias used across the call crates.
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        let err = CallError::Negotiation {
            remote: "@bob:example.org".into(),
            message: "bad sdp".into(),
        };
        assert_eq!(err.code(), "NEGOTIATION");
        assert!(!err.is_fatal());

        let err = CallError::MediaAcquisition {
            message: "permission denied".into(),
        };
        assert_eq!(err.code(), "MEDIA_ACQUISITION");
        assert!(err.is_fatal());
    }
}
