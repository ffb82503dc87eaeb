//! Pipeline error taxonomy.
//!
//! Plumbing code uses `anyhow::Result`. Errors that change what a session does
//! next are expressed as `PipelineError` so callers can branch on the
//! disposition instead of string matching.

use std::time::Duration;

use crate::CameraId;

/// What a session does when it hits an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Close the session and report the error to the consumer.
    SessionFatal,
    /// Sleep briefly and try again.
    Transient,
    /// Drop the current tick, keep streaming.
    SkipTick,
    /// Log and carry on.
    Ignored,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("stream lookup for camera {camera_id} is rate limited; retry in {}s", retry_after.as_secs())]
    RateLimited {
        camera_id: CameraId,
        retry_after: Duration,
    },

    #[error("upstream metadata unavailable for camera {camera_id}: {reason}")]
    UpstreamUnavailable { camera_id: CameraId, reason: String },

    #[error("inference engine not ready: {0}")]
    EngineNotReady(String),

    #[error("no frame available from source")]
    FrameUnavailable,

    #[error("downstream forward failed: {0}")]
    DownstreamForwardFailed(String),

    #[error("frame encoding failed: {0}")]
    EncodeFailed(String),
}

impl PipelineError {
    pub fn disposition(&self) -> Disposition {
        match self {
            PipelineError::RateLimited { .. }
            | PipelineError::UpstreamUnavailable { .. }
            | PipelineError::EngineNotReady(_) => Disposition::SessionFatal,
            PipelineError::FrameUnavailable => Disposition::Transient,
            PipelineError::EncodeFailed(_) => Disposition::SkipTick,
            PipelineError::DownstreamForwardFailed(_) => Disposition::Ignored,
        }
    }

    pub fn is_session_fatal(&self) -> bool {
        self.disposition() == Disposition::SessionFatal
    }

    /// HTTP status used when the error ends a request before streaming starts.
    pub fn http_status(&self) -> u16 {
        match self {
            PipelineError::RateLimited { .. } => 503,
            PipelineError::UpstreamUnavailable { .. } => 502,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_and_engine_failures_are_fatal() {
        let rate_limited = PipelineError::RateLimited {
            camera_id: 3,
            retry_after: Duration::from_secs(12),
        };
        assert!(rate_limited.is_session_fatal());
        assert_eq!(rate_limited.http_status(), 503);
        assert!(rate_limited.to_string().contains("retry in 12s"));

        let upstream = PipelineError::UpstreamUnavailable {
            camera_id: 3,
            reason: "timeout".into(),
        };
        assert!(upstream.is_session_fatal());
        assert_eq!(upstream.http_status(), 502);

        assert!(PipelineError::EngineNotReady("missing model".into()).is_session_fatal());
    }

    #[test]
    fn forward_and_frame_failures_do_not_end_the_session() {
        assert_eq!(
            PipelineError::DownstreamForwardFailed("refused".into()).disposition(),
            Disposition::Ignored
        );
        assert_eq!(
            PipelineError::FrameUnavailable.disposition(),
            Disposition::Transient
        );
        assert_eq!(
            PipelineError::EncodeFailed("bad buffer".into()).disposition(),
            Disposition::SkipTick
        );
    }
}
