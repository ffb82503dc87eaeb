use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawDetection;
use crate::detect::tracker::IouTracker;

/// Score and overlap thresholds handed to the engine on every call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub confidence: f32,
    pub iou: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            iou: 0.45,
        }
    }
}

/// Detection + tracking engine.
///
/// Engines are shared by every session in the process, so `track` takes
/// `&self` and per-stream identity lives in the caller-owned `IouTracker`.
pub trait InferenceEngine: Send + Sync {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Load weights and allocate whatever inference needs. Called at most once.
    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Detect objects in one RGB frame and attach track identities.
    fn track(
        &self,
        image: &RgbImage,
        tracks: &mut IouTracker,
        thresholds: &Thresholds,
    ) -> Result<Vec<RawDetection>>;
}
