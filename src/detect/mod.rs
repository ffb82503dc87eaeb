mod adapter;
mod backend;
pub mod backends;
mod result;
mod tracker;

pub use adapter::{DetectionAdapter, EngineState};
pub use backend::{InferenceEngine, Thresholds};
pub use result::{BBox, Detection, RawDetection};
pub use tracker::IouTracker;
