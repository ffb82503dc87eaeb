use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{info, warn};

use crate::detect::backend::{InferenceEngine, Thresholds};
use crate::detect::result::Detection;
use crate::detect::tracker::IouTracker;
use crate::error::PipelineError;
use crate::frame::Frame;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
    /// Sticky: the engine is never re-initialized after a failure.
    Failed(String),
}

/// Process-wide wrapper around the inference engine.
///
/// The first call to `ensure_ready` initializes the engine while holding the
/// state lock, so concurrent sessions wait for one initialization instead of
/// racing their own.
pub struct DetectionAdapter {
    engine: Arc<dyn InferenceEngine>,
    thresholds: Thresholds,
    state: Mutex<EngineState>,
}

impl DetectionAdapter {
    pub fn new(engine: Arc<dyn InferenceEngine>, thresholds: Thresholds) -> Self {
        Self {
            engine,
            thresholds,
            state: Mutex::new(EngineState::Uninitialized),
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn state(&self) -> EngineState {
        match self.state.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn ensure_ready(&self) -> std::result::Result<(), PipelineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| PipelineError::EngineNotReady("engine state lock poisoned".into()))?;
        match &*state {
            EngineState::Ready => Ok(()),
            EngineState::Failed(reason) => Err(PipelineError::EngineNotReady(reason.clone())),
            EngineState::Uninitialized => match self.engine.initialize() {
                Ok(()) => {
                    info!("inference engine {} ready", self.engine.name());
                    *state = EngineState::Ready;
                    Ok(())
                }
                Err(err) => {
                    let reason = format!("{:#}", err);
                    warn!(
                        "inference engine {} failed to initialize: {}",
                        self.engine.name(),
                        reason
                    );
                    *state = EngineState::Failed(reason.clone());
                    Err(PipelineError::EngineNotReady(reason))
                }
            },
        }
    }

    /// Run detection on one frame, keeping only `target_labels`.
    ///
    /// An engine that cannot start surfaces `PipelineError::EngineNotReady`
    /// inside the returned error; callers downcast to decide fatality.
    pub fn infer(
        &self,
        frame: &Frame,
        target_labels: &HashSet<String>,
        tracks: &mut IouTracker,
    ) -> Result<Vec<Detection>> {
        self.ensure_ready()?;
        let raw = self.engine.track(frame.image(), tracks, &self.thresholds)?;
        Ok(raw
            .into_iter()
            .filter(|det| target_labels.contains(&det.label))
            .map(Detection::from)
            .collect())
    }
}
