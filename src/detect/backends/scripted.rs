use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::detect::backend::{InferenceEngine, Thresholds};
use crate::detect::result::RawDetection;
use crate::detect::tracker::IouTracker;

/// Deterministic engine that replays a queue of per-frame outputs.
///
/// Detections without an id are passed through the stream's tracker, the
/// same way a real engine would assign identities. With `cycle` set, the
/// script loops instead of running dry.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<Vec<RawDetection>>>,
    cycle: bool,
    assign_tracks: bool,
    init_error: Option<String>,
    init_calls: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cycling(mut self) -> Self {
        self.cycle = true;
        self
    }

    pub fn with_tracking(mut self) -> Self {
        self.assign_tracks = true;
        self
    }

    pub fn failing_init(mut self, reason: &str) -> Self {
        self.init_error = Some(reason.to_string());
        self
    }

    pub fn push_frame(&self, detections: Vec<RawDetection>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(detections);
        }
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn initialize(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(reason) => Err(anyhow!("{}", reason)),
            None => Ok(()),
        }
    }

    fn track(
        &self,
        _image: &RgbImage,
        tracks: &mut IouTracker,
        thresholds: &Thresholds,
    ) -> Result<Vec<RawDetection>> {
        let mut script = self
            .script
            .lock()
            .map_err(|_| anyhow!("scripted engine lock poisoned"))?;
        let Some(next) = script.pop_front() else {
            return Ok(Vec::new());
        };
        if self.cycle {
            script.push_back(next.clone());
        }
        drop(script);

        let mut detections: Vec<RawDetection> = next
            .into_iter()
            .filter(|d| d.confidence >= thresholds.confidence)
            .collect();
        if self.assign_tracks {
            let mut untracked: Vec<RawDetection> = Vec::new();
            let mut tracked: Vec<RawDetection> = Vec::new();
            for det in detections {
                if det.track_id.is_some() {
                    tracked.push(det);
                } else {
                    untracked.push(det);
                }
            }
            tracks.update(&mut untracked);
            tracked.extend(untracked);
            detections = tracked;
        }
        Ok(detections)
    }
}
