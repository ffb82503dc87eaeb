//! Best-effort delivery of detection events to the downstream consumer.

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

use crate::detect::Detection;
use crate::error::PipelineError;
use crate::geometry::Polygon;
use crate::CameraId;

pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub camera_id: CameraId,
    /// Epoch seconds of the frame capture.
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub roi_polygon: Option<Polygon>,
}

impl DetectionEvent {
    pub fn new(
        camera_id: CameraId,
        captured_at: DateTime<Utc>,
        detections: Vec<Detection>,
        roi_polygon: Option<Polygon>,
    ) -> Self {
        Self {
            camera_id,
            timestamp: epoch_seconds(captured_at),
            detections,
            roi_polygon,
        }
    }
}

pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

pub trait Forwarder: Send + Sync {
    fn forward(&self, event: DetectionEvent) -> Result<(), PipelineError>;
}

/// `POST {base}/api/detection` with a short timeout.
pub struct HttpForwarder {
    url: String,
    agent: ureq::Agent,
}

impl HttpForwarder {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            url: format!("{}/api/detection", base_url.trim_end_matches('/')),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Forwarder for HttpForwarder {
    fn forward(&self, event: DetectionEvent) -> Result<(), PipelineError> {
        let count = event.detections.len();
        self.agent
            .post(&self.url)
            .send_json(&event)
            .map_err(|e| PipelineError::DownstreamForwardFailed(e.to_string()))?;
        debug!(
            "forwarded {} detections for camera {}",
            count, event.camera_id
        );
        Ok(())
    }
}

/// Runs a forwarder on a background thread behind a bounded queue, so a
/// slow consumer never stalls a session. A full queue drops the event.
pub struct ForwardQueue {
    tx: Option<SyncSender<DetectionEvent>>,
    join: Option<JoinHandle<()>>,
}

impl ForwardQueue {
    pub fn spawn(inner: Box<dyn Forwarder>, capacity: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let join = thread::Builder::new()
            .name("detection-forward".into())
            .spawn(move || drain(inner, rx))
            .context("spawn forward thread")?;
        Ok(Self {
            tx: Some(tx),
            join: Some(join),
        })
    }
}

fn drain(inner: Box<dyn Forwarder>, rx: Receiver<DetectionEvent>) {
    for event in rx {
        let camera_id = event.camera_id;
        if let Err(err) = inner.forward(event) {
            warn!("camera {}: {}", camera_id, err);
        }
    }
}

impl Forwarder for ForwardQueue {
    fn forward(&self, event: DetectionEvent) -> Result<(), PipelineError> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(PipelineError::DownstreamForwardFailed(
                "forward queue closed".into(),
            ));
        };
        tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => {
                PipelineError::DownstreamForwardFailed("forward queue full".into())
            }
            TrySendError::Disconnected(_) => {
                PipelineError::DownstreamForwardFailed("forward worker stopped".into())
            }
        })
    }
}

impl Drop for ForwardQueue {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
