//! Per-connection frame processing loop.
//!
//! A session resolves its camera, makes sure the engine is up, then pulls
//! frames until the consumer leaves or the server shuts down. Each processed
//! frame becomes one `TickOutput` handed to the output `Sink`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use crate::congestion::{CongestionAggregator, CongestionReport};
use crate::detect::{Detection, DetectionAdapter, IouTracker};
use crate::dedup::DirectionDedupState;
use crate::enhance::{enhance, EnhanceParams};
use crate::error::{Disposition, PipelineError};
use crate::forward::{DetectionEvent, Forwarder};
use crate::frame::{encode_jpeg, Frame, DEFAULT_JPEG_QUALITY};
use crate::ingest::{FrameSource, SourceOpener};
use crate::overlay::{render, FontCache};
use crate::resolver::{StreamEndpoint, StreamResolver};
use crate::roi::{ActiveRoi, AutoRoiState, RoiRegistry};
use crate::CameraId;

pub const DEFAULT_TARGET_FPS: u32 = 30;
pub const IDLE_SLEEP: Duration = Duration::from_millis(20);
pub const DISCONNECT_POLL: Duration = Duration::from_millis(250);
pub const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Default model classes kept for counting.
pub const DEFAULT_TARGET_LABELS: &[&str] = &["승용차", "버스", "트럭", "오토바이(자전거)", "분류없음"];

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// 0 processes every frame.
    pub target_fps: u32,
    pub jpeg_quality: u8,
    pub auto_roi: bool,
    pub target_labels: HashSet<String>,
    pub enhance: EnhanceParams,
    pub reopen_delay: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_fps: DEFAULT_TARGET_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            auto_roi: true,
            target_labels: DEFAULT_TARGET_LABELS.iter().map(|s| s.to_string()).collect(),
            enhance: EnhanceParams::default(),
            reopen_delay: DEFAULT_REOPEN_DELAY,
        }
    }
}

impl PipelineSettings {
    fn frame_interval(&self) -> Option<Duration> {
        (self.target_fps > 0).then(|| Duration::from_secs_f64(1.0 / self.target_fps as f64))
    }
}

/// Everything sessions share. Built once by the daemon.
#[derive(Clone)]
pub struct PipelineContext {
    pub resolver: Arc<StreamResolver>,
    pub opener: Arc<dyn SourceOpener>,
    pub adapter: Arc<DetectionAdapter>,
    pub rois: Arc<RoiRegistry>,
    pub aggregator: CongestionAggregator,
    pub forwarder: Option<Arc<dyn Forwarder>>,
    pub fonts: Arc<FontCache>,
    pub settings: PipelineSettings,
}

/// Result of one processed frame.
#[derive(Clone, Debug)]
pub struct TickOutput {
    pub camera_id: CameraId,
    pub timestamp: DateTime<Utc>,
    pub jpeg: Vec<u8>,
    pub detections: Vec<Detection>,
    pub report: CongestionReport,
    pub roi: ActiveRoi,
}

/// Consumer side of a session.
pub trait Sink {
    /// Called once the camera resolved and the engine is ready.
    fn open(&mut self) -> Result<()>;

    /// Deliver one tick. An error means the consumer is gone.
    fn emit(&mut self, tick: &TickOutput) -> Result<()>;

    /// Non-blocking check for a consumer disconnect.
    fn poll_closed(&mut self) -> bool;

    /// Report a fatal error before the session closes.
    fn fail(&mut self, err: &PipelineError);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Resolving,
    Streaming,
    Draining,
    Closed,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_pulled: u64,
    pub frames_throttled: u64,
    pub ticks_emitted: u64,
    pub ticks_skipped: u64,
    pub source_reopens: u64,
}

pub struct Session {
    camera_id: CameraId,
    ctx: Arc<PipelineContext>,
    shutdown: Arc<AtomicBool>,
    state: SessionState,
    endpoint: Option<StreamEndpoint>,
    source: Option<Box<dyn FrameSource>>,
    dedup: DirectionDedupState,
    tracks: IouTracker,
    auto_roi: AutoRoiState,
    last_processed: Option<Instant>,
    last_poll: Option<Instant>,
    last_health_log: Instant,
    stats: SessionStats,
}

impl Session {
    pub fn new(camera_id: CameraId, ctx: Arc<PipelineContext>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            camera_id,
            ctx,
            shutdown,
            state: SessionState::Resolving,
            endpoint: None,
            source: None,
            dedup: DirectionDedupState::new(camera_id),
            tracks: IouTracker::default(),
            auto_roi: AutoRoiState::default(),
            last_processed: None,
            last_poll: None,
            last_health_log: Instant::now(),
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn dedup(&self) -> &DirectionDedupState {
        &self.dedup
    }

    /// Resolve the camera and bring the engine up.
    pub fn prepare(&mut self) -> std::result::Result<(), PipelineError> {
        self.state = SessionState::Resolving;
        let result = self
            .ctx
            .resolver
            .resolve(self.camera_id)
            .and_then(|endpoint| {
                self.ctx.adapter.ensure_ready()?;
                Ok(endpoint)
            });
        match result {
            Ok(endpoint) => {
                info!(
                    "session for camera {} streaming from {}",
                    self.camera_id, endpoint.address
                );
                self.endpoint = Some(endpoint);
                self.state = SessionState::Streaming;
                Ok(())
            }
            Err(err) => {
                warn!("session for camera {} failed to start: {}", self.camera_id, err);
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    /// Drive the session to completion. Returns the fatal error, if any,
    /// after it was reported to the sink.
    pub fn run(&mut self, sink: &mut dyn Sink) -> std::result::Result<SessionStats, PipelineError> {
        if let Err(err) = self.prepare() {
            sink.fail(&err);
            return Err(err);
        }
        if let Err(err) = sink.open() {
            warn!("camera {}: consumer rejected stream: {:#}", self.camera_id, err);
            self.close();
            return Ok(self.stats.clone());
        }

        let outcome = self.stream(sink);
        self.state = SessionState::Draining;
        if let Err(err) = &outcome {
            sink.fail(err);
        }
        self.close();
        info!(
            "session for camera {} closed: {} ticks, {} throttled, {} reopens",
            self.camera_id,
            self.stats.ticks_emitted,
            self.stats.frames_throttled,
            self.stats.source_reopens
        );
        outcome.map(|_| self.stats.clone())
    }

    fn stream(&mut self, sink: &mut dyn Sink) -> std::result::Result<(), PipelineError> {
        loop {
            if self.should_stop(sink) {
                return Ok(());
            }
            self.log_health();

            if self.source.is_none() {
                match self.open_source() {
                    Ok(source) => self.source = Some(source),
                    Err(err) => {
                        if let Some(pipeline) = err.downcast_ref::<PipelineError>() {
                            if pipeline.is_session_fatal() {
                                return Err(pipeline.clone());
                            }
                        }
                        warn!("camera {}: source open failed: {:#}", self.camera_id, err);
                        self.pause(self.ctx.settings.reopen_delay, sink);
                        continue;
                    }
                }
            }

            let pulled = match self.source.as_mut() {
                Some(source) => source.next_frame(),
                None => continue,
            };
            let frame = match pulled {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    self.pause(IDLE_SLEEP, sink);
                    continue;
                }
                Err(err) => {
                    warn!(
                        "camera {}: {} ({:#}); reopening",
                        self.camera_id,
                        PipelineError::FrameUnavailable,
                        err
                    );
                    self.source = None;
                    self.stats.source_reopens += 1;
                    self.pause(self.ctx.settings.reopen_delay, sink);
                    continue;
                }
            };
            self.stats.frames_pulled += 1;

            let now = Instant::now();
            if let (Some(interval), Some(last)) =
                (self.ctx.settings.frame_interval(), self.last_processed)
            {
                if now.duration_since(last) < interval {
                    self.stats.frames_throttled += 1;
                    continue;
                }
            }
            self.last_processed = Some(now);

            let tick = match self.process_frame(&frame) {
                Ok(tick) => tick,
                Err(err) => match err.downcast_ref::<PipelineError>() {
                    Some(pipeline) if pipeline.is_session_fatal() => {
                        return Err(pipeline.clone());
                    }
                    Some(pipeline) if pipeline.disposition() == Disposition::SkipTick => {
                        debug!("camera {}: tick skipped: {}", self.camera_id, pipeline);
                        self.stats.ticks_skipped += 1;
                        continue;
                    }
                    _ => {
                        warn!("camera {}: tick failed: {:#}", self.camera_id, err);
                        self.stats.ticks_skipped += 1;
                        continue;
                    }
                },
            };

            if let Err(err) = sink.emit(&tick) {
                info!("camera {}: consumer went away: {:#}", self.camera_id, err);
                return Ok(());
            }
            self.stats.ticks_emitted += 1;
            self.forward(&tick);
        }
    }

    fn open_source(&mut self) -> Result<Box<dyn FrameSource>> {
        // Re-resolve on every (re)open; the resolver cache makes this free
        // until the upstream address expires.
        let endpoint = self.ctx.resolver.resolve(self.camera_id)?;
        let source = self.ctx.opener.open(&endpoint.address)?;
        self.endpoint = Some(endpoint);
        Ok(source)
    }

    fn should_stop(&mut self, sink: &mut dyn Sink) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let due = self
            .last_poll
            .map_or(true, |last| last.elapsed() >= DISCONNECT_POLL);
        if due {
            self.last_poll = Some(Instant::now());
            if sink.poll_closed() {
                return true;
            }
        }
        false
    }

    /// Sleep without going deaf to disconnects or shutdown.
    fn pause(&mut self, total: Duration, sink: &mut dyn Sink) {
        let deadline = Instant::now() + total;
        loop {
            let now = Instant::now();
            if now >= deadline || self.should_stop(sink) {
                return;
            }
            thread::sleep((deadline - now).min(DISCONNECT_POLL));
        }
    }

    fn log_health(&mut self) {
        if self.last_health_log.elapsed() < HEALTH_LOG_INTERVAL {
            return;
        }
        self.last_health_log = Instant::now();
        match &self.source {
            Some(source) => {
                let stats = source.stats();
                info!(
                    "camera {} source {}: healthy={} frames={} ticks={}",
                    self.camera_id,
                    stats.source,
                    source.is_healthy(),
                    stats.frames_captured,
                    self.stats.ticks_emitted
                );
            }
            None => info!("camera {}: no source open", self.camera_id),
        }
    }

    fn active_roi(&mut self, frame: &Frame) -> Result<ActiveRoi> {
        if let Some(config) = self.ctx.rois.get(self.camera_id)? {
            return Ok(ActiveRoi::Stored(config));
        }
        if !self.ctx.settings.auto_roi {
            return Ok(ActiveRoi::None);
        }
        Ok(match self.auto_roi.resolve(frame.image(), Instant::now()) {
            Some(poly) => ActiveRoi::Auto(poly.clone()),
            None => ActiveRoi::None,
        })
    }

    /// Run one frame through enhancement, detection, ROI, dedup,
    /// aggregation, overlay and encoding.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<TickOutput> {
        let settings = &self.ctx.settings;
        let enhanced = frame.with_image(enhance(frame.image(), &settings.enhance));
        let detections =
            self.ctx
                .adapter
                .infer(&enhanced, &settings.target_labels, &mut self.tracks)?;

        let roi = self.active_roi(frame)?;
        let detections = self.dedup.filter(roi.apply(detections));
        let report = self.ctx.aggregator.summarize(&detections);
        if !detections.is_empty() {
            debug!(
                "camera {} frame {}: {} detections, congestion {}",
                self.camera_id,
                frame.seq,
                detections.len(),
                report.congestion_index
            );
        }

        let annotated = render(
            frame.image(),
            &detections,
            &roi,
            &report,
            self.ctx.fonts.font(),
        );
        let jpeg = encode_jpeg(&annotated, self.ctx.settings.jpeg_quality)?;
        Ok(TickOutput {
            camera_id: self.camera_id,
            timestamp: frame.captured_at,
            jpeg,
            detections,
            report,
            roi,
        })
    }

    fn forward(&self, tick: &TickOutput) {
        let Some(forwarder) = &self.ctx.forwarder else {
            return;
        };
        if tick.detections.is_empty() {
            return;
        }
        let event = DetectionEvent::new(
            self.camera_id,
            tick.timestamp,
            tick.detections.clone(),
            tick.roi.primary_polygon().cloned(),
        );
        if let Err(err) = forwarder.forward(event) {
            warn!("camera {}: {}", self.camera_id, err);
        }
    }

    /// Resolve, open the source and process the first available frame.
    pub fn snapshot(&mut self, timeout: Duration) -> Result<TickOutput> {
        self.prepare()?;
        let result = self.first_tick(timeout);
        self.close();
        result
    }

    fn first_tick(&mut self, timeout: Duration) -> Result<TickOutput> {
        let mut source = self.open_source()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = source.next_frame()? {
                return self.process_frame(&frame);
            }
            if Instant::now() >= deadline || self.shutdown.load(Ordering::SeqCst) {
                return Err(anyhow!("no frame from stream"));
            }
            thread::sleep(IDLE_SLEEP);
        }
    }

    /// Release the source and forget per-session state.
    pub fn close(&mut self) {
        self.source = None;
        self.dedup.reset();
        self.tracks.reset();
        self.auto_roi.reset();
        self.last_processed = None;
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::ScriptedEngine;
    use crate::detect::{BBox, RawDetection, Thresholds};
    use crate::geometry::{Direction, Polygon};
    use crate::ingest::{DefaultSourceOpener, SourceStats};
    use crate::resolver::{FetchError, MetadataClient, StaticMetadataClient, StreamEnvelope};
    use crate::roi::RoiConfig;
    use std::sync::Mutex;

    const STUB: &str = "stub://cam{id}?width=64&height=48&fps=0";

    struct BlankSource {
        seq: u64,
    }

    impl FrameSource for BlankSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.seq += 1;
            Ok(Some(Frame::blank(64, 48, self.seq)))
        }
        fn is_healthy(&self) -> bool {
            true
        }
        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.seq,
                source: "blank".into(),
            }
        }
    }

    struct BlankOpener;

    impl SourceOpener for BlankOpener {
        fn open(&self, _address: &str) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(BlankSource { seq: 0 }))
        }
    }

    /// Holds an `Rc`, like decoder contexts that must stay on one thread.
    struct ThreadBoundSource {
        seq: std::rc::Rc<std::cell::Cell<u64>>,
    }

    impl FrameSource for ThreadBoundSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            self.seq.set(self.seq.get() + 1);
            Ok(Some(Frame::blank(64, 48, self.seq.get())))
        }
        fn is_healthy(&self) -> bool {
            true
        }
        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.seq.get(),
                source: "thread-bound".into(),
            }
        }
    }

    struct ThreadBoundOpener;

    impl SourceOpener for ThreadBoundOpener {
        fn open(&self, _address: &str) -> Result<Box<dyn FrameSource>> {
            Ok(Box::new(ThreadBoundSource {
                seq: std::rc::Rc::new(std::cell::Cell::new(0)),
            }))
        }
    }

    struct RateLimitedClient;

    impl MetadataClient for RateLimitedClient {
        fn fetch(&self, _camera_id: CameraId) -> std::result::Result<StreamEnvelope, FetchError> {
            Err(FetchError::TooManyRequests)
        }
    }

    #[derive(Default)]
    struct RecordingForwarder {
        events: Mutex<Vec<DetectionEvent>>,
    }

    impl Forwarder for RecordingForwarder {
        fn forward(&self, event: DetectionEvent) -> std::result::Result<(), PipelineError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RefusingForwarder {
        attempts: std::sync::atomic::AtomicUsize,
    }

    impl Forwarder for RefusingForwarder {
        fn forward(&self, _event: DetectionEvent) -> std::result::Result<(), PipelineError> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(PipelineError::DownstreamForwardFailed("connection refused".into()))
        }
    }

    struct CollectingSink {
        ticks: Vec<TickOutput>,
        stop_after: usize,
        opened: bool,
        failure: Option<PipelineError>,
    }

    impl CollectingSink {
        fn new(stop_after: usize) -> Self {
            Self {
                ticks: Vec::new(),
                stop_after,
                opened: false,
                failure: None,
            }
        }
    }

    impl Sink for CollectingSink {
        fn open(&mut self) -> Result<()> {
            self.opened = true;
            Ok(())
        }
        fn emit(&mut self, tick: &TickOutput) -> Result<()> {
            self.ticks.push(tick.clone());
            if self.ticks.len() >= self.stop_after {
                return Err(anyhow!("enough"));
            }
            Ok(())
        }
        fn poll_closed(&mut self) -> bool {
            false
        }
        fn fail(&mut self, err: &PipelineError) {
            self.failure = Some(err.clone());
        }
    }

    struct Harness {
        engine: Arc<ScriptedEngine>,
        rois: Arc<RoiRegistry>,
        forwarder: Arc<RecordingForwarder>,
        ctx: Arc<PipelineContext>,
    }

    fn harness_with(
        engine: ScriptedEngine,
        client: Arc<dyn MetadataClient>,
        opener: Arc<dyn SourceOpener>,
        settings: PipelineSettings,
    ) -> Harness {
        let engine = Arc::new(engine);
        let rois = Arc::new(RoiRegistry::in_memory());
        let forwarder = Arc::new(RecordingForwarder::default());
        let ctx = Arc::new(PipelineContext {
            resolver: Arc::new(StreamResolver::new(client)),
            opener,
            adapter: Arc::new(DetectionAdapter::new(engine.clone(), Thresholds::default())),
            rois: rois.clone(),
            aggregator: CongestionAggregator::default(),
            forwarder: Some(forwarder.clone()),
            fonts: Arc::new(FontCache::disabled()),
            settings,
        });
        Harness {
            engine,
            rois,
            forwarder,
            ctx,
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            target_fps: 0,
            auto_roi: true,
            target_labels: ["car", "bus"].iter().map(|s| s.to_string()).collect(),
            reopen_delay: Duration::from_millis(10),
            ..PipelineSettings::default()
        }
    }

    fn harness() -> Harness {
        harness_with(
            ScriptedEngine::new(),
            Arc::new(StaticMetadataClient::new(STUB)),
            Arc::new(BlankOpener),
            settings(),
        )
    }

    fn raw(track: Option<i64>, label: &str, cx: f32, cy: f32) -> RawDetection {
        RawDetection {
            label: label.into(),
            confidence: 0.9,
            bbox: BBox::new(cx - 2.0, cy - 2.0, cx + 2.0, cy + 2.0),
            track_id: track,
        }
    }

    fn left_half() -> Polygon {
        Polygon::from_pairs(&[[0.0, 0.0], [32.0, 0.0], [32.0, 48.0], [0.0, 48.0]]).unwrap()
    }

    fn session(h: &Harness, camera_id: CameraId) -> Session {
        Session::new(camera_id, h.ctx.clone(), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn no_roi_and_no_auto_roi_passes_everything() {
        let h = harness();
        h.engine
            .push_frame(vec![raw(Some(1), "car", 10.0, 10.0), raw(None, "bus", 50.0, 40.0)]);
        let mut s = session(&h, 1);
        let tick = s.process_frame(&Frame::blank(64, 48, 1)).unwrap();
        assert_eq!(tick.detections.len(), 2);
        assert!(tick.detections.iter().all(|d| d.direction.is_none()));
        assert_eq!(tick.roi, ActiveRoi::None);
        assert_eq!(&tick.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn upstream_zone_filters_and_tags() {
        let h = harness();
        h.rois
            .save(RoiConfig::new(2, Some(left_half()), None))
            .unwrap();
        h.engine
            .push_frame(vec![raw(Some(1), "car", 10.0, 10.0), raw(Some(2), "car", 50.0, 10.0)]);
        let mut s = session(&h, 2);
        let tick = s.process_frame(&Frame::blank(64, 48, 1)).unwrap();
        assert_eq!(tick.detections.len(), 1);
        assert_eq!(tick.detections[0].track_id, Some(1));
        assert_eq!(tick.detections[0].direction, Some(Direction::Up));
    }

    #[test]
    fn repeated_track_is_reported_once_per_direction() {
        let h = harness();
        h.rois
            .save(RoiConfig::new(3, Some(left_half()), None))
            .unwrap();
        h.engine.push_frame(vec![raw(Some(7), "car", 10.0, 10.0)]);
        h.engine
            .push_frame(vec![raw(Some(7), "car", 12.0, 10.0), raw(Some(9), "car", 20.0, 10.0)]);
        let mut s = session(&h, 3);
        let first = s.process_frame(&Frame::blank(64, 48, 1)).unwrap();
        let second = s.process_frame(&Frame::blank(64, 48, 2)).unwrap();
        assert_eq!(first.detections.len(), 1);
        assert_eq!(second.detections.len(), 1);
        assert_eq!(second.detections[0].track_id, Some(9));
        assert_eq!(s.dedup().seen(Direction::Up), 2);
    }

    #[test]
    fn labels_outside_target_set_are_dropped_and_counted_out() {
        let h = harness();
        h.engine
            .push_frame(vec![raw(None, "person", 10.0, 10.0), raw(None, "bus", 10.0, 10.0)]);
        let mut s = session(&h, 4);
        let tick = s.process_frame(&Frame::blank(64, 48, 1)).unwrap();
        assert_eq!(tick.detections.len(), 1);
        assert_eq!(tick.report.total_vehicles, 1);
        assert_eq!(tick.report.congestion_index, 18);
    }

    #[test]
    fn roi_written_mid_session_applies_to_next_tick() {
        let h = harness();
        h.engine.push_frame(vec![raw(Some(1), "car", 50.0, 10.0)]);
        h.engine.push_frame(vec![raw(Some(1), "car", 50.0, 10.0)]);
        let mut s = session(&h, 5);
        assert_eq!(s.process_frame(&Frame::blank(64, 48, 1)).unwrap().detections.len(), 1);
        h.rois
            .save(RoiConfig::new(5, Some(left_half()), None))
            .unwrap();
        assert!(s.process_frame(&Frame::blank(64, 48, 2)).unwrap().detections.is_empty());
    }

    #[test]
    fn run_emits_ticks_and_forwards_only_non_empty_lists() {
        let h = harness();
        h.engine.push_frame(vec![raw(Some(1), "car", 10.0, 10.0)]);
        h.engine.push_frame(Vec::new());
        h.engine.push_frame(vec![raw(Some(2), "bus", 10.0, 10.0)]);
        let mut s = session(&h, 6);
        let mut sink = CollectingSink::new(3);
        s.run(&mut sink).unwrap();

        assert!(sink.opened);
        assert_eq!(sink.ticks.len(), 3);
        assert!(sink.failure.is_none());
        assert_eq!(s.state(), SessionState::Closed);
        // The third tick ended the session before it was forwarded.
        let events = h.forwarder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].camera_id, 6);
    }

    #[test]
    fn downstream_failures_do_not_interrupt_the_stream() {
        let h = harness();
        for track in 1..=4 {
            h.engine.push_frame(vec![raw(Some(track), "car", 10.0, 10.0)]);
        }
        let refusing = Arc::new(RefusingForwarder::default());
        let ctx = Arc::new(PipelineContext {
            forwarder: Some(refusing.clone()),
            ..(*h.ctx).clone()
        });
        let mut s = Session::new(8, ctx, Arc::new(AtomicBool::new(false)));
        let mut sink = CollectingSink::new(4);
        s.run(&mut sink).unwrap();

        assert_eq!(sink.ticks.len(), 4);
        assert!(sink.failure.is_none());
        assert!(sink.ticks.iter().all(|t| t.detections.len() == 1));
        // Every tick before the last was offered downstream and refused.
        assert_eq!(
            refusing.attempts.load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        assert!(h.forwarder.events.lock().unwrap().is_empty());
    }

    #[test]
    fn sources_bound_to_the_session_thread_stream() {
        let h = harness_with(
            ScriptedEngine::new(),
            Arc::new(StaticMetadataClient::new(STUB)),
            Arc::new(ThreadBoundOpener),
            settings(),
        );
        h.engine.push_frame(vec![raw(Some(1), "car", 10.0, 10.0)]);
        let mut s = session(&h, 9);
        let mut sink = CollectingSink::new(2);
        s.run(&mut sink).unwrap();
        assert_eq!(sink.ticks.len(), 2);
        assert_eq!(sink.ticks[1].detections.len(), 0);
    }

    #[test]
    fn engine_failure_closes_session_before_streaming() {
        let h = harness_with(
            ScriptedEngine::new().failing_init("model missing"),
            Arc::new(StaticMetadataClient::new(STUB)),
            Arc::new(BlankOpener),
            settings(),
        );
        let mut s = session(&h, 7);
        let mut sink = CollectingSink::new(1);
        let err = s.run(&mut sink).unwrap_err();
        assert!(matches!(err, PipelineError::EngineNotReady(_)));
        assert!(matches!(sink.failure, Some(PipelineError::EngineNotReady(_))));
        assert!(!sink.opened);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn rate_limited_camera_never_opens() {
        let h = harness_with(
            ScriptedEngine::new(),
            Arc::new(RateLimitedClient),
            Arc::new(BlankOpener),
            settings(),
        );
        let mut sink = CollectingSink::new(1);
        let err = session(&h, 8).run(&mut sink).unwrap_err();
        assert_eq!(err.http_status(), 503);
        assert!(sink.ticks.is_empty());
    }

    #[test]
    fn throttling_drops_frames_from_fast_sources() {
        let h = harness_with(
            ScriptedEngine::new(),
            Arc::new(StaticMetadataClient::new(STUB)),
            Arc::new(BlankOpener),
            PipelineSettings {
                target_fps: 20,
                ..settings()
            },
        );
        let mut s = session(&h, 9);
        let mut sink = CollectingSink::new(3);
        let stats = s.run(&mut sink).unwrap();
        assert_eq!(stats.ticks_emitted, 2);
        assert!(stats.frames_throttled > 0);
    }

    #[test]
    fn ended_source_is_reopened() {
        let h = harness_with(
            ScriptedEngine::new(),
            Arc::new(StaticMetadataClient::new(
                "stub://cam{id}?width=32&height=32&fps=0&frames=1",
            )),
            Arc::new(DefaultSourceOpener),
            PipelineSettings {
                auto_roi: false,
                ..settings()
            },
        );
        let mut s = session(&h, 10);
        let mut sink = CollectingSink::new(2);
        let stats = s.run(&mut sink).unwrap();
        assert_eq!(sink.ticks.len(), 2);
        assert!(stats.source_reopens >= 1);
    }

    #[test]
    fn shutdown_flag_stops_idle_session() {
        let h = harness();
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut s = Session::new(11, h.ctx.clone(), shutdown);
        let mut sink = CollectingSink::new(100);
        s.run(&mut sink).unwrap();
        assert!(sink.opened);
        assert!(sink.ticks.is_empty());
    }

    #[test]
    fn snapshot_processes_one_frame() {
        let h = harness();
        h.engine.push_frame(vec![raw(Some(4), "car", 10.0, 10.0)]);
        let tick = session(&h, 12).snapshot(Duration::from_secs(1)).unwrap();
        assert_eq!(tick.detections.len(), 1);
        assert_eq!(tick.camera_id, 12);
    }
}
