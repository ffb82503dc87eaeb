//! Traffic View
//!
//! Live vehicle detection over public traffic CCTV feeds.
//!
//! # Architecture
//!
//! A viewer asks for a camera id. The service resolves the camera's current
//! stream address through a metadata service, pulls frames from it, runs
//! detection and tracking, filters detections by the camera's region of
//! interest, assigns travel direction, scores congestion and pushes an
//! annotated frame back to the viewer. Non-empty detection sets are
//! forwarded to a downstream collector in the background.
//!
//! # Module Structure
//!
//! - `resolver`: camera id to stream address, with TTL cache and 429 backoff
//! - `ingest`: frame sources (synthetic, MJPEG/HTTP snapshot, ffmpeg)
//! - `detect`: inference engine seam, tracker, detection adapter
//! - `geometry`, `roi`: polygons, zone classification, ROI storage, auto-ROI
//! - `dedup`, `congestion`: per-session dedup and congestion scoring
//! - `session`: the per-consumer frame processing loop
//! - `api`: HTTP server with MJPEG and WebSocket outputs
//! - `config`: daemon configuration

pub mod api;
pub mod config;
pub mod congestion;
pub mod dedup;
pub mod detect;
pub mod enhance;
pub mod error;
pub mod forward;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod overlay;
pub mod resolver;
pub mod roi;
pub mod session;

/// Identifier of a CCTV camera in the metadata service.
pub type CameraId = u64;

pub use congestion::{CongestionAggregator, CongestionReport};
pub use detect::{BBox, Detection};
pub use error::{Disposition, PipelineError};
pub use frame::Frame;
pub use geometry::{classify_direction, is_inside, Direction, Point, Polygon};
pub use roi::{RoiConfig, RoiRegistry};
pub use session::{PipelineContext, Session, TickOutput};
