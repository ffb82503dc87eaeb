//! Frame sources.
//!
//! A session resolves a camera to a playable address and hands it to a
//! `SourceOpener`. Supported addresses:
//! - `stub://name?width=..&height=..&fps=..&frames=..` synthetic road scene
//! - `http(s)://` MJPEG (multipart) or single-JPEG snapshot endpoints
//! - `rtsp://` and HLS `.m3u8` playlists (feature: ingest-ffmpeg)
//!
//! Sources are owned by exactly one session and dropped when it ends.

#[cfg(feature = "ingest-ffmpeg")]
mod ffmpeg;
mod http;
mod synthetic;

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use url::Url;

use crate::frame::Frame;

#[cfg(feature = "ingest-ffmpeg")]
pub use ffmpeg::FfmpegSource;
pub use http::HttpJpegSource;
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Statistics reported by a frame source.
#[derive(Clone, Debug)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// Opaque "next frame" provider. Sources are opened and driven on their
/// session's thread, so they need not be `Send`.
pub trait FrameSource {
    /// Open the underlying stream.
    fn connect(&mut self) -> Result<()>;

    /// Pull the next decoded frame. `Ok(None)` means nothing is ready yet;
    /// errors mean the source should be closed and reopened.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;
}

/// Turns a resolved stream address into a connected source.
pub trait SourceOpener: Send + Sync {
    fn open(&self, address: &str) -> Result<Box<dyn FrameSource>>;
}

/// Scheme-based opener used by the daemon.
#[derive(Clone, Debug, Default)]
pub struct DefaultSourceOpener;

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, address: &str) -> Result<Box<dyn FrameSource>> {
        let url = Url::parse(address).with_context(|| format!("parse stream url {}", address))?;
        let mut source: Box<dyn FrameSource> = match url.scheme() {
            "stub" => Box::new(SyntheticSource::new(SyntheticConfig::from_url(&url)?)),
            "rtsp" | "rtsps" => open_ffmpeg(address)?,
            "http" | "https" if url.path().ends_with(".m3u8") => open_ffmpeg(address)?,
            "http" | "https" => Box::new(HttpJpegSource::new(address)),
            other => return Err(anyhow!("unsupported stream scheme '{}'", other)),
        };
        source.connect()?;
        Ok(source)
    }
}

#[cfg(feature = "ingest-ffmpeg")]
fn open_ffmpeg(address: &str) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(FfmpegSource::new(address)?))
}

#[cfg(not(feature = "ingest-ffmpeg"))]
fn open_ffmpeg(address: &str) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "stream {} requires the ingest-ffmpeg feature",
        address
    ))
}

/// How long a source may go without frames before it reports unhealthy.
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_scheme_opens_synthetic_source() {
        let mut source = DefaultSourceOpener
            .open("stub://cam?width=64&height=48&fps=0")
            .unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!((frame.width(), frame.height()), (64, 48));
        assert!(source.is_healthy());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(DefaultSourceOpener.open("ftp://example.com/a").is_err());
        assert!(DefaultSourceOpener.open("not a url").is_err());
    }

    #[cfg(not(feature = "ingest-ffmpeg"))]
    #[test]
    fn playlists_need_ffmpeg() {
        let err = DefaultSourceOpener
            .open("http://example.com/live/playlist.m3u8")
            .err()
            .unwrap();
        assert!(err.to_string().contains("ingest-ffmpeg"));
    }
}
