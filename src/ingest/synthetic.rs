use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_line_segment_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use url::Url;

use super::{health_grace, FrameSource, SourceStats};
use crate::frame::Frame;

const GRASS: Rgb<u8> = Rgb([48, 82, 40]);
const ASPHALT: Rgb<u8> = Rgb([92, 92, 96]);
const PAINT: Rgb<u8> = Rgb([235, 235, 235]);
const VEHICLE_COLORS: [Rgb<u8>; 3] = [Rgb([200, 40, 40]), Rgb([40, 70, 200]), Rgb([220, 200, 60])];

/// Parameters of a `stub://` stream.
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub url: String,
    pub width: u32,
    pub height: u32,
    /// Pacing of the fake camera; 0 produces a frame on every pull.
    pub fps: u32,
    /// Stream ends with an error after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            url: "stub://default".to_string(),
            width: 640,
            height: 360,
            fps: 15,
            max_frames: None,
        }
    }
}

impl SyntheticConfig {
    pub fn from_url(url: &Url) -> Result<Self> {
        let mut config = Self {
            url: url.to_string(),
            ..Self::default()
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => config.width = value.parse().context("stub width")?,
                "height" => config.height = value.parse().context("stub height")?,
                "fps" => config.fps = value.parse().context("stub fps")?,
                "frames" => config.max_frames = Some(value.parse().context("stub frames")?),
                _ => {}
            }
        }
        if config.width < 16 || config.height < 16 {
            return Err(anyhow!(
                "stub frame size {}x{} is too small",
                config.width,
                config.height
            ));
        }
        Ok(config)
    }
}

/// Synthetic road scene: a two-edge carriageway with a few boxes driving
/// down it. The painted edges are strong enough for lane detection.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            last_frame_at: None,
            connected: false,
        }
    }

    fn interval(&self) -> Duration {
        if self.config.fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis((1000 / self.config.fps as u64).max(1))
        }
    }

    fn render(&self) -> RgbImage {
        let (w, h) = (self.config.width as f32, self.config.height as f32);
        let mut image = RgbImage::from_pixel(self.config.width, self.config.height, GRASS);

        let bottom_left = (w * 0.10, h - 1.0);
        let bottom_right = (w * 0.90, h - 1.0);
        let top_left = (w * 0.42, h * 0.35);
        let top_right = (w * 0.58, h * 0.35);
        let road = [
            Point::new(bottom_left.0 as i32, bottom_left.1 as i32),
            Point::new(top_left.0 as i32, top_left.1 as i32),
            Point::new(top_right.0 as i32, top_right.1 as i32),
            Point::new(bottom_right.0 as i32, bottom_right.1 as i32),
        ];
        draw_polygon_mut(&mut image, &road, ASPHALT);
        for offset in -2..=2 {
            let d = offset as f32;
            draw_line_segment_mut(
                &mut image,
                (bottom_left.0 + d, bottom_left.1),
                (top_left.0 + d, top_left.1),
                PAINT,
            );
            draw_line_segment_mut(
                &mut image,
                (bottom_right.0 + d, bottom_right.1),
                (top_right.0 + d, top_right.1),
                PAINT,
            );
        }

        let span = (h * 0.6) as u64;
        for (i, color) in VEHICLE_COLORS.iter().enumerate() {
            let progress = (self.frame_count * 3 + i as u64 * span / 3) % span.max(1);
            let y = h * 0.38 + progress as f32;
            let lane = 0.40 + 0.10 * i as f32;
            let size = (w * 0.04 + progress as f32 * 0.15).max(4.0);
            let x = w * lane + (y / h - 0.5) * w * 0.1 * (i as f32 - 1.0);
            draw_filled_rect_mut(
                &mut image,
                Rect::at(x as i32, y as i32).of_size(size as u32, (size * 0.7) as u32),
                *color,
            );
        }
        image
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("SyntheticSource: connected to {}", self.config.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected"));
        }
        if let Some(max) = self.config.max_frames {
            if self.frame_count >= max {
                self.connected = false;
                return Err(anyhow!("synthetic stream ended after {} frames", max));
            }
        }
        let now = Instant::now();
        if let Some(last) = self.last_frame_at {
            if now.duration_since(last) < self.interval() {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(now);
        Ok(Some(Frame::new(self.render(), self.frame_count)))
    }

    fn is_healthy(&self) -> bool {
        if !self.connected {
            return false;
        }
        match self.last_frame_at {
            Some(last) => last.elapsed() <= health_grace(self.config.fps),
            None => true,
        }
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(query: &str) -> SyntheticSource {
        let url = Url::parse(&format!("stub://cam?{}", query)).unwrap();
        let mut source = SyntheticSource::new(SyntheticConfig::from_url(&url).unwrap());
        source.connect().unwrap();
        source
    }

    #[test]
    fn paced_source_returns_none_between_frames() {
        let mut s = source("width=32&height=32&fps=1");
        assert!(s.next_frame().unwrap().is_some());
        assert!(s.next_frame().unwrap().is_none());
        assert_eq!(s.stats().frames_captured, 1);
    }

    #[test]
    fn frame_limit_ends_stream() {
        let mut s = source("width=32&height=32&fps=0&frames=2");
        assert_eq!(s.next_frame().unwrap().unwrap().seq, 1);
        assert_eq!(s.next_frame().unwrap().unwrap().seq, 2);
        assert!(s.next_frame().is_err());
        assert!(!s.is_healthy());
    }

    #[test]
    fn tiny_frames_are_rejected() {
        let url = Url::parse("stub://cam?width=4&height=4").unwrap();
        assert!(SyntheticConfig::from_url(&url).is_err());
    }
}
