//! Road-region estimation from lane edges.
//!
//! Used only when a camera has no stored ROI. The result is a trapezoid
//! spanning the two dominant near-vertical edge lines in the lower part of
//! the frame.

use std::time::{Duration, Instant};

use image::imageops;
use image::{GrayImage, RgbImage};
use imageproc::edges::canny;
use imageproc::hough::{detect_lines, LineDetectionOptions, PolarLine};

use crate::geometry::{Point, Polygon};

pub const AUTO_ROI_RETRY: Duration = Duration::from_secs(2);

/// Fraction of the frame height, from the bottom, searched for lane edges.
const SEARCH_FRACTION: f32 = 0.6;
const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
const MAX_NORMAL_ANGLE: u32 = 65;
const MIN_NORMAL_ANGLE_MIRRORED: u32 = 115;
const BOTTOM_Y: f32 = 0.95;
const TOP_Y: f32 = 0.5;

/// Estimate a road polygon, or `None` when either side has no usable line.
pub fn estimate_road_polygon(image: &RgbImage) -> Option<Polygon> {
    let (w, h) = image.dimensions();
    if w < 16 || h < 16 {
        return None;
    }
    let y0 = (h as f32 * (1.0 - SEARCH_FRACTION)) as u32;
    let gray: GrayImage = imageops::grayscale(image);
    let region = imageops::crop_imm(&gray, 0, y0, w, h - y0).to_image();
    let region = imageops::blur(&region, 1.2);
    let edges = canny(&region, CANNY_LOW, CANNY_HIGH);

    let region_h = (h - y0) as f32;
    let options = LineDetectionOptions {
        vote_threshold: ((region_h * 0.25) as u32).max(20),
        suppression_radius: 8,
    };
    let lines: Vec<PolarLine> = detect_lines(&edges, options)
        .into_iter()
        .filter(|l| {
            l.angle_in_degrees <= MAX_NORMAL_ANGLE || l.angle_in_degrees >= MIN_NORMAL_ANGLE_MIRRORED
        })
        .collect();

    // Sample every line at the top and bottom of the search band, in frame
    // coordinates, and bucket by which side of the midline it crosses.
    let mid_x = w as f32 / 2.0;
    let (y_top, y_bottom) = (0.0, region_h - 1.0);
    let mut left = Vec::new();
    let mut right = Vec::new();
    for line in &lines {
        let Some(x_mid) = x_at(line, region_h / 2.0) else {
            continue;
        };
        let (Some(xt), Some(xb)) = (x_at(line, y_top), x_at(line, y_bottom)) else {
            continue;
        };
        let samples = [
            (y_top + y0 as f32, xt),
            (y_bottom + y0 as f32, xb),
        ];
        if x_mid < mid_x {
            left.extend(samples);
        } else {
            right.extend(samples);
        }
    }

    let (lm, lb) = fit_x_of_y(&left)?;
    let (rm, rb) = fit_x_of_y(&right)?;

    let max_x = (w - 1) as f32;
    let project = |m: f32, b: f32, y: f32| Point::new((m * y + b).clamp(0.0, max_x), y);
    let yb = h as f32 * BOTTOM_Y;
    let yt = h as f32 * TOP_Y;
    let (lb_pt, lt_pt) = (project(lm, lb, yb), project(lm, lb, yt));
    let (rt_pt, rb_pt) = (project(rm, rb, yt), project(rm, rb, yb));
    if lb_pt.x >= rb_pt.x || lt_pt.x >= rt_pt.x {
        return None;
    }
    Polygon::new(vec![lb_pt, lt_pt, rt_pt, rb_pt]).ok()
}

/// `x` where the polar line `x cos t + y sin t = r` crosses row `y`.
fn x_at(line: &PolarLine, y: f32) -> Option<f32> {
    let theta = (line.angle_in_degrees as f32).to_radians();
    let cos = theta.cos();
    if cos.abs() < 1e-3 {
        return None;
    }
    Some((line.r - y * theta.sin()) / cos)
}

/// Least-squares fit of `x = m*y + b` over `(y, x)` samples.
fn fit_x_of_y(samples: &[(f32, f32)]) -> Option<(f32, f32)> {
    if samples.len() < 2 {
        return None;
    }
    let n = samples.len() as f32;
    let mean_y = samples.iter().map(|s| s.0).sum::<f32>() / n;
    let mean_x = samples.iter().map(|s| s.1).sum::<f32>() / n;
    let var_y: f32 = samples.iter().map(|s| (s.0 - mean_y).powi(2)).sum();
    if var_y < 1e-6 {
        return None;
    }
    let cov: f32 = samples
        .iter()
        .map(|s| (s.0 - mean_y) * (s.1 - mean_x))
        .sum();
    let m = cov / var_y;
    Some((m, mean_x - m * mean_y))
}

/// Per-session auto-ROI cache. A polygon, once found, is kept for the rest
/// of the session; failures are retried at most once per `retry`.
#[derive(Debug)]
pub struct AutoRoiState {
    polygon: Option<Polygon>,
    last_attempt: Option<Instant>,
    retry: Duration,
}

impl Default for AutoRoiState {
    fn default() -> Self {
        Self::new(AUTO_ROI_RETRY)
    }
}

impl AutoRoiState {
    pub fn new(retry: Duration) -> Self {
        Self {
            polygon: None,
            last_attempt: None,
            retry,
        }
    }

    pub fn polygon(&self) -> Option<&Polygon> {
        self.polygon.as_ref()
    }

    pub fn resolve(&mut self, image: &RgbImage, now: Instant) -> Option<&Polygon> {
        if self.polygon.is_none() {
            let due = self
                .last_attempt
                .map_or(true, |last| now.saturating_duration_since(last) >= self.retry);
            if due {
                self.last_attempt = Some(now);
                self.polygon = estimate_road_polygon(image);
                if let Some(poly) = &self.polygon {
                    log::debug!("auto roi estimated: {:?}", poly.to_pairs());
                }
            }
        }
        self.polygon.as_ref()
    }

    pub fn reset(&mut self) {
        self.polygon = None;
        self.last_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use imageproc::drawing::draw_line_segment_mut;

    fn lane_image() -> RgbImage {
        let mut img = RgbImage::new(320, 240);
        for d in -3..=3 {
            let d = d as f32;
            draw_line_segment_mut(&mut img, (40.0 + d, 239.0), (140.0 + d, 60.0), Rgb([255, 255, 255]));
            draw_line_segment_mut(&mut img, (280.0 + d, 239.0), (180.0 + d, 60.0), Rgb([255, 255, 255]));
        }
        img
    }

    #[test]
    fn blank_frame_has_no_road() {
        assert!(estimate_road_polygon(&RgbImage::new(320, 240)).is_none());
    }

    #[test]
    fn two_lane_edges_give_a_trapezoid() {
        let poly = estimate_road_polygon(&lane_image()).expect("road polygon");
        let pts = poly.points();
        assert_eq!(pts.len(), 4);
        // bottom-left, top-left, top-right, bottom-right
        assert!(pts[0].x < 160.0 && pts[3].x > 160.0);
        assert!(pts[1].x < pts[2].x);
        assert!((pts[0].y - 228.0).abs() < 1.0);
        assert!((pts[1].y - 120.0).abs() < 1.0);
        // Left edge fans out towards the bottom.
        assert!(pts[0].x < pts[1].x);
    }

    #[test]
    fn least_squares_recovers_a_line() {
        let samples: Vec<(f32, f32)> = (0..5).map(|i| (i as f32, 2.0 * i as f32 + 1.0)).collect();
        let (m, b) = fit_x_of_y(&samples).unwrap();
        assert!((m - 2.0).abs() < 1e-4 && (b - 1.0).abs() < 1e-4);
        assert!(fit_x_of_y(&[(1.0, 1.0)]).is_none());
    }

    #[test]
    fn failed_attempts_are_rate_limited() {
        let mut state = AutoRoiState::new(Duration::from_secs(2));
        let blank = RgbImage::new(320, 240);
        let t0 = Instant::now();
        assert!(state.resolve(&blank, t0).is_none());
        // Within the retry window a good frame is not even looked at.
        assert!(state.resolve(&lane_image(), t0 + Duration::from_millis(500)).is_none());
        assert!(state.resolve(&lane_image(), t0 + Duration::from_secs(3)).is_some());
        // Found polygons stick.
        assert!(state.resolve(&blank, t0 + Duration::from_secs(10)).is_some());
    }
}
