//! Annotation of outgoing frames: ROI shading, boxes, labels, track accents.

use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_polygon_mut, draw_hollow_rect_mut,
    draw_polygon_mut, draw_text_mut,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use log::{info, warn};

use crate::congestion::CongestionReport;
use crate::detect::Detection;
use crate::geometry::{Direction, Polygon};
use crate::roi::ActiveRoi;

const ROI_ALPHA: f32 = 0.2;
const UPSTREAM_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const DOWNSTREAM_COLOR: Rgb<u8> = Rgb([0, 160, 255]);
const AUTO_ROI_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const UNTRACKED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const BANNER_BG: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_SCALE: f32 = 18.0;

const TRACK_PALETTE: [Rgb<u8>; 8] = [
    Rgb([230, 25, 75]),
    Rgb([60, 180, 75]),
    Rgb([255, 225, 25]),
    Rgb([0, 130, 200]),
    Rgb([245, 130, 48]),
    Rgb([145, 30, 180]),
    Rgb([70, 240, 240]),
    Rgb([240, 50, 230]),
];

/// Hangul-capable fonts commonly present on the deployment hosts.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/nanum/NanumGothic.ttf",
    "/usr/share/fonts/truetype/noto/NotoSansKR-Regular.otf",
    "/usr/share/fonts/opentype/noto/NotoSansCJK-Regular.ttc",
    "/usr/local/share/fonts/NanumGothic.ttf",
    "/Library/Fonts/AppleGothic.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
];

/// Process-wide label font, loaded on first use.
pub struct FontCache {
    paths: Vec<PathBuf>,
    font: OnceLock<Option<FontVec>>,
}

impl FontCache {
    /// `extra` paths are tried before the built-in candidates.
    pub fn new(extra: Vec<PathBuf>) -> Self {
        let mut paths = extra;
        paths.extend(FONT_CANDIDATES.iter().map(PathBuf::from));
        Self {
            paths,
            font: OnceLock::new(),
        }
    }

    /// A cache that never loads a font; labels are skipped.
    pub fn disabled() -> Self {
        Self {
            paths: Vec::new(),
            font: OnceLock::new(),
        }
    }

    pub fn font(&self) -> Option<&FontVec> {
        self.font
            .get_or_init(|| {
                for path in &self.paths {
                    let Ok(bytes) = fs::read(path) else {
                        continue;
                    };
                    match FontVec::try_from_vec(bytes) {
                        Ok(font) => {
                            info!("overlay font loaded from {}", path.display());
                            return Some(font);
                        }
                        Err(err) => warn!("unusable font {}: {}", path.display(), err),
                    }
                }
                warn!("no overlay font found; labels will not be drawn");
                None
            })
            .as_ref()
    }
}

pub fn track_color(track_id: Option<i64>) -> Rgb<u8> {
    match track_id {
        Some(id) => TRACK_PALETTE[id.rem_euclid(TRACK_PALETTE.len() as i64) as usize],
        None => UNTRACKED_COLOR,
    }
}

/// Draw the tick's annotations on a copy of `image`.
pub fn render(
    image: &RgbImage,
    detections: &[Detection],
    roi: &ActiveRoi,
    report: &CongestionReport,
    font: Option<&FontVec>,
) -> RgbImage {
    let mut canvas = image.clone();
    match roi {
        ActiveRoi::Stored(config) => {
            if let Some(poly) = &config.upstream {
                shade_polygon(&mut canvas, poly, UPSTREAM_COLOR);
            }
            if let Some(poly) = &config.downstream {
                shade_polygon(&mut canvas, poly, DOWNSTREAM_COLOR);
            }
        }
        ActiveRoi::Auto(poly) => shade_polygon(&mut canvas, poly, AUTO_ROI_COLOR),
        ActiveRoi::None => {}
    }

    for det in detections {
        draw_detection(&mut canvas, det, font);
    }

    if let Some(font) = font {
        let banner = format!(
            "congestion {}  vehicles {}",
            report.congestion_index, report.total_vehicles
        );
        draw_filled_rect_mut(&mut canvas, Rect::at(0, 0).of_size(260, 26), BANNER_BG);
        draw_text_mut(&mut canvas, TEXT_COLOR, 6, 4, PxScale::from(LABEL_SCALE), font, &banner);
    }
    canvas
}

fn polygon_vertices(poly: &Polygon) -> Vec<(f32, f32)> {
    let mut pts: Vec<(f32, f32)> = poly.points().iter().map(|p| (p.x, p.y)).collect();
    // Closed rings from clients repeat the first vertex; the fill routine
    // rejects that.
    while pts.len() > 3 && pts.first() == pts.last() {
        pts.pop();
    }
    pts
}

fn shade_polygon(canvas: &mut RgbImage, poly: &Polygon, color: Rgb<u8>) {
    let vertices = polygon_vertices(poly);
    let int_pts: Vec<Point<i32>> = vertices
        .iter()
        .map(|&(x, y)| Point::new(x.round() as i32, y.round() as i32))
        .collect();
    if int_pts.first() != int_pts.last() {
        let mut shaded = canvas.clone();
        draw_polygon_mut(&mut shaded, &int_pts, color);
        for (dst, src) in canvas.pixels_mut().zip(shaded.pixels()) {
            for c in 0..3 {
                dst[c] = (ROI_ALPHA * src[c] as f32 + (1.0 - ROI_ALPHA) * dst[c] as f32).round()
                    as u8;
            }
        }
    }
    let float_pts: Vec<Point<f32>> = vertices.iter().map(|&(x, y)| Point::new(x, y)).collect();
    draw_hollow_polygon_mut(canvas, &float_pts, color);
}

fn draw_detection(canvas: &mut RgbImage, det: &Detection, font: Option<&FontVec>) {
    let color = track_color(det.track_id);
    let (x1, y1) = (det.bbox.x1.round() as i32, det.bbox.y1.round() as i32);
    let w = det.bbox.width().round().max(1.0) as u32;
    let h = det.bbox.height().round().max(1.0) as u32;
    draw_hollow_rect_mut(canvas, Rect::at(x1, y1).of_size(w, h), color);
    if w > 2 && h > 2 {
        draw_hollow_rect_mut(canvas, Rect::at(x1 + 1, y1 + 1).of_size(w - 2, h - 2), color);
    }
    let center = det.bbox.center();
    draw_filled_circle_mut(
        canvas,
        (center.x.round() as i32, center.y.round() as i32),
        3,
        color,
    );

    let Some(font) = font else {
        return;
    };
    let mut text = format!("{} {:.2}", det.label, det.confidence);
    if let Some(id) = det.track_id {
        text = format!("#{} {}", id, text);
    }
    match det.direction {
        Some(Direction::Up) => text.push_str(" up"),
        Some(Direction::Down) => text.push_str(" down"),
        None => {}
    }
    let ty = (y1 - LABEL_SCALE as i32 - 2).max(0);
    draw_text_mut(canvas, color, x1.max(0), ty, PxScale::from(LABEL_SCALE), font, &text);
}
