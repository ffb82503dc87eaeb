//! Low-light / bad-weather enhancement applied before inference.
//!
//! Gamma lift, then CLAHE on the luma channel, then a mild unsharp mask.
//! The overlay is drawn on the original frame, not this one.

use image::imageops;
use image::{Rgb, RgbImage};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EnhanceParams {
    pub gamma: f32,
    pub clahe_clip_limit: f32,
    pub clahe_tiles: u32,
    pub sharpen_sigma: f32,
    pub sharpen_amount: f32,
}

impl Default for EnhanceParams {
    fn default() -> Self {
        Self {
            gamma: 1.2,
            clahe_clip_limit: 2.0,
            clahe_tiles: 8,
            sharpen_sigma: 1.0,
            sharpen_amount: 0.5,
        }
    }
}

pub fn enhance(image: &RgbImage, params: &EnhanceParams) -> RgbImage {
    let mut out = image.clone();
    apply_gamma(&mut out, params.gamma);
    equalize_luma(&mut out, params.clahe_clip_limit, params.clahe_tiles);
    unsharp(&out, params.sharpen_sigma, params.sharpen_amount)
}

fn gamma_lut(gamma: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    let inv = 1.0 / gamma.max(0.01);
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = ((i as f32 / 255.0).powf(inv) * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn apply_gamma(image: &mut RgbImage, gamma: f32) {
    let lut = gamma_lut(gamma);
    for px in image.pixels_mut() {
        for c in px.0.iter_mut() {
            *c = lut[*c as usize];
        }
    }
}

fn to_ycbcr(px: &Rgb<u8>) -> (f32, f32, f32) {
    let [r, g, b] = px.0.map(f32::from);
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let cb = 128.0 - 0.168_736 * r - 0.331_264 * g + 0.5 * b;
    let cr = 128.0 + 0.5 * r - 0.418_688 * g - 0.081_312 * b;
    (y, cb, cr)
}

fn from_ycbcr(y: f32, cb: f32, cr: f32) -> Rgb<u8> {
    let r = y + 1.402 * (cr - 128.0);
    let g = y - 0.344_136 * (cb - 128.0) - 0.714_136 * (cr - 128.0);
    let b = y + 1.772 * (cb - 128.0);
    Rgb([r, g, b].map(|v| v.round().clamp(0.0, 255.0) as u8))
}

/// Contrast-limited adaptive histogram equalization on luma, chroma kept.
fn equalize_luma(image: &mut RgbImage, clip_limit: f32, tiles: u32) {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return;
    }
    let tiles_x = tiles.clamp(1, w);
    let tiles_y = tiles.clamp(1, h);

    let mut luma = vec![0u8; (w * h) as usize];
    let mut chroma = vec![(0f32, 0f32); (w * h) as usize];
    for (x, y, px) in image.enumerate_pixels() {
        let (l, cb, cr) = to_ycbcr(px);
        let idx = (y * w + x) as usize;
        luma[idx] = l.round().clamp(0.0, 255.0) as u8;
        chroma[idx] = (cb, cr);
    }

    let tile_w = w.div_ceil(tiles_x);
    let tile_h = h.div_ceil(tiles_y);
    let mut maps = vec![[0u8; 256]; (tiles_x * tiles_y) as usize];
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[luma[(y * w + x) as usize] as usize] += 1;
                }
            }
            let area = (x1.saturating_sub(x0) * y1.saturating_sub(y0)).max(1);
            maps[(ty * tiles_x + tx) as usize] = clipped_cdf(&mut hist, area, clip_limit);
        }
    }

    for y in 0..h {
        // Tile-centre coordinates for bilinear blending between the four
        // nearest tile mappings.
        let gy = (y as f32 + 0.5) / tile_h as f32 - 0.5;
        let ty0 = gy.floor().clamp(0.0, (tiles_y - 1) as f32) as u32;
        let ty1 = (ty0 + 1).min(tiles_y - 1);
        let fy = (gy - ty0 as f32).clamp(0.0, 1.0);
        for x in 0..w {
            let gx = (x as f32 + 0.5) / tile_w as f32 - 0.5;
            let tx0 = gx.floor().clamp(0.0, (tiles_x - 1) as f32) as u32;
            let tx1 = (tx0 + 1).min(tiles_x - 1);
            let fx = (gx - tx0 as f32).clamp(0.0, 1.0);

            let idx = (y * w + x) as usize;
            let v = luma[idx] as usize;
            let m = |tx: u32, ty: u32| maps[(ty * tiles_x + tx) as usize][v] as f32;
            let top = m(tx0, ty0) * (1.0 - fx) + m(tx1, ty0) * fx;
            let bottom = m(tx0, ty1) * (1.0 - fx) + m(tx1, ty1) * fx;
            let l = top * (1.0 - fy) + bottom * fy;
            let (cb, cr) = chroma[idx];
            image.put_pixel(x, y, from_ycbcr(l, cb, cr));
        }
    }
}

/// Clip the histogram at `clip_limit * area / 256`, spread the excess
/// evenly, and return the scaled CDF as a lookup table.
fn clipped_cdf(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }
        let bonus = excess / 256;
        let remainder = (excess % 256) as usize;
        for (i, bin) in hist.iter_mut().enumerate() {
            *bin += bonus + u32::from(i < remainder);
        }
    }
    let mut lut = [0u8; 256];
    let mut sum = 0u32;
    let scale = 255.0 / area as f32;
    for (i, bin) in hist.iter().enumerate() {
        sum += bin;
        lut[i] = (sum as f32 * scale).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

fn unsharp(image: &RgbImage, sigma: f32, amount: f32) -> RgbImage {
    if sigma <= 0.0 || amount == 0.0 {
        return image.clone();
    }
    let blurred = imageops::blur(image, sigma);
    let mut out = image.clone();
    for (px, soft) in out.pixels_mut().zip(blurred.pixels()) {
        for c in 0..3 {
            let sharp = (1.0 + amount) * px[c] as f32 - amount * soft[c] as f32;
            px[c] = sharp.round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_brightens_midtones_and_keeps_extremes() {
        let lut = gamma_lut(1.2);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[255], 255);
        assert!(lut[64] > 64);
    }

    #[test]
    fn enhancement_preserves_dimensions_and_flat_frames_stay_flat() {
        let img = RgbImage::from_pixel(40, 30, Rgb([90, 90, 90]));
        let out = enhance(&img, &EnhanceParams::default());
        assert_eq!(out.dimensions(), (40, 30));
        let first = *out.get_pixel(0, 0);
        assert!(out.pixels().all(|p| *p == first));
    }

    #[test]
    fn clahe_stretches_low_contrast_texture() {
        let mut img = RgbImage::new(64, 64);
        for (x, y, px) in img.enumerate_pixels_mut() {
            let v = 100 + ((x + y) % 8) as u8;
            *px = Rgb([v, v, v]);
        }
        equalize_luma(&mut img, 2.0, 8);
        let min = img.pixels().map(|p| p[0]).min().unwrap();
        let max = img.pixels().map(|p| p[0]).max().unwrap();
        assert!(max - min > 7);
    }
}
