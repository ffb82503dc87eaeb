#![cfg(feature = "backend-tract")]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::info;
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceEngine, Thresholds};
use crate::detect::result::{BBox, RawDetection};
use crate::detect::tracker::IouTracker;

type Plan = TypedRunnableModel<TypedModel>;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// YOLOv8-style ONNX detector run through tract.
///
/// Expects one output shaped `[1, 4 + classes, anchors]` with centre-format
/// boxes in input pixels followed by per-class scores. The model file is
/// fetched from `model_url` once if it is not on disk.
pub struct TractEngine {
    model_path: PathBuf,
    model_url: Option<String>,
    labels: Vec<String>,
    input_size: u32,
    plan: OnceLock<Plan>,
}

impl TractEngine {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        model_url: Option<String>,
        labels: Vec<String>,
        input_size: u32,
    ) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            model_url,
            labels,
            input_size,
            plan: OnceLock::new(),
        }
    }

    fn fetch_model(&self) -> Result<()> {
        let url = self.model_url.as_deref().ok_or_else(|| {
            anyhow!(
                "model {} not found and no download URL configured",
                self.model_path.display()
            )
        })?;
        info!("downloading model from {} to {}", url, self.model_path.display());
        if let Some(parent) = self.model_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let response = ureq::AgentBuilder::new()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .get(url)
            .call()
            .with_context(|| format!("model download from {} failed", url))?;
        let partial = self.model_path.with_extension("part");
        let mut file = fs::File::create(&partial)
            .with_context(|| format!("failed to create {}", partial.display()))?;
        io::copy(&mut response.into_reader(), &mut file).context("model download interrupted")?;
        fs::rename(&partial, &self.model_path).context("failed to move downloaded model")?;
        Ok(())
    }

    fn load(&self) -> Result<Plan> {
        let size = self.input_size as usize;
        tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!("failed to load ONNX model from {}", self.model_path.display())
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = imageops::resize(image, size, size, FilterType::Triangle);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, size as usize, size as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn label_for(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", class))
    }

    fn decode(
        &self,
        outputs: TVec<TValue>,
        scale_x: f32,
        scale_y: f32,
        thresholds: &Thresholds,
    ) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("model output is not rank 3")?;
        let (_, rows, anchors) = view.dim();
        if rows <= 4 {
            return Err(anyhow!("model output has no class scores"));
        }

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let (class, score) = (4..rows)
                .map(|r| (r - 4, view[[0, r, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score < thresholds.confidence {
                continue;
            }
            let (cx, cy, w, h) = (
                view[[0, 0, i]],
                view[[0, 1, i]],
                view[[0, 2, i]],
                view[[0, 3, i]],
            );
            candidates.push((
                class,
                score,
                BBox::new(
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    (cx + w / 2.0) * scale_x,
                    (cy + h / 2.0) * scale_y,
                ),
            ));
        }

        Ok(non_max_suppression(candidates, thresholds.iou)
            .into_iter()
            .map(|(class, score, bbox)| RawDetection {
                label: self.label_for(class),
                confidence: score,
                bbox,
                track_id: None,
            })
            .collect())
    }
}

/// Per-class greedy NMS over `(class, score, bbox)` candidates.
fn non_max_suppression(
    mut candidates: Vec<(usize, f32, BBox)>,
    iou_threshold: f32,
) -> Vec<(usize, f32, BBox)> {
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut kept: Vec<(usize, f32, BBox)> = Vec::new();
    for cand in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.0 == cand.0 && k.2.iou(&cand.2) > iou_threshold);
        if !suppressed {
            kept.push(cand);
        }
    }
    kept
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn initialize(&self) -> Result<()> {
        if self.plan.get().is_some() {
            return Ok(());
        }
        if !self.model_path.exists() {
            self.fetch_model()?;
        }
        let plan = self.load()?;
        let _ = self.plan.set(plan);
        Ok(())
    }

    fn track(
        &self,
        image: &RgbImage,
        tracks: &mut IouTracker,
        thresholds: &Thresholds,
    ) -> Result<Vec<RawDetection>> {
        let plan = self
            .plan
            .get()
            .ok_or_else(|| anyhow!("tract engine used before initialization"))?;
        let input = self.build_input(image);
        let outputs = plan
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let scale_x = image.width() as f32 / self.input_size as f32;
        let scale_y = image.height() as f32 / self.input_size as f32;
        let mut detections = self.decode(outputs, scale_x, scale_y, thresholds)?;
        tracks.update(&mut detections);
        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_suppresses_same_class_overlap_only() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(1.0, 0.0, 11.0, 10.0);
        let kept = non_max_suppression(vec![(0, 0.6, b), (0, 0.9, a), (1, 0.5, b)], 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].0, 1);
    }

    #[test]
    fn missing_model_without_url_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let engine = TractEngine::new(dir.path().join("absent.onnx"), None, vec![], 640);
        assert!(engine.initialize().is_err());
    }
}
