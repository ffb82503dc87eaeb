use serde::{Deserialize, Serialize};

use crate::geometry::{Direction, Point};

/// Axis-aligned box in frame pixels. Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let intersection = if ix2 > ix1 && iy2 > iy1 {
            (ix2 - ix1) * (iy2 - iy1)
        } else {
            0.0
        };
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        BBox::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Engine output before label filtering.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Stable identity when the engine tracks objects across frames.
    pub track_id: Option<i64>,
}

/// One detected object in one frame.
///
/// Records are values: a new one is produced every frame, and attaching a
/// direction yields a new record. Continuity across frames is `track_id` only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    pub track_id: Option<i64>,
    pub label: String,
    pub confidence: f32,
    pub bbox: BBox,
    pub direction: Option<Direction>,
}

impl Detection {
    pub fn new(track_id: Option<i64>, label: &str, confidence: f32, bbox: BBox) -> Self {
        Self {
            track_id,
            label: label.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            bbox,
            direction: None,
        }
    }

    pub fn with_direction(self, direction: Option<Direction>) -> Self {
        Self { direction, ..self }
    }
}

impl From<RawDetection> for Detection {
    fn from(raw: RawDetection) -> Self {
        Detection::new(raw.track_id, &raw.label, raw.confidence, raw.bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_normalizes_corner_order() {
        let b = BBox::new(10.0, 20.0, 0.0, 5.0);
        assert_eq!((b.x1, b.y1, b.x2, b.y2), (0.0, 5.0, 10.0, 20.0));
        assert_eq!(b.center(), Point::new(5.0, 12.5));
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn detection_json_shape() {
        let det = Detection::new(Some(7), "bus", 0.8, BBox::new(1.0, 2.0, 3.0, 4.0))
            .with_direction(Some(Direction::Up));
        let value = serde_json::to_value(&det).unwrap();
        assert_eq!(value["trackId"], 7);
        assert_eq!(value["label"], "bus");
        assert_eq!(value["bbox"], serde_json::json!([1.0, 2.0, 3.0, 4.0]));
        assert_eq!(value["direction"], "up");

        let anonymous = Detection::new(None, "car", 1.4, BBox::new(0.0, 0.0, 1.0, 1.0));
        let value = serde_json::to_value(&anonymous).unwrap();
        assert!(value["trackId"].is_null());
        assert!(value["direction"].is_null());
        assert_eq!(anonymous.confidence, 1.0);
    }
}
