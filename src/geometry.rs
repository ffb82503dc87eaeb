//! Polygon geometry and directional zone classification.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::detect::Detection;

const EDGE_EPSILON: f32 = 1e-3;

/// Pixel coordinate. Serialized as `[x, y]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 2]", into = "[f32; 2]")]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl From<[f32; 2]> for Point {
    fn from(value: [f32; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<Point> for [f32; 2] {
    fn from(value: Point) -> Self {
        [value.x, value.y]
    }
}

/// Closed polygon with at least three vertices. The closing edge is implicit.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Polygon(Vec<Point>);

impl Polygon {
    pub fn new(points: Vec<Point>) -> Result<Self> {
        if points.len() < 3 {
            return Err(anyhow!(
                "polygon needs at least 3 points, got {}",
                points.len()
            ));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(anyhow!("polygon contains non-finite coordinates"));
        }
        Ok(Self(points))
    }

    /// Build from raw `[x, y]` pairs; `None` for an empty or degenerate list.
    pub fn from_pairs(pairs: &[[f32; 2]]) -> Option<Self> {
        Self::new(pairs.iter().copied().map(Point::from).collect()).ok()
    }

    pub fn points(&self) -> &[Point] {
        &self.0
    }

    pub fn to_pairs(&self) -> Vec<[f32; 2]> {
        self.0.iter().map(|p| [p.x, p.y]).collect()
    }

    fn edges(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let n = self.0.len();
        (0..n).map(move |i| (self.0[i], self.0[(i + 1) % n]))
    }
}

impl<'de> Deserialize<'de> for Polygon {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let points = Vec::<Point>::deserialize(deserializer)?;
        Polygon::new(points).map_err(serde::de::Error::custom)
    }
}

/// Travel direction of a road zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// Point-in-polygon test. Points on an edge or vertex count as inside.
pub fn is_inside(point: Point, polygon: &Polygon) -> bool {
    if polygon.edges().any(|(a, b)| on_segment(point, a, b)) {
        return true;
    }

    // Even-odd ray cast towards +x.
    let mut inside = false;
    for (a, b) in polygon.edges() {
        if (a.y > point.y) != (b.y > point.y) {
            let x_cross = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if point.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let len = ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt().max(1.0);
    if cross.abs() / len > EDGE_EPSILON {
        return false;
    }
    p.x >= a.x.min(b.x) - EDGE_EPSILON
        && p.x <= a.x.max(b.x) + EDGE_EPSILON
        && p.y >= a.y.min(b.y) - EDGE_EPSILON
        && p.y <= a.y.max(b.y) + EDGE_EPSILON
}

/// Directional zones configured for one camera.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirectionalZones<'a> {
    pub upstream: Option<&'a Polygon>,
    pub downstream: Option<&'a Polygon>,
}

impl DirectionalZones<'_> {
    pub fn is_empty(&self) -> bool {
        self.upstream.is_none() && self.downstream.is_none()
    }
}

/// Upstream wins when the bbox centre falls inside both zones.
pub fn classify_direction(detection: &Detection, zones: &DirectionalZones<'_>) -> Option<Direction> {
    let center = detection.bbox.center();
    if zones.upstream.is_some_and(|poly| is_inside(center, poly)) {
        return Some(Direction::Up);
    }
    if zones.downstream.is_some_and(|poly| is_inside(center, poly)) {
        return Some(Direction::Down);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn square() -> Polygon {
        Polygon::from_pairs(&[[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]).unwrap()
    }

    fn detection_at(cx: f32, cy: f32) -> Detection {
        Detection::new(
            Some(1),
            "car",
            0.9,
            BBox::new(cx - 2.0, cy - 2.0, cx + 2.0, cy + 2.0),
        )
    }

    #[test]
    fn interior_boundary_and_exterior_points() {
        let poly = square();
        assert!(is_inside(Point::new(5.0, 5.0), &poly));
        assert!(is_inside(Point::new(0.0, 5.0), &poly));
        assert!(is_inside(Point::new(10.0, 10.0), &poly));
        assert!(is_inside(Point::new(5.0, 0.0), &poly));
        assert!(!is_inside(Point::new(10.5, 5.0), &poly));
        assert!(!is_inside(Point::new(-0.1, -0.1), &poly));
    }

    #[test]
    fn concave_polygon_notch_is_outside() {
        // U shape opening upwards.
        let poly = Polygon::from_pairs(&[
            [0.0, 0.0],
            [3.0, 0.0],
            [3.0, 8.0],
            [7.0, 8.0],
            [7.0, 0.0],
            [10.0, 0.0],
            [10.0, 10.0],
            [0.0, 10.0],
        ])
        .unwrap();
        assert!(!is_inside(Point::new(5.0, 4.0), &poly));
        assert!(is_inside(Point::new(1.5, 4.0), &poly));
        assert!(is_inside(Point::new(5.0, 9.0), &poly));
    }

    #[test]
    fn degenerate_polygons_are_rejected() {
        assert!(Polygon::from_pairs(&[[0.0, 0.0], [1.0, 1.0]]).is_none());
        assert!(Polygon::from_pairs(&[]).is_none());
        assert!(Polygon::new(vec![
            Point::new(0.0, 0.0),
            Point::new(f32::NAN, 1.0),
            Point::new(1.0, 0.0)
        ])
        .is_err());
    }

    #[test]
    fn polygon_serializes_as_pairs() {
        let json = serde_json::to_string(&square()).unwrap();
        assert_eq!(json, "[[0.0,0.0],[10.0,0.0],[10.0,10.0],[0.0,10.0]]");
        let back: Polygon = serde_json::from_str(&json).unwrap();
        assert_eq!(back, square());
        assert!(serde_json::from_str::<Polygon>("[[0,0],[1,1]]").is_err());
    }

    #[test]
    fn upstream_takes_precedence_over_downstream() {
        let up = square();
        let down = Polygon::from_pairs(&[[5.0, 5.0], [20.0, 5.0], [20.0, 20.0], [5.0, 20.0]])
            .unwrap();
        let zones = DirectionalZones {
            upstream: Some(&up),
            downstream: Some(&down),
        };
        assert_eq!(
            classify_direction(&detection_at(7.0, 7.0), &zones),
            Some(Direction::Up)
        );
        assert_eq!(
            classify_direction(&detection_at(15.0, 15.0), &zones),
            Some(Direction::Down)
        );
        assert_eq!(classify_direction(&detection_at(30.0, 30.0), &zones), None);
    }

    #[test]
    fn no_zones_classifies_nothing() {
        let zones = DirectionalZones::default();
        assert!(zones.is_empty());
        assert_eq!(classify_direction(&detection_at(5.0, 5.0), &zones), None);
    }
}
