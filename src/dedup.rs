//! First-sighting-wins deduplication of track ids per travel direction.

use std::collections::HashSet;

use crate::detect::Detection;
use crate::geometry::Direction;
use crate::CameraId;

/// Session-scoped record of which tracks were already reported per direction.
#[derive(Clone, Debug)]
pub struct DirectionDedupState {
    camera_id: CameraId,
    seen_upstream: HashSet<i64>,
    seen_downstream: HashSet<i64>,
}

impl DirectionDedupState {
    pub fn new(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            seen_upstream: HashSet::new(),
            seen_downstream: HashSet::new(),
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// Returns false when this detection's track was already reported in
    /// its direction. Detections without a direction or a track id always
    /// pass.
    pub fn admit(&mut self, detection: &Detection) -> bool {
        let (Some(direction), Some(track_id)) = (detection.direction, detection.track_id) else {
            return true;
        };
        let seen = match direction {
            Direction::Up => &mut self.seen_upstream,
            Direction::Down => &mut self.seen_downstream,
        };
        seen.insert(track_id)
    }

    pub fn filter(&mut self, detections: Vec<Detection>) -> Vec<Detection> {
        detections.into_iter().filter(|d| self.admit(d)).collect()
    }

    pub fn seen(&self, direction: Direction) -> usize {
        match direction {
            Direction::Up => self.seen_upstream.len(),
            Direction::Down => self.seen_downstream.len(),
        }
    }

    pub fn reset(&mut self) {
        self.seen_upstream.clear();
        self.seen_downstream.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn det(track: Option<i64>, direction: Option<Direction>) -> Detection {
        Detection::new(track, "car", 0.9, BBox::new(0.0, 0.0, 2.0, 2.0)).with_direction(direction)
    }

    #[test]
    fn repeated_track_in_same_direction_is_dropped() {
        let mut state = DirectionDedupState::new(1);
        let first = state.filter(vec![
            det(Some(7), Some(Direction::Up)),
            det(Some(9), Some(Direction::Up)),
        ]);
        assert_eq!(first.len(), 2);
        let second = state.filter(vec![det(Some(7), Some(Direction::Up))]);
        assert!(second.is_empty());
    }

    #[test]
    fn directions_are_tracked_independently() {
        let mut state = DirectionDedupState::new(1);
        assert!(state.admit(&det(Some(7), Some(Direction::Up))));
        assert!(state.admit(&det(Some(7), Some(Direction::Down))));
        assert!(!state.admit(&det(Some(7), Some(Direction::Down))));
        assert_eq!(state.seen(Direction::Up), 1);
        assert_eq!(state.seen(Direction::Down), 1);
    }

    #[test]
    fn untracked_or_undirected_always_pass() {
        let mut state = DirectionDedupState::new(1);
        for _ in 0..3 {
            assert!(state.admit(&det(None, Some(Direction::Up))));
            assert!(state.admit(&det(Some(4), None)));
        }
    }

    #[test]
    fn reset_forgets_everything() {
        let mut state = DirectionDedupState::new(1);
        assert!(state.admit(&det(Some(7), Some(Direction::Up))));
        state.reset();
        assert!(state.admit(&det(Some(7), Some(Direction::Up))));
    }
}
