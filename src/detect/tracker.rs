//! Greedy IoU tracker giving detections a stable id across frames.

use crate::detect::result::{BBox, RawDetection};

const DEFAULT_MATCH_IOU: f32 = 0.3;
const DEFAULT_MAX_MISSES: u32 = 30;

#[derive(Clone, Debug)]
struct Track {
    id: i64,
    label: String,
    bbox: BBox,
    misses: u32,
}

/// Per-stream track table. Owned by one session, never shared.
#[derive(Clone, Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: i64,
    match_iou: f32,
    max_misses: u32,
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_IOU, DEFAULT_MAX_MISSES)
    }
}

impl IouTracker {
    pub fn new(match_iou: f32, max_misses: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            match_iou,
            max_misses,
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
    }

    /// Assign track ids in place. Detections are matched greedily by
    /// descending IoU against live tracks with the same label; unmatched
    /// detections open new tracks and unmatched tracks age out after
    /// `max_misses` frames.
    pub fn update(&mut self, detections: &mut [RawDetection]) {
        let mut pairs = Vec::new();
        for (di, det) in detections.iter().enumerate() {
            for (ti, track) in self.tracks.iter().enumerate() {
                if track.label != det.label {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.match_iou {
                    pairs.push((iou, di, ti));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut det_taken = vec![false; detections.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, di, ti) in pairs {
            if det_taken[di] || track_taken[ti] {
                continue;
            }
            det_taken[di] = true;
            track_taken[ti] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.misses = 0;
            detections[di].track_id = Some(track.id);
        }

        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !track_taken[ti] {
                track.misses += 1;
            }
        }
        let max_misses = self.max_misses;
        self.tracks.retain(|t| t.misses <= max_misses);

        for (di, det) in detections.iter_mut().enumerate() {
            if det_taken[di] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                label: det.label.clone(),
                bbox: det.bbox,
                misses: 0,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(label: &str, x: f32) -> RawDetection {
        RawDetection {
            label: label.to_string(),
            confidence: 0.9,
            bbox: BBox::new(x, 0.0, x + 10.0, 10.0),
            track_id: None,
        }
    }

    #[test]
    fn overlapping_boxes_keep_their_id() {
        let mut tracker = IouTracker::default();
        let mut first = vec![raw("car", 0.0), raw("bus", 100.0)];
        tracker.update(&mut first);
        assert_eq!(first[0].track_id, Some(1));
        assert_eq!(first[1].track_id, Some(2));

        let mut second = vec![raw("bus", 102.0), raw("car", 1.0)];
        tracker.update(&mut second);
        assert_eq!(second[0].track_id, Some(2));
        assert_eq!(second[1].track_id, Some(1));
    }

    #[test]
    fn label_change_opens_a_new_track() {
        let mut tracker = IouTracker::default();
        let mut first = vec![raw("car", 0.0)];
        tracker.update(&mut first);
        let mut second = vec![raw("truck", 0.0)];
        tracker.update(&mut second);
        assert_eq!(second[0].track_id, Some(2));
    }

    #[test]
    fn stale_tracks_expire() {
        let mut tracker = IouTracker::new(0.3, 2);
        tracker.update(&mut [raw("car", 0.0)]);
        for _ in 0..3 {
            tracker.update(&mut []);
        }
        assert_eq!(tracker.active_tracks(), 0);
        let mut again = vec![raw("car", 0.0)];
        tracker.update(&mut again);
        assert_eq!(again[0].track_id, Some(2));
    }
}
