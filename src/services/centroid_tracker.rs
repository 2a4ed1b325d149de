//! Centroid tracker: stable identities for detections across frames
//!
//! Each update matches the new centroid set against the objects already
//! being tracked by repeatedly binding the globally closest remaining
//! (object, centroid) pair. Unmatched objects accumulate misses and are
//! dropped once they exceed the disappearance tolerance; unmatched
//! centroids become new objects. IDs are never reused.

use crate::domain::types::{Centroid, ObjectId};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::trace;

/// Ordered id -> centroid view of everything still being tracked
pub type ObjectMap = BTreeMap<ObjectId, Centroid>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackError {
    #[error("centroid {index} is not finite ({x}, {y})")]
    NonFiniteCentroid { index: usize, x: f32, y: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: ObjectId,
    pub centroid: Centroid,
    /// Consecutive updates without a match
    pub disappeared: u32,
}

#[derive(Debug, Clone)]
pub struct CentroidTracker {
    next_id: u64,
    /// Kept sorted by id (ids are handed out in increasing order)
    objects: Vec<TrackedObject>,
    max_disappeared: u32,
}

impl CentroidTracker {
    pub fn new(max_disappeared: u32) -> Self {
        Self { next_id: 0, objects: Vec::new(), max_disappeared }
    }

    pub fn max_disappeared(&self) -> u32 {
        self.max_disappeared
    }

    /// Objects that are active or missing but not yet removed
    pub fn objects(&self) -> &[TrackedObject] {
        &self.objects
    }

    pub fn get(&self, id: ObjectId) -> Option<&TrackedObject> {
        self.objects.iter().find(|o| o.id == id)
    }

    /// Id the next registered object will receive
    pub fn next_id(&self) -> ObjectId {
        ObjectId(self.next_id)
    }

    /// Feed one frame's centroids and return the surviving objects.
    ///
    /// Input is validated before any state changes, so an error leaves the
    /// tracker exactly as it was.
    pub fn update(&mut self, centroids: &[Centroid]) -> Result<ObjectMap, TrackError> {
        if let Some((index, c)) = centroids.iter().enumerate().find(|(_, c)| !c.is_finite()) {
            return Err(TrackError::NonFiniteCentroid { index, x: c.x, y: c.y });
        }

        if self.objects.is_empty() {
            for &c in centroids {
                self.register(c);
            }
            return Ok(self.snapshot());
        }

        let mut pairs: Vec<(f32, usize, usize)> =
            Vec::with_capacity(self.objects.len() * centroids.len());
        for (row, object) in self.objects.iter().enumerate() {
            for (col, c) in centroids.iter().enumerate() {
                pairs.push((object.centroid.distance(c), row, col));
            }
        }
        // Stable sort keeps (row, col) order for equal distances
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

        let mut row_used = vec![false; self.objects.len()];
        let mut col_used = vec![false; centroids.len()];
        let mut remaining = self.objects.len().min(centroids.len());

        for (_, row, col) in pairs {
            if remaining == 0 {
                break;
            }
            if row_used[row] || col_used[col] {
                continue;
            }
            row_used[row] = true;
            col_used[col] = true;
            remaining -= 1;

            let object = &mut self.objects[row];
            object.centroid = centroids[col];
            object.disappeared = 0;
        }

        let max_disappeared = self.max_disappeared;
        let mut row = 0;
        self.objects.retain_mut(|object| {
            let matched = row_used[row];
            row += 1;
            if matched {
                return true;
            }
            object.disappeared += 1;
            if object.disappeared > max_disappeared {
                trace!(object_id = %object.id, "tracked_object_removed");
                return false;
            }
            true
        });

        for (col, &c) in centroids.iter().enumerate() {
            if !col_used[col] {
                self.register(c);
            }
        }

        Ok(self.snapshot())
    }

    fn register(&mut self, centroid: Centroid) {
        let id = ObjectId(self.next_id);
        self.next_id += 1;
        trace!(object_id = %id, x = %centroid.x, y = %centroid.y, "tracked_object_registered");
        self.objects.push(TrackedObject { id, centroid, disappeared: 0 });
    }

    fn snapshot(&self) -> ObjectMap {
        self.objects.iter().map(|o| (o.id, o.centroid)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f32, y: f32) -> Centroid {
        Centroid::new(x, y)
    }

    fn ids(map: &ObjectMap) -> Vec<u64> {
        map.keys().map(|id| id.0).collect()
    }

    #[test]
    fn test_first_update_registers_everything() {
        let mut tracker = CentroidTracker::new(3);
        let out = tracker.update(&[c(10.0, 10.0), c(300.0, 200.0)]).unwrap();
        assert_eq!(ids(&out), vec![0, 1]);
        assert_eq!(out[&ObjectId(1)], c(300.0, 200.0));
    }

    #[test]
    fn test_nearest_pairs_keep_identity() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(100.0, 100.0), c(500.0, 100.0)]).unwrap();

        // Reversed input order, small movement
        let out = tracker.update(&[c(505.0, 102.0), c(98.0, 101.0)]).unwrap();
        assert_eq!(out[&ObjectId(0)], c(98.0, 101.0));
        assert_eq!(out[&ObjectId(1)], c(505.0, 102.0));
        assert_eq!(tracker.next_id(), ObjectId(2));
    }

    #[test]
    fn test_global_greedy_prefers_smallest_distance() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(0.0, 0.0), c(10.0, 0.0)]).unwrap();

        // Both objects are closest to x=9, but object 1 is closer; object 0
        // must take the remaining centroid.
        let out = tracker.update(&[c(9.0, 0.0), c(-20.0, 0.0)]).unwrap();
        assert_eq!(out[&ObjectId(1)], c(9.0, 0.0));
        assert_eq!(out[&ObjectId(0)], c(-20.0, 0.0));
    }

    #[test]
    fn test_removed_exactly_after_tolerance_plus_one_misses() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(50.0, 50.0)]).unwrap();

        for miss in 1..=3 {
            let out = tracker.update(&[]).unwrap();
            assert!(out.contains_key(&ObjectId(0)), "still present after {miss} misses");
            assert_eq!(tracker.get(ObjectId(0)).unwrap().disappeared, miss);
        }
        let out = tracker.update(&[]).unwrap();
        assert!(out.is_empty());
        assert!(tracker.objects().is_empty());
    }

    #[test]
    fn test_match_resets_missed_counter() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(50.0, 50.0)]).unwrap();
        tracker.update(&[]).unwrap();
        tracker.update(&[]).unwrap();
        tracker.update(&[c(52.0, 49.0)]).unwrap();
        assert_eq!(tracker.get(ObjectId(0)).unwrap().disappeared, 0);
    }

    #[test]
    fn test_ids_never_reused() {
        let mut tracker = CentroidTracker::new(0);
        tracker.update(&[c(1.0, 1.0)]).unwrap();
        // Tolerance 0: the first miss removes the object
        assert!(tracker.update(&[]).unwrap().is_empty());
        let out = tracker.update(&[c(1.0, 1.0)]).unwrap();
        assert_eq!(ids(&out), vec![1]);
    }

    #[test]
    fn test_extra_centroids_become_new_objects() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(100.0, 100.0)]).unwrap();
        let out = tracker.update(&[c(400.0, 100.0), c(101.0, 100.0), c(600.0, 10.0)]).unwrap();
        assert_eq!(ids(&out), vec![0, 1, 2]);
        assert_eq!(out[&ObjectId(0)], c(101.0, 100.0));
    }

    #[test]
    fn test_matching_is_a_bijection() {
        let mut tracker = CentroidTracker::new(5);
        tracker.update(&[c(0.0, 0.0), c(1.0, 0.0), c(2.0, 0.0)]).unwrap();
        let out = tracker.update(&[c(1.0, 0.0), c(1.5, 0.0)]).unwrap();

        // Two centroids bound to two distinct objects, third object missing
        let matched: Vec<_> =
            tracker.objects().iter().filter(|o| o.disappeared == 0).map(|o| o.id).collect();
        assert_eq!(matched.len(), 2);
        assert_eq!(out.len(), 3);
        let mut positions: Vec<f32> = matched.iter().map(|id| out[id].x).collect();
        positions.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(positions, vec![1.0, 1.5]);
    }

    #[test]
    fn test_non_finite_input_leaves_state_untouched() {
        let mut tracker = CentroidTracker::new(3);
        tracker.update(&[c(10.0, 10.0)]).unwrap();
        let before = tracker.objects().to_vec();

        let err = tracker.update(&[c(11.0, 10.0), c(f32::NAN, 1.0)]).unwrap_err();
        assert!(matches!(err, TrackError::NonFiniteCentroid { index: 1, .. }));
        assert_eq!(tracker.objects(), before.as_slice());
        assert_eq!(tracker.next_id(), ObjectId(1));
    }
}
