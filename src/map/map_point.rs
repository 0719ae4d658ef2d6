//! MapPoint - a 3D landmark observed by keyframes.
//!
//! A map point that loses out during fusion is not destroyed immediately: it
//! becomes a tombstone carrying a `replaced_by` forwarding id, so in-flight
//! readers holding the old id still resolve to the surviving point.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::frame::Descriptor;
use super::types::{KeyFrameId, MapPointId};

/// A 3D map point.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Position in world coordinates.
    pub position: Vector3<f64>,

    /// Mean viewing direction over all observations (unit vector).
    pub normal: Vector3<f64>,

    /// Representative descriptor, the one with minimum median distance to
    /// all other observations.
    pub descriptor: Descriptor,

    /// Scale-invariance bounds on the viewing distance.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Keyframe the point was created from.
    pub reference_kf: KeyFrameId,

    /// Observing keyframe → feature index in that keyframe.
    pub observations: HashMap<KeyFrameId, usize>,

    /// Times the point fell inside a tracking frustum.
    pub visible_count: u32,
    /// Times the point was actually matched by a tracker.
    pub found_count: u32,

    pub bad: bool,
    /// Forwarding pointer installed when this point was merged into another.
    pub replaced_by: Option<MapPointId>,
}

impl MapPoint {
    pub fn new(
        id: MapPointId,
        position: Vector3<f64>,
        descriptor: Descriptor,
        reference_kf: KeyFrameId,
    ) -> Self {
        Self {
            id,
            position,
            normal: Vector3::zeros(),
            descriptor,
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            reference_kf,
            observations: HashMap::new(),
            visible_count: 1,
            found_count: 1,
            bad: false,
            replaced_by: None,
        }
    }

    pub fn add_observation(&mut self, kf_id: KeyFrameId, feature_idx: usize) {
        self.observations.entry(kf_id).or_insert(feature_idx);
    }

    /// Returns true if the observation existed.
    pub fn erase_observation(&mut self, kf_id: KeyFrameId) -> bool {
        let removed = self.observations.remove(&kf_id).is_some();
        if removed && self.reference_kf == kf_id {
            // Deterministic replacement reference: the lowest-id observer.
            if let Some(&new_ref) = self.observations.keys().min() {
                self.reference_kf = new_ref;
            }
        }
        removed
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn observed_by(&self, kf_id: KeyFrameId) -> bool {
        self.observations.contains_key(&kf_id)
    }

    pub fn increase_visible(&mut self, n: u32) {
        self.visible_count += n;
    }

    pub fn increase_found(&mut self, n: u32) {
        self.found_count += n;
    }

    /// found/visible ratio; new points with no visibility yet score 1.0.
    pub fn found_ratio(&self) -> f64 {
        if self.visible_count == 0 {
            1.0
        } else {
            self.found_count as f64 / self.visible_count as f64
        }
    }

    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        distance >= self.min_distance && distance <= self.max_distance
    }

    /// Recompute the mean viewing normal and the scale-invariance distance
    /// bounds from the observing camera centres.
    ///
    /// `ref_distance_level` is the pyramid level of the reference
    /// observation; the bounds stretch over the pyramid's scale range.
    pub fn update_normal_and_depth<'a>(
        &mut self,
        observer_centers: impl Iterator<Item = (KeyFrameId, Vector3<f64>)>,
        ref_center: &Vector3<f64>,
        ref_distance_level: i32,
        scale_factor: f64,
        n_levels: u32,
    ) {
        let mut normal_sum = Vector3::zeros();
        let mut count = 0usize;
        for (_, center) in observer_centers {
            let dir = self.position - center;
            let norm = dir.norm();
            if norm > 1e-10 {
                normal_sum += dir / norm;
                count += 1;
            }
        }
        if count > 0 {
            let norm = normal_sum.norm();
            if norm > 1e-10 {
                self.normal = normal_sum / norm;
            }
        }

        let dist = (self.position - ref_center).norm();
        let level_factor = scale_factor.powi(ref_distance_level);
        self.max_distance = dist * level_factor;
        self.min_distance = self.max_distance / scale_factor.powi(n_levels as i32 - 1);
    }
}
