//! KeyFrame - a selected frame serving as a vertex of the map graph.
//!
//! A keyframe owns the immutable sensor state of the frame it was created
//! from (features, descriptors, BoW vector, intrinsics, scale pyramid) plus
//! the mutable graph state: pose, covisibility adjacency, spanning-tree
//! links, loop edges, and the per-feature map-point observation slots.
//!
//! Covisibility entries below [`MIN_COVISIBILITY_WEIGHT`] are kept in the raw
//! adjacency map but elided from the weight-sorted "best" view.

use std::collections::{HashMap, HashSet};

use crate::geometry::SE3;

use super::frame::{
    features_in_area, BowVector, CameraIntrinsics, Descriptor, Feature, Frame, ScalePyramid,
};
use super::types::{KeyFrameId, MapPointId};

/// Edges weaker than this are excluded from the ordered covisibility view.
pub const MIN_COVISIBILITY_WEIGHT: usize = 15;

/// A keyframe in the map.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    pub id: KeyFrameId,
    pub timestamp_ns: u64,

    pub intrinsics: CameraIntrinsics,
    pub pyramid: ScalePyramid,
    pub features: Vec<Feature>,
    pub descriptors: Vec<Descriptor>,
    pub bow: BowVector,
    /// Vocabulary word per feature; empty without vocabulary assignment.
    pub feature_words: Vec<u32>,

    /// World-to-camera pose.
    pub pose: SE3,

    /// Feature index → observed map point.
    map_points: Vec<Option<MapPointId>>,

    // Covisibility graph adjacency.
    covisibility_weights: HashMap<KeyFrameId, usize>,
    ordered_covisibles: Vec<(KeyFrameId, usize)>,
    covisibility_dirty: bool,

    // Spanning tree.
    pub parent: Option<KeyFrameId>,
    pub children: HashSet<KeyFrameId>,

    /// Loop-closure partners; both endpoints of a loop edge are pinned
    /// against culling.
    pub loop_edges: HashSet<KeyFrameId>,

    /// Pose relative to the parent, recorded at the moment of culling.
    pub tcp: Option<SE3>,

    pub bad: bool,
    /// Culling pin: while set, `bad` transitions are deferred.
    pub not_erase: bool,
    /// A cull arrived while pinned; committed when the pin is released.
    pub to_be_erased: bool,
}

impl KeyFrame {
    /// Build a keyframe from a tracker-delivered frame.
    pub fn from_frame(id: KeyFrameId, frame: Frame) -> Self {
        let num_features = frame.features.len();
        Self {
            id,
            timestamp_ns: frame.timestamp_ns,
            intrinsics: frame.intrinsics,
            pyramid: frame.pyramid,
            features: frame.features,
            descriptors: frame.descriptors,
            bow: frame.bow,
            feature_words: frame.feature_words,
            pose: frame.pose,
            map_points: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            ordered_covisibles: Vec::new(),
            covisibility_dirty: false,
            parent: None,
            children: HashSet::new(),
            loop_edges: HashSet::new(),
            tcp: None,
            bad: false,
            not_erase: false,
            to_be_erased: false,
        }
    }

    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Camera centre in world coordinates.
    pub fn camera_center(&self) -> nalgebra::Vector3<f64> {
        self.pose.camera_center()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map point observation slots
    // ─────────────────────────────────────────────────────────────────────────

    pub fn map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_points.get(feature_idx).copied().flatten()
    }

    /// Associate a feature slot with a map point, returning the previous
    /// occupant if any.
    pub fn set_map_point(&mut self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        if feature_idx >= self.map_points.len() {
            return None;
        }
        self.map_points[feature_idx].replace(mp_id)
    }

    pub fn clear_map_point(&mut self, feature_idx: usize) -> Option<MapPointId> {
        self.map_points.get_mut(feature_idx).and_then(|s| s.take())
    }

    /// All occupied slots as (feature index, map point id).
    pub fn observed_map_points(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_points
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.iter().filter(|mp| mp.is_some()).count()
    }

    /// Raw slot view, one entry per feature.
    pub fn map_point_slots(&self) -> &[Option<MapPointId>] {
        &self.map_points
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility graph
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_covisibility(&mut self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return;
        }
        self.covisibility_weights.insert(kf_id, weight);
        self.covisibility_dirty = true;
    }

    pub fn erase_covisibility(&mut self, kf_id: KeyFrameId) {
        if self.covisibility_weights.remove(&kf_id).is_some() {
            self.covisibility_dirty = true;
        }
    }

    pub fn covisibility_weight(&self, kf_id: KeyFrameId) -> usize {
        self.covisibility_weights.get(&kf_id).copied().unwrap_or(0)
    }

    /// All connected keyframes, regardless of weight.
    pub fn covisibles(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.covisibility_weights.keys().copied()
    }

    pub fn covisibility_weights(&self) -> &HashMap<KeyFrameId, usize> {
        &self.covisibility_weights
    }

    /// The `n` strongest covisible keyframes, weight >= the elision floor.
    pub fn best_covisibles(&mut self, n: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Covisible keyframes with at least `min_weight` shared points.
    pub fn covisibles_by_weight(&mut self, min_weight: usize) -> Vec<KeyFrameId> {
        self.ensure_ordered();
        self.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sorted (keyframe, weight) pairs above the elision floor, best first.
    pub fn ordered_covisibles(&mut self) -> Vec<(KeyFrameId, usize)> {
        self.ensure_ordered();
        self.ordered_covisibles.clone()
    }

    fn ensure_ordered(&mut self) {
        if !self.covisibility_dirty {
            return;
        }
        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .filter(|(_, &w)| w >= MIN_COVISIBILITY_WEIGHT)
            .map(|(&id, &w)| (id, w))
            .collect();
        // Weight descending; lower id wins ties so ordering is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning tree & loop edges
    // ─────────────────────────────────────────────────────────────────────────

    pub fn set_parent(&mut self, parent_id: KeyFrameId) {
        self.parent = Some(parent_id);
    }

    pub fn add_child(&mut self, child_id: KeyFrameId) {
        self.children.insert(child_id);
    }

    pub fn erase_child(&mut self, child_id: KeyFrameId) {
        self.children.remove(&child_id);
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn add_loop_edge(&mut self, kf_id: KeyFrameId) {
        self.loop_edges.insert(kf_id);
        // A loop endpoint must survive culling from now on.
        self.not_erase = true;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spatial queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Indices of features within `radius` pixels of (u, v).
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        features_in_area(&self.features, u, v, radius, min_level, max_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;

    fn keyframe(id: u64, num_features: usize) -> KeyFrame {
        KeyFrame::from_frame(KeyFrameId::new(id), frame_with_features(num_features))
    }

    #[test]
    fn test_map_point_slots() {
        let mut kf = keyframe(1, 10);

        kf.set_map_point(3, MapPointId::new(100));
        assert_eq!(kf.map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        let prev = kf.set_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));

        let cleared = kf.clear_map_point(3);
        assert_eq!(cleared, Some(MapPointId::new(200)));
        assert_eq!(kf.map_point(3), None);
    }

    #[test]
    fn test_covisibility_ordering_and_elision() {
        let mut kf = keyframe(1, 0);

        kf.set_covisibility(KeyFrameId::new(2), 50);
        kf.set_covisibility(KeyFrameId::new(3), 100);
        kf.set_covisibility(KeyFrameId::new(4), 5); // below the floor

        assert_eq!(kf.covisibility_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(9)), 0);

        let best = kf.best_covisibles(10);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);

        // The weak edge stays in the raw adjacency.
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(4)), 5);
        assert_eq!(kf.covisibles().count(), 3);

        let strong = kf.covisibles_by_weight(60);
        assert_eq!(strong, vec![KeyFrameId::new(3)]);
    }

    #[test]
    fn test_covisibility_tie_break_by_lower_id() {
        let mut kf = keyframe(1, 0);
        kf.set_covisibility(KeyFrameId::new(7), 30);
        kf.set_covisibility(KeyFrameId::new(3), 30);
        assert_eq!(
            kf.best_covisibles(2),
            vec![KeyFrameId::new(3), KeyFrameId::new(7)]
        );
    }

    #[test]
    fn test_no_self_connection() {
        let mut kf = keyframe(1, 0);
        kf.set_covisibility(KeyFrameId::new(1), 100);
        assert_eq!(kf.covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_loop_edge_pins_keyframe() {
        let mut kf = keyframe(1, 0);
        assert!(!kf.not_erase);
        kf.add_loop_edge(KeyFrameId::new(9));
        assert!(kf.not_erase);
        assert!(kf.loop_edges.contains(&KeyFrameId::new(9)));
    }

    #[test]
    fn test_spanning_tree_links() {
        let mut parent = keyframe(1, 0);
        let mut child = keyframe(2, 0);

        assert!(parent.is_root());
        child.set_parent(parent.id);
        parent.add_child(child.id);

        assert!(!child.is_root());
        assert_eq!(child.parent, Some(KeyFrameId::new(1)));
        assert!(parent.children.contains(&KeyFrameId::new(2)));
    }
}
