//! Descriptor matching between keyframes and against projected map points.
//!
//! Matching is BoW-guided where the tracker supplied per-feature vocabulary
//! words: only features assigned to the same word are compared, which keeps
//! the search close to linear. Without word assignments the search degrades
//! to exhaustive comparison with the same acceptance thresholds.

use std::collections::HashMap;

use nalgebra::{Matrix3, Vector3};

use crate::map::{KeyFrame, KeyFrameId, Map, MapPointId};

/// Strict Hamming acceptance threshold.
pub const TH_LOW: u32 = 50;
/// Relaxed Hamming acceptance threshold.
pub const TH_HIGH: u32 = 100;
/// Best-to-second-best distance ratio for ambiguous matches.
pub const NN_RATIO: f64 = 0.9;

/// A pair of matched feature indices (first keyframe, second keyframe).
pub type FeatureMatch = (usize, usize);

/// Match features between two keyframes by descriptor distance.
///
/// Only features whose slots are empty in *both* keyframes are considered
/// when `unmatched_only` is set (the triangulation case); otherwise features
/// carrying map points participate too (the Sim(3) case, where existing
/// associations are exactly what we want to align).
pub fn search_by_bow(
    kf1: &KeyFrame,
    kf2: &KeyFrame,
    unmatched_only: bool,
) -> Vec<FeatureMatch> {
    let candidates2 = word_buckets(kf2);

    let mut matches = Vec::new();
    let mut taken2: Vec<bool> = vec![false; kf2.num_features()];

    for idx1 in 0..kf1.num_features() {
        if unmatched_only && kf1.map_point(idx1).is_some() {
            continue;
        }
        let desc1 = match kf1.descriptors.get(idx1) {
            Some(d) => d,
            None => continue,
        };

        let search: Vec<usize> = match (&candidates2, kf1.feature_words.get(idx1)) {
            (Some(buckets), Some(word)) => {
                buckets.get(word).cloned().unwrap_or_default()
            }
            _ => (0..kf2.num_features()).collect(),
        };

        let mut best = (u32::MAX, usize::MAX);
        let mut second = u32::MAX;
        for idx2 in search {
            if taken2[idx2] || (unmatched_only && kf2.map_point(idx2).is_some()) {
                continue;
            }
            let dist = match kf2.descriptors.get(idx2) {
                Some(d) => desc1.distance(d),
                None => continue,
            };
            if dist < best.0 {
                second = best.0;
                best = (dist, idx2);
            } else if dist < second {
                second = dist;
            }
        }

        if best.0 <= TH_LOW && (second == u32::MAX || (best.0 as f64) < NN_RATIO * second as f64) {
            taken2[best.1] = true;
            matches.push((idx1, best.1));
        }
    }
    matches
}

/// Word → feature indices, or `None` if the keyframe has no word table.
fn word_buckets(kf: &KeyFrame) -> Option<HashMap<u32, Vec<usize>>> {
    if kf.feature_words.len() != kf.num_features() || kf.feature_words.is_empty() {
        return None;
    }
    let mut buckets: HashMap<u32, Vec<usize>> = HashMap::new();
    for (idx, &word) in kf.feature_words.iter().enumerate() {
        buckets.entry(word).or_default().push(idx);
    }
    Some(buckets)
}

/// Fundamental matrix F12 mapping points of `kf2` to epipolar lines in `kf1`.
pub fn fundamental_matrix(kf1: &KeyFrame, kf2: &KeyFrame) -> Matrix3<f64> {
    let r1 = kf1.pose.rotation_matrix();
    let r2 = kf2.pose.rotation_matrix();
    let t1 = kf1.pose.translation;
    let t2 = kf2.pose.translation;

    let r12 = r1 * r2.transpose();
    let t12 = -r12 * t2 + t1;

    let k1 = intrinsic_matrix(kf1);
    let k2 = intrinsic_matrix(kf2);

    k1.transpose()
        .try_inverse()
        .and_then(|k1_inv_t| k2.try_inverse().map(|k2_inv| k1_inv_t * skew(&t12) * r12 * k2_inv))
        .unwrap_or_else(Matrix3::zeros)
}

fn intrinsic_matrix(kf: &KeyFrame) -> Matrix3<f64> {
    let c = &kf.intrinsics;
    Matrix3::new(c.fx, 0.0, c.cx, 0.0, c.fy, c.cy, 0.0, 0.0, 1.0)
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Distance of feature `idx2` in `kf2` to the epipolar line of feature
/// `idx1` in `kf1`, tested against the level-scaled chi-square bound.
pub fn satisfies_epipolar(
    f12: &Matrix3<f64>,
    kf1: &KeyFrame,
    idx1: usize,
    kf2: &KeyFrame,
    idx2: usize,
) -> bool {
    let feat1 = &kf1.features[idx1];
    let feat2 = &kf2.features[idx2];

    // Epipolar line of x1 in image 2: l2 = F12^T x1.
    let x1 = Vector3::new(feat1.u, feat1.v, 1.0);
    let l2 = f12.transpose() * x1;

    let num = l2.x * feat2.u + l2.y * feat2.v + l2.z;
    let den_sq = l2.x * l2.x + l2.y * l2.y;
    if den_sq < 1e-12 {
        return false;
    }
    let dist_sq = num * num / den_sq;

    let sigma2 = kf2
        .pyramid
        .level_sigma2
        .get(feat2.octave.max(0) as usize)
        .copied()
        .unwrap_or(1.0);
    dist_sq < 3.84 * sigma2
}

/// Outcome of a [`fuse_into_keyframe`] sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseResult {
    /// Map points merged into an existing association.
    pub fused: usize,
    /// New observations added to empty slots.
    pub added: usize,
}

/// Project map points into a keyframe and reconcile with its features.
///
/// A projection landing on a feature that already carries a *different* map
/// point merges the two (the point with more observations survives); landing
/// on an empty feature adds an observation.
pub fn fuse_into_keyframe(
    map: &mut Map,
    kf_id: KeyFrameId,
    candidates: &[MapPointId],
    radius: f64,
) -> FuseResult {
    let mut result = FuseResult::default();

    for &mp_id in candidates {
        let mp_id = match map.resolve_map_point(mp_id) {
            Some(id) => id,
            None => continue,
        };

        // Project and select the best matching feature under the read view.
        let fuse_target = {
            let kf = match map.get_keyframe(kf_id) {
                Some(kf) => kf,
                None => return result,
            };
            let mp = match map.get_map_point(mp_id) {
                Some(mp) => mp,
                None => continue,
            };
            if mp.observed_by(kf_id) {
                continue;
            }

            let p_cam = kf.pose.transform_point(&mp.position);
            let (u, v) = match kf.intrinsics.project(&p_cam) {
                Some(uv) => uv,
                None => continue,
            };
            if !kf.intrinsics.in_image(u, v) {
                continue;
            }

            let dist = (mp.position - kf.camera_center()).norm();
            if !mp.is_in_distance_range(dist) {
                continue;
            }

            // Viewing angle within 60 degrees of the mean normal (cos 60° = 0.5).
            if mp.normal.norm() > 0.5 {
                let view_dir = (mp.position - kf.camera_center()).normalize();
                if view_dir.dot(&mp.normal) < 0.5 {
                    continue;
                }
            }

            let level = kf.pyramid.predict_level(mp.max_distance, dist);
            let search_radius = radius * kf.pyramid.scale_factors[level as usize];
            let nearby = kf.features_in_area(
                u,
                v,
                search_radius,
                Some(level - 1),
                Some(level + 1),
            );

            let mut best = (u32::MAX, usize::MAX);
            for idx in nearby {
                let d = kf.descriptors[idx].distance(&mp.descriptor);
                if d < best.0 {
                    best = (d, idx);
                }
            }
            if best.0 > TH_LOW {
                continue;
            }
            (best.1, kf.map_point(best.1))
        };

        match fuse_target {
            (_, Some(existing_id)) if existing_id != mp_id => {
                let existing_obs = map
                    .get_map_point(existing_id)
                    .map(|mp| mp.num_observations())
                    .unwrap_or(0);
                let candidate_obs = map
                    .get_map_point(mp_id)
                    .map(|mp| mp.num_observations())
                    .unwrap_or(0);
                // Keep the better-observed point.
                if existing_obs >= candidate_obs {
                    map.replace_map_point(mp_id, existing_id);
                } else {
                    map.replace_map_point(existing_id, mp_id);
                }
                result.fused += 1;
            }
            (idx, None) => {
                if map.associate(kf_id, idx, mp_id) {
                    result.added += 1;
                }
            }
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::{Descriptor, KeyFrame, MapPoint};
    use nalgebra::Vector3;

    fn keyframe(id: u64, n: usize) -> KeyFrame {
        KeyFrame::from_frame(KeyFrameId::new(id), frame_with_features(n))
    }

    #[test]
    fn test_search_by_bow_matches_identical_descriptors() {
        let kf1 = keyframe(0, 20);
        let kf2 = keyframe(1, 20);

        // Identical descriptor tables and word assignments: every feature
        // should pair with its counterpart.
        let matches = search_by_bow(&kf1, &kf2, true);
        assert_eq!(matches.len(), 20);
        assert!(matches.iter().all(|&(a, b)| a == b));
    }

    #[test]
    fn test_search_by_bow_skips_occupied_slots() {
        let kf1 = keyframe(0, 10);
        let mut kf2 = keyframe(1, 10);
        kf2.set_map_point(3, MapPointId::new(7));

        let matches = search_by_bow(&kf1, &kf2, true);
        assert!(matches.iter().all(|&(_, b)| b != 3));
    }

    #[test]
    fn test_epipolar_constraint_pure_translation() {
        // kf2 translated along x: epipolar lines are horizontal, so a
        // feature on the same row passes and one far off the row fails.
        let mut kf1 = keyframe(0, 3);
        let mut kf2 = keyframe(1, 3);
        kf1.pose = SE3::identity();
        kf2.pose = SE3::new(nalgebra::UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));

        kf1.features[0].u = 320.0;
        kf1.features[0].v = 240.0;
        kf2.features[1].u = 250.0;
        kf2.features[1].v = 240.0; // same row
        kf2.features[2].u = 250.0;
        kf2.features[2].v = 300.0; // far off the epipolar line

        let f12 = fundamental_matrix(&kf1, &kf2);
        assert!(satisfies_epipolar(&f12, &kf1, 0, &kf2, 1));
        assert!(!satisfies_epipolar(&f12, &kf1, 0, &kf2, 2));
    }

    #[test]
    fn test_fuse_adds_observation_on_empty_slot() {
        let mut map = Map::new();
        let mut kf = keyframe(0, 5);
        kf.features[0].u = 320.0;
        kf.features[0].v = 240.0;
        let kf_id = kf.id;
        map.insert_keyframe(kf);

        // A point straight ahead of the camera, descriptor identical to
        // feature 0's.
        let desc = map.get_keyframe(kf_id).unwrap().descriptors[0];
        let mut mp = MapPoint::new(MapPointId::new(100), Vector3::new(0.0, 0.0, 4.0), desc, kf_id);
        mp.max_distance = 100.0;
        let mp_id = mp.id;
        map.insert_map_point(mp);

        let result = fuse_into_keyframe(&mut map, kf_id, &[mp_id], 3.0);
        assert_eq!(result.added, 1);
        assert_eq!(map.get_keyframe(kf_id).unwrap().map_point(0), Some(mp_id));
    }

    #[test]
    fn test_fuse_merges_duplicate_points() {
        let mut map = Map::new();
        let mut kf1 = keyframe(0, 5);
        let mut kf2 = keyframe(1, 5);
        let mut kf3 = keyframe(2, 5);
        for kf in [&mut kf1, &mut kf2, &mut kf3] {
            kf.features[0].u = 320.0;
            kf.features[0].v = 240.0;
        }
        let (id1, id2, id3) = (kf1.id, kf2.id, kf3.id);
        map.insert_keyframe(kf1);
        map.insert_keyframe(kf2);
        map.insert_keyframe(kf3);

        let desc = map.get_keyframe(id1).unwrap().descriptors[0];
        let mut winner = MapPoint::new(MapPointId::new(100), Vector3::new(0.0, 0.0, 4.0), desc, id1);
        winner.max_distance = 100.0;
        let mut loser = MapPoint::new(MapPointId::new(101), Vector3::new(0.0, 0.0, 4.0), desc, id2);
        loser.max_distance = 100.0;
        let (winner_id, loser_id) = (winner.id, loser.id);
        map.insert_map_point(winner);
        map.insert_map_point(loser);

        // winner has two observations, loser one; kf3's slot 0 carries loser.
        map.associate(id1, 0, winner_id);
        map.associate(id2, 0, winner_id);
        map.associate(id3, 0, loser_id);

        let result = fuse_into_keyframe(&mut map, id3, &[winner_id], 3.0);
        assert_eq!(result.fused, 1);
        assert!(map.get_map_point(loser_id).is_none());
        assert_eq!(map.resolve_map_point(loser_id), Some(winner_id));
        assert_eq!(map.get_keyframe(id3).unwrap().map_point(0), Some(winner_id));
    }
}
