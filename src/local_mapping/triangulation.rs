//! New map point creation by epipolar search and triangulation.
//!
//! For each strong covisible neighbour of the freshly-inserted keyframe,
//! unmatched features are paired by BoW-guided descriptor search, filtered
//! by the epipolar constraint, and triangulated. A candidate point must pass
//! depth, reprojection, parallax, and scale-consistency checks in both views
//! before it enters the map.

use nalgebra::{Matrix4, Vector3};
use tracing::debug;

use crate::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};
use crate::matching::{fundamental_matrix, satisfies_epipolar, search_by_bow};
use crate::optimizer::ba::{CHI2_MONO, CHI2_STEREO};

#[derive(Debug, Clone)]
pub struct TriangulationConfig {
    /// Rays closer to parallel than this cosine carry no depth information.
    pub max_parallax_cos: f64,
    /// Tolerance factor for the distance-ratio/scale-ratio consistency test.
    pub scale_consistency_factor: f64,
    /// Minimum camera baseline, as a fraction of the median scene depth.
    pub min_baseline_depth_ratio: f64,
}

impl Default for TriangulationConfig {
    fn default() -> Self {
        Self {
            max_parallax_cos: 0.9998,
            scale_consistency_factor: 1.5,
            min_baseline_depth_ratio: 0.01,
        }
    }
}

/// Triangulate new map points between `kf_id` and each of `neighbours`.
///
/// Created points draw ids from `next_id`, advancing by `id_span` (the
/// stream reserved for local mapping). Returns the created ids.
pub fn create_new_map_points(
    map: &mut Map,
    kf_id: KeyFrameId,
    neighbours: &[KeyFrameId],
    next_id: &mut u64,
    id_span: u64,
    config: &TriangulationConfig,
) -> Vec<MapPointId> {
    let mut created = Vec::new();

    for &other_id in neighbours {
        // Pair selection under an immutable view.
        let pairs: Vec<(usize, usize)> = {
            let (kf1, kf2) = match (map.get_keyframe(kf_id), map.get_keyframe(other_id)) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };

            let baseline = (kf1.camera_center() - kf2.camera_center()).norm();
            let depth = median_scene_depth(map, kf2);
            if depth > 0.0 && baseline / depth < config.min_baseline_depth_ratio {
                continue;
            }

            let f12 = fundamental_matrix(kf1, kf2);
            search_by_bow(kf1, kf2, true)
                .into_iter()
                .filter(|&(i1, i2)| satisfies_epipolar(&f12, kf1, i1, kf2, i2))
                .collect()
        };

        for (idx1, idx2) in pairs {
            let candidate = {
                let (kf1, kf2) = match (map.get_keyframe(kf_id), map.get_keyframe(other_id)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => break,
                };
                triangulate_pair(kf1, idx1, kf2, idx2, config)
            };
            let position = match candidate {
                Some(p) => p,
                None => continue,
            };

            let descriptor = match map
                .get_keyframe(kf_id)
                .and_then(|kf| kf.descriptors.get(idx1).copied())
            {
                Some(d) => d,
                None => continue,
            };

            let id = MapPointId::new(*next_id);
            *next_id += id_span;

            let mp = MapPoint::new(id, position, descriptor, kf_id);
            if !map.insert_map_point(mp) {
                continue;
            }
            map.associate(kf_id, idx1, id);
            map.associate(other_id, idx2, id);
            map.update_map_point_geometry(id);
            map.update_map_point_descriptor(id);
            created.push(id);
        }
    }

    if !created.is_empty() {
        debug!(kf = %kf_id, count = created.len(), "triangulated new map points");
    }
    created
}

/// Median depth of the map points observed by a keyframe, in its own frame.
fn median_scene_depth(map: &Map, kf: &KeyFrame) -> f64 {
    let mut depths: Vec<f64> = kf
        .observed_map_points()
        .filter_map(|(_, mp_id)| {
            map.resolve_map_point(mp_id)
                .and_then(|id| map.get_map_point(id))
                .map(|mp| kf.pose.transform_point(&mp.position).z)
        })
        .filter(|&z| z > 0.0)
        .collect();
    if depths.is_empty() {
        return 0.0;
    }
    depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    depths[depths.len() / 2]
}

/// DLT triangulation of one feature pair with full acceptance checks.
fn triangulate_pair(
    kf1: &KeyFrame,
    idx1: usize,
    kf2: &KeyFrame,
    idx2: usize,
    config: &TriangulationConfig,
) -> Option<Vector3<f64>> {
    let feat1 = &kf1.features[idx1];
    let feat2 = &kf2.features[idx2];

    // Normalised image coordinates.
    let xn1 = Vector3::new(
        (feat1.u - kf1.intrinsics.cx) / kf1.intrinsics.fx,
        (feat1.v - kf1.intrinsics.cy) / kf1.intrinsics.fy,
        1.0,
    );
    let xn2 = Vector3::new(
        (feat2.u - kf2.intrinsics.cx) / kf2.intrinsics.fx,
        (feat2.v - kf2.intrinsics.cy) / kf2.intrinsics.fy,
        1.0,
    );

    // Parallax between the viewing rays in world coordinates.
    let ray1 = kf1.pose.rotation.inverse() * xn1;
    let ray2 = kf2.pose.rotation.inverse() * xn2;
    let cos_parallax = ray1.dot(&ray2) / (ray1.norm() * ray2.norm());
    if cos_parallax <= 0.0 || cos_parallax >= config.max_parallax_cos {
        return None;
    }

    // DLT on the two projection rows of each camera.
    let t1 = pose_matrix_3x4(kf1);
    let t2 = pose_matrix_3x4(kf2);
    let mut a = Matrix4::zeros();
    a.set_row(0, &(xn1.x * t1.row(2) - t1.row(0)));
    a.set_row(1, &(xn1.y * t1.row(2) - t1.row(1)));
    a.set_row(2, &(xn2.x * t2.row(2) - t2.row(0)));
    a.set_row(3, &(xn2.y * t2.row(2) - t2.row(1)));

    let svd = a.svd(true, true);
    let v_t = svd.v_t?;
    let h = v_t.row(3);
    if h[3].abs() < 1e-12 {
        return None;
    }
    let position = Vector3::new(h[0] / h[3], h[1] / h[3], h[2] / h[3]);
    if !position.iter().all(|c| c.is_finite()) {
        return None;
    }

    // Positive depth in both cameras.
    let p1 = kf1.pose.transform_point(&position);
    let p2 = kf2.pose.transform_point(&position);
    if p1.z <= 0.0 || p2.z <= 0.0 {
        return None;
    }

    // Reprojection error against the level-scaled chi-square bound.
    for (kf, feat, p_cam) in [(kf1, feat1, &p1), (kf2, feat2, &p2)] {
        let (u, v) = kf.intrinsics.project(p_cam)?;
        let err = (u - feat.u).powi(2) + (v - feat.v).powi(2);
        let sigma2 = kf
            .pyramid
            .level_sigma2
            .get(feat.octave.max(0) as usize)
            .copied()
            .unwrap_or(1.0);
        let threshold = if feat.has_depth() {
            CHI2_STEREO
        } else {
            CHI2_MONO
        };
        if err > threshold * sigma2 {
            return None;
        }
    }

    // Scale consistency: the distance ratio must agree with the octave
    // scale ratio within the tolerance factor.
    let dist1 = (position - kf1.camera_center()).norm();
    let dist2 = (position - kf2.camera_center()).norm();
    if dist1 <= 0.0 || dist2 <= 0.0 {
        return None;
    }
    let ratio_dist = dist2 / dist1;
    let scale1 = kf1
        .pyramid
        .scale_factors
        .get(feat1.octave.max(0) as usize)
        .copied()
        .unwrap_or(1.0);
    let scale2 = kf2
        .pyramid
        .scale_factors
        .get(feat2.octave.max(0) as usize)
        .copied()
        .unwrap_or(1.0);
    let ratio_octave = scale1 / scale2;
    let factor = config.scale_consistency_factor * kf1.pyramid.scale_factor;
    if ratio_dist * factor < ratio_octave || ratio_dist > ratio_octave * factor {
        return None;
    }

    Some(position)
}

fn pose_matrix_3x4(kf: &KeyFrame) -> nalgebra::Matrix3x4<f64> {
    let mut t = nalgebra::Matrix3x4::zeros();
    t.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&kf.pose.rotation_matrix());
    t.fixed_view_mut::<3, 1>(0, 3).copy_from(&kf.pose.translation);
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::KeyFrame;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// Two keyframes half a metre apart, both observing the same 3D points
    /// with consistent feature positions and identical descriptors.
    fn stereo_rig(points: &[Vector3<f64>]) -> (KeyFrame, KeyFrame) {
        let mut kf1 = KeyFrame::from_frame(
            KeyFrameId::new(0),
            frame_with_features(points.len()),
        );
        let mut kf2 = KeyFrame::from_frame(
            KeyFrameId::new(1),
            frame_with_features(points.len()),
        );
        kf1.pose = SE3::identity();
        kf2.pose = SE3::new(UnitQuaternion::identity(), Vector3::new(-0.5, 0.0, 0.0));

        for (i, p) in points.iter().enumerate() {
            let p1 = kf1.pose.transform_point(p);
            let (u1, v1) = kf1.intrinsics.project(&p1).unwrap();
            kf1.features[i].u = u1;
            kf1.features[i].v = v1;

            let p2 = kf2.pose.transform_point(p);
            let (u2, v2) = kf2.intrinsics.project(&p2).unwrap();
            kf2.features[i].u = u2;
            kf2.features[i].v = v2;
        }
        (kf1, kf2)
    }

    #[test]
    fn test_triangulate_recovers_position() {
        let truth = Vector3::new(0.2, -0.1, 4.0);
        let (kf1, kf2) = stereo_rig(&[truth]);
        let config = TriangulationConfig::default();

        let position = triangulate_pair(&kf1, 0, &kf2, 0, &config).unwrap();
        assert_relative_eq!(position, truth, epsilon = 1e-6);
    }

    #[test]
    fn test_rejects_point_behind_cameras() {
        let truth = Vector3::new(0.2, -0.1, 4.0);
        let (mut kf1, kf2) = stereo_rig(&[truth]);
        // Flip the first camera around so the point sits behind it.
        kf1.pose = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, std::f64::consts::PI, 0.0),
            Vector3::new(0.0, 0.0, -8.0),
        );
        let config = TriangulationConfig::default();
        assert!(triangulate_pair(&kf1, 0, &kf2, 0, &config).is_none());
    }

    #[test]
    fn test_rejects_degenerate_parallax() {
        let truth = Vector3::new(0.0, 0.0, 4.0);
        let (kf1, mut kf2) = stereo_rig(&[truth]);
        // Co-located cameras: zero parallax.
        kf2.pose = kf1.pose.clone();
        let (u, v) = kf2
            .intrinsics
            .project(&kf2.pose.transform_point(&truth))
            .unwrap();
        kf2.features[0].u = u;
        kf2.features[0].v = v;

        let config = TriangulationConfig::default();
        assert!(triangulate_pair(&kf1, 0, &kf2, 0, &config).is_none());
    }

    #[test]
    fn test_create_new_map_points_end_to_end() {
        let points: Vec<Vector3<f64>> = (0..8)
            .map(|i| Vector3::new(-0.4 + 0.12 * i as f64, 0.1 * (i % 3) as f64, 4.0))
            .collect();
        let (kf1, kf2) = stereo_rig(&points);

        let mut map = Map::new();
        let (id1, id2) = (kf1.id, kf2.id);
        map.insert_keyframe(kf1);
        map.insert_keyframe(kf2);

        let mut next_id = 2u64;
        let created = create_new_map_points(
            &mut map,
            id1,
            &[id2],
            &mut next_id,
            3,
            &TriangulationConfig::default(),
        );

        assert_eq!(created.len(), points.len());
        // Ids come from the reserved stream: 2, 5, 8, ...
        assert_eq!(created[0], MapPointId::new(2));
        assert_eq!(created[1], MapPointId::new(5));

        // Both keyframes observe every created point.
        for &mp_id in &created {
            let mp = map.get_map_point(mp_id).unwrap();
            assert!(mp.observed_by(id1));
            assert!(mp.observed_by(id2));
        }
        // And the pair is now strongly covisible.
        assert_eq!(
            map.get_keyframe(id1).unwrap().covisibility_weight(id2),
            points.len()
        );
    }
}
