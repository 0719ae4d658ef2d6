//! Bundle adjustment problem construction and the shared solver.
//!
//! The solver is a fixed-purpose Gauss-Newton alternation: point positions
//! are refined against held poses, then free poses against held points, with
//! outlier observations (chi-square above the per-sensor threshold) dropped
//! between iterations. Both local and global BA run through it; they differ
//! only in how the problem is collected.

use std::collections::{HashMap, HashSet};

use nalgebra::{Matrix2x3, Matrix2x6, Matrix3, Matrix6, Vector2, Vector3, Vector6};
use tracing::trace;

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId, MIN_COVISIBILITY_WEIGHT};

/// Chi-square thresholds at 95% for 2 DoF (monocular) and 3 DoF (stereo).
pub const CHI2_MONO: f64 = 5.991;
pub const CHI2_STEREO: f64 = 7.815;

#[derive(Debug, Clone)]
pub struct BAConfig {
    pub max_iterations: usize,
    pub chi2_mono: f64,
    pub chi2_stereo: f64,
    /// Diagonal damping added to the normal equations.
    pub damping: f64,
}

impl Default for BAConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            chi2_mono: CHI2_MONO,
            chi2_stereo: CHI2_STEREO,
            damping: 1e-3,
        }
    }
}

/// One reprojection measurement.
#[derive(Debug, Clone)]
pub struct BAObservation {
    /// Index into the problem's keyframe arrays.
    pub kf: usize,
    /// Index into the problem's point arrays.
    pub mp: usize,
    /// Feature slot in the observing keyframe, for outlier removal.
    pub feature_idx: usize,
    pub u: f64,
    pub v: f64,
    pub inv_sigma2: f64,
    pub stereo: bool,
}

/// Pinhole projection parameters of one keyframe.
#[derive(Debug, Clone, Copy)]
pub struct BACamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

/// A snapshot of poses, points, and measurements, detached from the map.
pub struct BAProblem {
    pub kf_ids: Vec<KeyFrameId>,
    pub poses: Vec<SE3>,
    pub fixed: Vec<bool>,
    pub cameras: Vec<BACamera>,
    pub mp_ids: Vec<MapPointId>,
    pub points: Vec<Vector3<f64>>,
    pub observations: Vec<BAObservation>,
}

/// Solver output; poses/points are parallel to the problem's id arrays.
pub struct BAResult {
    pub kf_ids: Vec<KeyFrameId>,
    pub poses: Vec<SE3>,
    pub fixed: Vec<bool>,
    pub mp_ids: Vec<MapPointId>,
    pub points: Vec<Vector3<f64>>,
    /// Observations rejected as outliers: (keyframe, feature slot).
    pub outliers: Vec<(KeyFrameId, usize)>,
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

impl BAResult {
    /// Whether applying the result would improve the map.
    pub fn improved(&self) -> bool {
        self.final_error < self.initial_error
    }
}

/// PHASE 1 (local): extract the local window around `center_id`.
///
/// The window is the centre keyframe plus its covisibles above the elision
/// floor. Points are everything the window observes; keyframes outside the
/// window observing those points are included with their poses fixed. If no
/// outer keyframe exists the oldest window keyframe is fixed to pin the
/// gauge.
pub fn collect_local_ba(map: &Map, center_id: KeyFrameId) -> Option<BAProblem> {
    let center = map.get_keyframe(center_id)?;

    let mut window: Vec<KeyFrameId> = vec![center_id];
    let mut weights: Vec<(KeyFrameId, usize)> = center
        .covisibility_weights()
        .iter()
        .filter(|(_, &w)| w >= MIN_COVISIBILITY_WEIGHT)
        .map(|(&id, &w)| (id, w))
        .collect();
    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    window.extend(weights.into_iter().map(|(id, _)| id));
    window.retain(|id| map.contains_keyframe(*id));

    let window_set: HashSet<KeyFrameId> = window.iter().copied().collect();

    // Points seen by the window.
    let mut mp_ids: Vec<MapPointId> = Vec::new();
    let mut mp_seen: HashSet<MapPointId> = HashSet::new();
    for &kf_id in &window {
        let kf = map.get_keyframe(kf_id)?;
        for (_, mp_id) in kf.observed_map_points() {
            if let Some(live) = map.resolve_map_point(mp_id) {
                if mp_seen.insert(live) {
                    mp_ids.push(live);
                }
            }
        }
    }
    mp_ids.sort();
    if mp_ids.is_empty() {
        return None;
    }

    // Outer keyframes observing window points are held fixed.
    let mut fixed_ids: Vec<KeyFrameId> = Vec::new();
    let mut fixed_seen: HashSet<KeyFrameId> = HashSet::new();
    for &mp_id in &mp_ids {
        if let Some(mp) = map.get_map_point(mp_id) {
            for &obs_kf in mp.observations.keys() {
                if !window_set.contains(&obs_kf)
                    && map.contains_keyframe(obs_kf)
                    && fixed_seen.insert(obs_kf)
                {
                    fixed_ids.push(obs_kf);
                }
            }
        }
    }
    fixed_ids.sort();

    let mut kf_ids = window.clone();
    let mut fixed = vec![false; window.len()];
    kf_ids.extend(fixed_ids.iter().copied());
    fixed.extend(std::iter::repeat(true).take(fixed_ids.len()));

    if !fixed.iter().any(|&f| f) {
        // No outer anchor: fix the oldest keyframe in the window.
        if let Some(oldest) = kf_ids
            .iter()
            .enumerate()
            .min_by_key(|(_, id)| **id)
            .map(|(i, _)| i)
        {
            fixed[oldest] = true;
        }
    }

    build_problem(map, kf_ids, fixed, mp_ids)
}

/// Build a problem over an explicit keyframe/point selection (used by
/// global BA, which snapshots the whole map).
pub(crate) fn build_whole_map_problem(
    map: &Map,
    kf_ids: Vec<KeyFrameId>,
    fixed: Vec<bool>,
    mp_ids: Vec<MapPointId>,
) -> Option<BAProblem> {
    build_problem(map, kf_ids, fixed, mp_ids)
}

fn build_problem(
    map: &Map,
    kf_ids: Vec<KeyFrameId>,
    fixed: Vec<bool>,
    mp_ids: Vec<MapPointId>,
) -> Option<BAProblem> {
    let kf_index: HashMap<KeyFrameId, usize> =
        kf_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    let mp_index: HashMap<MapPointId, usize> =
        mp_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    let mut poses = Vec::with_capacity(kf_ids.len());
    let mut cameras = Vec::with_capacity(kf_ids.len());
    let mut observations = Vec::new();

    for &kf_id in &kf_ids {
        let kf = map.get_keyframe(kf_id)?;
        poses.push(kf.pose.clone());
        cameras.push(BACamera {
            fx: kf.intrinsics.fx,
            fy: kf.intrinsics.fy,
            cx: kf.intrinsics.cx,
            cy: kf.intrinsics.cy,
        });

        for (feature_idx, mp_id) in kf.observed_map_points() {
            let live = match map.resolve_map_point(mp_id) {
                Some(id) => id,
                None => continue,
            };
            let mp = match mp_index.get(&live) {
                Some(&i) => i,
                None => continue,
            };
            let feat = &kf.features[feature_idx];
            let inv_sigma2 = 1.0
                / kf.pyramid
                    .level_sigma2
                    .get(feat.octave.max(0) as usize)
                    .copied()
                    .unwrap_or(1.0);
            observations.push(BAObservation {
                kf: kf_index[&kf_id],
                mp,
                feature_idx,
                u: feat.u,
                v: feat.v,
                inv_sigma2,
                stereo: feat.has_depth(),
            });
        }
    }

    let points = mp_ids
        .iter()
        .map(|id| map.get_map_point(*id).map(|mp| mp.position))
        .collect::<Option<Vec<_>>>()?;

    if observations.is_empty() {
        return None;
    }

    Some(BAProblem {
        kf_ids,
        poses,
        fixed,
        cameras,
        mp_ids,
        points,
        observations,
    })
}

/// PHASE 2: Gauss-Newton alternation over the snapshot.
///
/// `should_abort` is polled between iterations; an abort returns `None` and
/// nothing propagates (the in-flight problem is simply dropped).
pub fn solve_ba(
    problem: &BAProblem,
    config: &BAConfig,
    should_abort: &dyn Fn() -> bool,
) -> Option<BAResult> {
    let mut poses = problem.poses.clone();
    let mut points = problem.points.clone();
    let mut inlier = vec![true; problem.observations.len()];

    let initial_error = mean_chi2(problem, &poses, &points, &inlier);
    let mut iterations = 0;

    for _ in 0..config.max_iterations {
        if should_abort() {
            return None;
        }
        iterations += 1;

        refine_points(problem, &poses, &mut points, &inlier, config.damping);
        refine_poses(problem, &mut poses, &points, &inlier, config.damping);

        // Drop observations whose residual exceeds the sensor threshold.
        for (i, obs) in problem.observations.iter().enumerate() {
            if !inlier[i] {
                continue;
            }
            let chi2 = observation_chi2(problem, obs, &poses, &points);
            let threshold = if obs.stereo {
                config.chi2_stereo
            } else {
                config.chi2_mono
            };
            if chi2 > threshold {
                inlier[i] = false;
            }
        }
    }

    let final_error = mean_chi2(problem, &poses, &points, &inlier);
    trace!(initial_error, final_error, iterations, "BA solve finished");

    let outliers = problem
        .observations
        .iter()
        .zip(&inlier)
        .filter(|(_, &keep)| !keep)
        .map(|(obs, _)| (problem.kf_ids[obs.kf], obs.feature_idx))
        .collect();

    Some(BAResult {
        kf_ids: problem.kf_ids.clone(),
        poses,
        fixed: problem.fixed.clone(),
        mp_ids: problem.mp_ids.clone(),
        points,
        outliers,
        iterations,
        initial_error,
        final_error,
    })
}

/// PHASE 3 (local): write poses, positions, and outlier removals back.
///
/// A solve that failed to improve keeps the pre-BA poses; outlier removals
/// are applied either way.
pub fn apply_local_ba(map: &mut Map, result: &BAResult) {
    if result.improved() {
        for ((kf_id, pose), &fixed) in result
            .kf_ids
            .iter()
            .zip(&result.poses)
            .zip(&result.fixed)
        {
            if fixed {
                continue;
            }
            if let Some(kf) = map.get_keyframe_mut(*kf_id) {
                kf.pose = pose.clone();
            }
        }
        for (mp_id, position) in result.mp_ids.iter().zip(&result.points) {
            if let Some(mp) = map.get_map_point_mut(*mp_id) {
                mp.position = *position;
            }
        }
    }

    for (kf_id, feature_idx) in &result.outliers {
        map.disassociate(*kf_id, *feature_idx);
    }
}

fn project(cam: &BACamera, p_cam: &Vector3<f64>) -> Option<Vector2<f64>> {
    if p_cam.z <= 1e-6 {
        return None;
    }
    Some(Vector2::new(
        cam.fx * p_cam.x / p_cam.z + cam.cx,
        cam.fy * p_cam.y / p_cam.z + cam.cy,
    ))
}

fn observation_chi2(
    problem: &BAProblem,
    obs: &BAObservation,
    poses: &[SE3],
    points: &[Vector3<f64>],
) -> f64 {
    let p_cam = poses[obs.kf].transform_point(&points[obs.mp]);
    match project(&problem.cameras[obs.kf], &p_cam) {
        Some(uv) => {
            let r = Vector2::new(obs.u, obs.v) - uv;
            r.norm_squared() * obs.inv_sigma2
        }
        // A point behind its camera is maximally wrong.
        None => f64::INFINITY,
    }
}

fn mean_chi2(
    problem: &BAProblem,
    poses: &[SE3],
    points: &[Vector3<f64>],
    inlier: &[bool],
) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (i, obs) in problem.observations.iter().enumerate() {
        if !inlier[i] {
            continue;
        }
        let chi2 = observation_chi2(problem, obs, poses, points);
        if chi2.is_finite() {
            sum += chi2;
            count += 1;
        } else {
            sum += 1e6;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

/// Jacobian of the projection w.r.t. the camera-frame point.
fn projection_jacobian(cam: &BACamera, p_cam: &Vector3<f64>) -> Matrix2x3<f64> {
    let z_inv = 1.0 / p_cam.z;
    let z_inv2 = z_inv * z_inv;
    Matrix2x3::new(
        cam.fx * z_inv,
        0.0,
        -cam.fx * p_cam.x * z_inv2,
        0.0,
        cam.fy * z_inv,
        -cam.fy * p_cam.y * z_inv2,
    )
}

fn refine_points(
    problem: &BAProblem,
    poses: &[SE3],
    points: &mut [Vector3<f64>],
    inlier: &[bool],
    damping: f64,
) {
    // Group observations per point.
    let mut per_point: Vec<Vec<usize>> = vec![Vec::new(); points.len()];
    for (i, obs) in problem.observations.iter().enumerate() {
        if inlier[i] {
            per_point[obs.mp].push(i);
        }
    }

    for (mp, obs_indices) in per_point.iter().enumerate() {
        if obs_indices.len() < 2 {
            continue;
        }
        let mut h = Matrix3::zeros();
        let mut b = Vector3::zeros();
        for &i in obs_indices {
            let obs = &problem.observations[i];
            let pose = &poses[obs.kf];
            let p_cam = pose.transform_point(&points[mp]);
            let uv = match project(&problem.cameras[obs.kf], &p_cam) {
                Some(uv) => uv,
                None => continue,
            };
            let r = Vector2::new(obs.u, obs.v) - uv;
            let j = projection_jacobian(&problem.cameras[obs.kf], &p_cam) * pose.rotation_matrix();
            h += obs.inv_sigma2 * j.transpose() * j;
            b += obs.inv_sigma2 * j.transpose() * r;
        }
        h += Matrix3::identity() * damping;
        if let Some(delta) = h.cholesky().map(|c| c.solve(&b)) {
            points[mp] += delta;
        }
    }
}

fn refine_poses(
    problem: &BAProblem,
    poses: &mut [SE3],
    points: &[Vector3<f64>],
    inlier: &[bool],
    damping: f64,
) {
    let mut per_pose: Vec<Vec<usize>> = vec![Vec::new(); poses.len()];
    for (i, obs) in problem.observations.iter().enumerate() {
        if inlier[i] {
            per_pose[obs.kf].push(i);
        }
    }

    for (kf, obs_indices) in per_pose.iter().enumerate() {
        if problem.fixed[kf] || obs_indices.len() < 3 {
            continue;
        }
        let mut h = Matrix6::zeros();
        let mut b = Vector6::zeros();
        for &i in obs_indices {
            let obs = &problem.observations[i];
            let p_cam = poses[kf].transform_point(&points[obs.mp]);
            let uv = match project(&problem.cameras[kf], &p_cam) {
                Some(uv) => uv,
                None => continue,
            };
            let r = Vector2::new(obs.u, obs.v) - uv;
            let j_proj = projection_jacobian(&problem.cameras[kf], &p_cam);

            // Left-multiplicative update: p_cam' ≈ p_cam + dw x p_cam + dt.
            let mut j_pose = Matrix2x6::zeros();
            let neg_skew = Matrix3::new(
                0.0, p_cam.z, -p_cam.y, //
                -p_cam.z, 0.0, p_cam.x, //
                p_cam.y, -p_cam.x, 0.0,
            );
            j_pose
                .fixed_view_mut::<2, 3>(0, 0)
                .copy_from(&(j_proj * neg_skew));
            j_pose.fixed_view_mut::<2, 3>(0, 3).copy_from(&j_proj);

            h += obs.inv_sigma2 * j_pose.transpose() * j_pose;
            b += obs.inv_sigma2 * j_pose.transpose() * r;
        }
        h += Matrix6::identity() * damping;
        if let Some(delta) = h.cholesky().map(|c| c.solve(&b)) {
            let tangent = [delta[0], delta[1], delta[2], delta[3], delta[4], delta[5]];
            poses[kf] = SE3::exp(&tangent).compose(&poses[kf]);
        }
    }
}
