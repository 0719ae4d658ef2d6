//! Global bundle adjustment over the entire map.
//!
//! The solve itself is shared with local BA ([`super::ba::solve_ba`]); this
//! module builds the whole-map problem and applies the result, propagating
//! corrections to keyframes and map points that were created *while* the
//! optimisation was running in the background.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map};

use super::ba::{BAProblem, BAResult};

/// PHASE 1: snapshot every keyframe and map point.
///
/// The oldest keyframe is held fixed to pin the gauge.
pub fn collect_global_ba(map: &Map) -> Option<BAProblem> {
    let kf_ids = map.all_keyframes();
    if kf_ids.len() < 2 {
        return None;
    }
    let fixed: Vec<bool> = kf_ids
        .iter()
        .map(|&id| Some(id) == kf_ids.first().copied())
        .collect();
    let mp_ids = map.all_map_points();
    if mp_ids.is_empty() {
        return None;
    }

    super::ba::build_whole_map_problem(map, kf_ids, fixed, mp_ids)
}

/// PHASE 3: write optimised poses and positions back, correcting entities
/// born during the optimisation.
///
/// A keyframe missing from the snapshot is corrected through its spanning
/// tree ancestry: `T_new = T_old ∘ T_anc_old⁻¹ ∘ T_anc_new` for the nearest
/// snapshotted ancestor. A map point missing from the snapshot moves with
/// its reference keyframe.
pub fn apply_global_ba(map: &mut Map, problem: &BAProblem, result: &BAResult) {
    if !result.improved() {
        info!(
            initial = result.initial_error,
            final_error = result.final_error,
            "global BA did not improve; keeping pre-BA state"
        );
        return;
    }

    let old_poses: HashMap<KeyFrameId, SE3> = problem
        .kf_ids
        .iter()
        .cloned()
        .zip(problem.poses.iter().cloned())
        .collect();
    let new_poses: HashMap<KeyFrameId, SE3> = result
        .kf_ids
        .iter()
        .cloned()
        .zip(result.poses.iter().cloned())
        .collect();

    // Pose pair (before, after) for every live keyframe, snapshotted or not.
    let mut corrections: HashMap<KeyFrameId, (SE3, SE3)> = HashMap::new();
    let live_kfs = map.all_keyframes();
    let mut born_during_gba = 0usize;

    for &kf_id in &live_kfs {
        let current = match map.get_keyframe(kf_id) {
            Some(kf) => kf.pose.clone(),
            None => continue,
        };
        if let (Some(old), Some(new)) = (old_poses.get(&kf_id), new_poses.get(&kf_id)) {
            corrections.insert(kf_id, (old.clone(), new.clone()));
            continue;
        }

        // Walk up the spanning tree to the nearest snapshotted ancestor.
        born_during_gba += 1;
        let mut ancestor = map.get_keyframe(kf_id).and_then(|kf| kf.parent);
        let mut corrected = current.clone();
        while let Some(anc_id) = ancestor {
            if let (Some(anc_old), Some(anc_new)) = (old_poses.get(&anc_id), new_poses.get(&anc_id))
            {
                corrected = current
                    .compose(&anc_old.inverse())
                    .compose(anc_new);
                break;
            }
            ancestor = map.get_keyframe(anc_id).and_then(|kf| kf.parent);
        }
        corrections.insert(kf_id, (current, corrected));
    }

    for (&kf_id, (_, new_pose)) in &corrections {
        if let Some(kf) = map.get_keyframe_mut(kf_id) {
            kf.pose = new_pose.clone();
        }
    }

    let new_points: HashMap<_, _> = result
        .mp_ids
        .iter()
        .cloned()
        .zip(result.points.iter().cloned())
        .collect();
    for mp_id in map.all_map_points() {
        if let Some(position) = new_points.get(&mp_id) {
            if let Some(mp) = map.get_map_point_mut(mp_id) {
                mp.position = *position;
            }
            continue;
        }
        // Born during GBA: move with the reference keyframe.
        let ref_kf = match map.get_map_point(mp_id) {
            Some(mp) => mp.reference_kf,
            None => continue,
        };
        if let Some((old_ref, new_ref)) = corrections.get(&ref_kf) {
            if let Some(mp) = map.get_map_point_mut(mp_id) {
                let in_ref = old_ref.transform_point(&mp.position);
                mp.position = new_ref.inverse().transform_point(&in_ref);
            }
        }
    }

    map.record_big_change();
    debug!(
        keyframes = corrections.len(),
        born_during_gba, "global BA corrections applied"
    );
}
