//! Loop Closing worker.
//!
//! Consumes keyframes that finished the local mapping pipeline and runs:
//!
//! 1. Candidate detection with temporal consistency
//! 2. Sim(3) verification against each accepted candidate
//! 3. Loop fusion: the loop side's points are projected into the current
//!    side and duplicates merged
//! 4. Essential-graph optimisation spreading the correction along the
//!    trajectory
//! 5. Global bundle adjustment on a background thread, aborted if another
//!    loop arrives first
//!
//! Local mapping is paused (acknowledged handshake) for the duration of the
//! fusion and graph correction; the loop endpoints are pinned against
//! culling for the whole verification.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::geometry::Sim3;
use crate::map::{KeyFrameId, MapPointId};
use crate::mapper::shared::SharedState;
use crate::matching::{fuse_into_keyframe, search_by_bow};
use crate::optimizer::{
    apply_global_ba, apply_pose_graph, collect_global_ba, collect_pose_graph, solve_ba,
    solve_pose_graph, BAConfig, PoseGraphConfig,
};

use super::detector::{detect_candidates, ConsistencyChecker, LoopDetectorConfig};
use super::sim3_solver::{solve_sim3, PointPair, Sim3SolverConfig};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const PAUSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LoopClosingConfig {
    pub detector: LoopDetectorConfig,
    pub solver: Sim3SolverConfig,
    /// Sim(3) inlier support required to accept a loop.
    pub min_inliers: usize,
    pub pose_graph: PoseGraphConfig,
    pub global_ba: BAConfig,
    pub run_global_ba: bool,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            detector: LoopDetectorConfig::default(),
            solver: Sim3SolverConfig::default(),
            min_inliers: 20,
            pose_graph: PoseGraphConfig::default(),
            global_ba: BAConfig {
                max_iterations: 10,
                ..BAConfig::default()
            },
            run_global_ba: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoopClosingStats {
    pub keyframes_processed: usize,
    pub candidates_detected: usize,
    pub loops_verified: usize,
    pub loops_corrected: usize,
}

/// The Loop Closing worker state.
pub struct LoopCloser {
    shared: Arc<SharedState>,
    config: LoopClosingConfig,
    consistency: ConsistencyChecker,
    stats: LoopClosingStats,
    gba_thread: Option<JoinHandle<()>>,
}

impl LoopCloser {
    pub fn new(shared: Arc<SharedState>, config: LoopClosingConfig) -> Self {
        let consistency = ConsistencyChecker::new(config.detector.consistency_threshold);
        Self {
            shared,
            config,
            consistency,
            stats: LoopClosingStats::default(),
            gba_thread: None,
        }
    }

    /// Worker loop; returns on shutdown or queue closure.
    pub fn run(&mut self, receiver: Receiver<KeyFrameId>) {
        info!("loop closing worker started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }

            if self.shared.loop_reset_requested.load(Ordering::SeqCst) {
                self.reset(&receiver);
                continue;
            }

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(kf_id) => {
                    self.process_keyframe(kf_id);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.abort_global_ba();
        info!(
            processed = self.stats.keyframes_processed,
            detected = self.stats.candidates_detected,
            verified = self.stats.loops_verified,
            corrected = self.stats.loops_corrected,
            "loop closing worker exiting"
        );
    }

    fn reset(&mut self, receiver: &Receiver<KeyFrameId>) {
        while receiver.try_recv().is_ok() {}
        self.consistency.clear();
        self.abort_global_ba();
        self.shared
            .loop_reset_requested
            .store(false, Ordering::SeqCst);
        debug!("loop closing reset complete");
    }

    /// Run detection and, when a loop verifies, the full correction.
    ///
    /// Public so tests can drive the worker synchronously.
    pub fn process_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        self.stats.keyframes_processed += 1;
        self.reap_finished_gba();

        // Step 1: candidates + temporal consistency.
        let candidates = detect_candidates(
            &self.shared.map,
            &self.shared.keyframe_db,
            kf_id,
            &self.config.detector,
        );
        if !candidates.is_empty() {
            self.stats.candidates_detected += candidates.len();
        }
        let candidate = {
            let map = self.shared.map.read();
            self.consistency.check(&map, &candidates)
        };
        let loop_id = match candidate {
            Some(id) => id,
            None => return false,
        };

        // Pin both endpoints for the duration of verification.
        {
            let mut map = self.shared.map.write();
            map.set_not_erase(kf_id);
            map.set_not_erase(loop_id);
        }

        // Step 2: Sim(3) verification.
        let verified = self.verify_candidate(kf_id, loop_id);
        let (alignment, matched_pairs) = match verified {
            Some(v) => v,
            None => {
                let mut map = self.shared.map.write();
                map.set_erase(kf_id);
                map.set_erase(loop_id);
                return false;
            }
        };
        self.stats.loops_verified += 1;
        info!(current = %kf_id, loop_kf = %loop_id, "loop verified");

        // A correction is coming: an in-flight global BA is now stale.
        self.abort_global_ba();

        // Steps 3-4 run with local mapping paused.
        self.shared.pause.request();
        self.shared.abort_local_ba.store(true, Ordering::SeqCst);
        if !self.shared.pause.wait_paused(PAUSE_TIMEOUT) {
            warn!("local mapping did not acknowledge pause; proceeding");
        }

        self.correct_loop(kf_id, loop_id, &alignment, &matched_pairs);
        self.stats.loops_corrected += 1;

        self.shared.pause.resume();
        self.shared.publish_map_changes();

        // Step 5: global BA in the background.
        if self.config.run_global_ba {
            self.launch_global_ba();
        }
        true
    }

    /// Match map points between the two keyframes and estimate the Sim(3).
    ///
    /// Returns the alignment and the matched (current MP, loop MP) pairs.
    fn verify_candidate(
        &self,
        kf_id: KeyFrameId,
        loop_id: KeyFrameId,
    ) -> Option<(Sim3, Vec<(MapPointId, MapPointId)>)> {
        let map = self.shared.map.read();
        let (current, loop_kf) = (map.get_keyframe(kf_id)?, map.get_keyframe(loop_id)?);

        let mut pairs: Vec<PointPair> = Vec::new();
        let mut pair_ids: Vec<(MapPointId, MapPointId)> = Vec::new();
        for (idx1, idx2) in search_by_bow(current, loop_kf, false) {
            let (mp1, mp2) = match (current.map_point(idx1), loop_kf.map_point(idx2)) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };
            let (mp1, mp2) = match (map.resolve_map_point(mp1), map.resolve_map_point(mp2)) {
                (Some(a), Some(b)) => (a, b),
                _ => continue,
            };
            let (p1, p2) = match (map.get_map_point(mp1), map.get_map_point(mp2)) {
                (Some(a), Some(b)) => (a.position, b.position),
                _ => continue,
            };
            pairs.push((
                current.pose.transform_point(&p1),
                loop_kf.pose.transform_point(&p2),
            ));
            pair_ids.push((mp1, mp2));
        }

        let estimate = solve_sim3(&pairs, self.config.min_inliers, &self.config.solver)?;
        debug!(
            current = %kf_id,
            loop_kf = %loop_id,
            inliers = estimate.inliers.len(),
            scale = estimate.transform.scale,
            "Sim(3) estimated"
        );

        let inlier_ids = estimate
            .inliers
            .iter()
            .map(|&i| pair_ids[i])
            .collect();
        Some((estimate.transform, inlier_ids))
    }

    /// Fuse the loop, correct the essential graph, record the loop edge.
    fn correct_loop(
        &mut self,
        kf_id: KeyFrameId,
        loop_id: KeyFrameId,
        alignment: &Sim3,
        matched_pairs: &[(MapPointId, MapPointId)],
    ) {
        // Corrected seam poses: S_iw' = S_ic ∘ (S_cl ∘ S_lw).
        let corrected_seeds: HashMap<KeyFrameId, Sim3> = {
            let map = self.shared.map.read();
            let current = match map.get_keyframe(kf_id) {
                Some(kf) => kf,
                None => return,
            };
            let loop_kf = match map.get_keyframe(loop_id) {
                Some(kf) => kf,
                None => return,
            };

            let s_cw = Sim3::from_se3(&current.pose);
            let s_lw = Sim3::from_se3(&loop_kf.pose);
            let corrected_current = alignment.compose(&s_lw);

            let mut seeds = HashMap::new();
            seeds.insert(kf_id, corrected_current.clone());
            for cov_id in current.covisibles() {
                if let Some(cov) = map.get_keyframe(cov_id) {
                    let s_ic = Sim3::from_se3(&cov.pose).compose(&s_cw.inverse());
                    seeds.insert(cov_id, s_ic.compose(&corrected_current));
                }
            }
            seeds
        };

        // Snapshot the essential graph before touching any pose.
        let problem = {
            let map = self.shared.map.read();
            collect_pose_graph(
                &map,
                kf_id,
                loop_id,
                alignment,
                &corrected_seeds,
                &self.config.pose_graph,
            )
        };
        let problem = match problem {
            Some(p) => p,
            None => return,
        };

        // Apply the seam correction and fuse the loop-side points into the
        // current side.
        {
            let mut map = self.shared.map.write();
            for (&seam_id, pose) in &corrected_seeds {
                if let Some(kf) = map.get_keyframe_mut(seam_id) {
                    kf.pose = pose.to_se3();
                }
            }

            // Direct matches first: each pair is the same landmark.
            for &(current_mp, loop_mp) in matched_pairs {
                if current_mp != loop_mp {
                    map.replace_map_point(current_mp, loop_mp);
                }
            }

            // Then everything the loop neighbourhood observes.
            let mut loop_points: Vec<MapPointId> = Vec::new();
            let loop_neighbourhood: Vec<KeyFrameId> = {
                let mut ids = vec![loop_id];
                if let Some(loop_kf) = map.get_keyframe(loop_id) {
                    ids.extend(loop_kf.covisibles());
                }
                ids
            };
            for nb_id in loop_neighbourhood {
                if let Some(kf) = map.get_keyframe(nb_id) {
                    for (_, mp_id) in kf.observed_map_points() {
                        if !loop_points.contains(&mp_id) {
                            loop_points.push(mp_id);
                        }
                    }
                }
            }
            let seam_targets: Vec<KeyFrameId> = corrected_seeds.keys().copied().collect();
            for &target in &seam_targets {
                fuse_into_keyframe(&mut map, target, &loop_points, 4.0);
            }
            // Fusion rewired observations across the seam; rebuild the
            // affected covisibility.
            for &target in &seam_targets {
                map.update_connections(target);
            }

            // The loop edge pins both endpoints permanently.
            if let Some(kf) = map.get_keyframe_mut(kf_id) {
                kf.add_loop_edge(loop_id);
            }
            if let Some(kf) = map.get_keyframe_mut(loop_id) {
                kf.add_loop_edge(kf_id);
            }
            map.record_loop();
        }

        // Relax the graph without holding the lock, then write back.
        let result = solve_pose_graph(&problem, &self.config.pose_graph);
        {
            let mut map = self.shared.map.write();
            apply_pose_graph(&mut map, &problem, &result);
        }

        info!(
            current = %kf_id,
            loop_kf = %loop_id,
            initial_error = result.initial_error,
            final_error = result.final_error,
            "loop closed"
        );
    }

    /// Spawn global BA on its own thread (aborted by the next loop closure).
    fn launch_global_ba(&mut self) {
        if self.shared.gba_running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.gba_abort.store(false, Ordering::SeqCst);
        self.shared.gba_running.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let config = self.config.global_ba.clone();
        let handle = std::thread::Builder::new()
            .name("global-ba".into())
            .spawn(move || {
                let problem = {
                    let map = shared.map.read();
                    collect_global_ba(&map)
                };
                if let Some(problem) = problem {
                    let abort = {
                        let shared = Arc::clone(&shared);
                        move || {
                            shared.gba_abort.load(Ordering::SeqCst) || shared.is_shutdown()
                        }
                    };
                    if let Some(result) = solve_ba(&problem, &config, &abort) {
                        let mut map = shared.map.write();
                        apply_global_ba(&mut map, &problem, &result);
                        drop(map);
                        shared.publish_map_changes();
                        info!(
                            initial = result.initial_error,
                            final_error = result.final_error,
                            "global BA finished"
                        );
                    } else {
                        info!("global BA aborted");
                    }
                }
                shared.gba_running.store(false, Ordering::SeqCst);
            })
            .expect("failed to spawn global BA thread");
        self.gba_thread = Some(handle);
    }

    /// Abort and join an in-flight global BA, if any.
    fn abort_global_ba(&mut self) {
        if let Some(handle) = self.gba_thread.take() {
            self.shared.gba_abort.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }

    /// Join the GBA thread if it already finished on its own.
    fn reap_finished_gba(&mut self) {
        if !self.shared.gba_running.load(Ordering::SeqCst) {
            if let Some(handle) = self.gba_thread.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn stats(&self) -> &LoopClosingStats {
        &self.stats
    }
}

/// Spawn the worker on its own thread.
pub fn spawn_loop_closer(
    shared: Arc<SharedState>,
    receiver: Receiver<KeyFrameId>,
    config: LoopClosingConfig,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("loop-closing".into())
        .spawn(move || {
            let mut worker = LoopCloser::new(shared, config);
            worker.run(receiver);
        })
        .expect("failed to spawn loop closing thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_mapping::{KeyFrameInsertion, LocalMapper, LocalMappingConfig};
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::{Frame, KeyFrame, MapPoint, TrackerId};
    use nalgebra::Vector3;

    fn test_worker(shared: &Arc<SharedState>) -> LocalMapper {
        LocalMapper::new(
            Arc::clone(shared),
            None,
            2,
            3,
            LocalMappingConfig {
                // Keep the synthetic geometry untouched.
                ba: BAConfig {
                    max_iterations: 0,
                    ..BAConfig::default()
                },
                keyframe_redundancy: 2.0, // never cull
                ..LocalMappingConfig::default()
            },
        )
    }

    fn landmark(slot: u64) -> Vector3<f64> {
        Vector3::new(-1.0 + 0.07 * slot as f64, 0.05 * (slot % 5) as f64, 5.0)
    }

    /// A frame observing the 30 place landmarks; all revisiting frames use
    /// identical words and descriptors so BoW lookup and matching line up.
    fn place_frame() -> Frame {
        let mut frame = frame_with_features(30);
        for (i, feat) in frame.features.iter_mut().enumerate() {
            let p = landmark(i as u64);
            let (u, v) = frame.intrinsics.project(&p).unwrap();
            feat.u = u;
            feat.v = v;
        }
        frame
    }

    /// 50-feature frame: slots 0..30 are the place landmarks, slots 30..50
    /// free for away-segment associations.
    fn transition_frame() -> Frame {
        let mut frame = frame_with_features(50);
        for i in 0..30usize {
            let p = landmark(i as u64);
            let (u, v) = frame.intrinsics.project(&p).unwrap();
            frame.features[i].u = u;
            frame.features[i].v = v;
        }
        frame
    }

    /// A frame whose words are disjoint from the place vocabulary.
    fn away_frame(ord: u32) -> Frame {
        let mut frame = frame_with_features(40);
        frame.bow = (0..40u32).map(|w| (1000 + 100 * ord + w, 1.0)).collect();
        frame.feature_words = (0..40u32).map(|w| 1000 + 100 * ord + w).collect();
        frame
    }

    fn insert(
        worker: &mut LocalMapper,
        kf_id: u64,
        frame: Frame,
        created: Vec<(usize, MapPoint)>,
        matched: Vec<(usize, MapPointId)>,
    ) {
        worker
            .process_keyframe(KeyFrameInsertion {
                tracker: TrackerId::new(0),
                keyframe: KeyFrame::from_frame(KeyFrameId::new(kf_id), frame),
                created_map_points: created,
                matched_map_points: matched,
            })
            .unwrap();
    }

    fn create_points(
        frame: &Frame,
        slots: std::ops::Range<usize>,
        id_of: impl Fn(usize) -> u64,
        position_of: impl Fn(usize) -> Vector3<f64>,
        ref_kf: u64,
    ) -> Vec<(usize, MapPoint)> {
        slots
            .map(|slot| {
                (
                    slot,
                    MapPoint::new(
                        MapPointId::new(id_of(slot)),
                        position_of(slot),
                        frame.descriptors[slot],
                        KeyFrameId::new(ref_kf),
                    ),
                )
            })
            .collect()
    }

    /// Trajectory that revisits its start:
    ///   0,2,4        first visit, observing the place landmarks
    ///   6            transition (sees both place and away points)
    ///   8,10,12      away segment, disjoint vocabulary
    ///   14           return, re-creating duplicate landmarks (lost tracking)
    ///   16,18,20     return, re-observing the duplicates
    fn build_revisiting_map(shared: &Arc<SharedState>) {
        let mut worker = test_worker(shared);

        let place = place_frame();
        let created = create_points(&place, 0..30, |s| s as u64 * 3, |s| landmark(s as u64), 0);
        insert(&mut worker, 0, place_frame(), created, Vec::new());

        let matched: Vec<(usize, MapPointId)> = (0..30usize)
            .map(|slot| (slot, MapPointId::new(slot as u64 * 3)))
            .collect();
        insert(&mut worker, 2, place_frame(), Vec::new(), matched.clone());
        insert(&mut worker, 4, place_frame(), Vec::new(), matched.clone());

        // Transition: still sees the place, also anchors the away points.
        let trans = transition_frame();
        let away1 = create_points(
            &trans,
            30..50,
            |s| (200 + s as u64) * 3,
            |s| Vector3::new(s as f64 * 0.1, 3.0, 6.0),
            6,
        );
        insert(&mut worker, 6, transition_frame(), away1, matched.clone());

        // Away segment: 8 and 10 observe away1, 10 and 12 observe away2.
        let away1_matches: Vec<(usize, MapPointId)> = (0..20usize)
            .map(|slot| (slot, MapPointId::new((200 + 30 + slot as u64) * 3)))
            .collect();
        let a8 = away_frame(0);
        let away2 = create_points(
            &a8,
            20..40,
            |s| (300 + s as u64) * 3,
            |s| Vector3::new(s as f64 * 0.1, -3.0, 6.0),
            8,
        );
        insert(&mut worker, 8, away_frame(0), away2, away1_matches);

        let away2_matches: Vec<(usize, MapPointId)> = (0..20usize)
            .map(|slot| (slot, MapPointId::new((300 + 20 + slot as u64) * 3)))
            .collect();
        insert(&mut worker, 10, away_frame(1), Vec::new(), away2_matches.clone());
        insert(&mut worker, 12, away_frame(2), Vec::new(), away2_matches.clone());

        // Return: keyframe 14 has lost tracking and re-creates duplicate
        // landmarks from its own id stream; it stays connected to the away
        // segment through the away2 points.
        let ret = transition_frame();
        let duplicates = create_points(&ret, 0..30, |s| (500 + s as u64) * 3, |s| landmark(s as u64), 14);
        let away2_tail: Vec<(usize, MapPointId)> = (0..20usize)
            .map(|slot| (30 + slot, MapPointId::new((300 + 20 + slot as u64) * 3)))
            .collect();
        insert(&mut worker, 14, transition_frame(), duplicates, away2_tail);

        // 16, 18, 20 re-observe the duplicates.
        let dup_matches: Vec<(usize, MapPointId)> = (0..30usize)
            .map(|slot| (slot, MapPointId::new((500 + slot as u64) * 3)))
            .collect();
        insert(&mut worker, 16, place_frame(), Vec::new(), dup_matches.clone());
        insert(&mut worker, 18, place_frame(), Vec::new(), dup_matches.clone());
        insert(&mut worker, 20, place_frame(), Vec::new(), dup_matches.clone());
    }

    /// Background acknowledger standing in for the local mapping worker's
    /// pause handling.
    fn spawn_pause_acknowledger(shared: &Arc<SharedState>) -> std::thread::JoinHandle<()> {
        let shared = Arc::clone(shared);
        std::thread::spawn(move || {
            while !shared.is_shutdown() {
                if shared.pause.is_requested() {
                    shared.pause.acknowledge_and_wait(&|| true);
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    }

    #[test]
    fn test_loop_closure_end_to_end() {
        let shared = Arc::new(SharedState::new());
        build_revisiting_map(&shared);
        let big_change_before = shared.map.read().last_big_change_index();
        let acknowledger = spawn_pause_acknowledger(&shared);

        let mut closer = LoopCloser::new(
            Arc::clone(&shared),
            LoopClosingConfig {
                run_global_ba: false,
                solver: Sim3SolverConfig {
                    fix_scale: true,
                    ..Sim3SolverConfig::default()
                },
                ..LoopClosingConfig::default()
            },
        );

        // The three consecutive returning keyframes reach consistency on
        // the third.
        let mut closed = false;
        for kf_id in [16u64, 18, 20] {
            closed |= closer.process_keyframe(KeyFrameId::new(kf_id));
        }
        assert!(closed, "loop should close on the third consistent keyframe");

        shared.request_shutdown();
        acknowledger.join().unwrap();

        let map = shared.map.read();

        // A loop edge links the closing keyframe to the first visit.
        let current = map.get_keyframe(KeyFrameId::new(20)).unwrap();
        assert!(!current.loop_edges.is_empty());
        let loop_partner = *current.loop_edges.iter().next().unwrap();
        assert!(
            loop_partner.0 <= 6,
            "loop must close onto the first visit, got {}",
            loop_partner
        );
        assert!(map
            .get_keyframe(loop_partner)
            .unwrap()
            .loop_edges
            .contains(&KeyFrameId::new(20)));

        // The duplicate landmarks were merged into the originals: the
        // closing keyframe now observes first-visit points.
        let observes_original = current
            .observed_map_points()
            .filter(|(_, mp_id)| mp_id.0 < 90)
            .count();
        assert!(
            observes_original >= 20,
            "expected merged landmarks, got {}",
            observes_original
        );

        // Large-mutation counter advanced, loop recorded.
        assert!(map.last_big_change_index() > big_change_before);
        assert_eq!(map.loops_in_map(), 1);

        // Map invariants survive the correction: every slot resolves, and
        // every covisibility weight equals the actual shared-point count.
        let ids = map.all_keyframes();
        for &kf_id in &ids {
            let kf = map.get_keyframe(kf_id).unwrap();
            for (_, mp_id) in kf.observed_map_points() {
                assert!(map.resolve_map_point(mp_id).is_some());
            }
        }
        for (i, &a) in ids.iter().enumerate() {
            for &b in ids.iter().skip(i + 1) {
                let ka = map.get_keyframe(a).unwrap();
                let shared = ka
                    .observed_map_points()
                    .filter(|(_, mp_id)| {
                        map.resolve_map_point(*mp_id)
                            .and_then(|id| map.get_map_point(id))
                            .map(|mp| mp.observed_by(b))
                            .unwrap_or(false)
                    })
                    .count();
                assert_eq!(
                    ka.covisibility_weight(b),
                    shared,
                    "weight between {} and {} disagrees with shared count",
                    a,
                    b
                );
                assert_eq!(
                    map.get_keyframe(b).unwrap().covisibility_weight(a),
                    shared
                );
            }
        }
        // Spanning tree stays rooted and acyclic.
        let roots = map
            .all_keyframes()
            .iter()
            .filter(|&&id| map.get_keyframe(id).unwrap().is_root())
            .count();
        assert_eq!(roots, 1);
    }

    #[test]
    fn test_no_loop_without_consistency() {
        let shared = Arc::new(SharedState::new());
        build_revisiting_map(&shared);

        let mut closer = LoopCloser::new(
            Arc::clone(&shared),
            LoopClosingConfig {
                run_global_ba: false,
                ..LoopClosingConfig::default()
            },
        );
        // A single keyframe, however similar, is not enough.
        assert!(!closer.process_keyframe(KeyFrameId::new(20)));
    }
}
