//! Local Mapping worker.
//!
//! Consumes the bounded queue of keyframes admitted by the mapper facade and
//! runs the per-keyframe pipeline:
//!
//! 1. Insert the keyframe and its tracker-created map points into the map,
//!    associate matched points, update covisibility, attach to the spanning
//!    tree, index in the keyframe database
//! 2. Cull recently-created map points that failed to earn their keep
//! 3. Triangulate new map points against covisible neighbours
//! 4. Fuse duplicate map points with the neighbourhood
//! 5. Local bundle adjustment over the covisibility window
//! 6. Cull redundant keyframes
//!
//! Map points created here draw ids from the stream the mapper reserved for
//! local mapping, keeping them disjoint from every tracker's stream.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::map::{KeyFrame, KeyFrameId, MapPoint, MapPointId, TrackerId};
use crate::matching::fuse_into_keyframe;
use crate::mapper::shared::SharedState;
use crate::optimizer::{apply_local_ba, collect_local_ba, solve_ba, BAConfig};

use super::triangulation::{create_new_map_points, TriangulationConfig};

/// Queue length beyond which the facade stops admitting keyframes.
pub const QUEUE_BACKPRESSURE_THRESHOLD: usize = 3;

/// Channel capacity; admission fails outright when this is full.
pub const QUEUE_CAPACITY: usize = 8;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// A keyframe handed over by a tracker, with its new and matched points.
pub struct KeyFrameInsertion {
    pub tracker: TrackerId,
    pub keyframe: KeyFrame,
    /// Stereo/RGB-D points created by the tracker: (feature slot, point).
    pub created_map_points: Vec<(usize, MapPoint)>,
    /// Matches against existing points: (feature slot, point id).
    pub matched_map_points: Vec<(usize, MapPointId)>,
}

#[derive(Debug, Clone)]
pub struct LocalMappingConfig {
    /// Neighbours considered for triangulation and fusion.
    pub triangulation_neighbours: usize,
    /// Keyframes a recent point has to survive before it is off probation.
    pub recent_point_window: u64,
    /// Minimum found/visible ratio for a recent point.
    pub min_found_ratio: f64,
    /// Redundancy ratio above which a keyframe is culled.
    pub keyframe_redundancy: f64,
    /// Observers (at same or finer scale) that make a point redundant.
    pub redundant_observers: usize,
    pub triangulation: TriangulationConfig,
    pub ba: BAConfig,
}

impl Default for LocalMappingConfig {
    fn default() -> Self {
        Self {
            triangulation_neighbours: 10,
            recent_point_window: 3,
            min_found_ratio: 0.25,
            keyframe_redundancy: 0.9,
            redundant_observers: 3,
            triangulation: TriangulationConfig::default(),
            ba: BAConfig::default(),
        }
    }
}

/// The Local Mapping worker state.
pub struct LocalMapper {
    shared: Arc<SharedState>,
    /// Keyframes flow on to loop closing after the pipeline.
    lc_sender: Option<Sender<KeyFrameId>>,

    first_mp_id: u64,
    mp_id_span: u64,
    next_mp_id: u64,

    /// Probation list: (point, pipeline counter at creation).
    recent_points: Vec<(MapPointId, u64)>,
    processed: u64,

    config: LocalMappingConfig,
}

impl LocalMapper {
    pub fn new(
        shared: Arc<SharedState>,
        lc_sender: Option<Sender<KeyFrameId>>,
        first_mp_id: u64,
        mp_id_span: u64,
        config: LocalMappingConfig,
    ) -> Self {
        Self {
            shared,
            lc_sender,
            first_mp_id,
            mp_id_span,
            next_mp_id: first_mp_id,
            recent_points: Vec::new(),
            processed: 0,
            config,
        }
    }

    /// Worker loop; returns when shutdown is requested or the queue closes.
    pub fn run(&mut self, receiver: Receiver<KeyFrameInsertion>) {
        info!("local mapping worker started");
        loop {
            if self.shared.is_shutdown() {
                break;
            }

            if self
                .shared
                .local_reset_requested
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                self.reset(&receiver);
                continue;
            }

            if self.shared.pause.is_requested() {
                self.shared.set_accept_keyframes(false);
                let shared = Arc::clone(&self.shared);
                self.shared
                    .pause
                    .acknowledge_and_wait(&move || !shared.is_shutdown());
                continue;
            }

            self.shared
                .set_accept_keyframes(receiver.len() <= QUEUE_BACKPRESSURE_THRESHOLD);

            match receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => {
                    self.process_keyframe(msg);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("local mapping worker exiting");
    }

    /// Drain the queue and restart the reserved id stream.
    fn reset(&mut self, receiver: &Receiver<KeyFrameInsertion>) {
        while receiver.try_recv().is_ok() {}
        self.recent_points.clear();
        self.next_mp_id = self.first_mp_id;
        self.processed = 0;
        self.shared
            .local_reset_requested
            .store(false, std::sync::atomic::Ordering::SeqCst);
        debug!("local mapping reset complete");
    }

    /// Run the full pipeline for one keyframe.
    ///
    /// Public so tests (and the facade's synchronous paths) can drive the
    /// worker deterministically.
    pub fn process_keyframe(&mut self, msg: KeyFrameInsertion) -> Option<KeyFrameId> {
        self.shared
            .abort_local_ba
            .store(false, std::sync::atomic::Ordering::SeqCst);
        self.processed += 1;

        let kf_id = self.process_new_keyframe(msg)?;
        self.cull_recent_map_points();
        self.triangulate_new_points(kf_id);
        self.fuse_with_neighbours(kf_id);
        self.local_bundle_adjustment(kf_id);
        self.cull_keyframes(kf_id);

        self.shared.publish_map_changes();

        if let Some(sender) = &self.lc_sender {
            let _ = sender.try_send(kf_id);
        }
        Some(kf_id)
    }

    /// Step 1: insert the keyframe and wire up its observations.
    fn process_new_keyframe(&mut self, msg: KeyFrameInsertion) -> Option<KeyFrameId> {
        let kf_id = msg.keyframe.id;
        let bow = msg.keyframe.bow.clone();

        {
            let mut map = self.shared.map.write();
            if !map.insert_keyframe(msg.keyframe) {
                warn!(kf = %kf_id, "duplicate keyframe rejected by map");
                return None;
            }

            for (slot, mp) in msg.created_map_points {
                let mp_id = mp.id;
                if !map.insert_map_point(mp) {
                    warn!(mp = %mp_id, "duplicate map point rejected by map");
                    continue;
                }
                map.associate(kf_id, slot, mp_id);
                map.update_map_point_geometry(mp_id);
                self.recent_points.push((mp_id, self.processed));
            }

            for (slot, mp_id) in msg.matched_map_points {
                // Fusion may have retired the id the tracker knew about.
                if let Some(live) = map.resolve_map_point(mp_id) {
                    map.associate(kf_id, slot, live);
                    if let Some(mp) = map.get_map_point_mut(live) {
                        mp.increase_found(1);
                        mp.increase_visible(1);
                    }
                }
            }

            map.attach_to_spanning_tree(kf_id);
        }

        self.shared.keyframe_db.write().add(kf_id, &bow);
        debug!(kf = %kf_id, "keyframe inserted");
        Some(kf_id)
    }

    /// Step 2: drop recent points that failed probation.
    fn cull_recent_map_points(&mut self) {
        let window = self.config.recent_point_window;
        let min_ratio = self.config.min_found_ratio;
        let processed = self.processed;

        let mut map = self.shared.map.write();
        let mut survivors = Vec::with_capacity(self.recent_points.len());

        for (mp_id, born) in self.recent_points.drain(..) {
            let (ratio, observers) = match map.get_map_point(mp_id) {
                Some(mp) => (mp.found_ratio(), mp.num_observations()),
                None => continue, // already fused or erased
            };
            let age = processed.saturating_sub(born);

            if ratio < min_ratio {
                map.erase_map_point(mp_id);
                continue;
            }
            if age >= window {
                if observers < 2 {
                    map.erase_map_point(mp_id);
                }
                // Off probation either way.
                continue;
            }
            survivors.push((mp_id, born));
        }
        self.recent_points = survivors;
    }

    /// Step 3: triangulate against the best covisible neighbours.
    fn triangulate_new_points(&mut self, kf_id: KeyFrameId) {
        let mut map = self.shared.map.write();
        let neighbours = match map.get_keyframe_mut(kf_id) {
            Some(kf) => kf.best_covisibles(self.config.triangulation_neighbours),
            None => return,
        };

        let created = create_new_map_points(
            &mut map,
            kf_id,
            &neighbours,
            &mut self.next_mp_id,
            self.mp_id_span,
            &self.config.triangulation,
        );
        for mp_id in created {
            self.recent_points.push((mp_id, self.processed));
        }
    }

    /// Step 4: reconcile duplicates with first- and second-order neighbours.
    fn fuse_with_neighbours(&self, kf_id: KeyFrameId) {
        let mut map = self.shared.map.write();

        let mut targets = match map.get_keyframe_mut(kf_id) {
            Some(kf) => kf.best_covisibles(self.config.triangulation_neighbours),
            None => return,
        };
        let mut extended = targets.clone();
        for &neighbour in &targets {
            if let Some(kf) = map.get_keyframe_mut(neighbour) {
                for second in kf.best_covisibles(5) {
                    if second != kf_id && !extended.contains(&second) {
                        extended.push(second);
                    }
                }
            }
        }
        targets = extended;

        let own_points: Vec<MapPointId> = match map.get_keyframe(kf_id) {
            Some(kf) => kf.observed_map_points().map(|(_, id)| id).collect(),
            None => return,
        };

        // Project this keyframe's points into each neighbour...
        let mut fused = 0usize;
        for &target in &targets {
            let result = fuse_into_keyframe(&mut map, target, &own_points, 3.0);
            fused += result.fused + result.added;
        }

        // ...and every neighbour's points back into this keyframe.
        let mut neighbour_points: Vec<MapPointId> = Vec::new();
        for &target in &targets {
            if let Some(kf) = map.get_keyframe(target) {
                for (_, mp_id) in kf.observed_map_points() {
                    if !neighbour_points.contains(&mp_id) {
                        neighbour_points.push(mp_id);
                    }
                }
            }
        }
        let result = fuse_into_keyframe(&mut map, kf_id, &neighbour_points, 3.0);
        fused += result.fused + result.added;

        if fused > 0 {
            // Fusion moved observations around: refresh the survivors and
            // recompute the affected adjacency.
            let current: Vec<MapPointId> = map
                .get_keyframe(kf_id)
                .map(|kf| kf.observed_map_points().map(|(_, id)| id).collect())
                .unwrap_or_default();
            for mp_id in current {
                map.update_map_point_descriptor(mp_id);
                map.update_map_point_geometry(mp_id);
            }
            map.update_connections(kf_id);
            for target in targets {
                map.update_connections(target);
            }
            debug!(kf = %kf_id, fused, "neighbourhood fusion");
        }
    }

    /// Step 5: local BA with the three-phase pattern.
    fn local_bundle_adjustment(&self, kf_id: KeyFrameId) {
        let shared = Arc::clone(&self.shared);
        let should_abort = move || {
            shared
                .abort_local_ba
                .load(std::sync::atomic::Ordering::SeqCst)
                || shared.is_shutdown()
        };

        let problem = {
            let map = self.shared.map.read();
            match collect_local_ba(&map, kf_id) {
                Some(problem) => problem,
                None => return,
            }
        };

        let result = match solve_ba(&problem, &self.config.ba, &should_abort) {
            Some(result) => result,
            None => {
                debug!(kf = %kf_id, "local BA aborted");
                return;
            }
        };

        let mut map = self.shared.map.write();
        apply_local_ba(&mut map, &result);
        debug!(
            kf = %kf_id,
            iterations = result.iterations,
            initial = result.initial_error,
            final_error = result.final_error,
            "local BA"
        );
    }

    /// Step 6: cull covisible keyframes whose observations are redundant.
    ///
    /// A keyframe goes when at least 90% of the points it observes are seen
    /// by three or more other keyframes at the same or a finer scale.
    fn cull_keyframes(&self, current_id: KeyFrameId) {
        let mut map = self.shared.map.write();

        let candidates: Vec<KeyFrameId> = match map.get_keyframe(current_id) {
            Some(kf) => kf.covisibles().collect(),
            None => return,
        };

        let mut culled = Vec::new();
        for kf_id in candidates {
            if kf_id == current_id {
                continue;
            }
            let kf = match map.get_keyframe(kf_id) {
                Some(kf) if !kf.is_root() => kf,
                _ => continue,
            };

            let mut total = 0usize;
            let mut redundant = 0usize;
            for (idx, mp_id) in kf.observed_map_points() {
                let mp = match map
                    .resolve_map_point(mp_id)
                    .and_then(|id| map.get_map_point(id))
                {
                    Some(mp) => mp,
                    None => continue,
                };
                total += 1;

                let octave = kf.features[idx].octave;
                let observers_at_scale = mp
                    .observations
                    .iter()
                    .filter(|(&obs_kf, &obs_idx)| {
                        obs_kf != kf_id
                            && map
                                .get_keyframe(obs_kf)
                                .and_then(|okf| okf.features.get(obs_idx))
                                .map(|f| f.octave <= octave)
                                .unwrap_or(false)
                    })
                    .count();
                if observers_at_scale >= self.config.redundant_observers {
                    redundant += 1;
                }
            }

            if total > 0 && redundant as f64 >= self.config.keyframe_redundancy * total as f64 {
                culled.push(kf_id);
            }
        }

        for kf_id in culled {
            if map.erase_keyframe(kf_id) {
                self.shared.keyframe_db.write().erase(kf_id);
                info!(kf = %kf_id, "redundant keyframe culled");
            }
        }
    }

    /// The id the reserved stream will hand out next (diagnostics/tests).
    pub fn next_map_point_id(&self) -> u64 {
        self.next_mp_id
    }
}

/// Spawn the worker on its own thread.
pub fn spawn_local_mapper(
    shared: Arc<SharedState>,
    receiver: Receiver<KeyFrameInsertion>,
    lc_sender: Option<Sender<KeyFrameId>>,
    first_mp_id: u64,
    mp_id_span: u64,
    config: LocalMappingConfig,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("local-mapping".into())
        .spawn(move || {
            let mut worker = LocalMapper::new(shared, lc_sender, first_mp_id, mp_id_span, config);
            worker.run(receiver);
        })
        .expect("failed to spawn local mapping thread")
}
