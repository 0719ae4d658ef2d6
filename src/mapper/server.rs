//! The authoritative mapper: owns the map and runs the worker threads.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::SE3;
use crate::local_mapping::{
    spawn_local_mapper, KeyFrameInsertion, LocalMappingConfig, QUEUE_CAPACITY,
};
use crate::loop_closing::{spawn_loop_closer, LoopClosingConfig};
use crate::map::{Frame, KeyFrame, KeyFrameId, MapPoint, TrackerId};

use super::events::MapperEvent;
use super::shared::SharedState;
use super::{
    Mapper, TrackerLogin, FIRST_MAPPOINT_ID_LOCALMAPPER, KEYFRAME_ID_SPAN, MAPPOINT_ID_SPAN,
    MAX_TRACKERS,
};

const RESET_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-tracker bookkeeping, guarded by the login mutex.
#[derive(Debug, Clone)]
struct TrackerStatus {
    connected: bool,
    next_keyframe_id: u64,
    next_map_point_id: u64,
    pivot_calib: SE3,
    pose: Option<SE3>,
}

impl TrackerStatus {
    fn seeded(slot: u32) -> Self {
        Self {
            connected: false,
            next_keyframe_id: slot as u64,
            next_map_point_id: slot as u64,
            pivot_calib: SE3::identity(),
            pose: None,
        }
    }
}

struct ServerState {
    trackers: Vec<TrackerStatus>,
    initialized: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MapperServerConfig {
    pub local_mapping: LocalMappingConfig,
    pub loop_closing: LoopClosingConfig,
}

/// In-process mapping back-end.
pub struct MapperServer {
    shared: Arc<SharedState>,
    state: Mutex<ServerState>,
    kf_sender: Sender<KeyFrameInsertion>,
    local_mapping_handle: Option<JoinHandle<()>>,
    loop_closing_handle: Option<JoinHandle<()>>,
}

impl MapperServer {
    pub fn new(config: MapperServerConfig) -> Self {
        let shared = Arc::new(SharedState::new());

        let (kf_sender, kf_receiver) = bounded::<KeyFrameInsertion>(QUEUE_CAPACITY);
        let (lc_sender, lc_receiver) = bounded::<KeyFrameId>(QUEUE_CAPACITY);

        let local_mapping_handle = spawn_local_mapper(
            Arc::clone(&shared),
            kf_receiver,
            Some(lc_sender),
            FIRST_MAPPOINT_ID_LOCALMAPPER,
            MAPPOINT_ID_SPAN as u64,
            config.local_mapping,
        );
        let loop_closing_handle =
            spawn_loop_closer(Arc::clone(&shared), lc_receiver, config.loop_closing);

        Self {
            shared,
            state: Mutex::new(ServerState {
                trackers: (0..MAX_TRACKERS).map(TrackerStatus::seeded).collect(),
                initialized: false,
            }),
            kf_sender,
            local_mapping_handle: Some(local_mapping_handle),
            loop_closing_handle: Some(loop_closing_handle),
        }
    }

    /// The shared state, for transports publishing map changes.
    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    /// Stop both workers and wait for them.
    pub fn shutdown(&mut self) {
        self.shared.request_shutdown();
        if let Some(handle) = self.local_mapping_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.loop_closing_handle.take() {
            let _ = handle.join();
        }
    }

    fn validate_tracker(&self, state: &ServerState, id: TrackerId) -> Result<()> {
        let slot = state
            .trackers
            .get(id.0 as usize)
            .ok_or(Error::TrackerNotLoggedIn(id.0))?;
        if !slot.connected {
            return Err(Error::TrackerNotLoggedIn(id.0));
        }
        Ok(())
    }

    /// Id-stream checks for one insertion; bumps nothing.
    fn validate_insertion(
        &self,
        state: &ServerState,
        tracker: TrackerId,
        insertion: &KeyFrameInsertion,
    ) -> Result<()> {
        let status = &state.trackers[tracker.0 as usize];
        let kf_id = insertion.keyframe.id.0;

        if kf_id % KEYFRAME_ID_SPAN as u64 != tracker.0 as u64 {
            return Err(Error::IdOutsideStream {
                id: kf_id,
                tracker: tracker.0,
            });
        }
        if kf_id < status.next_keyframe_id {
            return Err(Error::StaleId(kf_id));
        }

        for (_, mp) in &insertion.created_map_points {
            if mp.id.0 % MAPPOINT_ID_SPAN as u64 != tracker.0 as u64 {
                return Err(Error::IdOutsideStream {
                    id: mp.id.0,
                    tracker: tracker.0,
                });
            }
        }
        Ok(())
    }

    /// Bulk-seed the empty map (shared by mono and stereo initialisation).
    fn initialize(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        keyframes: Vec<KeyFrame>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        self.validate_tracker(&state, tracker)?;
        if state.initialized {
            return Err(Error::AlreadyInitialized);
        }
        if tracker.0 != 0 {
            return Err(Error::NotInitializingTracker);
        }

        {
            let mut map = self.shared.map.write();
            let mut db = self.shared.keyframe_db.write();

            // Validate the whole batch before touching anything, so a bad
            // initialisation leaves the server unchanged.
            for kf in &keyframes {
                if kf.id.0 % KEYFRAME_ID_SPAN as u64 != tracker.0 as u64 {
                    return Err(Error::IdOutsideStream {
                        id: kf.id.0,
                        tracker: tracker.0,
                    });
                }
                if map.contains_keyframe(kf.id) {
                    return Err(Error::StaleId(kf.id.0));
                }
            }
            for mp in &map_points {
                if mp.id.0 % MAPPOINT_ID_SPAN as u64 != tracker.0 as u64 {
                    return Err(Error::IdOutsideStream {
                        id: mp.id.0,
                        tracker: tracker.0,
                    });
                }
            }

            for kf in &keyframes {
                let status = &mut state.trackers[tracker.0 as usize];
                if status.next_keyframe_id <= kf.id.0 {
                    status.next_keyframe_id = kf.id.0 + KEYFRAME_ID_SPAN as u64;
                }
            }

            for kf in keyframes {
                let id = kf.id;
                let bow = kf.bow.clone();
                map.insert_keyframe(kf);
                db.add(id, &bow);
            }

            for mp in map_points {
                let mp_id = mp.id;
                let observations: Vec<(KeyFrameId, usize)> = mp
                    .observations
                    .iter()
                    .map(|(&kf, &idx)| (kf, idx))
                    .collect();
                let status = &mut state.trackers[tracker.0 as usize];
                if status.next_map_point_id <= mp_id.0 {
                    status.next_map_point_id = mp_id.0 + MAPPOINT_ID_SPAN as u64;
                }
                map.insert_map_point(mp);
                for (kf_id, idx) in observations {
                    map.associate(kf_id, idx, mp_id);
                }
                map.update_map_point_geometry(mp_id);
            }

            for kf_id in map.all_keyframes() {
                map.attach_to_spanning_tree(kf_id);
            }
        }

        state.initialized = true;
        drop(state);

        self.shared.publish_map_changes();
        info!(tracker = %tracker, "map initialized");
        Ok(())
    }
}

impl Mapper for MapperServer {
    fn login_tracker(&self, pivot_calib: &SE3) -> Result<TrackerLogin> {
        let mut state = self.state.lock();
        let slot = state
            .trackers
            .iter()
            .position(|t| !t.connected)
            .ok_or(Error::TrackersExhausted)?;

        let status = &mut state.trackers[slot];
        status.connected = true;
        status.pivot_calib = pivot_calib.clone();

        let login = TrackerLogin {
            tracker_id: TrackerId::new(slot as u32),
            first_keyframe_id: status.next_keyframe_id,
            keyframe_id_span: KEYFRAME_ID_SPAN,
            first_map_point_id: status.next_map_point_id,
            map_point_id_span: MAPPOINT_ID_SPAN,
        };
        info!(tracker = %login.tracker_id, "tracker logged in");
        Ok(login)
    }

    fn logout_tracker(&self, id: TrackerId) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .trackers
            .get_mut(id.0 as usize)
            .ok_or(Error::TrackerNotLoggedIn(id.0))?;
        slot.connected = false;
        info!(tracker = %id, "tracker logged out");
        Ok(())
    }

    fn insert_keyframe(&self, tracker: TrackerId, insertion: KeyFrameInsertion) -> Result<bool> {
        let mut state = self.state.lock();
        self.validate_tracker(&state, tracker)?;
        self.validate_insertion(&state, tracker, &insertion)?;

        if !self.shared.accept_keyframes() {
            debug!(tracker = %tracker, "keyframe refused: worker not accepting");
            return Ok(false);
        }

        let kf_id = insertion.keyframe.id.0;
        let created_ids: Vec<u64> = insertion
            .created_map_points
            .iter()
            .map(|(_, mp)| mp.id.0)
            .collect();

        match self.kf_sender.try_send(insertion) {
            Ok(()) => {
                // Fresh work is waiting: an in-flight local BA should wrap up.
                self.shared
                    .abort_local_ba
                    .store(true, Ordering::SeqCst);
                let status = &mut state.trackers[tracker.0 as usize];
                status.next_keyframe_id = kf_id + KEYFRAME_ID_SPAN as u64;
                for id in created_ids {
                    if status.next_map_point_id <= id {
                        status.next_map_point_id = id + MAPPOINT_ID_SPAN as u64;
                    }
                }
                Ok(true)
            }
            Err(TrySendError::Full(_)) => {
                debug!(tracker = %tracker, "keyframe refused: queue full");
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Protocol("local mapping worker is gone".into()))
            }
        }
    }

    fn initialize_mono(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf1: KeyFrame,
        kf2: KeyFrame,
    ) -> Result<()> {
        self.initialize(tracker, map_points, vec![kf1, kf2])
    }

    fn initialize_stereo(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf: KeyFrame,
    ) -> Result<()> {
        self.initialize(tracker, map_points, vec![kf])
    }

    fn initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn update_pose(&self, tracker: TrackerId, pose: &SE3) -> Result<()> {
        {
            let mut state = self.state.lock();
            self.validate_tracker(&state, tracker)?;
            state.trackers[tracker.0 as usize].pose = Some(pose.clone());
        }
        self.shared.notify(MapperEvent::TrackerPose {
            tracker,
            pose: pose.clone(),
        });
        Ok(())
    }

    fn tracker_poses(&self) -> Vec<(TrackerId, SE3)> {
        self.state
            .lock()
            .trackers
            .iter()
            .enumerate()
            .filter_map(|(i, t)| {
                t.pose
                    .as_ref()
                    .map(|pose| (TrackerId::new(i as u32), pose.clone()))
            })
            .collect()
    }

    fn tracker_pivots(&self) -> Vec<(TrackerId, SE3)> {
        self.state
            .lock()
            .trackers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.connected)
            .map(|(i, t)| (TrackerId::new(i as u32), t.pivot_calib.clone()))
            .collect()
    }

    fn detect_relocalization_candidates(&self, frame: &Frame) -> Vec<KeyFrameId> {
        let map = self.shared.map.read();
        self.shared
            .keyframe_db
            .read()
            .detect_relocalization_candidates(&map, &frame.bow)
    }

    fn accept_keyframes(&self) -> bool {
        self.shared.accept_keyframes()
    }

    fn pause_requested(&self) -> bool {
        self.shared.pause.is_requested()
    }

    fn keyframes_in_map(&self) -> usize {
        self.shared.map.read().keyframes_in_map()
    }

    fn map_points_in_map(&self) -> usize {
        self.shared.map.read().map_points_in_map()
    }

    fn loops_in_map(&self) -> u32 {
        self.shared.map.read().loops_in_map()
    }

    fn last_big_change_index(&self) -> u64 {
        self.shared.map.read().last_big_change_index()
    }

    fn reset(&self) {
        info!("mapper reset requested");
        self.shared.set_accept_keyframes(false);

        // Both workers cancel their current iteration at the next
        // queue-check point and drain their queues.
        self.shared
            .local_reset_requested
            .store(true, Ordering::SeqCst);
        self.shared
            .loop_reset_requested
            .store(true, Ordering::SeqCst);
        self.shared.gba_abort.store(true, Ordering::SeqCst);
        // A paused worker cannot observe the reset request.
        self.shared.pause.resume();

        let deadline = Instant::now() + RESET_ACK_TIMEOUT;
        while Instant::now() < deadline {
            let pending = self.shared.local_reset_requested.load(Ordering::SeqCst)
                || self.shared.loop_reset_requested.load(Ordering::SeqCst);
            if !pending {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if self.shared.local_reset_requested.load(Ordering::SeqCst)
            || self.shared.loop_reset_requested.load(Ordering::SeqCst)
        {
            warn!("worker reset acknowledgement timed out");
        }

        {
            let mut map = self.shared.map.write();
            map.clear();
            // The wholesale erasure is subsumed by the reset notification.
            let _ = map.take_changes();
        }
        self.shared.keyframe_db.write().clear();

        {
            let mut state = self.state.lock();
            state.initialized = false;
            state.trackers = (0..MAX_TRACKERS).map(TrackerStatus::seeded).collect();
        }

        self.shared.notify(MapperEvent::Reset);
        self.shared.set_accept_keyframes(true);
        info!("mapper reset complete");
    }

    fn subscribe(&self) -> Receiver<MapperEvent> {
        self.shared.subscribe()
    }
}

impl Drop for MapperServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
