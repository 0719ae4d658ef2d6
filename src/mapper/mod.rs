//! The Mapper facade: tracker registration, id-stream allocation, keyframe
//! admission, pose publication, and map-change fan-out.
//!
//! [`Mapper`] is the one interface trackers program against. The in-process
//! [`MapperServer`] owns the authoritative map and the worker threads; the
//! out-of-process [`MapperClient`](crate::net::client::MapperClient) proxies
//! the same trait over the wire.

pub mod events;
pub mod server;
pub mod shared;

use crossbeam_channel::Receiver;

use crate::error::Result;
use crate::geometry::SE3;
use crate::local_mapping::KeyFrameInsertion;
use crate::map::{Frame, KeyFrame, KeyFrameId, MapPoint, TrackerId};

pub use events::MapperEvent;
pub use server::MapperServer;
pub use shared::SharedState;

/// Maximum number of concurrently logged-in trackers.
pub const MAX_TRACKERS: u32 = 2;

/// Stride of each tracker's keyframe id stream.
pub const KEYFRAME_ID_SPAN: u32 = MAX_TRACKERS;

/// Stride of the map point id streams. One more than the keyframe span:
/// local mapping does not create keyframes, but it does create map points,
/// and the extra residue class is reserved for it.
pub const MAPPOINT_ID_SPAN: u32 = MAX_TRACKERS + 1;

/// First id of the map point stream reserved for local mapping.
pub const FIRST_MAPPOINT_ID_LOCALMAPPER: u64 = MAX_TRACKERS as u64;

/// Id-stream assignment returned by a successful login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerLogin {
    pub tracker_id: TrackerId,
    pub first_keyframe_id: u64,
    pub keyframe_id_span: u32,
    pub first_map_point_id: u64,
    pub map_point_id_span: u32,
}

/// The mapping facade shared by the in-process server and the wire proxy.
pub trait Mapper {
    /// Register a tracker, seeding its id streams.
    ///
    /// Fails with [`Error::TrackersExhausted`](crate::error::Error) once
    /// `MAX_TRACKERS` are connected.
    fn login_tracker(&self, pivot_calib: &SE3) -> Result<TrackerLogin>;

    fn logout_tracker(&self, id: TrackerId) -> Result<()>;

    /// Admit a keyframe into the mapping pipeline.
    ///
    /// Validates the id-stream invariants, then enqueues. `Ok(false)` is the
    /// backpressure signal: the queue is saturated or the worker is not
    /// accepting; the tracker should retry with its next keyframe.
    fn insert_keyframe(&self, tracker: TrackerId, insertion: KeyFrameInsertion) -> Result<bool>;

    /// Seed an empty map from a monocular initialisation pair.
    ///
    /// Only tracker 0 may initialise, and only once.
    fn initialize_mono(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf1: KeyFrame,
        kf2: KeyFrame,
    ) -> Result<()>;

    /// Seed an empty map from a single stereo/RGB-D keyframe.
    fn initialize_stereo(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf: KeyFrame,
    ) -> Result<()>;

    fn initialized(&self) -> bool;

    fn update_pose(&self, tracker: TrackerId, pose: &SE3) -> Result<()>;

    fn tracker_poses(&self) -> Vec<(TrackerId, SE3)>;

    fn tracker_pivots(&self) -> Vec<(TrackerId, SE3)>;

    fn detect_relocalization_candidates(&self, frame: &Frame) -> Vec<KeyFrameId>;

    /// Whether the local mapping worker currently admits keyframes.
    fn accept_keyframes(&self) -> bool;

    /// Whether loop closing has asked local mapping to pause.
    fn pause_requested(&self) -> bool;

    fn keyframes_in_map(&self) -> usize;

    fn map_points_in_map(&self) -> usize;

    fn loops_in_map(&self) -> u32;

    /// Monotonic counter bumped on large mutations (loop close, GBA).
    fn last_big_change_index(&self) -> u64;

    /// Clear the map and all tracker records; subscribers receive a reset
    /// notification and must re-login.
    fn reset(&self);

    /// Register an observer for map-change, reset, and pose events.
    fn subscribe(&self) -> Receiver<MapperEvent>;
}
