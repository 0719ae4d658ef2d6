//! Map data model: ids, frames, keyframes, map points, and the map itself.

pub mod frame;
pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use frame::{
    bow_score, shared_words, BowVector, CameraIntrinsics, Descriptor, Feature, Frame, ScalePyramid,
    DESCRIPTOR_BYTES,
};
pub use keyframe::{KeyFrame, MIN_COVISIBILITY_WEIGHT};
pub use map::{Map, MapChangeEvent};
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId, TrackerId};
