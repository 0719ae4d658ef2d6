//! Local Mapping: keyframe insertion, map point creation and culling, and
//! local bundle adjustment.

pub mod local_mapper;
pub mod triangulation;

pub use local_mapper::{
    spawn_local_mapper, KeyFrameInsertion, LocalMapper, LocalMappingConfig,
    QUEUE_BACKPRESSURE_THRESHOLD, QUEUE_CAPACITY,
};
pub use triangulation::{create_new_map_points, TriangulationConfig};
