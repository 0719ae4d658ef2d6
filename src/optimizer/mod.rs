//! Optimisation routines: local BA, global BA, and the essential-graph
//! pose solver.
//!
//! Every optimisation follows the same three-phase pattern so no lock is
//! held while solving:
//! 1. COLLECT - snapshot the problem under the map read lock
//! 2. SOLVE   - iterate on the snapshot, no lock held
//! 3. APPLY   - write results back under the map write lock

pub mod ba;
pub mod global_ba;
pub mod pose_graph;

pub use ba::{apply_local_ba, collect_local_ba, solve_ba, BAConfig, BAProblem, BAResult};
pub use global_ba::{apply_global_ba, collect_global_ba};
pub use pose_graph::{
    apply_pose_graph, collect_pose_graph, solve_pose_graph, PoseGraphConfig, PoseGraphProblem,
    PoseGraphResult,
};
