//! Mapper notification events.
//!
//! Observers are channel sinks rather than callback objects: notifications
//! are enqueued and consumed outside any map lock, so a slow subscriber can
//! never re-enter a locked section.

use crate::geometry::SE3;
use crate::map::{MapChangeEvent, TrackerId};

/// Event fanned out to every subscribed observer.
#[derive(Debug, Clone)]
pub enum MapperEvent {
    /// Entities were added, updated, or erased.
    MapChanged(MapChangeEvent),
    /// The map was cleared; clients must discard their mirrors and re-login.
    Reset,
    /// A tracker published a new pose estimate.
    TrackerPose { tracker: TrackerId, pose: SE3 },
}
