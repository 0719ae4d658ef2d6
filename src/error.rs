//! Crate-wide error type.
//!
//! Worker threads never propagate a single-keyframe failure upward; these
//! variants surface at the facade and transport boundaries, where protocol
//! and invariant violations become `ReplyCode::Failed` replies and
//! configuration problems abort startup.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker {0} is not logged in")]
    TrackerNotLoggedIn(u32),

    #[error("maximum number of trackers reached")]
    TrackersExhausted,

    #[error("the map may only be initialized once")]
    AlreadyInitialized,

    #[error("only tracker 0 may initialize the map")]
    NotInitializingTracker,

    #[error("id {id} does not belong to tracker {tracker}'s stream")]
    IdOutsideStream { id: u64, tracker: u32 },

    #[error("duplicate or out-of-order id {0}")]
    StaleId(u64),

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("connection closed")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
