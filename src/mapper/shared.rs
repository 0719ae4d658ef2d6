//! State shared between the mapper facade and its worker threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::database::KeyFrameDatabase;
use crate::map::Map;

use super::events::MapperEvent;

/// Acknowledged pause handshake.
///
/// The requesting side calls [`PauseControl::request`] then
/// [`PauseControl::wait_paused`]; the worker observes the request at its next
/// queue check, acknowledges, and blocks until [`PauseControl::resume`].
#[derive(Default)]
pub struct PauseControl {
    state: Mutex<PauseState>,
    condvar: Condvar,
}

#[derive(Default)]
struct PauseState {
    requested: bool,
    paused: bool,
}

impl PauseControl {
    pub fn request(&self) {
        self.state.lock().requested = true;
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        state.requested = false;
        self.condvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        self.state.lock().requested
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Block until the worker acknowledges, up to `timeout`.
    ///
    /// Returns whether the acknowledgement arrived.
    pub fn wait_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.paused {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return state.paused;
            }
        }
        true
    }

    /// Worker side: acknowledge the pause and block until resumed.
    ///
    /// `keep_waiting` is polled so a shutdown can break the wait.
    pub fn acknowledge_and_wait(&self, keep_waiting: &dyn Fn() -> bool) {
        let mut state = self.state.lock();
        state.paused = true;
        self.condvar.notify_all();
        while state.requested && keep_waiting() {
            self.condvar
                .wait_for(&mut state, Duration::from_millis(50));
        }
        state.paused = false;
        self.condvar.notify_all();
    }
}

/// Shared state: the map, the place-recognition index, worker control flags,
/// and the observer fan-out.
pub struct SharedState {
    /// The map-update lock. Writers are structural mutations and correction
    /// phases; tracker-facing reads take the read side.
    pub map: RwLock<Map>,

    pub keyframe_db: RwLock<KeyFrameDatabase>,

    pub shutdown: AtomicBool,

    /// Raised by the facade when a fresh keyframe is waiting, so local BA
    /// finishes early.
    pub abort_local_ba: AtomicBool,

    /// Cleared while the local mapping queue is over the backpressure
    /// threshold or the worker is paused or resetting.
    pub accepting_keyframes: AtomicBool,

    /// Reset requests, acknowledged per worker.
    pub local_reset_requested: AtomicBool,
    pub loop_reset_requested: AtomicBool,

    /// Global BA lifecycle.
    pub gba_running: AtomicBool,
    pub gba_abort: AtomicBool,

    /// Pause handshake for the local mapping worker.
    pub pause: PauseControl,

    observers: Mutex<Vec<Sender<MapperEvent>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Map::new()),
            keyframe_db: RwLock::new(KeyFrameDatabase::new()),
            shutdown: AtomicBool::new(false),
            abort_local_ba: AtomicBool::new(false),
            accepting_keyframes: AtomicBool::new(true),
            local_reset_requested: AtomicBool::new(false),
            loop_reset_requested: AtomicBool::new(false),
            gba_running: AtomicBool::new(false),
            gba_abort: AtomicBool::new(false),
            pause: PauseControl::default(),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // A paused worker must wake to observe the shutdown.
        self.pause.resume();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn accept_keyframes(&self) -> bool {
        self.accepting_keyframes.load(Ordering::SeqCst)
    }

    pub fn set_accept_keyframes(&self, value: bool) {
        self.accepting_keyframes.store(value, Ordering::SeqCst);
    }

    /// Register an observer; events arrive on the returned channel.
    pub fn subscribe(&self) -> Receiver<MapperEvent> {
        let (tx, rx) = unbounded();
        self.observers.lock().push(tx);
        rx
    }

    /// Fan an event out to every live observer, dropping dead ones.
    pub fn notify(&self, event: MapperEvent) {
        self.observers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Publish the map changes accumulated since the last drain, if any.
    pub fn publish_map_changes(&self) {
        let event = self.map.write().take_changes();
        if !event.is_empty() {
            self.notify(MapperEvent::MapChanged(event));
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}
