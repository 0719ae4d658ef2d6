//! Out-of-process mapper proxy.
//!
//! `MapperClient` implements the same [`Mapper`] facade as the in-process
//! server: synchronous calls serialise and round-trip over the request
//! socket, while a subscription thread keeps a local map *mirror* in step
//! with published map-change events. The mirror is never mutated directly
//! by local calls.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::geometry::SE3;
use crate::local_mapping::KeyFrameInsertion;
use crate::map::{Frame, KeyFrame, KeyFrameId, MapChangeEvent, MapPoint, TrackerId};
use crate::mapper::{Mapper, MapperEvent, SharedState, TrackerLogin};
use crate::wire::{
    decode_map_change, ByteReader, MessageId, PublishHeader, Reply, ReplyCode, Request, ServiceId,
};

use super::framing::{read_frame, write_frame};

/// How long a synchronous call may wait for its reply.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SUBSCRIBE_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Client-side mapper proxy with a subscription-fed map mirror.
pub struct MapperClient {
    request_stream: Mutex<TcpStream>,
    mirror: Arc<SharedState>,
    initialized: AtomicBool,
    stop: Arc<AtomicBool>,
    subscriber_handle: Option<JoinHandle<()>>,
}

impl MapperClient {
    /// Connect to both server sockets and start the subscription thread.
    pub fn connect(server_address: &str, publisher_address: &str) -> Result<Self> {
        let request_stream = TcpStream::connect(server_address)?;
        request_stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;

        let subscribe_stream = TcpStream::connect(publisher_address)?;
        subscribe_stream.set_read_timeout(Some(SUBSCRIBE_READ_TIMEOUT))?;

        let mirror = Arc::new(SharedState::new());
        let stop = Arc::new(AtomicBool::new(false));

        let subscriber_handle = {
            let mirror = Arc::clone(&mirror);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("map-subscriber".into())
                .spawn(move || run_subscriber(subscribe_stream, mirror, stop))
                .expect("failed to spawn subscriber thread")
        };

        info!(server_address, publisher_address, "mapper client connected");
        Ok(Self {
            request_stream: Mutex::new(request_stream),
            mirror,
            initialized: AtomicBool::new(false),
            stop,
            subscriber_handle: Some(subscriber_handle),
        })
    }

    /// The local map mirror (read-only use: rendering, relocalisation).
    pub fn mirror(&self) -> &Arc<SharedState> {
        &self.mirror
    }

    /// Liveness check: sends a greeting and expects one back.
    pub fn greet(&self) -> Result<String> {
        match self.call(Request::Greet {
            message: "Hello".into(),
        })? {
            Reply::General {
                code: ReplyCode::Succeeded,
                message,
            } => Ok(message),
            other => Err(reply_error(other)),
        }
    }

    pub fn disconnect(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.subscriber_handle.take() {
            let _ = handle.join();
        }
    }

    /// One synchronous round-trip.
    fn call(&self, request: Request) -> Result<Reply> {
        let service = request.service_id();
        let mut stream = self.request_stream.lock();
        write_frame(&mut stream, &request.encode())?;
        match read_frame(&mut stream)? {
            Some(payload) => Reply::decode(service, &payload),
            None => Err(Error::Protocol(format!(
                "request {:?} timed out waiting for reply",
                service
            ))),
        }
    }
}

/// Convert a failure reply into the matching error.
fn reply_error(reply: Reply) -> Error {
    match reply {
        Reply::General { message, .. } => Error::Protocol(message),
        other => Error::Protocol(format!("unexpected reply {:?}", other)),
    }
}

impl Mapper for MapperClient {
    fn login_tracker(&self, pivot_calib: &SE3) -> Result<TrackerLogin> {
        match self.call(Request::LoginTracker {
            pivot_calib: pivot_calib.clone(),
        })? {
            Reply::Login {
                code: ReplyCode::Succeeded,
                tracker_id,
                first_keyframe_id,
                keyframe_id_span,
                first_map_point_id,
                map_point_id_span,
            } => Ok(TrackerLogin {
                tracker_id: TrackerId::new(tracker_id),
                first_keyframe_id,
                keyframe_id_span,
                first_map_point_id,
                map_point_id_span,
            }),
            other => Err(reply_error(other)),
        }
    }

    fn logout_tracker(&self, id: TrackerId) -> Result<()> {
        match self.call(Request::LogoutTracker { tracker: id })? {
            Reply::General {
                code: ReplyCode::Succeeded,
                ..
            } => Ok(()),
            other => Err(reply_error(other)),
        }
    }

    fn insert_keyframe(&self, tracker: TrackerId, insertion: KeyFrameInsertion) -> Result<bool> {
        debug_assert_eq!(tracker, insertion.tracker);
        match self.call(insertion.into())? {
            Reply::InsertKeyFrame {
                code: ReplyCode::Succeeded,
                inserted,
            } => Ok(inserted),
            other => Err(reply_error(other)),
        }
    }

    fn initialize_mono(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf1: KeyFrame,
        kf2: KeyFrame,
    ) -> Result<()> {
        match self.call(Request::InitializeMono {
            tracker,
            map_points,
            kf1: Box::new(kf1),
            kf2: Box::new(kf2),
        })? {
            Reply::General {
                code: ReplyCode::Succeeded,
                ..
            } => {
                self.initialized.store(true, Ordering::SeqCst);
                Ok(())
            }
            other => Err(reply_error(other)),
        }
    }

    fn initialize_stereo(
        &self,
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf: KeyFrame,
    ) -> Result<()> {
        match self.call(Request::InitializeStereo {
            tracker,
            map_points,
            kf: Box::new(kf),
        })? {
            Reply::General {
                code: ReplyCode::Succeeded,
                ..
            } => {
                self.initialized.store(true, Ordering::SeqCst);
                Ok(())
            }
            other => Err(reply_error(other)),
        }
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn update_pose(&self, tracker: TrackerId, pose: &SE3) -> Result<()> {
        match self.call(Request::UpdatePose {
            tracker,
            pose: pose.clone(),
        })? {
            Reply::General {
                code: ReplyCode::Succeeded,
                ..
            } => Ok(()),
            other => Err(reply_error(other)),
        }
    }

    fn tracker_poses(&self) -> Vec<(TrackerId, SE3)> {
        match self.call(Request::GetTrackerPoses) {
            Ok(Reply::TrackerPoses { poses, .. }) => poses,
            _ => Vec::new(),
        }
    }

    fn tracker_pivots(&self) -> Vec<(TrackerId, SE3)> {
        match self.call(Request::GetTrackerPivots) {
            Ok(Reply::TrackerPoses { poses, .. }) => poses,
            _ => Vec::new(),
        }
    }

    fn detect_relocalization_candidates(&self, frame: &Frame) -> Vec<KeyFrameId> {
        // Served from the mirror; no round-trip.
        let map = self.mirror.map.read();
        self.mirror
            .keyframe_db
            .read()
            .detect_relocalization_candidates(&map, &frame.bow)
    }

    fn accept_keyframes(&self) -> bool {
        // The admission verdict arrives with each insert reply.
        true
    }

    fn pause_requested(&self) -> bool {
        false
    }

    fn keyframes_in_map(&self) -> usize {
        self.mirror.map.read().keyframes_in_map()
    }

    fn map_points_in_map(&self) -> usize {
        self.mirror.map.read().map_points_in_map()
    }

    fn loops_in_map(&self) -> u32 {
        self.mirror.map.read().loops_in_map()
    }

    fn last_big_change_index(&self) -> u64 {
        self.mirror.map.read().last_big_change_index()
    }

    fn reset(&self) {
        if let Err(e) = self.call(Request::Reset) {
            warn!(error = %e, "reset round-trip failed");
        }
        // The mirror is also cleared when the reset publication arrives;
        // clearing now keeps local reads consistent in the meantime.
        clear_mirror(&self.mirror);
        self.initialized.store(false, Ordering::SeqCst);
    }

    fn subscribe(&self) -> Receiver<MapperEvent> {
        self.mirror.subscribe()
    }
}

impl Drop for MapperClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn clear_mirror(mirror: &SharedState) {
    let mut map = mirror.map.write();
    map.clear();
    let _ = map.take_changes();
    drop(map);
    mirror.keyframe_db.write().clear();
}

/// Apply published frames to the mirror until stopped.
fn run_subscriber(mut stream: TcpStream, mirror: Arc<SharedState>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        let payload = match read_frame(&mut stream) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(Error::Disconnected) => {
                warn!("publisher connection closed");
                break;
            }
            Err(e) => {
                warn!(error = %e, "subscription read failed");
                break;
            }
        };

        if let Err(e) = apply_publication(&payload, &mirror) {
            // A malformed publication is dropped; the next full update for
            // the affected entities repairs the mirror.
            warn!(error = %e, "dropping malformed publication");
        }
    }
    debug!("subscriber thread exiting");
}

fn apply_publication(payload: &[u8], mirror: &SharedState) -> Result<()> {
    let mut r = ByteReader::new(payload);
    let header = PublishHeader::decode(&mut r)?;

    match header.message_id {
        MessageId::MapChanged => {
            let change = decode_map_change(&mut r)?;
            let mut event = MapChangeEvent::default();

            let mut map = mirror.map.write();
            let mut db = mirror.keyframe_db.write();
            for kf in change.updated_keyframes {
                event.updated_keyframes.push(kf.id);
                db.erase(kf.id);
                db.add(kf.id, &kf.bow);
                map.sync_keyframe(kf);
            }
            for id in change.erased_keyframes {
                event.erased_keyframes.push(id);
                db.erase(id);
                map.sync_erase_keyframe(id);
            }
            for mp in change.updated_map_points {
                event.updated_map_points.push(mp.id);
                map.sync_map_point(mp);
            }
            for id in change.erased_map_points {
                event.erased_map_points.push(id);
                map.sync_erase_map_point(id);
            }
            let _ = map.take_changes();
            drop(db);
            drop(map);

            mirror.notify(MapperEvent::MapChanged(event));
        }
        MessageId::Reset => {
            clear_mirror(mirror);
            mirror.notify(MapperEvent::Reset);
        }
        MessageId::TrackerPoseUpdate => {
            let tracker = TrackerId::new(r.take_u32()?);
            let pose = SE3::from_matrix(&r.take_matrix4()?);
            mirror.notify(MapperEvent::TrackerPose { tracker, pose });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::{Descriptor, MapPointId};
    use crate::mapper::server::{MapperServer, MapperServerConfig};
    use crate::net::server::MapperService;
    use nalgebra::Vector3;
    use std::time::Instant;

    fn start_stack() -> (Arc<MapperServer>, MapperService, MapperClient) {
        let mapper = Arc::new(MapperServer::new(MapperServerConfig::default()));
        let service =
            MapperService::bind(Arc::clone(&mapper), "127.0.0.1:0", "127.0.0.1:0").unwrap();
        let client = MapperClient::connect(
            &service.request_addr().to_string(),
            &service.publisher_addr().to_string(),
        )
        .unwrap();
        (mapper, service, client)
    }

    fn wait_for<F: Fn() -> bool>(predicate: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for condition");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_greet_round_trip() {
        let (_mapper, _service, client) = start_stack();
        assert_eq!(client.greet().unwrap(), "World");
    }

    #[test]
    fn test_login_over_the_wire() {
        let (_mapper, _service, client) = start_stack();

        let login = client.login_tracker(&SE3::identity()).unwrap();
        assert_eq!(login.tracker_id, TrackerId::new(0));
        assert_eq!(login.first_keyframe_id, 0);
        assert_eq!(login.keyframe_id_span, 2);
        assert_eq!(login.map_point_id_span, 3);

        let second = client.login_tracker(&SE3::identity()).unwrap();
        assert_eq!(second.tracker_id, TrackerId::new(1));

        // Exhaustion surfaces as a failed reply with a message.
        match client.login_tracker(&SE3::identity()) {
            Err(Error::Protocol(message)) => assert!(message.contains("maximum")),
            other => panic!("expected protocol failure, got {:?}", other),
        }
    }

    #[test]
    fn test_insert_flows_to_server_and_mirror() {
        let (mapper, _service, client) = start_stack();
        let login = client.login_tracker(&SE3::identity()).unwrap();

        // Feature 0 sits exactly where the created point projects, so local
        // BA keeps the observation.
        let mut frame = frame_with_features(8);
        frame.features[0].u = 320.0;
        frame.features[0].v = 240.0;
        let mut insertion = KeyFrameInsertion {
            tracker: login.tracker_id,
            keyframe: KeyFrame::from_frame(KeyFrameId::new(0), frame),
            created_map_points: Vec::new(),
            matched_map_points: Vec::new(),
        };
        insertion.created_map_points.push((
            0,
            MapPoint::new(
                MapPointId::new(0),
                Vector3::new(0.0, 0.0, 5.0),
                Descriptor::default(),
                KeyFrameId::new(0),
            ),
        ));

        assert!(client.insert_keyframe(login.tracker_id, insertion).unwrap());

        // Authoritative side first...
        wait_for(|| mapper.keyframes_in_map() == 1);
        // ...then the mirror catches up from the publication.
        wait_for(|| client.keyframes_in_map() == 1);
        wait_for(|| client.map_points_in_map() >= 1);

        // The mirrored keyframe resolves its observation slots locally.
        let mirror = client.mirror();
        let map = mirror.map.read();
        let kf = map.get_keyframe(KeyFrameId::new(0)).unwrap();
        assert_eq!(kf.map_point(0), Some(MapPointId::new(0)));
    }

    #[test]
    fn test_stale_insert_fails_over_the_wire() {
        let (_mapper, _service, client) = start_stack();
        let login = client.login_tracker(&SE3::identity()).unwrap();

        let insertion = |id: u64| KeyFrameInsertion {
            tracker: login.tracker_id,
            keyframe: KeyFrame::from_frame(KeyFrameId::new(id), frame_with_features(4)),
            created_map_points: Vec::new(),
            matched_map_points: Vec::new(),
        };
        assert!(client.insert_keyframe(login.tracker_id, insertion(0)).unwrap());
        assert!(matches!(
            client.insert_keyframe(login.tracker_id, insertion(0)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_pose_updates_visible_to_peers() {
        let (_mapper, _service, client) = start_stack();
        let login = client.login_tracker(&SE3::identity()).unwrap();

        let pose = SE3::new(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(4.0, 5.0, 6.0),
        );
        client.update_pose(login.tracker_id, &pose).unwrap();

        let poses = client.tracker_poses();
        assert_eq!(poses.len(), 1);
        assert_eq!(poses[0].0, login.tracker_id);
        assert_eq!(poses[0].1.translation, pose.translation);
    }

    #[test]
    fn test_reset_propagates_to_mirror() {
        let (_mapper, _service, client) = start_stack();
        let login = client.login_tracker(&SE3::identity()).unwrap();

        let insertion = KeyFrameInsertion {
            tracker: login.tracker_id,
            keyframe: KeyFrame::from_frame(KeyFrameId::new(0), frame_with_features(4)),
            created_map_points: Vec::new(),
            matched_map_points: Vec::new(),
        };
        assert!(client.insert_keyframe(login.tracker_id, insertion).unwrap());
        wait_for(|| client.keyframes_in_map() == 1);

        let events = client.subscribe();
        client.reset();
        assert_eq!(client.keyframes_in_map(), 0);

        // The published reset notification reaches subscribers too.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match events.recv_timeout(Duration::from_millis(100)) {
                Ok(MapperEvent::Reset) => break,
                Ok(_) => {}
                Err(_) => assert!(Instant::now() < deadline, "no reset event"),
            }
        }

        // After reset the same tracker slot and ids are handed out again.
        let login = client.login_tracker(&SE3::identity()).unwrap();
        assert_eq!(login.tracker_id, TrackerId::new(0));
        assert_eq!(login.first_keyframe_id, 0);
    }
}
