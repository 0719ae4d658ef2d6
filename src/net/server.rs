//! Network front-end for the mapper: request dispatcher and publisher.
//!
//! Two sockets per the client/server split: a request/reply socket handling
//! synchronous facade calls, and a publish socket fanning map-change, reset,
//! and tracker-pose events out to every connected subscriber.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::local_mapping::KeyFrameInsertion;
use crate::mapper::{Mapper, MapperEvent, MapperServer};
use crate::wire::{
    encode_map_change, encode_pose_update, encode_reset, ByteWriter, MessageId, PublishHeader,
    Reply, ReplyCode, Request, SUBSCRIBE_ALL,
};

use super::framing::{read_frame, write_frame};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_millis(200);

/// The network service wrapping an in-process [`MapperServer`].
pub struct MapperService {
    stop: Arc<AtomicBool>,
    request_addr: std::net::SocketAddr,
    publisher_addr: std::net::SocketAddr,
    dispatcher_handle: Option<JoinHandle<()>>,
    publisher_handle: Option<JoinHandle<()>>,
}

impl MapperService {
    /// Bind both sockets and start the dispatcher and publisher threads.
    pub fn bind(
        mapper: Arc<MapperServer>,
        server_address: &str,
        publisher_address: &str,
    ) -> Result<Self> {
        let request_listener = TcpListener::bind(server_address)?;
        request_listener.set_nonblocking(true)?;
        let publish_listener = TcpListener::bind(publisher_address)?;
        publish_listener.set_nonblocking(true)?;
        let request_addr = request_listener.local_addr()?;
        let publisher_addr = publish_listener.local_addr()?;
        info!(%request_addr, %publisher_addr, "mapper service bound");

        let stop = Arc::new(AtomicBool::new(false));

        let dispatcher_handle = {
            let mapper = Arc::clone(&mapper);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("request-dispatcher".into())
                .spawn(move || run_dispatcher(request_listener, mapper, stop))
                .expect("failed to spawn request dispatcher")
        };

        let publisher_handle = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("publisher".into())
                .spawn(move || run_publisher(publish_listener, mapper, stop))
                .expect("failed to spawn publisher")
        };

        Ok(Self {
            stop,
            request_addr,
            publisher_addr,
            dispatcher_handle: Some(dispatcher_handle),
            publisher_handle: Some(publisher_handle),
        })
    }

    /// Address the request socket actually bound to.
    pub fn request_addr(&self) -> std::net::SocketAddr {
        self.request_addr
    }

    /// Address the publish socket actually bound to.
    pub fn publisher_addr(&self) -> std::net::SocketAddr {
        self.publisher_addr
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.publisher_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MapperService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accept request connections; each gets its own handler thread.
fn run_dispatcher(listener: TcpListener, mapper: Arc<MapperServer>, stop: Arc<AtomicBool>) {
    let handlers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "request client connected");
                let mapper = Arc::clone(&mapper);
                let stop = Arc::clone(&stop);
                let handle = std::thread::Builder::new()
                    .name("request-handler".into())
                    .spawn(move || handle_connection(stream, mapper, stop))
                    .expect("failed to spawn request handler");
                handlers.lock().push(handle);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "request accept failed");
                std::thread::sleep(ACCEPT_POLL);
            }
        }
    }

    for handle in handlers.lock().drain(..) {
        let _ = handle.join();
    }
    info!("request dispatcher exiting");
}

/// One request/reply exchange per frame until the client hangs up.
fn handle_connection(mut stream: TcpStream, mapper: Arc<MapperServer>, stop: Arc<AtomicBool>) {
    if stream.set_read_timeout(Some(CONNECTION_READ_TIMEOUT)).is_err() {
        return;
    }

    while !stop.load(Ordering::SeqCst) {
        let payload = match read_frame(&mut stream) {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(_) => break,
        };

        let reply = match Request::decode(&payload) {
            Ok(request) => dispatch(&*mapper, request),
            // Malformed input fails the call, not the session.
            Err(e) => Reply::failed(e.to_string()),
        };

        if write_frame(&mut stream, &reply.encode()).is_err() {
            break;
        }
    }
    debug!("request client disconnected");
}

/// The service-id → facade mapping.
fn dispatch(mapper: &MapperServer, request: Request) -> Reply {
    match request {
        Request::Greet { message } => {
            debug!(message = %message, "greet");
            Reply::General {
                code: ReplyCode::Succeeded,
                message: "World".into(),
            }
        }
        Request::LoginTracker { pivot_calib } => match mapper.login_tracker(&pivot_calib) {
            Ok(login) => Reply::Login {
                code: ReplyCode::Succeeded,
                tracker_id: login.tracker_id.0,
                first_keyframe_id: login.first_keyframe_id,
                keyframe_id_span: login.keyframe_id_span,
                first_map_point_id: login.first_map_point_id,
                map_point_id_span: login.map_point_id_span,
            },
            Err(e) => Reply::failed(e.to_string()),
        },
        Request::LogoutTracker { tracker } => match mapper.logout_tracker(tracker) {
            Ok(()) => Reply::succeeded(),
            Err(e) => Reply::failed(e.to_string()),
        },
        Request::InsertKeyFrame {
            tracker,
            keyframe,
            created_map_points,
            matched_map_points,
        } => {
            let insertion = KeyFrameInsertion {
                tracker,
                keyframe,
                created_map_points,
                matched_map_points,
            };
            match mapper.insert_keyframe(tracker, insertion) {
                Ok(inserted) => Reply::InsertKeyFrame {
                    code: ReplyCode::Succeeded,
                    inserted,
                },
                Err(e) => Reply::failed(e.to_string()),
            }
        }
        Request::UpdatePose { tracker, pose } => match mapper.update_pose(tracker, &pose) {
            Ok(()) => Reply::succeeded(),
            Err(e) => Reply::failed(e.to_string()),
        },
        Request::InitializeMono {
            tracker,
            map_points,
            kf1,
            kf2,
        } => match mapper.initialize_mono(tracker, map_points, *kf1, *kf2) {
            Ok(()) => Reply::succeeded(),
            Err(e) => Reply::failed(e.to_string()),
        },
        Request::InitializeStereo {
            tracker,
            map_points,
            kf,
        } => match mapper.initialize_stereo(tracker, map_points, *kf) {
            Ok(()) => Reply::succeeded(),
            Err(e) => Reply::failed(e.to_string()),
        },
        Request::GetTrackerPoses => Reply::TrackerPoses {
            code: ReplyCode::Succeeded,
            poses: mapper.tracker_poses(),
        },
        Request::GetTrackerPivots => Reply::TrackerPoses {
            code: ReplyCode::Succeeded,
            poses: mapper.tracker_pivots(),
        },
        Request::Reset => {
            mapper.reset();
            Reply::succeeded()
        }
    }
}

/// Drain pending subscriber connections onto the broadcast list.
fn accept_subscribers(listener: &TcpListener, subscribers: &mut Vec<TcpStream>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "subscriber connected");
                subscribers.push(stream);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "publisher accept failed");
                break;
            }
        }
    }
}

/// Drain mapper events and broadcast them to every subscriber.
fn run_publisher(listener: TcpListener, mapper: Arc<MapperServer>, stop: Arc<AtomicBool>) {
    let events = mapper.subscribe();
    let mut subscribers: Vec<TcpStream> = Vec::new();

    while !stop.load(Ordering::SeqCst) {
        accept_subscribers(&listener, &mut subscribers);

        let event = match events.recv_timeout(ACCEPT_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        // Anyone whose connect landed before this event was published must
        // see it.
        accept_subscribers(&listener, &mut subscribers);

        let frame = match &event {
            MapperEvent::MapChanged(change) => {
                let mut w = ByteWriter::new();
                PublishHeader {
                    subscribe_id: SUBSCRIBE_ALL,
                    message_id: MessageId::MapChanged,
                }
                .encode_into(&mut w);
                let map = mapper.shared().map.read();
                encode_map_change(&mut w, &map, change);
                w.into_bytes()
            }
            MapperEvent::Reset => encode_reset(SUBSCRIBE_ALL),
            MapperEvent::TrackerPose { tracker, pose } => {
                encode_pose_update(SUBSCRIBE_ALL, *tracker, pose)
            }
        };

        // Broadcast, dropping subscribers whose stream died.
        subscribers.retain_mut(|stream| write_frame(stream, &frame).is_ok());
    }
    info!("publisher exiting");
}
