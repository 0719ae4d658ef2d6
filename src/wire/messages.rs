//! Request/reply and publish/subscribe message definitions.
//!
//! Every request leads with a [`ServiceId`] discriminant; every reply leads
//! with a [`ReplyCode`] and, on failure, a diagnostic message. Published
//! messages lead with a `(subscribe_id, message_id)` header that clients
//! filter on.

use crate::error::{Error, Result};
use crate::geometry::SE3;
use crate::local_mapping::KeyFrameInsertion;
use crate::map::{KeyFrame, MapPoint, MapPointId, TrackerId};

use super::codec::{ByteReader, ByteWriter};
use super::entities::{decode_keyframe, decode_map_point, encode_keyframe, encode_map_point};

/// Subscribe id for messages addressed to every client.
pub const SUBSCRIBE_ALL: i32 = -1;

/// Operation discriminant carried by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ServiceId {
    Greet = 0,
    LoginTracker = 1,
    LogoutTracker = 2,
    InsertKeyFrame = 3,
    UpdatePose = 4,
    InitializeMono = 5,
    InitializeStereo = 6,
    GetTrackerPoses = 7,
    GetTrackerPivots = 8,
    Reset = 9,
}

impl TryFrom<u16> for ServiceId {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => Self::Greet,
            1 => Self::LoginTracker,
            2 => Self::LogoutTracker,
            3 => Self::InsertKeyFrame,
            4 => Self::UpdatePose,
            5 => Self::InitializeMono,
            6 => Self::InitializeStereo,
            7 => Self::GetTrackerPoses,
            8 => Self::GetTrackerPivots,
            9 => Self::Reset,
            other => return Err(Error::Decode(format!("unknown service id {}", other))),
        })
    }
}

/// Kind discriminant carried by every published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageId {
    MapChanged = 0,
    Reset = 1,
    TrackerPoseUpdate = 2,
}

impl TryFrom<u16> for MessageId {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self> {
        Ok(match raw {
            0 => Self::MapChanged,
            1 => Self::Reset,
            2 => Self::TrackerPoseUpdate,
            other => return Err(Error::Decode(format!("unknown message id {}", other))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0,
    Failed = 1,
}

impl TryFrom<u8> for ReplyCode {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Self::Succeeded,
            1 => Self::Failed,
            other => return Err(Error::Decode(format!("unknown reply code {}", other))),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded request body.
#[derive(Debug)]
pub enum Request {
    Greet {
        message: String,
    },
    LoginTracker {
        pivot_calib: SE3,
    },
    LogoutTracker {
        tracker: TrackerId,
    },
    InsertKeyFrame {
        tracker: TrackerId,
        keyframe: KeyFrame,
        created_map_points: Vec<(usize, MapPoint)>,
        matched_map_points: Vec<(usize, MapPointId)>,
    },
    UpdatePose {
        tracker: TrackerId,
        pose: SE3,
    },
    InitializeMono {
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf1: Box<KeyFrame>,
        kf2: Box<KeyFrame>,
    },
    InitializeStereo {
        tracker: TrackerId,
        map_points: Vec<MapPoint>,
        kf: Box<KeyFrame>,
    },
    GetTrackerPoses,
    GetTrackerPivots,
    Reset,
}

impl Request {
    pub fn service_id(&self) -> ServiceId {
        match self {
            Request::Greet { .. } => ServiceId::Greet,
            Request::LoginTracker { .. } => ServiceId::LoginTracker,
            Request::LogoutTracker { .. } => ServiceId::LogoutTracker,
            Request::InsertKeyFrame { .. } => ServiceId::InsertKeyFrame,
            Request::UpdatePose { .. } => ServiceId::UpdatePose,
            Request::InitializeMono { .. } => ServiceId::InitializeMono,
            Request::InitializeStereo { .. } => ServiceId::InitializeStereo,
            Request::GetTrackerPoses => ServiceId::GetTrackerPoses,
            Request::GetTrackerPivots => ServiceId::GetTrackerPivots,
            Request::Reset => ServiceId::Reset,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u16(self.service_id() as u16);
        match self {
            Request::Greet { message } => {
                w.put_string(message);
            }
            Request::LoginTracker { pivot_calib } => {
                w.put_matrix4(&pivot_calib.to_matrix());
            }
            Request::LogoutTracker { tracker } => {
                w.put_u32(tracker.0);
            }
            Request::InsertKeyFrame {
                tracker,
                keyframe,
                created_map_points,
                matched_map_points,
            } => {
                w.put_u32(tracker.0);
                encode_keyframe(&mut w, keyframe);
                w.put_u32(created_map_points.len() as u32);
                for (slot, mp) in created_map_points {
                    w.put_u32(*slot as u32);
                    encode_map_point(&mut w, mp);
                }
                w.put_u32(matched_map_points.len() as u32);
                for (slot, mp_id) in matched_map_points {
                    w.put_u32(*slot as u32);
                    w.put_u64(mp_id.0);
                }
            }
            Request::UpdatePose { tracker, pose } => {
                w.put_u32(tracker.0);
                w.put_matrix4(&pose.to_matrix());
            }
            Request::InitializeMono {
                tracker,
                map_points,
                kf1,
                kf2,
            } => {
                w.put_u32(tracker.0);
                w.put_u32(map_points.len() as u32);
                for mp in map_points {
                    encode_map_point(&mut w, mp);
                }
                encode_keyframe(&mut w, kf1);
                encode_keyframe(&mut w, kf2);
            }
            Request::InitializeStereo {
                tracker,
                map_points,
                kf,
            } => {
                w.put_u32(tracker.0);
                w.put_u32(map_points.len() as u32);
                for mp in map_points {
                    encode_map_point(&mut w, mp);
                }
                encode_keyframe(&mut w, kf);
            }
            Request::GetTrackerPoses | Request::GetTrackerPivots | Request::Reset => {}
        }
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let service = ServiceId::try_from(r.take_u16()?)?;
        let request = match service {
            ServiceId::Greet => Request::Greet {
                message: r.take_string()?,
            },
            ServiceId::LoginTracker => Request::LoginTracker {
                pivot_calib: SE3::from_matrix(&r.take_matrix4()?),
            },
            ServiceId::LogoutTracker => Request::LogoutTracker {
                tracker: TrackerId::new(r.take_u32()?),
            },
            ServiceId::InsertKeyFrame => {
                let tracker = TrackerId::new(r.take_u32()?);
                let keyframe = decode_keyframe(&mut r)?;
                let n_created = r.take_u32()? as usize;
                let mut created_map_points = Vec::with_capacity(n_created);
                for _ in 0..n_created {
                    let slot = r.take_u32()? as usize;
                    created_map_points.push((slot, decode_map_point(&mut r)?));
                }
                let n_matched = r.take_u32()? as usize;
                let mut matched_map_points = Vec::with_capacity(n_matched);
                for _ in 0..n_matched {
                    let slot = r.take_u32()? as usize;
                    matched_map_points.push((slot, MapPointId::new(r.take_u64()?)));
                }
                Request::InsertKeyFrame {
                    tracker,
                    keyframe,
                    created_map_points,
                    matched_map_points,
                }
            }
            ServiceId::UpdatePose => Request::UpdatePose {
                tracker: TrackerId::new(r.take_u32()?),
                pose: SE3::from_matrix(&r.take_matrix4()?),
            },
            ServiceId::InitializeMono => {
                let tracker = TrackerId::new(r.take_u32()?);
                let n = r.take_u32()? as usize;
                let mut map_points = Vec::with_capacity(n);
                for _ in 0..n {
                    map_points.push(decode_map_point(&mut r)?);
                }
                let kf1 = Box::new(decode_keyframe(&mut r)?);
                let kf2 = Box::new(decode_keyframe(&mut r)?);
                Request::InitializeMono {
                    tracker,
                    map_points,
                    kf1,
                    kf2,
                }
            }
            ServiceId::InitializeStereo => {
                let tracker = TrackerId::new(r.take_u32()?);
                let n = r.take_u32()? as usize;
                let mut map_points = Vec::with_capacity(n);
                for _ in 0..n {
                    map_points.push(decode_map_point(&mut r)?);
                }
                let kf = Box::new(decode_keyframe(&mut r)?);
                Request::InitializeStereo {
                    tracker,
                    map_points,
                    kf,
                }
            }
            ServiceId::GetTrackerPoses => Request::GetTrackerPoses,
            ServiceId::GetTrackerPivots => Request::GetTrackerPivots,
            ServiceId::Reset => Request::Reset,
        };
        Ok(request)
    }
}

impl From<KeyFrameInsertion> for Request {
    fn from(insertion: KeyFrameInsertion) -> Self {
        Request::InsertKeyFrame {
            tracker: insertion.tracker,
            keyframe: insertion.keyframe,
            created_map_points: insertion.created_map_points,
            matched_map_points: insertion.matched_map_points,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replies
// ─────────────────────────────────────────────────────────────────────────────

/// A decoded reply body.
#[derive(Debug)]
pub enum Reply {
    /// Success/failure plus a human-readable message (empty on success).
    General {
        code: ReplyCode,
        message: String,
    },
    Login {
        code: ReplyCode,
        tracker_id: u32,
        first_keyframe_id: u64,
        keyframe_id_span: u32,
        first_map_point_id: u64,
        map_point_id_span: u32,
    },
    InsertKeyFrame {
        code: ReplyCode,
        inserted: bool,
    },
    TrackerPoses {
        code: ReplyCode,
        poses: Vec<(TrackerId, SE3)>,
    },
}

impl Reply {
    pub fn failed(message: impl Into<String>) -> Self {
        Reply::General {
            code: ReplyCode::Failed,
            message: message.into(),
        }
    }

    pub fn succeeded() -> Self {
        Reply::General {
            code: ReplyCode::Succeeded,
            message: String::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            Reply::General { code, message } => {
                w.put_u8(*code as u8);
                w.put_string(message);
            }
            Reply::Login {
                code,
                tracker_id,
                first_keyframe_id,
                keyframe_id_span,
                first_map_point_id,
                map_point_id_span,
            } => {
                w.put_u8(*code as u8);
                w.put_u32(*tracker_id);
                w.put_u64(*first_keyframe_id);
                w.put_u32(*keyframe_id_span);
                w.put_u64(*first_map_point_id);
                w.put_u32(*map_point_id_span);
            }
            Reply::InsertKeyFrame { code, inserted } => {
                w.put_u8(*code as u8);
                w.put_bool(*inserted);
            }
            Reply::TrackerPoses { code, poses } => {
                w.put_u8(*code as u8);
                w.put_u32(poses.len() as u32);
                for (tracker, pose) in poses {
                    w.put_u32(tracker.0);
                    w.put_matrix4(&pose.to_matrix());
                }
            }
        }
        w.into_bytes()
    }

    /// Decode a reply, dispatching on the service the request used.
    pub fn decode(service: ServiceId, bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);
        let code = ReplyCode::try_from(r.take_u8()?)?;
        let reply = match service {
            ServiceId::LoginTracker if code == ReplyCode::Succeeded => Reply::Login {
                code,
                tracker_id: r.take_u32()?,
                first_keyframe_id: r.take_u64()?,
                keyframe_id_span: r.take_u32()?,
                first_map_point_id: r.take_u64()?,
                map_point_id_span: r.take_u32()?,
            },
            ServiceId::InsertKeyFrame if code == ReplyCode::Succeeded => Reply::InsertKeyFrame {
                code,
                inserted: r.take_bool()?,
            },
            ServiceId::GetTrackerPoses | ServiceId::GetTrackerPivots
                if code == ReplyCode::Succeeded =>
            {
                let n = r.take_u32()? as usize;
                let mut poses = Vec::with_capacity(n);
                for _ in 0..n {
                    let tracker = TrackerId::new(r.take_u32()?);
                    let pose = SE3::from_matrix(&r.take_matrix4()?);
                    poses.push((tracker, pose));
                }
                Reply::TrackerPoses { code, poses }
            }
            _ => Reply::General {
                code,
                message: r.take_string()?,
            },
        };
        Ok(reply)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Published messages
// ─────────────────────────────────────────────────────────────────────────────

/// Header of every published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishHeader {
    pub subscribe_id: i32,
    pub message_id: MessageId,
}

impl PublishHeader {
    pub fn encode_into(&self, w: &mut ByteWriter) {
        w.put_i32(self.subscribe_id);
        w.put_u16(self.message_id as u16);
    }

    pub fn decode(r: &mut ByteReader) -> Result<Self> {
        Ok(Self {
            subscribe_id: r.take_i32()?,
            message_id: MessageId::try_from(r.take_u16()?)?,
        })
    }
}

/// Build a published tracker-pose frame.
pub fn encode_pose_update(subscribe_id: i32, tracker: TrackerId, pose: &SE3) -> Vec<u8> {
    let mut w = ByteWriter::new();
    PublishHeader {
        subscribe_id,
        message_id: MessageId::TrackerPoseUpdate,
    }
    .encode_into(&mut w);
    w.put_u32(tracker.0);
    w.put_matrix4(&pose.to_matrix());
    w.into_bytes()
}

/// Build a published reset frame.
pub fn encode_reset(subscribe_id: i32) -> Vec<u8> {
    let mut w = ByteWriter::new();
    PublishHeader {
        subscribe_id,
        message_id: MessageId::Reset,
    }
    .encode_into(&mut w);
    w.into_bytes()
}
