//! Wire format: little-endian codec, message definitions, and entity
//! serialisation.

pub mod codec;
pub mod entities;
pub mod messages;

pub use codec::{ByteReader, ByteWriter, NULL_ID};
pub use entities::{
    decode_keyframe, decode_map_change, decode_map_point, encode_keyframe, encode_map_change,
    encode_map_point, DecodedMapChange,
};
pub use messages::{
    encode_pose_update, encode_reset, MessageId, PublishHeader, Reply, ReplyCode, Request,
    ServiceId, SUBSCRIBE_ALL,
};
