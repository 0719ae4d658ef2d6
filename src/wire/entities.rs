//! Bit-exact wire encoding of keyframes, map points, and map-change events.
//!
//! A freshly-deserialised entity is *partially linked*: the peer ids it
//! carries may not be present on the receiving side yet. Because
//! cross-references are stored as ids everywhere, later lookups resolve them
//! as the referenced peers arrive.

use nalgebra::Vector3;

use crate::error::{Error, Result};
use crate::geometry::SE3;
use crate::map::{
    BowVector, CameraIntrinsics, Descriptor, Feature, Frame, KeyFrame, KeyFrameId, Map,
    MapChangeEvent, MapPoint, MapPointId, ScalePyramid, DESCRIPTOR_BYTES,
};

use super::codec::{ByteReader, ByteWriter};

pub fn encode_keyframe(w: &mut ByteWriter, kf: &KeyFrame) {
    w.put_u64(kf.id.0);
    w.put_u64(kf.timestamp_ns);

    // Immutable camera state.
    w.put_f64(kf.intrinsics.fx);
    w.put_f64(kf.intrinsics.fy);
    w.put_f64(kf.intrinsics.cx);
    w.put_f64(kf.intrinsics.cy);
    w.put_f64(kf.intrinsics.bf);
    w.put_u32(kf.intrinsics.width);
    w.put_u32(kf.intrinsics.height);
    w.put_u32(kf.pyramid.n_levels);
    w.put_f64(kf.pyramid.scale_factor);

    w.put_u32(kf.features.len() as u32);
    for feat in &kf.features {
        w.put_f64(feat.u);
        w.put_f64(feat.v);
        w.put_i32(feat.octave);
        w.put_f64(feat.right);
        w.put_f64(feat.depth);
    }

    w.put_u32(kf.descriptors.len() as u32);
    for desc in &kf.descriptors {
        w.put_bytes(&desc.0);
    }

    w.put_u32(kf.feature_words.len() as u32);
    for &word in &kf.feature_words {
        w.put_u32(word);
    }

    let mut bow: Vec<(u32, f64)> = kf.bow.iter().map(|(&w, &v)| (w, v)).collect();
    bow.sort_by_key(|(word, _)| *word);
    w.put_u32(bow.len() as u32);
    for (word, weight) in bow {
        w.put_u32(word);
        w.put_f64(weight);
    }

    w.put_matrix4(&kf.pose.to_matrix());

    w.put_optional_id(kf.parent.map(|id| id.0));

    let mut children: Vec<u64> = kf.children.iter().map(|id| id.0).collect();
    children.sort_unstable();
    w.put_u32(children.len() as u32);
    for id in children {
        w.put_u64(id);
    }

    let mut loop_edges: Vec<u64> = kf.loop_edges.iter().map(|id| id.0).collect();
    loop_edges.sort_unstable();
    w.put_u32(loop_edges.len() as u32);
    for id in loop_edges {
        w.put_u64(id);
    }

    let mut covisibility: Vec<(u64, u32)> = kf
        .covisibility_weights()
        .iter()
        .map(|(id, &weight)| (id.0, weight as u32))
        .collect();
    covisibility.sort_unstable();
    w.put_u32(covisibility.len() as u32);
    for (id, weight) in covisibility {
        w.put_u64(id);
        w.put_u32(weight);
    }

    // Observation slots: one entry per feature, null for empty slots.
    w.put_u32(kf.map_point_slots().len() as u32);
    for slot in kf.map_point_slots() {
        w.put_optional_id(slot.map(|id| id.0));
    }

    w.put_bool(kf.bad);
    w.put_bool(kf.not_erase);
}

pub fn decode_keyframe(r: &mut ByteReader) -> Result<KeyFrame> {
    let id = KeyFrameId::new(r.take_u64()?);
    let timestamp_ns = r.take_u64()?;

    let intrinsics = CameraIntrinsics {
        fx: r.take_f64()?,
        fy: r.take_f64()?,
        cx: r.take_f64()?,
        cy: r.take_f64()?,
        bf: r.take_f64()?,
        width: r.take_u32()?,
        height: r.take_u32()?,
    };
    let n_levels = r.take_u32()?;
    let scale_factor = r.take_f64()?;
    let pyramid = ScalePyramid::new(n_levels, scale_factor);

    let n_features = r.take_u32()? as usize;
    let mut features = Vec::with_capacity(n_features);
    for _ in 0..n_features {
        features.push(Feature {
            u: r.take_f64()?,
            v: r.take_f64()?,
            octave: r.take_i32()?,
            right: r.take_f64()?,
            depth: r.take_f64()?,
        });
    }

    let n_descriptors = r.take_u32()? as usize;
    let mut descriptors = Vec::with_capacity(n_descriptors);
    for _ in 0..n_descriptors {
        let bytes = r.take_bytes(DESCRIPTOR_BYTES)?;
        descriptors.push(Descriptor(bytes.try_into().unwrap()));
    }

    let n_words = r.take_u32()? as usize;
    let mut feature_words = Vec::with_capacity(n_words);
    for _ in 0..n_words {
        feature_words.push(r.take_u32()?);
    }

    let n_bow = r.take_u32()? as usize;
    let mut bow = BowVector::with_capacity(n_bow);
    for _ in 0..n_bow {
        let word = r.take_u32()?;
        let weight = r.take_f64()?;
        bow.insert(word, weight);
    }

    let pose = SE3::from_matrix(&r.take_matrix4()?);

    let frame = Frame {
        timestamp_ns,
        intrinsics,
        pyramid,
        features,
        descriptors,
        bow,
        feature_words,
        pose,
    };
    let mut kf = KeyFrame::from_frame(id, frame);

    if let Some(parent) = r.take_optional_id()? {
        kf.parent = Some(KeyFrameId::new(parent));
    }

    let n_children = r.take_u32()? as usize;
    for _ in 0..n_children {
        kf.children.insert(KeyFrameId::new(r.take_u64()?));
    }

    let n_loop_edges = r.take_u32()? as usize;
    for _ in 0..n_loop_edges {
        kf.loop_edges.insert(KeyFrameId::new(r.take_u64()?));
    }

    let n_covisibility = r.take_u32()? as usize;
    for _ in 0..n_covisibility {
        let peer = KeyFrameId::new(r.take_u64()?);
        let weight = r.take_u32()? as usize;
        kf.set_covisibility(peer, weight);
    }

    let n_slots = r.take_u32()? as usize;
    if n_slots != kf.num_features() {
        return Err(Error::Decode(format!(
            "keyframe {} carries {} slots for {} features",
            id.0,
            n_slots,
            kf.num_features()
        )));
    }
    for slot in 0..n_slots {
        if let Some(mp) = r.take_optional_id()? {
            kf.set_map_point(slot, MapPointId::new(mp));
        }
    }

    kf.bad = r.take_bool()?;
    kf.not_erase = r.take_bool()?;
    Ok(kf)
}

pub fn encode_map_point(w: &mut ByteWriter, mp: &MapPoint) {
    w.put_u64(mp.id.0);
    for c in &mp.position {
        w.put_f64(*c);
    }
    for c in &mp.normal {
        w.put_f64(*c);
    }
    w.put_bytes(&mp.descriptor.0);
    w.put_f64(mp.min_distance);
    w.put_f64(mp.max_distance);
    w.put_u64(mp.reference_kf.0);
    w.put_optional_id(mp.replaced_by.map(|id| id.0));
    w.put_u32(mp.visible_count);
    w.put_u32(mp.found_count);
    w.put_bool(mp.bad);

    let mut observations: Vec<(u64, u32)> = mp
        .observations
        .iter()
        .map(|(kf, &idx)| (kf.0, idx as u32))
        .collect();
    observations.sort_unstable();
    w.put_u32(observations.len() as u32);
    for (kf, idx) in observations {
        w.put_u64(kf);
        w.put_u32(idx);
    }
}

pub fn decode_map_point(r: &mut ByteReader) -> Result<MapPoint> {
    let id = MapPointId::new(r.take_u64()?);
    let position = Vector3::new(r.take_f64()?, r.take_f64()?, r.take_f64()?);
    let normal = Vector3::new(r.take_f64()?, r.take_f64()?, r.take_f64()?);
    let descriptor = Descriptor(r.take_bytes(DESCRIPTOR_BYTES)?.try_into().unwrap());
    let min_distance = r.take_f64()?;
    let max_distance = r.take_f64()?;
    let reference_kf = KeyFrameId::new(r.take_u64()?);
    let replaced_by = r.take_optional_id()?.map(MapPointId::new);
    let visible_count = r.take_u32()?;
    let found_count = r.take_u32()?;
    let bad = r.take_bool()?;

    let mut mp = MapPoint::new(id, position, descriptor, reference_kf);
    mp.normal = normal;
    mp.min_distance = min_distance;
    mp.max_distance = max_distance;
    mp.replaced_by = replaced_by;
    mp.visible_count = visible_count;
    mp.found_count = found_count;
    mp.bad = bad;

    let n_observations = r.take_u32()? as usize;
    for _ in 0..n_observations {
        let kf = KeyFrameId::new(r.take_u64()?);
        let idx = r.take_u32()? as usize;
        mp.add_observation(kf, idx);
    }
    Ok(mp)
}

/// Encode a change event, resolving updated ids against the map.
///
/// Entities erased between the event and this call are silently skipped;
/// their erasure travels in a later event.
pub fn encode_map_change(w: &mut ByteWriter, map: &Map, event: &MapChangeEvent) {
    let updated_kfs: Vec<&KeyFrame> = event
        .updated_keyframes
        .iter()
        .filter_map(|&id| map.get_keyframe(id))
        .collect();
    w.put_u32(updated_kfs.len() as u32);
    for kf in updated_kfs {
        encode_keyframe(w, kf);
    }

    w.put_u32(event.erased_keyframes.len() as u32);
    for id in &event.erased_keyframes {
        w.put_u64(id.0);
    }

    let updated_mps: Vec<&MapPoint> = event
        .updated_map_points
        .iter()
        .filter_map(|&id| map.get_map_point(id))
        .collect();
    w.put_u32(updated_mps.len() as u32);
    for mp in updated_mps {
        encode_map_point(w, mp);
    }

    w.put_u32(event.erased_map_points.len() as u32);
    for id in &event.erased_map_points {
        w.put_u64(id.0);
    }
}

/// Decoded change event carrying full entities.
pub struct DecodedMapChange {
    pub updated_keyframes: Vec<KeyFrame>,
    pub erased_keyframes: Vec<KeyFrameId>,
    pub updated_map_points: Vec<MapPoint>,
    pub erased_map_points: Vec<MapPointId>,
}

pub fn decode_map_change(r: &mut ByteReader) -> Result<DecodedMapChange> {
    let n_kfs = r.take_u32()? as usize;
    let mut updated_keyframes = Vec::with_capacity(n_kfs);
    for _ in 0..n_kfs {
        updated_keyframes.push(decode_keyframe(r)?);
    }

    let n_erased_kfs = r.take_u32()? as usize;
    let mut erased_keyframes = Vec::with_capacity(n_erased_kfs);
    for _ in 0..n_erased_kfs {
        erased_keyframes.push(KeyFrameId::new(r.take_u64()?));
    }

    let n_mps = r.take_u32()? as usize;
    let mut updated_map_points = Vec::with_capacity(n_mps);
    for _ in 0..n_mps {
        updated_map_points.push(decode_map_point(r)?);
    }

    let n_erased_mps = r.take_u32()? as usize;
    let mut erased_map_points = Vec::with_capacity(n_erased_mps);
    for _ in 0..n_erased_mps {
        erased_map_points.push(MapPointId::new(r.take_u64()?));
    }

    Ok(DecodedMapChange {
        updated_keyframes,
        erased_keyframes,
        updated_map_points,
        erased_map_points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;

    fn rich_keyframe() -> KeyFrame {
        let mut frame = frame_with_features(6);
        frame.timestamp_ns = 123_456_789;
        frame.pose = SE3::new(
            nalgebra::UnitQuaternion::from_euler_angles(0.1, 0.2, 0.3),
            Vector3::new(1.0, -2.0, 3.0),
        );
        let mut kf = KeyFrame::from_frame(KeyFrameId::new(42), frame);
        kf.parent = Some(KeyFrameId::new(40));
        kf.children.insert(KeyFrameId::new(44));
        kf.children.insert(KeyFrameId::new(46));
        kf.loop_edges.insert(KeyFrameId::new(2));
        kf.set_covisibility(KeyFrameId::new(40), 55);
        kf.set_covisibility(KeyFrameId::new(44), 17);
        kf.set_map_point(0, MapPointId::new(100));
        kf.set_map_point(3, MapPointId::new(103));
        kf
    }

    fn rich_map_point() -> MapPoint {
        let mut mp = MapPoint::new(
            MapPointId::new(77),
            Vector3::new(0.5, -0.25, 4.0),
            Descriptor([3u8; DESCRIPTOR_BYTES]),
            KeyFrameId::new(42),
        );
        mp.normal = Vector3::new(0.0, 0.0, 1.0);
        mp.min_distance = 0.4;
        mp.max_distance = 12.0;
        mp.visible_count = 9;
        mp.found_count = 7;
        mp.replaced_by = Some(MapPointId::new(80));
        mp.add_observation(KeyFrameId::new(42), 0);
        mp.add_observation(KeyFrameId::new(40), 5);
        mp
    }

    #[test]
    fn test_keyframe_roundtrip() {
        let kf = rich_keyframe();
        let mut w = ByteWriter::new();
        encode_keyframe(&mut w, &kf);
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes);
        let back = decode_keyframe(&mut r).unwrap();
        assert!(r.is_empty());

        assert_eq!(back.id, kf.id);
        assert_eq!(back.timestamp_ns, kf.timestamp_ns);
        assert_eq!(back.intrinsics, kf.intrinsics);
        assert_eq!(back.features, kf.features);
        assert_eq!(back.descriptors, kf.descriptors);
        assert_eq!(back.feature_words, kf.feature_words);
        assert_eq!(back.bow, kf.bow);
        assert_eq!(back.parent, kf.parent);
        assert_eq!(back.children, kf.children);
        assert_eq!(back.loop_edges, kf.loop_edges);
        assert_eq!(back.covisibility_weights(), kf.covisibility_weights());
        assert_eq!(back.map_point_slots(), kf.map_point_slots());
        assert_eq!(back.bad, kf.bad);
        assert_eq!(back.not_erase, kf.not_erase);
        // Pose positions survive bit-exactly through the matrix form.
        assert_eq!(back.pose.translation, kf.pose.translation);
    }

    #[test]
    fn test_keyframe_encoding_is_deterministic() {
        let kf = rich_keyframe();
        let mut w1 = ByteWriter::new();
        let mut w2 = ByteWriter::new();
        encode_keyframe(&mut w1, &kf);
        encode_keyframe(&mut w2, &kf);
        assert_eq!(w1.into_bytes(), w2.into_bytes());
    }

    #[test]
    fn test_map_point_roundtrip() {
        let mp = rich_map_point();
        let mut w = ByteWriter::new();
        encode_map_point(&mut w, &mp);
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes);
        let back = decode_map_point(&mut r).unwrap();
        assert!(r.is_empty());

        assert_eq!(back.id, mp.id);
        assert_eq!(back.position, mp.position);
        assert_eq!(back.normal, mp.normal);
        assert_eq!(back.descriptor, mp.descriptor);
        assert_eq!(back.min_distance, mp.min_distance);
        assert_eq!(back.max_distance, mp.max_distance);
        assert_eq!(back.reference_kf, mp.reference_kf);
        assert_eq!(back.replaced_by, mp.replaced_by);
        assert_eq!(back.visible_count, mp.visible_count);
        assert_eq!(back.found_count, mp.found_count);
        assert_eq!(back.observations, mp.observations);
    }

    #[test]
    fn test_map_change_roundtrip() {
        let mut map = Map::new();
        let kf = rich_keyframe();
        let mp = rich_map_point();
        let (kf_id, mp_id) = (kf.id, mp.id);
        map.insert_keyframe(kf);
        map.insert_map_point(mp);

        let event = MapChangeEvent {
            updated_keyframes: vec![kf_id],
            erased_keyframes: vec![KeyFrameId::new(9)],
            updated_map_points: vec![mp_id],
            erased_map_points: vec![MapPointId::new(11), MapPointId::new(12)],
        };

        let mut w = ByteWriter::new();
        encode_map_change(&mut w, &map, &event);
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes);
        let decoded = decode_map_change(&mut r).unwrap();
        assert!(r.is_empty());
        assert_eq!(decoded.updated_keyframes.len(), 1);
        assert_eq!(decoded.updated_keyframes[0].id, kf_id);
        assert_eq!(decoded.erased_keyframes, vec![KeyFrameId::new(9)]);
        assert_eq!(decoded.updated_map_points.len(), 1);
        assert_eq!(
            decoded.erased_map_points,
            vec![MapPointId::new(11), MapPointId::new(12)]
        );
    }

    #[test]
    fn test_truncated_keyframe_fails_cleanly() {
        let kf = rich_keyframe();
        let mut w = ByteWriter::new();
        encode_keyframe(&mut w, &kf);
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes[..bytes.len() / 2]);
        assert!(decode_keyframe(&mut r).is_err());
    }
}
