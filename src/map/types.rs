//! Core id types for the map structures.
//!
//! Cross-references between keyframes and map points are stored as ids and
//! resolved through the [`Map`](super::Map). This keeps the object graph
//! acyclic at the ownership level while preserving O(1) access.

/// Unique identifier for a KeyFrame.
///
/// Ids are allocated by trackers from non-overlapping arithmetic streams:
/// tracker `t` produces `first_kf_id + k * kf_id_span` with
/// `first_kf_id ≡ t (mod kf_id_span)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint.
///
/// Partitioned like keyframe ids, with one extra residue class reserved for
/// map points created by Local Mapping itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// Identifier of a logged-in tracker, drawn from `0..MAX_TRACKERS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackerId(pub u32);

impl TrackerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TrackerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_equality_and_ordering() {
        assert_eq!(KeyFrameId::new(42), KeyFrameId::new(42));
        assert!(KeyFrameId::new(1) < KeyFrameId::new(2));
        assert_ne!(MapPointId::new(1), MapPointId::new(3));
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", KeyFrameId::new(7)), "KF7");
        assert_eq!(format!("{}", MapPointId::new(123)), "MP123");
        assert_eq!(format!("{}", TrackerId::new(0)), "T0");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyFrameId, &str> = HashMap::new();
        map.insert(KeyFrameId::new(1), "first");
        assert_eq!(map.get(&KeyFrameId::new(1)), Some(&"first"));
        assert_eq!(map.get(&KeyFrameId::new(2)), None);
    }
}
