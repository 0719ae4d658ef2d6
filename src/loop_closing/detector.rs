//! Loop candidate detection with temporal consistency.
//!
//! Raw candidates come from the keyframe database; a loop is only handed to
//! geometric verification once candidates from the same covisibility group
//! keep appearing for several consecutive keyframes.

use std::collections::{HashSet, VecDeque};

use parking_lot::RwLock;
use tracing::debug;

use crate::database::KeyFrameDatabase;
use crate::map::{bow_score, KeyFrameId, Map};

#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Consecutive keyframes that must agree before a candidate is accepted.
    pub consistency_threshold: usize,
    /// Minimum keyframes in the map before loop detection starts.
    pub min_map_size: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            consistency_threshold: 3,
            min_map_size: 5,
        }
    }
}

/// Query the database for loop candidates of `kf_id`.
///
/// The similarity floor is the lowest BoW score the keyframe achieves
/// against its own covisible neighbourhood: anything a loop candidate scores
/// must at least match the worst genuine neighbour.
pub fn detect_candidates(
    map: &RwLock<Map>,
    db: &RwLock<KeyFrameDatabase>,
    kf_id: KeyFrameId,
    config: &LoopDetectorConfig,
) -> Vec<KeyFrameId> {
    let map = map.read();
    if map.keyframes_in_map() < config.min_map_size {
        return Vec::new();
    }

    let query = match map.get_keyframe(kf_id) {
        Some(kf) => kf,
        None => return Vec::new(),
    };

    let mut min_score = 1.0f64;
    let mut scored_any = false;
    for cov_id in query.covisibles() {
        if let Some(cov) = map.get_keyframe(cov_id) {
            let score = bow_score(&query.bow, &cov.bow);
            if score < min_score {
                min_score = score;
            }
            scored_any = true;
        }
    }
    if !scored_any {
        return Vec::new();
    }

    let candidates = db.read().detect_loop_candidates(&map, kf_id, min_score);
    if !candidates.is_empty() {
        debug!(kf = %kf_id, count = candidates.len(), "loop candidates");
    }
    candidates
}

/// Tracks how many consecutive keyframes produced candidates from the same
/// covisibility group.
pub struct ConsistencyChecker {
    threshold: usize,
    /// Candidate groups of recent keyframes, most recent last.
    history: VecDeque<Vec<HashSet<KeyFrameId>>>,
}

impl ConsistencyChecker {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            history: VecDeque::new(),
        }
    }

    /// Feed this keyframe's candidates; returns a candidate whose group has
    /// been seen for `threshold` consecutive keyframes.
    pub fn check(&mut self, map: &Map, candidates: &[KeyFrameId]) -> Option<KeyFrameId> {
        let groups: Vec<HashSet<KeyFrameId>> = candidates
            .iter()
            .map(|&id| candidate_group(map, id))
            .collect();

        let mut accepted = None;
        if self.history.len() + 1 >= self.threshold {
            'candidates: for (candidate, group) in candidates.iter().zip(&groups) {
                // The group must intersect one group of every recent entry.
                for past in self.history.iter().rev().take(self.threshold - 1) {
                    let consistent = past
                        .iter()
                        .any(|past_group| !past_group.is_disjoint(group));
                    if !consistent {
                        continue 'candidates;
                    }
                }
                accepted = Some(*candidate);
                break;
            }
        }

        self.history.push_back(groups);
        while self.history.len() > self.threshold {
            self.history.pop_front();
        }

        if accepted.is_some() {
            // Avoid re-detecting the same loop on the very next keyframe.
            self.history.clear();
        }
        accepted
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }
}

/// A candidate's covisibility group: the keyframe plus its covisibles.
fn candidate_group(map: &Map, kf_id: KeyFrameId) -> HashSet<KeyFrameId> {
    let mut group = HashSet::new();
    group.insert(kf_id);
    if let Some(kf) = map.get_keyframe(kf_id) {
        group.extend(kf.covisibles());
    }
    group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::KeyFrame;

    fn map_with_kfs(n: u64) -> Map {
        let mut map = Map::new();
        for i in 0..n {
            map.insert_keyframe(KeyFrame::from_frame(
                KeyFrameId::new(i),
                frame_with_features(0),
            ));
        }
        map
    }

    #[test]
    fn test_consistency_requires_consecutive_hits() {
        let map = map_with_kfs(5);
        let mut checker = ConsistencyChecker::new(3);
        let candidate = KeyFrameId::new(1);

        assert!(checker.check(&map, &[candidate]).is_none());
        assert!(checker.check(&map, &[candidate]).is_none());
        assert_eq!(checker.check(&map, &[candidate]), Some(candidate));
    }

    #[test]
    fn test_interruption_resets_the_count() {
        let map = map_with_kfs(5);
        let mut checker = ConsistencyChecker::new(3);
        let candidate = KeyFrameId::new(1);

        assert!(checker.check(&map, &[candidate]).is_none());
        assert!(checker.check(&map, &[]).is_none());
        assert!(checker.check(&map, &[candidate]).is_none());
        assert!(checker.check(&map, &[candidate]).is_none());
        assert_eq!(checker.check(&map, &[candidate]), Some(candidate));
    }

    #[test]
    fn test_group_membership_counts() {
        let mut map = map_with_kfs(5);
        // 1 and 2 are covisible: candidates alternating between them still
        // describe the same place.
        map.get_keyframe_mut(KeyFrameId::new(1))
            .unwrap()
            .set_covisibility(KeyFrameId::new(2), 40);
        map.get_keyframe_mut(KeyFrameId::new(2))
            .unwrap()
            .set_covisibility(KeyFrameId::new(1), 40);

        let mut checker = ConsistencyChecker::new(3);
        assert!(checker.check(&map, &[KeyFrameId::new(1)]).is_none());
        assert!(checker.check(&map, &[KeyFrameId::new(2)]).is_none());
        assert_eq!(
            checker.check(&map, &[KeyFrameId::new(1)]),
            Some(KeyFrameId::new(1))
        );
    }

    #[test]
    fn test_different_regions_never_consistent() {
        let map = map_with_kfs(10);
        let mut checker = ConsistencyChecker::new(3);
        for i in 0..6u64 {
            assert!(checker.check(&map, &[KeyFrameId::new(i)]).is_none());
        }
    }
}
