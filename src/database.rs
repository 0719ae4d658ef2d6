//! KeyFrameDatabase - inverted BoW index for place recognition.
//!
//! Maps vocabulary words to the keyframes containing them, supporting two
//! queries: loop-closure candidates for a keyframe already in the map, and
//! relocalisation candidates for an arbitrary frame. Both run the same
//! pipeline: word-overlap prefilter, BoW similarity scoring, and
//! covisibility-group accumulation.

use std::collections::HashMap;

use tracing::debug;

use crate::map::{bow_score, BowVector, KeyFrameId, Map};

/// Candidates must share at least this fraction of the best word overlap.
const MIN_COMMON_WORD_RATIO: f64 = 0.8;

/// Groups must accumulate at least this fraction of the best group score.
const MIN_GROUP_SCORE_RATIO: f64 = 0.75;

/// Covisibles per candidate considered when accumulating group scores.
const GROUP_COVISIBLES: usize = 10;

/// Inverted index over BoW words.
pub struct KeyFrameDatabase {
    /// word id → keyframes whose BoW vector contains the word.
    inverted: HashMap<u32, Vec<KeyFrameId>>,
    /// keyframe → its words, kept so `erase` can walk the index.
    words_of: HashMap<KeyFrameId, Vec<u32>>,
}

impl KeyFrameDatabase {
    pub fn new() -> Self {
        Self {
            inverted: HashMap::new(),
            words_of: HashMap::new(),
        }
    }

    /// Index a keyframe under every word of its BoW vector.
    pub fn add(&mut self, kf_id: KeyFrameId, bow: &BowVector) {
        if self.words_of.contains_key(&kf_id) {
            return;
        }
        let words: Vec<u32> = bow.keys().copied().collect();
        for &word in &words {
            self.inverted.entry(word).or_default().push(kf_id);
        }
        self.words_of.insert(kf_id, words);
    }

    /// Remove a keyframe from the index.
    pub fn erase(&mut self, kf_id: KeyFrameId) {
        let words = match self.words_of.remove(&kf_id) {
            Some(words) => words,
            None => return,
        };
        for word in words {
            if let Some(list) = self.inverted.get_mut(&word) {
                list.retain(|&id| id != kf_id);
                if list.is_empty() {
                    self.inverted.remove(&word);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.inverted.clear();
        self.words_of.clear();
    }

    pub fn len(&self) -> usize {
        self.words_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words_of.is_empty()
    }

    /// Loop-closure candidates for keyframe `query_id`.
    ///
    /// Keyframes covisible with the query are excluded (a loop must close
    /// onto a *distant* part of the trajectory). `min_score` is the per-KF
    /// similarity floor, typically the lowest score the query achieves
    /// against its own covisible neighbourhood.
    pub fn detect_loop_candidates(
        &self,
        map: &Map,
        query_id: KeyFrameId,
        min_score: f64,
    ) -> Vec<KeyFrameId> {
        let query = match map.get_keyframe(query_id) {
            Some(kf) => kf,
            None => return Vec::new(),
        };

        let mut excluded: Vec<KeyFrameId> = query.covisibles().collect();
        excluded.push(query_id);

        self.query(map, &query.bow, &excluded, min_score)
    }

    /// Relocalisation candidates for an arbitrary frame's BoW vector.
    ///
    /// Same pipeline as loop detection, but nothing is excluded and no
    /// absolute score floor applies.
    pub fn detect_relocalization_candidates(&self, map: &Map, bow: &BowVector) -> Vec<KeyFrameId> {
        self.query(map, bow, &[], 0.0)
    }

    fn query(
        &self,
        map: &Map,
        query_bow: &BowVector,
        excluded: &[KeyFrameId],
        min_score: f64,
    ) -> Vec<KeyFrameId> {
        // Stage 1: word-overlap counts over the inverted index.
        let mut overlap: HashMap<KeyFrameId, usize> = HashMap::new();
        for word in query_bow.keys() {
            if let Some(list) = self.inverted.get(word) {
                for &kf_id in list {
                    if !excluded.contains(&kf_id) {
                        *overlap.entry(kf_id).or_insert(0) += 1;
                    }
                }
            }
        }
        if overlap.is_empty() {
            return Vec::new();
        }

        let max_overlap = overlap.values().copied().max().unwrap_or(0);
        // Kept as a fraction: truncating to an integer would wrongly drop a
        // candidate sitting exactly on the boundary.
        let min_overlap = MIN_COMMON_WORD_RATIO * max_overlap as f64;

        // Stage 2: BoW similarity for survivors of the word filter.
        let mut scored: HashMap<KeyFrameId, f64> = HashMap::new();
        for (&kf_id, &count) in &overlap {
            if (count as f64) < min_overlap {
                continue;
            }
            let kf = match map.get_keyframe(kf_id) {
                Some(kf) => kf,
                None => continue,
            };
            let score = bow_score(query_bow, &kf.bow);
            if score >= min_score {
                scored.insert(kf_id, score);
            }
        }
        if scored.is_empty() {
            return Vec::new();
        }

        // Stage 3: accumulate scores over covisibility groups.
        struct Group {
            acc_score: f64,
            best_kf: KeyFrameId,
            best_score: f64,
        }
        let mut groups: Vec<Group> = Vec::new();
        for (&kf_id, &score) in &scored {
            let mut acc_score = score;
            let mut best_kf = kf_id;
            let mut best_score = score;

            for cov_id in top_covisibles(map, kf_id, GROUP_COVISIBLES) {
                if let Some(&cov_score) = scored.get(&cov_id) {
                    acc_score += cov_score;
                    if cov_score > best_score {
                        best_score = cov_score;
                        best_kf = cov_id;
                    }
                }
            }
            groups.push(Group {
                acc_score,
                best_kf,
                best_score,
            });
        }

        let best_acc = groups
            .iter()
            .map(|g| g.acc_score)
            .fold(0.0f64, f64::max);
        let min_acc = MIN_GROUP_SCORE_RATIO * best_acc;

        let mut result: Vec<(KeyFrameId, f64)> = Vec::new();
        for group in groups {
            if group.acc_score >= min_acc && !result.iter().any(|(id, _)| *id == group.best_kf) {
                result.push((group.best_kf, group.best_score));
            }
        }
        result.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        debug!(
            candidates = result.len(),
            max_overlap, "place recognition query"
        );
        result.into_iter().map(|(id, _)| id).collect()
    }
}

impl Default for KeyFrameDatabase {
    fn default() -> Self {
        Self::new()
    }
}

/// Top-N covisibles by weight without touching the keyframe's sort cache.
fn top_covisibles(map: &Map, kf_id: KeyFrameId, n: usize) -> Vec<KeyFrameId> {
    let kf = match map.get_keyframe(kf_id) {
        Some(kf) => kf,
        None => return Vec::new(),
    };
    let mut weights: Vec<(KeyFrameId, usize)> = kf
        .covisibility_weights()
        .iter()
        .map(|(&id, &w)| (id, w))
        .collect();
    weights.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    weights.into_iter().take(n).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;
    use crate::map::{Frame, KeyFrame};

    /// A frame whose BoW vector contains exactly the given words.
    fn frame_with_words(words: &[u32]) -> Frame {
        let mut frame = frame_with_features(0);
        frame.bow = words.iter().map(|&w| (w, 1.0)).collect();
        frame
    }

    fn insert_kf(map: &mut Map, db: &mut KeyFrameDatabase, id: u64, words: &[u32]) -> KeyFrameId {
        let kf = KeyFrame::from_frame(KeyFrameId::new(id), frame_with_words(words));
        db.add(kf.id, &kf.bow);
        map.insert_keyframe(kf);
        KeyFrameId::new(id)
    }

    #[test]
    fn test_add_erase() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        let kf = insert_kf(&mut map, &mut db, 0, &[1, 2, 3]);
        assert_eq!(db.len(), 1);

        db.erase(kf);
        assert!(db.is_empty());
        // Double-erase is harmless.
        db.erase(kf);
    }

    #[test]
    fn test_relocalization_finds_similar_keyframe() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();

        let similar = insert_kf(&mut map, &mut db, 0, &[1, 2, 3, 4, 5]);
        let _other = insert_kf(&mut map, &mut db, 2, &[100, 101, 102]);

        let query: BowVector = [1, 2, 3, 4].iter().map(|&w| (w, 1.0)).collect();
        let candidates = db.detect_relocalization_candidates(&map, &query);
        assert_eq!(candidates, vec![similar]);
    }

    #[test]
    fn test_no_candidates_for_unknown_words() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();
        insert_kf(&mut map, &mut db, 0, &[1, 2, 3]);

        let query: BowVector = [900, 901].iter().map(|&w| (w, 1.0)).collect();
        assert!(db.detect_relocalization_candidates(&map, &query).is_empty());
    }

    #[test]
    fn test_loop_candidates_exclude_covisibles() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();

        let query = insert_kf(&mut map, &mut db, 10, &[1, 2, 3, 4]);
        let neighbour = insert_kf(&mut map, &mut db, 12, &[1, 2, 3, 4]);
        let distant = insert_kf(&mut map, &mut db, 0, &[1, 2, 3, 4]);

        // neighbour is covisible with the query; distant is not.
        map.get_keyframe_mut(query)
            .unwrap()
            .set_covisibility(neighbour, 30);
        map.get_keyframe_mut(neighbour)
            .unwrap()
            .set_covisibility(query, 30);

        let candidates = db.detect_loop_candidates(&map, query, 0.0);
        assert!(candidates.contains(&distant));
        assert!(!candidates.contains(&neighbour));
        assert!(!candidates.contains(&query));
    }

    #[test]
    fn test_word_overlap_prefilter() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();

        let query = insert_kf(&mut map, &mut db, 10, &(0..10).collect::<Vec<u32>>());
        let strong = insert_kf(&mut map, &mut db, 0, &(0..10).collect::<Vec<u32>>());
        // Shares only one word out of ten: below 0.8 x max overlap.
        let weak = insert_kf(&mut map, &mut db, 2, &[0, 50, 51, 52]);

        let candidates = db.detect_loop_candidates(&map, query, 0.0);
        assert!(candidates.contains(&strong));
        assert!(!candidates.contains(&weak));
    }

    #[test]
    fn test_word_overlap_boundary_survives() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();

        // max_overlap is 10, so the prefilter threshold is exactly 8.0.
        let query = insert_kf(&mut map, &mut db, 10, &(0..10).collect::<Vec<u32>>());
        let full = insert_kf(&mut map, &mut db, 0, &(0..10).collect::<Vec<u32>>());
        let boundary = insert_kf(&mut map, &mut db, 2, &(0..8).collect::<Vec<u32>>());

        let candidates = db.detect_loop_candidates(&map, query, 0.0);
        assert!(candidates.contains(&full));
        // Exactly 0.8 x max_overlap is "not below" the threshold and must
        // survive.
        assert!(candidates.contains(&boundary));
    }

    #[test]
    fn test_min_score_floor() {
        let mut map = Map::new();
        let mut db = KeyFrameDatabase::new();

        let query = insert_kf(&mut map, &mut db, 10, &(0..8).collect::<Vec<u32>>());
        insert_kf(&mut map, &mut db, 0, &(0..8).collect::<Vec<u32>>());

        // With an impossible floor nothing survives.
        assert!(db.detect_loop_candidates(&map, query, 1.1).is_empty());
        // With a reachable floor the identical keyframe does.
        assert_eq!(db.detect_loop_candidates(&map, query, 0.5).len(), 1);
    }
}
