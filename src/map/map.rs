//! Map - the single owner of keyframes and map points.
//!
//! All cross-references between entities are ids resolved through this
//! container, and every structural mutation goes through it, so the graph
//! invariants (symmetric covisibility, acyclic spanning tree, consistent
//! back-references) are maintained in one place.
//!
//! The map additionally records which entities each batch of mutations
//! touched; [`Map::take_changes`] drains that record as a
//! [`MapChangeEvent`] for publication to subscribed trackers.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use tracing::debug;

use crate::geometry::SE3;

use super::frame::Descriptor;
use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

/// Tombstone table growth that triggers a compaction sweep.
const TOMBSTONE_COMPACT_THRESHOLD: usize = 64;

/// Accumulated entity changes since the last drain.
///
/// Erased ids win over added/updated: an entity created and destroyed inside
/// one batch is reported only as erased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapChangeEvent {
    pub updated_keyframes: Vec<KeyFrameId>,
    pub erased_keyframes: Vec<KeyFrameId>,
    pub updated_map_points: Vec<MapPointId>,
    pub erased_map_points: Vec<MapPointId>,
}

impl MapChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.updated_keyframes.is_empty()
            && self.erased_keyframes.is_empty()
            && self.updated_map_points.is_empty()
            && self.erased_map_points.is_empty()
    }
}

#[derive(Debug, Default)]
struct ChangeTracker {
    updated_keyframes: HashSet<KeyFrameId>,
    erased_keyframes: HashSet<KeyFrameId>,
    updated_map_points: HashSet<MapPointId>,
    erased_map_points: HashSet<MapPointId>,
}

impl ChangeTracker {
    fn keyframe_updated(&mut self, id: KeyFrameId) {
        if !self.erased_keyframes.contains(&id) {
            self.updated_keyframes.insert(id);
        }
    }

    fn keyframe_erased(&mut self, id: KeyFrameId) {
        self.updated_keyframes.remove(&id);
        self.erased_keyframes.insert(id);
    }

    fn map_point_updated(&mut self, id: MapPointId) {
        if !self.erased_map_points.contains(&id) {
            self.updated_map_points.insert(id);
        }
    }

    fn map_point_erased(&mut self, id: MapPointId) {
        self.updated_map_points.remove(&id);
        self.erased_map_points.insert(id);
    }

    fn drain(&mut self) -> MapChangeEvent {
        let mut event = MapChangeEvent {
            updated_keyframes: self.updated_keyframes.drain().collect(),
            erased_keyframes: self.erased_keyframes.drain().collect(),
            updated_map_points: self.updated_map_points.drain().collect(),
            erased_map_points: self.erased_map_points.drain().collect(),
        };
        event.updated_keyframes.sort();
        event.erased_keyframes.sort();
        event.updated_map_points.sort();
        event.erased_map_points.sort();
        event
    }
}

/// The SLAM map.
pub struct Map {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,

    /// Forwarding table for merged map points: old id → surviving id.
    replaced: HashMap<MapPointId, MapPointId>,

    /// Bumped on large mutations: loop closure, global BA completion, reset.
    big_change_index: u64,

    /// Successful loop closures since the last reset.
    loop_count: u32,

    changes: ChangeTracker,
}

impl Map {
    pub fn new() -> Self {
        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            replaced: HashMap::new(),
            big_change_index: 0,
            loop_count: 0,
            changes: ChangeTracker::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change events & counters
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain the accumulated change record.
    pub fn take_changes(&mut self) -> MapChangeEvent {
        self.changes.drain()
    }

    /// Monotonic counter of large mutations (loop closures, GBA).
    pub fn last_big_change_index(&self) -> u64 {
        self.big_change_index
    }

    pub fn record_big_change(&mut self) {
        self.big_change_index += 1;
    }

    pub fn loops_in_map(&self) -> u32 {
        self.loop_count
    }

    pub fn record_loop(&mut self) {
        self.loop_count += 1;
        self.big_change_index += 1;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame storage
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a keyframe into the live set.
    ///
    /// Fails if the id is already taken.
    pub fn insert_keyframe(&mut self, kf: KeyFrame) -> bool {
        let id = kf.id;
        if self.keyframes.contains_key(&id) {
            return false;
        }
        self.keyframes.insert(id, kf);
        self.changes.keyframe_updated(id);
        true
    }

    pub fn get_keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn get_keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.changes.keyframe_updated(id);
        self.keyframes.get_mut(&id)
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.contains_key(&id)
    }

    pub fn keyframes(&self) -> impl Iterator<Item = &KeyFrame> {
        self.keyframes.values()
    }

    /// Snapshot of all live keyframe ids.
    pub fn all_keyframes(&self) -> Vec<KeyFrameId> {
        let mut ids: Vec<_> = self.keyframes.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn keyframes_in_map(&self) -> usize {
        self.keyframes.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint storage
    // ─────────────────────────────────────────────────────────────────────────

    pub fn insert_map_point(&mut self, mp: MapPoint) -> bool {
        let id = mp.id;
        if self.map_points.contains_key(&id) {
            return false;
        }
        self.map_points.insert(id, mp);
        self.changes.map_point_updated(id);
        true
    }

    pub fn get_map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn get_map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.changes.map_point_updated(id);
        self.map_points.get_mut(&id)
    }

    pub fn map_points(&self) -> impl Iterator<Item = &MapPoint> {
        self.map_points.values()
    }

    /// Snapshot of all live map point ids.
    pub fn all_map_points(&self) -> Vec<MapPointId> {
        let mut ids: Vec<_> = self.map_points.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn map_points_in_map(&self) -> usize {
        self.map_points.len()
    }

    /// Follow the replacement chain until a live map point (or nothing).
    pub fn resolve_map_point(&self, id: MapPointId) -> Option<MapPointId> {
        let mut current = id;
        loop {
            if self.map_points.contains_key(&current) {
                return Some(current);
            }
            match self.replaced.get(&current) {
                Some(&next) => current = next,
                None => return None,
            }
        }
    }

    /// The direct forwarding target of a merged map point, if any.
    pub fn replacement_of(&self, id: MapPointId) -> Option<MapPointId> {
        self.replaced.get(&id).copied()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the bidirectional association between a keyframe feature slot
    /// and a map point, incrementing covisibility with every other observer.
    pub fn associate(&mut self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> bool {
        let other_observers: Vec<KeyFrameId> = match self.map_points.get(&mp_id) {
            Some(mp) => {
                if mp.observed_by(kf_id) {
                    // Already associated; just make sure the slot agrees.
                    if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                        kf.set_map_point(feature_idx, mp_id);
                    }
                    return true;
                }
                mp.observations.keys().copied().collect()
            }
            None => return false,
        };

        let slot_valid = self
            .keyframes
            .get(&kf_id)
            .map(|kf| feature_idx < kf.num_features())
            .unwrap_or(false);
        if !slot_valid {
            return false;
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, feature_idx);
        }
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_map_point(feature_idx, mp_id);
        }

        for other_id in other_observers {
            if other_id == kf_id {
                continue;
            }
            let weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0)
                + 1;
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other_id, weight);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.set_covisibility(kf_id, weight);
            }
        }

        self.changes.keyframe_updated(kf_id);
        self.changes.map_point_updated(mp_id);
        true
    }

    /// Remove the association at a feature slot, decrementing covisibility.
    ///
    /// Returns the map point that was disassociated, if any.
    pub fn disassociate(&mut self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let mp_id = self.keyframes.get(&kf_id)?.map_point(feature_idx)?;

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.clear_map_point(feature_idx);
        }

        let other_observers: Vec<KeyFrameId> = self
            .map_points
            .get(&mp_id)
            .map(|mp| {
                mp.observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.erase_observation(kf_id);
        }

        self.decrement_covisibility(kf_id, &other_observers);

        self.changes.keyframe_updated(kf_id);
        self.changes.map_point_updated(mp_id);
        Some(mp_id)
    }

    fn decrement_covisibility(&mut self, kf_id: KeyFrameId, others: &[KeyFrameId]) {
        for &other_id in others {
            let weight = self
                .keyframes
                .get(&other_id)
                .map(|kf| kf.covisibility_weight(kf_id))
                .unwrap_or(0);
            if weight <= 1 {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.erase_covisibility(other_id);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.erase_covisibility(kf_id);
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_covisibility(other_id, weight - 1);
                }
                if let Some(other) = self.keyframes.get_mut(&other_id) {
                    other.set_covisibility(kf_id, weight - 1);
                }
            }
        }
    }

    /// Recompute a keyframe's covisibility adjacency from its observations.
    ///
    /// Fusion migrates observations wholesale (see [`Map::replace_map_point`])
    /// without touching edge weights; this pass restores the invariant that
    /// every weight equals the number of points both endpoints observe.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let mut counts: HashMap<KeyFrameId, usize> = HashMap::new();
        {
            let kf = match self.keyframes.get(&kf_id) {
                Some(kf) => kf,
                None => return,
            };
            for (_, mp_id) in kf.observed_map_points() {
                let live = match self.resolve_map_point(mp_id) {
                    Some(id) => id,
                    None => continue,
                };
                if let Some(mp) = self.map_points.get(&live) {
                    for &other in mp.observations.keys() {
                        if other != kf_id {
                            *counts.entry(other).or_insert(0) += 1;
                        }
                    }
                }
            }
        }

        let stale: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibles().filter(|id| !counts.contains_key(id)).collect())
            .unwrap_or_default();
        for other_id in stale {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.erase_covisibility(other_id);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.erase_covisibility(kf_id);
            }
        }

        for (other_id, weight) in counts {
            if !self.keyframes.contains_key(&other_id) {
                continue;
            }
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.set_covisibility(other_id, weight);
            }
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.set_covisibility(kf_id, weight);
            }
        }
        self.changes.keyframe_updated(kf_id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning tree
    // ─────────────────────────────────────────────────────────────────────────

    /// Attach a newly-connected keyframe to the spanning tree.
    ///
    /// The parent is the highest-weight covisible keyframe; the first
    /// keyframe in the map becomes the root. No-op if already attached.
    pub fn attach_to_spanning_tree(&mut self, kf_id: KeyFrameId) {
        let already_attached = match self.keyframes.get(&kf_id) {
            Some(kf) => kf.parent.is_some(),
            None => return,
        };
        if already_attached {
            return;
        }

        let parent = self
            .keyframes
            .get_mut(&kf_id)
            .map(|kf| kf.ordered_covisibles())
            .unwrap_or_default()
            .into_iter()
            .map(|(id, _)| id)
            .find(|id| self.keyframes.contains_key(id));

        if let Some(parent_id) = parent {
            if parent_id != kf_id && !self.would_create_cycle(kf_id, parent_id) {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_parent(parent_id);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                    parent_kf.add_child(kf_id);
                }
                self.changes.keyframe_updated(kf_id);
                self.changes.keyframe_updated(parent_id);
            }
        }
    }

    /// True if making `parent_id` the parent of `kf_id` would close a cycle.
    fn would_create_cycle(&self, kf_id: KeyFrameId, parent_id: KeyFrameId) -> bool {
        let mut current = Some(parent_id);
        while let Some(id) = current {
            if id == kf_id {
                return true;
            }
            current = self.keyframes.get(&id).and_then(|kf| kf.parent);
        }
        false
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Erasure
    // ─────────────────────────────────────────────────────────────────────────

    /// Pin a keyframe against culling.
    pub fn set_not_erase(&mut self, kf_id: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.not_erase = true;
        }
    }

    /// Release the culling pin; commits a cull that arrived while pinned.
    ///
    /// Keyframes holding loop edges stay pinned permanently.
    pub fn set_erase(&mut self, kf_id: KeyFrameId) {
        let commit = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                if kf.loop_edges.is_empty() {
                    kf.not_erase = false;
                }
                !kf.not_erase && kf.to_be_erased
            }
            None => false,
        };
        if commit {
            self.erase_keyframe(kf_id);
        }
    }

    /// Mark a keyframe bad and detach it from the graph.
    ///
    /// If the keyframe is pinned (`not_erase`), the cull is recorded as
    /// pending and committed when the pin is released. Children are
    /// re-parented to their own highest-weight live covisible keyframe
    /// (deterministic tie-break by lower id), falling back to the culled
    /// keyframe's parent. The root keyframe is never erased.
    ///
    /// Returns true if the keyframe was actually erased.
    pub fn erase_keyframe(&mut self, kf_id: KeyFrameId) -> bool {
        {
            let kf = match self.keyframes.get_mut(&kf_id) {
                Some(kf) => kf,
                None => return false,
            };
            if kf.is_root() {
                return false;
            }
            if kf.not_erase {
                kf.to_be_erased = true;
                return false;
            }
        }

        // Detach observations (decrements covisibility with every observer).
        let slots: Vec<(usize, MapPointId)> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.observed_map_points().collect())
            .unwrap_or_default();
        for (idx, _) in &slots {
            self.disassociate(kf_id, *idx);
        }

        // Points orphaned by the cull (a single remaining observer cannot
        // constrain a landmark) go with it.
        for (_, mp_id) in slots {
            let orphaned = self
                .map_points
                .get(&mp_id)
                .map(|mp| mp.num_observations() < 2)
                .unwrap_or(false);
            if orphaned {
                self.erase_map_point(mp_id);
            }
        }

        // Remove remaining covisibility edges (weak edges carry no points
        // after disassociation but may still exist in the raw adjacency).
        let covisibles: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.covisibles().collect())
            .unwrap_or_default();
        for other_id in covisibles {
            if let Some(other) = self.keyframes.get_mut(&other_id) {
                other.erase_covisibility(kf_id);
            }
        }

        let parent_id = self.keyframes.get(&kf_id).and_then(|kf| kf.parent);
        let mut children: Vec<KeyFrameId> = self
            .keyframes
            .get(&kf_id)
            .map(|kf| kf.children.iter().copied().collect())
            .unwrap_or_default();
        children.sort();

        // Re-parent every child to its best live covisible candidate.
        for child_id in children {
            let mut best: Option<(usize, KeyFrameId)> = None;
            if let Some(child) = self.keyframes.get(&child_id) {
                for (&cand_id, &weight) in child.covisibility_weights() {
                    if cand_id == kf_id || !self.keyframes.contains_key(&cand_id) {
                        continue;
                    }
                    if self.would_create_cycle(child_id, cand_id) {
                        continue;
                    }
                    let better = match best {
                        None => true,
                        Some((best_w, best_id)) => {
                            weight > best_w || (weight == best_w && cand_id < best_id)
                        }
                    };
                    if better {
                        best = Some((weight, cand_id));
                    }
                }
            }
            let new_parent = best.map(|(_, id)| id).or(parent_id);
            if let Some(new_parent_id) = new_parent {
                if let Some(child) = self.keyframes.get_mut(&child_id) {
                    child.set_parent(new_parent_id);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&new_parent_id) {
                    parent_kf.add_child(child_id);
                }
                self.changes.keyframe_updated(child_id);
            }
        }

        if let Some(parent_id) = parent_id {
            // Record the relative pose for late readers of the culled frame.
            let tcp = self.keyframes.get(&parent_id).map(|parent| {
                let kf = &self.keyframes[&kf_id];
                kf.pose.compose(&parent.pose.inverse())
            });
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                kf.tcp = tcp;
                kf.bad = true;
            }
            if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                parent_kf.erase_child(kf_id);
            }
        }

        self.keyframes.remove(&kf_id);
        self.changes.keyframe_erased(kf_id);
        debug!(kf = %kf_id, "keyframe erased");
        true
    }

    /// Mark a map point bad and remove it, clearing every observing slot.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) -> bool {
        let observations: Vec<(KeyFrameId, usize)> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .map(|(&kf_id, &idx)| (kf_id, idx))
                .collect(),
            None => return false,
        };

        for (kf_id, idx) in &observations {
            if let Some(kf) = self.keyframes.get_mut(kf_id) {
                kf.clear_map_point(*idx);
            }
            self.changes.keyframe_updated(*kf_id);
        }

        // Every observer pair loses one shared point.
        for (i, (kf_a, _)) in observations.iter().enumerate() {
            let others: Vec<KeyFrameId> =
                observations.iter().skip(i + 1).map(|(id, _)| *id).collect();
            self.decrement_covisibility(*kf_a, &others);
        }

        self.map_points.remove(&mp_id);
        self.changes.map_point_erased(mp_id);
        true
    }

    /// Merge `old_id` into `new_id`.
    ///
    /// Observations move over unless the observer already sees `new_id` at
    /// another slot, in which case the old slot is cleared. The old point
    /// becomes a tombstone that forwards lookups to the survivor.
    pub fn replace_map_point(&mut self, old_id: MapPointId, new_id: MapPointId) -> bool {
        if old_id == new_id || !self.map_points.contains_key(&new_id) {
            return false;
        }
        let old = match self.map_points.remove(&old_id) {
            Some(mp) => mp,
            None => return false,
        };

        for (&kf_id, &idx) in &old.observations {
            let already_sees_new = self
                .map_points
                .get(&new_id)
                .map(|mp| mp.observed_by(kf_id))
                .unwrap_or(false);

            if already_sees_new {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.clear_map_point(idx);
                }
                // The pair loses a shared point: old contributed one edge
                // increment that new already accounts for.
                let others: Vec<KeyFrameId> = old
                    .observations
                    .keys()
                    .filter(|&&id| id != kf_id)
                    .copied()
                    .collect();
                self.decrement_covisibility(kf_id, &others);
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(idx, new_id);
                }
                if let Some(mp) = self.map_points.get_mut(&new_id) {
                    mp.add_observation(kf_id, idx);
                }
            }
            self.changes.keyframe_updated(kf_id);
        }

        if let Some(mp) = self.map_points.get_mut(&new_id) {
            mp.increase_visible(old.visible_count);
            mp.increase_found(old.found_count);
        }

        self.replaced.insert(old_id, new_id);
        if self.replaced.len() > TOMBSTONE_COMPACT_THRESHOLD {
            self.compact_tombstones();
        }

        self.changes.map_point_erased(old_id);
        self.changes.map_point_updated(new_id);
        debug!(old = %old_id, new = %new_id, "map point replaced");
        true
    }

    /// Drop forwarding entries that no keyframe slot references anymore.
    fn compact_tombstones(&mut self) {
        let referenced: HashSet<MapPointId> = self
            .keyframes
            .values()
            .flat_map(|kf| kf.observed_map_points().map(|(_, id)| id))
            .filter(|id| !self.map_points.contains_key(id))
            .collect();
        self.replaced.retain(|old, _| referenced.contains(old));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Maintenance
    // ─────────────────────────────────────────────────────────────────────────

    /// Recompute a map point's viewing normal and distance bounds.
    pub fn update_map_point_geometry(&mut self, mp_id: MapPointId) {
        let (centers, ref_data) = match self.map_points.get(&mp_id) {
            Some(mp) => {
                let centers: Vec<(KeyFrameId, Vector3<f64>)> = mp
                    .observations
                    .keys()
                    .filter_map(|&kf_id| {
                        self.keyframes
                            .get(&kf_id)
                            .map(|kf| (kf_id, kf.camera_center()))
                    })
                    .collect();
                let ref_data = self.keyframes.get(&mp.reference_kf).map(|kf| {
                    let level = mp
                        .observations
                        .get(&kf.id)
                        .and_then(|&idx| kf.features.get(idx))
                        .map(|f| f.octave)
                        .unwrap_or(0);
                    (
                        kf.camera_center(),
                        level,
                        kf.pyramid.scale_factor,
                        kf.pyramid.n_levels,
                    )
                });
                (centers, ref_data)
            }
            None => return,
        };

        if let (Some(mp), Some((ref_center, level, scale_factor, n_levels))) =
            (self.map_points.get_mut(&mp_id), ref_data)
        {
            mp.update_normal_and_depth(
                centers.into_iter(),
                &ref_center,
                level,
                scale_factor,
                n_levels,
            );
            self.changes.map_point_updated(mp_id);
        }
    }

    /// Recompute a map point's representative descriptor: the observation
    /// descriptor with minimum median distance to all others.
    pub fn update_map_point_descriptor(&mut self, mp_id: MapPointId) {
        let descriptors: Vec<Descriptor> = match self.map_points.get(&mp_id) {
            Some(mp) => mp
                .observations
                .iter()
                .filter_map(|(&kf_id, &idx)| {
                    self.keyframes
                        .get(&kf_id)
                        .and_then(|kf| kf.descriptors.get(idx).copied())
                })
                .collect(),
            None => return,
        };
        if descriptors.is_empty() {
            return;
        }

        let mut best_idx = 0usize;
        let mut best_median = u32::MAX;
        for (i, a) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors.iter().map(|b| a.distance(b)).collect();
            dists.sort_unstable();
            let median = dists[dists.len() / 2];
            if median < best_median {
                best_median = median;
                best_idx = i;
            }
        }

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.descriptor = descriptors[best_idx];
            self.changes.map_point_updated(mp_id);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Mirror synchronisation
    // ─────────────────────────────────────────────────────────────────────────
    //
    // A client mirror applies serialised updates wholesale: the authoritative
    // side already maintained the graph invariants, so no fixups run here.

    /// Insert or overwrite a keyframe received from a map-change event.
    pub fn sync_keyframe(&mut self, kf: KeyFrame) {
        let id = kf.id;
        self.keyframes.insert(id, kf);
        self.changes.keyframe_updated(id);
    }

    /// Insert or overwrite a map point received from a map-change event.
    pub fn sync_map_point(&mut self, mp: MapPoint) {
        let id = mp.id;
        if let Some(target) = mp.replaced_by {
            self.replaced.insert(id, target);
        }
        self.map_points.insert(id, mp);
        self.changes.map_point_updated(id);
    }

    /// Drop a keyframe named in an erasure event, without graph fixups.
    pub fn sync_erase_keyframe(&mut self, id: KeyFrameId) {
        if self.keyframes.remove(&id).is_some() {
            self.changes.keyframe_erased(id);
        }
    }

    /// Drop a map point named in an erasure event, without graph fixups.
    pub fn sync_erase_map_point(&mut self, id: MapPointId) {
        if self.map_points.remove(&id).is_some() {
            self.changes.map_point_erased(id);
        }
    }

    /// Remove everything. The next insert starts a fresh map.
    pub fn clear(&mut self) {
        for id in self.keyframes.keys() {
            self.changes.keyframe_erased(*id);
        }
        for id in self.map_points.keys() {
            self.changes.map_point_erased(*id);
        }
        self.keyframes.clear();
        self.map_points.clear();
        self.replaced.clear();
        self.loop_count = 0;
        self.big_change_index += 1;
    }
}

impl Default for Map {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map")
            .field("keyframes", &self.keyframes.len())
            .field("map_points", &self.map_points.len())
            .field("tombstones", &self.replaced.len())
            .field("big_change_index", &self.big_change_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::frame::test_support::frame_with_features;

    fn add_keyframe(map: &mut Map, id: u64, num_features: usize) -> KeyFrameId {
        let kf = KeyFrame::from_frame(KeyFrameId::new(id), frame_with_features(num_features));
        assert!(map.insert_keyframe(kf));
        KeyFrameId::new(id)
    }

    fn add_map_point(map: &mut Map, id: u64, ref_kf: KeyFrameId) -> MapPointId {
        let mp = MapPoint::new(
            MapPointId::new(id),
            Vector3::new(0.0, 0.0, 5.0),
            Descriptor::default(),
            ref_kf,
        );
        assert!(map.insert_map_point(mp));
        MapPointId::new(id)
    }

    #[test]
    fn test_duplicate_keyframe_rejected() {
        let mut map = Map::new();
        add_keyframe(&mut map, 0, 4);
        let kf = KeyFrame::from_frame(KeyFrameId::new(0), frame_with_features(4));
        assert!(!map.insert_keyframe(kf));
    }

    #[test]
    fn test_associate_builds_symmetric_covisibility() {
        let mut map = Map::new();
        let kf1 = add_keyframe(&mut map, 0, 40);
        let kf2 = add_keyframe(&mut map, 1, 40);

        for i in 0..30 {
            let mp = add_map_point(&mut map, 100 + i as u64, kf1);
            assert!(map.associate(kf1, i, mp));
            assert!(map.associate(kf2, i, mp));
        }

        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 30);
        assert_eq!(map.get_keyframe(kf2).unwrap().covisibility_weight(kf1), 30);
    }

    #[test]
    fn test_disassociate_decrements_weight() {
        let mut map = Map::new();
        let kf1 = add_keyframe(&mut map, 0, 10);
        let kf2 = add_keyframe(&mut map, 1, 10);
        let mp = add_map_point(&mut map, 100, kf1);
        map.associate(kf1, 0, mp);
        map.associate(kf2, 0, mp);

        assert_eq!(map.disassociate(kf1, 0), Some(mp));
        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
        assert_eq!(map.get_map_point(mp).unwrap().num_observations(), 1);
        assert_eq!(map.get_keyframe(kf1).unwrap().map_point(0), None);
    }

    #[test]
    fn test_erase_map_point_clears_slots() {
        let mut map = Map::new();
        let kf1 = add_keyframe(&mut map, 0, 10);
        let kf2 = add_keyframe(&mut map, 1, 10);
        let mp = add_map_point(&mut map, 100, kf1);
        map.associate(kf1, 3, mp);
        map.associate(kf2, 4, mp);

        assert!(map.erase_map_point(mp));
        assert!(map.get_map_point(mp).is_none());
        assert_eq!(map.get_keyframe(kf1).unwrap().map_point(3), None);
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(4), None);
        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 0);
    }

    #[test]
    fn test_replace_forwards_and_migrates() {
        let mut map = Map::new();
        let kf1 = add_keyframe(&mut map, 0, 10);
        let kf2 = add_keyframe(&mut map, 1, 10);
        let a = add_map_point(&mut map, 100, kf1);
        let b = add_map_point(&mut map, 101, kf1);

        map.associate(kf1, 0, a);
        map.associate(kf2, 1, a);
        map.associate(kf2, 2, b);

        assert!(map.replace_map_point(a, b));

        // A is gone but forwards to B.
        assert!(map.get_map_point(a).is_none());
        assert_eq!(map.replacement_of(a), Some(b));
        assert_eq!(map.resolve_map_point(a), Some(b));

        // kf1 now observes B at A's old slot.
        assert_eq!(map.get_keyframe(kf1).unwrap().map_point(0), Some(b));
        assert!(map.get_map_point(b).unwrap().observed_by(kf1));

        // kf2 already observed B, so its old slot for A was cleared.
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(1), None);
        assert_eq!(map.get_keyframe(kf2).unwrap().map_point(2), Some(b));
    }

    #[test]
    fn test_update_connections_repairs_weights_after_replace() {
        let mut map = Map::new();
        let kf1 = add_keyframe(&mut map, 0, 10);
        let kf2 = add_keyframe(&mut map, 1, 10);
        let orig = add_map_point(&mut map, 100, kf1);
        let dup = add_map_point(&mut map, 101, kf2);
        map.associate(kf1, 0, orig);
        map.associate(kf2, 0, dup);

        // Merging the duplicate gives both keyframes a shared point, but
        // the migrated observation carries no weight increment...
        map.replace_map_point(dup, orig);
        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 0);

        // ...until connections are recomputed.
        map.update_connections(kf2);
        assert_eq!(map.get_keyframe(kf1).unwrap().covisibility_weight(kf2), 1);
        assert_eq!(map.get_keyframe(kf2).unwrap().covisibility_weight(kf1), 1);
    }

    #[test]
    fn test_replace_chain_resolves_transitively() {
        let mut map = Map::new();
        let kf = add_keyframe(&mut map, 0, 10);
        let a = add_map_point(&mut map, 100, kf);
        let b = add_map_point(&mut map, 101, kf);
        let c = add_map_point(&mut map, 102, kf);

        map.replace_map_point(a, b);
        map.replace_map_point(b, c);
        assert_eq!(map.resolve_map_point(a), Some(c));
    }

    #[test]
    fn test_erase_keyframe_reparents_children_by_weight() {
        let mut map = Map::new();
        let root = add_keyframe(&mut map, 0, 120);
        let p = add_keyframe(&mut map, 1, 120);
        let n = add_keyframe(&mut map, 2, 120);
        let c1 = add_keyframe(&mut map, 3, 120);
        let c2 = add_keyframe(&mut map, 4, 120);

        // Build covisibility through shared observations:
        // root-p strong; c1 shares most with n; c2 shares most with root.
        let mut next_mp = 1000u64;
        let mut share = |map: &mut Map, a: KeyFrameId, b: KeyFrameId, count: usize, base: usize| {
            for i in 0..count {
                let mp = MapPoint::new(
                    MapPointId::new(next_mp),
                    Vector3::new(0.0, 0.0, 5.0),
                    Descriptor::default(),
                    a,
                );
                next_mp += 1;
                map.insert_map_point(mp);
                map.associate(a, base + i, MapPointId::new(next_mp - 1));
                map.associate(b, base + i, MapPointId::new(next_mp - 1));
            }
        };
        // Each call uses a slot range free in both keyframes.
        share(&mut map, root, p, 30, 0);
        share(&mut map, p, c1, 20, 30);
        share(&mut map, n, c1, 25, 50);
        share(&mut map, p, c2, 18, 75);
        share(&mut map, root, c2, 22, 93);

        // Spanning tree: root -> p, p -> {c1, c2}; n attaches under c1.
        map.attach_to_spanning_tree(p);
        assert_eq!(map.get_keyframe(p).unwrap().parent, Some(root));
        for kf in [c1, c2] {
            if let Some(k) = map.get_keyframe_mut(kf) {
                k.set_parent(p);
            }
            if let Some(pk) = map.get_keyframe_mut(p) {
                pk.add_child(kf);
            }
        }
        if let Some(k) = map.get_keyframe_mut(n) {
            k.set_parent(c1);
        }
        if let Some(k) = map.get_keyframe_mut(c1) {
            k.add_child(n);
        }

        assert!(map.erase_keyframe(p));

        // c1's strongest surviving covisible is n, but n is its descendant;
        // the next candidate wins instead.
        let c1_parent = map.get_keyframe(c1).unwrap().parent.unwrap();
        assert_ne!(c1_parent, n);
        // c2 re-parents to root (22 shared points, its best survivor).
        assert_eq!(map.get_keyframe(c2).unwrap().parent, Some(root));

        // Tree stays acyclic: every keyframe reaches the root.
        for id in map.all_keyframes() {
            let mut seen = HashSet::new();
            let mut cur = Some(id);
            while let Some(c) = cur {
                assert!(seen.insert(c), "cycle through {}", c);
                cur = map.get_keyframe(c).unwrap().parent;
            }
        }
    }

    #[test]
    fn test_erase_pinned_keyframe_is_deferred() {
        let mut map = Map::new();
        let root = add_keyframe(&mut map, 0, 10);
        let kf = add_keyframe(&mut map, 1, 10);
        if let Some(k) = map.get_keyframe_mut(kf) {
            k.set_parent(root);
        }

        map.set_not_erase(kf);
        assert!(!map.erase_keyframe(kf));
        assert!(map.contains_keyframe(kf));
        assert!(map.get_keyframe(kf).unwrap().to_be_erased);

        // Releasing the pin commits the pending cull.
        map.set_erase(kf);
        assert!(!map.contains_keyframe(kf));
    }

    #[test]
    fn test_root_never_erased() {
        let mut map = Map::new();
        let root = add_keyframe(&mut map, 0, 10);
        assert!(!map.erase_keyframe(root));
        assert!(map.contains_keyframe(root));
    }

    #[test]
    fn test_change_events_drain() {
        let mut map = Map::new();
        let kf = add_keyframe(&mut map, 0, 10);
        let mp = add_map_point(&mut map, 100, kf);

        let event = map.take_changes();
        assert_eq!(event.updated_keyframes, vec![kf]);
        assert_eq!(event.updated_map_points, vec![mp]);
        assert!(map.take_changes().is_empty());

        map.erase_map_point(mp);
        let event = map.take_changes();
        assert_eq!(event.erased_map_points, vec![mp]);
        // An entity erased after its creation batch reports as updated+erased
        // only in the respective batches, never both in one.
        assert!(!event.updated_map_points.contains(&mp));
    }

    #[test]
    fn test_big_change_index() {
        let mut map = Map::new();
        assert_eq!(map.last_big_change_index(), 0);
        map.record_loop();
        assert_eq!(map.last_big_change_index(), 1);
        assert_eq!(map.loops_in_map(), 1);
        map.record_big_change();
        assert_eq!(map.last_big_change_index(), 2);
    }
}
