//! Frame - fully-populated sensor data delivered by a tracker.
//!
//! Feature extraction, rectification, and Bag-of-Words computation all happen
//! on the tracker side; the mapping back-end only consumes the result. A
//! `Frame` therefore carries plain data: camera intrinsics, the scale
//! pyramid, the feature list with descriptors, and the precomputed BoW
//! vector.

use std::collections::HashMap;

use nalgebra::Vector3;

use crate::geometry::SE3;

/// Number of bytes in an ORB descriptor (256 bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// A binary ORB descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Hamming distance between two descriptors.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self([0u8; DESCRIPTOR_BYTES])
    }
}

/// Sparse Bag-of-Words histogram: word id → weight.
///
/// Produced by the tracker's vocabulary; the mapper only ever compares these.
pub type BowVector = HashMap<u32, f64>;

/// Normalised L1 similarity between two BoW vectors, in [0, 1].
pub fn bow_score(a: &BowVector, b: &BowVector) -> f64 {
    let norm_a: f64 = a.values().map(|w| w.abs()).sum();
    let norm_b: f64 = b.values().map(|w| w.abs()).sum();
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return 0.0;
    }

    let mut score = 0.0;
    for (word, wa) in a {
        if let Some(wb) = b.get(word) {
            let na = wa / norm_a;
            let nb = wb / norm_b;
            score += na.abs() + nb.abs() - (na - nb).abs();
        }
    }
    0.5 * score
}

/// Number of vocabulary words two BoW vectors have in common.
pub fn shared_words(a: &BowVector, b: &BowVector) -> usize {
    if a.len() > b.len() {
        return shared_words(b, a);
    }
    a.keys().filter(|w| b.contains_key(w)).count()
}

/// A single undistorted image feature.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feature {
    /// Horizontal image coordinate (pixels).
    pub u: f64,
    /// Vertical image coordinate (pixels).
    pub v: f64,
    /// Pyramid level the feature was detected at.
    pub octave: i32,
    /// Horizontal coordinate in the right image, or negative if monocular.
    pub right: f64,
    /// Depth from stereo/RGB-D, or negative if unavailable.
    pub depth: f64,
}

impl Feature {
    /// A monocular feature (no stereo coordinate, no depth).
    pub fn mono(u: f64, v: f64, octave: i32) -> Self {
        Self {
            u,
            v,
            octave,
            right: -1.0,
            depth: -1.0,
        }
    }

    /// A feature with a stereo match and triangulated depth.
    pub fn stereo(u: f64, v: f64, octave: i32, right: f64, depth: f64) -> Self {
        Self {
            u,
            v,
            octave,
            right,
            depth,
        }
    }

    pub fn has_depth(&self) -> bool {
        self.depth > 0.0
    }
}

/// Pinhole camera intrinsics and image bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    /// Stereo baseline times fx; zero for monocular.
    pub bf: f64,
    pub width: u32,
    pub height: u32,
}

impl CameraIntrinsics {
    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` if the point lies behind the camera.
    pub fn project(&self, p_cam: &Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let u = self.fx * p_cam.x / p_cam.z + self.cx;
        let v = self.fy * p_cam.y / p_cam.z + self.cy;
        Some((u, v))
    }

    /// Back-project a pixel with depth into the camera frame.
    pub fn unproject(&self, u: f64, v: f64, depth: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth / self.fx,
            (v - self.cy) * depth / self.fy,
            depth,
        )
    }

    pub fn in_image(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && u < self.width as f64 && v >= 0.0 && v < self.height as f64
    }
}

/// ORB scale pyramid parameters, copied verbatim from the tracker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePyramid {
    pub n_levels: u32,
    pub scale_factor: f64,
    /// Per-level scale: scale_factors[l] = scale_factor^l.
    pub scale_factors: Vec<f64>,
    /// Per-level measurement variance: sigma2[l] = scale_factors[l]^2.
    pub level_sigma2: Vec<f64>,
}

impl ScalePyramid {
    pub fn new(n_levels: u32, scale_factor: f64) -> Self {
        let scale_factors: Vec<f64> = (0..n_levels)
            .map(|l| scale_factor.powi(l as i32))
            .collect();
        let level_sigma2 = scale_factors.iter().map(|s| s * s).collect();
        Self {
            n_levels,
            scale_factor,
            scale_factors,
            level_sigma2,
        }
    }

    /// Pyramid level whose scale best matches a viewing distance, given the
    /// distance at which the point was first observed at level 0.
    pub fn predict_level(&self, max_distance: f64, distance: f64) -> i32 {
        if distance <= 0.0 {
            return 0;
        }
        let ratio = max_distance / distance;
        let level = (ratio.ln() / self.scale_factor.ln()).ceil() as i32;
        level.clamp(0, self.n_levels as i32 - 1)
    }
}

/// A fully-populated frame handed over by a tracker.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Capture timestamp, nanoseconds.
    pub timestamp_ns: u64,
    pub intrinsics: CameraIntrinsics,
    pub pyramid: ScalePyramid,
    pub features: Vec<Feature>,
    /// One descriptor per feature.
    pub descriptors: Vec<Descriptor>,
    /// Precomputed Bag-of-Words histogram.
    pub bow: BowVector,
    /// Vocabulary word of each feature, parallel to `features`.
    ///
    /// Empty when the tracker supplied no vocabulary assignment; matching
    /// then falls back to exhaustive descriptor comparison.
    pub feature_words: Vec<u32>,
    /// Pose estimate from tracking, Tcw.
    pub pose: SE3,
}

impl Frame {
    pub fn num_features(&self) -> usize {
        self.features.len()
    }

    /// Indices of features within `radius` pixels of (u, v), optionally
    /// restricted to a pyramid level range.
    pub fn features_in_area(
        &self,
        u: f64,
        v: f64,
        radius: f64,
        min_level: Option<i32>,
        max_level: Option<i32>,
    ) -> Vec<usize> {
        features_in_area(&self.features, u, v, radius, min_level, max_level)
    }
}

pub(crate) fn features_in_area(
    features: &[Feature],
    u: f64,
    v: f64,
    radius: f64,
    min_level: Option<i32>,
    max_level: Option<i32>,
) -> Vec<usize> {
    let radius_sq = radius * radius;
    let mut indices = Vec::new();
    for (i, feat) in features.iter().enumerate() {
        if let Some(min) = min_level {
            if feat.octave < min {
                continue;
            }
        }
        if let Some(max) = max_level {
            if feat.octave > max {
                continue;
            }
        }
        let du = feat.u - u;
        let dv = feat.v - v;
        if du * du + dv * dv <= radius_sq {
            indices.push(i);
        }
    }
    indices
}
