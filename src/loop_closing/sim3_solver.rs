//! Sim(3) estimation between two keyframes from matched map points.
//!
//! Closed-form alignment (Horn's absolute orientation) inside a RANSAC loop,
//! followed by an inlier refinement pass. The solver works on camera-frame
//! point sets: drift between the two trajectory segments shows up as the
//! similarity transform between them.

use nalgebra::{Matrix3, Vector3};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::geometry::Sim3;

/// A matched pair of camera-frame points (current keyframe, loop keyframe).
pub type PointPair = (Vector3<f64>, Vector3<f64>);

#[derive(Debug, Clone)]
pub struct Sim3SolverConfig {
    pub ransac_iterations: usize,
    /// Squared alignment error (metres²) below which a pair is an inlier.
    pub inlier_threshold_sq: f64,
    /// Refinement passes over the inlier set after RANSAC.
    pub refinement_passes: usize,
    /// Fix scale to 1 (stereo / RGB-D trackers).
    pub fix_scale: bool,
    /// Seed for the sampling RNG; fixed for reproducibility.
    pub seed: u64,
}

impl Default for Sim3SolverConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 300,
            inlier_threshold_sq: 0.01,
            refinement_passes: 3,
            fix_scale: false,
            seed: 0x5eed,
        }
    }
}

/// Estimated alignment with its supporting inliers.
pub struct Sim3Estimate {
    /// Transform taking loop-keyframe camera points into the current
    /// keyframe's camera frame.
    pub transform: Sim3,
    /// Indices into the input pair list.
    pub inliers: Vec<usize>,
}

/// RANSAC + refinement over matched camera-frame point pairs.
///
/// Returns `None` when no model reaches `min_inliers` support.
pub fn solve_sim3(
    pairs: &[PointPair],
    min_inliers: usize,
    config: &Sim3SolverConfig,
) -> Option<Sim3Estimate> {
    if pairs.len() < 3 || pairs.len() < min_inliers {
        return None;
    }

    let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed);
    let indices: Vec<usize> = (0..pairs.len()).collect();

    let mut best: Option<(Sim3, Vec<usize>)> = None;
    for _ in 0..config.ransac_iterations {
        let sample: Vec<usize> = indices
            .choose_multiple(&mut rng, 3)
            .copied()
            .collect();
        let sampled: Vec<PointPair> = sample.iter().map(|&i| pairs[i]).collect();
        let model = match horn_alignment(&sampled, config.fix_scale) {
            Some(model) => model,
            None => continue,
        };

        let inliers = classify_inliers(pairs, &model, config.inlier_threshold_sq);
        let better = match &best {
            None => true,
            Some((_, best_inliers)) => inliers.len() > best_inliers.len(),
        };
        if better {
            best = Some((model, inliers));
        }
    }

    let (mut model, mut inliers) = best?;
    if inliers.len() < min_inliers {
        return None;
    }

    // Refine on the full inlier set, reclassifying between passes.
    for _ in 0..config.refinement_passes {
        let inlier_pairs: Vec<PointPair> = inliers.iter().map(|&i| pairs[i]).collect();
        match horn_alignment(&inlier_pairs, config.fix_scale) {
            Some(refined) => {
                let reclassified = classify_inliers(pairs, &refined, config.inlier_threshold_sq);
                if reclassified.len() < min_inliers {
                    break;
                }
                model = refined;
                inliers = reclassified;
            }
            None => break,
        }
    }

    Some(Sim3Estimate {
        transform: model,
        inliers,
    })
}

fn classify_inliers(pairs: &[PointPair], model: &Sim3, threshold_sq: f64) -> Vec<usize> {
    pairs
        .iter()
        .enumerate()
        .filter(|(_, (current, loop_point))| {
            (model.transform_point(loop_point) - current).norm_squared() < threshold_sq
        })
        .map(|(i, _)| i)
        .collect()
}

/// Closed-form similarity alignment: finds S with `current ≈ S(loop)`.
fn horn_alignment(pairs: &[PointPair], fix_scale: bool) -> Option<Sim3> {
    let n = pairs.len();
    if n < 3 {
        return None;
    }
    let inv_n = 1.0 / n as f64;

    let centroid_current: Vector3<f64> =
        pairs.iter().map(|(c, _)| *c).sum::<Vector3<f64>>() * inv_n;
    let centroid_loop: Vector3<f64> = pairs.iter().map(|(_, l)| *l).sum::<Vector3<f64>>() * inv_n;

    // Cross-covariance of the centred sets.
    let mut m = Matrix3::zeros();
    let mut loop_spread = 0.0;
    for (current, loop_point) in pairs {
        let c = current - centroid_current;
        let l = loop_point - centroid_loop;
        m += c * l.transpose();
        loop_spread += l.norm_squared();
    }
    if loop_spread < 1e-12 {
        return None;
    }

    let svd = m.svd(true, true);
    let (u, v_t) = (svd.u?, svd.v_t?);
    // Guard against reflections.
    let mut d = Matrix3::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let rotation = u * d * v_t;

    let scale = if fix_scale {
        1.0
    } else {
        let mut projected = 0.0;
        for (current, loop_point) in pairs {
            let c = current - centroid_current;
            let l = loop_point - centroid_loop;
            projected += c.dot(&(rotation * l));
        }
        projected / loop_spread
    };
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }

    let translation = centroid_current - scale * (rotation * centroid_loop);
    Some(Sim3::from_rts(rotation, translation, scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn cloud() -> Vec<Vector3<f64>> {
        (0..30)
            .map(|i| {
                Vector3::new(
                    (i % 5) as f64 * 0.3,
                    (i % 7) as f64 * 0.2 - 0.5,
                    2.0 + (i % 3) as f64 * 0.4,
                )
            })
            .collect()
    }

    fn transformed_pairs(truth: &Sim3) -> Vec<PointPair> {
        cloud()
            .into_iter()
            .map(|p| (truth.transform_point(&p), p))
            .collect()
    }

    #[test]
    fn test_recovers_known_transform() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.1, -0.05, 0.2),
            translation: Vector3::new(0.4, -0.2, 0.1),
            scale: 1.3,
        };
        let pairs = transformed_pairs(&truth);

        let estimate = solve_sim3(&pairs, 20, &Sim3SolverConfig::default()).unwrap();
        assert_eq!(estimate.inliers.len(), pairs.len());
        assert_relative_eq!(estimate.transform.scale, truth.scale, epsilon = 1e-6);
        assert_relative_eq!(
            estimate.transform.translation,
            truth.translation,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_tolerates_outliers() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.0, 0.1, 0.0),
            translation: Vector3::new(0.2, 0.0, -0.1),
            scale: 1.0,
        };
        let mut pairs = transformed_pairs(&truth);
        // Corrupt a quarter of the matches.
        for i in 0..pairs.len() / 4 {
            pairs[i].0 += Vector3::new(3.0, -2.0, 5.0);
        }

        let estimate = solve_sim3(&pairs, 20, &Sim3SolverConfig::default()).unwrap();
        assert!(estimate.inliers.len() >= 22);
        assert_relative_eq!(
            estimate.transform.translation,
            truth.translation,
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_rejects_insufficient_support() {
        let truth = Sim3::identity();
        let mut pairs = transformed_pairs(&truth);
        // Corrupt almost everything.
        for pair in pairs.iter_mut().skip(5) {
            pair.0 += Vector3::new(10.0, 10.0, 10.0);
        }
        assert!(solve_sim3(&pairs, 20, &Sim3SolverConfig::default()).is_none());
    }

    #[test]
    fn test_fixed_scale() {
        let truth = Sim3 {
            translation: Vector3::new(0.1, 0.2, 0.3),
            ..Sim3::identity()
        };
        let pairs = transformed_pairs(&truth);
        let config = Sim3SolverConfig {
            fix_scale: true,
            ..Sim3SolverConfig::default()
        };
        let estimate = solve_sim3(&pairs, 20, &config).unwrap();
        assert_relative_eq!(estimate.transform.scale, 1.0, epsilon = 1e-12);
    }
}
