//! SE3: 6-DOF rigid transformation (rotation + translation).
//!
//! Keyframe poses are stored as `Tcw` (world-to-camera): a point in world
//! coordinates maps into the camera frame as `p_cam = R * p_world + t`.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// Rigid transformation: rotation + translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// Identity transformation.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    /// Construct from a rotation quaternion and translation vector.
    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Construct from a rotation matrix and translation vector.
    pub fn from_rt(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
        }
    }

    /// Construct from a homogeneous 4x4 matrix of form [R | t; 0 | 1].
    pub fn from_matrix(mat: &Matrix4<f64>) -> Self {
        let r = mat.fixed_view::<3, 3>(0, 0).into_owned();
        let t = Vector3::new(mat[(0, 3)], mat[(1, 3)], mat[(2, 3)]);
        Self::from_rt(r, t)
    }

    /// Convert to a homogeneous 4x4 matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut mat = Matrix4::identity();
        mat.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&self.rotation.to_rotation_matrix().into_inner());
        mat.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        mat
    }

    /// Inverse transformation: T^{-1} = [R^T | -R^T t].
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        Self {
            rotation: rot_inv,
            translation: -(rot_inv * self.translation),
        }
    }

    /// Compose two transforms: self ∘ other.
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Transform a point: p' = R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p + self.translation
    }

    /// Rotation as a 3x3 matrix.
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Camera centre in world coordinates for a `Tcw` pose: Ow = -R^T t.
    pub fn camera_center(&self) -> Vector3<f64> {
        -(self.rotation.inverse() * self.translation)
    }

    /// Log map: [rotation_vec (3), translation (3)].
    pub fn log(&self) -> [f64; 6] {
        let rot_vec = self.rotation.scaled_axis();
        [
            rot_vec.x,
            rot_vec.y,
            rot_vec.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ]
    }

    /// Exponential map from a 6-element tangent vector.
    pub fn exp(tangent: &[f64; 6]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(
                tangent[0], tangent[1], tangent[2],
            )),
            translation: Vector3::new(tangent[3], tangent[4], tangent[5]),
        }
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity_transform() {
        let p = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(SE3::identity().transform_point(&p), p, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = SE3::new(
            UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.3, -1.0, 0.5)),
                0.7,
            ),
            Vector3::new(1.0, -2.0, 0.5),
        );
        let p = Vector3::new(4.0, 5.0, 6.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_matrix_roundtrip() {
        let t = SE3::new(
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
            Vector3::new(-1.0, 2.0, 3.0),
        );
        let rebuilt = SE3::from_matrix(&t.to_matrix());
        assert_relative_eq!(rebuilt.translation, t.translation, epsilon = 1e-10);
        assert_relative_eq!(rebuilt.rotation.coords, t.rotation.coords, epsilon = 1e-10);
    }

    #[test]
    fn test_camera_center() {
        // Tcw with identity rotation and t = (0,0,-5) puts the camera at (0,0,5).
        let tcw = SE3::new(UnitQuaternion::identity(), Vector3::new(0.0, 0.0, -5.0));
        assert_relative_eq!(
            tcw.camera_center(),
            Vector3::new(0.0, 0.0, 5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_compose_matches_chained_transforms() {
        let a = SE3::new(
            UnitQuaternion::from_euler_angles(0.0, 0.4, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let b = SE3::new(
            UnitQuaternion::from_euler_angles(0.2, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let p = Vector3::new(0.5, 0.5, 2.0);
        let via_compose = a.compose(&b).transform_point(&p);
        let via_chain = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(via_compose, via_chain, epsilon = 1e-12);
    }
}
