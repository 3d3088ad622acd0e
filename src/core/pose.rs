//! SE3 pose representation using glam
//!
//! Rigid 3D transforms as quaternion + translation. All internal
//! operations use f32 with glam; the tracker accumulates its normal
//! equations in f64 and converts the solved tangent back here.

use glam::{EulerRot, Mat3, Mat4, Quat, Vec3};

/// SE3 pose: rotation + translation
///
/// The convention throughout the crate is `T_a_b`: a pose transforms
/// points expressed in frame `b` into frame `a`, so a camera pose is
/// `T_world_camera` and `pose.transform(p_cam)` lands in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SE3 {
    rotation: Quat,
    translation: Vec3,
}

impl SE3 {
    /// Create a new SE3 from quaternion and translation
    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// Create identity pose
    pub fn identity() -> Self {
        Self {
            rotation: Quat::IDENTITY,
            translation: Vec3::ZERO,
        }
    }

    /// Create a pure translation
    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            rotation: Quat::IDENTITY,
            translation,
        }
    }

    /// Create from a rotation matrix and translation
    pub fn from_rotation_translation(rotation: Mat3, translation: Vec3) -> Self {
        Self {
            rotation: Quat::from_mat3(&rotation).normalize(),
            translation,
        }
    }

    /// Create from a homogeneous 4x4 matrix (assumed rigid)
    pub fn from_mat4(m: &Mat4) -> Self {
        let (_, rotation, translation) = m.to_scale_rotation_translation();
        Self {
            rotation: rotation.normalize(),
            translation,
        }
    }

    /// Convert to a homogeneous 4x4 matrix
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.translation)
    }

    /// Compose two poses: self * other
    pub fn compose(&self, other: &SE3) -> SE3 {
        SE3 {
            rotation: (self.rotation * other.rotation).normalize(),
            translation: self.translation + self.rotation * other.translation,
        }
    }

    /// Inverse of the pose
    pub fn inverse(&self) -> SE3 {
        let rotation = self.rotation.inverse();
        SE3 {
            rotation,
            translation: -(rotation * self.translation),
        }
    }

    /// Transform a 3D point
    pub fn transform(&self, point: Vec3) -> Vec3 {
        self.rotation * point + self.translation
    }

    /// Rotate a 3D direction (no translation)
    pub fn rotate(&self, dir: Vec3) -> Vec3 {
        self.rotation * dir
    }

    /// Rotation as quaternion
    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    /// Rotation as a 3x3 matrix
    pub fn rotation_matrix(&self) -> Mat3 {
        Mat3::from_quat(self.rotation)
    }

    /// Translation vector
    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    /// Sines of the intrinsic XYZ Euler angles, used by the sparse
    /// pose sanity gate.
    pub fn euler_sines(&self) -> Vec3 {
        let (ax, ay, az) = self.rotation.to_euler(EulerRot::XYZ);
        Vec3::new(ax.sin(), ay.sin(), az.sin())
    }

    /// Exponential map from the tangent space.
    /// `tangent = [omega_x, omega_y, omega_z, v_x, v_y, v_z]`
    pub fn exp(tangent: &[f32; 6]) -> Self {
        let omega = Vec3::new(tangent[0], tangent[1], tangent[2]);
        let v = Vec3::new(tangent[3], tangent[4], tangent[5]);

        let angle = omega.length();
        let axis = if angle > 1e-10 { omega / angle } else { omega };
        let rotation = Quat::from_axis_angle(axis, angle);

        // V * v with V = I + (1-cos)/θ² [ω]ₓ + (θ-sin)/θ³ [ω]ₓ²
        let translation = if angle < 1e-10 {
            v
        } else {
            let c1 = (1.0 - angle.cos()) / (angle * angle);
            let c2 = (angle - angle.sin()) / (angle * angle * angle);
            let hat = skew(omega);
            v + c1 * (hat * v) + c2 * (hat * (hat * v))
        };

        SE3 {
            rotation,
            translation,
        }
    }

    /// Log map: group element to tangent space
    pub fn log(&self) -> [f32; 6] {
        let (axis, angle) = self.rotation.to_axis_angle();
        let omega = axis * angle;

        let t = self.translation;
        let v = if angle < 1e-10 {
            t
        } else {
            let c1 = (1.0 - angle.cos()) / (angle * angle);
            let c2 = (angle - angle.sin()) / (angle * angle * angle);
            let hat = skew(omega);
            t - c1 * (hat * t) + c2 * (hat * (hat * t))
        };

        [omega.x, omega.y, omega.z, v.x, v.y, v.z]
    }
}

impl Default for SE3 {
    fn default() -> Self {
        Self::identity()
    }
}

fn skew(w: Vec3) -> Mat3 {
    Mat3::from_cols(
        Vec3::new(0.0, w.z, -w.y),
        Vec3::new(-w.z, 0.0, w.x),
        Vec3::new(w.y, -w.x, 0.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        let pose = SE3::identity();
        let p = Vec3::new(1.0, 2.0, 3.0);
        assert!((pose.transform(p) - p).length() < 1e-6);
    }

    #[test]
    fn test_compose_inverse() {
        let a = SE3::new(
            Quat::from_axis_angle(Vec3::Y, 0.3),
            Vec3::new(0.5, -0.2, 1.0),
        );
        let composed = a.compose(&a.inverse());
        assert!(composed.translation().length() < 1e-5);
        assert!((composed.rotation().w.abs() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_transform_roundtrip() {
        let pose = SE3::new(
            Quat::from_axis_angle(Vec3::Z, 0.7),
            Vec3::new(1.0, 0.0, -0.5),
        );
        let p = Vec3::new(0.3, 0.4, 2.0);
        let back = pose.inverse().transform(pose.transform(p));
        assert!((back - p).length() < 1e-5);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let tangent = [0.1, 0.2, 0.3, 1.0, 2.0, 3.0];
        let pose = SE3::exp(&tangent);
        let log = pose.log();
        for i in 0..6 {
            assert!((tangent[i] - log[i]).abs() < 1e-4);
        }
    }

    #[test]
    fn test_exp_small_angle() {
        let pose = SE3::exp(&[0.0, 0.0, 0.0, 0.1, 0.0, 0.0]);
        assert!((pose.translation() - Vec3::new(0.1, 0.0, 0.0)).length() < 1e-6);
    }
}
