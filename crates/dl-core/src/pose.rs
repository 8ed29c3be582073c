use std::ops::Mul;

use serde::{Deserialize, Serialize};

use crate::constants::EPSILON;
use crate::quaternion::Quaternion;
use crate::vector::Vec3;

/// Rigid transform: rotation followed by translation.
///
/// Poses compose right-to-left, `a * b` applies `b` first. Naming follows
/// the `target_from_source` convention throughout the crate, so
/// `pinned_from_locked * locked_from_spongy` gives `pinned_from_spongy`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quaternion,
}

impl Pose {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quaternion::identity(),
    };

    pub fn new(position: Vec3, rotation: Quaternion) -> Self {
        Self { position, rotation }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self::new(position, Quaternion::identity())
    }

    pub fn inverse(self) -> Self {
        let inv = self.rotation.inverse();
        Self {
            position: -inv.rotate(self.position),
            rotation: inv,
        }
    }

    pub fn transform_point(self, p: Vec3) -> Vec3 {
        self.rotation.rotate(p) + self.position
    }

    /// Lerp position, SLERP rotation.
    pub fn interpolate(self, other: Self, t: f64) -> Self {
        Self {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(other.rotation, t),
        }
    }

    pub fn is_finite(self) -> bool {
        self.position.is_finite() && self.rotation.is_finite()
    }

    /// Within `tol` in position and rotation angle.
    pub fn approx_eq(self, other: Self, tol: f64) -> bool {
        self.position.distance(other.position) <= tol
            && self.rotation.angular_distance(other.rotation) <= tol
    }

    /// Exact component-wise equality, no tolerance.
    pub fn bitwise_eq(self, other: Self) -> bool {
        self.to_array() == other.to_array()
    }

    /// `[px, py, pz, qx, qy, qz, qw]`
    pub fn to_array(self) -> [f64; 7] {
        let p = self.position;
        let q = self.rotation.to_xyzw();
        [p.x, p.y, p.z, q[0], q[1], q[2], q[3]]
    }

    pub fn from_array(arr: [f64; 7]) -> Self {
        Self {
            position: Vec3::new(arr[0], arr[1], arr[2]),
            rotation: Quaternion::from_xyzw([arr[3], arr[4], arr[5], arr[6]]),
        }
    }
}

impl Mul for Pose {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            position: self.transform_point(rhs.position),
            rotation: (self.rotation * rhs.rotation).normalize(),
        }
    }
}

/// A pose carrying a blend weight.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedPose {
    pub pose: Pose,
    pub weight: f64,
}

impl WeightedPose {
    pub fn new(pose: Pose, weight: f64) -> Self {
        Self { pose, weight }
    }

    /// Merge two weighted poses into one carrying the summed weight.
    ///
    /// Interpolates at `t = b / (a + b)`; when both weights vanish the left
    /// operand wins. Folding a list left to right with this is the blend.
    pub fn combine(self, other: Self) -> Self {
        let total = self.weight + other.weight;
        if total.abs() < EPSILON {
            return Self::new(self.pose, total);
        }
        let t = other.weight / total;
        Self::new(self.pose.interpolate(other.pose, t), total)
    }
}
