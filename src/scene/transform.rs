//! Transform components

use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

/// Transform component for positioning actors in 3D space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn from_position_rotation(position: Vec3, rotation: Quat) -> Self {
        Self {
            position,
            rotation,
            ..Default::default()
        }
    }

    pub fn from_position_scale(position: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            scale,
            ..Default::default()
        }
    }

    /// Transform at `position` whose forward axis points along `direction`
    pub fn looking_to(position: Vec3, direction: Vec3, up: Vec3) -> Self {
        let mut transform = Self::from_position(position);
        transform.look_to(direction, up);
        transform
    }

    /// World matrix
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Forward direction (local -Z in world space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    /// Right direction (local +X in world space)
    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    /// Up direction (local +Y in world space)
    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    /// Rotate around an axis
    pub fn rotate_axis(&mut self, axis: Vec3, angle: f32) {
        let delta = Quat::from_axis_angle(axis, angle);
        self.rotation = delta * self.rotation;
    }

    /// Point the forward axis along `direction`
    pub fn look_to(&mut self, direction: Vec3, up: Vec3) {
        let forward = direction.normalize();
        let mut right = forward.cross(up);
        if right.length_squared() < 1e-8 {
            right = forward.any_orthonormal_vector();
        }
        let right = right.normalize();
        let up = right.cross(forward);
        self.rotation = Quat::from_mat3(&glam::Mat3::from_cols(right, up, -forward));
    }

    /// Sign of the world matrix determinant, negative for mirrored transforms
    pub fn determinant_sign(&self) -> f32 {
        if self.scale.x * self.scale.y * self.scale.z < 0.0 {
            -1.0
        } else {
            1.0
        }
    }
}

/// World matrix of the previous frame, drives per-object motion vectors
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct PrevTransform(pub Mat4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_to_sets_forward() {
        let direction = Vec3::new(1.0, -1.0, 0.5).normalize();
        let transform = Transform::looking_to(Vec3::ZERO, direction, Vec3::Y);
        assert!((transform.forward() - direction).length() < 1e-5);
        assert!(transform.right().dot(Vec3::Y).abs() < 1e-5);
    }

    #[test]
    fn test_look_straight_down() {
        let transform = Transform::looking_to(Vec3::ZERO, Vec3::NEG_Y, Vec3::Y);
        assert!((transform.forward() - Vec3::NEG_Y).length() < 1e-5);
    }

    #[test]
    fn test_mirrored_determinant() {
        let transform = Transform::from_position_scale(Vec3::ZERO, Vec3::new(-1.0, 1.0, 1.0));
        assert_eq!(transform.determinant_sign(), -1.0);
    }
}
