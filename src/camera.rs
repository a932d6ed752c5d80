//! Camera Module
//!
//! Free-flying camera state and the constant-buffer payload the compute
//! shader reads.

use bytemuck::{Pod, Zeroable};
use glam::{Quat, Vec3};

/// Layout of the camera constant buffer (`b0`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct CameraBuffer {
    pub position: [f32; 3],
    pub znear: f32,
    pub forward: [f32; 3],
    pub zfar: f32,
    pub right: [f32; 3],
    pub fov: f32,
}

/// Free-flying camera.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub forward: Vec3,
    pub right: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect_ratio: f32,
    pub znear: f32,
    pub zfar: f32,
    /// Distance covered by one movement step.
    pub speed: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(
            Vec3::new(0.0, 0.0, -5.0),
            Vec3::Z,
            Vec3::Y,
            60f32.to_radians(),
            1.0,
            0.1,
            1000.0,
        )
    }
}

impl Camera {
    /// Build an orthonormal basis from a view direction and an approximate
    /// up vector (left-handed: right = up x forward).
    pub fn new(position: Vec3, direction: Vec3, up: Vec3, fov: f32, aspect_ratio: f32, znear: f32, zfar: f32) -> Self {
        let forward = direction.normalize();
        let right = up.cross(forward).normalize();
        let up = forward.cross(right).normalize();
        Self {
            position,
            forward,
            right,
            up,
            fov,
            aspect_ratio,
            znear,
            zfar,
            speed: 0.05,
        }
    }

    /// Rotate the basis by `angle` radians around `axis`.
    pub fn rotate(&mut self, axis: Vec3, angle: f32) {
        let rotation = Quat::from_axis_angle(axis.normalize(), angle);
        self.forward = rotation * self.forward;
        self.right = rotation * self.right;
        self.up = rotation * self.up;
    }

    /// Step `speed` units along `direction`.
    pub fn step(&mut self, direction: Vec3) {
        self.position += direction * self.speed;
    }

    pub fn set_aspect_ratio(&mut self, width: u32, height: u32) {
        self.aspect_ratio = width.max(1) as f32 / height.max(1) as f32;
    }

    pub fn buffer(&self) -> CameraBuffer {
        CameraBuffer {
            position: self.position.to_array(),
            znear: self.znear,
            forward: self.forward.to_array(),
            zfar: self.zfar,
            right: self.right.to_array(),
            fov: self.fov,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-5
    }

    #[test]
    fn test_basis_is_left_handed() {
        let camera = Camera::default();
        assert!(close(camera.forward, Vec3::Z));
        assert!(close(camera.right, Vec3::X));
        assert!(close(camera.up, Vec3::Y));
    }

    #[test]
    fn test_yaw_keeps_basis_orthonormal() {
        let mut camera = Camera::default();
        camera.rotate(Vec3::Y, std::f32::consts::FRAC_PI_2);
        assert!(close(camera.forward, Vec3::X));
        assert!(close(camera.right, -Vec3::Z));
        assert!(camera.forward.dot(camera.right).abs() < 1e-5);
        assert!((camera.up.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_step_scales_by_speed() {
        let mut camera = Camera::default();
        let start = camera.position;
        camera.step(camera.forward);
        assert!(close(camera.position, start + Vec3::Z * 0.05));
    }

    #[test]
    fn test_buffer_layout() {
        assert_eq!(std::mem::size_of::<CameraBuffer>(), 48);
        let camera = Camera::default();
        let buffer = camera.buffer();
        assert_eq!(buffer.position, [0.0, 0.0, -5.0]);
        assert_eq!(buffer.znear, 0.1);
        assert_eq!(buffer.zfar, 1000.0);
    }
}
