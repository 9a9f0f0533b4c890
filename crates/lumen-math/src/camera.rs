// SPDX-License-Identifier: CEPL-1.0
use glam::{Mat4, Vec3};

use crate::CameraBlock;

const SHADOW_HALF_EXTENT: f32 = 25.0;
const SHADOW_DEPTH: f32 = 100.0;

/// Eye position on a sphere around `target` (yaw around +Y, pitch from the horizon).
pub fn orbit_eye(target: Vec3, radius: f32, yaw: f32, pitch: f32) -> Vec3 {
    let pitch = pitch.clamp(-1.55, 1.55);
    target
        + Vec3::new(
            radius * pitch.cos() * yaw.sin(),
            radius * pitch.sin(),
            radius * pitch.cos() * yaw.cos(),
        )
}

/// Orthographic light-space matrix for a directional light aimed at the origin.
pub fn shadow_view_proj(light_dir: Vec3) -> Mat4 {
    let dir = light_dir.normalize_or_zero();
    if dir == Vec3::ZERO {
        return Mat4::IDENTITY;
    }
    let up = if dir.abs_diff_eq(Vec3::Y, 1e-3) || dir.abs_diff_eq(Vec3::NEG_Y, 1e-3) {
        Vec3::Z
    } else {
        Vec3::Y
    };
    let eye = -dir * (SHADOW_DEPTH * 0.5);
    let view = Mat4::look_at_rh(eye, Vec3::ZERO, up);
    let proj = Mat4::orthographic_rh(
        -SHADOW_HALF_EXTENT,
        SHADOW_HALF_EXTENT,
        -SHADOW_HALF_EXTENT,
        SHADOW_HALF_EXTENT,
        0.0,
        SHADOW_DEPTH,
    );
    proj * view
}

/// Perspective camera orbiting a target point.
#[derive(Clone, Copy, Debug)]
pub struct OrbitCamera {
    pub target: Vec3,
    pub radius: f32,
    pub yaw: f32,
    pub pitch: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for OrbitCamera {
    fn default() -> Self {
        Self {
            target: Vec3::ZERO,
            radius: 6.0,
            yaw: 0.0,
            pitch: 0.45,
            fov_y: 60f32.to_radians(),
            near: 0.05,
            far: 500.0,
        }
    }
}

impl OrbitCamera {
    pub fn eye(&self) -> Vec3 {
        orbit_eye(self.target, self.radius, self.yaw, self.pitch)
    }

    /// Depth range is 0..1; the renderer flips Y through a negative-height viewport.
    pub fn proj(&self, width: u32, height: u32) -> Mat4 {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        Mat4::perspective_rh(self.fov_y, aspect, self.near, self.far)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye(), self.target, Vec3::Y)
    }

    pub fn block(&self, width: u32, height: u32, light_dir: Vec3) -> CameraBlock {
        CameraBlock::new(self.proj(width, height), self.view(), self.eye(), light_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orbit_eye_keeps_radius() {
        let eye = orbit_eye(Vec3::new(1.0, 0.0, 0.0), 4.0, 0.7, 0.3);
        assert!((eye.distance(Vec3::new(1.0, 0.0, 0.0)) - 4.0).abs() < 1e-4);
    }

    #[test]
    fn orbit_pitch_is_clamped_short_of_the_pole() {
        let eye = orbit_eye(Vec3::ZERO, 1.0, 0.0, 10.0);
        assert!(eye.y < 1.0);
        assert!(eye.y > 0.99);
    }

    #[test]
    fn shadow_matrix_handles_vertical_light() {
        let m = shadow_view_proj(Vec3::NEG_Y);
        assert!(m.is_finite());
        let origin = m.project_point3(Vec3::ZERO);
        assert!(origin.x.abs() < 1e-4 && origin.y.abs() < 1e-4);
    }

    #[test]
    fn zero_light_direction_yields_identity() {
        assert_eq!(shadow_view_proj(Vec3::ZERO), Mat4::IDENTITY);
    }

    #[test]
    fn projection_survives_zero_height() {
        let cam = OrbitCamera::default();
        assert!(cam.proj(800, 0).is_finite());
    }
}
